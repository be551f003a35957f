use anyhow::bail;

use crate::data;

/// Compiled executable pattern from user rules and `list`/`remove` arguments.
///
/// After `~/` expansion a pattern is one of: a bare name (matches on
/// basename), `dir/*` (direct children), `dir/**` (whole subtree), or an
/// exact path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    BaseName(String),
    Exact(String),
    /// Directory prefix including the trailing slash; matches one level.
    Dir(String),
    /// Path prefix; matches the whole subtree.
    Prefix(String),
}

/// Split into (dir-with-trailing-slash, last component).
fn split_path(s: &str) -> (&str, &str) {
    match s.rfind('/') {
        Some(idx) => (&s[..idx + 1], &s[idx + 1..]),
        None => ("", s),
    }
}

pub fn compile_selector(pattern: &str, home_dir: &str) -> anyhow::Result<Selector> {
    let expanded;
    let pattern = if let Some(rest) = pattern.strip_prefix("~/") {
        if home_dir.is_empty() {
            bail!("cannot expand {pattern:?}: home directory is unknown");
        }
        expanded = format!("{}/{rest}", home_dir.trim_end_matches('/'));
        expanded.as_str()
    } else {
        pattern
    };

    let (dir, name) = split_path(pattern);

    let check_no_star = |s: &str| -> anyhow::Result<()> {
        if s.contains('*') {
            bail!("bad pattern: '*' and '**' are supported only as the last component");
        }
        Ok(())
    };

    match name {
        "*" => {
            check_no_star(dir)?;
            Ok(Selector::Dir(dir.to_string()))
        }
        "**" => {
            check_no_star(dir)?;
            Ok(Selector::Prefix(dir.to_string()))
        }
        _ if pattern.contains('/') => {
            check_no_star(pattern)?;
            Ok(Selector::Exact(pattern.to_string()))
        }
        _ => {
            check_no_star(pattern)?;
            Ok(Selector::BaseName(pattern.to_string()))
        }
    }
}

impl Selector {
    pub fn matches(&self, s: &str) -> bool {
        match self {
            Selector::BaseName(name) => data::base_name(s) == name,
            Selector::Exact(path) => s == path,
            Selector::Dir(dir) => split_path(s).0 == dir,
            Selector::Prefix(prefix) => s.starts_with(prefix),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(s: &str, pattern: &str) -> bool {
        compile_selector(pattern, "/home/user").unwrap().matches(s)
    }

    #[test]
    fn test_exact() {
        assert!(matches("/foo/bar", "/foo/bar"));
        assert!(!matches("/foo/bar/baz", "/foo/bar"));
    }

    #[test]
    fn test_one_level_star() {
        assert!(matches("/foo/bar/baz", "/foo/bar/*"));
        assert!(matches("/foo/bar/qux", "/foo/bar/*"));
        assert!(!matches("/foo/bar", "/foo/bar/*"));
        assert!(!matches("/foo/bar/qux/baz", "/foo/bar/*"));
        assert!(!matches("/foo/barbaz", "/foo/bar/*"));
        assert!(!matches("/foo/barbaz/qux", "/foo/bar/*"));
    }

    #[test]
    fn test_subtree_star_star() {
        assert!(matches("/foo/bar/baz", "/foo/bar/**"));
        assert!(matches("/foo/bar/qux/baz", "/foo/bar/**"));
        assert!(!matches("/foo/bar", "/foo/bar/**"));
        assert!(!matches("/foo/barbaz", "/foo/bar/**"));
    }

    #[test]
    fn test_bare_star_star_matches_everything() {
        assert!(matches("/foo/bar/baz", "**"));
        assert!(matches("/baz", "**"));
    }

    #[test]
    fn test_base_name() {
        assert!(matches("/usr/bin/cat", "cat"));
        assert!(matches("/opt/tools/cat", "cat"));
        assert!(!matches("/usr/bin/cata", "cat"));
    }

    #[test]
    fn test_tilde_expansion() {
        assert!(matches("/home/user/my/repo/bin/scripts", "~/my/repo/**"));
        assert!(!matches("/my/repo/script", "~/my/repo/**"));
        assert!(compile_selector("~/x", "").is_err());
    }

    #[test]
    fn test_star_only_last_component() {
        assert!(compile_selector("/foo/*/bar", "").is_err());
        assert!(compile_selector("/foo/**/bar", "").is_err());
    }
}
