use std::path::{Component, Path, PathBuf};

use anyhow::bail;
use serde::{Deserialize, Serialize};

use crate::util;

/// What the daemon does when it sees a help invocation for an executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Policy {
    /// Absence of a decision; never user-declared.
    #[default]
    #[serde(rename = "")]
    Unknown,
    #[serde(rename = "ask")]
    Ask,
    #[serde(rename = "trust")]
    Trust,
    #[serde(rename = "ignore")]
    Ignore,
}

impl Policy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Policy::Unknown => "",
            Policy::Ask => "ask",
            Policy::Trust => "trust",
            Policy::Ignore => "ignore",
        }
    }

    pub fn from_str_lossy(s: &str) -> Policy {
        match s {
            "ask" => Policy::Ask,
            "trust" => Policy::Trust,
            "ignore" => Policy::Ignore,
            _ => Policy::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddHelpPageStatus {
    #[serde(rename = "new")]
    New,
    #[serde(rename = "updated")]
    Updated,
}

/// A concrete invocation that produced (or will produce) help output.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Command {
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub dir: String,
}

/// Sub-command path plus optional framework tag under which a completion
/// applies. The empty context is the top-level invocation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FlagContext {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sub_command: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,
}

impl FlagContext {
    pub fn is_empty(&self) -> bool {
        self.sub_command.is_empty() && self.framework.is_none()
    }
}

/// A single flag or sub-command word the shell may offer.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Completion {
    pub flag: String,
    #[serde(default, skip_serializing_if = "FlagContext::is_empty")]
    pub context: FlagContext,
}

impl Completion {
    pub fn flag(flag: impl Into<String>) -> Completion {
        Completion {
            flag: flag.into(),
            context: FlagContext::default(),
        }
    }
}

/// Parsed result of one help invocation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HelpPage {
    pub executable_path: String,
    pub completions: Vec<Completion>,
    pub check_sum: String,
    #[serde(default)]
    pub command: Command,
}

pub fn check_executable_path(executable_path: &str) -> anyhow::Result<()> {
    if executable_path.is_empty() {
        bail!("executable path cannot be empty");
    }
    let path = Path::new(executable_path);
    if !path.is_absolute() {
        bail!("executable path cannot be relative: {executable_path:?}");
    }
    let cleaned = clean_path(executable_path);
    if cleaned != executable_path {
        bail!("executable path is not of canonical form: {executable_path:?}");
    }
    Ok(())
}

pub fn check_help_page(page: &HelpPage) -> anyhow::Result<()> {
    check_executable_path(&page.executable_path)
}

/// Lexical path cleanup: collapse `//` and `.`, resolve `..` where possible.
/// Mirrors what the shell resolver produces so I1 holds for stored pages.
pub fn clean_path(path: &str) -> String {
    let p = Path::new(path);
    let mut parts: Vec<String> = Vec::new();
    let mut absolute = false;
    for comp in p.components() {
        match comp {
            Component::RootDir => absolute = true,
            Component::CurDir => {}
            Component::ParentDir => {
                if let Some(last) = parts.last() {
                    if last != ".." {
                        parts.pop();
                        continue;
                    }
                }
                if !absolute {
                    parts.push("..".to_string());
                }
            }
            Component::Normal(s) => parts.push(s.to_string_lossy().into_owned()),
            Component::Prefix(_) => {}
        }
    }
    let joined = parts.join("/");
    match (absolute, joined.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => format!("/{joined}"),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

pub fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Turn whatever the user typed into the canonical absolute executable path:
/// bare names go through PATH, `~/` expands against the home directory,
/// relative paths resolve against the working directory.
pub fn canonize_executable_path(
    name: &str,
    work_dir: &str,
    path_var: &str,
    home_dir: &str,
) -> anyhow::Result<String> {
    if name.is_empty() {
        bail!("executable path cannot be empty");
    }
    if !home_dir.is_empty() && !Path::new(home_dir).is_absolute() {
        bail!("home directory must be absolute: {home_dir:?}");
    }
    if !Path::new(work_dir).is_absolute() {
        bail!("directory must be absolute: {work_dir:?}");
    }

    let canonized: PathBuf = if !name.contains('/') {
        util::find_executable(name, work_dir, path_var)?
    } else if Path::new(name).is_absolute() {
        PathBuf::from(name)
    } else if let Some(rest) = name.strip_prefix("~/") {
        if home_dir.is_empty() {
            bail!("cannot expand ~: home directory is not specified");
        }
        Path::new(home_dir).join(rest)
    } else {
        Path::new(work_dir).join(name)
    };

    Ok(clean_path(&canonized.to_string_lossy()))
}
