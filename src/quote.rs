/// Quote argv for safe pasting into a shell.
pub fn quote(args: &[String]) -> String {
    args.iter()
        .map(|a| quote_arg(a))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Deterministic quoter: pass safe args through, wrap args holding a single
/// quote in double-quotes with per-byte escaping, wrap everything else in
/// single quotes.
pub fn quote_arg(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }

    let mut need_quoting = false;
    let mut has_single_quote = false;
    for &c in arg.as_bytes() {
        if c == b'\'' {
            need_quoting = true;
            has_single_quote = true;
        } else if needs_quoting(c) {
            need_quoting = true;
        }
    }

    if !need_quoting {
        return arg.to_string();
    }

    if has_single_quote {
        // Inside double quotes only these four stay shell-special; escaping
        // anything else would put a literal backslash into the decoded word.
        let mut out = String::with_capacity(arg.len() + 2);
        out.push('"');
        for c in arg.chars() {
            if matches!(c, '$' | '`' | '"' | '\\') {
                out.push('\\');
            }
            out.push(c);
        }
        out.push('"');
        out
    } else {
        format!("'{arg}'")
    }
}

fn needs_quoting(c: u8) -> bool {
    matches!(
        c,
        b'\'' | b'|'
            | b'&'
            | b';'
            | b'<'
            | b'>'
            | b'('
            | b')'
            | b'$'
            | b'`'
            | b'\\'
            | b'"'
            | b' '
            | b'\t'
            | b'\n'
            | b'*'
            | b'?'
            | b'['
            | b']'
            | b'#'
            | b'~'
            | b'='
            | b'%'
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_args_pass_through() {
        assert_eq!(quote_arg("prog"), "prog");
        assert_eq!(quote_arg("--help"), "--help");
        assert_eq!(quote_arg("/usr/bin/cat"), "/usr/bin/cat");
    }

    #[test]
    fn test_unsafe_args_single_quoted() {
        assert_eq!(quote_arg("a b"), "'a b'");
        assert_eq!(quote_arg("$HOME"), "'$HOME'");
        assert_eq!(quote_arg("x=y"), "'x=y'");
        assert_eq!(quote_arg("glob*"), "'glob*'");
    }

    #[test]
    fn test_single_quote_forces_double_quoting() {
        assert_eq!(quote_arg("it's"), r#""it's""#);
        assert_eq!(quote_arg("a'b $c"), r#""a'b \$c""#);
    }

    #[test]
    fn test_empty_arg() {
        assert_eq!(quote_arg(""), "''");
    }

    #[test]
    fn test_quote_joins_with_spaces() {
        let args: Vec<String> = vec!["prog".into(), "a b".into(), "--help".into()];
        assert_eq!(quote(&args), "prog 'a b' --help");
    }
}
