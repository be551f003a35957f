use std::io::BufRead;

use anyhow::bail;

use crate::data::base_name;
use crate::quote::quote_arg;
use crate::tokenize::tokenize;

/// Per-dialect emitter for the scripts the daemon streams to attached
/// shells. The hook names (`__cod_complete_<shell>`, `__cod_add_completions`,
/// `__cod_clear_completions`, `__cod_postexec_<shell>`) are a stable surface;
/// external shell code refers to them.
#[derive(Debug, Clone)]
pub struct ScriptGenerator {
    shell: Shell,
    binary_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shell {
    Bash,
    Zsh,
    Fish,
}

impl ScriptGenerator {
    /// `binary_path` is the resolved cod binary captured at attach time; the
    /// emitted scripts call it by absolute path.
    pub fn new(shell: &str, binary_path: &str) -> anyhow::Result<ScriptGenerator> {
        let shell = match shell {
            "bash" => Shell::Bash,
            "zsh" => Shell::Zsh,
            "fish" => Shell::Fish,
            other => bail!("unknown shell: {other}"),
        };
        Ok(ScriptGenerator {
            shell,
            binary_path: binary_path.to_string(),
        })
    }

    /// Block emitted once at shell init: completion function, postexec hook,
    /// attach call.
    pub fn preamble(&self) -> Vec<String> {
        let template = match self.shell {
            Shell::Bash => include_str!("../shell/cod.bash"),
            Shell::Zsh => include_str!("../shell/cod.zsh"),
            Shell::Fish => include_str!("../shell/cod.fish"),
        };
        vec![template.replace("__COD_BIN__", &quote_arg(&self.binary_path))]
    }

    /// Lines installing the completion function on `basename(executable)`.
    pub fn generate_completions(&self, executable_path: &str) -> Vec<String> {
        vec![format!(
            "__cod_add_completions {}",
            quote_arg(base_name(executable_path))
        )]
    }

    /// Lines uninstalling it.
    pub fn reset_command(&self, executable_path: &str) -> Vec<String> {
        vec![format!(
            "__cod_clear_completions {}",
            quote_arg(base_name(executable_path))
        )]
    }
}

/// Filter for `complete -p` output: prints `complete -r <name>` plus the
/// foreign completion lines to re-install, for every command with the given
/// basename whose completion routes through cod. Unparseable lines are left
/// alone, which errs on the side of keeping the user's completions.
pub fn bash_remove_completions(
    app_base: &str,
    reader: impl BufRead,
) -> anyhow::Result<Vec<String>> {
    let mut commands_to_keep: std::collections::BTreeMap<String, Vec<String>> = Default::default();
    let mut commands_to_remove: std::collections::BTreeSet<String> = Default::default();

    for line in reader.lines() {
        let line = line?;
        let tokens = tokenize(&line);
        if tokens.first().map(|t| t.decoded.as_str()) != Some("complete") {
            continue;
        }
        let Some(command_name) = tokens.last().map(|t| t.decoded.clone()) else {
            continue;
        };
        if base_name(&command_name) != app_base {
            continue;
        }

        let mut to_remove = false;
        for t in &tokens {
            if t.decoded.starts_with("__cod_") || t.decoded == "_minimal" {
                to_remove = true;
                break;
            }
            if t.decoded == "-D" {
                break;
            }
        }
        if to_remove {
            commands_to_remove.insert(command_name);
        } else {
            commands_to_keep.entry(command_name).or_default().push(line);
        }
    }

    let mut out = Vec::new();
    for command_name in &commands_to_remove {
        out.push(format!("complete -r {}", quote_arg(command_name)));
        if let Some(kept) = commands_to_keep.get(command_name) {
            out.extend(kept.iter().cloned());
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_shell_rejected() {
        assert!(ScriptGenerator::new("tcsh", "/usr/bin/cod").is_err());
    }

    #[test]
    fn test_preamble_embeds_binary_path_and_hooks() {
        for (shell, hook) in [
            ("bash", "__cod_postexec_bash"),
            ("zsh", "__cod_postexec_zsh"),
            ("fish", "__cod_postexec_fish"),
        ] {
            let generator = ScriptGenerator::new(shell, "/opt/my tools/cod").unwrap();
            let preamble = generator.preamble().join("\n");
            assert!(preamble.contains("'/opt/my tools/cod'"), "{shell}");
            assert!(!preamble.contains("__COD_BIN__"), "{shell}");
            assert!(preamble.contains(hook), "{shell}");
            assert!(preamble.contains(&format!("__cod_complete_{shell}")), "{shell}");
            assert!(preamble.contains("__cod_add_completions"), "{shell}");
            assert!(preamble.contains("__cod_clear_completions"), "{shell}");
            assert!(preamble.contains("api attach"), "{shell}");
        }
    }

    #[test]
    fn test_generate_and_reset_use_basename() {
        let generator = ScriptGenerator::new("bash", "/usr/bin/cod").unwrap();
        assert_eq!(
            generator.generate_completions("/usr/bin/cat"),
            ["__cod_add_completions cat"]
        );
        assert_eq!(
            generator.reset_command("/usr/bin/cat"),
            ["__cod_clear_completions cat"]
        );
    }

    #[test]
    fn test_generate_quotes_weird_names() {
        let generator = ScriptGenerator::new("zsh", "/usr/bin/cod").unwrap();
        assert_eq!(
            generator.generate_completions("/opt/my tool"),
            ["__cod_add_completions 'my tool'"]
        );
    }

    #[test]
    fn test_bash_remove_completions() {
        let input = "\
complete -o filenames -o bashdefault -F __cod_complete_bash cat
complete -F _other_completer cat
complete -F _longopt ls
";
        let lines = bash_remove_completions("cat", input.as_bytes()).unwrap();
        assert_eq!(
            lines,
            [
                "complete -r cat",
                "complete -F _other_completer cat",
            ]
        );
    }

    #[test]
    fn test_bash_remove_completions_keeps_unrelated() {
        let input = "complete -F _longopt ls\n";
        let lines = bash_remove_completions("cat", input.as_bytes()).unwrap();
        assert!(lines.is_empty());
    }

    #[test]
    fn test_bash_remove_completions_respects_dash_d() {
        // -D marks the default completer; it is not bound to one command.
        let input = "complete -D -F __cod_complete_bash cat\n";
        let lines = bash_remove_completions("cat", input.as_bytes()).unwrap();
        assert!(lines.is_empty());
    }
}
