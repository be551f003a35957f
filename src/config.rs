use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;

use crate::data::Policy;
use crate::selector::{compile_selector, Selector};

/// Filesystem layout, XDG-style. Everything the daemon and the thin client
/// touch on disk hangs off these paths.
#[derive(Debug, Clone)]
pub struct Configuration {
    /// `cod` for the real binary, `cod-test` for anything else, so test
    /// binaries never touch real state.
    app_name: String,
    config_dir: PathBuf,
    data_dir: PathBuf,
    run_dir: PathBuf,
    home_dir: String,
}

impl Configuration {
    pub fn default_configuration() -> anyhow::Result<Configuration> {
        let executable = std::env::current_exe()?;
        let base = executable
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let app_name = if base == "cod" { base } else { "cod-test".to_string() };

        let home_dir = std::env::var("HOME").unwrap_or_default();
        if home_dir.is_empty() {
            bail!("HOME is not set");
        }

        let config_base = match std::env::var("XDG_CONFIG_HOME") {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => Path::new(&home_dir).join(".config"),
        };
        let data_base = match std::env::var("XDG_DATA_HOME") {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => Path::new(&home_dir).join(".local/share"),
        };

        let config = Configuration {
            config_dir: config_base.join(&app_name),
            data_dir: data_base.join(&app_name),
            run_dir: data_base.join(&app_name).join("var"),
            home_dir,
            app_name,
        };

        // Unix socket paths are length-limited (108 bytes on Linux).
        let socket = config.socket_file();
        if socket.as_os_str().len() > 100 {
            bail!("socket path {} is too long", socket.display());
        }
        Ok(config)
    }

    /// Layout with every path under one root; used by the scenario tests to
    /// keep state away from the user's real directories.
    pub fn rooted_at(dir: &Path) -> Configuration {
        Configuration {
            app_name: "cod-test".to_string(),
            config_dir: dir.join("config"),
            data_dir: dir.join("data"),
            run_dir: dir.join("data/var"),
            home_dir: dir.to_string_lossy().into_owned(),
        }
    }

    pub fn home_dir(&self) -> &str {
        &self.home_dir
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn user_configuration_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    pub fn completions_sqlite_db(&self) -> PathBuf {
        self.data_dir.join("db.sqlite3")
    }

    pub fn socket_file(&self) -> PathBuf {
        self.run_dir.join(format!("{}.sock", self.app_name))
    }

    pub fn lock_file(&self) -> PathBuf {
        self.run_dir.join(format!("{}.lock", self.app_name))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("log")
    }
}

pub const DEFAULT_COMMAND_EXECUTION_TIMEOUT: Duration = Duration::from_millis(1000);

#[derive(Debug, Deserialize)]
struct RawRule {
    executable: String,
    policy: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawUserConfiguration {
    #[serde(rename = "rule")]
    rules: Vec<RawRule>,
    #[serde(rename = "command-execution-timeout")]
    command_execution_timeout: Option<u64>,
}

#[derive(Debug)]
pub struct Rule {
    pub selector: Selector,
    pub policy: Policy,
}

/// `config.toml`: an ordered `[[rule]]` list (first match wins) plus the help
/// command timeout. Loaded once at first Attach and treated as a value.
#[derive(Debug, Default)]
pub struct UserConfiguration {
    pub rules: Vec<Rule>,
    pub command_execution_timeout: Option<Duration>,
}

impl UserConfiguration {
    pub fn load(file: &Path, home_dir: &str) -> anyhow::Result<UserConfiguration> {
        let text = match std::fs::read_to_string(file) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(UserConfiguration::default());
            }
            Err(err) => return Err(err.into()),
        };
        Self::parse(&text, home_dir).with_context(|| format!("error parsing {}", file.display()))
    }

    pub fn parse(text: &str, home_dir: &str) -> anyhow::Result<UserConfiguration> {
        let raw: RawUserConfiguration = toml::from_str(text)?;

        let mut rules = Vec::with_capacity(raw.rules.len());
        for rule in &raw.rules {
            let policy = Policy::from_str_lossy(&rule.policy);
            if policy == Policy::Unknown {
                bail!("bad policy: {:?}", rule.policy);
            }
            if rule.executable.is_empty() {
                bail!("found rule with empty \"executable\"");
            }
            let selector = compile_selector(&rule.executable, home_dir)
                .with_context(|| format!("bad pattern in configuration: {:?}", rule.executable))?;
            rules.push(Rule { selector, policy });
        }

        Ok(UserConfiguration {
            rules,
            command_execution_timeout: raw.command_execution_timeout.map(Duration::from_millis),
        })
    }

    /// First matching rule wins; `Unknown` when nothing matches.
    pub fn executable_policy(&self, executable_path: &str) -> Policy {
        for rule in &self.rules {
            if rule.selector.matches(executable_path) {
                return rule.policy;
            }
        }
        Policy::Unknown
    }

    pub fn command_timeout(&self) -> Duration {
        self.command_execution_timeout
            .unwrap_or(DEFAULT_COMMAND_EXECUTION_TIMEOUT)
    }
}

pub const EXAMPLE_CONFIGURATION: &str = r#"# cod configuration
# Put this configuration into '~/.config/cod/config.toml'.
#
# Lines starting with '#' are comments.

#
# Rules
# =====

# Configuration might have several '[[rule]]' sections.
# Whenever cod detects usage of a help command in the shell it scans all
# such sections. When it finds the first appropriate rule (see 'executable'
# key) the 'policy' from this rule is used. If no appropriate rule is found
# the default policy is used.

# 'executable' controls which executables the rule applies to.
# It might have one of the following forms:
#   - '/path/to/executable' :: the rule applies to the specified executable
#   - '/path/to/dir/*' :: the rule applies to all executables in
#                         '/path/to/dir' but not in its subdirectories
#   - '/path/to/dir/**' :: the rule applies to all executables in
#                          '/path/to/dir' or any of its subdirectories
#   - 'exec-name' :: the rule applies to all executables with basename
#                    'exec-name'
#
# Paths must be absolute. '~/' is expanded to the home directory.

# 'policy' controls what cod does when it detects a help command.
# Possible values:
#   - 'ask'    :: default policy, cod asks before learning the command;
#   - 'trust'  :: cod learns detected help commands automatically;
#   - 'ignore' :: cod ignores all commands for this executable.

# Examples:
#   [[rule]]
#   executable = "/usr/bin/*"
#   policy = 'ignore'
#
#   [[rule]]
#   executable = "~/bin/*"
#   policy = 'trust'

#   [[rule]]
#   executable = "~/my/repo/**"
#   policy = 'trust'

#
# Timeouts
# ========

# How long a help command may run before it is killed, in milliseconds.
#   command-execution-timeout = 1000
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rules_first_match_wins() {
        let config = UserConfiguration::parse(
            r#"
            [[rule]]
            executable = "/usr/bin/*"
            policy = 'ignore'

            [[rule]]
            executable = "cat"
            policy = 'trust'
            "#,
            "/home/user",
        )
        .unwrap();

        assert_eq!(config.executable_policy("/usr/bin/cat"), Policy::Ignore);
        assert_eq!(config.executable_policy("/opt/bin/cat"), Policy::Trust);
        assert_eq!(config.executable_policy("/opt/bin/ls"), Policy::Unknown);
    }

    #[test]
    fn test_parse_rejects_bad_policy() {
        let err = UserConfiguration::parse(
            "[[rule]]\nexecutable = \"cat\"\npolicy = 'maybe'\n",
            "/home/user",
        )
        .unwrap_err();
        assert!(err.to_string().contains("bad policy"));
    }

    #[test]
    fn test_parse_rejects_empty_executable() {
        assert!(UserConfiguration::parse(
            "[[rule]]\nexecutable = \"\"\npolicy = 'ask'\n",
            "/home/user",
        )
        .is_err());
    }

    #[test]
    fn test_parse_rejects_bad_pattern() {
        assert!(UserConfiguration::parse(
            "[[rule]]\nexecutable = \"/a/*/b\"\npolicy = 'ask'\n",
            "/home/user",
        )
        .is_err());
    }

    #[test]
    fn test_command_execution_timeout() {
        let config = UserConfiguration::parse("command-execution-timeout = 250\n", "/h").unwrap();
        assert_eq!(config.command_timeout(), Duration::from_millis(250));

        let config = UserConfiguration::parse("", "/h").unwrap();
        assert_eq!(config.command_timeout(), DEFAULT_COMMAND_EXECUTION_TIMEOUT);
    }

    #[test]
    fn test_example_configuration_parses() {
        assert!(UserConfiguration::parse(EXAMPLE_CONFIGURATION, "/home/user").is_ok());
    }

    #[test]
    fn test_missing_file_is_empty_config() {
        let config =
            UserConfiguration::load(Path::new("/nonexistent/config.toml"), "/home/user").unwrap();
        assert!(config.rules.is_empty());
    }
}
