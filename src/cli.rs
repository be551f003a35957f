use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "cod",
    version = env!("COD_BUILD_VERSION"),
    about = "Shell autocomplete generator based on `--help' texts"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Learn new completions from a help command
    Learn {
        /// Command to learn, e.g. `cod learn my-tool --help`
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        subject: Vec<String>,
    },

    /// List known commands
    #[command(alias = "ls")]
    List {
        /// Items to list (id, name, /path, /dir/*, /dir/**)
        selectors: Vec<String>,
    },

    /// Forget known commands
    #[command(alias = "rm")]
    Remove {
        /// Items to remove
        #[arg(required = true)]
        selectors: Vec<String>,
    },

    /// Re-run help commands and refresh stored completions
    Update {
        /// Items to update
        #[arg(required = true)]
        selectors: Vec<String>,
    },

    /// Output the shell initialization script
    Init {
        /// PID of the shell
        pid: i32,
        /// Shell name (bash, zsh or fish)
        shell: String,
    },

    /// Print an example configuration to stdout
    ExampleConfig {
        /// Write the configuration to the config file instead of printing it
        /// (fails if the config file already exists)
        #[arg(long)]
        create: bool,
    },

    /// Start the cod daemon
    Daemon {
        /// Run the daemon in the foreground
        #[arg(long)]
        foreground: bool,
    },

    /// Shell <-> cod interaction (called by the generated scripts)
    #[command(hide = true)]
    Api {
        #[command(subcommand)]
        action: ApiAction,
    },
}

#[derive(Subcommand)]
pub enum ApiAction {
    /// Attach a shell to the daemon
    Attach { pid: i32, shell: String },

    /// Drain pending completion-script updates for a shell
    PollUpdates { pid: i32 },

    /// Check whether the just-executed command was a help invocation
    Postexec {
        pid: i32,
        #[arg(allow_hyphen_values = true)]
        command: String,
    },

    /// Print completions for the command line being completed
    CompleteWords {
        pid: i32,
        c_word: usize,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        words: Vec<String>,
    },

    /// List attached shells
    ListClients,

    /// Filter `complete -p` output on stdin for one executable
    BashCleanCompletions { executable: String },
}
