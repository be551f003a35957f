use clap::Parser;

use cod::cli::{ApiAction, Cli, Commands};
use cod::commands;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Learn { subject } => commands::learn_main(subject),
        Commands::List { selectors } => commands::list_main(selectors),
        Commands::Remove { selectors } => commands::remove_main(selectors),
        Commands::Update { selectors } => commands::update_main(selectors),
        Commands::Init { pid, shell } => commands::init_main(pid, shell),
        Commands::ExampleConfig { create } => commands::example_config_main(create),
        Commands::Daemon { foreground } => commands::daemon_main(foreground),
        Commands::Api { action } => match action {
            ApiAction::Attach { pid, shell } => commands::api_attach_main(pid, shell),
            ApiAction::PollUpdates { pid } => commands::api_poll_updates_main(pid),
            ApiAction::Postexec { pid, command } => commands::api_postexec_main(pid, command),
            ApiAction::CompleteWords { pid, c_word, words } => {
                commands::api_complete_words_main(pid, c_word, words)
            }
            ApiAction::ListClients => commands::api_list_clients_main(),
            ApiAction::BashCleanCompletions { executable } => {
                commands::api_bash_clean_completions_main(executable)
            }
        },
    };

    if let Err(err) = result {
        eprintln!("cod: error: {err:#}");
        std::process::exit(1);
    }
}
