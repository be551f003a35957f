use std::cmp::Ordering;
use std::io::Read;

use anyhow::Context;

use crate::config::Configuration;
use crate::daemon::{
    AddHelpPageRequest, AddHelpPageResponse, AttachRequest, AttachResponse, CompleteWordsRequest,
    CompleteWordsResponse, InitScriptRequest, InitScriptResponse, ListClientsRequest,
    ListClientsResponse, ListCommandsRequest, ListCommandsResponse, ListCommandsResponseItem,
    ParseCommandLineRequest, ParseCommandLineResponse, PollUpdatesRequest, PollUpdatesResponse,
    RemoveCommandsRequest, RemoveCommandsResponse, Request, UpdateHelpPageRequest,
    UpdateHelpPageResponse, BINARY_NOT_FOUND_ERROR,
};
use crate::daemon_client::{ensure_daemon_running, Client};
use crate::data::{base_name, canonize_executable_path, Command, Policy};
use crate::quote::quote;
use crate::util::get_env_var;
use crate::{daemon, shellgen, ui};

fn environ() -> Vec<String> {
    std::env::vars().map(|(k, v)| format!("{k}={v}")).collect()
}

fn current_dir() -> anyhow::Result<String> {
    Ok(std::env::current_dir()?.to_string_lossy().into_owned())
}

/// Spawn the daemon when needed and connect to it.
fn connect(configuration: &Configuration) -> anyhow::Result<Client> {
    ensure_daemon_running(configuration)?;
    Client::new(configuration)
}

/// Connect and register this process as a client. A fresh daemon serves
/// nothing until its first Attach, so one-shot verbs attach under their own
/// pid; the liveness watcher reaps the registration when the process exits.
fn connect_attached(configuration: &Configuration) -> anyhow::Result<Client> {
    let mut client = connect(configuration)?;
    attach(&mut client, std::process::id() as i32, "bash")?;
    Ok(client)
}

fn attach(client: &mut Client, pid: i32, shell: &str) -> anyhow::Result<()> {
    let binary = std::env::current_exe()?.to_string_lossy().into_owned();
    let _: AttachResponse = client.request(&Request::AttachRequest(AttachRequest {
        pid,
        shell: shell.to_string(),
        cod_binary_path: binary,
    }))?;
    Ok(())
}

fn summarize_learning(response: &AddHelpPageResponse) {
    let message = match response.status {
        crate::data::AddHelpPageStatus::New => {
            let mut examples = String::new();
            let completions = &response.help_page.completions;
            for (i, completion) in completions.iter().enumerate() {
                let cur = format!("{:?}", completion.flag);
                if i == 0 {
                    examples.push_str(&cur);
                } else if examples.len() + cur.len() < 35 {
                    examples.push(' ');
                    examples.push_str(&cur);
                } else {
                    examples.push_str(&format!(" and {} more", completions.len() - i));
                    break;
                }
            }
            format!("cod: learned completions: {examples}")
        }
        crate::data::AddHelpPageStatus::Updated => "cod: updated completions".to_string(),
    };
    println!("{}", ui::green(&message));
}

pub fn learn_main(subject: Vec<String>) -> anyhow::Result<()> {
    let configuration = Configuration::default_configuration()?;
    let mut client = connect_attached(&configuration).context("cannot connect to daemon")?;

    let request = Request::AddHelpPageRequest(AddHelpPageRequest {
        command: Command {
            args: subject,
            env: environ(),
            dir: current_dir()?,
        },
        policy: Policy::Unknown,
    });
    let response: AddHelpPageResponse = client.request(&request)?;
    summarize_learning(&response);
    Ok(())
}

/// Order for `list` and `update`: by executable basename, then full path,
/// then id; broken rows first.
fn by_application(lhs: &ListCommandsResponseItem, rhs: &ListCommandsResponseItem) -> Ordering {
    match (&lhs.command, &rhs.command) {
        (None, None) => lhs.id.cmp(&rhs.id),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => {
            if a.args.is_empty() || b.args.is_empty() {
                panic!("server returned empty command");
            }
            base_name(&a.args[0])
                .cmp(base_name(&b.args[0]))
                .then_with(|| a.args[0].cmp(&b.args[0]))
                .then_with(|| lhs.id.cmp(&rhs.id))
        }
    }
}

fn list_commands(client: &mut Client, selectors: Vec<String>) -> anyhow::Result<ListCommandsResponse> {
    let selectors = if selectors.is_empty() {
        vec!["/**".to_string()]
    } else {
        selectors
    };
    client.request(&Request::ListCommandsRequest(ListCommandsRequest {
        selectors,
    }))
}

pub fn list_main(selectors: Vec<String>) -> anyhow::Result<()> {
    let configuration = Configuration::default_configuration()?;
    let mut client = connect_attached(&configuration)?;

    let mut response = list_commands(&mut client, selectors)?;
    response.command_items.sort_by(by_application);
    for item in &response.command_items {
        let quoted = match &item.command {
            Some(command) => quote(&command.args),
            None => "<broken>".to_string(),
        };
        println!("{}\t{}", item.id, quoted);
    }
    Ok(())
}

pub fn remove_main(selectors: Vec<String>) -> anyhow::Result<()> {
    let configuration = Configuration::default_configuration()?;
    let mut client = connect_attached(&configuration)?;

    let response = list_commands(&mut client, selectors)?;
    let ids: Vec<i64> = response.command_items.iter().map(|item| item.id).collect();
    let _: RemoveCommandsResponse = client.request(&Request::RemoveCommandsRequest(
        RemoveCommandsRequest { help_page_ids: ids },
    ))?;
    Ok(())
}

pub fn update_main(selectors: Vec<String>) -> anyhow::Result<()> {
    let configuration = Configuration::default_configuration()?;
    let mut client = connect_attached(&configuration)?;

    let mut response = list_commands(&mut client, selectors)?;
    response.command_items.sort_by(by_application);
    for item in response.command_items {
        let Some(command) = item.command else {
            continue;
        };
        let _: UpdateHelpPageResponse = client.request(&Request::UpdateHelpPageRequest(
            UpdateHelpPageRequest {
                id: item.id,
                command,
            },
        ))?;
    }
    Ok(())
}

pub fn init_main(pid: i32, shell: String) -> anyhow::Result<()> {
    let configuration = Configuration::default_configuration()?;
    let mut client = connect(&configuration)?;
    attach(&mut client, pid, &shell)?;

    let response: InitScriptResponse =
        client.request(&Request::InitScriptRequest(InitScriptRequest { pid }))?;
    for line in response.script {
        println!("{line}");
    }
    Ok(())
}

pub fn example_config_main(create: bool) -> anyhow::Result<()> {
    if !create {
        print!("{}", crate::config::EXAMPLE_CONFIGURATION);
        return Ok(());
    }

    let configuration = Configuration::default_configuration()?;
    let config_path = configuration.user_configuration_file();
    if let Some(dir) = config_path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    if config_path.exists() {
        anyhow::bail!("already exists: {}", config_path.display());
    }
    std::fs::write(&config_path, crate::config::EXAMPLE_CONFIGURATION)?;
    Ok(())
}

pub fn daemon_main(foreground: bool) -> anyhow::Result<()> {
    let configuration = Configuration::default_configuration()?;
    if foreground {
        daemon::run_daemon(configuration)
    } else {
        ensure_daemon_running(&configuration)
    }
}

pub fn api_attach_main(pid: i32, shell: String) -> anyhow::Result<()> {
    let configuration = Configuration::default_configuration()?;
    let mut client = connect(&configuration)?;
    attach(&mut client, pid, &shell)
}

pub fn api_poll_updates_main(pid: i32) -> anyhow::Result<()> {
    let configuration = Configuration::default_configuration()?;
    let mut client = Client::new(&configuration)?;
    let response: PollUpdatesResponse =
        client.request(&Request::PollUpdatesRequest(PollUpdatesRequest { pid }))?;
    for line in response.script {
        println!("{line}");
    }
    Ok(())
}

fn remote_error_code(err: &anyhow::Error) -> Option<i32> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<daemon::ErrorResponse>())
        .map(|response| response.code)
}

pub fn api_postexec_main(pid: i32, command_line: String) -> anyhow::Result<()> {
    let configuration = Configuration::default_configuration()?;
    let mut client = Client::new(&configuration)?;

    let dir = current_dir()?;
    let request = Request::ParseCommandLineRequest(ParseCommandLineRequest {
        pid,
        command_line,
        dir: dir.clone(),
        env: environ(),
    });
    let response: ParseCommandLineResponse = match client.request(&request) {
        Ok(response) => response,
        // The command names no known binary; nothing to learn, stay silent.
        Err(err) if remote_error_code(&err) == Some(BINARY_NOT_FOUND_ERROR) => return Ok(()),
        Err(err) => return Err(err),
    };

    if response.args.is_empty()
        || !response.is_help_command
        || response.policy_mode == Policy::Ignore
    {
        return Ok(());
    }

    let learn = |client: &mut Client, policy: Policy| -> anyhow::Result<()> {
        let mut env = environ();
        env.extend(response.env.iter().cloned());
        let request = Request::AddHelpPageRequest(AddHelpPageRequest {
            command: Command {
                args: response.args.clone(),
                env,
                dir: dir.clone(),
            },
            policy,
        });
        let add_response: AddHelpPageResponse = client.request(&request)?;
        summarize_learning(&add_response);
        Ok(())
    };

    if response.policy_mode == Policy::Trust {
        return learn(&mut client, Policy::Unknown);
    }

    // Policy is Ask: prompt on the terminal.
    let prompt = format!(
        "\u{250c}\u{2500}\u{2500}> {}\n\u{2514}\u{2500}\u{2500}\u{2500} cod: learn this command? [yn?] > ",
        response.args.join(" ")
    );
    let help = "\n \
         y => yes, and enable autoupdates for this command\n \
         n => not now\n \
         ? => show this help\n \
         \n \
         You can set up rules in the cod config file. Check:\n   \
         $ cod example-config\n \
         \n > ";

    print!("{}", ui::green(&prompt));
    use std::io::Write;
    std::io::stdout().flush()?;

    loop {
        match ui::get_keystroke("yn?")? {
            'y' => return learn(&mut client, Policy::Trust),
            'n' => return Ok(()),
            _ => {
                print!("{}", ui::green(help));
                std::io::stdout().flush()?;
            }
        }
    }
}

pub fn api_complete_words_main(_pid: i32, c_word: usize, words: Vec<String>) -> anyhow::Result<()> {
    if words.is_empty() {
        anyhow::bail!("command line cannot be empty");
    }
    let configuration = Configuration::default_configuration()?;
    let mut client = Client::new(&configuration)?;

    let env = environ();
    let dir = current_dir()?;
    let executable_path = canonize_executable_path(
        &words[0],
        &dir,
        get_env_var(&env, "PATH"),
        get_env_var(&env, "HOME"),
    )?;

    let mut words = words;
    words[0] = executable_path;
    let response: CompleteWordsResponse =
        client.request(&Request::CompleteWordsRequest(CompleteWordsRequest {
            words,
            c_word,
        }))?;
    for completion in response.completions {
        println!("{completion}");
    }
    Ok(())
}

pub fn api_list_clients_main() -> anyhow::Result<()> {
    let configuration = Configuration::default_configuration()?;
    let mut client = connect_attached(&configuration)?;
    let response: ListClientsResponse =
        client.request(&Request::ListClientsRequest(ListClientsRequest {}))?;
    for client in response.clients {
        println!("{}\t{}", client.pid, client.shell);
    }
    Ok(())
}

pub fn api_bash_clean_completions_main(executable: String) -> anyhow::Result<()> {
    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input)?;
    let lines = shellgen::bash_remove_completions(&executable, input.as_bytes())?;
    for line in lines {
        println!("{line}");
    }
    Ok(())
}
