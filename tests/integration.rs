//! Scenario tests driving the daemon handlers end to end: fake executables
//! on disk, a real store under a temp directory, and the actual wire framing.

use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;

use cod::config::Configuration;
use cod::daemon::{
    AddHelpPageRequest, AddHelpPageResponse, AttachRequest, CompleteWordsRequest,
    CompleteWordsResponse, Daemon, DetachRequest, DetachResponse, InitScriptRequest,
    InitScriptResponse, ListClientsRequest, ListClientsResponse, ListCommandsRequest,
    ListCommandsResponse, ParseCommandLineRequest, ParseCommandLineResponse, PollUpdatesRequest,
    PollUpdatesResponse, Request, ResponseEnvelope,
};
use cod::data::{Command, Policy};

struct Fixture {
    _dir: tempfile::TempDir,
    daemon: Arc<Daemon>,
    root: std::path::PathBuf,
}

impl Fixture {
    fn new() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let daemon = Daemon::new(Configuration::rooted_at(&root));
        Fixture {
            _dir: dir,
            daemon,
            root,
        }
    }

    /// Round-trip a request through the newline-JSON framing.
    fn request<R: DeserializeOwned>(&self, request: &Request) -> anyhow::Result<R> {
        let line = serde_json::to_string(request).unwrap();
        let response = self.daemon.handle_request_line(&line);
        let envelope: ResponseEnvelope = serde_json::from_str(&response).unwrap();
        if let Some(error) = envelope.error {
            return Err(error.into());
        }
        Ok(serde_json::from_value(envelope.response)?)
    }

    fn attach(&self, pid: i32, shell: &str) {
        let _: cod::daemon::AttachResponse = self
            .request(&Request::AttachRequest(AttachRequest {
                pid,
                shell: shell.to_string(),
                cod_binary_path: "/usr/bin/cod".to_string(),
            }))
            .unwrap();
    }

    /// Drop a fake executable that prints `help` for any arguments.
    fn fake_executable(&self, name: &str, help: &str) -> String {
        let path = self.root.join(name);
        let script = format!("#!/bin/sh\ncat <<'COD_TEST_EOF'\n{help}COD_TEST_EOF\n");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn learn(&self, args: &[&str]) -> AddHelpPageResponse {
        self.request(&Request::AddHelpPageRequest(AddHelpPageRequest {
            command: Command {
                args: args.iter().map(|s| s.to_string()).collect(),
                env: vec!["PATH=/usr/bin:/bin".to_string()],
                dir: self.root.to_string_lossy().into_owned(),
            },
            policy: Policy::Unknown,
        }))
        .unwrap()
    }
}

const CAT_HELP: &str = "\
Usage: cat [OPTION]... [FILE]...
Concatenate FILE(s) to standard output.

  -A, --show-all           equivalent to -vET
  -e                       equivalent to -vE
      --help     display this help and exit
      --version  output version information and exit
";

#[test]
fn test_learn_and_complete() {
    let fixture = Fixture::new();
    fixture.attach(1001, "bash");

    let cat = fixture.fake_executable("cat", CAT_HELP);
    let response = fixture.learn(&[&cat, "--help"]);
    assert_eq!(response.help_page.executable_path, cat);

    let flags: Vec<&str> = response
        .help_page
        .completions
        .iter()
        .map(|c| c.flag.as_str())
        .collect();
    assert_eq!(flags, ["-A", "--show-all", "-e", "--help", "--version"]);

    let completed: CompleteWordsResponse = fixture
        .request(&Request::CompleteWordsRequest(CompleteWordsRequest {
            words: vec![cat.clone(), "-".to_string()],
            c_word: 1,
        }))
        .unwrap();
    for flag in ["-A", "--show-all", "-e", "--help", "--version"] {
        assert!(completed.completions.iter().any(|c| c == flag), "{flag}");
    }

    let completed: CompleteWordsResponse = fixture
        .request(&Request::CompleteWordsRequest(CompleteWordsRequest {
            words: vec![cat, "--".to_string()],
            c_word: 1,
        }))
        .unwrap();
    assert_eq!(completed.completions, ["--show-all", "--help", "--version"]);
}

#[test]
fn test_argparse_sub_command_context() {
    let fixture = Fixture::new();
    fixture.attach(1001, "zsh");

    let help = "\
usage: asciinema rec [-h] [--stdin] [--append]

optional arguments:
  -h, --help    show this help message and exit
  --stdin       enable stdin recording
  --append      append to existing asciicast file
";
    let asciinema = fixture.fake_executable("asciinema", help);
    let response = fixture.learn(&[&asciinema, "rec", "--help"]);

    assert!(!response.help_page.completions.is_empty());
    for completion in &response.help_page.completions {
        assert_eq!(completion.context.framework.as_deref(), Some("argparse"));
        assert_eq!(completion.context.sub_command, ["rec"]);
    }

    // The sub-command context gates completion offers.
    let complete = |words: Vec<String>, c_word| -> Vec<String> {
        let response: CompleteWordsResponse = fixture
            .request(&Request::CompleteWordsRequest(CompleteWordsRequest {
                words,
                c_word,
            }))
            .unwrap();
        response.completions
    };
    let offered = complete(
        vec![asciinema.clone(), "rec".to_string(), "--".to_string()],
        2,
    );
    assert!(offered.iter().any(|c| c == "--stdin"));
    let offered = complete(vec![asciinema, "--".to_string()], 1);
    assert!(offered.is_empty());
}

#[test]
fn test_shorter_argv_supersedes() {
    let fixture = Fixture::new();
    fixture.attach(1001, "bash");

    let help = "Usage: foo.py [OPTION]\n\n  --frob  frob the thing\n";
    let foo = fixture.fake_executable("foo.py", help);

    fixture.learn(&[&foo, "--foo", "--help"]);
    fixture.learn(&[&foo, "--help"]);

    let listed: ListCommandsResponse = fixture
        .request(&Request::ListCommandsRequest(ListCommandsRequest {
            selectors: vec!["/**".to_string()],
        }))
        .unwrap();
    assert_eq!(listed.command_items.len(), 1);
    let command = listed.command_items[0].command.as_ref().unwrap();
    assert_eq!(command.args, [foo, "--help".to_string()]);
}

#[test]
fn test_dirty_set_propagation() {
    let fixture = Fixture::new();
    fixture.attach(1001, "bash");
    fixture.attach(1002, "zsh");

    let cat = fixture.fake_executable("cat", CAT_HELP);
    fixture.learn(&[&cat, "--help"]);

    let updates: PollUpdatesResponse = fixture
        .request(&Request::PollUpdatesRequest(PollUpdatesRequest {
            pid: 1002,
        }))
        .unwrap();
    assert_eq!(
        updates.script,
        ["__cod_clear_completions cat", "__cod_add_completions cat"]
    );

    // The queue drains: a second poll is empty.
    let updates: PollUpdatesResponse = fixture
        .request(&Request::PollUpdatesRequest(PollUpdatesRequest {
            pid: 1002,
        }))
        .unwrap();
    assert!(updates.script.is_empty());

    // The other shell has its own queue.
    let updates: PollUpdatesResponse = fixture
        .request(&Request::PollUpdatesRequest(PollUpdatesRequest {
            pid: 1001,
        }))
        .unwrap();
    assert_eq!(updates.script.len(), 2);
}

#[test]
fn test_non_simple_postexec_is_silent() {
    let fixture = Fixture::new();
    fixture.attach(1001, "bash");

    let response: ParseCommandLineResponse = fixture
        .request(&Request::ParseCommandLineRequest(ParseCommandLineRequest {
            pid: 1001,
            command_line: "cat foo | grep bar".to_string(),
            dir: "/".to_string(),
            env: vec![],
        }))
        .unwrap();
    assert!(!response.is_help_command);
    assert!(response.args.is_empty());
}

#[test]
fn test_parse_command_line_detects_help_and_policy() {
    let fixture = Fixture::new();
    fixture.attach(1001, "bash");

    let cat = fixture.fake_executable("cat", CAT_HELP);
    let response: ParseCommandLineResponse = fixture
        .request(&Request::ParseCommandLineRequest(ParseCommandLineRequest {
            pid: 1001,
            command_line: format!("{cat} --help"),
            dir: fixture.root.to_string_lossy().into_owned(),
            env: vec!["PATH=/usr/bin:/bin".to_string()],
        }))
        .unwrap();
    assert!(response.is_help_command);
    assert_eq!(response.policy_mode, Policy::Ask);
    assert_eq!(response.args[0], cat);

    // `--help` after a bare `--` is an argument, not a help request.
    let response: ParseCommandLineResponse = fixture
        .request(&Request::ParseCommandLineRequest(ParseCommandLineRequest {
            pid: 1001,
            command_line: format!("{cat} -- --help"),
            dir: fixture.root.to_string_lossy().into_owned(),
            env: vec![],
        }))
        .unwrap();
    assert!(!response.is_help_command);
}

#[test]
fn test_parse_command_line_binary_not_found_code() {
    let fixture = Fixture::new();
    fixture.attach(1001, "bash");

    let err = fixture
        .request::<ParseCommandLineResponse>(&Request::ParseCommandLineRequest(
            ParseCommandLineRequest {
                pid: 1001,
                command_line: "no-such-binary-cod-test --help".to_string(),
                dir: "/".to_string(),
                env: vec!["PATH=/nonexistent".to_string()],
            },
        ))
        .unwrap_err();
    let code = err
        .downcast_ref::<cod::daemon::ErrorResponse>()
        .map(|e| e.code);
    assert_eq!(code, Some(cod::daemon::BINARY_NOT_FOUND_ERROR));
}

#[test]
fn test_requests_require_initialization() {
    let fixture = Fixture::new();
    let err = fixture
        .request::<ListClientsResponse>(&Request::ListClientsRequest(ListClientsRequest {}))
        .unwrap_err();
    assert!(err.to_string().contains("not initialized"));
}

#[test]
fn test_init_script_contains_preamble_and_known_executables() {
    let fixture = Fixture::new();
    fixture.attach(1001, "bash");

    let cat = fixture.fake_executable("cat", CAT_HELP);
    fixture.learn(&[&cat, "--help"]);

    let script: InitScriptResponse = fixture
        .request(&Request::InitScriptRequest(InitScriptRequest { pid: 1001 }))
        .unwrap();
    let text = script.script.join("\n");
    assert!(text.contains("__cod_postexec_bash"));
    assert!(text.contains("__cod_add_completions cat"));
}

#[test]
fn test_list_clients_and_detach_shutdown() {
    let fixture = Fixture::new();
    fixture.attach(1001, "bash");
    fixture.attach(1002, "fish");

    let clients: ListClientsResponse = fixture
        .request(&Request::ListClientsRequest(ListClientsRequest {}))
        .unwrap();
    let pids: Vec<i32> = clients.clients.iter().map(|c| c.pid).collect();
    assert_eq!(pids, [1001, 1002]);

    let _: DetachResponse = fixture
        .request(&Request::DetachRequest(DetachRequest { pid: 1001 }))
        .unwrap();
    assert!(!fixture.daemon.shutting_down());

    let _: DetachResponse = fixture
        .request(&Request::DetachRequest(DetachRequest { pid: 1002 }))
        .unwrap();
    assert!(fixture.daemon.shutting_down());
}

#[test]
fn test_liveness_watcher_detaches_dead_shell() {
    let fixture = Fixture::new();

    // A pid that existed moments ago but is reaped by the time we attach.
    let mut child = std::process::Command::new("/bin/sh")
        .args(["-c", "exit 0"])
        .spawn()
        .unwrap();
    let pid = child.id() as i32;
    child.wait().unwrap();

    fixture.attach(pid, "bash");

    let deadline = Instant::now() + Duration::from_secs(2);
    while !fixture.daemon.shutting_down() {
        assert!(Instant::now() < deadline, "watcher never detached the shell");
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn test_daemon_over_socket_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let configuration = Configuration::rooted_at(dir.path());

    let (tx, rx) = std::sync::mpsc::channel();
    let serve_configuration = configuration.clone();
    std::thread::spawn(move || {
        tx.send(cod::daemon::run_daemon(serve_configuration)).ok();
    });

    // Wait for the socket to appear, then do a full client conversation.
    let socket = configuration.socket_file();
    let deadline = Instant::now() + Duration::from_secs(5);
    while !socket.exists() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }

    let mut client = cod::daemon_client::Client::new(&configuration).unwrap();
    let own_pid = std::process::id() as i32;
    let _: cod::daemon::AttachResponse = client
        .request(&Request::AttachRequest(AttachRequest {
            pid: own_pid,
            shell: "zsh".to_string(),
            cod_binary_path: "/usr/bin/cod".to_string(),
        }))
        .unwrap();

    let script: InitScriptResponse = client
        .request(&Request::InitScriptRequest(InitScriptRequest {
            pid: own_pid,
        }))
        .unwrap();
    assert!(script.script.join("\n").contains("__cod_postexec_zsh"));

    let _: DetachResponse = client
        .request(&Request::DetachRequest(DetachRequest { pid: own_pid }))
        .unwrap();

    // Last shell detached: the daemon exits cleanly and removes its socket.
    let result = rx
        .recv_timeout(Duration::from_secs(10))
        .expect("daemon did not exit after the last detach");
    result.unwrap();
    assert!(!socket.exists());
}

/// A cold daemon answers nothing until its first Attach; the one-shot verbs
/// must do the handshake themselves instead of failing with "not
/// initialized" on their first real request.
#[test]
fn test_one_shot_verbs_work_against_cold_daemon() {
    let dir = tempfile::tempdir().unwrap();
    // `commands::*_main` resolve their paths from the environment; point
    // everything at the temp root before anything reads it.
    std::env::set_var("HOME", dir.path());
    std::env::set_var("XDG_DATA_HOME", dir.path().join("share"));
    std::env::set_var("XDG_CONFIG_HOME", dir.path().join("config"));

    let configuration = Configuration::default_configuration().unwrap();
    assert!(!configuration.socket_file().exists());
    assert!(!configuration.lock_file().exists());

    // The verbs cannot fork the test binary as a daemon, so serve from a
    // thread; nothing has attached when they connect, which is exactly the
    // cold state a freshly spawned daemon would be in.
    let (tx, rx) = std::sync::mpsc::channel();
    let serve_configuration = configuration.clone();
    std::thread::spawn(move || {
        tx.send(cod::daemon::run_daemon(serve_configuration)).ok();
    });
    let socket = configuration.socket_file();
    let deadline = Instant::now() + Duration::from_secs(5);
    while !socket.exists() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }

    cod::commands::list_main(vec![]).expect("list against a cold daemon");
    cod::commands::api_list_clients_main().expect("list-clients against a cold daemon");

    // The verbs registered this process as their client; detach it and the
    // daemon winds down.
    let mut client = cod::daemon_client::Client::new(&configuration).unwrap();
    let _: DetachResponse = client
        .request(&Request::DetachRequest(DetachRequest {
            pid: std::process::id() as i32,
        }))
        .unwrap();
    rx.recv_timeout(Duration::from_secs(10))
        .expect("daemon did not exit after detach")
        .unwrap();
}

#[test]
fn test_daemon_grace_period_exit_is_clean() {
    let dir = tempfile::tempdir().unwrap();
    let configuration = Configuration::rooted_at(dir.path());

    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        tx.send(cod::daemon::run_daemon(configuration)).ok();
    });

    let result = rx
        .recv_timeout(Duration::from_secs(10))
        .expect("daemon did not exit after the grace period");
    result.unwrap();
}

#[test]
fn test_duplicate_daemon_refuses_to_start() {
    let dir = tempfile::tempdir().unwrap();
    let configuration = Configuration::rooted_at(dir.path());

    let run_dir = configuration.run_dir().to_path_buf();
    std::fs::create_dir_all(&run_dir).unwrap();
    let lock = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(configuration.lock_file())
        .unwrap();
    {
        use std::os::fd::AsRawFd;
        assert_eq!(
            unsafe { libc::flock(lock.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) },
            0
        );
    }

    let err = cod::daemon::run_daemon(configuration).unwrap_err();
    assert!(err.to_string().contains("already running"));
}

/// Stored pages survive a daemon restart (fresh Daemon over the same dirs).
#[test]
fn test_store_persists_across_daemons() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();

    let help = "Usage: tool [OPTION]\n\n  --frob  frob the thing\n";
    let tool_path = root.join("tool");
    std::fs::write(
        &tool_path,
        format!("#!/bin/sh\ncat <<'COD_TEST_EOF'\n{help}COD_TEST_EOF\n"),
    )
    .unwrap();
    std::fs::set_permissions(&tool_path, std::fs::Permissions::from_mode(0o755)).unwrap();
    let tool = tool_path.to_string_lossy().into_owned();

    let request_on = |daemon: &Arc<Daemon>, request: &Request| -> ResponseEnvelope {
        let line = serde_json::to_string(request).unwrap();
        serde_json::from_str(&daemon.handle_request_line(&line)).unwrap()
    };

    {
        let daemon = Daemon::new(Configuration::rooted_at(&root));
        request_on(
            &daemon,
            &Request::AttachRequest(AttachRequest {
                pid: 1001,
                shell: "bash".to_string(),
                cod_binary_path: String::new(),
            }),
        );
        let envelope = request_on(
            &daemon,
            &Request::AddHelpPageRequest(AddHelpPageRequest {
                command: Command {
                    args: vec![tool.clone(), "--help".to_string()],
                    env: vec!["PATH=/usr/bin:/bin".to_string()],
                    dir: root.to_string_lossy().into_owned(),
                },
                policy: Policy::Trust,
            }),
        );
        assert!(envelope.error.is_none(), "{:?}", envelope.error);
    }

    let daemon = Daemon::new(Configuration::rooted_at(&root));
    request_on(
        &daemon,
        &Request::AttachRequest(AttachRequest {
            pid: 2002,
            shell: "bash".to_string(),
            cod_binary_path: String::new(),
        }),
    );
    let envelope = request_on(
        &daemon,
        &Request::ParseCommandLineRequest(ParseCommandLineRequest {
            pid: 2002,
            command_line: format!("{tool} --help"),
            dir: root.to_string_lossy().into_owned(),
            env: vec!["PATH=/usr/bin:/bin".to_string()],
        }),
    );
    let response: ParseCommandLineResponse =
        serde_json::from_value(envelope.response).unwrap();
    assert!(response.is_help_command);
    assert_eq!(response.policy_mode, Policy::Trust);
}
