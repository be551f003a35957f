use std::collections::{BTreeSet, HashMap};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::config::{Configuration, UserConfiguration};
use crate::data::{
    canonize_executable_path, AddHelpPageStatus, Command, Completion, HelpPage, Policy,
};
use crate::db::Store;
use crate::selector::{compile_selector, Selector};
use crate::shellgen::ScriptGenerator;
use crate::util::{get_env_var, BinaryNotFound, NotImplemented, Warner, Warning};
use crate::{exec, parse_help, tokenize};

// ── Wire protocol ──────────────────────────────────────────────────

pub const GENERIC_ERROR: i32 = 1;
pub const NOT_IMPLEMENTED_ERROR: i32 = 2;
pub const BINARY_NOT_FOUND_ERROR: i32 = 3;

/// Newline-terminated JSON over the daemon's unix socket:
/// `{"Request": "<name>", "Payload": {...}}`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "Request", content = "Payload")]
pub enum Request {
    AttachRequest(AttachRequest),
    DetachRequest(DetachRequest),
    InitScriptRequest(InitScriptRequest),
    ListClientsRequest(ListClientsRequest),
    ListCommandsRequest(ListCommandsRequest),
    RemoveCommandsRequest(RemoveCommandsRequest),
    AddHelpPageRequest(AddHelpPageRequest),
    UpdateHelpPageRequest(UpdateHelpPageRequest),
    PollUpdatesRequest(PollUpdatesRequest),
    ParseCommandLineRequest(ParseCommandLineRequest),
    CompleteWordsRequest(CompleteWordsRequest),
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AttachRequest {
    pub pid: i32,
    pub shell: String,
    #[serde(default)]
    pub cod_binary_path: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AttachResponse {}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DetachRequest {
    pub pid: i32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DetachResponse {}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InitScriptRequest {
    pub pid: i32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct InitScriptResponse {
    #[serde(default)]
    pub script: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ListClientsRequest {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ShellAndPid {
    pub shell: String,
    pub pid: i32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ListClientsResponse {
    #[serde(default)]
    pub clients: Vec<ShellAndPid>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ListCommandsRequest {
    #[serde(default)]
    pub selectors: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ListCommandsResponseItem {
    pub id: i64,
    /// Absent when the stored command JSON is broken.
    pub command: Option<Command>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ListCommandsResponse {
    #[serde(default)]
    pub command_items: Vec<ListCommandsResponseItem>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RemoveCommandsRequest {
    pub help_page_ids: Vec<i64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RemoveCommandsResponse {}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AddHelpPageRequest {
    pub command: Command,
    #[serde(default)]
    pub policy: Policy,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AddHelpPageResponse {
    pub help_page: HelpPage,
    pub status: AddHelpPageStatus,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UpdateHelpPageRequest {
    pub id: i64,
    pub command: Command,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct UpdateHelpPageResponse {}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PollUpdatesRequest {
    pub pid: i32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PollUpdatesResponse {
    #[serde(default)]
    pub script: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ParseCommandLineRequest {
    pub pid: i32,
    pub command_line: String,
    pub dir: String,
    #[serde(default)]
    pub env: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ParseCommandLineResponse {
    pub is_help_command: bool,
    pub policy_mode: Policy,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CompleteWordsRequest {
    /// First word must be the canonical executable path.
    pub words: Vec<String>,
    pub c_word: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CompleteWordsResponse {
    #[serde(default)]
    pub completions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ErrorResponse {
    pub code: i32,
    pub desc: String,
}

impl std::fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "server returned error: {}", self.desc)
    }
}

impl std::error::Error for ErrorResponse {}

/// `{"Response": {...}, "Error": {...}?, "Warnings": [...]?}`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResponseEnvelope {
    pub response: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warnings: Option<Vec<Warning>>,
}

fn error_code(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if cause.downcast_ref::<BinaryNotFound>().is_some() {
            return BINARY_NOT_FOUND_ERROR;
        }
        if cause.downcast_ref::<NotImplemented>().is_some() {
            return NOT_IMPLEMENTED_ERROR;
        }
    }
    GENERIC_ERROR
}

fn marshal_response<T: Serialize>(result: anyhow::Result<T>, warner: Warner) -> String {
    let envelope = match result {
        Ok(response) => ResponseEnvelope {
            response: serde_json::to_value(response).unwrap_or(serde_json::Value::Null),
            error: None,
            warnings: warner.into_warnings(),
        },
        Err(err) => ResponseEnvelope {
            response: serde_json::Value::Null,
            error: Some(ErrorResponse {
                code: error_code(&err),
                desc: format!("{err:#}"),
            }),
            warnings: warner.into_warnings(),
        },
    };
    serde_json::to_string(&envelope).unwrap_or_else(|_| {
        r#"{"Response":null,"Error":{"Code":1,"Desc":"serialize error"}}"#.to_string()
    })
}

// ── Daemon state ───────────────────────────────────────────────────

struct ShellInfo {
    pid: i32,
    shell: String,
    generator: ScriptGenerator,
    /// Executables whose completion script is out of sync on this shell.
    executables_to_update: BTreeSet<String>,
}

#[derive(Default)]
struct DaemonState {
    initialized: bool,
    store: Option<Store>,
    user_configuration: UserConfiguration,
    shells: HashMap<i32, ShellInfo>,
}

/// The long-running arbiter between attached shells: owns the store, the
/// policy rules, and the per-shell update queues.
pub struct Daemon {
    configuration: Configuration,
    state: Mutex<DaemonState>,
    shutdown: AtomicBool,
    watchers: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl Daemon {
    pub fn new(configuration: Configuration) -> Arc<Daemon> {
        Arc::new(Daemon {
            configuration,
            state: Mutex::new(DaemonState::default()),
            shutdown: AtomicBool::new(false),
            watchers: Mutex::new(Vec::new()),
        })
    }

    pub fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, DaemonState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_initialized(&self) -> bool {
        self.lock_state().initialized
    }

    /// Handle one newline-framed request; returns the response line without
    /// the trailing newline.
    pub fn handle_request_line(self: &Arc<Self>, line: &str) -> String {
        tracing::debug!("received request: {line}");
        let request: Request = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(err) => {
                return marshal_response::<()>(
                    Err(anyhow::anyhow!("cannot parse request: {err}")),
                    Warner::default(),
                );
            }
        };

        if !matches!(request, Request::AttachRequest(_)) && !self.is_initialized() {
            return marshal_response::<()>(
                Err(anyhow::anyhow!("server is not initialized yet")),
                Warner::default(),
            );
        }

        let mut warner = Warner::default();
        let response = match request {
            Request::AttachRequest(req) => marshal_response(self.handle_attach(&req), warner),
            Request::DetachRequest(req) => marshal_response(self.handle_detach(&req), warner),
            Request::InitScriptRequest(req) => {
                marshal_response(self.handle_init_script(&req), warner)
            }
            Request::ListClientsRequest(_) => marshal_response(self.handle_list_clients(), warner),
            Request::ListCommandsRequest(req) => {
                marshal_response(self.handle_list_commands(&req), warner)
            }
            Request::RemoveCommandsRequest(req) => {
                marshal_response(self.handle_remove_commands(&req), warner)
            }
            Request::AddHelpPageRequest(req) => {
                marshal_response(self.handle_add_help_page(&req), warner)
            }
            Request::UpdateHelpPageRequest(req) => {
                let result = self.handle_update_help_page(&req, &mut warner);
                marshal_response(result, warner)
            }
            Request::PollUpdatesRequest(req) => {
                marshal_response(self.handle_poll_updates(&req), warner)
            }
            Request::ParseCommandLineRequest(req) => {
                marshal_response(self.handle_parse_command_line(&req), warner)
            }
            Request::CompleteWordsRequest(req) => {
                marshal_response(self.handle_complete_words(&req), warner)
            }
        };
        tracing::debug!("sending response: {response}");
        response
    }

    fn handle_attach(self: &Arc<Self>, req: &AttachRequest) -> anyhow::Result<AttachResponse> {
        let mut state = self.lock_state();

        if !state.initialized {
            state.store = Some(Store::open(&self.configuration.completions_sqlite_db())?);
            state.user_configuration = UserConfiguration::load(
                &self.configuration.user_configuration_file(),
                self.configuration.home_dir(),
            )?;
            state.initialized = true;
        }

        let generator = ScriptGenerator::new(&req.shell, &req.cod_binary_path)?;
        state.shells.insert(
            req.pid,
            ShellInfo {
                pid: req.pid,
                shell: req.shell.clone(),
                generator,
                executables_to_update: BTreeSet::new(),
            },
        );
        let mut pids: Vec<i32> = state.shells.keys().copied().collect();
        pids.sort_unstable();
        tracing::info!("attached pids: {pids:?}");
        drop(state);

        let daemon = Arc::clone(self);
        let pid = req.pid;
        let watcher = std::thread::Builder::new()
            .name(format!("cod-watch-{pid}"))
            .spawn(move || daemon.watch_pid(pid))?;
        self.watchers.lock().unwrap().push(watcher);

        Ok(AttachResponse {})
    }

    /// Poll the shell with signal 0 until it disappears, then detach it.
    fn watch_pid(self: Arc<Self>, pid: i32) {
        loop {
            if self.shutting_down() {
                break;
            }
            if unsafe { libc::kill(pid, 0) } != 0 {
                tracing::info!("shell process {pid} is gone");
                let _ = self.handle_detach(&DetachRequest { pid });
                break;
            }
            std::thread::sleep(Duration::from_millis(300));
        }
    }

    fn handle_detach(&self, req: &DetachRequest) -> anyhow::Result<DetachResponse> {
        let mut state = self.lock_state();
        state.shells.remove(&req.pid);
        if state.shells.is_empty() {
            // Last client is gone; stop accepting and let the serve loop
            // drain.
            self.shutdown.store(true, Ordering::SeqCst);
        }
        Ok(DetachResponse {})
    }

    fn handle_init_script(&self, req: &InitScriptRequest) -> anyhow::Result<InitScriptResponse> {
        let state = self.lock_state();
        let info = shell_info(&state, req.pid)?;

        let mut script = info.generator.preamble();
        for page in store(&state)?.get_all_completions()? {
            script.extend(info.generator.generate_completions(&page.executable_path));
        }
        Ok(InitScriptResponse { script })
    }

    fn handle_list_clients(&self) -> anyhow::Result<ListClientsResponse> {
        let state = self.lock_state();
        let mut clients: Vec<ShellAndPid> = state
            .shells
            .values()
            .map(|info| ShellAndPid {
                shell: info.shell.clone(),
                pid: info.pid,
            })
            .collect();
        clients.sort_by_key(|c| c.pid);
        Ok(ListClientsResponse { clients })
    }

    fn handle_list_commands(
        &self,
        req: &ListCommandsRequest,
    ) -> anyhow::Result<ListCommandsResponse> {
        let mut id_filter: BTreeSet<i64> = BTreeSet::new();
        let mut globs: Vec<Selector> = Vec::new();
        for selector in &req.selectors {
            if !selector.is_empty() && selector.bytes().all(|b| b.is_ascii_digit()) {
                id_filter.insert(selector.parse()?);
            } else {
                globs.push(compile_selector(selector, self.configuration.home_dir())?);
            }
        }
        let take_everything = req.selectors.is_empty();

        let state = self.lock_state();
        let commands = store(&state)?.list_commands()?;

        let mut response = ListCommandsResponse::default();
        for (id, command) in commands {
            let mut take = take_everything || id_filter.contains(&id);
            if !take {
                if let Some(command) = command.as_ref().filter(|c| !c.args.is_empty()) {
                    take = globs.iter().any(|g| g.matches(&command.args[0]));
                }
            }
            if take {
                response
                    .command_items
                    .push(ListCommandsResponseItem { id, command });
            }
        }
        Ok(response)
    }

    fn handle_remove_commands(
        &self,
        req: &RemoveCommandsRequest,
    ) -> anyhow::Result<RemoveCommandsResponse> {
        let mut state = self.lock_state();
        for &id in &req.help_page_ids {
            let executable_path = store_mut(&mut state)?.remove_help_page(id)?;
            notify_executable_update(&mut state, &executable_path);
        }
        Ok(RemoveCommandsResponse {})
    }

    /// Canonicalize, run, and parse one help command.
    fn run_help_command(&self, command: &Command, timeout: Duration) -> anyhow::Result<HelpPage> {
        if command.args.is_empty() {
            anyhow::bail!("command is empty");
        }
        let executable_path = canonize_executable_path(
            &command.args[0],
            &command.dir,
            get_env_var(&command.env, "PATH"),
            get_env_var(&command.env, "HOME"),
        )?;

        let mut command = command.clone();
        command.args[0] = executable_path;

        let help_text = exec::run_command_captured(&command, timeout)?;
        let mut help_page = parse_help::parse_help(&command.args, &help_text);
        help_page.command = command;
        Ok(help_page)
    }

    fn command_timeout(&self) -> Duration {
        self.lock_state().user_configuration.command_timeout()
    }

    fn handle_add_help_page(
        &self,
        req: &AddHelpPageRequest,
    ) -> anyhow::Result<AddHelpPageResponse> {
        // The child runs outside the daemon lock; only the store commit and
        // the dirty-set update are serialized.
        let mut help_page = self.run_help_command(&req.command, self.command_timeout())?;

        let mut state = self.lock_state();
        let status = store_mut(&mut state)?.add_help_page(&mut help_page, req.policy)?;
        let executable_path = help_page.executable_path.clone();
        notify_executable_update(&mut state, &executable_path);

        Ok(AddHelpPageResponse { help_page, status })
    }

    fn handle_update_help_page(
        &self,
        req: &UpdateHelpPageRequest,
        warner: &mut Warner,
    ) -> anyhow::Result<UpdateHelpPageResponse> {
        let mut command = req.command.clone();
        match std::fs::metadata(&command.dir) {
            Ok(_) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let run_dir = self.configuration.run_dir().to_string_lossy().into_owned();
                warner.warn(format!(
                    "updating {}; will use {:?} instead of non-existing {:?}",
                    crate::quote::quote(&command.args),
                    run_dir,
                    command.dir,
                ));
                command.dir = run_dir;
            }
            Err(err) => return Err(err.into()),
        }

        match self.run_help_command(&command, self.command_timeout()) {
            Ok(mut help_page) => {
                let mut state = self.lock_state();
                store_mut(&mut state)?.add_help_page(&mut help_page, Policy::Unknown)?;
                let executable_path = help_page.executable_path.clone();
                notify_executable_update(&mut state, &executable_path);
            }
            Err(err) => {
                warner.warn(format!(
                    "error running {}: {err:#}",
                    crate::quote::quote(&command.args)
                ));
                let mut state = self.lock_state();
                let executable_path = store_mut(&mut state)?.remove_help_page(req.id)?;
                notify_executable_update(&mut state, &executable_path);
            }
        }
        Ok(UpdateHelpPageResponse {})
    }

    fn handle_poll_updates(&self, req: &PollUpdatesRequest) -> anyhow::Result<PollUpdatesResponse> {
        let mut state = self.lock_state();
        let pending: Vec<String> = shell_info(&state, req.pid)?
            .executables_to_update
            .iter()
            .cloned()
            .collect();

        let mut script = Vec::new();
        for executable_path in pending {
            let completions = store(&state)?.get_completions(&executable_path)?;
            let info = shell_info(&state, req.pid)?;
            script.extend(info.generator.reset_command(&executable_path));
            if !completions.is_empty() {
                script.extend(info.generator.generate_completions(&executable_path));
            }
            // Clear per item so a failure above keeps the rest queued.
            shell_info_mut(&mut state, req.pid)?
                .executables_to_update
                .remove(&executable_path);
        }
        Ok(PollUpdatesResponse { script })
    }

    fn handle_parse_command_line(
        &self,
        req: &ParseCommandLineRequest,
    ) -> anyhow::Result<ParseCommandLineResponse> {
        let mut response = ParseCommandLineResponse::default();
        let (env, mut args) = match tokenize::parse_simple_command(&req.command_line) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::debug!("skipping command: {err}");
                return Ok(response);
            }
        };

        for arg in &args {
            match arg.as_str() {
                "--help" => {
                    response.is_help_command = true;
                    break;
                }
                "--" => break,
                _ => {}
            }
        }

        let executable_path = canonize_executable_path(
            &args[0],
            &req.dir,
            get_env_var(&req.env, "PATH"),
            get_env_var(&req.env, "HOME"),
        )?;
        args[0] = executable_path;

        let state = self.lock_state();
        let stored_policy = store(&state)?.get_command_policy(&args)?;
        response.policy_mode = if stored_policy != Policy::Unknown {
            stored_policy
        } else {
            match state.user_configuration.executable_policy(&args[0]) {
                Policy::Unknown => Policy::Ask,
                policy => policy,
            }
        };

        response.args = args;
        response.env = env;
        Ok(response)
    }

    fn handle_complete_words(
        &self,
        req: &CompleteWordsRequest,
    ) -> anyhow::Result<CompleteWordsResponse> {
        let Some(executable_path) = req.words.first() else {
            anyhow::bail!("words cannot be empty");
        };
        let current_word = req.words.get(req.c_word).map(String::as_str).unwrap_or("");
        let end = req.c_word.min(req.words.len());
        let preceding: &[String] = if end > 1 { &req.words[1..end] } else { &[] };

        let state = self.lock_state();
        let completions = store(&state)?.get_completions(executable_path)?;

        let mut response = CompleteWordsResponse::default();
        for completion in completions {
            if !completion.flag.starts_with(current_word) {
                continue;
            }
            if !context_applies(&completion, preceding) {
                continue;
            }
            response.completions.push(completion.flag);
        }
        Ok(response)
    }
}

/// A completion applies when its sub-command path occurs, in order, among
/// the words typed before the cursor.
fn context_applies(completion: &Completion, preceding: &[String]) -> bool {
    let mut words = preceding.iter();
    completion
        .context
        .sub_command
        .iter()
        .all(|sub| words.any(|w| w == sub))
}

fn notify_executable_update(state: &mut DaemonState, executable_path: &str) {
    for info in state.shells.values_mut() {
        info.executables_to_update
            .insert(executable_path.to_string());
    }
}

fn shell_info<'a>(state: &'a DaemonState, pid: i32) -> anyhow::Result<&'a ShellInfo> {
    state
        .shells
        .get(&pid)
        .ok_or_else(|| anyhow::anyhow!("unknown pid: {pid}"))
}

fn shell_info_mut<'a>(state: &'a mut DaemonState, pid: i32) -> anyhow::Result<&'a mut ShellInfo> {
    state
        .shells
        .get_mut(&pid)
        .ok_or_else(|| anyhow::anyhow!("unknown pid: {pid}"))
}

fn store<'a>(state: &'a DaemonState) -> anyhow::Result<&'a Store> {
    state
        .store
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("store is not initialized"))
}

fn store_mut<'a>(state: &'a mut DaemonState) -> anyhow::Result<&'a mut Store> {
    state
        .store
        .as_mut()
        .ok_or_else(|| anyhow::anyhow!("store is not initialized"))
}

// ── Serve loop ─────────────────────────────────────────────────────

/// How long a fresh daemon waits for its first Attach before concluding it
/// has no purpose.
const ATTACH_GRACE_PERIOD: Duration = Duration::from_secs(3);

/// Run the daemon in the current process: take the lock, bind the socket,
/// serve until the last shell detaches or the grace period expires.
pub fn run_daemon(configuration: Configuration) -> anyhow::Result<()> {
    std::fs::create_dir_all(configuration.run_dir())?;
    std::fs::create_dir_all(configuration.log_dir())?;

    let lock_path = configuration.lock_file();
    let lock_file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(&lock_path)
        .with_context(|| format!("cannot open lock file {}", lock_path.display()))?;
    {
        use std::os::fd::AsRawFd;
        if unsafe { libc::flock(lock_file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } != 0 {
            anyhow::bail!(
                "daemon is already running (cannot lock {})",
                lock_path.display()
            );
        }
    }
    lock_file.set_len(0)?;
    (&lock_file).write_all(std::process::id().to_string().as_bytes())?;

    tracing::info!("starting daemon, version {}", env!("COD_BUILD_VERSION"));

    let socket_path = configuration.socket_file();
    // Stale socket cleanup; the lock guarantees no live daemon owns it.
    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("cannot listen on socket {}", socket_path.display()))?;
    listener.set_nonblocking(true)?;

    let daemon = Daemon::new(configuration.clone());
    {
        let configuration = configuration.clone();
        std::thread::Builder::new()
            .name("cod-trim-logs".into())
            .spawn(move || trim_logs(&configuration))?;
    }

    let started = Instant::now();
    let mut handlers: Vec<std::thread::JoinHandle<()>> = Vec::new();

    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                let daemon = Arc::clone(&daemon);
                handlers.push(std::thread::spawn(move || {
                    handle_connection(daemon, stream);
                }));
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                if daemon.shutting_down() {
                    tracing::info!("last shell detached, shutting down");
                    break;
                }
                if !daemon.is_initialized() && started.elapsed() > ATTACH_GRACE_PERIOD {
                    tracing::info!("no shell attached within grace period, exiting");
                    daemon.shutdown.store(true, Ordering::SeqCst);
                    break;
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(err) => {
                tracing::warn!("accept error: {err}");
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }

    // Close the listener before draining so no new client can sneak in.
    drop(listener);
    let _ = std::fs::remove_file(&socket_path);
    for handle in handlers {
        let _ = handle.join();
    }
    let watchers = std::mem::take(&mut *daemon.watchers.lock().unwrap());
    for handle in watchers {
        let _ = handle.join();
    }
    tracing::info!("daemon is exiting normally");
    Ok(())
}

fn handle_connection(daemon: Arc<Daemon>, stream: UnixStream) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(30)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(5)));

    let reader = match stream.try_clone() {
        Ok(clone) => BufReader::new(clone),
        Err(err) => {
            tracing::warn!("cannot clone connection: {err}");
            return;
        }
    };
    let mut writer = stream;

    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }
        let mut response = daemon.handle_request_line(&line);
        response.push('\n');
        if writer.write_all(response.as_bytes()).is_err() {
            break;
        }
        let _ = writer.flush();
    }
}

pub fn log_file_base_name(date: chrono::NaiveDate) -> String {
    format!("cod.{}.log", date.format("%Y-%m-%d"))
}

const MAX_LOG_COUNT: usize = 7;

/// Keep the newest `MAX_LOG_COUNT` daily log files, delete the rest.
fn trim_logs(configuration: &Configuration) {
    let log_re = regex::Regex::new(r"^cod\.\d{4}-\d{2}-\d{2}\.log$").unwrap();

    let log_dir = configuration.log_dir();
    let entries = match std::fs::read_dir(&log_dir) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::warn!("cannot read log directory: {err}");
            return;
        }
    };

    let mut log_files: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| !t.is_dir()).unwrap_or(false))
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| log_re.is_match(name))
        .collect();

    if log_files.len() <= MAX_LOG_COUNT {
        return;
    }
    log_files.sort();
    for name in &log_files[..log_files.len() - MAX_LOG_COUNT] {
        let path = log_dir.join(name);
        if let Err(err) = std::fs::remove_file(&path) {
            tracing::warn!("cannot remove old log file {}: {err}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let request = Request::AttachRequest(AttachRequest {
            pid: 42,
            shell: "bash".to_string(),
            cod_binary_path: "/usr/bin/cod".to_string(),
        });
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains(r#""Request":"AttachRequest""#), "{json}");
        assert!(json.contains(r#""Payload""#), "{json}");
        assert!(json.contains(r#""Pid":42"#), "{json}");

        let parsed: Request = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, Request::AttachRequest(r) if r.pid == 42));
    }

    #[test]
    fn test_unknown_request_name_is_error() {
        let parsed: Result<Request, _> =
            serde_json::from_str(r#"{"Request":"NoSuchRequest","Payload":{}}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_error_codes() {
        let err = anyhow::Error::from(BinaryNotFound("frob".into())).context("outer");
        assert_eq!(error_code(&err), BINARY_NOT_FOUND_ERROR);

        let err = anyhow::Error::from(NotImplemented("x".into()));
        assert_eq!(error_code(&err), NOT_IMPLEMENTED_ERROR);

        assert_eq!(error_code(&anyhow::anyhow!("boom")), GENERIC_ERROR);
    }

    #[test]
    fn test_envelope_round_trip() {
        let line = marshal_response(Ok(DetachResponse {}), Warner::default());
        let envelope: ResponseEnvelope = serde_json::from_str(&line).unwrap();
        assert!(envelope.error.is_none());
        assert!(envelope.warnings.is_none());

        let mut warner = Warner::default();
        warner.warn("careful");
        let line = marshal_response::<()>(Err(anyhow::anyhow!("boom")), warner);
        let envelope: ResponseEnvelope = serde_json::from_str(&line).unwrap();
        assert_eq!(envelope.error.as_ref().unwrap().code, GENERIC_ERROR);
        assert_eq!(envelope.warnings.unwrap().len(), 1);
    }

    #[test]
    fn test_context_applies() {
        let completion = Completion {
            flag: "--stdin".to_string(),
            context: crate::data::FlagContext {
                sub_command: vec!["rec".to_string()],
                framework: None,
            },
        };
        let words = |ws: &[&str]| ws.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert!(context_applies(&completion, &words(&["rec"])));
        assert!(context_applies(&completion, &words(&["-q", "rec", "x"])));
        assert!(!context_applies(&completion, &words(&["play"])));
        assert!(!context_applies(&completion, &words(&[])));

        let plain = Completion::flag("--help");
        assert!(context_applies(&plain, &words(&[])));
    }

    #[test]
    fn test_log_file_base_name() {
        let date = chrono::NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        assert_eq!(log_file_base_name(date), "cod.2024-03-09.log");
    }
}
