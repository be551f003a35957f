use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use serde::de::DeserializeOwned;

use crate::config::Configuration;
use crate::daemon::{log_file_base_name, Request, ResponseEnvelope};

/// Thin newline-JSON client over the daemon's unix socket. One instance per
/// CLI invocation; requests on a connection are answered in order.
pub struct Client {
    writer: UnixStream,
    reader: BufReader<UnixStream>,
}

fn dial(socket_path: &Path) -> anyhow::Result<UnixStream> {
    // The daemon may still be binding its socket right after spawn.
    let mut last_err = None;
    for _ in 0..20 {
        match UnixStream::connect(socket_path) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    Err(last_err.unwrap())
        .with_context(|| format!("cannot connect to daemon at {}", socket_path.display()))
}

impl Client {
    pub fn new(configuration: &Configuration) -> anyhow::Result<Client> {
        let stream = dial(&configuration.socket_file())?;
        stream.set_write_timeout(Some(Duration::from_secs(5)))?;
        stream.set_read_timeout(Some(Duration::from_secs(30)))?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Client {
            writer: stream,
            reader,
        })
    }

    pub fn request<R: DeserializeOwned>(&mut self, request: &Request) -> anyhow::Result<R> {
        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes())?;
        self.writer.flush()?;

        let mut response_line = String::new();
        self.reader
            .read_line(&mut response_line)
            .context("cannot read server response")?;
        if response_line.is_empty() {
            anyhow::bail!("daemon closed the connection");
        }

        let envelope: ResponseEnvelope = serde_json::from_str(response_line.trim_end())?;
        for warning in envelope.warnings.unwrap_or_default() {
            tracing::warn!("{}", warning.warning);
        }
        if let Some(error) = envelope.error {
            return Err(error.into());
        }
        Ok(serde_json::from_value(envelope.response)?)
    }
}

/// Make sure a daemon is running, spawning one when the lockfile is free.
/// The flock probe never blocks; a held lock means a live daemon.
pub fn ensure_daemon_running(configuration: &Configuration) -> anyhow::Result<()> {
    if daemon_is_running(configuration)? {
        return Ok(());
    }
    spawn_daemon(configuration)
}

fn daemon_is_running(configuration: &Configuration) -> anyhow::Result<bool> {
    use std::os::fd::AsRawFd;

    let lock_path = configuration.lock_file();
    let file = match std::fs::File::open(&lock_path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err.into()),
    };

    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
        return Ok(false);
    }
    let errno = std::io::Error::last_os_error();
    if errno.raw_os_error() == Some(libc::EWOULDBLOCK) {
        return Ok(true);
    }
    Err(errno.into())
}

fn spawn_daemon(configuration: &Configuration) -> anyhow::Result<()> {
    use std::os::unix::process::CommandExt;

    std::fs::create_dir_all(configuration.log_dir())?;
    std::fs::create_dir_all(configuration.run_dir())?;

    let log_path = configuration
        .log_dir()
        .join(log_file_base_name(chrono::Local::now().date_naive()));
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let executable = std::env::current_exe()?;
    let mut command = std::process::Command::new(&executable);
    command
        .args(["daemon", "--foreground"])
        .current_dir("/")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::from(log_file));
    unsafe {
        command.pre_exec(|| {
            // Detach from the shell's session so signals aimed at the
            // pipeline never reach the daemon.
            libc::setsid();
            Ok(())
        });
    }
    command
        .spawn()
        .with_context(|| format!("cannot spawn daemon {}", executable.display()))?;
    Ok(())
}
