use std::io::Read;
use std::os::fd::FromRawFd;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};

use crate::data::Command;

/// Run the help command and capture interleaved stdout+stderr.
///
/// The child gets exactly the command's environment and working directory.
/// On timeout it is killed and reaped; timeouts and non-zero exits both
/// surface as errors carrying whatever output was produced.
pub fn run_command_captured(command: &Command, timeout: Duration) -> anyhow::Result<String> {
    if command.args.is_empty() {
        bail!("command is empty");
    }

    // One pipe shared by stdout and stderr keeps the streams interleaved the
    // way a terminal would show them.
    let mut fds = [0i32; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error()).context("cannot create pipe");
    }
    let (read_fd, write_fd) = (fds[0], fds[1]);
    let stdout_fd = unsafe { libc::dup(write_fd) };
    if stdout_fd < 0 {
        let err = std::io::Error::last_os_error();
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
        return Err(err).context("cannot dup pipe");
    }

    let mut child = std::process::Command::new(&command.args[0])
        .args(&command.args[1..])
        .env_clear()
        .envs(command.env.iter().filter_map(|e| e.split_once('=')))
        .current_dir(&command.dir)
        .stdin(Stdio::null())
        .stdout(unsafe { Stdio::from_raw_fd(stdout_fd) })
        .stderr(unsafe { Stdio::from_raw_fd(write_fd) })
        .spawn()
        .map_err(|err| {
            unsafe { libc::close(read_fd) };
            anyhow::Error::from(err).context(format!("cannot run {:?}", command.args[0]))
        })?;

    let reader = std::thread::spawn(move || {
        let mut file = unsafe { std::fs::File::from_raw_fd(read_fd) };
        let mut buf = Vec::new();
        let _ = file.read_to_end(&mut buf);
        buf
    });

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait()? {
            Some(status) => break Some(status),
            None if Instant::now() >= deadline => break None,
            None => std::thread::sleep(Duration::from_millis(10)),
        }
    };

    let status = match status {
        Some(status) => status,
        None => {
            child.kill().ok();
            child.wait()?;
            let output = reader.join().unwrap_or_default();
            bail!(
                "command timed out after {}ms: {}",
                timeout.as_millis(),
                String::from_utf8_lossy(&output)
            );
        }
    };

    let output = reader.join().unwrap_or_default();
    let output = String::from_utf8_lossy(&output).into_owned();
    if !status.success() {
        bail!("command failed ({status}): {output}");
    }
    Ok(output)
}
