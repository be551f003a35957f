use std::io::{BufRead, BufReader, IsTerminal, Write};

/// Wrap `text` in green when stdout is a terminal.
pub fn green(text: &str) -> String {
    if std::io::stdout().is_terminal() {
        format!("\x1b[32m{text}\x1b[0m")
    } else {
        text.to_string()
    }
}

/// Read one answer from the controlling terminal; the first character of the
/// line must be one of `allowed`. Re-prompts with `> ` otherwise.
pub fn get_keystroke(allowed: &str) -> anyhow::Result<char> {
    let tty_in = std::fs::File::open("/dev/tty")?;
    let mut tty_out = std::fs::OpenOptions::new().write(true).open("/dev/tty")?;
    let mut reader = BufReader::new(tty_in);

    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            anyhow::bail!("terminal closed");
        }
        if let Some(c) = line.trim().chars().next() {
            if allowed.contains(c) {
                return Ok(c);
            }
        }
        write!(tty_out, "> ")?;
        tty_out.flush()?;
    }
}
