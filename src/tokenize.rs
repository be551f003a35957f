use std::fmt;

// https://man7.org/linux/man-pages/man1/bash.1.html#RESERVED_WORDS
// Control operators such as `&&` are not reserved words.
const RESERVED_WORDS: &[&str] = &[
    "!", "case", "coproc", "do", "done", "elif", "else", "esac", "fi", "for", "function", "if",
    "in", "select", "then", "until", "while", "{", "}", "time", "[[", "]]",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub decoded: String,

    /// Byte range of the token in the original string.
    pub orig_begin: usize,
    pub orig_end: usize,

    /// Reserved word (`for`, `while`, `case`, ...).
    pub is_reserved: bool,

    /// Token could not be fully decoded (unterminated quote, trailing
    /// backslash, unsupported `$'...'` escape).
    pub is_broken: bool,

    /// Shell-special single character (`|`, `;`, backtick, ...). Commands
    /// containing scary tokens are too complex to reason about.
    pub is_scary: bool,
}

/// Split a shell command line into decoded words.
///
/// Quoting and escaping follow the bash rules for words; constructs the
/// tokenizer cannot decode mark the token broken instead of failing, so this
/// is total.
pub fn tokenize(command: &str) -> Vec<Token> {
    let mut t = Tokenizer {
        bytes: command.as_bytes(),
        pos: 0,
        builder: Vec::new(),
        begin: 0,
        non_empty: false,
        scary: false,
        broken: false,
        result: Vec::new(),
    };
    t.run();
    t.result
}

struct Tokenizer<'a> {
    bytes: &'a [u8],
    pos: usize,
    builder: Vec<u8>,
    begin: usize,
    non_empty: bool,
    scary: bool,
    broken: bool,
    result: Vec<Token>,
}

impl Tokenizer<'_> {
    fn next_byte(&mut self) -> Option<u8> {
        let b = self.bytes.get(self.pos).copied();
        if b.is_some() {
            self.pos += 1;
        }
        b
    }

    fn push(&mut self, b: u8) {
        self.builder.push(b);
    }

    /// Mark the current position as the token start if nothing has been
    /// consumed for it yet. `offset` steps back over bytes already read.
    fn touch(&mut self, offset: usize) {
        if self.builder.is_empty() && !self.non_empty {
            self.begin = self.pos - offset;
        }
    }

    fn emit_word(&mut self) {
        self.emit_word_at(self.pos);
    }

    fn emit_word_at(&mut self, end: usize) {
        if !self.builder.is_empty() || self.non_empty {
            let decoded = String::from_utf8_lossy(&self.builder).into_owned();
            let is_reserved = RESERVED_WORDS.contains(&decoded.as_str());
            self.result.push(Token {
                orig_begin: self.begin,
                orig_end: end,
                is_reserved,
                is_broken: self.broken,
                is_scary: self.scary,
                decoded,
            });
            self.builder.clear();
        }
        self.non_empty = false;
        self.scary = false;
        self.broken = false;
        self.begin = end;
    }

    fn run(&mut self) {
        while let Some(c) = self.next_byte() {
            match c {
                b'\\' => {
                    self.touch(1);
                    match self.next_byte() {
                        None => {
                            self.broken = true;
                            self.non_empty = true;
                            self.emit_word();
                            return;
                        }
                        Some(b'\n') => {} // line continuation
                        Some(c) => self.push(c),
                    }
                }
                b'\n' => {
                    self.emit_word_at(self.pos - 1);
                    self.touch(1);
                    self.push(b'\n');
                    self.emit_word();
                }
                b'\'' => {
                    self.touch(1);
                    if !self.parse_single_quote() {
                        return;
                    }
                }
                b'"' => {
                    self.touch(1);
                    if !self.parse_double_quote() {
                        return;
                    }
                }
                b' ' | b'\t' => self.emit_word_at(self.pos - 1),
                b'$' => {
                    self.touch(1);
                    match self.next_byte() {
                        None => self.push(b'$'),
                        Some(q @ (b'\'' | b'"')) => {
                            if !self.parse_ansi_string(q) {
                                return;
                            }
                        }
                        Some(_) => {
                            self.push(b'$');
                            self.pos -= 1;
                        }
                    }
                }
                b'|' | b'&' | b';' | b'(' | b')' | b'<' | b'>' | b'`' => {
                    self.emit_word_at(self.pos - 1);
                    self.touch(1);
                    self.scary = true;
                    self.push(c);
                    self.emit_word();
                }
                _ => {
                    self.touch(1);
                    self.push(c);
                }
            }
        }
        self.emit_word();
    }

    fn parse_single_quote(&mut self) -> bool {
        self.non_empty = true;
        loop {
            match self.next_byte() {
                None => {
                    self.broken = true;
                    self.emit_word();
                    return false;
                }
                Some(b'\'') => return true,
                Some(c) => self.push(c),
            }
        }
    }

    fn parse_double_quote(&mut self) -> bool {
        self.non_empty = true;
        loop {
            match self.next_byte() {
                None => {
                    self.broken = true;
                    self.emit_word();
                    return false;
                }
                Some(b'"') => return true,
                Some(b'\\') => match self.next_byte() {
                    None => {
                        self.broken = true;
                        self.emit_word();
                        return false;
                    }
                    Some(c @ (b'$' | b'`' | b'"' | b'\\')) => self.push(c),
                    Some(b'\n') => {} // line continuation
                    Some(c) => {
                        self.push(b'\\');
                        self.push(c);
                    }
                },
                Some(c) => self.push(c),
            }
        }
    }

    /// `$'...'` and `$"..."` with the C-style escapes bash documents. The
    /// numeric ones (`\x`, `\u`, `\U`, `\c`, octal) are not decoded; they
    /// mark the token broken instead.
    fn parse_ansi_string(&mut self, end: u8) -> bool {
        self.non_empty = true;
        loop {
            match self.next_byte() {
                None => {
                    self.broken = true;
                    self.emit_word();
                    return false;
                }
                Some(c) if c == end => return true,
                Some(b'\\') => {
                    if !self.parse_ansi_escape() {
                        return false;
                    }
                }
                Some(c) => self.push(c),
            }
        }
    }

    fn parse_ansi_escape(&mut self) -> bool {
        let Some(c) = self.next_byte() else {
            self.broken = true;
            self.emit_word();
            return false;
        };
        match c {
            b'\n' => {}
            b'a' => self.push(0x07),
            b'b' => self.push(0x08),
            b'e' | b'E' => self.push(0x1b),
            b'f' => self.push(0x0c),
            b'n' => self.push(b'\n'),
            b'r' => self.push(b'\r'),
            b't' => self.push(b'\t'),
            b'v' => self.push(0x0b),
            b'\\' => self.push(b'\\'),
            b'\'' => self.push(b'\''),
            b'"' => self.push(b'"'),
            b'?' => self.push(b'?'),
            b'0'..=b'8' | b'x' | b'u' | b'U' | b'c' => self.broken = true,
            c => self.push(c),
        }
        true
    }
}

/// Raised when a command is not a simple command (shell operators, multiple
/// logical commands, nothing to run). The daemon treats it as "silently skip".
#[derive(Debug)]
pub struct NotSimple(pub String);

impl fmt::Display for NotSimple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "command is not simple: {:?}", self.0)
    }
}

impl std::error::Error for NotSimple {}

fn is_variable_assignment(s: &str) -> bool {
    s.contains('=')
}

/// Split a command line into leading `KEY=VALUE` assignments and argv.
///
/// A command qualifies iff no token is scary, it holds a single logical
/// command, and at least one non-assignment word remains.
pub fn parse_simple_command(cmd: &str) -> Result<(Vec<String>, Vec<String>), NotSimple> {
    let tokens = tokenize(cmd);

    let mut env = Vec::new();
    let mut args: Vec<String> = Vec::new();
    let mut saw_command_break = false;

    for token in tokens {
        if token.is_scary {
            return Err(NotSimple(cmd.to_string()));
        }
        if token.decoded == "\n" {
            // Newline terminates the logical command; anything after it
            // makes the line a sequence of commands.
            saw_command_break = !args.is_empty() || !env.is_empty();
            continue;
        }
        if saw_command_break {
            return Err(NotSimple(cmd.to_string()));
        }
        if is_variable_assignment(&token.decoded) && args.is_empty() {
            env.push(token.decoded);
        } else {
            args.push(token.decoded);
        }
    }

    if args.is_empty() {
        return Err(NotSimple(cmd.to_string()));
    }

    Ok((env, args))
}
