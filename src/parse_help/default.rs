use std::sync::LazyLock;

use regex::Regex;

use crate::data::{base_name, Completion, FlagContext};
use crate::parse_help::text::{compute_indent, PreparedText};
use crate::parse_help::{ParseContext, ParseResult};

// Language-agnostic fallback: scrape flag-looking tokens, then look for
// `commands:` paragraphs and a usage line naming the sub-command.

static FLAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[\s\[|])(-[-\w]+=?)").unwrap());
static COMBINED_SHORT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^-\w{2,}$").unwrap());
static SUB_COMMAND_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\s*(\w[-\w]*)").unwrap());
static WORD_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\w[-\w]*$").unwrap());

fn extract_flags(text: &PreparedText) -> Vec<String> {
    let mut flags: Vec<String> = Vec::new();
    for line in &text.lines {
        for caps in FLAG_RE.captures_iter(line) {
            let flag = caps[1].to_string();
            if !flags.contains(&flag) {
                flags.push(flag);
            }
        }
    }

    // If any long option shows up the help is GNU-like and multi-letter
    // short tokens (`-vET`, `-xzf`) are combined-usage examples, not flags.
    // Java-like pages (no long options) keep them.
    let gnu_like = flags.iter().any(|f| f.starts_with("--"));
    if gnu_like {
        flags.retain(|f| !COMBINED_SHORT_RE.is_match(f));
    }
    flags
}

fn extract_sub_commands(text: &PreparedText) -> Vec<String> {
    #[derive(PartialEq)]
    enum State {
        Outer,
        FirstLineInside,
        Inside,
    }

    let mut sub_commands = Vec::new();
    let mut state = State::Outer;
    let mut prev_indent: i64 = -1;
    let mut paragraph_indent: i64 = 0;

    for line in &text.lines {
        let indent = compute_indent(line);
        match state {
            State::Outer => {
                if indent == 0 && line.trim_end().to_lowercase().ends_with("commands:") {
                    state = State::FirstLineInside;
                }
            }
            State::FirstLineInside | State::Inside => {
                if state == State::FirstLineInside {
                    if indent <= prev_indent {
                        state = State::Outer;
                        prev_indent = indent;
                        continue;
                    }
                    paragraph_indent = indent;
                    state = State::Inside;
                }
                if indent == paragraph_indent {
                    match SUB_COMMAND_RE.captures(line) {
                        Some(caps) => sub_commands.push(caps[1].to_string()),
                        None => state = State::Outer,
                    }
                } else if indent < paragraph_indent {
                    state = State::Outer;
                }
                // indent > paragraph_indent is help-text continuation.
            }
        }
        prev_indent = indent;
    }
    sub_commands
}

/// Read the sub-command path off the usage paragraph: `usage: app sub ...`
/// where every sub word also appears in the invocation argv, in order. A
/// second occurrence of the application name means a multi-command usage
/// block, which tells us nothing about the current invocation.
fn parse_usage_sub_command(args: &[String], text: &PreparedText) -> Vec<String> {
    let Some(usage_line) = text.find_line(0, |l| l.trim_start().to_lowercase().starts_with("usage"))
    else {
        return Vec::new();
    };
    let usage_end = text.paragraph_end(usage_line);

    let mut words: Vec<&str> = Vec::new();
    for (idx, line) in text.lines[usage_line..usage_end].iter().enumerate() {
        let line = if idx == 0 {
            let lower = line.to_lowercase();
            let after = lower.find("usage").map(|p| p + "usage".len()).unwrap_or(0);
            line[after..].trim_start_matches(':')
        } else {
            line.as_str()
        };
        words.extend(line.split_whitespace());
    }

    let app = base_name(&args[0]);
    let Some((first, rest)) = words.split_first() else {
        return Vec::new();
    };
    if *first != app {
        return Vec::new();
    }
    if rest.contains(&app) {
        return Vec::new();
    }

    let mut sub_command = Vec::new();
    let mut next_arg = 1;
    for word in rest {
        if !WORD_RE.is_match(word) {
            break;
        }
        match args[next_arg..].iter().position(|a| a == word) {
            Some(offset) => {
                next_arg += offset + 1;
                sub_command.push((*word).to_string());
            }
            None => break,
        }
    }
    sub_command
}

pub fn parse(context: &ParseContext) -> anyhow::Result<ParseResult> {
    let flag_context = FlagContext {
        sub_command: parse_usage_sub_command(&context.args, &context.text),
        framework: None,
    };

    let mut res = ParseResult::default();
    for flag in extract_flags(&context.text) {
        res.completions.push(Completion {
            flag,
            context: flag_context.clone(),
        });
    }
    for sub_command in extract_sub_commands(&context.text) {
        res.completions.push(Completion {
            flag: sub_command,
            context: flag_context.clone(),
        });
    }
    Ok(res)
}
