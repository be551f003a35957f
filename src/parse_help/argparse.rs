use std::sync::LazyLock;

use anyhow::{bail, Context as _};
use regex::Regex;

use crate::data::{base_name, Completion, FlagContext};
use crate::parse_help::text::LineTree;
use crate::parse_help::{ParseContext, ParseResult};

// Python argparse help: a `usage:` paragraph describing the groups, then
// `positional arguments:` / `optional arguments:` / `options:` paragraphs.

static USAGE_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[-_/.a-zA-Z0-9]+").unwrap());

const ARG_WORD: &str = "[_a-zA-Z0-9][-_a-zA-Z0-9]*";

static FLAGS_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!("^ +-{{1,2}}{ARG_WORD}")).unwrap());
static FLAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!("-{{1,2}}{ARG_WORD}")).unwrap());
static ARG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"^\s*({ARG_WORD})(,|\s|$)")).unwrap());
static UNNAMED_SEQUENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"^\s*\{{{ARG_WORD}(,{ARG_WORD})*\}}$")).unwrap());

struct UsageLexer {
    cur_token: String,
    cur_is_syntax: bool,
    cur_line: String,
    rest_lines: Vec<String>,
    next_rest: usize,
    valid: bool,
    err: Option<String>,
}

impl UsageLexer {
    /// `usage` is the usage paragraph; the first line contains `usage:` in
    /// some capitalization.
    fn new(usage: &[String]) -> anyhow::Result<UsageLexer> {
        let first = &usage[0];
        let marker = first
            .to_lowercase()
            .find("usage:")
            .context("usage line lost its marker")?;
        Ok(UsageLexer {
            cur_token: String::new(),
            cur_is_syntax: false,
            cur_line: first[marker + "usage:".len()..].to_string(),
            rest_lines: usage[1..].to_vec(),
            next_rest: 0,
            valid: true,
            err: None,
        })
    }

    fn abort(&mut self, err: String) {
        self.err = Some(err);
        self.valid = false;
    }

    fn skip_spaces(&mut self) {
        while self.valid {
            self.cur_line = self.cur_line.trim().to_string();
            if !self.cur_line.is_empty() {
                return;
            }
            if self.next_rest < self.rest_lines.len() {
                self.cur_line = self.rest_lines[self.next_rest].clone();
                self.next_rest += 1;
            } else {
                self.valid = false;
            }
        }
    }

    fn next(&mut self) -> bool {
        self.skip_spaces();
        if !self.valid {
            return false;
        }
        let first = self.cur_line.as_bytes()[0];
        if matches!(first, b'{' | b'}' | b'|' | b'[' | b']' | b',') {
            self.cut_token(1, true);
            return true;
        }
        if let Some(m) = USAGE_TOKEN_RE.find(&self.cur_line) {
            let len = m.end();
            self.cut_token(len, false);
            return true;
        }
        self.abort(format!("cannot tokenize: {}", self.cur_line));
        false
    }

    fn cut_token(&mut self, len: usize, is_syntax: bool) {
        self.cur_token = self.cur_line[..len].to_string();
        self.cur_line = self.cur_line[len..].to_string();
        self.cur_is_syntax = is_syntax;
    }

    fn token(&self) -> &str {
        &self.cur_token
    }

    fn take_err(&mut self) -> Option<String> {
        self.err.take()
    }
}

struct ArgparseUsage {
    application_name: String,
    positional_argument_names: Vec<String>,
    /// Members of top-level `{a,b,c}` choice groups. Recorded while parsing
    /// the usage but completions for them come from the argument paragraphs.
    #[allow(dead_code)]
    choice_group_members: Vec<String>,
    flag_context: FlagContext,
}

fn parse_usage(lexer: &mut UsageLexer) -> anyhow::Result<ArgparseUsage> {
    if !lexer.next() {
        bail!(lexer
            .take_err()
            .unwrap_or_else(|| "bad usage: cannot find application name".into()));
    }
    let mut usage = ArgparseUsage {
        application_name: lexer.token().to_string(),
        positional_argument_names: Vec::new(),
        choice_group_members: Vec::new(),
        flag_context: FlagContext {
            sub_command: Vec::new(),
            framework: Some("argparse".to_string()),
        },
    };

    // Sub-command words run from the application name up to the first
    // syntax token.
    lexer.next();
    loop {
        if !lexer.valid {
            bail!(lexer
                .take_err()
                .unwrap_or_else(|| "cannot find any group in usage".into()));
        }
        if lexer.cur_is_syntax {
            break;
        }
        usage.flag_context.sub_command.push(lexer.token().to_string());
        lexer.next();
    }

    while lexer.valid {
        parse_group(lexer, &mut usage)?;
    }
    if let Some(err) = lexer.take_err() {
        bail!(err);
    }
    Ok(usage)
}

fn parse_group(lexer: &mut UsageLexer, usage: &mut ArgparseUsage) -> anyhow::Result<()> {
    if !lexer.cur_is_syntax {
        usage
            .positional_argument_names
            .push(lexer.token().to_string());
        lexer.next();
        return Ok(());
    }
    match lexer.token() {
        "{" => parse_choice_group(lexer, usage),
        "[" => parse_optional_group(lexer),
        _ => bail!("bad token in usage: {:?}", lexer.cur_line),
    }
}

fn parse_optional_group(lexer: &mut UsageLexer) -> anyhow::Result<()> {
    lexer.next();
    loop {
        if !lexer.valid {
            bail!(lexer
                .take_err()
                .unwrap_or_else(|| "unexpected end of usage while parsing optional group".into()));
        }
        match lexer.token() {
            "[" => bail!("optional group cannot be nested"),
            "]" => break,
            _ => {}
        }
        lexer.next();
    }
    lexer.next();
    Ok(())
}

fn parse_choice_group(lexer: &mut UsageLexer, usage: &mut ArgparseUsage) -> anyhow::Result<()> {
    lexer.next();
    loop {
        if !lexer.valid {
            bail!(lexer
                .take_err()
                .unwrap_or_else(|| "unexpected end of usage while parsing choice group".into()));
        }
        if !lexer.cur_is_syntax {
            usage.choice_group_members.push(lexer.token().to_string());
        } else {
            match lexer.token() {
                "," => {}
                "{" => bail!("choice group cannot be nested"),
                "}" => break,
                other => bail!("unexpected token {other:?} in choice group"),
            }
        }
        lexer.next();
    }
    lexer.next();
    Ok(())
}

fn try_parse_flags_paragraph(
    par: &LineTree,
    usage: &ArgparseUsage,
    res: &mut ParseResult,
) -> bool {
    if par.children.is_empty() || !FLAGS_LINE_RE.is_match(&par.children[0].line) {
        return false;
    }
    for child in &par.children {
        for flag in FLAG_RE.find_iter(&child.line) {
            res.completions.push(Completion {
                flag: flag.as_str().to_string(),
                context: usage.flag_context.clone(),
            });
        }
    }
    true
}

fn extract_positional_args(par: &LineTree, usage: &ArgparseUsage, res: &mut ParseResult) -> bool {
    let mut completions = Vec::new();
    for child in &par.children[0].children {
        let Some(caps) = ARG_RE.captures(&child.line) else {
            return false;
        };
        completions.push(Completion {
            flag: caps[1].to_string(),
            context: usage.flag_context.clone(),
        });
    }
    res.completions.append(&mut completions);
    true
}

fn try_parse_named_positional_paragraph(
    par: &LineTree,
    usage: &ArgparseUsage,
    res: &mut ParseResult,
) -> bool {
    if par.children.len() != 1 {
        return false;
    }
    let Some(caps) = ARG_RE.captures(&par.children[0].line) else {
        return false;
    };
    let arg_name = &caps[1];
    if !usage
        .positional_argument_names
        .iter()
        .any(|n| n == arg_name)
    {
        return false;
    }
    extract_positional_args(par, usage, res)
}

fn try_parse_unnamed_positional_paragraph(
    par: &LineTree,
    usage: &ArgparseUsage,
    res: &mut ParseResult,
) -> bool {
    if par.children.len() != 1 {
        return false;
    }
    if !UNNAMED_SEQUENCE_RE.is_match(&par.children[0].line) {
        return false;
    }
    extract_positional_args(par, usage, res)
}

fn is_arguments_header(line: &str) -> bool {
    let trimmed = line.trim().to_lowercase();
    trimmed.ends_with("arguments:") || trimmed.ends_with("options:")
}

pub fn parse(context: &ParseContext) -> anyhow::Result<ParseResult> {
    let usage_start = context
        .text
        .find_line(0, |l| !l.trim().is_empty())
        .filter(|&idx| {
            context.text.lines[idx]
                .trim_start()
                .to_lowercase()
                .starts_with("usage:")
        })
        .context("cannot find usage at the beginning, doesn't look like argparse")?;

    let usage_end = context.text.paragraph_end(usage_start);
    let mut lexer = UsageLexer::new(&context.text.lines[usage_start..usage_end])?;
    let usage = parse_usage(&mut lexer).context("error parsing usage")?;

    if base_name(&usage.application_name) != base_name(&context.args[0]) {
        bail!("application in usage doesn't match provided application");
    }

    let mut res = ParseResult::default();
    let mut start = 0;
    while let Some(par) = context
        .text
        .find_indented_paragraph(is_arguments_header, start)
    {
        start = par.line_end;
        if par.children.is_empty() {
            continue;
        }
        let _ = try_parse_flags_paragraph(&par, &usage, &mut res)
            || try_parse_named_positional_paragraph(&par, &usage, &mut res)
            || try_parse_unnamed_positional_paragraph(&par, &usage, &mut res);
    }

    Ok(res)
}
