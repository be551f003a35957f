mod argparse;
mod default;
pub mod text;

use sha1::{Digest, Sha1};

use crate::data::{Completion, HelpPage};
use crate::util::hex_string;
use text::PreparedText;

pub struct ParseContext {
    pub args: Vec<String>,
    pub text: PreparedText,
}

#[derive(Debug, Default)]
pub struct ParseResult {
    pub completions: Vec<Completion>,
}

type ParserFn = fn(&ParseContext) -> anyhow::Result<ParseResult>;

// Tried in order; the first parser that accepts the text wins. `default`
// always succeeds, so the pipeline is total.
const PARSERS: &[(&str, ParserFn)] = &[("argparse", argparse::parse), ("default", default::parse)];

/// Turn raw help output into a help page for `args[0]`.
///
/// The caller is responsible for attaching the originating command.
pub fn parse_help(args: &[String], help: &str) -> HelpPage {
    assert!(!args.is_empty(), "args cannot be empty");

    let context = ParseContext {
        args: args.to_vec(),
        text: PreparedText::new(help),
    };

    let mut result = None;
    for (name, parser) in PARSERS {
        match parser(&context) {
            Ok(res) => {
                result = Some(res);
                break;
            }
            Err(err) => tracing::debug!("parser {name} failed: {err:#}"),
        }
    }
    let result = result.expect("the default parser accepts any help text");

    HelpPage {
        executable_path: args[0].clone(),
        completions: dedup_completions(result.completions),
        check_sum: hex_string(&Sha1::digest(help.as_bytes())),
        command: Default::default(),
    }
}

/// Parsers may report the same `(flag, context)` pair more than once when a
/// flag shows up in several paragraphs; only the first occurrence counts.
fn dedup_completions(completions: Vec<Completion>) -> Vec<Completion> {
    let mut seen: Vec<Completion> = Vec::with_capacity(completions.len());
    for completion in completions {
        if !seen.contains(&completion) {
            seen.push(completion);
        }
    }
    seen
}
