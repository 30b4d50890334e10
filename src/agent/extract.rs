//! Pull runnable Python out of a model reply
//!
//! Tagged blocks (```` ```python ````, `py`, `python3`) always win. Untagged
//! blocks are a fallback and must look like code; blocks tagged with any other
//! language are ignored.

use lazy_static::lazy_static;
use regex::Regex;

const FENCE: &str = "```";
const SCRIPT_TAGS: [&str; 3] = ["python", "py", "python3"];

lazy_static! {
    static ref CODE_HINT: Regex =
        Regex::new(r"\bimport\b|\bdef\b|\bprint\s*\(|=").expect("code hint pattern is valid");
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FencedBlock {
    info: String,
    body: String,
}

impl FencedBlock {
    fn is_tagged(&self) -> bool {
        let lang = self
            .info
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        SCRIPT_TAGS.contains(&lang.as_str())
    }

    fn is_untagged(&self) -> bool {
        self.info.is_empty()
    }
}

/// Split `text` into fenced blocks and the narrative around them
fn scan(text: &str) -> (Vec<FencedBlock>, String) {
    let mut blocks = Vec::new();
    let mut narrative = Vec::new();
    let mut open: Option<(String, Vec<&str>)> = None;

    for line in text.lines() {
        let trimmed = line.trim();
        match open.take() {
            None => {
                if let Some(info) = trimmed.strip_prefix(FENCE) {
                    open = Some((info.trim().to_string(), Vec::new()));
                } else {
                    narrative.push(line);
                }
            }
            Some((info, mut body)) => {
                if trimmed == FENCE {
                    blocks.push(FencedBlock {
                        info,
                        body: body.join("\n"),
                    });
                } else {
                    body.push(line);
                    open = Some((info, body));
                }
            }
        }
    }

    // an unclosed fence runs to the end of the text
    if let Some((info, body)) = open {
        blocks.push(FencedBlock {
            info,
            body: body.join("\n"),
        });
    }

    (blocks, narrative.join("\n"))
}

fn join_bodies<'a>(blocks: impl Iterator<Item = &'a FencedBlock>) -> String {
    blocks
        .map(|block| block.body.trim())
        .filter(|body| !body.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Combined script from a model reply, or `None` when there is nothing to run
pub fn extract_script(text: &str) -> Option<String> {
    let (blocks, _) = scan(text);

    let tagged = join_bodies(blocks.iter().filter(|b| b.is_tagged()));
    if !tagged.is_empty() {
        return Some(tagged);
    }

    let untagged = join_bodies(blocks.iter().filter(|b| b.is_untagged()));
    if !untagged.is_empty() && CODE_HINT.is_match(&untagged) {
        return Some(untagged);
    }

    None
}

/// The reply with every fenced block removed
pub fn strip_code_blocks(text: &str) -> String {
    let (_, narrative) = scan(text);
    narrative.trim().to_string()
}
