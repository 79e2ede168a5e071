//! Numbered-output contract: items go out as `1. ...`, `2. ...` and the
//! reply must carry exactly one line per index.

use std::sync::LazyLock;

use regex::Regex;

use super::BatchItem;

static NUMBERED_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(\d+)\s*[.)）:：．、]\s?(.*)$").expect("invalid numbered line regex")
});

pub const SYSTEM_PROMPT: &str =
    "You are a translator for comic and web page text. Output only the translations, nothing else.";

/// Build the user prompt for a batch.
pub fn build_prompt(items: &[BatchItem], target_lang: &str, strict: bool) -> String {
    let mut prompt = format!(
        "Translate each numbered line into {target_lang}. Reply with exactly {} lines, \
         each starting with its number and a period.",
        items.len()
    );
    if items.iter().any(|i| i.context.is_some()) {
        prompt.push_str(" Text in «» is preceding context; do not translate it.");
    }
    if strict {
        prompt.push_str(
            " Every number must appear once, in order, with a non-empty translation. \
             Do not merge, skip or add lines. Do not copy the source text.",
        );
    }
    prompt.push('\n');
    for (i, item) in items.iter().enumerate() {
        prompt.push_str(&format!("{}. ", i + 1));
        if let Some(context) = &item.context {
            prompt.push_str(&format!("«{}» ", single_line(context)));
        }
        prompt.push_str(&single_line(&item.text));
        prompt.push('\n');
    }
    prompt
}

/// Parse a numbered reply into exactly `expected` slots. Missing indices are
/// left empty; unnumbered lines continue the previous item.
pub fn parse_numbered(reply: &str, expected: usize) -> Vec<String> {
    let mut out = vec![String::new(); expected];
    let mut current: Option<usize> = None;
    for line in reply.lines() {
        if let Some(caps) = NUMBERED_LINE.captures(line) {
            let index = caps[1].parse::<usize>().unwrap_or(0);
            if (1..=expected).contains(&index) && out[index - 1].is_empty() {
                out[index - 1] = caps[2].trim().to_string();
                current = Some(index - 1);
            } else {
                // Out of range or repeated: drop it and what follows it.
                current = None;
            }
            continue;
        }
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if let Some(idx) = current {
            if !out[idx].is_empty() {
                out[idx].push(' ');
            }
            out[idx].push_str(text);
        }
    }
    out
}

/// Output allowance for a call: about 1.5 tokens per source character plus a
/// per-line margin, grown by `strict_growth` for strict retries.
pub fn max_output_tokens(items: &[BatchItem], strict: bool, strict_growth: f32) -> u32 {
    let chars: usize = items.iter().map(|i| i.text.chars().count()).sum();
    let base = chars as f64 * 1.5 + items.len() as f64 * 8.0 + 32.0;
    let grown = if strict {
        base * strict_growth.max(1.0) as f64
    } else {
        base
    };
    (grown as u32).clamp(64, 8192)
}

fn single_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
