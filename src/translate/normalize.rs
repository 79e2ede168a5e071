//! Source text preparation and target-language validity checks.
//! Outputs are judged by script, not by language: a reply to an English
//! target must contain Latin letters and must not carry leaked source-script
//! fragments.

use serde::Serialize;

use crate::config::{Script, TranslationConfig};

/// Result of checking one provider output against its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputCheck {
    Valid,
    Empty,
    /// Source has letters but the output has no target-script character.
    MissingTargetScript,
    /// Output still contains source-script characters.
    LeakedSourceScript,
}

impl OutputCheck {
    pub fn is_valid(self) -> bool {
        self == OutputCheck::Valid
    }
}

#[derive(Debug, Clone)]
pub struct ScriptValidator {
    target: Script,
    sources: Vec<Script>,
}

impl ScriptValidator {
    pub fn new(target: Script, sources: Vec<Script>) -> Self {
        let sources = sources.into_iter().filter(|s| *s != target).collect();
        Self { target, sources }
    }

    pub fn from_config(config: &TranslationConfig) -> Self {
        Self::new(config.target_script, config.source_scripts.clone())
    }

    pub fn check(&self, source: &str, output: &str) -> OutputCheck {
        let output = output.trim();
        if output.is_empty() {
            return OutputCheck::Empty;
        }
        if self.is_corrupted(output) {
            return OutputCheck::LeakedSourceScript;
        }
        let source_has_letters = source.chars().any(char::is_alphabetic);
        if source_has_letters && !output.chars().any(|c| self.target.contains(c)) {
            return OutputCheck::MissingTargetScript;
        }
        OutputCheck::Valid
    }

    /// Whether `text` contains fragments of any source script.
    pub fn is_corrupted(&self, text: &str) -> bool {
        text.chars()
            .any(|c| self.sources.iter().any(|script| script.contains(c)))
    }
}

/// Collapse whitespace runs, including line breaks between fused lines.
pub fn prepare(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Text with nothing to translate: punctuation, symbols or digits only.
/// Its translation is legitimately empty.
pub fn is_blank(text: &str) -> bool {
    !text.chars().any(char::is_alphabetic)
}

/// Tail of the preceding region's text, used as reference context.
pub fn context_snippet(previous: &str, max_chars: usize) -> Option<String> {
    if max_chars == 0 {
        return None;
    }
    let prepared = prepare(previous);
    if prepared.is_empty() {
        return None;
    }
    let count = prepared.chars().count();
    Some(prepared.chars().skip(count.saturating_sub(max_chars)).collect())
}
