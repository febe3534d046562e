//! Display-only transforms applied to streamed fragments before they reach
//! the render surface. The raw fragments kept for the context are never
//! touched by anything here.

use serde::{Deserialize, Serialize};

use crate::host::ControlExpander;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replacement {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayOptions {
    /// Characters removed from displayed text.
    #[serde(default = "default_strip_chars")]
    pub strip_chars: String,

    /// Literal substitutions, applied in order before stripping.
    #[serde(default)]
    pub replacements: Vec<Replacement>,

    /// Insert a line break after this many characters on a line. 0 = off.
    #[serde(default)]
    pub line_break_length: usize,

    /// Replacement for `\n` understood by the host (e.g. `<br>`).
    #[serde(default)]
    pub newline: Option<String>,

    /// Expand host escapes (`\V[n]` and friends) in displayed text.
    #[serde(default)]
    pub expand_escapes: bool,
}

fn default_strip_chars() -> String {
    "「」".to_string()
}

impl Default for DisplayOptions {
    fn default() -> Self {
        Self {
            strip_chars: default_strip_chars(),
            replacements: Vec::new(),
            line_break_length: 0,
            newline: None,
            expand_escapes: false,
        }
    }
}

/// Longest escape token still being held back. Anything longer is released
/// as plain text.
const MAX_HELD_ESCAPE: usize = 32;

/// Stateful per-answer transform. Line breaking counts columns across
/// fragments, and a token split between two fragments is held back until it
/// is complete, so one pipeline must be used for the whole answer and
/// [`DisplayPipeline::finish`] called once it ends.
pub struct DisplayPipeline<'a> {
    options: &'a DisplayOptions,
    expander: &'a dyn ControlExpander,
    column: usize,
    held: String,
}

impl<'a> DisplayPipeline<'a> {
    pub fn new(options: &'a DisplayOptions, expander: &'a dyn ControlExpander) -> Self {
        Self {
            options,
            expander,
            column: 0,
            held: String::new(),
        }
    }

    pub fn apply(&mut self, fragment: &str) -> String {
        let mut text = std::mem::take(&mut self.held);
        text.push_str(fragment);

        let keep = self.partial_token_len(&text);
        self.held = text.split_off(text.len() - keep);
        self.transform(&text)
    }

    /// Flush whatever is still held back at the end of the answer.
    pub fn finish(&mut self) -> String {
        let text = std::mem::take(&mut self.held);
        self.transform(&text)
    }

    /// Byte length of the trailing text that may be the start of a
    /// replacement or an escape continued by the next fragment.
    fn partial_token_len(&self, text: &str) -> usize {
        let mut keep = 0;
        for r in &self.options.replacements {
            for (end, _) in r.from.char_indices().skip(1) {
                if end > keep && text.ends_with(&r.from[..end]) {
                    keep = end;
                }
            }
        }
        if self.options.expand_escapes {
            if let Some(start) = incomplete_escape_start(text) {
                keep = keep.max(text.len() - start);
            }
        }
        keep
    }

    fn transform(&mut self, fragment: &str) -> String {
        if fragment.is_empty() {
            return String::new();
        }
        let mut text = fragment.to_string();
        for r in &self.options.replacements {
            if !r.from.is_empty() {
                text = text.replace(&r.from, &r.to);
            }
        }
        if !self.options.strip_chars.is_empty() {
            text.retain(|c| !self.options.strip_chars.contains(c));
        }

        if self.options.line_break_length > 0 {
            text = self.break_lines(&text);
        }

        if let Some(newline) = &self.options.newline {
            text = text.replace('\n', newline);
        }

        if self.options.expand_escapes {
            text = self.expander.expand(&text);
        }

        text
    }

    fn break_lines(&mut self, text: &str) -> String {
        let width = self.options.line_break_length;
        let mut out = String::with_capacity(text.len() + text.len() / width.max(1));
        for c in text.chars() {
            if c == '\n' {
                self.column = 0;
                out.push(c);
                continue;
            }
            if self.column == width {
                out.push('\n');
                self.column = 0;
            }
            out.push(c);
            self.column += 1;
        }
        out
    }
}

/// Hard-wrap text every `width` characters. Existing newlines are kept.
pub fn wrap(text: &str, width: usize) -> String {
    if width == 0 {
        return text.to_string();
    }
    let options = DisplayOptions {
        strip_chars: String::new(),
        line_break_length: width,
        ..DisplayOptions::default()
    };
    let mut pipeline = DisplayPipeline::new(&options, &crate::host::NoExpansion);
    let mut out = pipeline.apply(text);
    out.push_str(&pipeline.finish());
    out
}

/// Start of a trailing escape that is not complete yet: a lone `\`, a
/// `\V`/`\N`/`\P` without its bracket, or a bracket still open.
fn incomplete_escape_start(text: &str) -> Option<usize> {
    let window = text.len().saturating_sub(MAX_HELD_ESCAPE);
    text.match_indices('\\')
        .map(|(i, _)| i)
        .filter(|&i| i >= window)
        .find(|&i| is_open_escape(&text[i + 1..]))
}

fn is_open_escape(rest: &str) -> bool {
    let mut chars = rest.chars();
    match chars.next() {
        None => true,
        Some(c) if matches!(c.to_ascii_uppercase(), 'V' | 'N' | 'P') => {
            let rest = chars.as_str();
            if rest.is_empty() {
                return true;
            }
            if !rest.starts_with('[') {
                return false;
            }
            let mut depth = 0usize;
            for c in rest.chars() {
                match c {
                    '[' => depth += 1,
                    ']' => {
                        depth -= 1;
                        if depth == 0 {
                            return false;
                        }
                    }
                    _ => {}
                }
            }
            true
        }
        Some(_) => false,
    }
}
