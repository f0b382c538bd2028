//! Prompt detection for supervised script output.
//!
//! Update scripts ask for confirmation in colorized text such as
//! `⚠ Backup? [Y/n]:` with no structured protocol around it. Detection runs on
//! the text left after ANSI escapes and decorative glyphs are stripped, against
//! a configurable set of case-insensitive patterns.
//!
//! ## Design notes
//!
//! Some copies of the update scripts carry the warning glyph mis-encoded
//! (`â š` instead of `⚠`). Both spellings are treated as decoration and
//! removed, so patterns never have to mention either glyph.

use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};

/// Default confirmation pattern used by the Saturn and piHPSDR update scripts.
pub const BACKUP_PROMPT_PATTERN: &str = r"backup\?\s*\[?\s*y\s*/\s*n\s*\]?";

/// A detected prompt and the text that matched.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedPrompt {
    /// Source of the pattern that matched.
    pub pattern: String,
    /// The matched slice of the cleaned line.
    pub matched_text: String,
    /// The full line after ANSI and glyph stripping.
    pub line: String,
}

/// Compiled prompt detection patterns.
#[derive(Debug, Clone)]
pub struct PromptPatterns {
    patterns: Vec<Regex>,
}

impl PromptPatterns {
    /// Compile a pattern set. Every pattern is matched case-insensitively.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, regex::Error> {
        let patterns = patterns
            .iter()
            .map(|p| RegexBuilder::new(p.as_ref()).case_insensitive(true).build())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// The backup confirmation asked by the update scripts.
    pub fn backup() -> Self {
        Self {
            patterns: vec![
                RegexBuilder::new(BACKUP_PROMPT_PATTERN)
                    .case_insensitive(true)
                    .build()
                    .expect("backup prompt pattern is valid"),
            ],
        }
    }

    /// Patterns that never match. Used for runs that must not stop for input.
    pub fn none() -> Self {
        Self { patterns: vec![] }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Scan a raw (possibly colorized) line for a prompt.
    /// Returns the first match found.
    pub fn detect(&self, raw: &str) -> Option<DetectedPrompt> {
        if self.patterns.is_empty() {
            return None;
        }
        let cleaned = clean_line(raw);
        for regex in &self.patterns {
            if let Some(m) = regex.find(&cleaned) {
                return Some(DetectedPrompt {
                    pattern: regex.as_str().to_string(),
                    matched_text: m.as_str().to_string(),
                    line: cleaned.clone(),
                });
            }
        }
        None
    }

    /// True when `raw` contains a prompt.
    pub fn scan(&self, raw: &str) -> bool {
        self.detect(raw).is_some()
    }
}

impl Default for PromptPatterns {
    fn default() -> Self {
        Self::backup()
    }
}

/// Strip ANSI escapes and decorative glyphs, then trim.
pub fn clean_line(raw: &str) -> String {
    strip_decorations(&strip_ansi(raw)).trim().to_string()
}

/// Strip ANSI escape sequences from script output.
pub fn strip_ansi(input: &str) -> String {
    // CSI sequences (ESC [ ... final byte), OSC sequences (ESC ] ... ST),
    // and simple two-byte escapes (ESC + one char).
    static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[^\[\]]")
            .expect("ansi pattern is valid")
    });
    ANSI_RE.replace_all(input, "").into_owned()
}

/// Remove status glyphs the scripts decorate their output with.
pub fn strip_decorations(input: &str) -> String {
    // Misc symbols and dingbats (⚠ ✔ ✗ ...), variation selector, bullets,
    // and the cp1252 mis-decoding of U+26A0.
    static GLYPH_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"[\u{2600}-\u{27BF}\u{2022}\u{25BA}\u{FE0F}]|â\s?š\u{A0}?")
            .expect("glyph pattern is valid")
    });
    GLYPH_RE.replace_all(input, "").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── ANSI stripping ──

    #[test]
    fn strip_ansi_removes_csi() {
        let input = "\x1b[31mERROR\x1b[0m: something broke";
        assert_eq!(strip_ansi(input), "ERROR: something broke");
    }

    #[test]
    fn strip_ansi_removes_osc() {
        let input = "\x1b]0;title\x07some text";
        assert_eq!(strip_ansi(input), "some text");
    }

    #[test]
    fn strip_ansi_passthrough_clean_text() {
        assert_eq!(strip_ansi("just normal text"), "just normal text");
    }

    #[test]
    fn strip_decorations_removes_both_warning_spellings() {
        assert_eq!(strip_decorations("⚠ Backup?"), " Backup?");
        assert_eq!(strip_decorations("â š Backup?"), " Backup?");
        assert_eq!(strip_decorations("✔ Done"), " Done");
    }

    // ── Backup prompt ──

    #[test]
    fn detects_plain_backup_prompt() {
        let p = PromptPatterns::backup();
        assert!(p.scan("Backup? Y/n: "));
    }

    #[test]
    fn detects_colorized_bracketed_prompt() {
        let p = PromptPatterns::backup();
        let line = "\x1b[33m  ⚠ Backup? [\x1b[1mY\x1b[0m/n]: \x1b[0m";
        let d = p.detect(line).unwrap();
        assert_eq!(d.matched_text, "Backup? [Y/n]");
        assert_eq!(d.line, "Backup? [Y/n]:");
    }

    #[test]
    fn detects_mis_encoded_glyph_variant() {
        let p = PromptPatterns::backup();
        assert!(p.scan("  â š Backup? [Y/n]: "));
    }

    #[test]
    fn detection_is_case_insensitive() {
        let p = PromptPatterns::backup();
        assert!(p.scan("BACKUP? y/N"));
    }

    #[test]
    fn no_match_on_normal_output() {
        let p = PromptPatterns::backup();
        assert!(!p.scan("Backup created at ~/saturn-backup-20250101"));
        assert!(!p.scan("Building p2app..."));
    }

    // ── Configurable sets ──

    #[test]
    fn custom_patterns_compile_and_match() {
        let p = PromptPatterns::new(&["continue\\?", r"\(y/n\)"]).unwrap();
        assert!(p.scan("Continue? "));
        assert!(p.scan("Overwrite config (Y/N)"));
        assert!(!p.scan("Backup? Y/n"));
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        assert!(PromptPatterns::new(&["(unclosed"]).is_err());
    }

    #[test]
    fn empty_set_never_matches() {
        let p = PromptPatterns::none();
        assert!(p.is_empty());
        assert!(!p.scan("Backup? Y/n"));
    }
}
