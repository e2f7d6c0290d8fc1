//! text canonicalization for semantic comparison
//!
//! normalized text is only ever used to decide whether two files should be
//! presented as different, and whether a write is actually needed. it is never
//! hashed: content addresses are always computed over raw bytes.

use crate::error::{Error, Result};

const BOM: char = '\u{feff}';

/// canonicalize text so formatting noise does not register as a change
///
/// - a byte-order mark at the very start of the text is removed
/// - CRLF and lone CR become LF
/// - trailing spaces and tabs are stripped from every line
/// - lines that are blank after stripping are dropped
/// - non-empty output ends with exactly one LF
///
/// a mark further in is content. when it opens the first kept line, that line
/// is preceded by one empty line so the next pass does not strip it.
///
/// idempotent: `normalize(&normalize(x)) == normalize(x)`
pub fn normalize(text: &str) -> String {
    let text = text.strip_prefix(BOM).unwrap_or(text);
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");

    let mut out = String::with_capacity(unified.len());
    for line in unified.split('\n') {
        let line = line.trim_end_matches([' ', '\t']);
        if line.is_empty() {
            continue;
        }
        if out.is_empty() && line.starts_with(BOM) {
            out.push('\n');
        }
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// decode bytes as UTF-8 text for comparison
pub fn decode_text<'a>(path: &str, bytes: &'a [u8]) -> Result<&'a str> {
    std::str::from_utf8(bytes).map_err(|e| Error::Encoding {
        path: path.to_string(),
        reason: e.to_string(),
    })
}

/// outcome of comparing two byte sequences for presentation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TextComparison {
    /// raw bytes are identical
    Identical,
    /// raw bytes differ but normalized text is equal
    EqualAfterNormalization,
    /// normalized text differs
    Different,
    /// raw bytes differ and at least one side is not text
    BinaryDifferent,
}

impl TextComparison {
    /// whether the pair should be shown to the user as a change
    pub fn is_change(&self) -> bool {
        matches!(self, TextComparison::Different | TextComparison::BinaryDifferent)
    }
}

/// pluggable normalizer, so a different text convention can be swapped in
pub trait TextNormalizer: Send + Sync {
    fn normalize(&self, text: &str) -> String;

    /// compare two byte sequences, falling back to raw equality for non-text
    fn compare(&self, a: &[u8], b: &[u8]) -> TextComparison {
        if a == b {
            return TextComparison::Identical;
        }
        match (std::str::from_utf8(a), std::str::from_utf8(b)) {
            (Ok(a), Ok(b)) => {
                if self.normalize(a) == self.normalize(b) {
                    TextComparison::EqualAfterNormalization
                } else {
                    TextComparison::Different
                }
            }
            _ => TextComparison::BinaryDifferent,
        }
    }
}

/// line-oriented normalizer (see [`normalize`])
#[derive(Clone, Copy, Debug, Default)]
pub struct LineNormalizer;

impl TextNormalizer for LineNormalizer {
    fn normalize(&self, text: &str) -> String {
        normalize(text)
    }
}

/// compare two byte sequences with the default normalizer
pub fn compare_normalized(a: &[u8], b: &[u8]) -> TextComparison {
    LineNormalizer.compare(a, b)
}
