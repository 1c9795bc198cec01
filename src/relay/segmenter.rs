//! Split text into provider-sized segments.
//!
//! Lengths are counted in characters. Each cut prefers the last sentence
//! terminator in the window, then the start of the last whitespace run, and
//! only hard-breaks when the window has neither. Concatenating the segments
//! always reproduces the input exactly.

/// One ordered slice of the text to synthesize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub index: usize,
    pub content: String,
    /// Length of `content` in characters.
    pub length: usize,
}

/// Collapse newlines to spaces and trim. Callers run this before `segment`.
pub fn normalize(text: &str) -> String {
    text.replace("\r\n", " ")
        .replace(['\n', '\r'], " ")
        .trim()
        .to_string()
}

/// Break `text` into segments of at most `max_length` characters.
///
/// Returns an empty vector for empty input.
///
/// # Panics
/// Panics if `max_length` is zero.
pub fn segment(text: &str, max_length: usize) -> Vec<Segment> {
    assert!(max_length > 0, "max_length must be positive");

    let chars: Vec<char> = text.chars().collect();
    // Byte offset of every char position, plus the end of the string.
    let offsets: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();

    let mut segments = Vec::new();
    let mut cursor = 0;

    while cursor < chars.len() {
        let end = (cursor + max_length).min(chars.len());
        let cut = if end < chars.len() {
            find_cut(&chars[cursor..end]).map_or(end, |c| cursor + c)
        } else {
            end
        };

        segments.push(Segment {
            index: segments.len(),
            content: text[offsets[cursor]..offsets[cut]].to_string(),
            length: cut - cursor,
        });
        cursor = cut;
    }

    segments
}

/// Cut position inside `window`, or `None` for a hard break at its end.
/// A returned position is always > 0 so every segment is non-empty.
fn find_cut(window: &[char]) -> Option<usize> {
    if let Some(pos) = window.iter().rposition(|c| matches!(c, '.' | '!' | '?')) {
        return Some(pos + 1);
    }

    let last_space = window.iter().rposition(|c| c.is_whitespace())?;
    let run_start = window[..last_space]
        .iter()
        .rposition(|c| !c.is_whitespace())
        .map_or(0, |p| p + 1);
    (run_start > 0).then_some(run_start)
}
