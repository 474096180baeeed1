//! Incremental sentence segmentation
//!
//! Text arrives in fragments with arbitrary boundaries (often a few tokens
//! at a time from an LLM). The segmenter buffers it and hands out units as
//! soon as a sentence is known to be complete, so synthesis of the first
//! sentence can start while the rest is still being generated.

use thiserror::Error;

use super::Unit;

/// Default cap on total characters accepted per request
pub const DEFAULT_MAX_INPUT_CHARS: usize = 100_000;

/// Input the segmenter refuses to process
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SegmentError {
    /// Non-whitespace control character in the text
    #[error("control character U+{code:04X} at offset {offset}")]
    ControlCharacter {
        /// Unicode scalar value
        code: u32,
        /// Character offset within the whole request
        offset: usize,
    },

    /// Request text longer than the configured cap
    #[error("input exceeds {limit} characters")]
    InputTooLarge {
        /// Configured cap
        limit: usize,
    },
}

/// Splits a fragment stream into ordered [`Unit`]s
#[derive(Debug)]
pub struct Segmenter {
    buffer: String,
    max_unit_chars: usize,
    max_input_chars: usize,
    received: usize,
    next_index: u64,
}

impl Segmenter {
    /// Create a segmenter producing units of at most `max_unit_chars` characters
    #[must_use]
    pub fn new(max_unit_chars: usize) -> Self {
        Self {
            buffer: String::new(),
            max_unit_chars: max_unit_chars.max(1),
            max_input_chars: DEFAULT_MAX_INPUT_CHARS,
            received: 0,
            next_index: 0,
        }
    }

    /// Cap the total number of characters accepted
    #[must_use]
    pub const fn with_input_limit(mut self, max_input_chars: usize) -> Self {
        self.max_input_chars = max_input_chars;
        self
    }

    /// Number of units emitted so far (also the next index)
    #[must_use]
    pub const fn emitted(&self) -> u64 {
        self.next_index
    }

    /// Feed one fragment and return every unit it completes.
    ///
    /// A sentence ending exactly at the end of the buffer is held back
    /// until more text (or [`finish`](Self::finish)) shows whether it
    /// really ended there.
    ///
    /// # Errors
    ///
    /// Returns [`SegmentError`] for control characters or oversized input;
    /// the segmenter should not be used afterwards.
    pub fn push(&mut self, fragment: &str) -> Result<Vec<Unit>, SegmentError> {
        for (offset, c) in fragment.chars().enumerate() {
            if c.is_control() && !c.is_whitespace() {
                return Err(SegmentError::ControlCharacter {
                    code: u32::from(c),
                    offset: self.received + offset,
                });
            }
        }

        self.received += fragment.chars().count();
        if self.received > self.max_input_chars {
            return Err(SegmentError::InputTooLarge {
                limit: self.max_input_chars,
            });
        }

        self.buffer.push_str(fragment);
        Ok(self.drain(false))
    }

    /// Signal end of input and return the remaining units
    pub fn finish(&mut self) -> Vec<Unit> {
        self.drain(true)
    }

    fn drain(&mut self, at_end: bool) -> Vec<Unit> {
        let mut units = Vec::new();

        loop {
            let leading = self.buffer.len() - self.buffer.trim_start().len();
            self.buffer.drain(..leading);
            if self.buffer.is_empty() {
                break;
            }

            let end = match find_boundary(&self.buffer, self.max_unit_chars, at_end) {
                Some(end) => end,
                None if self.buffer.chars().count() > self.max_unit_chars => {
                    force_split(&self.buffer, self.max_unit_chars)
                }
                None if at_end => self.buffer.len(),
                None => break,
            };

            let text = normalize(&self.buffer[..end]);
            self.buffer.drain(..end);

            if !text.is_empty() {
                units.push(Unit {
                    index: self.next_index,
                    text,
                });
                self.next_index += 1;
            }
        }

        units
    }
}

/// Segment a complete text in one call
///
/// # Errors
///
/// Returns [`SegmentError`] if the text is rejected
pub fn segment(text: &str, max_unit_chars: usize) -> Result<Vec<Unit>, SegmentError> {
    let mut segmenter = Segmenter::new(max_unit_chars).with_input_limit(usize::MAX);
    let mut units = segmenter.push(text)?;
    units.extend(segmenter.finish());
    Ok(units)
}

const fn is_terminator(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '…' | '。' | '！' | '？')
}

/// Full-width terminators end a sentence without trailing whitespace
const fn is_fullwidth_terminator(c: char) -> bool {
    matches!(c, '。' | '！' | '？')
}

const fn is_closer(c: char) -> bool {
    matches!(c, '"' | '\'' | '”' | '’' | ')' | ']' | '»' | '」' | '』')
}

/// Byte offset just past the first complete sentence within `max_chars`.
///
/// A sentence ends at terminal punctuation (plus any closing quotes or
/// brackets) followed by whitespace, or at a blank line.
fn find_boundary(buf: &str, max_chars: usize, at_end: bool) -> Option<usize> {
    let mut chars = buf.char_indices().peekable();
    let mut count = 0;

    while let Some((i, c)) = chars.next() {
        count += 1;
        if count > max_chars {
            return None;
        }

        if c == '\n' {
            let rest = buf[i + 1..].trim_start_matches([' ', '\t', '\r']);
            if rest.starts_with('\n') {
                return Some(i);
            }
            continue;
        }

        if !is_terminator(c) {
            continue;
        }

        let mut end = i + c.len_utf8();
        let mut fullwidth = is_fullwidth_terminator(c);
        while let Some(&(j, d)) = chars.peek() {
            if !(is_terminator(d) || is_closer(d)) {
                break;
            }
            count += 1;
            if count > max_chars {
                return None;
            }
            fullwidth |= is_fullwidth_terminator(d);
            end = j + d.len_utf8();
            chars.next();
        }

        match chars.peek() {
            Some(&(_, d)) if d.is_whitespace() || fullwidth => return Some(end),
            Some(_) => {}
            None => return at_end.then_some(end),
        }
    }

    None
}

/// Byte offset to cut an over-long buffer at.
///
/// Cuts at the last whitespace within the first `max_chars + 1` characters
/// so the unit keeps at most `max_chars`; hard-cuts at `max_chars` when the
/// window holds no whitespace.
fn force_split(buf: &str, max_chars: usize) -> usize {
    let mut indices = buf.char_indices().skip(max_chars);
    let Some((limit, at_limit)) = indices.next() else {
        return buf.len();
    };
    let window = &buf[..limit + at_limit.len_utf8()];

    match window.rfind(char::is_whitespace) {
        Some(ws) if ws > 0 => ws,
        _ => limit,
    }
}

/// Collapse every whitespace run (line breaks included) to one space
fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
