//! Lua 5.4 pattern matching that yields to an interrupt check.
//!
//! The stock matcher is a recursive backtracker written in C. A pattern such
//! as `.-.-.-.-b` against a long subject runs for minutes without ever
//! returning to the VM, so no instruction hook can stop it. This matcher
//! follows the same grammar and semantics over byte offsets and consults an
//! interrupt callback every few thousand steps.

use thiserror::Error;

const ESCAPE: u8 = b'%';

/// Bytes that make a pattern more than a literal.
const SPECIALS: &[u8] = b"^$*+?.([%-";

const MAX_CAPTURES: usize = 32;

/// Recursion limit, matching the stock `MAXCCALLS`.
const MAX_DEPTH: usize = 200;

/// Work units between interrupt checks.
const STEPS_PER_CHECK: usize = 1 << 14;

/// Why a match could not complete.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub(crate) enum PatternError {
    /// The pattern or a replacement referred to something invalid.
    #[error("{0}")]
    Malformed(String),
    /// The interrupt callback asked the matcher to stop.
    #[error("pattern matching interrupted")]
    Interrupted,
}

fn malformed(message: impl Into<String>) -> PatternError {
    PatternError::Malformed(message.into())
}

/// Returns true when `pattern` contains no magic characters.
pub(crate) fn is_literal(pattern: &[u8]) -> bool {
    !pattern.iter().any(|byte| SPECIALS.contains(byte))
}

/// Meters work and polls the interrupt callback.
pub(crate) struct Ticker<'a> {
    remaining: usize,
    interrupted: &'a dyn Fn() -> bool,
}

impl<'a> Ticker<'a> {
    pub(crate) fn new(interrupted: &'a dyn Fn() -> bool) -> Self {
        Self {
            remaining: STEPS_PER_CHECK,
            interrupted,
        }
    }

    /// Charges `cost` units, checking the interrupt when the budget runs out.
    pub(crate) fn step(&mut self, cost: usize) -> Result<(), PatternError> {
        self.remaining = self.remaining.saturating_sub(cost.max(1));
        if self.remaining > 0 {
            return Ok(());
        }
        self.remaining = STEPS_PER_CHECK;
        if (self.interrupted)() {
            Err(PatternError::Interrupted)
        } else {
            Ok(())
        }
    }
}

/// Plain substring search from `start`, as `string.find` does with `plain`.
pub(crate) fn find_literal(
    subject: &[u8],
    needle: &[u8],
    start: usize,
    ticker: &mut Ticker<'_>,
) -> Result<Option<usize>, PatternError> {
    if needle.is_empty() {
        return Ok(Some(start));
    }
    let haystack = subject.get(start..).unwrap_or_default();
    for (offset, window) in haystack.windows(needle.len()).enumerate() {
        ticker.step(needle.len())?;
        if window == needle {
            return Ok(Some(start + offset));
        }
    }
    Ok(None)
}

/// A captured value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Captured<'a> {
    /// A substring capture.
    Text(&'a [u8]),
    /// A `()` capture: a one-based position in the subject.
    Position(usize),
}

#[derive(Debug, Clone, Copy)]
enum SlotLength {
    Open,
    Position,
    Closed(usize),
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    start: usize,
    length: SlotLength,
}

/// Where matching goes after one pattern item.
enum Step {
    Advance { s: usize, p: usize },
    Finish(Option<usize>),
}

impl Step {
    fn advance_or_fail(end: Option<usize>, p: usize) -> Self {
        end.map_or(Self::Finish(None), |s| Self::Advance { s, p })
    }
}

/// Matches one pattern against one subject.
///
/// Offsets are byte indices into the subject; a successful attempt returns
/// the offset one past the end of the match.
pub(crate) struct Matcher<'a, 'i> {
    subject: &'a [u8],
    pattern: &'a [u8],
    slots: Vec<Slot>,
    depth: usize,
    ticker: Ticker<'i>,
}

impl<'a, 'i> Matcher<'a, 'i> {
    pub(crate) fn new(subject: &'a [u8], pattern: &'a [u8], ticker: Ticker<'i>) -> Self {
        Self {
            subject,
            pattern,
            slots: Vec::new(),
            depth: MAX_DEPTH,
            ticker,
        }
    }

    /// Tries to match the pattern from pattern offset `p` at subject offset
    /// `s`, discarding captures from earlier attempts.
    pub(crate) fn attempt(&mut self, s: usize, p: usize) -> Result<Option<usize>, PatternError> {
        self.slots.clear();
        self.depth = MAX_DEPTH;
        self.do_match(s, p)
    }

    /// The subject bytes `start..end`.
    pub(crate) fn text(&self, start: usize, end: usize) -> &'a [u8] {
        self.subject.get(start..end).unwrap_or_default()
    }

    /// Returns capture `index`. With no captures in the pattern, index zero
    /// is the whole match `start..end`.
    pub(crate) fn capture(
        &self,
        index: usize,
        start: usize,
        end: usize,
    ) -> Result<Captured<'a>, PatternError> {
        let Some(slot) = self.slots.get(index) else {
            return if index == 0 {
                Ok(Captured::Text(self.text(start, end)))
            } else {
                Err(malformed(format!("invalid capture index %{}", index + 1)))
            };
        };
        match slot.length {
            SlotLength::Open => Err(malformed("unfinished capture")),
            SlotLength::Position => Ok(Captured::Position(slot.start + 1)),
            SlotLength::Closed(length) => Ok(Captured::Text(
                self.subject
                    .get(slot.start..slot.start + length)
                    .unwrap_or_default(),
            )),
        }
    }

    /// Returns every capture. When `whole` is given and the pattern has no
    /// captures, the whole match is the single capture.
    pub(crate) fn captures(
        &self,
        whole: Option<(usize, usize)>,
    ) -> Result<Vec<Captured<'a>>, PatternError> {
        let count = if self.slots.is_empty() && whole.is_some() {
            1
        } else {
            self.slots.len()
        };
        let (start, end) = whole.unwrap_or((0, 0));
        (0..count)
            .map(|index| self.capture(index, start, end))
            .collect()
    }

    fn subject_at(&self, index: usize) -> u8 {
        self.subject.get(index).copied().unwrap_or(0)
    }

    fn pattern_at(&self, index: usize) -> u8 {
        self.pattern.get(index).copied().unwrap_or(0)
    }

    fn do_match(&mut self, s: usize, p: usize) -> Result<Option<usize>, PatternError> {
        if self.depth == 0 {
            return Err(malformed("pattern too complex"));
        }
        self.depth -= 1;
        let result = self.match_from(s, p);
        self.depth += 1;
        result
    }

    fn match_from(&mut self, start: usize, pattern_start: usize) -> Result<Option<usize>, PatternError> {
        let mut s = start;
        let mut p = pattern_start;
        loop {
            self.ticker.step(1)?;
            if p == self.pattern.len() {
                return Ok(Some(s));
            }
            let step = match (self.pattern_at(p), self.pattern_at(p + 1)) {
                (b'(', b')') => Step::Finish(self.start_capture(s, p + 2, SlotLength::Position)?),
                (b'(', _) => Step::Finish(self.start_capture(s, p + 1, SlotLength::Open)?),
                (b')', _) => Step::Finish(self.end_capture(s, p + 1)?),
                (b'$', _) if p + 1 == self.pattern.len() => {
                    Step::Finish((s == self.subject.len()).then_some(s))
                }
                (ESCAPE, b'b') => Step::advance_or_fail(self.match_balance(s, p + 2)?, p + 4),
                (ESCAPE, b'f') => self.match_frontier(s, p + 2)?,
                (ESCAPE, digit) if digit.is_ascii_digit() => {
                    Step::advance_or_fail(self.match_back_reference(s, digit)?, p + 2)
                }
                _ => self.match_item(s, p)?,
            };
            match step {
                Step::Advance { s: next_s, p: next_p } => {
                    s = next_s;
                    p = next_p;
                }
                Step::Finish(result) => return Ok(result),
            }
        }
    }

    /// A single-character class with an optional quantifier.
    fn match_item(&mut self, s: usize, p: usize) -> Result<Step, PatternError> {
        let class_end = self.class_end(p)?;
        let suffix = self.pattern_at(class_end);
        if !self.single_match(s, p, class_end) {
            return Ok(if matches!(suffix, b'*' | b'?' | b'-') {
                Step::Advance { s, p: class_end + 1 }
            } else {
                Step::Finish(None)
            });
        }
        Ok(match suffix {
            b'?' => match self.do_match(s + 1, class_end + 1)? {
                Some(end) => Step::Finish(Some(end)),
                None => Step::Advance { s, p: class_end + 1 },
            },
            b'+' => Step::Finish(self.max_expand(s + 1, p, class_end)?),
            b'*' => Step::Finish(self.max_expand(s, p, class_end)?),
            b'-' => Step::Finish(self.min_expand(s, p, class_end)?),
            _ => Step::Advance {
                s: s + 1,
                p: class_end,
            },
        })
    }

    /// `%f[set]`: matches where the previous byte is outside the set and the
    /// current one inside it.
    fn match_frontier(&self, s: usize, p: usize) -> Result<Step, PatternError> {
        if self.pattern_at(p) != b'[' {
            return Err(malformed("missing '[' after '%f' in pattern"));
        }
        let class_end = self.class_end(p)?;
        let previous = s.checked_sub(1).map_or(0, |index| self.subject_at(index));
        let current = self.subject_at(s);
        let entering = !self.match_bracket_class(previous, p, class_end - 1)
            && self.match_bracket_class(current, p, class_end - 1);
        Ok(if entering {
            Step::Advance { s, p: class_end }
        } else {
            Step::Finish(None)
        })
    }

    /// Returns the offset just past the single-character class at `p`.
    fn class_end(&self, p: usize) -> Result<usize, PatternError> {
        let len = self.pattern.len();
        let mut cursor = p + 1;
        match self.pattern_at(p) {
            ESCAPE => {
                if cursor >= len {
                    return Err(malformed("malformed pattern (ends with '%')"));
                }
                Ok(cursor + 1)
            }
            b'[' => {
                if self.pattern_at(cursor) == b'^' {
                    cursor += 1;
                }
                // The first member is taken literally, so `[]]` matches `]`.
                loop {
                    if cursor >= len {
                        return Err(malformed("malformed pattern (missing ']')"));
                    }
                    let member = self.pattern_at(cursor);
                    cursor += 1;
                    if member == ESCAPE && cursor < len {
                        cursor += 1;
                    }
                    if self.pattern_at(cursor) == b']' {
                        return Ok(cursor + 1);
                    }
                }
            }
            _ => Ok(cursor),
        }
    }

    fn single_match(&self, s: usize, p: usize, class_end: usize) -> bool {
        if s >= self.subject.len() {
            return false;
        }
        let byte = self.subject_at(s);
        match self.pattern_at(p) {
            b'.' => true,
            ESCAPE => match_class(byte, self.pattern_at(p + 1)),
            b'[' => self.match_bracket_class(byte, p, class_end - 1),
            literal => literal == byte,
        }
    }

    /// Tests `byte` against the set spanning `open..=close`.
    fn match_bracket_class(&self, byte: u8, open: usize, close: usize) -> bool {
        let mut cursor = open;
        let mut found = true;
        if self.pattern_at(cursor + 1) == b'^' {
            found = false;
            cursor += 1;
        }
        loop {
            cursor += 1;
            if cursor >= close {
                return !found;
            }
            let member = self.pattern_at(cursor);
            if member == ESCAPE {
                cursor += 1;
                if match_class(byte, self.pattern_at(cursor)) {
                    return found;
                }
            } else if self.pattern_at(cursor + 1) == b'-' && cursor + 2 < close {
                cursor += 2;
                if member <= byte && byte <= self.pattern_at(cursor) {
                    return found;
                }
            } else if member == byte {
                return found;
            }
        }
    }

    fn match_balance(&mut self, s: usize, p: usize) -> Result<Option<usize>, PatternError> {
        if p + 1 >= self.pattern.len() {
            return Err(malformed("malformed pattern (missing arguments to '%b')"));
        }
        let open = self.pattern_at(p);
        let close = self.pattern_at(p + 1);
        if s >= self.subject.len() || self.subject_at(s) != open {
            return Ok(None);
        }
        let mut depth = 1_usize;
        let mut cursor = s + 1;
        while cursor < self.subject.len() {
            self.ticker.step(1)?;
            let byte = self.subject_at(cursor);
            if byte == close {
                depth -= 1;
                if depth == 0 {
                    return Ok(Some(cursor + 1));
                }
            } else if byte == open {
                depth += 1;
            }
            cursor += 1;
        }
        Ok(None)
    }

    fn max_expand(&mut self, s: usize, p: usize, class_end: usize) -> Result<Option<usize>, PatternError> {
        let mut count = 0_usize;
        while self.single_match(s + count, p, class_end) {
            self.ticker.step(1)?;
            count += 1;
        }
        loop {
            if let Some(end) = self.do_match(s + count, class_end + 1)? {
                return Ok(Some(end));
            }
            let Some(fewer) = count.checked_sub(1) else {
                return Ok(None);
            };
            count = fewer;
        }
    }

    fn min_expand(&mut self, s: usize, p: usize, class_end: usize) -> Result<Option<usize>, PatternError> {
        let mut cursor = s;
        loop {
            if let Some(end) = self.do_match(cursor, class_end + 1)? {
                return Ok(Some(end));
            }
            if !self.single_match(cursor, p, class_end) {
                return Ok(None);
            }
            cursor += 1;
        }
    }

    fn start_capture(
        &mut self,
        s: usize,
        p: usize,
        length: SlotLength,
    ) -> Result<Option<usize>, PatternError> {
        if self.slots.len() >= MAX_CAPTURES {
            return Err(malformed("too many captures"));
        }
        self.slots.push(Slot { start: s, length });
        let result = self.do_match(s, p)?;
        if result.is_none() {
            self.slots.pop();
        }
        Ok(result)
    }

    fn end_capture(&mut self, s: usize, p: usize) -> Result<Option<usize>, PatternError> {
        let index = self
            .slots
            .iter()
            .rposition(|slot| matches!(slot.length, SlotLength::Open))
            .ok_or_else(|| malformed("invalid pattern capture"))?;
        self.set_length(index, |slot| SlotLength::Closed(s - slot.start));
        let result = self.do_match(s, p)?;
        if result.is_none() {
            self.set_length(index, |_| SlotLength::Open);
        }
        Ok(result)
    }

    fn set_length(&mut self, index: usize, length: impl FnOnce(&Slot) -> SlotLength) {
        if let Some(slot) = self.slots.get_mut(index) {
            slot.length = length(slot);
        }
    }

    fn match_back_reference(&mut self, s: usize, digit: u8) -> Result<Option<usize>, PatternError> {
        let invalid = || malformed(format!("invalid capture index %{}", digit - b'0'));
        let index = usize::from(digit.checked_sub(b'1').ok_or_else(invalid)?);
        let slot = self.slots.get(index).copied().ok_or_else(invalid)?;
        let length = match slot.length {
            SlotLength::Open => return Err(invalid()),
            // A position capture never matches as a back reference.
            SlotLength::Position => return Ok(None),
            SlotLength::Closed(length) => length,
        };
        self.ticker.step(length)?;
        let captured = self.subject.get(slot.start..slot.start + length);
        let candidate = self.subject.get(s..s + length);
        Ok(match (captured, candidate) {
            (Some(expected), Some(found)) if expected == found => Some(s + length),
            _ => None,
        })
    }
}

/// Tests `byte` against a `%x` class letter.
fn match_class(byte: u8, class: u8) -> bool {
    let matched = match class.to_ascii_lowercase() {
        b'a' => byte.is_ascii_alphabetic(),
        b'c' => byte.is_ascii_control(),
        b'd' => byte.is_ascii_digit(),
        b'g' => byte.is_ascii_graphic(),
        b'l' => byte.is_ascii_lowercase(),
        b'p' => byte.is_ascii_punctuation(),
        b's' => matches!(byte, b' ' | b'\t'..=b'\r'),
        b'u' => byte.is_ascii_uppercase(),
        b'w' => byte.is_ascii_alphanumeric(),
        b'x' => byte.is_ascii_hexdigit(),
        _ => return class == byte,
    };
    if class.is_ascii_uppercase() {
        !matched
    } else {
        matched
    }
}
