//! Matcher engine: recursive evaluation of a compiled pattern against input.
//!
//! All offsets and lengths are **byte** positions into the input. "No match"
//! is the value `None`, never an error; matching is a pure function of
//! `(grammar, input, start)`.
//!
//! Two semantics inherited from the pattern language are easy to trip over:
//!
//! - Ordered choice is first-match-wins, not longest-match.
//! - Greedy repetition never gives back input. Once `'a'*` has consumed every
//!   `a`, a following `'a'` in the same sequence fails, and captures written
//!   before the failure stay written.
//!
//! There is no cancellation or timeout primitive: the only unbounded loops
//! are `Search` and greedy `Repeat` iteration, and callers needing
//! bounded-time matching must bound the input they feed in.

use std::fmt;

use crate::ast::{CaseMode, Grammar, Pattern};
use crate::captures::Captures;
use crate::charset::unicode_class_matches;
use crate::events::EventHandlers;

/// Matcher recursion ceiling. Grammar nesting and non-terminal recursion
/// both consume levels; pathological grammars fail with
/// [`MatchError::RecursionLimitExceeded`] instead of overflowing the stack.
pub const MAX_RECURSION_DEPTH: usize = 2048;

/// Fatal match-time conditions, distinct from ordinary non-matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchError {
    RecursionLimitExceeded,
}

impl fmt::Display for MatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchError::RecursionLimitExceeded => write!(f, "matcher recursion limit exceeded"),
        }
    }
}

impl std::error::Error for MatchError {}

/// Per-invocation matcher state: the capture store, the recursion budget and
/// the optional event-handler table.
///
/// Each matching call owns its own `MatchState`, which is what makes a shared
/// [`Grammar`] safe to match from many threads at once.
pub struct MatchState<'h, 'c> {
    pub captures: Captures,
    depth: usize,
    limit_exceeded: bool,
    handlers: Option<&'h mut EventHandlers<'c>>,
}

impl<'h, 'c> MatchState<'h, 'c> {
    pub fn new() -> Self {
        Self {
            captures: Captures::new(),
            depth: 0,
            limit_exceeded: false,
            handlers: None,
        }
    }

    pub(crate) fn with_handlers(handlers: &'h mut EventHandlers<'c>) -> Self {
        Self {
            captures: Captures::new(),
            depth: 0,
            limit_exceeded: false,
            handlers: Some(handlers),
        }
    }

    /// True once the recursion ceiling was hit; the overall result is then
    /// meaningless and reported as a failure.
    pub fn limit_exceeded(&self) -> bool {
        self.limit_exceeded
    }

    fn enter(&mut self, pattern: &Pattern, offset: usize) {
        if let Some(handlers) = self.handlers.as_deref_mut() {
            handlers.fire_enter(pattern.kind(), offset);
        }
    }

    fn leave(&mut self, pattern: &Pattern, offset: usize, result: Option<usize>) {
        if let Some(handlers) = self.handlers.as_deref_mut() {
            handlers.fire_leave(pattern.kind(), offset, result);
        }
    }
}

impl Default for MatchState<'_, '_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Match `pattern` against `input` at byte `offset`.
///
/// Returns the number of bytes matched, or `None`. Captures recorded into
/// `state` are never rolled back, even when an enclosing sequence or
/// alternative later fails.
pub fn raw_match(
    pattern: &Pattern,
    grammar: &Grammar,
    input: &[u8],
    offset: usize,
    state: &mut MatchState,
) -> Option<usize> {
    if state.limit_exceeded {
        return None;
    }
    state.depth += 1;
    if state.depth > MAX_RECURSION_DEPTH {
        state.limit_exceeded = true;
        state.depth -= 1;
        return None;
    }
    state.enter(pattern, offset);
    let result = eval(pattern, grammar, input, offset, state);
    state.leave(pattern, offset, result);
    state.depth -= 1;
    result
}

fn eval(
    pattern: &Pattern,
    grammar: &Grammar,
    input: &[u8],
    offset: usize,
    state: &mut MatchState,
) -> Option<usize> {
    match pattern {
        Pattern::Empty => Some(0),
        Pattern::AnyByte => {
            if offset < input.len() {
                Some(1)
            } else {
                None
            }
        }
        Pattern::AnyRune => decode_rune(input, offset).map(|(_, width)| width),
        Pattern::NewLine => {
            let rest = input.get(offset..)?;
            if rest.starts_with(b"\r\n") {
                Some(2)
            } else if rest.starts_with(b"\n") || rest.starts_with(b"\r") {
                Some(1)
            } else {
                None
            }
        }
        Pattern::UnicodeClass(class) => {
            let (ch, width) = decode_rune(input, offset)?;
            if unicode_class_matches(*class, ch) {
                Some(width)
            } else {
                None
            }
        }
        Pattern::Literal { text, case_mode } => {
            match_bytes(*case_mode, text.as_bytes(), input, offset)
        }
        Pattern::CharSet(set) => match input.get(offset) {
            Some(b) if set.contains(*b) => Some(1),
            _ => None,
        },
        Pattern::Sequence(children) => {
            let mut len = 0;
            for child in children {
                // Captures written by earlier children stay put when a later
                // child fails; sequences do not roll back.
                let l = raw_match(child, grammar, input, offset + len, state)?;
                len += l;
            }
            Some(len)
        }
        Pattern::Choice(children) => {
            for child in children {
                if let Some(len) = raw_match(child, grammar, input, offset, state) {
                    return Some(len);
                }
                if state.limit_exceeded {
                    return None;
                }
            }
            None
        }
        Pattern::Repeat { child, min, greedy } => {
            if !*greedy {
                // `?`: at most one occurrence.
                return match raw_match(child, grammar, input, offset, state) {
                    Some(len) => Some(len),
                    None if state.limit_exceeded => None,
                    None => Some(0),
                };
            }
            let mut total = 0;
            let mut count = 0u32;
            while let Some(len) = raw_match(child, grammar, input, offset + total, state) {
                count += 1;
                total += len;
                if len == 0 {
                    // A zero-width iteration counts once; looping further
                    // would never terminate.
                    break;
                }
            }
            if state.limit_exceeded {
                return None;
            }
            (count >= *min).then_some(total)
        }
        Pattern::Search { child, slot } => {
            let mut pos = offset;
            loop {
                if let Some(len) = raw_match(child, grammar, input, pos, state) {
                    if let Some(slot) = slot {
                        state.captures.record(*slot, offset, pos);
                    }
                    return Some(pos - offset + len);
                }
                if state.limit_exceeded || pos >= input.len() {
                    return None;
                }
                pos += rune_width_or_one(input, pos);
            }
        }
        Pattern::AndPredicate(child) => {
            raw_match(child, grammar, input, offset, state).map(|_| 0)
        }
        Pattern::NotPredicate(child) => match raw_match(child, grammar, input, offset, state) {
            Some(_) => None,
            None if state.limit_exceeded => None,
            None => Some(0),
        },
        Pattern::Capture { child, slot } => {
            let len = raw_match(child, grammar, input, offset, state)?;
            state.captures.record(*slot, offset, offset + len);
            Some(len)
        }
        Pattern::BackRef {
            slot,
            mode,
            reverse,
        } => {
            // Unset slots fail the match; slot bounds were checked at compile
            // time.
            let (start, end) = state.captures.resolve(*slot, *reverse)?;
            let span = input.get(start..end)?;
            match_bytes(*mode, span, input, offset)
        }
        Pattern::NonTerminalRef(idx) => {
            raw_match(&grammar.rule(*idx).pattern, grammar, input, offset, state)
        }
        Pattern::StartAnchor => {
            if offset == 0 {
                Some(0)
            } else {
                None
            }
        }
    }
}

// ─── Public entry points ────────────────────────────────────────────────────

/// Does the grammar match at byte `start`? Prefix semantics: trailing input
/// is allowed unless the pattern ends with `$`.
pub fn matches(grammar: &Grammar, input: &str, start: usize) -> bool {
    match_len(grammar, input, start).is_some()
}

/// Length in bytes of a match at `start`, or `None`.
pub fn match_len(grammar: &Grammar, input: &str, start: usize) -> Option<usize> {
    try_match_len(grammar, input, start).unwrap_or(None)
}

/// Like [`match_len`], but recursion-limit exhaustion is reported as an error
/// instead of a non-match.
pub fn try_match_len(
    grammar: &Grammar,
    input: &str,
    start: usize,
) -> Result<Option<usize>, MatchError> {
    let mut state = MatchState::new();
    let result = raw_match(
        grammar.start_pattern(),
        grammar,
        input.as_bytes(),
        start,
        &mut state,
    );
    if state.limit_exceeded() {
        return Err(MatchError::RecursionLimitExceeded);
    }
    Ok(result)
}

/// Match at `start` and return the captured spans (set slots in slot order).
pub fn match_captures(grammar: &Grammar, input: &str, start: usize) -> Option<Vec<(usize, usize)>> {
    let mut state = MatchState::new();
    raw_match(
        grammar.start_pattern(),
        grammar,
        input.as_bytes(),
        start,
        &mut state,
    )?;
    if state.limit_exceeded() {
        return None;
    }
    Some(state.captures.spans())
}

// ─── Byte and rune helpers ──────────────────────────────────────────────────

/// Decode the UTF-8 code point starting at `at`, returning it with its
/// encoded width. `None` at end of input or on invalid UTF-8.
pub(crate) fn decode_rune(input: &[u8], at: usize) -> Option<(char, usize)> {
    let first = *input.get(at)?;
    let width = match first {
        0x00..=0x7f => 1,
        0xc0..=0xdf => 2,
        0xe0..=0xef => 3,
        0xf0..=0xf7 => 4,
        _ => return None,
    };
    let slice = input.get(at..at + width)?;
    let s = std::str::from_utf8(slice).ok()?;
    s.chars().next().map(|c| (c, width))
}

pub(crate) fn rune_width_or_one(input: &[u8], at: usize) -> usize {
    decode_rune(input, at).map_or(1, |(_, width)| width)
}

/// Unicode-aware, case-insensitive equality for single scalar values.
///
/// This compares lowercase expansions, so it handles mappings where a single
/// character lowercases to multiple code points.
fn fold_eq(a: char, b: char) -> bool {
    a.to_lowercase().eq(b.to_lowercase())
}

/// Compare `pat` against `input` at `at` under `mode`, returning the number
/// of input bytes consumed (which can differ from `pat.len()` under the
/// folding modes).
fn match_bytes(mode: CaseMode, pat: &[u8], input: &[u8], at: usize) -> Option<usize> {
    match mode {
        CaseMode::Exact => {
            if input.get(at..)?.starts_with(pat) {
                Some(pat.len())
            } else {
                None
            }
        }
        CaseMode::IgnoreCase => {
            let mut pi = 0;
            let mut ii = at;
            while pi < pat.len() {
                let (pc, pw) = decode_rune(pat, pi)?;
                let (ic, iw) = decode_rune(input, ii)?;
                if !fold_eq(pc, ic) {
                    return None;
                }
                pi += pw;
                ii += iw;
            }
            Some(ii - at)
        }
        CaseMode::IgnoreStyle => {
            let is_sep = |b: u8| b == b'_' || b == b'-';
            let mut pi = 0;
            let mut ii = at;
            loop {
                while pi < pat.len() && is_sep(pat[pi]) {
                    pi += 1;
                }
                if pi >= pat.len() {
                    break;
                }
                while ii < input.len() && is_sep(input[ii]) {
                    ii += 1;
                }
                let (pc, pw) = decode_rune(pat, pi)?;
                let (ic, iw) = decode_rune(input, ii)?;
                if !fold_eq(pc, ic) {
                    return None;
                }
                pi += pw;
                ii += iw;
            }
            Some(ii - at)
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;

    fn m(pattern: &str, input: &str) -> Option<usize> {
        let g = compile(pattern).unwrap_or_else(|e| panic!("compile({pattern:?}): {e}"));
        match_len(&g, input, 0)
    }

    fn caps(pattern: &str, input: &str) -> Option<Vec<(usize, usize)>> {
        let g = compile(pattern).unwrap();
        match_captures(&g, input, 0)
    }

    // --- Literals ---

    #[test]
    fn literal_prefix_match() {
        assert_eq!(m("'cat'", "cats"), Some(3));
        assert_eq!(m("'cat'", "dog"), None);
        assert_eq!(m("'cat'", "ca"), None);
    }

    #[test]
    fn literal_at_offset() {
        let g = compile("'dog'").unwrap();
        assert_eq!(match_len(&g, "the dog", 4), Some(3));
        assert_eq!(match_len(&g, "the dog", 0), None);
    }

    #[test]
    fn literal_ignore_case() {
        assert_eq!(m("i'HELLO'", "hello"), Some(5));
        assert_eq!(m("i'straße'", "STRASSE"), None); // folding is per code point
        assert_eq!(m("i'été'", "ÉTÉ"), Some(5));
    }

    #[test]
    fn literal_ignore_style() {
        assert_eq!(m("y'ignorecase'", "IgnoreCase"), Some(10));
        assert_eq!(m("y'ignore_case'", "ignorecase"), Some(10));
        assert_eq!(m("y'snake_case'", "snake-case"), Some(10));
        assert_eq!(m("y'abc'", "a_b-c"), Some(5));
        assert_eq!(m("y'abc'", "abd"), None);
    }

    #[test]
    fn empty_literal_matches_zero_bytes() {
        assert_eq!(m("''", "anything"), Some(0));
        assert_eq!(m("''", ""), Some(0));
    }

    // --- Any / newline / classes ---

    #[test]
    fn any_byte_and_any_rune() {
        assert_eq!(m("_", "é"), Some(1));
        assert_eq!(m(".", "é"), Some(2));
        assert_eq!(m(".", ""), None);
        assert_eq!(m("_", ""), None);
    }

    #[test]
    fn newline_variants() {
        assert_eq!(m(r"\n", "\r\nx"), Some(2));
        assert_eq!(m(r"\n", "\nx"), Some(1));
        assert_eq!(m(r"\n", "\rx"), Some(1));
        assert_eq!(m(r"\n", "x"), None);
    }

    #[test]
    fn unicode_letter_class() {
        assert_eq!(m(r"\letter", "étude"), Some(2));
        assert_eq!(m(r"\letter", "5"), None);
        assert_eq!(m(r"\upper \lower", "Ab"), Some(2));
    }

    #[test]
    fn charset_membership() {
        assert_eq!(m("[a-f]", "cab"), Some(1));
        assert_eq!(m("[a-f]", "x"), None);
        assert_eq!(m("[^a-f]", "x"), Some(1));
    }

    // --- Sequence and choice ---

    #[test]
    fn sequence_advances_offset() {
        assert_eq!(m("'a' 'b' 'c'", "abc"), Some(3));
        assert_eq!(m("'a' 'b' 'c'", "abd"), None);
    }

    #[test]
    fn choice_first_match_wins() {
        // Even though the second alternative would match more, the first
        // success is returned.
        assert_eq!(m("'a' / 'ab'", "ab"), Some(1));
        assert_eq!(m("'x' / 'ab'", "ab"), Some(2));
        assert_eq!(m("'x' / 'y'", "ab"), None);
    }

    // --- Repetition ---

    #[test]
    fn optional_matches_zero_or_one() {
        assert_eq!(m("'a'?", "a"), Some(1));
        assert_eq!(m("'a'?", "b"), Some(0));
    }

    #[test]
    fn star_and_plus() {
        assert_eq!(m("'a'*", "aaab"), Some(3));
        assert_eq!(m("'a'*", "b"), Some(0));
        assert_eq!(m("'a'+", "aaab"), Some(3));
        assert_eq!(m("'a'+", "b"), None);
    }

    #[test]
    fn greedy_repeat_never_backtracks() {
        // 'a'* consumes every 'a'; the trailing 'a' then has nothing left.
        assert_eq!(m("'a'* 'a'", "aaa"), None);
        // Same shape with a choice after the repeat.
        assert_eq!(m("[a-z]* '!'", "abc!"), Some(4));
        assert_eq!(m("[a-z!]* '!'", "abc!"), None);
    }

    #[test]
    fn digits_scenario() {
        assert_eq!(
            m(r"\d \d? \d? '.' \d \d? \d? '.' \d \d? \d? '.' \d \d? \d?", "192.168.1.1"),
            Some(11)
        );
    }

    // --- Search ---

    #[test]
    fn search_skips_to_match() {
        assert_eq!(m("@'dog'", "the dog barks"), Some(7));
        assert_eq!(m("@'cat'", "the dog barks"), None);
    }

    #[test]
    fn search_at_current_position() {
        assert_eq!(m("@'the'", "the dog"), Some(3));
    }

    #[test]
    fn captured_search_records_skipped_span() {
        assert_eq!(caps("{@}'dog'", "the dog"), Some(vec![(0, 4)]));
    }

    // --- Predicates ---

    #[test]
    fn and_predicate_zero_width() {
        assert_eq!(m("&'ab' 'a'", "ab"), Some(1));
        assert_eq!(m("&'x' 'a'", "ab"), None);
    }

    #[test]
    fn not_predicate_zero_width() {
        assert_eq!(m("!'x' 'a'", "ab"), Some(1));
        assert_eq!(m("!'a' 'a'", "ab"), None);
    }

    // --- Anchors ---

    #[test]
    fn start_anchor_only_at_offset_zero() {
        let g = compile("^'a'").unwrap();
        assert_eq!(match_len(&g, "aa", 0), Some(1));
        assert_eq!(match_len(&g, "aa", 1), None);
    }

    #[test]
    fn end_anchor_requires_exhausted_input() {
        assert_eq!(m("'ab' $", "ab"), Some(2));
        assert_eq!(m("'ab' $", "abc"), None);
    }

    // --- Captures ---

    #[test]
    fn key_value_captures() {
        let g = compile(r"{\w+} '=' {.*}").unwrap();
        assert_eq!(match_len(&g, "key=value", 0), Some(9));
        assert_eq!(match_captures(&g, "key=value", 0), Some(vec![(0, 3), (4, 9)]));
    }

    #[test]
    fn capture_inside_repeat_keeps_last_iteration() {
        assert_eq!(caps("({[a-z]} ',')+", "a,b,c,"), Some(vec![(4, 5)]));
    }

    #[test]
    fn failed_sequence_keeps_earlier_captures() {
        let g = compile("{'ab'} 'Z'").unwrap();
        let mut state = MatchState::new();
        let result = raw_match(g.start_pattern(), &g, b"abX", 0, &mut state);
        assert_eq!(result, None);
        // The capture written before the failing literal is still set.
        assert_eq!(state.captures.get(0), Some((0, 2)));
    }

    #[test]
    fn failed_alternative_keeps_captures() {
        // The first alternative captures, then fails on 'X'; the second
        // matches. The stale capture is visible afterwards.
        let g = compile("({'a'} 'X') / 'a'").unwrap();
        assert_eq!(match_captures(&g, "ab", 0), Some(vec![(0, 1)]));
    }

    // --- Back-references ---

    #[test]
    fn backref_doubled_word() {
        let g = compile(r"{\ident} ' ' $1").unwrap();
        assert_eq!(match_len(&g, "hello hello", 0), Some(11));
        assert_eq!(match_len(&g, "hello world", 0), None);
    }

    #[test]
    fn backref_ignore_case() {
        assert_eq!(m("{'abc'} '-' i$1", "abc-ABC"), Some(7));
        assert_eq!(m("{'abc'} '-' $1", "abc-ABC"), None);
    }

    #[test]
    fn backref_ignore_style() {
        assert_eq!(m(r"{\ident} '=' y$1", "snake_case=SnakeCase"), Some(20));
    }

    #[test]
    fn backref_reverse_counts_from_most_recent() {
        assert_eq!(m("{'a'} {'b'} '-' $-1", "ab-b"), Some(4));
        assert_eq!(m("{'a'} {'b'} '-' $-2", "ab-a"), Some(4));
        assert_eq!(m("{'a'} {'b'} '-' $-1", "ab-a"), None);
    }

    #[test]
    fn backref_to_unset_slot_fails() {
        // The capture sits in an unvisited alternative, so slot 1 is unset at
        // the back-reference.
        let g = compile("('q' {'x'} / {'a'}) $1").unwrap();
        assert_eq!(match_len(&g, "aa", 0), None);
    }

    // --- Non-terminals and recursion ---

    #[test]
    fn recursive_grammar_balanced_parens() {
        let g = compile("list <- '(' list* ')'").unwrap();
        assert_eq!(match_len(&g, "(()())", 0), Some(6));
        assert_eq!(match_len(&g, "(()", 0), None);
    }

    #[test]
    fn recursion_limit_is_an_error() {
        // A rule that recurses without consuming input.
        let g = compile("a <- a 'x'").unwrap();
        assert_eq!(
            try_match_len(&g, "xxx", 0),
            Err(MatchError::RecursionLimitExceeded)
        );
        // The infallible entry point reports a plain non-match.
        assert_eq!(match_len(&g, "xxx", 0), None);
    }

    // --- Determinism ---

    #[test]
    fn repeated_calls_are_identical() {
        let g = compile(r"{\w+} '=' {\w+}").unwrap();
        let first = (match_len(&g, "a=b", 0), match_captures(&g, "a=b", 0));
        let second = (match_len(&g, "a=b", 0), match_captures(&g, "a=b", 0));
        assert_eq!(first, second);
    }

    // --- Helpers ---

    #[test]
    fn decode_rune_widths() {
        assert_eq!(decode_rune("aé€𝄞".as_bytes(), 0), Some(('a', 1)));
        assert_eq!(decode_rune("aé€𝄞".as_bytes(), 1), Some(('é', 2)));
        assert_eq!(decode_rune("aé€𝄞".as_bytes(), 3), Some(('€', 3)));
        assert_eq!(decode_rune("aé€𝄞".as_bytes(), 6), Some(('𝄞', 4)));
        assert_eq!(decode_rune(b"a", 1), None);
        // Continuation byte is not a rune start.
        assert_eq!(decode_rune("é".as_bytes(), 1), None);
    }
}
