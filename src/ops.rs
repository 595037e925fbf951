//! Derived operations: search, replace, split and pattern escaping.
//!
//! Everything here is a repeated-`raw_match` scan. Scans advance one code
//! point at a time and only accept matches whose spans fall on character
//! boundaries, so every reported span is a valid `&str` slice.

use crate::ast::Grammar;
use crate::captures::Captures;
use crate::matcher::{MatchState, raw_match};

/// Find the next accepted match at or after byte `from`.
fn scan(grammar: &Grammar, input: &str, from: usize) -> Option<(usize, usize, Captures)> {
    let bytes = input.as_bytes();
    let mut pos = from;
    while pos < input.len() && !input.is_char_boundary(pos) {
        pos += 1;
    }
    loop {
        if pos > input.len() {
            return None;
        }
        let mut state = MatchState::new();
        if let Some(len) = raw_match(grammar.start_pattern(), grammar, bytes, pos, &mut state)
            && !state.limit_exceeded()
            && input.is_char_boundary(pos + len)
        {
            return Some((pos, len, state.captures));
        }
        if pos == input.len() {
            return None;
        }
        pos += char_width(input, pos);
    }
}

fn char_width(input: &str, at: usize) -> usize {
    input[at..].chars().next().map_or(1, |c| c.len_utf8())
}

/// First match at or after `start`, as `(offset, length)` in bytes.
pub fn find(grammar: &Grammar, input: &str, start: usize) -> Option<(usize, usize)> {
    scan(grammar, input, start).map(|(s, l, _)| (s, l))
}

/// Iterator over every non-overlapping match in `input`, left to right.
///
/// Zero-length matches are yielded and the scan then advances one code point,
/// so the iterator always terminates. Re-invoking [`find_all`] restarts it.
pub fn find_all<'g, 'i>(grammar: &'g Grammar, input: &'i str) -> FindAll<'g, 'i> {
    FindAll {
        grammar,
        input,
        pos: 0,
    }
}

pub struct FindAll<'g, 'i> {
    grammar: &'g Grammar,
    input: &'i str,
    pos: usize,
}

impl<'i> Iterator for FindAll<'_, 'i> {
    type Item = &'i str;

    fn next(&mut self) -> Option<&'i str> {
        let (start, len, _) = scan(self.grammar, self.input, self.pos)?;
        self.pos = if len == 0 {
            if start >= self.input.len() {
                self.input.len() + 1
            } else {
                start + char_width(self.input, start)
            }
        } else {
            start + len
        };
        Some(&self.input[start..start + len])
    }
}

/// Shared scan-and-splice loop for the replace family. `build` appends the
/// replacement for one match to the output.
fn replace_with(
    input: &str,
    grammar: &Grammar,
    mut build: impl FnMut(&mut String, usize, usize, usize, &Captures),
) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pos = 0;
    let mut index = 0;
    while let Some((start, len, caps)) = scan(grammar, input, pos) {
        out.push_str(&input[pos..start]);
        build(&mut out, index, start, len, &caps);
        index += 1;
        if len == 0 {
            // Zero-length match: copy one code point so the scan advances.
            if start >= input.len() {
                pos = start;
                break;
            }
            let w = char_width(input, start);
            out.push_str(&input[start..start + w]);
            pos = start + w;
        } else {
            pos = start + len;
        }
    }
    out.push_str(&input[pos..]);
    out
}

/// Replace every match with `replacement`, verbatim. Non-matching spans pass
/// through unchanged; with no matches the input comes back identical.
pub fn replace_literal(input: &str, grammar: &Grammar, replacement: &str) -> String {
    replace_with(input, grammar, |out, _, _, _, _| out.push_str(replacement))
}

/// Replace every match with `template`, substituting `$0` (whole match) and
/// `$1`..`$20` (captures; unset slots expand to nothing). `$$` is a literal
/// dollar sign.
pub fn replace_formatted(input: &str, grammar: &Grammar, template: &str) -> String {
    replace_with(input, grammar, |out, _, start, len, caps| {
        expand_template(out, template, input, start, len, caps);
    })
}

/// Replace every match with the text produced by `f(match_index,
/// capture_count, captures)`, where `capture_count` is the number of slots
/// set for that match.
pub fn replace_callback(
    input: &str,
    grammar: &Grammar,
    mut f: impl FnMut(usize, usize, &Captures) -> String,
) -> String {
    replace_with(input, grammar, |out, index, _, _, caps| {
        out.push_str(&f(index, caps.set_count(), caps));
    })
}

/// Apply several `(pattern, template)` substitutions in one pass. At each
/// position the first matching pattern wins; its template is expanded the
/// same way as in [`replace_formatted`]. Patterns are tried independently,
/// with no backtracking across the list.
pub fn replace_parallel(input: &str, pairs: &[(&Grammar, &str)]) -> String {
    let bytes = input.as_bytes();
    let mut out = String::with_capacity(input.len());
    let mut pos = 0;
    while pos < input.len() {
        let mut advanced = false;
        for (grammar, template) in pairs {
            let mut state = MatchState::new();
            if let Some(len) = raw_match(grammar.start_pattern(), grammar, bytes, pos, &mut state)
                && !state.limit_exceeded()
                && input.is_char_boundary(pos + len)
            {
                expand_template(&mut out, template, input, pos, len, &state.captures);
                if len > 0 {
                    pos += len;
                    advanced = true;
                }
                break;
            }
        }
        if !advanced {
            let w = char_width(input, pos);
            out.push_str(&input[pos..pos + w]);
            pos += w;
        }
    }
    out
}

/// Iterator over the pieces of `input` between separator matches.
///
/// Adjacent separators yield empty pieces, and a leading or trailing
/// separator yields a leading or trailing empty piece, so joining the pieces
/// with the separator text reconstructs the input.
pub fn split<'g, 'i>(input: &'i str, grammar: &'g Grammar) -> Split<'g, 'i> {
    Split {
        grammar,
        input,
        pos: 0,
        finished: false,
    }
}

pub struct Split<'g, 'i> {
    grammar: &'g Grammar,
    input: &'i str,
    pos: usize,
    finished: bool,
}

impl<'i> Iterator for Split<'_, 'i> {
    type Item = &'i str;

    fn next(&mut self) -> Option<&'i str> {
        if self.finished {
            return None;
        }
        let mut search = self.pos;
        loop {
            match scan(self.grammar, self.input, search) {
                Some((start, len, _)) if len > 0 => {
                    let piece = &self.input[self.pos..start];
                    self.pos = start + len;
                    return Some(piece);
                }
                Some((start, _, _)) => {
                    // Zero-length separators cannot delimit anything; skip.
                    if start >= self.input.len() {
                        break;
                    }
                    search = start + char_width(self.input, start);
                }
                None => break,
            }
        }
        self.finished = true;
        Some(&self.input[self.pos..])
    }
}

/// Build a pattern that matches `text` literally, whatever it contains.
pub fn escape_pattern(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('\'');
    for ch in text.chars() {
        match ch {
            '\'' => out.push_str("\\'"),
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                out.push_str(&format!("\\x{:02X}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Append `template` to `out` with `$`-substitutions applied.
fn expand_template(
    out: &mut String,
    template: &str,
    input: &str,
    match_start: usize,
    match_len: usize,
    caps: &Captures,
) {
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('$') => {
                chars.next();
                out.push('$');
            }
            Some(d) if d.is_ascii_digit() => {
                let mut n = 0usize;
                let mut digits = 0;
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() && digits < 2 {
                        n = n * 10 + (d as usize - '0' as usize);
                        digits += 1;
                        chars.next();
                    } else {
                        break;
                    }
                }
                if n == 0 {
                    if let Some(whole) = input.get(match_start..match_start + match_len) {
                        out.push_str(whole);
                    }
                } else if let Some(text) = caps.text(input, n - 1) {
                    out.push_str(text);
                }
            }
            _ => out.push('$'),
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;

    fn g(pattern: &str) -> Grammar {
        compile(pattern).unwrap_or_else(|e| panic!("compile({pattern:?}): {e}"))
    }

    // --- find ---

    #[test]
    fn find_first_occurrence() {
        let pat = g("'cat' / 'dog' / 'bird'");
        assert_eq!(find(&pat, "the dog barks", 0), Some((4, 3)));
    }

    #[test]
    fn find_respects_start() {
        let pat = g("'a'");
        assert_eq!(find(&pat, "abca", 1), Some((3, 1)));
    }

    #[test]
    fn find_no_match() {
        assert_eq!(find(&g("'z'"), "abc", 0), None);
    }

    #[test]
    fn find_empty_match_at_end() {
        assert_eq!(find(&g("'a'?"), "xyz", 3), Some((3, 0)));
    }

    // --- find_all ---

    #[test]
    fn find_all_yields_every_match() {
        let pat = g(r"\d+");
        let found: Vec<&str> = find_all(&pat, "a1b22c333").collect();
        assert_eq!(found, vec!["1", "22", "333"]);
    }

    #[test]
    fn find_all_is_restartable() {
        let pat = g(r"\w+");
        let first: Vec<&str> = find_all(&pat, "x y").collect();
        let second: Vec<&str> = find_all(&pat, "x y").collect();
        assert_eq!(first, second);
    }

    #[test]
    fn find_all_zero_length_makes_progress() {
        let pat = g("'a'?");
        // One (possibly empty) match per position; must terminate.
        let count = find_all(&pat, "aba").count();
        assert_eq!(count, 4); // "a", "", "a", "" (at end)
    }

    // --- replace_literal ---

    #[test]
    fn replace_literal_basic() {
        assert_eq!(replace_literal("aaa123bbb", &g(r"\d+"), "NUM"), "aaaNUMbbb");
    }

    #[test]
    fn replace_literal_multiple() {
        assert_eq!(replace_literal("a1b2", &g(r"\d"), "#"), "a#b#");
    }

    #[test]
    fn replace_no_match_is_identity() {
        assert_eq!(replace_literal("hello world", &g("'xyz'"), "!"), "hello world");
    }

    #[test]
    fn replace_preserves_multibyte_text() {
        assert_eq!(replace_literal("café = café", &g("'='"), "is"), "café is café");
    }

    // --- replace_formatted ---

    #[test]
    fn replace_formatted_substitutes_captures() {
        let pat = g(r"{\w+} '=' {\w+}");
        assert_eq!(
            replace_formatted("key=value", &pat, "$2: $1"),
            "value: key"
        );
    }

    #[test]
    fn replace_formatted_whole_match_and_dollar() {
        let pat = g(r"\d+");
        assert_eq!(replace_formatted("a12", &pat, "<$0>$$"), "a<12>$");
    }

    #[test]
    fn replace_formatted_unset_capture_is_empty() {
        let pat = g(r"{\d+} / {\a+}");
        // Letters set slot 2; slot 1 stays unset and expands to nothing.
        assert_eq!(replace_formatted("ab", &pat, "[$1|$2]"), "[|ab]");
    }

    // --- replace_callback ---

    #[test]
    fn replace_callback_sees_index_and_captures() {
        let pat = g(r"{\d+}");
        let out = replace_callback("a1b22", &pat, |index, count, caps| {
            assert_eq!(count, 1);
            let _ = caps;
            format!("m{index}")
        });
        assert_eq!(out, "am0bm1");
    }

    #[test]
    fn replace_callback_reads_capture_text() {
        let pat = g(r"{\d+}");
        let input = "x10y3";
        let out = replace_callback(input, &pat, |_, _, caps| {
            let n: u32 = caps.text(input, 0).unwrap().parse().unwrap();
            (n * 2).to_string()
        });
        assert_eq!(out, "x20y6");
    }

    // --- replace_parallel ---

    #[test]
    fn replace_parallel_first_pattern_wins() {
        let cat = g("'cat'");
        let ca = g("'ca'");
        let out = replace_parallel("cat", &[(&cat, "FELINE"), (&ca, "??")]);
        assert_eq!(out, "FELINE");
        let out = replace_parallel("cat", &[(&ca, "??"), (&cat, "FELINE")]);
        assert_eq!(out, "??t");
    }

    #[test]
    fn replace_parallel_mixed() {
        let digits = g(r"\d+");
        let word = g(r"\a+");
        let out = replace_parallel("ab 12 cd", &[(&digits, "N"), (&word, "W")]);
        assert_eq!(out, "W N W");
    }

    #[test]
    fn replace_parallel_templates_use_captures() {
        let pair = g(r"{\w+} '=' {\w+}");
        let out = replace_parallel("a=1;b=2", &[(&pair, "$2=$1")]);
        assert_eq!(out, "1=a;2=b");
    }

    // --- split ---

    #[test]
    fn split_on_literal() {
        let comma = g("','");
        let pieces: Vec<&str> = split("a,b,c", &comma).collect();
        assert_eq!(pieces, vec!["a", "b", "c"]);
    }

    #[test]
    fn split_keeps_empty_pieces() {
        let comma = g("','");
        let pieces: Vec<&str> = split(",a,,b,", &comma).collect();
        assert_eq!(pieces, vec!["", "a", "", "b", ""]);
    }

    #[test]
    fn split_without_separator_yields_whole_input() {
        let comma = g("','");
        let pieces: Vec<&str> = split("abc", &comma).collect();
        assert_eq!(pieces, vec!["abc"]);
    }

    #[test]
    fn split_join_round_trip() {
        let sep = g("', '");
        let input = "one, two, three";
        let pieces: Vec<&str> = split(input, &sep).collect();
        assert_eq!(pieces.join(", "), input);
    }

    #[test]
    fn split_on_pattern_separator() {
        let ws = g(r"\s+");
        let pieces: Vec<&str> = split("a  b\tc", &ws).collect();
        assert_eq!(pieces, vec!["a", "b", "c"]);
    }

    // --- escape_pattern ---

    #[test]
    fn escape_round_trip_plain() {
        let text = "hello world";
        let pat = g(&escape_pattern(text));
        assert_eq!(crate::matcher::match_len(&pat, text, 0), Some(text.len()));
    }

    #[test]
    fn escape_round_trip_metacharacters() {
        let text = r"a'b\c {d} [e] $1 @f # g";
        let pat = g(&escape_pattern(text));
        assert_eq!(crate::matcher::match_len(&pat, text, 0), Some(text.len()));
    }

    #[test]
    fn escape_round_trip_controls_and_unicode() {
        let text = "tab\there\r\nétude\x01";
        let pat = g(&escape_pattern(text));
        assert_eq!(crate::matcher::match_len(&pat, text, 0), Some(text.len()));
    }

    #[test]
    fn escape_empty_string() {
        let pat = g(&escape_pattern(""));
        assert_eq!(crate::matcher::match_len(&pat, "anything", 0), Some(0));
    }
}
