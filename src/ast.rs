//! Compiled pattern tree and grammar types.
//!
//! A [`Grammar`] owns a vector of [`NonTerminal`] rules; [`Pattern`] nodes
//! reference rules by index, never by pointer, so recursive grammars form no
//! reference cycles. A compiled grammar is immutable and can be matched
//! against many inputs, including from several threads at once.

use std::fmt;

use crate::charset::ByteSet;

/// How a literal or back-reference compares against the input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseMode {
    /// Byte-for-byte equality.
    Exact,
    /// Case-insensitive, code point by code point.
    IgnoreCase,
    /// Case-insensitive, and `_`/`-` are skipped on both sides.
    IgnoreStyle,
}

/// Unicode code-point classes reachable from the `\letter` family of escapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnicodeClass {
    Letter,
    Lower,
    Upper,
    Title,
    White,
}

/// One node of a compiled grammar tree.
#[derive(Debug, Clone)]
pub enum Pattern {
    /// Matches zero bytes anywhere.
    Empty,
    /// `_`: any single byte.
    AnyByte,
    /// `.`: any single UTF-8 code point.
    AnyRune,
    /// `\n`: a newline (`\r\n`, `\n` or `\r`).
    NewLine,
    /// `\letter`, `\lower`, `\upper`, `\title`, `\white`.
    UnicodeClass(UnicodeClass),
    /// `'text'`, `i'text'`, `y'text'`.
    Literal { text: String, case_mode: CaseMode },
    /// `[a-z]` and the single-byte builtin classes.
    CharSet(ByteSet),
    /// Children must match consecutively.
    Sequence(Vec<Pattern>),
    /// Ordered choice: first successful child wins.
    Choice(Vec<Pattern>),
    /// `?`, `*`, `+`. `greedy` repetition never gives back consumed input;
    /// the non-greedy form is the at-most-once `?`.
    Repeat {
        child: Box<Pattern>,
        min: u32,
        greedy: bool,
    },
    /// `@p` / `{@}p`: skip forward until `child` matches. With a slot, the
    /// skipped span is captured.
    Search {
        child: Box<Pattern>,
        slot: Option<usize>,
    },
    /// `&p`: zero-width positive lookahead.
    AndPredicate(Box<Pattern>),
    /// `!p`: zero-width negative lookahead.
    NotPredicate(Box<Pattern>),
    /// `{p}`: record the matched span into a fixed slot.
    Capture { child: Box<Pattern>, slot: usize },
    /// `$N`, `i$N`, `y$N`, `$-N`. `slot` is zero-based; with `reverse` it
    /// counts written captures from the most recent one backwards.
    BackRef {
        slot: usize,
        mode: CaseMode,
        reverse: bool,
    },
    /// `Name`: index into the owning grammar's rule table.
    NonTerminalRef(usize),
    /// `^`: succeeds only at offset 0.
    StartAnchor,
}

/// Discriminant-only view of [`Pattern`], used as the key of the event-parse
/// handler table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternKind {
    Empty,
    AnyByte,
    AnyRune,
    NewLine,
    UnicodeClass,
    Literal,
    CharSet,
    Sequence,
    Choice,
    Repeat,
    Search,
    AndPredicate,
    NotPredicate,
    Capture,
    BackRef,
    NonTerminalRef,
    StartAnchor,
}

impl PatternKind {
    pub(crate) const COUNT: usize = 17;

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl Pattern {
    pub fn kind(&self) -> PatternKind {
        match self {
            Pattern::Empty => PatternKind::Empty,
            Pattern::AnyByte => PatternKind::AnyByte,
            Pattern::AnyRune => PatternKind::AnyRune,
            Pattern::NewLine => PatternKind::NewLine,
            Pattern::UnicodeClass(_) => PatternKind::UnicodeClass,
            Pattern::Literal { .. } => PatternKind::Literal,
            Pattern::CharSet(_) => PatternKind::CharSet,
            Pattern::Sequence(_) => PatternKind::Sequence,
            Pattern::Choice(_) => PatternKind::Choice,
            Pattern::Repeat { .. } => PatternKind::Repeat,
            Pattern::Search { .. } => PatternKind::Search,
            Pattern::AndPredicate(_) => PatternKind::AndPredicate,
            Pattern::NotPredicate(_) => PatternKind::NotPredicate,
            Pattern::Capture { .. } => PatternKind::Capture,
            Pattern::BackRef { .. } => PatternKind::BackRef,
            Pattern::NonTerminalRef(_) => PatternKind::NonTerminalRef,
            Pattern::StartAnchor => PatternKind::StartAnchor,
        }
    }

    /// Conservative "can this match zero bytes" test, used by the compiler to
    /// reject greedy repetition of empty-matching patterns. Non-terminal
    /// references are assumed non-empty here; the matcher's zero-length
    /// iteration guard covers what this analysis cannot see.
    pub(crate) fn can_match_empty(&self) -> bool {
        match self {
            Pattern::Empty
            | Pattern::AndPredicate(_)
            | Pattern::NotPredicate(_)
            | Pattern::BackRef { .. }
            | Pattern::StartAnchor => true,
            Pattern::AnyByte
            | Pattern::AnyRune
            | Pattern::NewLine
            | Pattern::UnicodeClass(_)
            | Pattern::CharSet(_) => false,
            // A style-insensitive literal of nothing but separators consumes
            // no input.
            Pattern::Literal { text, case_mode } => match case_mode {
                CaseMode::IgnoreStyle => text.chars().all(|c| c == '_' || c == '-'),
                _ => text.is_empty(),
            },
            Pattern::Sequence(children) => children.iter().all(Pattern::can_match_empty),
            Pattern::Choice(children) => children.iter().any(Pattern::can_match_empty),
            Pattern::Repeat { child, min, .. } => *min == 0 || child.can_match_empty(),
            Pattern::Search { child, .. } => child.can_match_empty(),
            Pattern::Capture { child, .. } => child.can_match_empty(),
            Pattern::NonTerminalRef(_) => false,
        }
    }

    /// Number of nodes in this subtree (non-terminal references count as one).
    pub(crate) fn node_count(&self) -> usize {
        1 + match self {
            Pattern::Sequence(children) | Pattern::Choice(children) => {
                children.iter().map(Pattern::node_count).sum()
            }
            Pattern::Repeat { child, .. }
            | Pattern::Search { child, .. }
            | Pattern::AndPredicate(child)
            | Pattern::NotPredicate(child)
            | Pattern::Capture { child, .. } => child.node_count(),
            _ => 0,
        }
    }

    /// True when the subtree writes capture slots.
    pub(crate) fn has_captures(&self) -> bool {
        match self {
            Pattern::Capture { .. } | Pattern::Search { slot: Some(_), .. } => true,
            Pattern::Sequence(children) | Pattern::Choice(children) => {
                children.iter().any(Pattern::has_captures)
            }
            Pattern::Repeat { child, .. }
            | Pattern::Search { child, slot: None }
            | Pattern::AndPredicate(child)
            | Pattern::NotPredicate(child) => child.has_captures(),
            _ => false,
        }
    }

    /// Collect the rule indices referenced anywhere in this subtree.
    pub(crate) fn collect_refs(&self, out: &mut Vec<usize>) {
        match self {
            Pattern::NonTerminalRef(idx) => out.push(*idx),
            Pattern::Sequence(children) | Pattern::Choice(children) => {
                for c in children {
                    c.collect_refs(out);
                }
            }
            Pattern::Repeat { child, .. }
            | Pattern::Search { child, .. }
            | Pattern::AndPredicate(child)
            | Pattern::NotPredicate(child)
            | Pattern::Capture { child, .. } => child.collect_refs(out),
            _ => {}
        }
    }

    // Precedence levels for display: choice < sequence < prefix < suffix.
    fn prec(&self) -> u8 {
        match self {
            Pattern::Choice(_) => 0,
            Pattern::Sequence(_) => 1,
            Pattern::AndPredicate(_) | Pattern::NotPredicate(_) | Pattern::Search { .. } => 2,
            Pattern::Repeat { .. } => 3,
            _ => 4,
        }
    }

    fn fmt_child(&self, f: &mut fmt::Formatter<'_>, min_prec: u8) -> fmt::Result {
        if self.prec() < min_prec {
            write!(f, "({})", self)
        } else {
            write!(f, "{}", self)
        }
    }
}

fn fmt_literal(f: &mut fmt::Formatter<'_>, text: &str) -> fmt::Result {
    write!(f, "'")?;
    for ch in text.chars() {
        match ch {
            '\'' => write!(f, "\\'")?,
            '\\' => write!(f, "\\\\")?,
            '\t' => write!(f, "\\t")?,
            '\n' => write!(f, "\\n")?,
            '\r' => write!(f, "\\r")?,
            c if (c as u32) < 0x20 || c as u32 == 0x7f => write!(f, "\\x{:02X}", c as u32)?,
            c => write!(f, "{}", c)?,
        }
    }
    write!(f, "'")
}

fn fmt_class_byte(f: &mut fmt::Formatter<'_>, b: u8) -> fmt::Result {
    match b {
        b'\\' | b']' | b'-' | b'^' => write!(f, "\\{}", b as char),
        0x20..=0x7e => write!(f, "{}", b as char),
        b'\t' => write!(f, "\\t"),
        b'\n' => write!(f, "\\n"),
        b'\r' => write!(f, "\\r"),
        _ => write!(f, "\\x{:02X}", b),
    }
}

impl fmt::Display for Pattern {
    /// Renders the pattern in source-like syntax. Non-terminal references
    /// print as `<N>`; [`Grammar`]'s `Display` substitutes rule names.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Empty => write!(f, "''"),
            Pattern::AnyByte => write!(f, "_"),
            Pattern::AnyRune => write!(f, "."),
            Pattern::NewLine => write!(f, "\\n"),
            Pattern::UnicodeClass(c) => match c {
                UnicodeClass::Letter => write!(f, "\\letter"),
                UnicodeClass::Lower => write!(f, "\\lower"),
                UnicodeClass::Upper => write!(f, "\\upper"),
                UnicodeClass::Title => write!(f, "\\title"),
                UnicodeClass::White => write!(f, "\\white"),
            },
            Pattern::Literal { text, case_mode } => {
                match case_mode {
                    CaseMode::Exact => {}
                    CaseMode::IgnoreCase => write!(f, "i")?,
                    CaseMode::IgnoreStyle => write!(f, "y")?,
                }
                fmt_literal(f, text)
            }
            Pattern::CharSet(set) => {
                write!(f, "[")?;
                for (lo, hi) in set.ranges() {
                    if lo == hi {
                        fmt_class_byte(f, lo)?;
                    } else {
                        fmt_class_byte(f, lo)?;
                        write!(f, "-")?;
                        fmt_class_byte(f, hi)?;
                    }
                }
                write!(f, "]")
            }
            Pattern::Sequence(children) => {
                for (i, c) in children.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    c.fmt_child(f, 2)?;
                }
                Ok(())
            }
            Pattern::Choice(children) => {
                for (i, c) in children.iter().enumerate() {
                    if i > 0 {
                        write!(f, " / ")?;
                    }
                    c.fmt_child(f, 1)?;
                }
                Ok(())
            }
            Pattern::Repeat { child, min, greedy } => {
                child.fmt_child(f, 4)?;
                match (*min, *greedy) {
                    (0, false) => write!(f, "?"),
                    (0, true) => write!(f, "*"),
                    _ => write!(f, "+"),
                }
            }
            Pattern::Search { child, slot } => {
                if slot.is_some() {
                    write!(f, "{{@}}")?;
                } else {
                    write!(f, "@")?;
                }
                child.fmt_child(f, 2)
            }
            Pattern::AndPredicate(child) => {
                write!(f, "&")?;
                child.fmt_child(f, 2)
            }
            Pattern::NotPredicate(child) => {
                write!(f, "!")?;
                child.fmt_child(f, 2)
            }
            Pattern::Capture { child, .. } => write!(f, "{{{}}}", child),
            Pattern::BackRef {
                slot,
                mode,
                reverse,
            } => {
                match mode {
                    CaseMode::Exact => {}
                    CaseMode::IgnoreCase => write!(f, "i")?,
                    CaseMode::IgnoreStyle => write!(f, "y")?,
                }
                if *reverse {
                    write!(f, "$-{}", slot + 1)
                } else {
                    write!(f, "${}", slot + 1)
                }
            }
            Pattern::NonTerminalRef(idx) => write!(f, "<{}>", idx),
            Pattern::StartAnchor => write!(f, "^"),
        }
    }
}

/// A named grammar rule.
#[derive(Debug, Clone)]
pub struct NonTerminal {
    pub name: String,
    /// Declaration site (or first use, for rules never declared).
    pub line: usize,
    pub column: usize,
    pub declared: bool,
    pub used: bool,
    pub pattern: Pattern,
}

/// A compiled, immutable grammar: the rule table plus the start rule.
#[derive(Debug, Clone)]
pub struct Grammar {
    rules: Vec<NonTerminal>,
    start: usize,
    capture_count: usize,
}

impl Grammar {
    pub(crate) fn new(rules: Vec<NonTerminal>, start: usize, capture_count: usize) -> Self {
        Self {
            rules,
            start,
            capture_count,
        }
    }

    /// The pattern matching begins with.
    pub fn start_pattern(&self) -> &Pattern {
        &self.rules[self.start].pattern
    }

    pub fn rule(&self, idx: usize) -> &NonTerminal {
        &self.rules[idx]
    }

    pub fn rules(&self) -> &[NonTerminal] {
        &self.rules
    }

    /// Number of capture slots the compiler assigned (0..=20).
    pub fn capture_count(&self) -> usize {
        self.capture_count
    }
}

impl fmt::Display for Grammar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let declared: Vec<&NonTerminal> = self.rules.iter().filter(|r| r.declared).collect();
        if declared.is_empty() {
            return write!(f, "{}", self.start_pattern());
        }
        if self.rules[self.start].name.is_empty() {
            writeln!(f, "{}", self.start_pattern())?;
        }
        for rule in declared {
            writeln!(f, "{} <- {}", rule.name, rule.pattern)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lit(s: &str) -> Pattern {
        Pattern::Literal {
            text: s.into(),
            case_mode: CaseMode::Exact,
        }
    }

    // --- can_match_empty ---

    #[test]
    fn empty_literal_matches_empty() {
        assert!(lit("").can_match_empty());
        assert!(!lit("a").can_match_empty());
    }

    #[test]
    fn style_literal_of_separators_matches_empty() {
        let p = Pattern::Literal {
            text: "_-".into(),
            case_mode: CaseMode::IgnoreStyle,
        };
        assert!(p.can_match_empty());
    }

    #[test]
    fn predicates_match_empty() {
        assert!(Pattern::AndPredicate(Box::new(lit("a"))).can_match_empty());
        assert!(Pattern::NotPredicate(Box::new(lit("a"))).can_match_empty());
        assert!(Pattern::StartAnchor.can_match_empty());
    }

    #[test]
    fn sequence_empty_iff_all_children_empty() {
        let seq = Pattern::Sequence(vec![lit(""), Pattern::StartAnchor]);
        assert!(seq.can_match_empty());
        let seq = Pattern::Sequence(vec![lit(""), lit("a")]);
        assert!(!seq.can_match_empty());
    }

    #[test]
    fn star_matches_empty_plus_does_not() {
        let star = Pattern::Repeat {
            child: Box::new(lit("a")),
            min: 0,
            greedy: true,
        };
        assert!(star.can_match_empty());
        let plus = Pattern::Repeat {
            child: Box::new(lit("a")),
            min: 1,
            greedy: true,
        };
        assert!(!plus.can_match_empty());
    }

    // --- node_count ---

    #[test]
    fn node_count_counts_subtree() {
        let p = Pattern::Sequence(vec![
            lit("a"),
            Pattern::Repeat {
                child: Box::new(lit("b")),
                min: 0,
                greedy: true,
            },
        ]);
        // sequence + 'a' + repeat + 'b'
        assert_eq!(p.node_count(), 4);
    }

    // --- has_captures ---

    #[test]
    fn capture_detection() {
        let p = Pattern::Sequence(vec![
            lit("a"),
            Pattern::Capture {
                child: Box::new(lit("b")),
                slot: 0,
            },
        ]);
        assert!(p.has_captures());
        assert!(!lit("a").has_captures());
    }

    #[test]
    fn captured_search_counts_as_capture() {
        let p = Pattern::Search {
            child: Box::new(lit("a")),
            slot: Some(0),
        };
        assert!(p.has_captures());
        let p = Pattern::Search {
            child: Box::new(lit("a")),
            slot: None,
        };
        assert!(!p.has_captures());
    }

    // --- Sharing ---

    #[test]
    fn grammar_is_shareable_across_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Grammar>();
    }

    // --- Display ---

    #[test]
    fn display_literal_with_escapes() {
        assert_eq!(lit("a'b").to_string(), r"'a\'b'");
        assert_eq!(lit("a\tb").to_string(), r"'a\tb'");
    }

    #[test]
    fn display_choice_inside_sequence_parenthesised() {
        let p = Pattern::Sequence(vec![
            Pattern::Choice(vec![lit("a"), lit("b")]),
            lit("c"),
        ]);
        assert_eq!(p.to_string(), "('a' / 'b') 'c'");
    }

    #[test]
    fn display_repeat_forms() {
        let opt = Pattern::Repeat {
            child: Box::new(lit("a")),
            min: 0,
            greedy: false,
        };
        let star = Pattern::Repeat {
            child: Box::new(lit("a")),
            min: 0,
            greedy: true,
        };
        let plus = Pattern::Repeat {
            child: Box::new(lit("a")),
            min: 1,
            greedy: true,
        };
        assert_eq!(opt.to_string(), "'a'?");
        assert_eq!(star.to_string(), "'a'*");
        assert_eq!(plus.to_string(), "'a'+");
    }

    #[test]
    fn display_charset_ranges() {
        let mut set = crate::charset::ByteSet::empty();
        set.insert_range(b'a', b'z');
        set.insert(b'!');
        assert_eq!(Pattern::CharSet(set).to_string(), "[!a-z]");
    }

    #[test]
    fn display_backref_modes() {
        let p = Pattern::BackRef {
            slot: 0,
            mode: CaseMode::IgnoreCase,
            reverse: false,
        };
        assert_eq!(p.to_string(), "i$1");
        let p = Pattern::BackRef {
            slot: 1,
            mode: CaseMode::Exact,
            reverse: true,
        };
        assert_eq!(p.to_string(), "$-2");
    }
}
