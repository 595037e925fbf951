//! Grammar compiler: PEG source text to a compiled [`Grammar`].
//!
//! # Pattern syntax
//!
//! | Token            | Meaning                                        |
//! |------------------|------------------------------------------------|
//! | `'text'`         | Literal (exact case)                           |
//! | `i'text'`        | Literal, case-insensitive                      |
//! | `y'text'`        | Literal, style-insensitive (skips `_` and `-`) |
//! | `.`              | Any UTF-8 code point                           |
//! | `_`              | Any byte                                       |
//! | `[a-z]` `[^0-9]` | Character class (bytes), optionally negated    |
//! | `(a b)`          | Grouping                                       |
//! | `a / b`          | Ordered choice                                 |
//! | `a?` `a*` `a+`   | Optional / zero-or-more / one-or-more (greedy) |
//! | `&a` `!a`        | Zero-width positive / negative lookahead       |
//! | `@a`             | Search: skip forward until `a` matches         |
//! | `{@}a`           | Search, capturing the skipped span             |
//! | `{a}`            | Capture                                        |
//! | `$N` `i$N` `y$N` | Back-reference to capture N (1..20)            |
//! | `$-N`            | Back-reference, N-th most recent capture       |
//! | `Name`           | Non-terminal reference                         |
//! | `Name <- a b`    | Rule definition (first rule is the start)      |
//! | `^`              | Start of input                                 |
//! | `$`              | End of input (last element only)               |
//! | `\t \r \\ \xHH`  | Escapes (`\xHH` matches one byte)              |
//! | `\n`             | Newline (`\r\n`, `\n` or `\r`)                 |
//! | `\d \s \w \a`    | ASCII classes (uppercase negates)              |
//! | `\ident`         | Identifier: `[A-Za-z_][A-Za-z0-9_]*`           |
//! | `\letter` etc.   | Unicode classes (`lower upper title white`)    |
//! | `# ...`          | Comment to end of line                         |

use std::collections::HashMap;
use std::fmt;
use std::iter::Peekable;
use std::str::Chars;

use itertools::Itertools;
use phf::{Map, phf_map};

use crate::ast::{CaseMode, Grammar, NonTerminal, Pattern, UnicodeClass};
use crate::captures::MAX_CAPTURES;
use crate::charset::ByteSet;

/// Rules at or below this node count are candidates for inlining.
const INLINE_NODE_LIMIT: usize = 16;

/// What went wrong while compiling a grammar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileErrorKind {
    UnexpectedChar(char),
    UnexpectedEnd,
    UnclosedLiteral,
    UnclosedClass,
    UnclosedGroup,
    UnclosedCapture,
    MalformedEscape,
    InvalidRange,
    NonAsciiInClass(char),
    BackRefOutOfRange(usize),
    BackRefBeyondCaptures(usize),
    TooManyCaptures,
    MisplacedAnchor,
    UndeclaredNonTerminal(String),
    DuplicateRule(String),
    EmptyRepeat,
    ExpectedPattern,
    TrailingInput,
}

/// A compile failure with its source position (1-based line and column).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    pub kind: CompileErrorKind,
    pub line: usize,
    pub column: usize,
}

impl CompileError {
    fn new(kind: CompileErrorKind, (line, column): (usize, usize)) -> Self {
        Self { kind, line, column }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: ", self.line, self.column)?;
        match &self.kind {
            CompileErrorKind::UnexpectedChar(c) => {
                write!(f, "unexpected character {c:?} in pattern")
            }
            CompileErrorKind::UnexpectedEnd => write!(f, "unexpected end of pattern"),
            CompileErrorKind::UnclosedLiteral => write!(f, "unclosed string literal"),
            CompileErrorKind::UnclosedClass => write!(f, "unclosed character class"),
            CompileErrorKind::UnclosedGroup => write!(f, "unclosed group '('"),
            CompileErrorKind::UnclosedCapture => write!(f, "unclosed capture '{{'"),
            CompileErrorKind::MalformedEscape => write!(f, "malformed escape sequence"),
            CompileErrorKind::InvalidRange => write!(f, "invalid character class range"),
            CompileErrorKind::NonAsciiInClass(c) => {
                write!(f, "character {c:?} does not fit a byte class")
            }
            CompileErrorKind::BackRefOutOfRange(n) => {
                write!(f, "back-reference ${n} outside 1..{MAX_CAPTURES}")
            }
            CompileErrorKind::BackRefBeyondCaptures(n) => {
                write!(f, "back-reference ${n} refers to a capture that does not exist")
            }
            CompileErrorKind::TooManyCaptures => {
                write!(f, "more than {MAX_CAPTURES} captures")
            }
            CompileErrorKind::MisplacedAnchor => {
                write!(f, "'$' anchor must be the last element of its sequence")
            }
            CompileErrorKind::UndeclaredNonTerminal(name) => {
                write!(f, "undeclared non-terminal '{name}'")
            }
            CompileErrorKind::DuplicateRule(name) => write!(f, "rule '{name}' defined twice"),
            CompileErrorKind::EmptyRepeat => {
                write!(f, "repeated pattern can match the empty string")
            }
            CompileErrorKind::ExpectedPattern => write!(f, "expected a pattern"),
            CompileErrorKind::TrailingInput => write!(f, "unexpected characters after pattern"),
        }
    }
}

impl std::error::Error for CompileError {}

/// Compile PEG source into a [`Grammar`].
///
/// The source is either a single pattern, a set of `Name <- ...` rules (the
/// first rule is the start), or a pattern followed by the rules it refers to.
pub fn compile(source: &str) -> Result<Grammar, CompileError> {
    Compiler {
        sc: Scanner::new(source),
        rules: Vec::new(),
        names: HashMap::new(),
        captures: 0,
        backrefs: Vec::new(),
        pending_header: None,
        first_declared: None,
    }
    .compile_grammar()
}

// ─── Scanner ────────────────────────────────────────────────────────────────

/// Character scanner with 1-based line/column tracking.
struct Scanner<'a> {
    chars: Peekable<Chars<'a>>,
    line: usize,
    column: usize,
}

impl<'a> Scanner<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().peekable(),
            line: 1,
            column: 1,
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn pos(&self) -> (usize, usize) {
        (self.line, self.column)
    }

    /// Consume a run of characters accepted by `pred`. The run must not
    /// contain newlines (true for identifier and digit runs).
    fn take_run(&mut self, pred: impl Fn(char) -> bool) -> String {
        let run: String = self.chars.peeking_take_while(|&c| pred(c)).collect();
        self.column += run.chars().count();
        run
    }

    /// Skip whitespace and `#`-to-end-of-line comments.
    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('#') => {
                    while let Some(c) = self.bump() {
                        if c == '\n' {
                            break;
                        }
                    }
                }
                _ => break,
            }
        }
    }
}

// ─── Parser ─────────────────────────────────────────────────────────────────

/// One parsed sequence element. End anchors are tracked so their placement
/// can be validated once the whole sequence is known.
struct SeqItem {
    pattern: Pattern,
    end_anchor: bool,
    line: usize,
    column: usize,
}

impl SeqItem {
    fn plain(pattern: Pattern, (line, column): (usize, usize)) -> Self {
        Self {
            pattern,
            end_anchor: false,
            line,
            column,
        }
    }
}

enum ClassAtom {
    Byte(u8),
    Set(ByteSet),
}

struct Compiler<'a> {
    sc: Scanner<'a>,
    rules: Vec<NonTerminal>,
    names: HashMap<String, usize>,
    captures: usize,
    /// `(slot, reverse, line, column)` of every parsed back-reference, for
    /// the finalization bounds check.
    backrefs: Vec<(usize, bool, usize, usize)>,
    /// Set when the parser runs into `Name <-`, which terminates the current
    /// rule body.
    pending_header: Option<(String, usize, usize)>,
    first_declared: Option<usize>,
}

impl Compiler<'_> {
    fn compile_grammar(mut self) -> Result<Grammar, CompileError> {
        self.sc.skip_trivia();
        let anon_pos = self.sc.pos();
        if self.sc.peek().is_none() {
            return Err(CompileError::new(CompileErrorKind::ExpectedPattern, anon_pos));
        }

        // Top-level anonymous pattern; empty when the source starts with a
        // rule definition.
        let anon = self.parse_choice()?;

        // Rule definitions.
        while let Some((name, line, column)) = self.pending_header.take() {
            self.expect_arrow()?;
            let idx = self.lookup_or_insert(&name, line, column);
            if self.rules[idx].declared {
                return Err(CompileError::new(
                    CompileErrorKind::DuplicateRule(name),
                    (line, column),
                ));
            }
            self.rules[idx].declared = true;
            self.rules[idx].line = line;
            self.rules[idx].column = column;
            if self.first_declared.is_none() {
                self.first_declared = Some(idx);
            }
            self.rules[idx].pattern = self.parse_choice()?;
        }

        self.sc.skip_trivia();
        if self.sc.peek().is_some() {
            return Err(CompileError::new(
                CompileErrorKind::TrailingInput,
                self.sc.pos(),
            ));
        }

        self.finalize(anon, anon_pos)
    }

    /// Consume the `<-` of a rule definition; the scanner sits on `<`.
    fn expect_arrow(&mut self) -> Result<(), CompileError> {
        let pos = self.sc.pos();
        self.sc.bump(); // '<'
        match self.sc.bump() {
            Some('-') => Ok(()),
            Some(c) => Err(CompileError::new(CompileErrorKind::UnexpectedChar(c), pos)),
            None => Err(CompileError::new(CompileErrorKind::UnexpectedEnd, pos)),
        }
    }

    fn parse_choice(&mut self) -> Result<Pattern, CompileError> {
        let mut alternatives = vec![self.parse_sequence()?];
        loop {
            self.sc.skip_trivia();
            if self.pending_header.is_some() {
                break;
            }
            if self.sc.peek() == Some('/') {
                self.sc.bump();
                alternatives.push(self.parse_sequence()?);
            } else {
                break;
            }
        }
        if alternatives.len() == 1 {
            Ok(alternatives.pop().unwrap())
        } else {
            Ok(Pattern::Choice(alternatives))
        }
    }

    fn parse_sequence(&mut self) -> Result<Pattern, CompileError> {
        let mut items = Vec::new();
        while let Some(item) = self.parse_prefixed()? {
            items.push(item);
        }
        // An end anchor is only legal as the final element.
        let last = items.len().wrapping_sub(1);
        if let Some((_, item)) = items
            .iter()
            .enumerate()
            .find(|(i, item)| item.end_anchor && *i != last)
        {
            return Err(CompileError::new(
                CompileErrorKind::MisplacedAnchor,
                (item.line, item.column),
            ));
        }
        let mut patterns: Vec<Pattern> = items.into_iter().map(|i| i.pattern).collect();
        Ok(match patterns.len() {
            0 => Pattern::Empty,
            1 => patterns.pop().unwrap(),
            _ => Pattern::Sequence(patterns),
        })
    }

    /// Parse one sequence element with prefix operators applied.
    ///
    /// Returns `None` at sequence terminators: `/`, `)`, `}`, end of input,
    /// or the start of the next rule definition.
    fn parse_prefixed(&mut self) -> Result<Option<SeqItem>, CompileError> {
        self.sc.skip_trivia();
        if self.pending_header.is_some() {
            return Ok(None);
        }
        let pos = self.sc.pos();
        match self.sc.peek() {
            None | Some('/') | Some(')') | Some('}') => Ok(None),
            Some('&') => {
                self.sc.bump();
                let inner = self.require_prefixed(pos)?;
                Ok(Some(SeqItem::plain(
                    Pattern::AndPredicate(Box::new(inner)),
                    pos,
                )))
            }
            Some('!') => {
                self.sc.bump();
                let inner = self.require_prefixed(pos)?;
                Ok(Some(SeqItem::plain(
                    Pattern::NotPredicate(Box::new(inner)),
                    pos,
                )))
            }
            Some('@') => {
                self.sc.bump();
                let inner = self.require_prefixed(pos)?;
                Ok(Some(SeqItem::plain(
                    Pattern::Search {
                        child: Box::new(inner),
                        slot: None,
                    },
                    pos,
                )))
            }
            _ => self.parse_suffixed(),
        }
    }

    /// A prefixed element that must be present (after `&`, `!`, `@`, `{@}`).
    fn require_prefixed(&mut self, pos: (usize, usize)) -> Result<Pattern, CompileError> {
        match self.parse_prefixed()? {
            Some(item) => Ok(item.pattern),
            None => Err(CompileError::new(CompileErrorKind::ExpectedPattern, pos)),
        }
    }

    fn parse_suffixed(&mut self) -> Result<Option<SeqItem>, CompileError> {
        let pos = self.sc.pos();
        let Some((mut pattern, mut end_anchor)) = self.parse_primary()? else {
            return Ok(None);
        };
        loop {
            let op_pos = self.sc.pos();
            match self.sc.peek() {
                Some('?') => {
                    self.sc.bump();
                    pattern = Pattern::Repeat {
                        child: Box::new(pattern),
                        min: 0,
                        greedy: false,
                    };
                    end_anchor = false;
                }
                Some(op @ ('*' | '+')) => {
                    self.sc.bump();
                    if pattern.can_match_empty() {
                        return Err(CompileError::new(CompileErrorKind::EmptyRepeat, op_pos));
                    }
                    pattern = Pattern::Repeat {
                        child: Box::new(pattern),
                        min: if op == '+' { 1 } else { 0 },
                        greedy: true,
                    };
                    end_anchor = false;
                }
                _ => break,
            }
        }
        Ok(Some(SeqItem {
            pattern,
            end_anchor,
            line: pos.0,
            column: pos.1,
        }))
    }

    /// Parse an atom. The `bool` marks an end anchor (`$` not followed by a
    /// capture index).
    fn parse_primary(&mut self) -> Result<Option<(Pattern, bool)>, CompileError> {
        let pos = self.sc.pos();
        let Some(c) = self.sc.peek() else {
            return Ok(None);
        };
        match c {
            '\'' => Ok(Some((self.parse_literal(CaseMode::Exact)?, false))),
            '[' => Ok(Some((self.parse_class()?, false))),
            '(' => {
                self.sc.bump();
                let inner = self.parse_choice()?;
                self.sc.skip_trivia();
                match self.sc.bump() {
                    Some(')') => Ok(Some((inner, false))),
                    _ => Err(CompileError::new(CompileErrorKind::UnclosedGroup, pos)),
                }
            }
            '{' => Ok(Some((self.parse_capture(pos)?, false))),
            '$' => {
                self.sc.bump();
                match self.sc.peek() {
                    Some(d) if d.is_ascii_digit() || d == '-' => {
                        Ok(Some((self.parse_backref(CaseMode::Exact, pos)?, false)))
                    }
                    // A bare `$` is the end-of-input anchor.
                    _ => Ok(Some((
                        Pattern::NotPredicate(Box::new(Pattern::AnyByte)),
                        true,
                    ))),
                }
            }
            '^' => {
                self.sc.bump();
                Ok(Some((Pattern::StartAnchor, false)))
            }
            '.' => {
                self.sc.bump();
                Ok(Some((Pattern::AnyRune, false)))
            }
            '_' if !self.underscore_starts_ident() => {
                self.sc.bump();
                Ok(Some((Pattern::AnyByte, false)))
            }
            '\\' => Ok(Some((self.parse_escape_pattern()?, false))),
            c if c.is_ascii_alphabetic() || c == '_' => self.parse_ident_primary(pos),
            c => Err(CompileError::new(CompileErrorKind::UnexpectedChar(c), pos)),
        }
    }

    /// `_x` is an identifier; a lone `_` is the any-byte pattern.
    fn underscore_starts_ident(&mut self) -> bool {
        let mut probe = self.sc.chars.clone();
        probe.next();
        matches!(probe.peek(), Some(&c) if c.is_ascii_alphanumeric() || c == '_')
    }

    fn parse_ident_primary(
        &mut self,
        pos: (usize, usize),
    ) -> Result<Option<(Pattern, bool)>, CompileError> {
        let ident = self.sc.take_run(|c| c.is_ascii_alphanumeric() || c == '_');
        // `i'...'` / `y'...'` literal modifiers, and `i$1` / `y$1` for
        // back-references.
        if ident == "i" || ident == "y" {
            let mode = if ident == "i" {
                CaseMode::IgnoreCase
            } else {
                CaseMode::IgnoreStyle
            };
            match self.sc.peek() {
                Some('\'') => return Ok(Some((self.parse_literal(mode)?, false))),
                Some('$') => {
                    self.sc.bump();
                    return Ok(Some((self.parse_backref(mode, pos)?, false)));
                }
                _ => {}
            }
        }
        self.sc.skip_trivia();
        if self.sc.peek() == Some('<') {
            // `Name <-`: the next rule definition begins here.
            self.pending_header = Some((ident, pos.0, pos.1));
            return Ok(None);
        }
        let idx = self.lookup_or_insert(&ident, pos.0, pos.1);
        self.rules[idx].used = true;
        Ok(Some((Pattern::NonTerminalRef(idx), false)))
    }

    /// `{a}` capture or `{@}a` captured search; the scanner sits on `{`.
    fn parse_capture(&mut self, pos: (usize, usize)) -> Result<Pattern, CompileError> {
        self.sc.bump(); // '{'
        let slot = self.alloc_capture(pos)?;
        if self.sc.peek() == Some('@') {
            self.sc.bump();
            match self.sc.bump() {
                Some('}') => {}
                _ => return Err(CompileError::new(CompileErrorKind::UnclosedCapture, pos)),
            }
            let child = self.require_prefixed(pos)?;
            return Ok(Pattern::Search {
                child: Box::new(child),
                slot: Some(slot),
            });
        }
        let inner = self.parse_choice()?;
        self.sc.skip_trivia();
        match self.sc.bump() {
            Some('}') => Ok(Pattern::Capture {
                child: Box::new(inner),
                slot,
            }),
            _ => Err(CompileError::new(CompileErrorKind::UnclosedCapture, pos)),
        }
    }

    fn alloc_capture(&mut self, pos: (usize, usize)) -> Result<usize, CompileError> {
        if self.captures == MAX_CAPTURES {
            return Err(CompileError::new(CompileErrorKind::TooManyCaptures, pos));
        }
        let slot = self.captures;
        self.captures += 1;
        Ok(slot)
    }

    /// `$N` / `$-N`; the `$` has been consumed.
    fn parse_backref(
        &mut self,
        mode: CaseMode,
        pos: (usize, usize),
    ) -> Result<Pattern, CompileError> {
        let reverse = if self.sc.peek() == Some('-') {
            self.sc.bump();
            true
        } else {
            false
        };
        let digits = self.sc.take_run(|c| c.is_ascii_digit());
        if digits.is_empty() {
            return Err(match self.sc.peek() {
                Some(c) => CompileError::new(CompileErrorKind::UnexpectedChar(c), pos),
                None => CompileError::new(CompileErrorKind::UnexpectedEnd, pos),
            });
        }
        let n: usize = digits.parse().unwrap_or(usize::MAX);
        if !(1..=MAX_CAPTURES).contains(&n) {
            return Err(CompileError::new(CompileErrorKind::BackRefOutOfRange(n), pos));
        }
        self.backrefs.push((n - 1, reverse, pos.0, pos.1));
        Ok(Pattern::BackRef {
            slot: n - 1,
            mode,
            reverse,
        })
    }

    /// `'...'` literal; the scanner sits on the opening quote.
    fn parse_literal(&mut self, case_mode: CaseMode) -> Result<Pattern, CompileError> {
        let pos = self.sc.pos();
        self.sc.bump(); // opening quote
        let mut text = String::new();
        loop {
            match self.sc.bump() {
                None => return Err(CompileError::new(CompileErrorKind::UnclosedLiteral, pos)),
                Some('\'') => break,
                Some('\\') => text.push(self.parse_literal_escape()?),
                Some(c) => text.push(c),
            }
        }
        Ok(Pattern::Literal { text, case_mode })
    }

    fn parse_literal_escape(&mut self) -> Result<char, CompileError> {
        let pos = self.sc.pos();
        match self.sc.bump() {
            Some('t') => Ok('\t'),
            Some('n') => Ok('\n'),
            Some('r') => Ok('\r'),
            Some('\\') => Ok('\\'),
            Some('\'') => Ok('\''),
            Some('x') => {
                let b = self.parse_hex_byte(pos)?;
                // Literal text is UTF-8; bytes past ASCII would not round-trip
                // as single bytes. Use a character class for those.
                if b < 0x80 {
                    Ok(b as char)
                } else {
                    Err(CompileError::new(CompileErrorKind::MalformedEscape, pos))
                }
            }
            _ => Err(CompileError::new(CompileErrorKind::MalformedEscape, pos)),
        }
    }

    fn parse_hex_byte(&mut self, pos: (usize, usize)) -> Result<u8, CompileError> {
        let mut value = 0u8;
        for _ in 0..2 {
            let digit = self
                .sc
                .bump()
                .and_then(|c| c.to_digit(16))
                .ok_or(CompileError::new(CompileErrorKind::MalformedEscape, pos))?;
            value = value * 16 + digit as u8;
        }
        Ok(value)
    }

    /// `[...]` character class; the scanner sits on `[`.
    fn parse_class(&mut self) -> Result<Pattern, CompileError> {
        let pos = self.sc.pos();
        self.sc.bump(); // '['
        let negated = if self.sc.peek() == Some('^') {
            self.sc.bump();
            true
        } else {
            false
        };
        let mut set = ByteSet::empty();
        loop {
            match self.sc.peek() {
                None => return Err(CompileError::new(CompileErrorKind::UnclosedClass, pos)),
                Some(']') => {
                    self.sc.bump();
                    break;
                }
                _ => {}
            }
            let atom_pos = self.sc.pos();
            match self.parse_class_atom(pos)? {
                ClassAtom::Set(s) => set.union_with(&s),
                ClassAtom::Byte(lo) => {
                    if self.sc.peek() == Some('-') {
                        self.sc.bump();
                        if self.sc.peek() == Some(']') {
                            // Trailing '-' is a literal member.
                            set.insert(lo);
                            set.insert(b'-');
                        } else {
                            match self.parse_class_atom(pos)? {
                                ClassAtom::Byte(hi) if lo <= hi => set.insert_range(lo, hi),
                                _ => {
                                    return Err(CompileError::new(
                                        CompileErrorKind::InvalidRange,
                                        atom_pos,
                                    ));
                                }
                            }
                        }
                    } else {
                        set.insert(lo);
                    }
                }
            }
        }
        if negated {
            set.negate();
        }
        Ok(Pattern::CharSet(set))
    }

    fn parse_class_atom(&mut self, class_pos: (usize, usize)) -> Result<ClassAtom, CompileError> {
        let pos = self.sc.pos();
        match self.sc.bump() {
            None => Err(CompileError::new(CompileErrorKind::UnclosedClass, class_pos)),
            Some('\\') => match self.sc.bump() {
                None => Err(CompileError::new(CompileErrorKind::UnclosedClass, class_pos)),
                Some('t') => Ok(ClassAtom::Byte(b'\t')),
                Some('n') => Ok(ClassAtom::Byte(b'\n')),
                Some('r') => Ok(ClassAtom::Byte(b'\r')),
                Some(c @ ('\\' | ']' | '-' | '^')) => Ok(ClassAtom::Byte(c as u8)),
                Some('x') => Ok(ClassAtom::Byte(self.parse_hex_byte(pos)?)),
                Some('d') => Ok(ClassAtom::Set(ByteSet::ascii_digits())),
                Some('s') => Ok(ClassAtom::Set(ByteSet::ascii_whitespace())),
                Some('w') => Ok(ClassAtom::Set(ByteSet::word_chars())),
                Some('a') => Ok(ClassAtom::Set(ByteSet::ascii_letters())),
                Some(_) => Err(CompileError::new(CompileErrorKind::MalformedEscape, pos)),
            },
            Some(c) if (c as u32) <= 0xff => Ok(ClassAtom::Byte(c as u8)),
            Some(c) => Err(CompileError::new(CompileErrorKind::NonAsciiInClass(c), pos)),
        }
    }

    /// A `\`-escape in pattern position; the scanner sits on the backslash.
    fn parse_escape_pattern(&mut self) -> Result<Pattern, CompileError> {
        let pos = self.sc.pos();
        self.sc.bump(); // '\'
        match self.sc.peek() {
            None => Err(CompileError::new(CompileErrorKind::UnexpectedEnd, pos)),
            Some('x') => {
                self.sc.bump();
                let b = self.parse_hex_byte(pos)?;
                let mut set = ByteSet::empty();
                set.insert(b);
                Ok(Pattern::CharSet(set))
            }
            Some(c) if c.is_ascii_digit() => {
                Err(CompileError::new(CompileErrorKind::MalformedEscape, pos))
            }
            Some(c) if c.is_ascii_alphabetic() => {
                let word = self.sc.take_run(|c| c.is_ascii_alphanumeric());
                match CLASS_KEYWORDS.get(word.as_str()) {
                    Some(keyword) => Ok(keyword.to_pattern()),
                    None => Err(CompileError::new(CompileErrorKind::MalformedEscape, pos)),
                }
            }
            Some(c) => {
                // Escaped metacharacter, matched literally.
                self.sc.bump();
                Ok(Pattern::Literal {
                    text: c.to_string(),
                    case_mode: CaseMode::Exact,
                })
            }
        }
    }

    fn lookup_or_insert(&mut self, name: &str, line: usize, column: usize) -> usize {
        if let Some(&idx) = self.names.get(name) {
            return idx;
        }
        let idx = self.rules.len();
        self.rules.push(NonTerminal {
            name: name.to_string(),
            line,
            column,
            declared: false,
            used: false,
            pattern: Pattern::Empty,
        });
        self.names.insert(name.to_string(), idx);
        idx
    }

    // ─── Finalization ───────────────────────────────────────────────────────

    fn finalize(
        mut self,
        anon: Pattern,
        anon_pos: (usize, usize),
    ) -> Result<Grammar, CompileError> {
        for rule in &self.rules {
            if rule.used && !rule.declared {
                return Err(CompileError::new(
                    CompileErrorKind::UndeclaredNonTerminal(rule.name.clone()),
                    (rule.line, rule.column),
                ));
            }
        }
        for &(slot, _reverse, line, column) in &self.backrefs {
            if slot + 1 > self.captures {
                return Err(CompileError::new(
                    CompileErrorKind::BackRefBeyondCaptures(slot + 1),
                    (line, column),
                ));
            }
        }

        let start = if matches!(anon, Pattern::Empty) {
            match self.first_declared {
                Some(idx) => idx,
                None => {
                    return Err(CompileError::new(
                        CompileErrorKind::ExpectedPattern,
                        anon_pos,
                    ));
                }
            }
        } else {
            self.rules.push(NonTerminal {
                name: String::new(),
                line: anon_pos.0,
                column: anon_pos.1,
                declared: false,
                used: true,
                pattern: anon,
            });
            self.rules.len() - 1
        };

        self.inline_small_rules();
        Ok(Grammar::new(self.rules, start, self.captures))
    }

    /// Replace references to small, acyclic, capture-free rules with copies
    /// of their bodies.
    fn inline_small_rules(&mut self) {
        let n = self.rules.len();
        let mut refs = vec![Vec::new(); n];
        for (i, rule) in self.rules.iter().enumerate() {
            rule.pattern.collect_refs(&mut refs[i]);
        }
        let mut cyclic = vec![false; n];
        for (i, flag) in cyclic.iter_mut().enumerate() {
            let mut stack = refs[i].clone();
            let mut seen = vec![false; n];
            while let Some(j) = stack.pop() {
                if j == i {
                    *flag = true;
                    break;
                }
                if !seen[j] {
                    seen[j] = true;
                    stack.extend(refs[j].iter().copied());
                }
            }
        }
        let eligible: Vec<bool> = (0..n)
            .map(|i| {
                self.rules[i].declared
                    && !cyclic[i]
                    && self.rules[i].pattern.node_count() <= INLINE_NODE_LIMIT
                    && !self.rules[i].pattern.has_captures()
            })
            .collect();
        if !eligible.contains(&true) {
            return;
        }
        let mut inliner = Inliner {
            rules: &self.rules,
            eligible: &eligible,
            cache: HashMap::new(),
        };
        let new_patterns: Vec<Pattern> = (0..n)
            .map(|i| inliner.substitute(self.rules[i].pattern.clone()))
            .collect();
        for (rule, pattern) in self.rules.iter_mut().zip(new_patterns) {
            rule.pattern = pattern;
        }
    }
}

/// Memoized rule-body expansion. Eligible rules reference each other
/// acyclically, so the recursion terminates.
struct Inliner<'a> {
    rules: &'a [NonTerminal],
    eligible: &'a [bool],
    cache: HashMap<usize, Pattern>,
}

impl Inliner<'_> {
    fn expanded(&mut self, idx: usize) -> Pattern {
        if let Some(p) = self.cache.get(&idx) {
            return p.clone();
        }
        let p = self.substitute(self.rules[idx].pattern.clone());
        self.cache.insert(idx, p.clone());
        p
    }

    fn substitute(&mut self, pattern: Pattern) -> Pattern {
        match pattern {
            Pattern::NonTerminalRef(idx) if self.eligible[idx] => self.expanded(idx),
            Pattern::Sequence(children) => {
                Pattern::Sequence(children.into_iter().map(|c| self.substitute(c)).collect())
            }
            Pattern::Choice(children) => {
                Pattern::Choice(children.into_iter().map(|c| self.substitute(c)).collect())
            }
            Pattern::Repeat { child, min, greedy } => Pattern::Repeat {
                child: Box::new(self.substitute(*child)),
                min,
                greedy,
            },
            Pattern::Search { child, slot } => Pattern::Search {
                child: Box::new(self.substitute(*child)),
                slot,
            },
            Pattern::AndPredicate(child) => {
                Pattern::AndPredicate(Box::new(self.substitute(*child)))
            }
            Pattern::NotPredicate(child) => {
                Pattern::NotPredicate(Box::new(self.substitute(*child)))
            }
            Pattern::Capture { child, slot } => Pattern::Capture {
                child: Box::new(self.substitute(*child)),
                slot,
            },
            other => other,
        }
    }
}

/// Builtin classes reachable as `\name`. Keys are case-sensitive:
/// `\d` and `\D` are complementary.
#[derive(Debug, Clone, Copy)]
enum ClassKeyword {
    Tab,
    CarriageReturn,
    Newline,
    Digit,
    NotDigit,
    Space,
    NotSpace,
    Word,
    NotWord,
    AsciiLetter,
    NotAsciiLetter,
    Ident,
    Letter,
    Lower,
    Upper,
    Title,
    White,
}

const CLASS_KEYWORDS: Map<&'static str, ClassKeyword> = phf_map! {
    "t" => ClassKeyword::Tab,
    "r" => ClassKeyword::CarriageReturn,
    "n" => ClassKeyword::Newline,
    "d" => ClassKeyword::Digit,
    "D" => ClassKeyword::NotDigit,
    "s" => ClassKeyword::Space,
    "S" => ClassKeyword::NotSpace,
    "w" => ClassKeyword::Word,
    "W" => ClassKeyword::NotWord,
    "a" => ClassKeyword::AsciiLetter,
    "A" => ClassKeyword::NotAsciiLetter,
    "ident" => ClassKeyword::Ident,
    "letter" => ClassKeyword::Letter,
    "lower" => ClassKeyword::Lower,
    "upper" => ClassKeyword::Upper,
    "title" => ClassKeyword::Title,
    "white" => ClassKeyword::White,
};

impl ClassKeyword {
    fn to_pattern(self) -> Pattern {
        let negated = |mut set: ByteSet| {
            set.negate();
            Pattern::CharSet(set)
        };
        match self {
            ClassKeyword::Tab => Pattern::Literal {
                text: "\t".into(),
                case_mode: CaseMode::Exact,
            },
            ClassKeyword::CarriageReturn => Pattern::Literal {
                text: "\r".into(),
                case_mode: CaseMode::Exact,
            },
            ClassKeyword::Newline => Pattern::NewLine,
            ClassKeyword::Digit => Pattern::CharSet(ByteSet::ascii_digits()),
            ClassKeyword::NotDigit => negated(ByteSet::ascii_digits()),
            ClassKeyword::Space => Pattern::CharSet(ByteSet::ascii_whitespace()),
            ClassKeyword::NotSpace => negated(ByteSet::ascii_whitespace()),
            ClassKeyword::Word => Pattern::CharSet(ByteSet::word_chars()),
            ClassKeyword::NotWord => negated(ByteSet::word_chars()),
            ClassKeyword::AsciiLetter => Pattern::CharSet(ByteSet::ascii_letters()),
            ClassKeyword::NotAsciiLetter => negated(ByteSet::ascii_letters()),
            ClassKeyword::Ident => Pattern::Sequence(vec![
                Pattern::CharSet(ByteSet::ident_start_chars()),
                Pattern::Repeat {
                    child: Box::new(Pattern::CharSet(ByteSet::word_chars())),
                    min: 0,
                    greedy: true,
                },
            ]),
            ClassKeyword::Letter => Pattern::UnicodeClass(UnicodeClass::Letter),
            ClassKeyword::Lower => Pattern::UnicodeClass(UnicodeClass::Lower),
            ClassKeyword::Upper => Pattern::UnicodeClass(UnicodeClass::Upper),
            ClassKeyword::Title => Pattern::UnicodeClass(UnicodeClass::Title),
            ClassKeyword::White => Pattern::UnicodeClass(UnicodeClass::White),
        }
    }
}
