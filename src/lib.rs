//! A PEG (Parsing Expression Grammar) matching engine.
//!
//! Pattern source compiles once into an immutable [`Grammar`], which can then
//! be matched against any number of inputs, shared freely across threads.
//! Choice is ordered (first match wins), repetition is greedy and never gives
//! back input, and up to [`MAX_CAPTURES`] sub-matches can be captured and
//! back-referenced.
//!
//! # Example
//!
//! ```rust
//! use picket::{compile, match_captures, matches, ops};
//!
//! let assignment = compile(r"{\ident} \s* '=' \s* {\w+}").unwrap();
//!
//! assert!(matches(&assignment, "answer = 42", 0));
//! assert_eq!(
//!     match_captures(&assignment, "answer = 42", 0),
//!     Some(vec![(0, 6), (9, 11)]),
//! );
//!
//! let numbers = compile(r"\d+").unwrap();
//! assert_eq!(ops::replace_literal("aaa123bbb", &numbers, "NUM"), "aaaNUMbbb");
//! ```

mod ast;
mod captures;
mod charset;
mod compiler;
mod events;
mod matcher;
pub mod ops;

pub use ast::{CaseMode, Grammar, NonTerminal, Pattern, PatternKind, UnicodeClass};
pub use captures::{Captures, MAX_CAPTURES};
pub use charset::ByteSet;
pub use compiler::{CompileError, CompileErrorKind, compile};
pub use events::{EventHandlers, event_parse};
pub use matcher::{
    MAX_RECURSION_DEPTH, MatchError, MatchState, match_captures, match_len, matches, raw_match,
    try_match_len,
};
pub use ops::{
    FindAll, Split, escape_pattern, find, find_all, replace_callback, replace_formatted,
    replace_literal, replace_parallel, split,
};
