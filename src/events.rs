//! Event-driven traversal: the ordinary matcher with enter/leave callbacks.
//!
//! Handlers are registered per node kind in an [`EventHandlers`] table and
//! fire for every evaluated node of that kind: `enter(kind, offset)` before
//! the node is tried, `leave(kind, offset, result)` after, where `result` is
//! the matched byte length or `None`. This is the hook for building custom
//! interpreters on top of the engine without writing a second matcher.

use crate::ast::{Grammar, PatternKind};
use crate::matcher::{MatchState, raw_match};

type EnterFn<'c> = Box<dyn FnMut(PatternKind, usize) + 'c>;
type LeaveFn<'c> = Box<dyn FnMut(PatternKind, usize, Option<usize>) + 'c>;

/// Table of per-kind enter/leave callbacks.
///
/// Node kinds without a registered handler cost one branch per node; the
/// matcher itself is shared with the plain entry points.
pub struct EventHandlers<'c> {
    enter: [Option<EnterFn<'c>>; PatternKind::COUNT],
    leave: [Option<LeaveFn<'c>>; PatternKind::COUNT],
}

impl<'c> EventHandlers<'c> {
    pub fn new() -> Self {
        Self {
            enter: std::array::from_fn(|_| None),
            leave: std::array::from_fn(|_| None),
        }
    }

    /// Register an enter callback for `kind`, replacing any previous one.
    pub fn on_enter(mut self, kind: PatternKind, f: impl FnMut(PatternKind, usize) + 'c) -> Self {
        self.enter[kind.index()] = Some(Box::new(f));
        self
    }

    /// Register a leave callback for `kind`, replacing any previous one.
    pub fn on_leave(
        mut self,
        kind: PatternKind,
        f: impl FnMut(PatternKind, usize, Option<usize>) + 'c,
    ) -> Self {
        self.leave[kind.index()] = Some(Box::new(f));
        self
    }

    pub(crate) fn fire_enter(&mut self, kind: PatternKind, offset: usize) {
        if let Some(f) = &mut self.enter[kind.index()] {
            f(kind, offset);
        }
    }

    pub(crate) fn fire_leave(&mut self, kind: PatternKind, offset: usize, result: Option<usize>) {
        if let Some(f) = &mut self.leave[kind.index()] {
            f(kind, offset, result);
        }
    }
}

impl Default for EventHandlers<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Match `grammar` against `input` from offset 0, firing the registered
/// callbacks around every evaluated node. Returns the matched byte length.
pub fn event_parse(grammar: &Grammar, handlers: &mut EventHandlers, input: &str) -> Option<usize> {
    let mut state = MatchState::with_handlers(handlers);
    let result = raw_match(grammar.start_pattern(), grammar, input.as_bytes(), 0, &mut state);
    if state.limit_exceeded() {
        return None;
    }
    result
}
