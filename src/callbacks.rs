//! Typed transaction callbacks.
//!
//! Callbacks are owned closures registered on a cell; their captured state
//! is dropped with the cell, so payload cleanup needs no dedicated event.
//! Invocation snapshots the relevant facts into a small info struct instead
//! of exposing the locked cell state.

use std::net::SocketAddr;

use crate::cell::Cell;

/// Facts passed to a final-reply callback.
#[derive(Debug, Clone, Copy)]
pub struct FinalInfo {
    /// The upstream-visible final status.
    pub code: u16,
    /// The branch that won the pick, when the final came from a branch.
    pub branch: Option<usize>,
    /// Whether the transaction is engine-originated (no upstream).
    pub local: bool,
}

/// Facts passed to a failure callback before a negative final is committed.
#[derive(Debug, Clone, Copy)]
pub struct FailureInfo {
    /// The branch the picking algorithm selected.
    pub branch: usize,
    /// Its status code.
    pub code: u16,
    /// Current branch count.
    pub branches: usize,
}

/// What a failure callback wants done.
pub enum FailureAction {
    /// Accept the negative final as-is.
    Complete,
    /// Extend the transaction with serial-fork branches toward these
    /// destinations; the negative decision is deferred until they conclude.
    Fork(Vec<SocketAddr>),
}

pub type FinalFn = Box<dyn Fn(&Cell, &FinalInfo) + Send + Sync>;
pub type FailureFn = Box<dyn Fn(&Cell, &FailureInfo) -> FailureAction + Send + Sync>;
pub type AckFn = Box<dyn Fn(&Cell, &[u8]) + Send + Sync>;
pub type DestroyFn = Box<dyn FnOnce(&Cell) + Send>;

/// Per-cell callback registry.
#[derive(Default)]
pub struct CallbackSet {
    pub(crate) finals: Vec<FinalFn>,
    pub(crate) failures: Vec<FailureFn>,
    pub(crate) acks: Vec<AckFn>,
    pub(crate) destroys: Vec<DestroyFn>,
}

impl CallbackSet {
    pub fn is_empty(&self) -> bool {
        self.finals.is_empty()
            && self.failures.is_empty()
            && self.acks.is_empty()
            && self.destroys.is_empty()
    }

    /// Moves every registration from `other` into `self`, preserving
    /// registration order within each kind.
    pub(crate) fn absorb(&mut self, mut other: CallbackSet) {
        self.finals.append(&mut other.finals);
        self.failures.append(&mut other.failures);
        self.acks.append(&mut other.acks);
        self.destroys.append(&mut other.destroys);
    }
}

impl std::fmt::Debug for CallbackSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackSet")
            .field("finals", &self.finals.len())
            .field("failures", &self.failures.len())
            .field("acks", &self.acks.len())
            .field("destroys", &self.destroys.len())
            .finish()
    }
}
