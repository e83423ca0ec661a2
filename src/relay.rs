//! The reply-relay decision machine.
//!
//! For each reply arriving on a branch, [`process_reply`] decides whether
//! it is discarded, stored for later, relayed upstream, or completes the
//! transaction, and reports which sibling branches must be CANCELled. The
//! caller holds the per-cell reply lock for the whole call and applies the
//! outcome (sending, timer changes, callbacks) afterwards.
//!
//! The decision order is fixed:
//!
//! 1. post-completion handling (only a forked INVITE 2xx survives, and it
//!    is recorded as an extra To-tag rather than relayed again),
//! 2. per-branch status monotonicity (with the synthesized-408-then-real-487
//!    tolerance),
//! 3. 6xx wins immediately; other negatives go through branch picking,
//! 4. DNS failover may defer a negative pick by adding branches,
//! 5. failure callbacks run once per branch-count-stable negative pick,
//! 6. provisionals relay without completing (100 is absorbed), 2xx relays
//!    and completes.

use crate::cancel::which_cancel;
use crate::cell::{CancelSlot, Cell, CellState, ReplySlot, UacBranch};
use crate::config::EngineConfig;

/// What to do with the reply that was just processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyDecision {
    /// Drop it (retransmission, absorbed 100, post-final noise).
    Discarded,
    /// Recorded on its branch; the upstream decision is deferred.
    Stored,
    /// Relay this provisional upstream; the transaction stays open.
    Provisional(usize),
    /// Relay the final from this branch upstream; the transaction is
    /// complete.
    Completed(usize),
    /// A forked 2xx arrived after completion; its To-tag was recorded but
    /// nothing is relayed again.
    PushedAfterCompletion(usize),
}

/// Decision plus the side effects the caller must apply.
#[derive(Debug)]
pub struct RelayOutcome {
    pub decision: ReplyDecision,
    /// Branches claimed for cancellation (cancel slots already set to
    /// `InProgress`); the caller generates and sends the CANCELs.
    pub cancel_bitmap: u32,
    /// A new forked-2xx To-tag was recorded by this reply.
    pub totag_added: bool,
}

impl RelayOutcome {
    fn plain(decision: ReplyDecision) -> Self {
        Self {
            decision,
            cancel_bitmap: 0,
            totag_added: false,
        }
    }
}

/// Result of the branch-picking algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PickResult {
    /// Some branch has no final reply yet; decision deferred.
    Pending,
    /// The branch whose final should be relayed upstream.
    Picked(usize),
}

/// Mutation hooks the decision machine may invoke before committing a
/// negative final. Both run under the caller's reply lock and report how
/// many branches they added.
pub trait RelayHooks {
    /// Add a failover branch for `branch`'s next alternate destination.
    fn dns_failover(&mut self, cell: &Cell, state: &mut CellState, branch: usize) -> usize;

    /// Run the registered failure callbacks for the picked negative branch.
    fn run_failure_callbacks(&mut self, cell: &Cell, state: &mut CellState, picked: usize)
        -> usize;
}

/// Hooks that never extend the transaction.
pub struct NoHooks;

impl RelayHooks for NoHooks {
    fn dns_failover(&mut self, _cell: &Cell, _state: &mut CellState, _branch: usize) -> usize {
        0
    }

    fn run_failure_callbacks(
        &mut self,
        _cell: &Cell,
        _state: &mut CellState,
        _picked: usize,
    ) -> usize {
        0
    }
}

/// Picks the negative final to relay upstream.
///
/// Lowest status code wins; 487 is preferred over anything once the
/// transaction was cancelled; 503 loses to every other code. Ties break
/// toward the earliest branch (stable, no reordering). Branches that
/// concluded with a 2xx are outside negative picking. Returns
/// [`PickResult::Pending`] while any branch lacks a final reply.
pub fn pick_branch(state: &CellState, cancelled: bool) -> PickResult {
    let mut best: Option<(usize, u32)> = None;
    for (index, branch) in state.branches.iter().enumerate() {
        let code = branch.reply.code();
        if code < 200 {
            return PickResult::Pending;
        }
        if (200..300).contains(&code) {
            continue;
        }
        let score = if cancelled && code == 487 {
            0
        } else if code == 503 {
            u32::MAX
        } else {
            code as u32
        };
        let better = match best {
            None => true,
            Some((_, current)) => score < current,
        };
        if better {
            best = Some((index, score));
        }
    }
    match best {
        Some((index, _)) => PickResult::Picked(index),
        None => PickResult::Pending,
    }
}

/// Whether DNS failover applies to a concluded branch: a synthesized 408
/// with no real reply ever seen, or a 503 carrying Retry-After, and only
/// while alternate destinations remain.
fn failover_eligible(branch: &UacBranch) -> bool {
    if branch.alt_dests.is_empty() {
        return false;
    }
    match &branch.reply {
        ReplySlot::Faked(408) => !branch.replied,
        ReplySlot::Real(view) => view.status == 503 && view.has_retry_after,
        _ => false,
    }
}

/// Runs the decision machine for a reply with status `incoming.code()`
/// received on `branch`. The caller holds the per-cell reply lock.
pub fn process_reply(
    cell: &Cell,
    state: &mut CellState,
    branch: usize,
    incoming: ReplySlot,
    cfg: &EngineConfig,
    hooks: &mut dyn RelayHooks,
) -> RelayOutcome {
    let code = incoming.code();

    // Rule 1: a final was already sent upstream.
    if state.status >= 200 {
        if code == 0 {
            // zero-code completion is only valid for a hop-by-hop cancelled
            // transaction winding down
            if state.flags.hop_by_hop_cancel {
                return RelayOutcome::plain(ReplyDecision::Completed(branch));
            }
            return RelayOutcome::plain(ReplyDecision::Discarded);
        }
        if cell.is_invite() && (200..300).contains(&code) {
            let tag = match &incoming {
                ReplySlot::Real(view) => Some(view.to_tag.clone()),
                _ => None,
            };
            {
                let b = state.branch_mut(branch);
                b.last_received = code;
                if matches!(incoming, ReplySlot::Real(_)) {
                    b.replied = true;
                }
                if !b.reply.is_final() {
                    b.reply = incoming;
                }
            }
            let added = match tag {
                Some(tag) => state.record_totag(&tag),
                None => false,
            };
            if !added {
                // same To-tag seen before: a plain 200 retransmission
                return RelayOutcome::plain(ReplyDecision::Discarded);
            }
            tracing::debug!(id = %cell.id(), branch, "late forked 2xx, To-tag recorded");
            return RelayOutcome {
                decision: ReplyDecision::PushedAfterCompletion(branch),
                cancel_bitmap: 0,
                totag_added: true,
            };
        }
        return RelayOutcome::plain(ReplyDecision::Discarded);
    }

    if code == 0 {
        return RelayOutcome::plain(ReplyDecision::Discarded);
    }

    // Rule 2: the branch already concluded.
    {
        let prev = &state.branch(branch).reply;
        if prev.is_final() {
            let tolerated = prev.is_faked() && prev.code() == 408 && code == 487;
            if !tolerated {
                return RelayOutcome::plain(ReplyDecision::Discarded);
            }
        }
    }

    // Record the arrival.
    {
        let b = state.branch_mut(branch);
        b.last_received = code;
        if matches!(incoming, ReplySlot::Real(_)) {
            b.replied = true;
            if (101..200).contains(&code) {
                b.provisioned = true;
            }
        }
    }

    // Rule 6a: provisionals.
    if code < 200 {
        let mut bitmap = 0u32;
        let b = state.branch_mut(branch);
        if b.cancel_on_reply && b.provisioned && b.cancel.is_empty() {
            b.cancel_on_reply = false;
            b.cancel = CancelSlot::InProgress;
            bitmap |= 1 << branch;
        }
        let decision = if code == 100 {
            ReplyDecision::Discarded
        } else {
            ReplyDecision::Provisional(branch)
        };
        return RelayOutcome {
            decision,
            cancel_bitmap: bitmap,
            totag_added: false,
        };
    }

    // Final reply: keep it on the branch.
    let tag = match &incoming {
        ReplySlot::Real(view) => Some(view.to_tag.clone()),
        _ => None,
    };
    state.branch_mut(branch).reply = incoming;

    // Rule 6b: 2xx relays and completes.
    if (200..300).contains(&code) {
        state.status = code;
        state.flags.no_new_branches = true;
        let totag_added = match tag {
            Some(tag) => state.record_totag(&tag),
            None => false,
        };
        let bitmap = which_cancel(state);
        tracing::debug!(id = %cell.id(), branch, code, "2xx completes the transaction");
        return RelayOutcome {
            decision: ReplyDecision::Completed(branch),
            cancel_bitmap: bitmap,
            totag_added,
        };
    }

    // Rule 3: 6xx wins immediately, branch set frozen.
    if code >= 600 {
        state.flags.no_new_branches = true;
        let bitmap = which_cancel(state);
        hooks.run_failure_callbacks(cell, state, branch);
        state.status = code;
        tracing::debug!(id = %cell.id(), branch, code, "6xx wins immediately");
        return RelayOutcome {
            decision: ReplyDecision::Completed(branch),
            cancel_bitmap: bitmap,
            totag_added: false,
        };
    }

    // Rules 3-5: negative picking with failover and failure callbacks.
    match pick_branch(state, state.flags.was_cancelled) {
        PickResult::Pending => RelayOutcome::plain(ReplyDecision::Stored),
        PickResult::Picked(picked) => {
            if cfg.dns_failover && !state.flags.no_dns_failover && !state.flags.no_new_branches {
                let mut added = 0;
                for index in 0..state.branches.len() {
                    if failover_eligible(state.branch(index)) {
                        added += hooks.dns_failover(cell, state, index);
                    }
                }
                if added > 0 {
                    tracing::debug!(id = %cell.id(), added, "negative pick deferred to failover");
                    return RelayOutcome::plain(ReplyDecision::Stored);
                }
            }
            if state.failure_watermark != Some(state.branches.len()) {
                state.failure_watermark = Some(state.branches.len());
                let added = hooks.run_failure_callbacks(cell, state, picked);
                if added > 0 {
                    tracing::debug!(id = %cell.id(), added, "negative pick deferred to new branches");
                    return RelayOutcome::plain(ReplyDecision::Stored);
                }
            }
            let final_code = state.branch(picked).reply.code();
            state.status = final_code;
            tracing::debug!(id = %cell.id(), picked, final_code, "negative final relayed");
            RelayOutcome::plain(ReplyDecision::Completed(picked))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::test_support::{minimal_cell, minimal_request};
    use crate::msg::{Method, ReplyView};
    use crate::table::CellId;
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::time::Duration;

    fn new_cell() -> Arc<Cell> {
        minimal_cell(CellId {
            hash_index: 3,
            label: 9,
        })
    }

    fn add_branch(state: &mut CellState) -> usize {
        let b = UacBranch::new(
            minimal_request(),
            Bytes::new(),
            "10.0.0.2:5060".parse().unwrap(),
            VecDeque::new(),
            Duration::from_millis(500),
        );
        state.branches.push(b);
        state.branches.len() - 1
    }

    fn reply(code: u16, to_tag: &'static [u8]) -> ReplySlot {
        ReplySlot::Real(ReplyView {
            raw: Bytes::from_static(b"raw"),
            status: code,
            reason: Bytes::new(),
            via_branch: Bytes::new(),
            call_id: Bytes::from_static(b"cid@host"),
            cseq_num: 1,
            cseq_method: Method::Invite,
            from_tag: Bytes::from_static(b"ft"),
            to_tag: Bytes::from_static(to_tag),
            has_retry_after: false,
        })
    }

    fn process(
        cell: &Cell,
        state: &mut CellState,
        branch: usize,
        incoming: ReplySlot,
    ) -> RelayOutcome {
        let cfg = EngineConfig::default();
        process_reply(cell, state, branch, incoming, &cfg, &mut NoHooks)
    }

    #[test]
    fn provisional_relays_and_100_is_absorbed() {
        let cell = new_cell();
        let mut state = cell.lock();
        let b = add_branch(&mut state);
        let out = process(&cell, &mut state, b, reply(100, b""));
        assert_eq!(out.decision, ReplyDecision::Discarded);
        let out = process(&cell, &mut state, b, reply(180, b"t0"));
        assert_eq!(out.decision, ReplyDecision::Provisional(b));
        assert!(state.branch(b).provisioned);
        assert_eq!(state.status, 0);
    }

    #[test]
    fn branch_status_is_monotonic() {
        let cell = new_cell();
        let mut state = cell.lock();
        let b0 = add_branch(&mut state);
        let b1 = add_branch(&mut state);
        let out = process(&cell, &mut state, b0, reply(404, b""));
        assert_eq!(out.decision, ReplyDecision::Stored);
        // a different final on the same branch is a retransmission at best
        let out = process(&cell, &mut state, b0, reply(486, b""));
        assert_eq!(out.decision, ReplyDecision::Discarded);
        assert_eq!(state.branch(b0).reply.code(), 404);
        let _ = b1;
    }

    #[test]
    fn lone_branch_timeout_completes_with_408() {
        let cell = new_cell();
        let mut state = cell.lock();
        let b = add_branch(&mut state);
        let out = process(&cell, &mut state, b, ReplySlot::Faked(408));
        assert_eq!(out.decision, ReplyDecision::Completed(b));
        assert_eq!(state.status, 408);
    }

    #[test]
    fn synthetic_408_tolerates_real_487() {
        let cell = new_cell();
        let mut state = cell.lock();
        let b0 = add_branch(&mut state);
        let b1 = add_branch(&mut state);
        let out = process(&cell, &mut state, b0, ReplySlot::Faked(408));
        assert_eq!(out.decision, ReplyDecision::Stored);
        // the real 487 overrides the synthesized timeout
        let out = process(&cell, &mut state, b0, reply(487, b""));
        assert_eq!(out.decision, ReplyDecision::Stored);
        assert_eq!(state.branch(b0).reply.code(), 487);
        let _ = b1;
    }

    #[test]
    fn pick_prefers_lowest_and_demotes_503() {
        let cell = new_cell();
        let mut state = cell.lock();
        for _ in 0..3 {
            add_branch(&mut state);
        }
        state.branches[0].reply = reply(503, b"");
        state.branches[1].reply = reply(404, b"");
        state.branches[2].reply = reply(200, b"ta");
        assert_eq!(pick_branch(&state, false), PickResult::Picked(1));
    }

    #[test]
    fn pick_prefers_487_when_cancelled() {
        let cell = new_cell();
        let mut state = cell.lock();
        add_branch(&mut state);
        add_branch(&mut state);
        state.branches[0].reply = reply(487, b"");
        state.branches[1].reply = reply(404, b"");
        assert_eq!(pick_branch(&state, true), PickResult::Picked(0));
        assert_eq!(pick_branch(&state, false), PickResult::Picked(1));
    }

    #[test]
    fn pick_ties_break_toward_earliest_branch() {
        let cell = new_cell();
        let mut state = cell.lock();
        add_branch(&mut state);
        add_branch(&mut state);
        state.branches[0].reply = reply(486, b"");
        state.branches[1].reply = reply(486, b"");
        assert_eq!(pick_branch(&state, false), PickResult::Picked(0));
    }

    #[test]
    fn pick_defers_while_any_branch_pending() {
        let cell = new_cell();
        let mut state = cell.lock();
        add_branch(&mut state);
        add_branch(&mut state);
        state.branches[0].reply = reply(404, b"");
        assert_eq!(pick_branch(&state, false), PickResult::Pending);
    }

    #[test]
    fn six_hundred_wins_immediately() {
        let cell = new_cell();
        let mut state = cell.lock();
        let b0 = add_branch(&mut state);
        let b1 = add_branch(&mut state);
        state.branches[b1].provisioned = true;
        state.branches[b1].last_received = 180;
        state.branches[b1].replied = true;
        let out = process(&cell, &mut state, b0, reply(603, b""));
        assert_eq!(out.decision, ReplyDecision::Completed(b0));
        assert_eq!(state.status, 603);
        assert!(state.flags.no_new_branches);
        // the ringing sibling was claimed for cancellation
        assert_eq!(out.cancel_bitmap, 1 << b1);
    }

    #[test]
    fn two_hundred_relays_and_cancels_pending_siblings() {
        let cell = new_cell();
        let mut state = cell.lock();
        let b0 = add_branch(&mut state);
        let b1 = add_branch(&mut state);
        let out = process(&cell, &mut state, b1, reply(180, b"t1"));
        assert_eq!(out.decision, ReplyDecision::Provisional(b1));
        let out = process(&cell, &mut state, b1, reply(200, b"t1"));
        assert_eq!(out.decision, ReplyDecision::Completed(b1));
        assert!(out.totag_added);
        assert_eq!(state.status, 200);
        assert_eq!(state.fwded_totags.len(), 1);
        // branch 0 never replied: flagged for cancel-on-reply, not claimed
        assert_eq!(out.cancel_bitmap, 0);
        assert!(state.branch(b0).cancel_on_reply);
    }

    #[test]
    fn late_forked_2xx_records_tag_without_second_relay() {
        let cell = new_cell();
        let mut state = cell.lock();
        let b0 = add_branch(&mut state);
        let b1 = add_branch(&mut state);
        let out = process(&cell, &mut state, b1, reply(200, b"winner"));
        assert_eq!(out.decision, ReplyDecision::Completed(b1));
        let out = process(&cell, &mut state, b0, reply(200, b"loser"));
        assert_eq!(out.decision, ReplyDecision::PushedAfterCompletion(b0));
        assert!(out.totag_added);
        assert_eq!(state.fwded_totags.len(), 2);
        // retransmission of the same late 200 is discarded
        let out = process(&cell, &mut state, b0, reply(200, b"loser"));
        assert_eq!(out.decision, ReplyDecision::Discarded);
        assert_eq!(state.fwded_totags.len(), 2);
    }

    #[test]
    fn zero_code_completion_only_after_hop_by_hop_cancel() {
        let cell = new_cell();
        let mut state = cell.lock();
        let b = add_branch(&mut state);
        // before any final there is nothing to complete
        let out = process(&cell, &mut state, b, ReplySlot::Empty);
        assert_eq!(out.decision, ReplyDecision::Discarded);

        state.status = 487;
        let out = process(&cell, &mut state, b, ReplySlot::Empty);
        assert_eq!(out.decision, ReplyDecision::Discarded);
        // hop-by-hop cancelled: the wind-down completion is accepted
        state.flags.hop_by_hop_cancel = true;
        let out = process(&cell, &mut state, b, ReplySlot::Empty);
        assert_eq!(out.decision, ReplyDecision::Completed(b));
    }

    #[test]
    fn post_final_negatives_are_discarded() {
        let cell = new_cell();
        let mut state = cell.lock();
        let b0 = add_branch(&mut state);
        let b1 = add_branch(&mut state);
        let out = process(&cell, &mut state, b1, reply(200, b"t"));
        assert_eq!(out.decision, ReplyDecision::Completed(b1));
        let out = process(&cell, &mut state, b0, reply(486, b""));
        assert_eq!(out.decision, ReplyDecision::Discarded);
        assert_eq!(state.status, 200);
    }

    #[test]
    fn failure_callbacks_run_once_per_stable_branch_count() {
        struct CountingHooks {
            runs: usize,
        }
        impl RelayHooks for CountingHooks {
            fn dns_failover(&mut self, _: &Cell, _: &mut CellState, _: usize) -> usize {
                0
            }
            fn run_failure_callbacks(&mut self, _: &Cell, _: &mut CellState, _: usize) -> usize {
                self.runs += 1;
                0
            }
        }

        let cell = new_cell();
        let mut state = cell.lock();
        let b0 = add_branch(&mut state);
        let cfg = EngineConfig::default();
        let mut hooks = CountingHooks { runs: 0 };
        let out = process_reply(&cell, &mut state, b0, reply(404, b""), &cfg, &mut hooks);
        assert_eq!(out.decision, ReplyDecision::Completed(b0));
        assert_eq!(hooks.runs, 1);
        assert_eq!(state.failure_watermark, Some(1));
    }

    #[test]
    fn failover_defers_negative_pick() {
        struct FailoverHooks {
            added: bool,
        }
        impl RelayHooks for FailoverHooks {
            fn dns_failover(&mut self, _: &Cell, state: &mut CellState, branch: usize) -> usize {
                // consume the alternate and add a fresh branch
                let dest = state.branch_mut(branch).alt_dests.pop_front();
                match dest {
                    Some(dest) => {
                        state.branches.push(UacBranch::new(
                            minimal_request(),
                            Bytes::new(),
                            dest,
                            VecDeque::new(),
                            Duration::from_millis(500),
                        ));
                        self.added = true;
                        1
                    }
                    None => 0,
                }
            }
            fn run_failure_callbacks(&mut self, _: &Cell, _: &mut CellState, _: usize) -> usize {
                0
            }
        }

        let cell = new_cell();
        let mut state = cell.lock();
        let b0 = add_branch(&mut state);
        state
            .branch_mut(b0)
            .alt_dests
            .push_back("10.0.0.9:5060".parse().unwrap());
        let cfg = EngineConfig::default();
        let mut hooks = FailoverHooks { added: false };
        let out = process_reply(
            &cell,
            &mut state,
            b0,
            ReplySlot::Faked(408),
            &cfg,
            &mut hooks,
        );
        assert_eq!(out.decision, ReplyDecision::Stored);
        assert!(hooks.added);
        assert_eq!(state.branches.len(), 2);
        assert_eq!(state.status, 0);
        // the new branch concludes negatively: the pick commits, and 404
        // beats the synthesized 408 on the exhausted branch
        let out = process_reply(&cell, &mut state, 1, reply(404, b""), &cfg, &mut hooks);
        assert_eq!(out.decision, ReplyDecision::Completed(1));
        assert_eq!(state.status, 404);
    }
}
