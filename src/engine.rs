//! The transaction engine facade.
//!
//! [`TransactionEngine`] owns the hash table and wires the matching engine,
//! the relay decision machine, the cancellation manager and the timer wheel
//! together. The request-handling layer drives it through
//! [`handle_request`]/[`handle_reply`] plus the transaction operations
//! (`add_branch`, `reply`, `cancel`, callback registration), and the timer
//! wheel drives it through [`on_timer`].
//!
//! Lock order is bucket lock before per-cell reply lock, never the
//! reverse. Callbacks run without the reply lock held; they must not call
//! back into the engine for the same transaction from within a failure
//! callback (which is the one kind invoked under the lock).
//!
//! [`handle_request`]: TransactionEngine::handle_request
//! [`handle_reply`]: TransactionEngine::handle_reply
//! [`on_timer`]: TransactionEngine::on_timer

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;

use crate::callbacks::{AckFn, DestroyFn, FailureAction, FailureFn, FailureInfo, FinalFn, FinalInfo};
use crate::cancel;
use crate::cell::{CancelSlot, Cell, CellState, KillReason, ReplySlot, TransactionRef, UacBranch};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::key::{self, BranchCookie, KeyMode};
use crate::matching::{self, ReplyMatch, RequestMatch};
use crate::msg::{self, Method, ReplyView, RequestView};
use crate::relay::{self, RelayHooks, ReplyDecision};
use crate::table::{BucketGuard, CellId, HashTable, TableStats, UnlinkOutcome};
use crate::timer::{next_backoff, TimerHandle, TimerKind, TimerWheel};
use crate::transport::Transport;

/// What `handle_request` decided about an inbound request.
#[derive(Debug)]
pub enum RequestDisposition {
    /// A transaction was created; the handler must finalize it (forward,
    /// reply or cancel) before calling `finish_request`.
    NewTransaction(TransactionRef),
    /// Retransmission of a known request; the last reply (if any) was
    /// resent.
    Retransmission(TransactionRef),
    /// ACK for a negative final; absorbed.
    HopAck(TransactionRef),
    /// End-to-end ACK for a forked 2xx; the per-tag callbacks fired.
    E2eAck(TransactionRef, Bytes),
    /// No transaction involved; the caller may relay statelessly.
    Stateless,
}

/// What `handle_reply` did with an inbound reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyDisposition {
    /// Relayed upstream with this status.
    Relayed(u16),
    /// Recorded on its branch; upstream decision deferred.
    Stored,
    /// Dropped (retransmission, absorbed 100, post-final noise).
    Absorbed,
    /// A late forked 2xx; its To-tag was recorded, nothing relayed.
    TagRecorded,
    /// Reply to one of our CANCELs; its retransmission stopped.
    CancelAbsorbed,
    /// No matching transaction.
    Orphan,
}

/// Request-scoped context threaded through one message's processing.
///
/// Replaces per-worker "current transaction" globals: the handler carries
/// the references it obtained, and dropping the context releases them.
#[derive(Debug, Default)]
pub struct RequestCtx {
    /// The transaction this request belongs to.
    pub transaction: Option<TransactionRef>,
    /// For a CANCEL: the transaction it cancels, when found.
    pub cancelled: Option<TransactionRef>,
    /// For an end-to-end ACK: the transaction whose tag it acknowledged.
    pub e2e_acked: Option<TransactionRef>,
}

impl RequestCtx {
    pub fn new() -> Self {
        Self::default()
    }
}

/// The engine. Shared by all workers; every public operation locks what it
/// needs internally.
pub struct TransactionEngine<T: Transport, W: TimerWheel> {
    config: EngineConfig,
    table: HashTable,
    transport: T,
    wheel: W,
}

impl<T: Transport, W: TimerWheel> TransactionEngine<T, W> {
    pub fn new(config: EngineConfig, transport: T, wheel: W) -> Result<Self> {
        config.validate()?;
        let table = HashTable::new(config.table_size);
        Ok(Self {
            config,
            table,
            transport,
            wheel,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> TableStats {
        self.table.stats()
    }

    /// Matches an inbound request and, when nothing matches a non-ACK
    /// request, creates its transaction. Both happen under one bucket lock,
    /// so concurrent deliveries of the same initial request create exactly
    /// one cell.
    pub fn handle_request(
        &self,
        req: &RequestView,
        ctx: &mut RequestCtx,
    ) -> Result<RequestDisposition> {
        let hash = self.table.hash(&req.call_id, req.cseq_num);
        let mut guard = self.table.lock(hash);
        match matching::match_request_locked(&guard, &self.config, req)? {
            RequestMatch::New => {
                let transaction = self.create_locked(&mut guard, req, false)?;
                if req.method == Method::Cancel {
                    ctx.cancelled =
                        matching::match_cancel_target_locked(&guard, &self.config, req);
                    if ctx.cancelled.is_none() {
                        tracing::debug!("CANCEL for unknown transaction");
                    }
                }
                drop(guard);
                ctx.transaction = Some(transaction.clone());
                Ok(RequestDisposition::NewTransaction(transaction))
            }
            RequestMatch::Retransmission(transaction) => {
                drop(guard);
                let resend = {
                    let mut state = transaction.lock();
                    state.kill_reason.set(KillReason::EXIST);
                    let buf = state.response.clone();
                    // a retransmitted request restarts the reply
                    // retransmission cycle where one is running
                    if buf.is_some() && transaction.is_invite() && state.status >= 300 {
                        self.arm_uas_retransmit_locked(transaction.arc(), &mut state);
                    }
                    buf
                };
                if let Some(buf) = resend {
                    tracing::debug!(id = %transaction.id(), "resending last reply");
                    self.transport.send(transaction.request().source, &buf)?;
                }
                ctx.transaction = Some(transaction.clone());
                Ok(RequestDisposition::Retransmission(transaction))
            }
            RequestMatch::HopAck(transaction) => {
                drop(guard);
                // the negative final got through; stop retransmitting it
                self.wheel
                    .cancel(TimerHandle::new(transaction.id(), TimerKind::UasRetransmit));
                Ok(RequestDisposition::HopAck(transaction))
            }
            RequestMatch::E2eAck(transaction, totag) => {
                drop(guard);
                self.run_ack_callbacks(&transaction, &totag);
                ctx.e2e_acked = Some(transaction.clone());
                Ok(RequestDisposition::E2eAck(transaction, totag))
            }
            RequestMatch::NoMatch => Ok(RequestDisposition::Stateless),
        }
    }

    /// The classic entry point for non-ACK requests: an existing
    /// transaction or a freshly created one, plus whether it is new.
    pub fn lookup_or_create(
        &self,
        req: &RequestView,
        ctx: &mut RequestCtx,
    ) -> Result<(TransactionRef, bool)> {
        if req.method == Method::Ack {
            return Err(Error::ProtocolViolation("ACK does not create transactions"));
        }
        match self.handle_request(req, ctx)? {
            RequestDisposition::NewTransaction(t) => Ok((t, true)),
            RequestDisposition::Retransmission(t) => Ok((t, false)),
            _ => Err(Error::ProtocolViolation("request did not map to a transaction")),
        }
    }

    /// Creates an engine-originated transaction and sends its first branch.
    pub fn start_local(
        &self,
        req: RequestView,
        destination: SocketAddr,
        alt_dests: Vec<SocketAddr>,
    ) -> Result<TransactionRef> {
        let hash = self.table.hash(&req.call_id, req.cseq_num);
        let transaction = {
            let mut guard = self.table.lock(hash);
            self.create_locked(&mut guard, &req, true)?
        };
        {
            let mut state = transaction.lock();
            self.add_branch_locked(
                transaction.arc(),
                &mut state,
                destination,
                alt_dests.into(),
            )?;
        }
        Ok(transaction)
    }

    /// Adds (and sends) a branch toward `destination`. Alternate
    /// destinations feed DNS failover for this branch.
    pub fn add_branch(
        &self,
        transaction: &TransactionRef,
        destination: SocketAddr,
        alt_dests: Vec<SocketAddr>,
    ) -> Result<usize> {
        let mut state = transaction.lock();
        self.add_branch_locked(
            transaction.arc(),
            &mut state,
            destination,
            alt_dests.into(),
        )
    }

    /// Sends a locally generated reply upstream on the UAS side.
    pub fn reply(&self, transaction: &TransactionRef, code: u16, reason: &str) -> Result<()> {
        self.reply_with(transaction, code, reason, None, &[], None)
    }

    /// [`reply`] with a caller-chosen To-tag, extra headers and a body.
    ///
    /// [`reply`]: TransactionEngine::reply
    pub fn reply_with(
        &self,
        transaction: &TransactionRef,
        code: u16,
        reason: &str,
        to_tag: Option<&[u8]>,
        headers: &[(&str, &[u8])],
        body: Option<&[u8]>,
    ) -> Result<()> {
        if !(100..700).contains(&code) {
            return Err(Error::ProtocolViolation("status code out of range"));
        }
        let cell = transaction.arc().clone();
        let mut state = transaction.lock();
        if state.status >= 200 && code >= 200 {
            return Err(Error::InvalidState("final reply already sent"));
        }
        let totag = if code > 100 {
            let tag = match to_tag {
                Some(tag) => {
                    let tag = Bytes::copy_from_slice(tag);
                    state.local_totag = Some(tag.clone());
                    tag
                }
                None => state
                    .local_totag
                    .get_or_insert_with(msg::generate_totag)
                    .clone(),
            };
            Some(tag)
        } else {
            None
        };
        let buf =
            msg::build_reply_with(cell.request(), code, reason, totag.as_deref(), headers, body);
        state.response = Some(buf.clone());
        state.kill_reason.set(KillReason::RPLD);

        let mut final_info = None;
        if code >= 200 {
            state.status = code;
            if cell.is_invite() && (200..300).contains(&code) {
                if let Some(tag) = &totag {
                    state.record_totag(tag);
                }
            }
            let bitmap = cancel::which_cancel(&mut state);
            if bitmap != 0 {
                state.flags.was_cancelled = true;
                self.send_cancels_locked(&cell, &mut state, bitmap);
            }
            self.stop_branch_timers_locked(&cell, &state);
            if cell.is_invite() && code >= 300 {
                self.arm_uas_retransmit_locked(&cell, &mut state);
            }
            self.schedule_wait_locked(&cell, &mut state);
            final_info = Some(FinalInfo {
                code,
                branch: None,
                local: cell.is_local(),
            });
        }
        drop(state);

        if let Some(info) = final_info {
            self.run_final_callbacks(&cell, info);
        }
        if !cell.is_local() {
            self.transport.send(cell.request().source, &buf)?;
        }
        tracing::debug!(id = %cell.id(), code, "reply sent upstream");
        Ok(())
    }

    /// Cancels the transaction hop-by-hop: claims every cancellable branch
    /// and sends CANCELs; unreplied branches are cancelled when their first
    /// provisional arrives.
    pub fn cancel(&self, transaction: &TransactionRef) -> Result<()> {
        let cell = transaction.arc().clone();
        let mut state = transaction.lock();
        state.flags.was_cancelled = true;
        state.flags.hop_by_hop_cancel = true;
        state.kill_reason.set(KillReason::RLSD);
        let bitmap = cancel::which_cancel(&mut state);
        self.send_cancels_locked(&cell, &mut state, bitmap);
        tracing::debug!(id = %cell.id(), bitmap, "transaction cancelled");
        Ok(())
    }

    /// Turns DNS failover off for this transaction only.
    pub fn disable_dns_failover(&self, transaction: &TransactionRef) {
        transaction.lock().flags.no_dns_failover = true;
    }

    /// Registers a callback fired when a final is committed upstream.
    pub fn on_final(
        &self,
        transaction: &TransactionRef,
        f: impl Fn(&Cell, &FinalInfo) + Send + Sync + 'static,
    ) {
        transaction.with_callbacks(|set| set.finals.push(Box::new(f) as FinalFn));
    }

    /// Registers a failure callback consulted before a negative final is
    /// committed; it may extend the transaction with serial-fork branches.
    pub fn on_failure(
        &self,
        transaction: &TransactionRef,
        f: impl Fn(&Cell, &FailureInfo) -> FailureAction + Send + Sync + 'static,
    ) {
        transaction.with_callbacks(|set| set.failures.push(Box::new(f) as FailureFn));
    }

    /// Registers a callback fired once per distinct end-to-end ACK To-tag.
    pub fn on_e2e_ack(
        &self,
        transaction: &TransactionRef,
        f: impl Fn(&Cell, &[u8]) + Send + Sync + 'static,
    ) {
        transaction.with_callbacks(|set| set.acks.push(Box::new(f) as AckFn));
    }

    /// Registers a callback fired when the cell is destroyed.
    pub fn on_destroy(
        &self,
        transaction: &TransactionRef,
        f: impl FnOnce(&Cell) + Send + 'static,
    ) {
        transaction.with_callbacks(|set| set.destroys.push(Box::new(f) as DestroyFn));
    }

    /// Processes an inbound reply: matches it to a branch and runs the
    /// relay decision machine.
    pub fn handle_reply(&self, rep: &ReplyView) -> Result<ReplyDisposition> {
        match matching::match_reply(&self.table, rep) {
            ReplyMatch::NoMatch => Ok(ReplyDisposition::Orphan),
            ReplyMatch::Cancel {
                transaction,
                branch,
            } => {
                if rep.is_final() {
                    self.wheel.cancel(TimerHandle::new(
                        transaction.id(),
                        TimerKind::BranchRetransmit(branch as u16),
                    ));
                }
                tracing::debug!(id = %transaction.id(), branch, code = rep.status, "CANCEL answered");
                Ok(ReplyDisposition::CancelAbsorbed)
            }
            ReplyMatch::Branch {
                transaction,
                branch,
            } => {
                // any reply stops request retransmission for the branch
                self.wheel.cancel(TimerHandle::new(
                    transaction.id(),
                    TimerKind::BranchRetransmit(branch as u16),
                ));
                self.apply_reply(&transaction, branch, ReplySlot::Real(rep.clone()))
            }
        }
    }

    /// Drives one fired timer. Stale handles (cell already destroyed,
    /// branch already concluded) are ignored.
    pub fn on_timer(&self, handle: TimerHandle) {
        if handle.cell.hash_index >= self.table.size() {
            tracing::warn!(id = %handle.cell, "timer handle outside the table, dropped");
            return;
        }
        if matches!(handle.kind, TimerKind::Wait | TimerKind::Delete) {
            self.try_destroy(handle.cell);
            return;
        }
        let transaction = {
            let guard = self.table.lock(handle.cell.hash_index);
            match guard.find(handle.cell.label) {
                Some(cell) if cell.id() == handle.cell => {
                    TransactionRef::attach(cell.clone())
                }
                _ => return,
            }
        };
        match handle.kind {
            TimerKind::BranchRetransmit(branch) => {
                self.branch_retransmit(&transaction, branch as usize)
            }
            TimerKind::BranchFinal(branch) => {
                let disposition =
                    self.apply_reply(&transaction, branch as usize, ReplySlot::Faked(408));
                if let Err(error) = disposition {
                    tracing::warn!(id = %transaction.id(), %error, "branch timeout processing failed");
                }
            }
            TimerKind::UasRetransmit => self.uas_retransmit(&transaction),
            TimerKind::Wait | TimerKind::Delete => {}
        }
    }

    /// Closes out one request's processing. If the handler finalized
    /// nothing (no forward, no reply, no release), that is a usage error;
    /// the engine answers 500 itself instead of leaking the transaction.
    pub fn finish_request(&self, ctx: RequestCtx) {
        if let Some(transaction) = &ctx.transaction {
            let unfinalized = {
                let state = transaction.lock();
                state.kill_reason.is_none()
            };
            if unfinalized {
                tracing::warn!(
                    id = %transaction.id(),
                    "request handler finished without finalizing; engine replies 500"
                );
                if let Err(error) = self.reply(transaction, 500, msg::default_reason(500)) {
                    tracing::warn!(id = %transaction.id(), %error, "auto-finalize failed");
                }
            }
        }
        drop(ctx);
    }

    /// Destroys every unreferenced transaction; logs the ones still held.
    pub fn shutdown(&self) {
        let mut destroyed = 0usize;
        let mut remaining = 0usize;
        for hash in 0..self.table.size() {
            loop {
                let mut guard = self.table.lock(hash);
                let next = guard
                    .cells()
                    .find(|c| c.refs() == 0)
                    .map(|c| c.id().label);
                let Some(label) = next else {
                    remaining += guard.cur_entries();
                    break;
                };
                if let UnlinkOutcome::Removed(cell) = guard.unlink_unreferenced(label) {
                    drop(guard);
                    self.destroy_cell(cell);
                    destroyed += 1;
                }
            }
        }
        if remaining > 0 {
            tracing::warn!(destroyed, remaining, "shutdown left referenced transactions behind");
        } else {
            tracing::debug!(destroyed, "shutdown swept the table");
        }
    }

    // --- internals ---

    fn create_locked(
        &self,
        guard: &mut BucketGuard<'_>,
        req: &RequestView,
        is_local: bool,
    ) -> Result<TransactionRef> {
        if let Some(max) = self.config.max_transactions {
            if self.table.total() >= max {
                tracing::warn!(max, "transaction table full, rejecting");
                return Err(Error::CapacityExhausted);
            }
        }
        let digest = key::compute_digest(&req.call_id, req.cseq_num, &req.from_tag, &req.uri);
        let t1 = self.config.timers.t1;
        let req = req.clone();
        let cell = guard.insert_with(move |id| {
            Arc::new(Cell::new(id, req, is_local, digest, t1))
        });
        tracing::debug!(id = %cell.id(), method = %cell.method(), "transaction created");
        Ok(TransactionRef::attach(cell))
    }

    fn add_branch_locked(
        &self,
        cell: &Cell,
        state: &mut CellState,
        destination: SocketAddr,
        alt_dests: VecDeque<SocketAddr>,
    ) -> Result<usize> {
        if state.flags.no_new_branches {
            return Err(Error::InvalidState("branch set is frozen"));
        }
        if state.status >= 200 {
            return Err(Error::InvalidState("transaction already completed"));
        }
        let index = state.branches.len();
        if index >= self.config.max_branches {
            return Err(Error::TooManyBranches(cell.id()));
        }
        let cookie = match self.config.key_mode {
            KeyMode::Synonym => BranchCookie::synonym(cell.id(), index as u16),
            KeyMode::Digest => BranchCookie::digest(cell.id(), *cell.digest(), index as u16),
        }
        .encode();
        let (view, buf) = msg::build_forward(
            cell.request(),
            &self.config.via_host,
            self.config.via_port,
            cell.request().via.transport,
            &cookie,
            destination,
        );
        self.transport.send(destination, &buf)?;
        let reliable = view.via.transport.is_reliable();
        state.branches.push(UacBranch::new(
            view,
            buf,
            destination,
            alt_dests,
            self.config.timers.t1,
        ));
        state.kill_reason.set(KillReason::FWDED);

        let timers = &self.config.timers;
        if !reliable {
            self.wheel.schedule(
                TimerHandle::new(cell.id(), TimerKind::BranchRetransmit(index as u16)),
                timers.ticks(timers.t1),
            );
        }
        let fr = if cell.is_invite() {
            timers.fr_inv
        } else {
            timers.fr
        };
        self.wheel.schedule(
            TimerHandle::new(cell.id(), TimerKind::BranchFinal(index as u16)),
            timers.ticks(fr),
        );
        tracing::debug!(id = %cell.id(), branch = index, %destination, "branch added");
        Ok(index)
    }

    /// Runs the relay machine for `incoming` on `branch` and applies the
    /// outcome.
    fn apply_reply(
        &self,
        transaction: &TransactionRef,
        branch: usize,
        incoming: ReplySlot,
    ) -> Result<ReplyDisposition> {
        let cell = transaction.arc().clone();
        let code = incoming.code();
        let raw = match &incoming {
            ReplySlot::Real(view) => Some(view.raw.clone()),
            _ => None,
        };

        let mut state = transaction.lock();
        if branch >= state.branches.len() {
            return Err(Error::ProtocolViolation("reply branch out of range"));
        }
        let mut hooks = EngineHooks { engine: self };
        let outcome =
            relay::process_reply(&cell, &mut state, branch, incoming, &self.config, &mut hooks);
        if outcome.cancel_bitmap != 0 {
            self.send_cancels_locked(&cell, &mut state, outcome.cancel_bitmap);
        }

        match outcome.decision {
            ReplyDecision::Discarded => Ok(ReplyDisposition::Absorbed),
            ReplyDecision::Stored => Ok(ReplyDisposition::Stored),
            ReplyDecision::PushedAfterCompletion(_) => Ok(ReplyDisposition::TagRecorded),
            ReplyDecision::Provisional(b) => {
                if self.config.restart_fr_on_provisional {
                    let timers = &self.config.timers;
                    let fr = if cell.is_invite() {
                        timers.fr_inv
                    } else {
                        timers.fr
                    };
                    self.wheel.schedule(
                        TimerHandle::new(cell.id(), TimerKind::BranchFinal(b as u16)),
                        timers.ticks(fr),
                    );
                }
                let upstream = (!cell.is_local()).then(|| {
                    state.response = raw.clone();
                    cell.request().source
                });
                drop(state);
                if let (Some(source), Some(buf)) = (upstream, raw) {
                    self.transport.send(source, &buf)?;
                }
                Ok(ReplyDisposition::Relayed(code))
            }
            ReplyDecision::Completed(b) => {
                let final_code = state.branch(b).reply.code();
                if final_code == 0 {
                    // zero-code completion of a hop-by-hop cancelled
                    // transaction; nothing to relay
                    self.schedule_wait_locked(&cell, &mut state);
                    return Ok(ReplyDisposition::Absorbed);
                }
                let stored_raw = match &state.branch(b).reply {
                    ReplySlot::Real(view) => Some(view.raw.clone()),
                    _ => None,
                };
                let buf = match stored_raw {
                    Some(raw) => raw,
                    None => {
                        // synthesized final: build the upstream reply here
                        let totag = state
                            .local_totag
                            .get_or_insert_with(msg::generate_totag)
                            .clone();
                        msg::build_reply(
                            cell.request(),
                            final_code,
                            msg::default_reason(final_code),
                            Some(&totag),
                        )
                    }
                };
                state.response = Some(buf.clone());
                self.stop_branch_timers_locked(&cell, &state);
                if cell.is_invite() && final_code >= 300 {
                    self.arm_uas_retransmit_locked(&cell, &mut state);
                }
                self.schedule_wait_locked(&cell, &mut state);
                let info = FinalInfo {
                    code: final_code,
                    branch: Some(b),
                    local: cell.is_local(),
                };
                drop(state);

                self.run_final_callbacks(&cell, info);
                if !cell.is_local() {
                    self.transport.send(cell.request().source, &buf)?;
                }
                tracing::debug!(id = %cell.id(), branch = b, code = final_code, "final relayed");
                Ok(ReplyDisposition::Relayed(final_code))
            }
        }
    }

    fn branch_retransmit(&self, transaction: &TransactionRef, branch: usize) {
        let cell = transaction.arc().clone();
        let mut state = transaction.lock();
        if branch >= state.branches.len() {
            return;
        }
        let cancel_in_flight = matches!(state.branch(branch).cancel, CancelSlot::Ready(_));
        {
            let b = state.branch(branch);
            if b.has_final() {
                return;
            }
            // a reply stops request retransmission; only a pending CANCEL
            // keeps the timer alive after that
            if b.replied && !cancel_in_flight {
                return;
            }
        }
        let (buf, destination, delay) = {
            let invite = cell.is_invite();
            let timers = self.config.timers;
            let b = state.branch_mut(branch);
            let cap = if invite && !cancel_in_flight {
                None
            } else {
                Some(timers.t2)
            };
            b.retrans_interval = next_backoff(b.retrans_interval, cap);
            (
                b.retrans_buf.clone(),
                b.destination,
                timers.ticks(b.retrans_interval),
            )
        };
        drop(state);
        if let Err(error) = self.transport.send(destination, &buf) {
            tracing::warn!(id = %cell.id(), branch, %error, "retransmission send failed");
        }
        self.wheel.schedule(
            TimerHandle::new(cell.id(), TimerKind::BranchRetransmit(branch as u16)),
            delay,
        );
    }

    fn uas_retransmit(&self, transaction: &TransactionRef) {
        let cell = transaction.arc().clone();
        let mut state = transaction.lock();
        if state.status < 200 {
            return;
        }
        let Some(buf) = state.response.clone() else {
            return;
        };
        let timers = self.config.timers;
        state.uas_retrans_interval = next_backoff(state.uas_retrans_interval, Some(timers.t2));
        let delay = timers.ticks(state.uas_retrans_interval);
        drop(state);
        if let Err(error) = self.transport.send(cell.request().source, &buf) {
            tracing::warn!(id = %cell.id(), %error, "reply retransmission failed");
        }
        self.wheel
            .schedule(TimerHandle::new(cell.id(), TimerKind::UasRetransmit), delay);
    }

    /// Wait/Delete fired: free the cell if nobody holds it, else retry
    /// later. The reference count is re-read under the bucket lock; a
    /// holder that attached since the timer was armed aborts the free.
    fn try_destroy(&self, id: CellId) {
        let mut guard = self.table.lock(id.hash_index);
        match guard.unlink_unreferenced(id.label) {
            UnlinkOutcome::Removed(cell) => {
                drop(guard);
                self.destroy_cell(cell);
            }
            UnlinkOutcome::StillReferenced => {
                drop(guard);
                tracing::trace!(%id, "destroy deferred, still referenced");
                self.wheel.schedule(
                    TimerHandle::new(id, TimerKind::Delete),
                    self.config.timers.ticks(self.config.timers.delete_retry),
                );
            }
            UnlinkOutcome::NotFound => {}
        }
    }

    /// Runs destroy callbacks and disarms stray timers. The cell is already
    /// unlinked; its buffers, branches and To-tag list go with its drop.
    fn destroy_cell(&self, cell: Arc<Cell>) {
        let id = cell.id();
        for kind in [TimerKind::UasRetransmit, TimerKind::Wait, TimerKind::Delete] {
            self.wheel.cancel(TimerHandle::new(id, kind));
        }
        let branches = cell.lock().branches.len();
        for index in 0..branches {
            self.wheel
                .cancel(TimerHandle::new(id, TimerKind::BranchRetransmit(index as u16)));
            self.wheel
                .cancel(TimerHandle::new(id, TimerKind::BranchFinal(index as u16)));
        }
        let mut set = cell.take_callbacks();
        for callback in set.destroys.drain(..) {
            callback(&cell);
        }
        tracing::debug!(%id, "transaction destroyed");
    }

    fn send_cancels_locked(&self, cell: &Cell, state: &mut CellState, bitmap: u32) {
        let timers = self.config.timers;
        for index in 0..state.branches.len() {
            if bitmap & (1 << index) == 0 {
                continue;
            }
            let (buf, destination) = {
                let b = state.branch_mut(index);
                let buf = cancel::build_cancel(&b.request);
                b.cancel = CancelSlot::Ready(buf.clone());
                b.retrans_buf = buf.clone();
                b.retrans_interval = timers.t1;
                (buf, b.destination)
            };
            if let Err(error) = self.transport.send(destination, &buf) {
                tracing::warn!(id = %cell.id(), branch = index, %error, "CANCEL send failed");
            }
            self.wheel.schedule(
                TimerHandle::new(cell.id(), TimerKind::BranchRetransmit(index as u16)),
                timers.ticks(timers.t1),
            );
            tracing::debug!(id = %cell.id(), branch = index, "CANCEL sent");
        }
    }

    fn stop_branch_timers_locked(&self, cell: &Cell, state: &CellState) {
        for (index, branch) in state.branches.iter().enumerate() {
            self.wheel
                .cancel(TimerHandle::new(cell.id(), TimerKind::BranchFinal(index as u16)));
            // branches with a CANCEL in flight keep retransmitting it
            if !matches!(branch.cancel, CancelSlot::Ready(_)) {
                self.wheel.cancel(TimerHandle::new(
                    cell.id(),
                    TimerKind::BranchRetransmit(index as u16),
                ));
            }
        }
    }

    fn arm_uas_retransmit_locked(&self, cell: &Cell, state: &mut CellState) {
        let timers = self.config.timers;
        state.uas_retrans_interval = timers.t1;
        self.wheel.schedule(
            TimerHandle::new(cell.id(), TimerKind::UasRetransmit),
            timers.ticks(timers.t1),
        );
    }

    /// The wait timer is armed exactly once, when the transaction first
    /// reaches a terminal state.
    fn schedule_wait_locked(&self, cell: &Cell, state: &mut CellState) {
        if state.wait_scheduled {
            return;
        }
        state.wait_scheduled = true;
        let timers = self.config.timers;
        self.wheel.schedule(
            TimerHandle::new(cell.id(), TimerKind::Wait),
            timers.ticks(timers.wait),
        );
    }

    fn run_final_callbacks(&self, cell: &Cell, info: FinalInfo) {
        let set = cell.take_callbacks();
        for callback in &set.finals {
            callback(cell, &info);
        }
        cell.restore_callbacks(set);
    }

    fn run_ack_callbacks(&self, transaction: &TransactionRef, totag: &Bytes) {
        let cell = transaction.arc();
        let set = cell.take_callbacks();
        for callback in &set.acks {
            callback(cell, totag);
        }
        cell.restore_callbacks(set);
    }
}

/// The engine's mutation hooks for the relay machine: failover branches
/// and failure callbacks, both under the caller's reply lock.
struct EngineHooks<'a, T: Transport, W: TimerWheel> {
    engine: &'a TransactionEngine<T, W>,
}

impl<T: Transport, W: TimerWheel> RelayHooks for EngineHooks<'_, T, W> {
    fn dns_failover(&mut self, cell: &Cell, state: &mut CellState, branch: usize) -> usize {
        let Some(destination) = state.branch_mut(branch).alt_dests.pop_front() else {
            return 0;
        };
        let remaining = std::mem::take(&mut state.branch_mut(branch).alt_dests);
        match self
            .engine
            .add_branch_locked(cell, state, destination, remaining)
        {
            Ok(index) => {
                tracing::debug!(id = %cell.id(), from = branch, to = index, %destination, "failover branch added");
                1
            }
            Err(error) => {
                tracing::warn!(id = %cell.id(), from = branch, %error, "failover branch rejected");
                0
            }
        }
    }

    fn run_failure_callbacks(
        &mut self,
        cell: &Cell,
        state: &mut CellState,
        picked: usize,
    ) -> usize {
        let info = FailureInfo {
            branch: picked,
            code: state.branch(picked).reply.code(),
            branches: state.branches.len(),
        };
        let set = cell.take_callbacks();
        let mut added = 0usize;
        for callback in &set.failures {
            match callback(cell, &info) {
                FailureAction::Complete => {}
                FailureAction::Fork(destinations) => {
                    // a new serial-forking round starts past the old set
                    state.first_branch = state.branches.len();
                    for destination in destinations {
                        match self.engine.add_branch_locked(
                            cell,
                            state,
                            destination,
                            VecDeque::new(),
                        ) {
                            Ok(_) => added += 1,
                            Err(error) => {
                                tracing::warn!(id = %cell.id(), %error, "serial fork rejected");
                            }
                        }
                    }
                }
            }
        }
        cell.restore_callbacks(set);
        added
    }
}
