//! The transaction cell: one SIP transaction, its UAS side and its UAC
//! branches.
//!
//! A cell is owned by the bucket it is linked into. Its identity and the
//! inbound request are immutable after creation; everything else lives
//! behind the per-cell reply lock. Holders outside the table express their
//! interest through the protocol reference count ([`TransactionRef`]),
//! which gates destruction: the wait timer only frees a cell it observes
//! unreferenced, under the bucket lock.

use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};

use crate::callbacks::CallbackSet;
use crate::error::invariant_violation;
use crate::msg::{Method, ReplyView, RequestView};
use crate::table::CellId;

/// A To-tag observed on a forked 2xx, with its end-to-end ACK state.
#[derive(Debug, Clone)]
pub struct FwdedToTag {
    pub tag: Bytes,
    pub acked: bool,
}

/// What a branch currently holds as its reply.
///
/// `Faked` marks a locally synthesized final (e.g. 408 on timeout) that has
/// no wire image of its own.
#[derive(Debug, Clone, Default)]
pub enum ReplySlot {
    #[default]
    Empty,
    Faked(u16),
    Real(ReplyView),
}

impl ReplySlot {
    /// Status code held, `0` when empty.
    pub fn code(&self) -> u16 {
        match self {
            ReplySlot::Empty => 0,
            ReplySlot::Faked(code) => *code,
            ReplySlot::Real(view) => view.status,
        }
    }

    pub fn is_final(&self) -> bool {
        self.code() >= 200
    }

    pub fn is_faked(&self) -> bool {
        matches!(self, ReplySlot::Faked(_))
    }
}

/// State of a branch's local CANCEL.
///
/// `InProgress` is the claim marker: the worker that flipped the slot from
/// `Empty` owns CANCEL generation for this branch, and nobody else may
/// start one.
#[derive(Debug, Clone, Default)]
pub enum CancelSlot {
    #[default]
    Empty,
    InProgress,
    Ready(Bytes),
}

impl CancelSlot {
    pub fn is_empty(&self) -> bool {
        matches!(self, CancelSlot::Empty)
    }
}

/// One outbound leg of the transaction.
#[derive(Debug)]
pub struct UacBranch {
    /// The request image this branch sent, with this engine's Via on top.
    pub request: RequestView,
    /// Serialized wire image of `request`.
    pub request_buf: Bytes,
    /// What the retransmission timer currently resends. Starts as the
    /// request; switches to the CANCEL once one is sent.
    pub retrans_buf: Bytes,
    pub destination: SocketAddr,
    /// Remaining failover destinations for the same target.
    pub alt_dests: VecDeque<SocketAddr>,
    /// Last status code received, `0` before any reply.
    pub last_received: u16,
    pub reply: ReplySlot,
    /// A real (non-synthesized) reply has been seen.
    pub replied: bool,
    /// A non-100 provisional has been seen; the branch is cancellable.
    pub provisioned: bool,
    /// Cancel once a provisional arrives (nothing to CANCEL server-side
    /// before that).
    pub cancel_on_reply: bool,
    pub cancel: CancelSlot,
    /// Current retransmission interval (exponential backoff state).
    pub retrans_interval: Duration,
}

impl UacBranch {
    pub fn new(
        request: RequestView,
        request_buf: Bytes,
        destination: SocketAddr,
        alt_dests: VecDeque<SocketAddr>,
        t1: Duration,
    ) -> Self {
        Self {
            request,
            retrans_buf: request_buf.clone(),
            request_buf,
            destination,
            alt_dests,
            last_received: 0,
            reply: ReplySlot::Empty,
            replied: false,
            provisioned: false,
            cancel_on_reply: false,
            cancel: CancelSlot::Empty,
            retrans_interval: t1,
        }
    }

    pub fn has_final(&self) -> bool {
        self.reply.is_final()
    }
}

/// Diagnostic bitmask: how the request handler finalized this transaction.
/// All bits clear when handling finishes means the handler forgot; the
/// engine then finalizes the transaction itself instead of leaking it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KillReason(u8);

impl KillReason {
    pub const FWDED: KillReason = KillReason(1);
    pub const RPLD: KillReason = KillReason(2);
    pub const RLSD: KillReason = KillReason(4);
    pub const EXIST: KillReason = KillReason(8);

    pub fn set(&mut self, bit: KillReason) {
        self.0 |= bit.0;
    }

    pub fn contains(&self, bit: KillReason) -> bool {
        self.0 & bit.0 != 0
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for KillReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            return f.write_str("none");
        }
        let mut first = true;
        for (bit, name) in [
            (KillReason::FWDED, "fwded"),
            (KillReason::RPLD, "rpld"),
            (KillReason::RLSD, "rlsd"),
            (KillReason::EXIST, "exist"),
        ] {
            if self.contains(bit) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Mutable per-transaction flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct CellFlags {
    pub was_cancelled: bool,
    pub hop_by_hop_cancel: bool,
    pub no_new_branches: bool,
    pub no_dns_failover: bool,
}

/// Everything behind the per-cell reply lock.
pub struct CellState {
    /// Last final (or 0) sent upstream; `>= 200` means completed.
    pub status: u16,
    /// Last reply buffer sent upstream, kept for retransmission.
    pub response: Option<Bytes>,
    /// Local To-tag used in replies this engine generates.
    pub local_totag: Option<Bytes>,
    /// Distinct To-tags seen across forked 2xx finals.
    pub fwded_totags: Vec<FwdedToTag>,
    pub branches: Vec<UacBranch>,
    pub flags: CellFlags,
    /// Index where the current (serial) forking round starts.
    pub first_branch: usize,
    /// Branch count at the last failure-callback run; `None` if never run.
    pub failure_watermark: Option<usize>,
    pub kill_reason: KillReason,
    /// The wait timer is started exactly once.
    pub wait_scheduled: bool,
    /// Backoff state of the UAS reply retransmission timer.
    pub uas_retrans_interval: Duration,
}

impl CellState {
    fn new(t1: Duration) -> Self {
        Self {
            status: 0,
            response: None,
            local_totag: None,
            fwded_totags: Vec::new(),
            branches: Vec::new(),
            flags: CellFlags::default(),
            first_branch: 0,
            failure_watermark: None,
            kill_reason: KillReason::default(),
            wait_scheduled: false,
            uas_retrans_interval: t1,
        }
    }

    /// Immutable branch access; indices come from this engine, so a miss is
    /// corruption, not input error.
    pub fn branch(&self, index: usize) -> &UacBranch {
        match self.branches.get(index) {
            Some(b) => b,
            None => invariant_violation("branch index out of range"),
        }
    }

    pub fn branch_mut(&mut self, index: usize) -> &mut UacBranch {
        match self.branches.get_mut(index) {
            Some(b) => b,
            None => invariant_violation("branch index out of range"),
        }
    }

    /// Records a forked-2xx To-tag. Returns `true` if the tag was new.
    pub fn record_totag(&mut self, tag: &Bytes) -> bool {
        if tag.is_empty() {
            return false;
        }
        if self.fwded_totags.iter().any(|t| t.tag == *tag) {
            return false;
        }
        self.fwded_totags.push(FwdedToTag {
            tag: tag.clone(),
            acked: false,
        });
        true
    }

    /// Any branch without a final reply yet?
    pub fn has_pending_branches(&self) -> bool {
        self.branches.iter().any(|b| !b.has_final())
    }
}

/// One SIP transaction.
pub struct Cell {
    id: CellId,
    method: Method,
    is_invite: bool,
    is_local: bool,
    digest: [u8; 16],
    request: RequestView,
    refs: AtomicU32,
    callbacks: Mutex<CallbackSet>,
    state: Mutex<CellState>,
}

impl Cell {
    pub(crate) fn new(
        id: CellId,
        request: RequestView,
        is_local: bool,
        digest: [u8; 16],
        t1: Duration,
    ) -> Self {
        let is_invite = request.method == Method::Invite;
        Self {
            id,
            method: request.method.clone(),
            is_invite,
            is_local,
            digest,
            request,
            refs: AtomicU32::new(0),
            callbacks: Mutex::new(CallbackSet::default()),
            state: Mutex::new(CellState::new(t1)),
        }
    }

    pub fn id(&self) -> CellId {
        self.id
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn is_invite(&self) -> bool {
        self.is_invite
    }

    pub fn is_local(&self) -> bool {
        self.is_local
    }

    pub fn digest(&self) -> &[u8; 16] {
        &self.digest
    }

    /// The inbound request this transaction was created from.
    pub fn request(&self) -> &RequestView {
        &self.request
    }

    /// Acquires the per-cell reply lock. Reply processing, branch mutation
    /// and relay decisions all happen under it.
    pub fn lock(&self) -> MutexGuard<'_, CellState> {
        self.state.lock()
    }

    /// Current protocol reference count.
    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    pub(crate) fn ref_inc(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn ref_dec(&self) {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            invariant_violation("transaction reference count underflow");
        }
    }

    /// Registers callbacks on this cell.
    pub fn with_callbacks<R>(&self, f: impl FnOnce(&mut CallbackSet) -> R) -> R {
        f(&mut self.callbacks.lock())
    }

    /// Takes the registry out for invocation; pair with
    /// [`restore_callbacks`] so registrations made from inside a callback
    /// survive.
    ///
    /// [`restore_callbacks`]: Cell::restore_callbacks
    pub(crate) fn take_callbacks(&self) -> CallbackSet {
        std::mem::take(&mut *self.callbacks.lock())
    }

    pub(crate) fn restore_callbacks(&self, mut set: CallbackSet) {
        let mut cur = self.callbacks.lock();
        let registered_meanwhile = std::mem::take(&mut *cur);
        set.absorb(registered_meanwhile);
        *cur = set;
    }
}

impl fmt::Debug for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cell")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("is_local", &self.is_local)
            .field("refs", &self.refs())
            .finish()
    }
}

/// A held reference to a live transaction.
///
/// Attaching increments the cell's protocol reference count; dropping is
/// the paired decrement. Every successful match hands the caller exactly
/// one of these, which is what keeps the wait timer from freeing the cell
/// underneath them.
pub struct TransactionRef {
    cell: Arc<Cell>,
}

impl TransactionRef {
    pub(crate) fn attach(cell: Arc<Cell>) -> Self {
        cell.ref_inc();
        Self { cell }
    }

    pub(crate) fn arc(&self) -> &Arc<Cell> {
        &self.cell
    }
}

impl Clone for TransactionRef {
    fn clone(&self) -> Self {
        TransactionRef::attach(self.cell.clone())
    }
}

impl Drop for TransactionRef {
    fn drop(&mut self) {
        self.cell.ref_dec();
    }
}

impl std::ops::Deref for TransactionRef {
    type Target = Cell;

    fn deref(&self) -> &Cell {
        &self.cell
    }
}

impl fmt::Debug for TransactionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionRef({})", self.cell.id())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::msg::{TransportKind, ViaView};

    pub(crate) fn minimal_request() -> RequestView {
        RequestView {
            raw: Bytes::new(),
            source: "127.0.0.1:5060".parse().expect("static addr"),
            method: Method::Invite,
            uri: Bytes::from_static(b"sip:bob@example.com"),
            via: ViaView {
                raw: Bytes::from_static(b"SIP/2.0/UDP 127.0.0.1:5060;branch=z9hG4bKtest"),
                host: Bytes::from_static(b"127.0.0.1"),
                port: 5060,
                transport: TransportKind::Udp,
                branch: Bytes::from_static(b"z9hG4bKtest"),
            },
            call_id: Bytes::from_static(b"cid@host"),
            cseq_num: 1,
            cseq_method: Method::Invite,
            from: Bytes::from_static(b"<sip:a@host>;tag=ft"),
            from_tag: Bytes::from_static(b"ft"),
            to: Bytes::from_static(b"<sip:b@host>"),
            to_tag: Bytes::new(),
        }
    }

    pub(crate) fn minimal_cell(id: CellId) -> Arc<Cell> {
        Arc::new(Cell::new(
            id,
            minimal_request(),
            false,
            [0u8; 16],
            Duration::from_millis(500),
        ))
    }
}
