//! Branch cancellation.
//!
//! A branch can only be CANCELled once the far end has shown a transaction
//! to cancel, i.e. after a non-100 provisional. Branches without any reply
//! are flagged to cancel when one arrives. The branch's cancel slot doubles
//! as the claim marker: flipping it from `Empty` to `InProgress` under the
//! reply lock is what stops two workers from generating the same CANCEL.

use bytes::{BufMut, Bytes, BytesMut};

use crate::cell::{CancelSlot, CellState, UacBranch};
use crate::msg::RequestView;

/// Whether a CANCEL may be generated for this branch right now.
pub fn should_cancel_branch(branch: &UacBranch) -> bool {
    branch.provisioned && !branch.has_final() && branch.cancel.is_empty()
}

/// Walks the branches and claims every one that is cancellable now.
///
/// Returns the bitmap of claimed branches (their cancel slots are set to
/// `InProgress`; the caller must generate and send the CANCELs). Branches
/// that have not replied yet are flagged `cancel_on_reply` instead.
pub fn which_cancel(state: &mut CellState) -> u32 {
    let mut bitmap = 0u32;
    for (index, branch) in state.branches.iter_mut().enumerate() {
        if branch.has_final() {
            continue;
        }
        if should_cancel_branch(branch) {
            branch.cancel = CancelSlot::InProgress;
            bitmap |= 1 << index;
        } else if branch.cancel.is_empty() {
            branch.cancel_on_reply = true;
        }
    }
    bitmap
}

/// Serializes a CANCEL for the request a branch sent.
///
/// Same Request-URI, Via (same branch cookie), From, To, Call-ID and CSeq
/// number as the cancelled request; only the method changes.
pub fn build_cancel(request: &RequestView) -> Bytes {
    let mut buf = BytesMut::with_capacity(256);
    buf.put_slice(b"CANCEL ");
    buf.put_slice(&request.uri);
    buf.put_slice(b" SIP/2.0\r\nVia: ");
    buf.put_slice(&request.via.raw);
    buf.put_slice(b"\r\nFrom: ");
    buf.put_slice(&request.from);
    buf.put_slice(b"\r\nTo: ");
    buf.put_slice(&request.to);
    buf.put_slice(b"\r\nCall-ID: ");
    buf.put_slice(&request.call_id);
    buf.put_slice(b"\r\nCSeq: ");
    buf.put_slice(request.cseq_num.to_string().as_bytes());
    buf.put_slice(b" CANCEL\r\nMax-Forwards: 70\r\nContent-Length: 0\r\n\r\n");
    buf.freeze()
}
