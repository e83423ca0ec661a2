//! Message-to-transaction matching.
//!
//! Two request algorithms, selected by the RFC3261 magic cookie in the
//! topmost Via branch:
//!
//! - **Cookie path**: if the branch decodes as one of this engine's own
//!   `hash.key.branch` cookies, the cell is found by comparing the label
//!   (or digest) directly. A foreign cookie (minted by someone else's
//!   stack) is compared byte-wise against the stored topmost Via instead;
//!   retransmissions are byte-identical, so this keeps matching idempotent
//!   for any cookie.
//! - **Legacy path**: full field comparison for pre-RFC3261 clients, length
//!   before content.
//!
//! Every match that finds a cell attaches a [`TransactionRef`] while the
//! bucket lock is held; the caller owns the paired release.

use bytes::Bytes;

use crate::cell::{Cell, FwdedToTag, TransactionRef};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::key::{BranchCookie, CookieKey, MAGIC_COOKIE};
use crate::msg::{Method, ReplyView, RequestView};
use crate::table::{BucketGuard, HashTable};

/// Outcome of matching an inbound request against the table.
#[derive(Debug)]
pub enum RequestMatch {
    /// Nothing matched; the caller may create a transaction.
    New,
    /// The request is a retransmission for this transaction (or, for a
    /// seen end-to-end ACK To-tag, an ACK retransmission).
    Retransmission(TransactionRef),
    /// ACK for a negative final this transaction sent; absorbed here.
    HopAck(TransactionRef),
    /// End-to-end ACK for a forked 2xx; carries the distinct To-tag. The
    /// callback opportunity fires exactly once per tag.
    E2eAck(TransactionRef, Bytes),
    /// An ACK (or CANCEL target lookup) that belongs to no transaction.
    NoMatch,
}

/// Outcome of matching an inbound reply.
#[derive(Debug)]
pub enum ReplyMatch {
    /// Reply for branch `branch` of the transaction.
    Branch {
        transaction: TransactionRef,
        branch: usize,
    },
    /// Reply to the CANCEL in flight on branch `branch`.
    Cancel {
        transaction: TransactionRef,
        branch: usize,
    },
    NoMatch,
}

fn has_cookie(branch: &[u8]) -> bool {
    branch.starts_with(MAGIC_COOKIE)
}

/// Length first, then content.
fn eq_span(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a == b
}

fn sent_by_matches(cell: &Cell, req: &RequestView) -> bool {
    let stored = &cell.request().via;
    eq_span(&stored.branch, &req.via.branch)
        && eq_span(&stored.host, &req.via.host)
        && stored.port == req.via.port
}

#[derive(PartialEq, Eq, Clone, Copy)]
enum LegacyMode {
    Request,
    CancelTarget,
}

/// Pre-RFC3261 field comparison. The caller has already established method
/// compatibility; CSeq method equality is implied by it.
fn legacy_request_match(
    cell: &Cell,
    req: &RequestView,
    cfg: &EngineConfig,
    mode: LegacyMode,
) -> bool {
    let stored = cell.request();
    if !eq_span(&stored.call_id, &req.call_id) {
        return false;
    }
    if stored.cseq_num != req.cseq_num {
        return false;
    }
    if !eq_span(&stored.from, &req.from) {
        return false;
    }
    let compare_to = !(mode == LegacyMode::CancelTarget && cfg.relaxed_cancel_to);
    if compare_to && !eq_span(&stored.to, &req.to) {
        return false;
    }
    if cfg.match_request_uri && !eq_span(&stored.uri, &req.uri) {
        return false;
    }
    if cfg.match_top_via && !eq_span(&stored.via.raw, &req.via.raw) {
        return false;
    }
    true
}

fn cookie_request_match(cell: &Cell, req: &RequestView, decoded: Option<&BranchCookie>) -> bool {
    if let Some(cookie) = decoded {
        if cookie.hash_index == cell.id().hash_index {
            let key_hit = match &cookie.key {
                CookieKey::Label(label) => *label == cell.id().label,
                CookieKey::Digest(digest) => digest == cell.digest(),
            };
            if key_hit {
                return true;
            }
        }
    }
    sent_by_matches(cell, req)
}

/// Matches an inbound request. Locks the hashed bucket for the duration.
pub fn match_request(
    table: &HashTable,
    cfg: &EngineConfig,
    req: &RequestView,
) -> Result<RequestMatch> {
    let hash = table.hash(&req.call_id, req.cseq_num);
    let guard = table.lock(hash);
    match_request_locked(&guard, cfg, req)
}

/// Matching body for callers that already hold the bucket. Creation after a
/// `New` result must happen under the same guard, or two workers processing
/// the same initial request could both create.
pub(crate) fn match_request_locked(
    guard: &BucketGuard<'_>,
    cfg: &EngineConfig,
    req: &RequestView,
) -> Result<RequestMatch> {
    if req.call_id.is_empty() {
        return Err(Error::MalformedMessage("empty Call-ID"));
    }
    if req.method == Method::Ack {
        return Ok(match_ack_locked(guard, req));
    }

    let cookie = has_cookie(&req.via.branch);
    let decoded = if cookie {
        BranchCookie::decode(&req.via.branch)
    } else {
        None
    };

    for cell in guard.cells() {
        if req.method == Method::Cancel {
            // a CANCEL retransmission only matches the CANCEL's own cell;
            // the cancelled transaction is found by `match_cancel_target`
            if *cell.method() != Method::Cancel {
                continue;
            }
        } else if *cell.method() != req.method {
            continue;
        }
        let hit = if cookie {
            cookie_request_match(cell, req, decoded.as_ref())
        } else {
            legacy_request_match(cell, req, cfg, LegacyMode::Request)
        };
        if hit {
            tracing::trace!(id = %cell.id(), method = %req.method, "request retransmission");
            return Ok(RequestMatch::Retransmission(TransactionRef::attach(
                cell.clone(),
            )));
        }
    }
    Ok(RequestMatch::New)
}

/// ACK matching: hop-by-hop first (ACK for a negative final, same branch),
/// then the end-to-end pass (ACK for a forked 2xx, keyed by From-tag +
/// Call-ID + CSeq number with the To-tag resolved in a second step).
fn match_ack_locked(guard: &BucketGuard<'_>, req: &RequestView) -> RequestMatch {
    let cookie = has_cookie(&req.via.branch);

    for cell in guard.cells() {
        if !cell.is_invite() {
            continue;
        }
        let negative_final = cell.lock().status >= 300;
        if !negative_final {
            continue;
        }
        let hit = if cookie {
            sent_by_matches(cell, req)
        } else {
            eq_span(&cell.request().call_id, &req.call_id)
                && cell.request().cseq_num == req.cseq_num
                && eq_span(&cell.request().from, &req.from)
        };
        if hit {
            tracing::trace!(id = %cell.id(), "hop-by-hop ACK");
            return RequestMatch::HopAck(TransactionRef::attach(cell.clone()));
        }
    }

    // end-to-end ACKs always carry the dialog's To-tag
    if req.to_tag.is_empty() {
        return RequestMatch::NoMatch;
    }
    for cell in guard.cells() {
        if !cell.is_invite() {
            continue;
        }
        let stored = cell.request();
        if !eq_span(&stored.call_id, &req.call_id)
            || stored.cseq_num != req.cseq_num
            || !eq_span(&stored.from_tag, &req.from_tag)
        {
            continue;
        }
        let mut state = cell.lock();
        let has_2xx = (200..300).contains(&state.status) || !state.fwded_totags.is_empty();
        if !has_2xx {
            continue;
        }
        if let Some(entry) = state.fwded_totags.iter_mut().find(|t| t.tag == req.to_tag) {
            if entry.acked {
                drop(state);
                tracing::trace!(id = %cell.id(), "retransmitted end-to-end ACK");
                return RequestMatch::Retransmission(TransactionRef::attach(cell.clone()));
            }
            entry.acked = true;
        } else {
            // unseen tag: record it so the callback fires once per tag
            state.fwded_totags.push(FwdedToTag {
                tag: req.to_tag.clone(),
                acked: true,
            });
        }
        drop(state);
        tracing::debug!(id = %cell.id(), "end-to-end ACK");
        return RequestMatch::E2eAck(TransactionRef::attach(cell.clone()), req.to_tag.clone());
    }
    RequestMatch::NoMatch
}

/// Finds the transaction a CANCEL applies to. Same two algorithms,
/// restricted to non-CANCEL cells; the To comparison is relaxed when
/// configured.
pub fn match_cancel_target(
    table: &HashTable,
    cfg: &EngineConfig,
    cancel: &RequestView,
) -> Option<TransactionRef> {
    let hash = table.hash(&cancel.call_id, cancel.cseq_num);
    let guard = table.lock(hash);
    match_cancel_target_locked(&guard, cfg, cancel)
}

pub(crate) fn match_cancel_target_locked(
    guard: &BucketGuard<'_>,
    cfg: &EngineConfig,
    cancel: &RequestView,
) -> Option<TransactionRef> {
    let cookie = has_cookie(&cancel.via.branch);
    for cell in guard.cells() {
        if *cell.method() == Method::Cancel {
            continue;
        }
        // engine-originated transactions are cancelled by their owner, not
        // by an upstream CANCEL
        if cell.is_local() {
            continue;
        }
        let hit = if cookie {
            sent_by_matches(cell, cancel)
        } else {
            legacy_request_match(cell, cancel, cfg, LegacyMode::CancelTarget)
        };
        if hit {
            tracing::debug!(id = %cell.id(), "CANCEL matched its transaction");
            return Some(TransactionRef::attach(cell.clone()));
        }
    }
    None
}

/// Matches an inbound reply by decoding this engine's branch cookie.
///
/// Validates the decoded ranges before touching the table; a reply whose
/// branch index is out of range for the found cell is not ours and is
/// skipped.
pub fn match_reply(table: &HashTable, rep: &ReplyView) -> ReplyMatch {
    let Some(cookie) = BranchCookie::decode(&rep.via_branch) else {
        tracing::trace!("reply branch carries no own cookie");
        return ReplyMatch::NoMatch;
    };
    if cookie.hash_index >= table.size() {
        tracing::warn!(
            hash = cookie.hash_index,
            "reply cookie hash out of table range"
        );
        return ReplyMatch::NoMatch;
    }
    let branch = cookie.branch as usize;
    let guard = table.lock(cookie.hash_index);
    for cell in guard.cells() {
        let key_hit = match &cookie.key {
            CookieKey::Label(label) => *label == cell.id().label,
            CookieKey::Digest(digest) => digest == cell.digest(),
        };
        if !key_hit {
            continue;
        }
        let state = cell.lock();
        if branch >= state.branches.len() {
            tracing::warn!(id = %cell.id(), branch, "reply branch out of range");
            continue;
        }
        if rep.cseq_method == *cell.method() {
            drop(state);
            return ReplyMatch::Branch {
                transaction: TransactionRef::attach(cell.clone()),
                branch,
            };
        }
        if rep.cseq_method == Method::Cancel && !state.branch(branch).cancel.is_empty() {
            drop(state);
            return ReplyMatch::Cancel {
                transaction: TransactionRef::attach(cell.clone()),
                branch,
            };
        }
    }
    ReplyMatch::NoMatch
}
