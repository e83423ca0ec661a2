//! Shared helpers for the integration tests: message builders and mock
//! collaborators for the transport and timer-wheel boundaries.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use sip_tm::prelude::*;
use sip_tm::BranchCookie;

/// Records every outbound send.
#[derive(Default)]
pub struct MockTransport {
    pub sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn take(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        std::mem::take(&mut self.sent.lock())
    }

    pub fn sent_to(&self, destination: SocketAddr) -> Vec<Vec<u8>> {
        self.sent
            .lock()
            .iter()
            .filter(|(d, _)| *d == destination)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.sent.lock().len()
    }
}

impl Transport for MockTransport {
    fn send(&self, destination: SocketAddr, message: &[u8]) -> Result<()> {
        self.sent.lock().push((destination, message.to_vec()));
        Ok(())
    }
}

/// Records schedule/cancel calls; tests fire handles into the engine by
/// hand.
#[derive(Default)]
pub struct MockWheel {
    pub scheduled: Mutex<Vec<(TimerHandle, u64)>>,
    pub cancelled: Mutex<Vec<TimerHandle>>,
}

impl MockWheel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn scheduled_of(&self, kind: TimerKind) -> Vec<(TimerHandle, u64)> {
        self.scheduled
            .lock()
            .iter()
            .filter(|(h, _)| h.kind == kind)
            .cloned()
            .collect()
    }

    pub fn was_scheduled(&self, kind: TimerKind) -> bool {
        !self.scheduled_of(kind).is_empty()
    }

    pub fn clear(&self) {
        self.scheduled.lock().clear();
        self.cancelled.lock().clear();
    }
}

impl TimerWheel for MockWheel {
    fn schedule(&self, handle: TimerHandle, delay_ticks: u64) {
        self.scheduled.lock().push((handle, delay_ticks));
    }

    fn cancel(&self, handle: TimerHandle) {
        self.cancelled.lock().push(handle);
    }
}

/// An engine wired to mocks, plus handles to inspect them.
pub struct TestEngine {
    pub engine: TransactionEngine<Arc<MockTransport>, Arc<MockWheel>>,
    pub transport: Arc<MockTransport>,
    pub wheel: Arc<MockWheel>,
}

pub fn test_engine() -> TestEngine {
    test_engine_with(EngineConfig {
        table_size: 64,
        ..Default::default()
    })
}

pub fn test_engine_with(config: EngineConfig) -> TestEngine {
    let transport = MockTransport::new();
    let wheel = MockWheel::new();
    let engine = TransactionEngine::new(config, transport.clone(), wheel.clone())
        .expect("test config is valid");
    TestEngine {
        engine,
        transport,
        wheel,
    }
}

pub const UPSTREAM: &str = "10.0.0.1:5060";
pub const DOWNSTREAM_A: &str = "192.168.1.10:5060";
pub const DOWNSTREAM_B: &str = "192.168.1.11:5060";

pub fn addr(s: &str) -> SocketAddr {
    s.parse().expect("valid test address")
}

fn owned(s: &str) -> Bytes {
    Bytes::from(s.as_bytes().to_vec())
}

/// An inbound request from the upstream client.
pub fn request(method: Method, call_id: &str, cseq: u32, branch: &str) -> RequestView {
    let cseq_method = method.clone();
    RequestView {
        raw: owned("raw request"),
        source: addr(UPSTREAM),
        method,
        uri: owned("sip:bob@example.com"),
        via: ViaView {
            raw: owned(&format!("SIP/2.0/UDP 10.0.0.1:5060;branch={branch}")),
            host: owned("10.0.0.1"),
            port: 5060,
            transport: TransportKind::Udp,
            branch: owned(branch),
        },
        call_id: owned(call_id),
        cseq_num: cseq,
        cseq_method,
        from: owned("<sip:alice@example.com>;tag=ft1"),
        from_tag: owned("ft1"),
        to: owned("<sip:bob@example.com>"),
        to_tag: Bytes::new(),
    }
}

pub fn invite(call_id: &str, branch: &str) -> RequestView {
    request(Method::Invite, call_id, 1, branch)
}

/// The CANCEL a client sends for its own INVITE: same identity, same
/// branch, method switched.
pub fn cancel_for(invite: &RequestView) -> RequestView {
    let mut req = invite.clone();
    req.method = Method::Cancel;
    req.cseq_method = Method::Cancel;
    req
}

/// The end-to-end ACK for a 2xx: new branch, To-tag of the answering leg.
pub fn e2e_ack_for(invite: &RequestView, to_tag: &str, branch: &str) -> RequestView {
    let mut req = invite.clone();
    req.method = Method::Ack;
    req.cseq_method = Method::Ack;
    req.via.branch = owned(branch);
    req.via.raw = owned(&format!("SIP/2.0/UDP 10.0.0.1:5060;branch={branch}"));
    req.to = owned(&format!("<sip:bob@example.com>;tag={to_tag}"));
    req.to_tag = owned(to_tag);
    req
}

/// The hop-by-hop ACK for a negative final: same branch as the INVITE.
pub fn hop_ack_for(invite: &RequestView) -> RequestView {
    let mut req = invite.clone();
    req.method = Method::Ack;
    req.cseq_method = Method::Ack;
    req
}

/// A reply arriving on branch `branch` of `transaction`, carrying the
/// cookie this engine minted for it (synonym mode).
pub fn branch_reply(
    transaction: &TransactionRef,
    branch: usize,
    code: u16,
    to_tag: &str,
) -> ReplyView {
    let cookie = BranchCookie::synonym(transaction.id(), branch as u16).encode();
    reply_with_cookie(&cookie, code, to_tag, transaction.method().clone())
}

pub fn reply_with_cookie(cookie: &str, code: u16, to_tag: &str, cseq_method: Method) -> ReplyView {
    ReplyView {
        raw: owned(&format!("SIP/2.0 {code} reply")),
        status: code,
        reason: owned("reply"),
        via_branch: owned(cookie),
        call_id: owned("cid"),
        cseq_num: 1,
        cseq_method,
        from_tag: owned("ft1"),
        to_tag: owned(to_tag),
        has_retry_after: false,
    }
}
