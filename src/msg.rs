//! Parsed-message boundary.
//!
//! The engine never parses wire bytes itself; the message parser collaborator
//! hands it [`RequestView`]/[`ReplyView`] values whose fields are
//! length-delimited [`Bytes`] spans into the immutable receive buffer. The
//! views are cheap to clone (the spans share the underlying buffer), which is
//! how a cell takes ownership of its inbound request.
//!
//! This module also carries the small serializers the engine needs for the
//! messages it originates itself: locally generated replies and forwarded
//! request images. Anything beyond that (body rewriting, Record-Route,
//! full header surgery) belongs to the message rewriter, not here.

use std::fmt;
use std::net::SocketAddr;

use bytes::{BufMut, Bytes, BytesMut};
use rand::{rngs::SmallRng, Rng, SeedableRng};

/// SIP request method, as reported by the parser.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Invite,
    Ack,
    Cancel,
    Bye,
    Options,
    Register,
    Subscribe,
    Notify,
    Info,
    Update,
    Prack,
    Refer,
    Message,
    Other(String),
}

impl Method {
    /// Canonical token for the request line and CSeq header.
    pub fn as_str(&self) -> &str {
        match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Cancel => "CANCEL",
            Method::Bye => "BYE",
            Method::Options => "OPTIONS",
            Method::Register => "REGISTER",
            Method::Subscribe => "SUBSCRIBE",
            Method::Notify => "NOTIFY",
            Method::Info => "INFO",
            Method::Update => "UPDATE",
            Method::Prack => "PRACK",
            Method::Refer => "REFER",
            Method::Message => "MESSAGE",
            Method::Other(s) => s.as_str(),
        }
    }

    /// Maps a method token to a `Method`. Unknown tokens are preserved.
    pub fn from_token(token: &[u8]) -> Method {
        match token {
            b"INVITE" => Method::Invite,
            b"ACK" => Method::Ack,
            b"CANCEL" => Method::Cancel,
            b"BYE" => Method::Bye,
            b"OPTIONS" => Method::Options,
            b"REGISTER" => Method::Register,
            b"SUBSCRIBE" => Method::Subscribe,
            b"NOTIFY" => Method::Notify,
            b"INFO" => Method::Info,
            b"UPDATE" => Method::Update,
            b"PRACK" => Method::Prack,
            b"REFER" => Method::Refer,
            b"MESSAGE" => Method::Message,
            other => Method::Other(String::from_utf8_lossy(other).into_owned()),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport protocol named in the topmost Via.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Udp,
    Tcp,
    Tls,
    Ws,
}

impl TransportKind {
    pub fn as_str(&self) -> &str {
        match self {
            TransportKind::Udp => "UDP",
            TransportKind::Tcp => "TCP",
            TransportKind::Tls => "TLS",
            TransportKind::Ws => "WS",
        }
    }

    /// Whether retransmission timers apply for this transport.
    pub fn is_reliable(&self) -> bool {
        !matches!(self, TransportKind::Udp)
    }
}

/// Topmost Via header of a message, decomposed by the parser.
#[derive(Debug, Clone)]
pub struct ViaView {
    /// The full header value as received, e.g.
    /// `SIP/2.0/UDP host:5060;branch=z9hG4bK...`.
    pub raw: Bytes,
    pub host: Bytes,
    pub port: u16,
    pub transport: TransportKind,
    /// The `branch` parameter value; empty when absent (pre-RFC3261 client).
    pub branch: Bytes,
}

/// Read-only view of a parsed inbound request.
///
/// `from`/`to` hold the complete header values (display name, URI and
/// parameters) so the legacy matching path can compare them byte-wise;
/// the tags are additionally broken out for the RFC3261 paths.
#[derive(Debug, Clone)]
pub struct RequestView {
    pub raw: Bytes,
    /// Where the request came from; replies for this transaction go back
    /// to this address.
    pub source: SocketAddr,
    pub method: Method,
    pub uri: Bytes,
    pub via: ViaView,
    pub call_id: Bytes,
    pub cseq_num: u32,
    pub cseq_method: Method,
    pub from: Bytes,
    /// `tag` parameter of From; empty when absent.
    pub from_tag: Bytes,
    pub to: Bytes,
    /// `tag` parameter of To; empty when absent.
    pub to_tag: Bytes,
}

/// Read-only view of a parsed inbound reply.
#[derive(Debug, Clone)]
pub struct ReplyView {
    pub raw: Bytes,
    pub status: u16,
    pub reason: Bytes,
    /// `branch` parameter of the topmost Via (the one this engine put there).
    pub via_branch: Bytes,
    pub call_id: Bytes,
    pub cseq_num: u32,
    pub cseq_method: Method,
    pub from_tag: Bytes,
    pub to_tag: Bytes,
    /// Whether a Retry-After header is present (503 failover gate).
    pub has_retry_after: bool,
}

impl ReplyView {
    pub fn is_provisional(&self) -> bool {
        self.status < 200
    }

    pub fn is_final(&self) -> bool {
        self.status >= 200
    }

    pub fn is_2xx(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Default reason phrase for locally generated replies.
pub fn default_reason(code: u16) -> &'static str {
    match code {
        100 => "Trying",
        180 => "Ringing",
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        408 => "Request Timeout",
        481 => "Call/Transaction Does Not Exist",
        486 => "Busy Here",
        487 => "Request Terminated",
        500 => "Server Internal Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// Generates a local To-tag for replies this engine originates.
pub(crate) fn generate_totag() -> Bytes {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut rng = SmallRng::from_entropy();
    let mut tag = BytesMut::with_capacity(16);
    for _ in 0..16 {
        tag.put_u8(HEX[rng.gen_range(0..16)]);
    }
    tag.freeze()
}

/// Serializes a reply generated on behalf of the UAS side of `req`.
///
/// Copies Via/From/Call-ID/CSeq verbatim; the To header gets `to_tag`
/// appended when the request carried none and a tag is supplied.
pub fn build_reply(req: &RequestView, code: u16, reason: &str, to_tag: Option<&[u8]>) -> Bytes {
    build_reply_with(req, code, reason, to_tag, &[], None)
}

/// [`build_reply`] with caller-supplied extra headers and a body, for
/// replies that carry more than the copied identity (a 302 with Contact,
/// a 200 with an application body).
pub fn build_reply_with(
    req: &RequestView,
    code: u16,
    reason: &str,
    to_tag: Option<&[u8]>,
    headers: &[(&str, &[u8])],
    body: Option<&[u8]>,
) -> Bytes {
    let mut buf = BytesMut::with_capacity(256 + body.map_or(0, <[u8]>::len));
    buf.put_slice(b"SIP/2.0 ");
    buf.put_slice(code.to_string().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(reason.as_bytes());
    buf.put_slice(b"\r\nVia: ");
    buf.put_slice(&req.via.raw);
    buf.put_slice(b"\r\nFrom: ");
    buf.put_slice(&req.from);
    buf.put_slice(b"\r\nTo: ");
    buf.put_slice(&req.to);
    if req.to_tag.is_empty() {
        if let Some(tag) = to_tag {
            buf.put_slice(b";tag=");
            buf.put_slice(tag);
        }
    }
    buf.put_slice(b"\r\nCall-ID: ");
    buf.put_slice(&req.call_id);
    buf.put_slice(b"\r\nCSeq: ");
    buf.put_slice(req.cseq_num.to_string().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(req.cseq_method.as_str().as_bytes());
    buf.put_slice(b"\r\n");
    for (name, value) in headers {
        buf.put_slice(name.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value);
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(b"Content-Length: ");
    buf.put_slice(body.map_or(0, <[u8]>::len).to_string().as_bytes());
    buf.put_slice(b"\r\n\r\n");
    if let Some(body) = body {
        buf.put_slice(body);
    }
    buf.freeze()
}

/// Serializes the outbound image of `req` with this engine's own topmost Via.
///
/// Returns the rewritten view (the stored branch copy) together with the wire
/// buffer handed to the transport and kept for retransmission.
pub fn build_forward(
    req: &RequestView,
    via_host: &str,
    via_port: u16,
    transport: TransportKind,
    branch: &str,
    destination: SocketAddr,
) -> (RequestView, Bytes) {
    let via_raw = format!(
        "SIP/2.0/{} {}:{};branch={}",
        transport.as_str(),
        via_host,
        via_port,
        branch
    );

    let mut buf = BytesMut::with_capacity(256 + req.raw.len());
    buf.put_slice(req.method.as_str().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(&req.uri);
    buf.put_slice(b" SIP/2.0\r\nVia: ");
    buf.put_slice(via_raw.as_bytes());
    buf.put_slice(b"\r\nFrom: ");
    buf.put_slice(&req.from);
    buf.put_slice(b"\r\nTo: ");
    buf.put_slice(&req.to);
    buf.put_slice(b"\r\nCall-ID: ");
    buf.put_slice(&req.call_id);
    buf.put_slice(b"\r\nCSeq: ");
    buf.put_slice(req.cseq_num.to_string().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(req.cseq_method.as_str().as_bytes());
    buf.put_slice(b"\r\nMax-Forwards: 70\r\nContent-Length: 0\r\n\r\n");
    let raw = buf.freeze();

    let view = RequestView {
        raw: raw.clone(),
        source: destination,
        method: req.method.clone(),
        uri: req.uri.clone(),
        via: ViaView {
            raw: Bytes::from(via_raw.into_bytes()),
            host: Bytes::from(via_host.as_bytes().to_vec()),
            port: via_port,
            transport,
            branch: Bytes::from(branch.as_bytes().to_vec()),
        },
        call_id: req.call_id.clone(),
        cseq_num: req.cseq_num,
        cseq_method: req.cseq_method.clone(),
        from: req.from.clone(),
        from_tag: req.from_tag.clone(),
        to: req.to.clone(),
        to_tag: req.to_tag.clone(),
    };
    (view, raw)
}
