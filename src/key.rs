//! Transaction identity encoded in the Via branch parameter.
//!
//! Every outbound branch this engine creates carries a branch parameter of
//! the form `z9hG4bK<hash>.<key>.<branch>`, all components lowercase hex.
//! The middle component is either the per-bucket sequence label (synonym
//! mode, fast but meaningless after a restart) or the 16-byte MD5 digest of
//! the transaction's matching fields (reboot-resilient mode). Replies coming
//! back on that branch are matched in O(1) by decoding the cookie instead of
//! comparing header fields.

use std::fmt;

use md5::{Digest, Md5};

use crate::table::CellId;

/// RFC3261 magic cookie prefixing every modern branch parameter.
pub const MAGIC_COOKIE: &[u8] = b"z9hG4bK";

/// Which key the middle cookie component carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMode {
    /// Per-bucket sequence label. Cheap, unique for the process lifetime.
    Synonym,
    /// MD5 digest over the matching fields. Survives restarts.
    Digest,
}

/// The decoded middle component of a branch cookie.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum CookieKey {
    Label(u32),
    Digest([u8; 16]),
}

impl fmt::Debug for CookieKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CookieKey::Label(l) => write!(f, "Label({l:x})"),
            CookieKey::Digest(d) => {
                write!(f, "Digest(")?;
                for b in d {
                    write!(f, "{b:02x}")?;
                }
                write!(f, ")")
            }
        }
    }
}

/// A fully decoded branch cookie: `(hash_index, key, branch)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchCookie {
    pub hash_index: usize,
    pub key: CookieKey,
    pub branch: u16,
}

impl BranchCookie {
    /// Cookie for branch `branch` of the cell identified by `id`,
    /// synonym mode.
    pub fn synonym(id: CellId, branch: u16) -> Self {
        Self {
            hash_index: id.hash_index,
            key: CookieKey::Label(id.label),
            branch,
        }
    }

    /// Cookie for branch `branch` of a cell with digest key `digest`,
    /// reboot-resilient mode.
    pub fn digest(id: CellId, digest: [u8; 16], branch: u16) -> Self {
        Self {
            hash_index: id.hash_index,
            key: CookieKey::Digest(digest),
            branch,
        }
    }

    /// Renders the cookie as the full branch parameter value, magic cookie
    /// included.
    pub fn encode(&self) -> String {
        let mut out = String::with_capacity(7 + 8 + 1 + 32 + 1 + 4);
        out.push_str("z9hG4bK");
        push_hex(&mut out, self.hash_index as u64);
        out.push('.');
        match &self.key {
            CookieKey::Label(l) => push_hex(&mut out, *l as u64),
            CookieKey::Digest(d) => {
                for b in d {
                    out.push(HEX[(b >> 4) as usize] as char);
                    out.push(HEX[(b & 0x0f) as usize] as char);
                }
            }
        }
        out.push('.');
        push_hex(&mut out, self.branch as u64);
        out
    }

    /// Decodes a branch parameter value previously produced by [`encode`].
    ///
    /// Returns `None` for anything this engine did not mint: missing magic
    /// cookie, wrong segment count, empty or non-hex segments, overflowing
    /// values. Range validation against the actual table size happens at the
    /// matching layer.
    ///
    /// [`encode`]: BranchCookie::encode
    pub fn decode(branch_param: &[u8]) -> Option<Self> {
        let rest = branch_param.strip_prefix(MAGIC_COOKIE)?;
        let mut segments = rest.split(|&b| b == b'.');
        let hash = segments.next()?;
        let key = segments.next()?;
        let branch = segments.next()?;
        if segments.next().is_some() {
            return None;
        }

        let hash_index = parse_hex(hash, 8)? as usize;
        let branch = parse_hex(branch, 4)? as u16;
        let key = if key.len() == 32 {
            let mut digest = [0u8; 16];
            for (i, chunk) in key.chunks_exact(2).enumerate() {
                let hi = hex_val(chunk[0])?;
                let lo = hex_val(chunk[1])?;
                digest[i] = (hi << 4) | lo;
            }
            CookieKey::Digest(digest)
        } else {
            CookieKey::Label(parse_hex(key, 8)? as u32)
        };

        Some(Self {
            hash_index,
            key,
            branch,
        })
    }
}

const HEX: &[u8; 16] = b"0123456789abcdef";

fn push_hex(out: &mut String, mut v: u64) {
    let mut digits = [0u8; 16];
    let mut n = 0;
    loop {
        digits[n] = HEX[(v & 0x0f) as usize];
        n += 1;
        v >>= 4;
        if v == 0 {
            break;
        }
    }
    for i in (0..n).rev() {
        out.push(digits[i] as char);
    }
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn parse_hex(s: &[u8], max_digits: usize) -> Option<u64> {
    if s.is_empty() || s.len() > max_digits {
        return None;
    }
    let mut v: u64 = 0;
    for &b in s {
        v = (v << 4) | hex_val(b)? as u64;
    }
    Some(v)
}

/// Computes the reboot-resilient transaction key.
///
/// MD5 over the fields that identify the transaction across restarts;
/// separators keep field boundaries unambiguous.
pub fn compute_digest(call_id: &[u8], cseq_num: u32, from_tag: &[u8], uri: &[u8]) -> [u8; 16] {
    let mut md5 = Md5::new();
    md5.update(call_id);
    md5.update([0u8]);
    md5.update(cseq_num.to_be_bytes());
    md5.update([0u8]);
    md5.update(from_tag);
    md5.update([0u8]);
    md5.update(uri);
    md5.finalize().into()
}
