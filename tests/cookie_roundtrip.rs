//! Property tests for the branch cookie: decoding what was encoded always
//! reproduces the exact `(hash_index, label/digest, branch)` triple.

use proptest::prelude::*;

use sip_tm::table::CellId;
use sip_tm::{BranchCookie, CookieKey};

proptest! {
    #[test]
    fn synonym_cookie_round_trips(hash in 0usize..(1 << 20), label: u32, branch: u16) {
        let id = CellId { hash_index: hash, label };
        let cookie = BranchCookie::synonym(id, branch);
        let encoded = cookie.encode();
        let decoded = BranchCookie::decode(encoded.as_bytes());
        prop_assert_eq!(decoded, Some(cookie));
    }

    #[test]
    fn digest_cookie_round_trips(hash in 0usize..(1 << 20), digest: [u8; 16], branch: u16) {
        let id = CellId { hash_index: hash, label: 0 };
        let cookie = BranchCookie::digest(id, digest, branch);
        let encoded = cookie.encode();
        let decoded = BranchCookie::decode(encoded.as_bytes());
        prop_assert_eq!(decoded.clone(), Some(cookie));
        match decoded.map(|c| c.key) {
            Some(CookieKey::Digest(d)) => prop_assert_eq!(d, digest),
            other => prop_assert!(false, "expected digest key, got {:?}", other),
        }
    }

    #[test]
    fn decode_never_panics_on_garbage(input in proptest::collection::vec(any::<u8>(), 0..64)) {
        let _ = BranchCookie::decode(&input);
    }

    #[test]
    fn foreign_uuid_style_branches_never_decode(suffix in "[g-zG-Z-][a-zA-Z0-9-]{0,20}") {
        // anything whose first post-cookie segment is not pure hex is foreign
        let branch = format!("z9hG4bK{suffix}");
        prop_assert_eq!(BranchCookie::decode(branch.as_bytes()), None);
    }
}
