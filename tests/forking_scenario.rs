//! The reference forked-INVITE flow: two branches, ringing on one, answer
//! on the other, then a late answer from the loser.

mod common;

use common::*;
use sip_tm::prelude::*;

#[test]
fn forked_invite_relays_180_then_200_and_absorbs_the_late_200() {
    let te = test_engine();
    let inv = invite("abc@1.2.3.4", "z9hG4bK-caller");
    assert_eq!(inv.cseq_num, 1);

    let mut ctx = RequestCtx::new();
    let (t, is_new) = te.engine.lookup_or_create(&inv, &mut ctx).unwrap();
    assert!(is_new);
    te.engine.add_branch(&t, addr(DOWNSTREAM_A), vec![]).unwrap();
    te.engine.add_branch(&t, addr(DOWNSTREAM_B), vec![]).unwrap();
    te.transport.take();

    // branch 0 rings
    assert_eq!(
        te.engine
            .handle_reply(&branch_reply(&t, 0, 180, "tag-a"))
            .unwrap(),
        ReplyDisposition::Relayed(180)
    );

    // branch 1 answers: relayed, transaction complete
    assert_eq!(
        te.engine
            .handle_reply(&branch_reply(&t, 1, 200, "tag-b"))
            .unwrap(),
        ReplyDisposition::Relayed(200)
    );
    assert_eq!(t.lock().status, 200);

    let upstream = te.transport.sent_to(addr(UPSTREAM));
    assert_eq!(upstream.len(), 2);
    assert!(String::from_utf8(upstream[0].clone())
        .unwrap()
        .starts_with("SIP/2.0 180"));
    assert!(String::from_utf8(upstream[1].clone())
        .unwrap()
        .starts_with("SIP/2.0 200"));

    // the loser answers late with its own To-tag: recorded, not relayed
    assert_eq!(
        te.engine
            .handle_reply(&branch_reply(&t, 0, 200, "tag-a"))
            .unwrap(),
        ReplyDisposition::TagRecorded
    );
    {
        let state = t.lock();
        assert_eq!(state.status, 200);
        assert_eq!(state.fwded_totags.len(), 2);
    }
    // no third message went upstream
    assert_eq!(te.transport.sent_to(addr(UPSTREAM)).len(), 2);

    // retransmission of the late 200 changes nothing
    assert_eq!(
        te.engine
            .handle_reply(&branch_reply(&t, 0, 200, "tag-a"))
            .unwrap(),
        ReplyDisposition::Absorbed
    );
    assert_eq!(t.lock().fwded_totags.len(), 2);

    // both answering legs can be end-to-end ACKed, once per tag
    let ack_b = e2e_ack_for(&inv, "tag-b", "z9hG4bK-ack-b");
    let mut ack_ctx = RequestCtx::new();
    assert!(matches!(
        te.engine.handle_request(&ack_b, &mut ack_ctx).unwrap(),
        RequestDisposition::E2eAck(_, _)
    ));
    let ack_a = e2e_ack_for(&inv, "tag-a", "z9hG4bK-ack-a");
    let mut ack_ctx2 = RequestCtx::new();
    assert!(matches!(
        te.engine.handle_request(&ack_a, &mut ack_ctx2).unwrap(),
        RequestDisposition::E2eAck(_, _)
    ));
}
