//! End-to-end scenario 2 (spec §8): an `Offer`/`Accept` pair whose ancillary
//! chains carry a credential blob across to the newly created child stream.

use nucleus::error::Error;
use nucleus::ipc::stream::{LaneHandle, Outcome, Stream, StreamNode};

use std::sync::{Arc, Mutex};

type Captured = Arc<Mutex<Option<Result<Outcome, Error>>>>;

fn capture() -> (Box<dyn FnOnce(Result<Outcome, Error>) + Send>, Captured) {
    let slot = Arc::new(Mutex::new(None));
    let slot2 = slot.clone();
    (Box::new(move |r| *slot2.lock().unwrap() = Some(r)), slot)
}

#[test]
fn offer_accept_with_imbued_credential_reaches_the_extracting_side() {
    let parent = Stream::new();

    let (offer_done, offer_slot) = capture();
    let (imbue_done, imbue_slot) = capture();
    parent.submit(
        0,
        StreamNode::offer(offer_done).with_ancillary(vec![StreamNode::imbue_creds(vec![0xAA], imbue_done)]),
    );

    let (accept_done, accept_slot) = capture();
    let (extract_done, extract_slot) = capture();
    parent.submit(
        1,
        StreamNode::accept(accept_done).with_ancillary(vec![StreamNode::extract_creds(extract_done)]),
    );

    let offer_lane = match offer_slot.lock().unwrap().take() {
        Some(Ok(Outcome::NewLane(lane))) => lane,
        other => panic!("expected a new lane from the offer side, got {:?}", debug_tag(&other)),
    };
    let accept_lane = match accept_slot.lock().unwrap().take() {
        Some(Ok(Outcome::NewLane(lane))) => lane,
        other => panic!("expected a new lane from the accept side, got {:?}", debug_tag(&other)),
    };
    // Two independent handles to two ends of the same freshly created stream.
    let _keep_alive: (LaneHandle, LaneHandle) = (offer_lane, accept_lane);

    assert!(matches!(imbue_slot.lock().unwrap().take(), Some(Ok(Outcome::Done))));

    match extract_slot.lock().unwrap().take() {
        Some(Ok(Outcome::Credentials(blob))) => assert_eq!(blob, vec![0xAA]),
        other => panic!("expected the credential blob, got {:?}", debug_tag(&other)),
    }
}

fn debug_tag(outcome: &Option<Result<Outcome, Error>>) -> &'static str {
    match outcome {
        None => "none",
        Some(Ok(Outcome::NewLane(_))) => "NewLane",
        Some(Ok(Outcome::Credentials(_))) => "Credentials",
        Some(Ok(Outcome::Buffer(_))) => "Buffer",
        Some(Ok(Outcome::BytesCopied(_))) => "BytesCopied",
        Some(Ok(Outcome::Descriptor(_))) => "Descriptor",
        Some(Ok(Outcome::Done)) => "Done",
        Some(Err(_)) => "Err",
    }
}
