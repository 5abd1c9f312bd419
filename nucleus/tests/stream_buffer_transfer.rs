//! End-to-end scenario 3 & 4 (spec §8): a buffer send matched against an
//! inline receive, once within the receiver's capacity and once over it.

use nucleus::error::Error;
use nucleus::ipc::stream::{Outcome, Stream, StreamNode};

use std::sync::{Arc, Mutex};

type Captured = Arc<Mutex<Option<Result<Outcome, Error>>>>;

fn capture() -> (Box<dyn FnOnce(Result<Outcome, Error>) + Send>, Captured) {
    let slot = Arc::new(Mutex::new(None));
    let slot2 = slot.clone();
    (Box::new(move |r| *slot2.lock().unwrap() = Some(r)), slot)
}

#[test]
fn send_buffer_within_inline_recv_capacity_delivers_the_bytes() {
    let stream = Stream::new();
    let payload: Vec<u8> = (1..=16).collect();

    let (send_done, send_slot) = capture();
    stream.submit(0, StreamNode::send_buffer(payload.clone(), send_done));

    let (recv_done, recv_slot) = capture();
    stream.submit(1, StreamNode::recv_inline(32, recv_done));

    match send_slot.lock().unwrap().take() {
        Some(Ok(Outcome::BytesCopied(n))) => assert_eq!(n, 16),
        other => panic!("expected BytesCopied(16) on the send side, got {}", debug_tag(&other)),
    }
    match recv_slot.lock().unwrap().take() {
        Some(Ok(Outcome::Buffer(bytes))) => assert_eq!(bytes, payload),
        other => panic!("expected the payload on the recv side, got {}", debug_tag(&other)),
    }
}

#[test]
fn send_buffer_too_large_for_inline_recv_fails_both_sides() {
    let stream = Stream::new();
    let payload = vec![0u8; 64];

    let (recv_done, recv_slot) = capture();
    stream.submit(1, StreamNode::recv_inline(32, recv_done));

    let (send_done, send_slot) = capture();
    stream.submit(0, StreamNode::send_buffer(payload, send_done));

    match send_slot.lock().unwrap().take() {
        Some(Err(Error::BufferTooSmall)) => {}
        other => panic!("expected BufferTooSmall on the send side, got {}", debug_tag(&other)),
    }
    match recv_slot.lock().unwrap().take() {
        Some(Err(Error::BufferTooSmall)) => {}
        other => panic!("expected BufferTooSmall on the recv side, got {}", debug_tag(&other)),
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
        Some(Err(e)) => {
            let _ = e;
            "Err"
        }
    }
}
