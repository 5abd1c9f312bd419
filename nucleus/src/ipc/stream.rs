/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 */

//! `Stream`: typed, matchmaking IPC between two lanes (spec §4.2).
//!
//! Grounded on `original_source/kernel/thor/generic/stream.cpp`: lane
//! peer-count refcounting (`incrementPeers`/`decrementPeers`) that drives
//! `broken[p]` is modelled as part of the public surface here
//! (`LaneHandle: Clone + Drop`), not an internal flag only the kernel
//! touches, matching SPEC_FULL §4.2's supplement.

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use machine::IrqSpinlock;

use crate::error::Error;

/// A completion: the transmission operation's result, delivered once a
/// node is matched, cancelled, or torn down. Runs outside the stream's
/// lock, matching spec §4.2's "processed without holding it".
pub type Completion = Box<dyn FnOnce(Result<Outcome, Error>) + Send>;

/// The tag-specific result of a successful transmission.
pub enum Outcome {
    /// `Offer`/`Accept`: a handle to the newly-created child stream's lane.
    NewLane(LaneHandle),
    /// `ExtractCreds`: the credential blob copied from the peer's
    /// `ImbueCreds`.
    Credentials(Vec<u8>),
    /// `RecvInline`: the payload delivered inline.
    Buffer(Vec<u8>),
    /// `RecvToBuffer`: number of bytes copied into the receiver's buffer.
    BytesCopied(usize),
    /// `PullDescriptor`: the descriptor moved from the peer's
    /// `PushDescriptor`. Left generic (`u64`) since the concrete
    /// `Descriptor`/`HandleId` type lives in `crate::handle`, which this
    /// module must not depend on (handles *carry* lanes, not vice versa).
    Descriptor(u64),
    /// Operations with no payload to hand back (`Offer`/`SendBuffer`'s
    /// sender side, `PushDescriptor`'s sender side, `Accept` without
    /// consuming the new lane itself, etc.) still need *a* matched side to
    /// resolve.
    Done,
}

enum Payload {
    Offer,
    Accept,
    ImbueCreds { blob: Vec<u8> },
    ExtractCreds,
    SendBuffer { bytes: Vec<u8> },
    RecvInline { max: usize },
    RecvToBuffer { capacity: usize },
    PushDescriptor { descriptor: u64 },
    PullDescriptor,
}

/// Canonical rank used to order a matched pair: higher ranks first, so the
/// transfer-rule table only needs to be written once per pairing (spec
/// §4.2: "canonicalize so tag(u) >= tag(v) by a fixed ordering").
fn rank(payload: &Payload) -> u8 {
    match payload {
        Payload::Offer => 8,
        Payload::Accept => 7,
        Payload::ImbueCreds { .. } => 6,
        Payload::ExtractCreds => 5,
        Payload::SendBuffer { .. } => 4,
        Payload::RecvInline { .. } => 3,
        Payload::RecvToBuffer { .. } => 2,
        Payload::PushDescriptor { .. } => 1,
        Payload::PullDescriptor => 0,
    }
}

/// A single transmission operation awaiting matchmaking (spec §3
/// `StreamNode`).
pub struct StreamNode {
    payload: Payload,
    completion: Completion,
    /// Further nodes delivered atomically onto the newly-created child
    /// stream upon matching an `Offer`/`Accept` pair (spec §4.2 "ancillary
    /// chain semantics").
    ancillary: Vec<StreamNode>,
}

impl StreamNode {
    fn new(payload: Payload, completion: Completion) -> Self {
        Self {
            payload,
            completion,
            ancillary: Vec::new(),
        }
    }

    pub fn offer(completion: Completion) -> Self {
        Self::new(Payload::Offer, completion)
    }
    pub fn accept(completion: Completion) -> Self {
        Self::new(Payload::Accept, completion)
    }
    pub fn imbue_creds(blob: Vec<u8>, completion: Completion) -> Self {
        Self::new(Payload::ImbueCreds { blob }, completion)
    }
    pub fn extract_creds(completion: Completion) -> Self {
        Self::new(Payload::ExtractCreds, completion)
    }
    pub fn send_buffer(bytes: Vec<u8>, completion: Completion) -> Self {
        Self::new(Payload::SendBuffer { bytes }, completion)
    }
    pub fn recv_inline(max: usize, completion: Completion) -> Self {
        Self::new(Payload::RecvInline { max }, completion)
    }
    pub fn recv_to_buffer(capacity: usize, completion: Completion) -> Self {
        Self::new(Payload::RecvToBuffer { capacity }, completion)
    }
    pub fn push_descriptor(descriptor: u64, completion: Completion) -> Self {
        Self::new(Payload::PushDescriptor { descriptor }, completion)
    }
    pub fn pull_descriptor(completion: Completion) -> Self {
        Self::new(Payload::PullDescriptor, completion)
    }

    /// Attaches nodes to be delivered atomically onto the child stream
    /// created if this node matches an `Offer`/`Accept`.
    pub fn with_ancillary(mut self, chain: Vec<StreamNode>) -> Self {
        self.ancillary = chain;
        self
    }
}

struct LaneState {
    process_queue: VecDeque<StreamNode>,
    broken: bool,
    shutdown: bool,
    peer_count: AtomicUsize,
}

impl LaneState {
    fn new() -> Self {
        Self {
            process_queue: VecDeque::new(),
            broken: false,
            shutdown: false,
            peer_count: AtomicUsize::new(0),
        }
    }
}

/// A two-lane bidirectional channel (spec §3 `Stream`).
pub struct Stream {
    lanes: [IrqSpinlock<LaneState>; 2],
}

impl Stream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            lanes: [IrqSpinlock::new(LaneState::new()), IrqSpinlock::new(LaneState::new())],
        })
    }

    fn other(side: usize) -> usize {
        1 - side
    }

    /// Submits `node` on lane `side`. Either matches immediately against a
    /// peer node (processed and completed before this call returns) or is
    /// enqueued to await a future peer submission (spec §4.2 Submitter).
    pub fn submit(self: &Arc<Self>, side: usize, node: StreamNode) {
        let peer = Self::other(side);
        // A peer already shut down or broken (all its `LaneHandle`s dropped)
        // can never match: fail immediately instead of queuing forever.
        let (peer_unavailable, popped) = self.lanes[peer].lock(|lane| {
            if lane.shutdown || lane.broken {
                (true, None)
            } else {
                (false, lane.process_queue.pop_front())
            }
        });

        match popped {
            Some(peer_node) => {
                let (u, v) = if side == 0 { (node, peer_node) } else { (peer_node, node) };
                self.process_pair(u, v);
            }
            None if peer_unavailable => {
                (node.completion)(Err(Error::EndOfLane));
            }
            None => {
                let rejected = self.lanes[side].lock(|lane| {
                    if lane.shutdown {
                        Some(node)
                    } else {
                        lane.process_queue.push_back(node);
                        None
                    }
                });
                if let Some(rejected) = rejected {
                    (rejected.completion)(Err(Error::LaneShutdown));
                }
            }
        }
    }

    /// Matches a node from lane 0 against one from lane 1, applying the
    /// transfer rule table (spec §4.2).
    fn process_pair(self: &Arc<Self>, lane0_node: StreamNode, lane1_node: StreamNode) {
        let (hi, lo, hi_is_lane0) = if rank(&lane0_node.payload) >= rank(&lane1_node.payload) {
            (lane0_node, lane1_node, true)
        } else {
            (lane1_node, lane0_node, false)
        };

        match (hi.payload, lo.payload) {
            (Payload::Offer, Payload::Accept) => {
                let child = Stream::new();
                let (offer_side, accept_side) = if hi_is_lane0 { (0usize, 1usize) } else { (1, 0) };
                let offer_lane = LaneHandle::new(child.clone(), offer_side);
                let accept_lane = LaneHandle::new(child.clone(), accept_side);

                (hi.completion)(Ok(Outcome::NewLane(offer_lane)));
                (lo.completion)(Ok(Outcome::NewLane(accept_lane)));

                for ancillary in hi.ancillary {
                    child.submit(offer_side, ancillary);
                }
                for ancillary in lo.ancillary {
                    child.submit(accept_side, ancillary);
                }
            }
            (Payload::ImbueCreds { blob }, Payload::ExtractCreds) => {
                (hi.completion)(Ok(Outcome::Done));
                (lo.completion)(Ok(Outcome::Credentials(blob)));
            }
            (Payload::SendBuffer { bytes }, Payload::RecvInline { max }) => {
                if bytes.len() <= max {
                    let len = bytes.len();
                    (hi.completion)(Ok(Outcome::BytesCopied(len)));
                    (lo.completion)(Ok(Outcome::Buffer(bytes)));
                } else {
                    (hi.completion)(Err(Error::BufferTooSmall));
                    (lo.completion)(Err(Error::BufferTooSmall));
                }
            }
            (Payload::SendBuffer { bytes }, Payload::RecvToBuffer { capacity }) => {
                if bytes.len() <= capacity {
                    let len = bytes.len();
                    (hi.completion)(Ok(Outcome::BytesCopied(len)));
                    (lo.completion)(Ok(Outcome::Buffer(bytes)));
                } else {
                    (hi.completion)(Err(Error::BufferTooSmall));
                    (lo.completion)(Err(Error::BufferTooSmall));
                }
            }
            (Payload::PushDescriptor { descriptor }, Payload::PullDescriptor) => {
                (hi.completion)(Ok(Outcome::Done));
                (lo.completion)(Ok(Outcome::Descriptor(descriptor)));
            }
            (hi_payload, lo_payload) => {
                let _ = (hi_payload, lo_payload);
                (hi.completion)(Err(Error::TransmissionMismatch));
                (lo.completion)(Err(Error::TransmissionMismatch));
            }
        }
    }

    /// Shuts down lane `side`: pending nodes on it complete with
    /// `LaneShutdown`; pending nodes on the peer lane complete with
    /// `EndOfLane` (spec §4.2).
    pub fn shutdown_lane(self: &Arc<Self>, side: usize) {
        let peer = Self::other(side);
        let own_drained: Vec<StreamNode> = self.lanes[side].lock(|lane| {
            lane.shutdown = true;
            lane.process_queue.drain(..).collect()
        });
        let peer_drained: Vec<StreamNode> = self.lanes[peer].lock(|lane| lane.process_queue.drain(..).collect());

        for node in own_drained {
            (node.completion)(Err(Error::LaneShutdown));
        }
        for node in peer_drained {
            (node.completion)(Err(Error::EndOfLane));
        }
    }

    fn drop_peer(self: &Arc<Self>, side: usize) {
        let remaining = self.lanes[side].lock(|l| l.peer_count.fetch_sub(1, Ordering::AcqRel) - 1);

        if remaining == 0 {
            let peer = Self::other(side);
            let peer_drained: Vec<StreamNode> = {
                let lane_side = &self.lanes[side];
                lane_side.lock(|l| l.broken = true);
                self.lanes[peer].lock(|l| l.process_queue.drain(..).collect())
            };
            for node in peer_drained {
                (node.completion)(Err(Error::EndOfLane));
            }
        }
    }

    fn is_broken(&self, side: usize) -> bool {
        self.lanes[side].lock(|l| l.broken)
    }
}

/// A refcounted reference to one side of a `Stream` (spec §9: "represent
/// lanes as (Stream handle, side) value types; the Stream uses a per-side
/// atomic refcount").
pub struct LaneHandle {
    stream: Arc<Stream>,
    side: usize,
}

impl LaneHandle {
    fn new(stream: Arc<Stream>, side: usize) -> Self {
        stream.lanes[side].lock(|l| {
            l.peer_count.fetch_add(1, Ordering::AcqRel);
        });
        Self { stream, side }
    }

    /// Creates a handle to lane 0 of a brand-new stream, pairing it with a
    /// handle to lane 1 (the two ends of one freshly-allocated `Stream`).
    pub fn new_pair() -> (LaneHandle, LaneHandle) {
        let stream = Stream::new();
        (LaneHandle::new(stream.clone(), 0), LaneHandle::new(stream, 1))
    }

    pub fn submit(&self, node: StreamNode) {
        self.stream.submit(self.side, node);
    }

    pub fn shutdown(&self) {
        self.stream.shutdown_lane(self.side);
    }

    pub fn is_broken(&self) -> bool {
        self.stream.is_broken(self.side)
    }
}

impl Clone for LaneHandle {
    fn clone(&self) -> Self {
        LaneHandle::new(self.stream.clone(), self.side)
    }
}

impl Drop for LaneHandle {
    fn drop(&mut self) {
        self.stream.drop_peer(self.side);
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use std::sync::Mutex;

    fn capture() -> (Box<dyn FnOnce(Result<Outcome, Error>) + Send>, Arc<Mutex<Option<Result<Outcome, Error>>>>) {
        let slot: Arc<Mutex<Option<Result<Outcome, Error>>>> = Arc::new(Mutex::new(None));
        let slot2 = slot.clone();
        let cb = Box::new(move |r: Result<Outcome, Error>| {
            *slot2.lock().unwrap() = Some(r);
        });
        (cb, slot)
    }

    #[test]
    fn offer_accept_carries_ancillary_credential() {
        let (offer_slot_cb, offer_slot) = capture();
        let (accept_slot_cb, accept_slot) = capture();
        let (cred_cb, cred_slot) = capture();

        let (lane0, lane1) = LaneHandle::new_pair();

        lane0.submit(
            StreamNode::offer(offer_slot_cb)
                .with_ancillary(alloc::vec![StreamNode::imbue_creds(alloc::vec![0xAA], Box::new(|_| {}))]),
        );
        lane1.submit(
            StreamNode::accept(accept_slot_cb).with_ancillary(alloc::vec![StreamNode::extract_creds(cred_cb)]),
        );

        assert!(matches!(
            offer_slot.lock().unwrap().take(),
            Some(Ok(Outcome::NewLane(_)))
        ));
        assert!(matches!(
            accept_slot.lock().unwrap().take(),
            Some(Ok(Outcome::NewLane(_)))
        ));
        match cred_slot.lock().unwrap().take() {
            Some(Ok(Outcome::Credentials(blob))) => assert_eq!(blob, alloc::vec![0xAA]),
            other => panic!("expected credentials, got {:?}", other.is_some()),
        }
    }

    #[test]
    fn send_buffer_matched_with_inline_recv_within_capacity() {
        let (lane0, lane1) = LaneHandle::new_pair();
        let (send_cb, send_slot) = capture();
        let (recv_cb, recv_slot) = capture();

        let payload: Vec<u8> = (1..=16).collect();
        lane0.submit(StreamNode::send_buffer(payload.clone(), send_cb));
        lane1.submit(StreamNode::recv_inline(32, recv_cb));

        assert!(matches!(send_slot.lock().unwrap().take(), Some(Ok(Outcome::BytesCopied(16)))));
        match recv_slot.lock().unwrap().take() {
            Some(Ok(Outcome::Buffer(buf))) => assert_eq!(buf, payload),
            other => panic!("unexpected: {:?}", other.is_some()),
        }
    }

    #[test]
    fn send_buffer_too_large_fails_both_sides() {
        let (lane0, lane1) = LaneHandle::new_pair();
        let (send_cb, send_slot) = capture();
        let (recv_cb, recv_slot) = capture();

        let payload: Vec<u8> = (0..64u16).map(|b| b as u8).collect();
        lane0.submit(StreamNode::send_buffer(payload, send_cb));
        lane1.submit(StreamNode::recv_inline(32, recv_cb));

        assert!(matches!(send_slot.lock().unwrap().take(), Some(Err(Error::BufferTooSmall))));
        assert!(matches!(recv_slot.lock().unwrap().take(), Some(Err(Error::BufferTooSmall))));
    }

    #[test]
    fn mismatched_tags_complete_both_with_transmission_mismatch() {
        let (lane0, lane1) = LaneHandle::new_pair();
        let (a_cb, a_slot) = capture();
        let (b_cb, b_slot) = capture();

        lane0.submit(StreamNode::offer(a_cb));
        lane1.submit(StreamNode::pull_descriptor(b_cb));

        assert!(matches!(a_slot.lock().unwrap().take(), Some(Err(Error::TransmissionMismatch))));
        assert!(matches!(b_slot.lock().unwrap().take(), Some(Err(Error::TransmissionMismatch))));
    }

    #[test]
    fn fifo_order_is_preserved_per_lane() {
        let (lane0, lane1) = LaneHandle::new_pair();
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..4u8 {
            let order = order.clone();
            lane0.submit(StreamNode::push_descriptor(
                i as u64,
                Box::new(move |_| order.lock().unwrap().push(i)),
            ));
        }
        for _ in 0..4 {
            lane1.submit(StreamNode::pull_descriptor(Box::new(|_| {})));
        }

        assert_eq!(*order.lock().unwrap(), alloc::vec![0, 1, 2, 3]);
    }

    #[test]
    fn shutdown_completes_own_lane_with_lane_shutdown_and_peer_with_end_of_lane() {
        let (lane0, lane1) = LaneHandle::new_pair();
        let (pending_cb, pending_slot) = capture();
        let (peer_cb, peer_slot) = capture();

        // lane1 never submits an Accept, so lane0's Offer sits unmatched in
        // lane0's process_queue; likewise queue a node on lane1 that has no
        // chance to match (it only gets drained by shutdown).
        lane0.submit(StreamNode::offer(pending_cb));
        lane0.submit(StreamNode::offer(peer_cb));

        lane0.shutdown();

        assert!(matches!(pending_slot.lock().unwrap().take(), Some(Err(Error::LaneShutdown))));
        assert!(matches!(peer_slot.lock().unwrap().take(), Some(Err(Error::LaneShutdown))));
        let _ = lane1;
    }

    #[test]
    fn shutdown_completes_peer_lane_with_end_of_lane() {
        let (lane0, lane1) = LaneHandle::new_pair();
        let (peer_cb, peer_slot) = capture();

        lane1.submit(StreamNode::accept(peer_cb));
        lane0.shutdown();

        assert!(matches!(peer_slot.lock().unwrap().take(), Some(Err(Error::EndOfLane))));
    }

    #[test]
    fn submit_after_peer_shutdown_fails_immediately_with_end_of_lane() {
        let (lane0, lane1) = LaneHandle::new_pair();
        lane1.shutdown();

        let (late_cb, late_slot) = capture();
        lane0.submit(StreamNode::offer(late_cb));

        assert!(matches!(late_slot.lock().unwrap().take(), Some(Err(Error::EndOfLane))));
    }

    #[test]
    fn submit_after_peer_broken_fails_immediately_with_end_of_lane() {
        let (lane0, lane1) = LaneHandle::new_pair();
        drop(lane1);

        let (late_cb, late_slot) = capture();
        lane0.submit(StreamNode::offer(late_cb));

        assert!(matches!(late_slot.lock().unwrap().take(), Some(Err(Error::EndOfLane))));
    }
}
