/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 */

//! The error taxonomy every subsystem's operations fail into (spec §7).
//!
//! One flat enum rather than one per subsystem: completions and syscall
//! returns all funnel through the same "primary result register" in the
//! end, and a recoverable error from one subsystem routinely needs to be
//! reported by another (e.g. a `Stream` transfer failing with
//! `OutOfMemory` from the allocator it borrowed). `fault` is the only
//! variant the kernel does not hand back to a caller — callers that detect
//! it abort instead (§7: "Invariant violations ... abort the current CPU
//! and panic the kernel").

use snafu::Snafu;

#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("operation was cancelled before completion"))]
    Cancelled,

    #[snafu(display("stream tags on matched nodes are not a legal pair"))]
    TransmissionMismatch,

    #[snafu(display("receiver's buffer cannot hold the sent payload"))]
    BufferTooSmall,

    #[snafu(display("peer lane is closed; no peer can match or will ever match"))]
    EndOfLane,

    #[snafu(display("the caller's own lane is shut down"))]
    LaneShutdown,

    #[snafu(display("static precondition violated"))]
    IllegalArgument,

    #[snafu(display("physical or virtual allocator refused"))]
    OutOfMemory,

    #[snafu(display("userspace sent a malformed submission or request"))]
    ProtocolViolation,

    /// Unrecoverable in-kernel condition. Never returned to a caller:
    /// detecting code panics instead (§7, §9 "Exceptions/panics").
    #[snafu(display("unrecoverable in-kernel condition: invariant violated"))]
    Fault,
}

pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_non_empty_for_every_variant() {
        let variants = [
            Error::Cancelled,
            Error::TransmissionMismatch,
            Error::BufferTooSmall,
            Error::EndOfLane,
            Error::LaneShutdown,
            Error::IllegalArgument,
            Error::OutOfMemory,
            Error::ProtocolViolation,
            Error::Fault,
        ];
        extern crate alloc;
        for v in variants {
            assert!(!alloc::format!("{v}").is_empty());
        }
    }
}
