/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 */

//! Capability-passing IPC: typed `Stream` matchmaking (spec §4.2) and the
//! kernel-to-user `IpcQueue` completion ring (spec §4.3).

pub mod queue;
pub mod stream;
