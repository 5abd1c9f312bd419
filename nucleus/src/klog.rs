/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 */

//! The kernel log ring (spec §6): "single-producer-per-CPU, fixed-size,
//! wrap-on-full... drained asynchronously to userspace consumers over IPC
//! queues." [`KernelLog`] is a [`log::Log`] implementation so every
//! subsystem's `trace!`/`debug!`/`warn!` call site both populates this ring
//! and, in host tests, prints to stderr — the same idiom
//! `examples/other_examples/*tlb.rs.rs` uses for its shootdown tracing.

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;

use log::{Level, Metadata, Record as LogRecord};
use once_cell::sync::OnceCell;

/// One captured log line. Cheap to clone; queued for draining rather than
/// formatted again at drain time.
#[derive(Clone, Debug)]
pub struct Record {
    pub level: Level,
    pub target: String,
    pub message: String,
}

/// A fixed-capacity ring of [`Record`]s. Pushing past capacity silently
/// drops the oldest entry (spec §6: "wrap-on-full") rather than blocking or
/// growing — a logger that can stall its caller waiting for space is not
/// safe to call from arbitrary IRQ context.
pub struct KernelLog {
    capacity: usize,
    lines: machine::IrqSpinlock<VecDeque<Record>>,
}

impl KernelLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            lines: machine::IrqSpinlock::new(VecDeque::with_capacity(capacity)),
        }
    }

    fn push(&self, record: Record) {
        self.lines.lock(|q| {
            if q.len() >= self.capacity {
                q.pop_front();
            }
            q.push_back(record);
        });
    }

    /// Drains every currently buffered line, oldest first. This is the
    /// producer side of the IPC queue a userspace log consumer reads from.
    pub fn drain(&self) -> Vec<Record> {
        self.lines.lock(|q| q.drain(..).collect())
    }

    pub fn len(&self) -> usize {
        self.lines.lock(|q| q.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl log::Log for KernelLog {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &LogRecord) {
        if !self.enabled(record.metadata()) {
            return;
        }
        self.push(Record {
            level: record.level(),
            target: String::from(record.target()),
            message: alloc::format!("{}", record.args()),
        });
        #[cfg(test)]
        {
            extern crate std;
            std::eprintln!("[{}] {}: {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

static LOGGER: OnceCell<KernelLog> = OnceCell::new();

/// Installs a process-wide [`KernelLog`] of `capacity` lines as the `log`
/// crate's global logger. Idempotent: a second call returns the already-
/// installed ring's error, matching `log::set_logger`'s own contract.
pub fn init(capacity: usize) -> Result<(), log::SetLoggerError> {
    let logger = LOGGER.get_or_init(|| KernelLog::new(capacity));
    log::set_logger(logger)?;
    log::set_max_level(log::LevelFilter::Trace);
    Ok(())
}
