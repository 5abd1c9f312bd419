/*
 * SPDX-License-Identifier: BlueOak-1.0.0
 */

//! Periodic load balancer (spec §4.5): an exponential-decay per-CPU load
//! estimate plus a barrier-synchronized rebalancing round that migrates
//! work only when doing so strictly reduces the maximum per-CPU load.
//!
//! Grounded on `original_source/kernel/thor/generic/load-balancing.cpp`'s
//! `LoadBalancer::run_`; the decision rule ("only migrate if it strictly
//! lowers max load") is carried over verbatim as `plan_migration`'s
//! acceptance condition (SPEC_FULL §4.5 supplement).

use core::sync::atomic::{AtomicU64, Ordering};

use machine::{CpuId, PerCpu};

/// Decay factor and timing, flagged in spec §9 as empirically tuned and
/// required to stay adjustable — a constructor parameter, not a constant.
#[derive(Clone, Copy, Debug)]
pub struct LbConfig {
    pub decay_numerator: u64,
    pub decay_denominator: u64,
    pub decay_interval_nanos: u64,
}

impl Default for LbConfig {
    fn default() -> Self {
        Self {
            decay_numerator: 184,
            decay_denominator: 256,
            decay_interval_nanos: 1_000_000_000,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Migration {
    pub from: CpuId,
    pub to: CpuId,
    pub amount: u64,
}

/// Per-CPU steady-state load estimate, decayed at `cfg.decay_interval_nanos`
/// granularity, and the migration planner driven off it.
pub struct LoadBalancer<const N: usize> {
    cfg: LbConfig,
    estimate: PerCpu<AtomicU64, N>,
    last_decay_nanos: PerCpu<AtomicU64, N>,
}

impl<const N: usize> LoadBalancer<N> {
    pub fn new(cfg: LbConfig) -> Self {
        Self {
            cfg,
            estimate: PerCpu::new(core::array::from_fn(|_| AtomicU64::new(0))),
            last_decay_nanos: PerCpu::new(core::array::from_fn(|_| AtomicU64::new(0))),
        }
    }

    /// Folds a freshly observed load sample into `cpu`'s running estimate,
    /// decaying first if `cfg.decay_interval_nanos` has elapsed since the
    /// last decay.
    pub fn record_sample(&self, cpu: CpuId, raw_load: u64, now_nanos: u64) {
        let last = self.last_decay_nanos.get(cpu).load(Ordering::Relaxed);
        if now_nanos.saturating_sub(last) >= self.cfg.decay_interval_nanos {
            self.estimate.get(cpu).fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v * self.cfg.decay_numerator / self.cfg.decay_denominator)
            }).ok();
            self.last_decay_nanos.get(cpu).store(now_nanos, Ordering::Relaxed);
        }
        self.estimate.get(cpu).fetch_add(raw_load, Ordering::Relaxed);
    }

    pub fn estimated_load(&self, cpu: CpuId) -> u64 {
        self.estimate.get(cpu).load(Ordering::Relaxed)
    }

    /// One barrier-synchronized rebalancing round: moves half the gap
    /// between the most- and least-loaded CPU from the former to the
    /// latter, but only proposes the migration if it would strictly reduce
    /// the maximum load across all CPUs — a lopsided two-CPU system where
    /// the gap is already 0 or 1 unit yields no migration at all.
    pub fn plan_migration(&self) -> Option<Migration> {
        if N < 2 {
            return None;
        }
        let loads: [u64; N] = core::array::from_fn(|i| self.estimated_load(CpuId::new(i as u32)));
        let (max_idx, &max_load) = loads.iter().enumerate().max_by_key(|(_, v)| **v)?;
        let (min_idx, &min_load) = loads.iter().enumerate().min_by_key(|(_, v)| **v)?;
        if max_idx == min_idx || max_load <= min_load {
            return None;
        }

        let amount = (max_load - min_load) / 2;
        if amount == 0 {
            return None;
        }
        let projected_max = loads
            .iter()
            .enumerate()
            .map(|(i, &v)| {
                if i == max_idx {
                    v - amount
                } else if i == min_idx {
                    v + amount
                } else {
                    v
                }
            })
            .max()
            .unwrap_or(max_load);

        if projected_max < max_load {
            Some(Migration {
                from: CpuId::new(max_idx as u32),
                to: CpuId::new(min_idx as u32),
                amount,
            })
        } else {
            None
        }
    }

    /// Applies a previously planned migration's bookkeeping effect on the
    /// load estimates. Moving the actual work item is the scheduler's job;
    /// this only keeps the estimates consistent with having done so.
    pub fn apply_migration(&self, migration: &Migration) {
        self.estimate.get(migration.from).fetch_sub(migration.amount, Ordering::Relaxed);
        self.estimate.get(migration.to).fetch_add(migration.amount, Ordering::Relaxed);
    }
}
