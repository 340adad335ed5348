//! Per-instance statistics and integrity checksums
//!
//! One `InstanceStats` slot and one `ChecksumSlot` exist per forked instance.
//! Each is written only by the instance that owns it while it runs, and read
//! by the coordinator only after that instance has been reaped. Everything
//! is made of atomics so that a zero-filled mapping is a valid initial state
//! and no layout pointer ever crosses a process boundary.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};

/// Maximal number of named metrics per instance
pub const MAX_METRICS: usize = 40;

/// How a named metric should be combined across instances
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Serialize, serde::Deserialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum MeanKind {
    /// Sum across instances
    Total,

    /// Largest value across instances
    Maximum,

    /// Geometric mean of positive values
    GeometricMean,

    /// Harmonic mean of positive values
    HarmonicMean,
}
//
impl MeanKind {
    /// Encoding used in shared memory, 0 is reserved for "no metric"
    fn to_raw(self) -> u32 {
        match self {
            Self::Total => 1,
            Self::Maximum => 2,
            Self::GeometricMean => 3,
            Self::HarmonicMean => 4,
        }
    }

    /// Decode the shared memory encoding
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Total),
            2 => Some(Self::Maximum),
            3 => Some(Self::GeometricMean),
            4 => Some(Self::HarmonicMean),
            _ => None,
        }
    }
}

/// One named metric of an instance
#[derive(Default)]
#[repr(C)]
pub struct MetricSlot {
    /// Offset of the interned description in the shared heap
    description: AtomicU32,

    /// Combination kind, see `MeanKind::to_raw`
    kind: AtomicU32,

    /// Value, as the bits of an f64
    value: AtomicU64,
}
//
impl MetricSlot {
    /// Record a metric value
    pub(crate) fn set(&self, description: u32, value: f64, kind: MeanKind) {
        self.description.store(description, Ordering::Relaxed);
        self.value.store(value.to_bits(), Ordering::Relaxed);
        self.kind.store(kind.to_raw(), Ordering::Release);
    }

    /// Read back a metric, if one was recorded
    pub fn get(&self) -> Option<(u32, f64, MeanKind)> {
        let kind = MeanKind::from_raw(self.kind.load(Ordering::Acquire))?;
        Some((
            self.description.load(Ordering::Relaxed),
            f64::from_bits(self.value.load(Ordering::Relaxed)),
            kind,
        ))
    }

    /// Forget any previously recorded value
    fn clear(&self) {
        self.kind.store(0, Ordering::Relaxed);
        self.description.store(0, Ordering::Relaxed);
        self.value.store(0, Ordering::Relaxed);
    }
}

/// Statistics slot of one stressor instance
#[repr(C)]
pub struct InstanceStats {
    /// PID of the owning instance, 0 once reaped
    pub pid: AtomicI32,

    /// Set by the coordinator once the instance has been waited for
    pub reaped: AtomicBool,

    /// Set by the coordinator once a stop signal was sent to the instance
    pub signalled: AtomicBool,

    /// Set by the instance once its final numbers are stored
    pub completed: AtomicBool,

    /// Workload self-assessment
    pub run_ok: AtomicBool,

    /// Start barrier state, see `barrier::SyncState`
    pub sync_state: AtomicU32,

    /// Bogo-op counter
    pub counter: AtomicU64,

    /// Start of the measurement window, in ns since the UNIX epoch
    pub start_time_ns: AtomicU64,

    /// Length of the measurement window in ns
    pub duration_ns: AtomicU64,

    /// User CPU time consumed by the instance in ns
    pub user_time_ns: AtomicU64,

    /// System CPU time consumed by the instance in ns
    pub sys_time_ns: AtomicU64,

    /// Maximum resident set size in KiB
    pub max_rss_kib: AtomicU64,

    /// Named metrics
    pub metrics: [MetricSlot; MAX_METRICS],
}
//
impl Default for InstanceStats {
    fn default() -> Self {
        Self {
            pid: AtomicI32::new(0),
            reaped: AtomicBool::new(false),
            signalled: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            run_ok: AtomicBool::new(false),
            sync_state: AtomicU32::new(0),
            counter: AtomicU64::new(0),
            start_time_ns: AtomicU64::new(0),
            duration_ns: AtomicU64::new(0),
            user_time_ns: AtomicU64::new(0),
            sys_time_ns: AtomicU64::new(0),
            max_rss_kib: AtomicU64::new(0),
            metrics: std::array::from_fn(|_| MetricSlot::default()),
        }
    }
}
//
impl InstanceStats {
    /// Bring the slot back to its pristine state for a new instance
    pub(crate) fn reset(&self, pid: i32) {
        self.reaped.store(false, Ordering::Relaxed);
        self.signalled.store(false, Ordering::Relaxed);
        self.completed.store(false, Ordering::Relaxed);
        self.run_ok.store(false, Ordering::Relaxed);
        self.sync_state.store(0, Ordering::Relaxed);
        self.counter.store(0, Ordering::Relaxed);
        self.start_time_ns.store(0, Ordering::Relaxed);
        self.duration_ns.store(0, Ordering::Relaxed);
        self.user_time_ns.store(0, Ordering::Relaxed);
        self.sys_time_ns.store(0, Ordering::Relaxed);
        self.max_rss_kib.store(0, Ordering::Relaxed);
        for metric in &self.metrics {
            metric.clear();
        }
        self.pid.store(pid, Ordering::Release);
    }

    /// Iterate over recorded metrics as (slot index, description, value, kind)
    pub fn recorded_metrics(&self) -> impl Iterator<Item = (usize, u32, f64, MeanKind)> + '_ {
        self.metrics
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.get().map(|(desc, value, kind)| (idx, desc, value, kind)))
    }
}

/// Data covered by an instance checksum
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ChecksumData {
    /// Final bogo-op counter
    pub counter: u64,

    /// Final workload self-assessment
    pub run_ok: bool,
}
//
impl ChecksumData {
    /// Hash the canonical byte representation (counter, run_ok, zero padding)
    pub fn hash(&self) -> u32 {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&self.counter.to_le_bytes());
        bytes[8] = self.run_ok as u8;
        jenkins_one_at_a_time(&bytes)
    }
}

/// Integrity cross-check of an instance's final state
#[derive(Default)]
#[repr(C)]
pub struct ChecksumSlot {
    counter: AtomicU64,
    run_ok: AtomicBool,
    hash: AtomicU32,
}
//
impl ChecksumSlot {
    /// Store final data along with its hash
    pub(crate) fn seal(&self, data: ChecksumData) {
        self.counter.store(data.counter, Ordering::Relaxed);
        self.run_ok.store(data.run_ok, Ordering::Relaxed);
        self.hash.store(data.hash(), Ordering::Release);
    }

    /// Forget any previously sealed data
    pub(crate) fn clear(&self) {
        self.hash.store(0, Ordering::Relaxed);
        self.counter.store(0, Ordering::Relaxed);
        self.run_ok.store(false, Ordering::Relaxed);
    }

    /// Data that was sealed
    pub fn data(&self) -> ChecksumData {
        ChecksumData {
            counter: self.counter.load(Ordering::Relaxed),
            run_ok: self.run_ok.load(Ordering::Relaxed),
        }
    }

    /// Hash that was stored when sealing
    pub fn stored_hash(&self) -> u32 {
        self.hash.load(Ordering::Acquire)
    }

    /// Overwrite the stored counter without updating the hash
    #[cfg(test)]
    pub(crate) fn corrupt_counter(&self, counter: u64) {
        self.counter.store(counter, Ordering::Relaxed);
    }
}

/// Bob Jenkins' one-at-a-time hash
fn jenkins_one_at_a_time(bytes: &[u8]) -> u32 {
    let mut hash = 0u32;
    for &byte in bytes {
        hash = hash.wrapping_add(u32::from(byte));
        hash = hash.wrapping_add(hash << 10);
        hash ^= hash >> 6;
    }
    hash = hash.wrapping_add(hash << 3);
    hash ^= hash >> 11;
    hash.wrapping_add(hash << 15)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn sealed_checksum_verifies(counter: u64, run_ok: bool) {
            let slot = ChecksumSlot::default();
            let data = ChecksumData { counter, run_ok };
            slot.seal(data);
            prop_assert_eq!(slot.data(), data);
            prop_assert_eq!(slot.data().hash(), slot.stored_hash());
        }

        #[test]
        fn metric_slot(description: u32, value: f64, kind: MeanKind) {
            let slot = MetricSlot::default();
            prop_assert_eq!(slot.get(), None);
            slot.set(description, value, kind);
            let (d, v, k) = slot.get().unwrap();
            prop_assert_eq!(d, description);
            prop_assert_eq!(v.to_bits(), value.to_bits());
            prop_assert_eq!(k, kind);
        }
    }

    #[test]
    fn known_hash() {
        // Reference values of the one-at-a-time hash
        assert_eq!(jenkins_one_at_a_time(b"a"), 0xca2e9442);
        assert_eq!(
            jenkins_one_at_a_time(b"The quick brown fox jumps over the lazy dog"),
            0x519e91f5
        );
    }

    #[test]
    fn corruption_is_detected() {
        let slot = ChecksumSlot::default();
        slot.seal(ChecksumData {
            counter: 100,
            run_ok: true,
        });
        slot.corrupt_counter(99);
        assert_ne!(slot.data().hash(), slot.stored_hash());
    }

    #[test]
    fn reset_stats() {
        let stats = InstanceStats::default();
        stats.counter.store(42, Ordering::Relaxed);
        stats.metrics[3].set(8, 1.5, MeanKind::Total);
        stats.reset(1234);
        assert_eq!(stats.pid.load(Ordering::Relaxed), 1234);
        assert_eq!(stats.counter.load(Ordering::Relaxed), 0);
        assert_eq!(stats.recorded_metrics().count(), 0);
    }
}
