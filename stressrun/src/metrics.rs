//! Integrity checks and per-stressor summaries
//!
//! Once every instance of a run has been reaped, the coordinator checks
//! that what completed instances left in shared memory is self-consistent,
//! then folds per-instance numbers into one summary per stressor.

use crate::{
    exit::Verdict,
    reaper::InstanceOutcome,
    shared::{HeapStr, MeanKind, SharedRegion, WarnOnce},
};
use serde::{Deserialize, Serialize};
use std::{sync::atomic::Ordering, time::Duration};

/// Final numbers of one instance
#[derive(Clone, Debug, PartialEq)]
pub struct InstanceRecord {
    /// Stressor name
    pub stressor: &'static str,

    /// Index of the instance within its run
    pub instance: u32,

    /// Process ID
    pub pid: i32,

    /// Outcome
    pub verdict: Verdict,

    /// Whether the instance stored its final numbers
    pub completed: bool,

    /// Whether those numbers passed the integrity check
    pub integrity_ok: bool,

    /// Bogo-ops
    pub bogo_ops: u64,

    /// Workload self-assessment
    pub run_ok: bool,

    /// Start of the timed window, in ns since the UNIX epoch (0 if it never
    /// started)
    pub start_time_ns: u64,

    /// Length of the timed window
    pub duration: Duration,

    /// User CPU time
    pub user_time: Duration,

    /// System CPU time
    pub sys_time: Duration,

    /// Maximum resident set size in KiB
    pub max_rss_kib: u64,
}

/// Aggregated named metric
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct MetricSummary {
    /// Metric description
    pub description: String,

    /// How the values were combined
    pub kind: MeanKind,

    /// Combined value, if any instance provided a usable one
    pub value: Option<f64>,
}

/// Summary of one stressor's instances within a run
#[derive(Clone, Debug, PartialEq)]
pub struct StressorSummary {
    /// Stressor name
    pub stressor: &'static str,

    /// Index of the run group (0 except in permute mode)
    pub group: usize,

    /// Number of instances that were launched
    pub instances: u32,

    /// Instances that passed
    pub passed: u32,

    /// Instances that failed
    pub failed: u32,

    /// Instances that were skipped
    pub skipped: u32,

    /// Instances whose metrics are untrustworthy
    pub bad_metrics: u32,

    /// Instances whose shared-memory numbers are inconsistent
    pub integrity_failures: u32,

    /// Total bogo-ops
    pub bogo_ops: u64,

    /// Mean timed window length of the instances that started
    pub real_time: Duration,

    /// Total user CPU time
    pub user_time: Duration,

    /// Total system CPU time
    pub sys_time: Duration,

    /// Bogo-ops per second of real time
    pub ops_per_sec_real: f64,

    /// Bogo-ops per second of CPU time
    pub ops_per_sec_cpu: f64,

    /// Largest resident set size in KiB
    pub max_rss_kib: u64,

    /// Named metrics
    pub metrics: Vec<MetricSummary>,
}
//
impl StressorSummary {
    /// Truth that this summary makes the overall run unsuccessful
    pub fn spoils_run(&self) -> bool {
        self.failed > 0 || self.bad_metrics > 0 || self.integrity_failures > 0
    }
}

/// Read back and check the final numbers of an instance
pub fn collect(region: &SharedRegion, outcome: &InstanceOutcome) -> InstanceRecord {
    let entry = &outcome.instance;
    let stats = region.stats(entry.slot);
    let completed = stats.completed.load(Ordering::Acquire);
    let bogo_ops = stats.counter.load(Ordering::Relaxed);
    let run_ok = stats.run_ok.load(Ordering::Relaxed);
    let integrity_ok = !completed || {
        let checksum = region.checksum(entry.slot);
        let data = checksum.data();
        let ok = data.hash() == checksum.stored_hash()
            && data.counter == bogo_ops
            && data.run_ok == run_ok;
        if !ok {
            log::error!(
                "{} instance {} (pid {}): shared memory integrity check failed \
                 (counter {bogo_ops} vs {}, run_ok {run_ok} vs {}, hash {:#010x} vs {:#010x})",
                entry.name,
                entry.instance,
                entry.pid,
                data.counter,
                data.run_ok,
                data.hash(),
                checksum.stored_hash()
            );
        }
        ok
    };
    InstanceRecord {
        stressor: entry.name,
        instance: entry.instance,
        pid: entry.pid.as_raw(),
        verdict: outcome.verdict,
        completed,
        integrity_ok,
        bogo_ops,
        run_ok,
        start_time_ns: stats.start_time_ns.load(Ordering::Relaxed),
        duration: Duration::from_nanos(stats.duration_ns.load(Ordering::Relaxed)),
        user_time: Duration::from_nanos(stats.user_time_ns.load(Ordering::Relaxed)),
        sys_time: Duration::from_nanos(stats.sys_time_ns.load(Ordering::Relaxed)),
        max_rss_kib: stats.max_rss_kib.load(Ordering::Relaxed),
    }
}

/// Summarize the instances of one stressor
///
/// `outcomes` must only contain instances of that stressor, `elapsed` is the
/// wall-clock time taken by the whole run.
///
pub fn summarize(
    region: &SharedRegion,
    stressor: &'static str,
    group: usize,
    outcomes: &[InstanceOutcome],
    elapsed: Duration,
) -> (StressorSummary, Vec<InstanceRecord>) {
    let records = outcomes
        .iter()
        .map(|outcome| collect(region, outcome))
        .collect::<Vec<_>>();
    let mut summary = StressorSummary {
        stressor,
        group,
        instances: records.len() as u32,
        passed: 0,
        failed: 0,
        skipped: 0,
        bad_metrics: 0,
        integrity_failures: 0,
        bogo_ops: 0,
        real_time: Duration::ZERO,
        user_time: Duration::ZERO,
        sys_time: Duration::ZERO,
        ops_per_sec_real: 0.0,
        ops_per_sec_cpu: 0.0,
        max_rss_kib: 0,
        metrics: Vec::new(),
    };

    let mut timed = 0u32;
    let mut total_time = Duration::ZERO;
    for record in &records {
        match record.verdict {
            Verdict::Passed => summary.passed += 1,
            Verdict::Failed => summary.failed += 1,
            Verdict::Skipped => summary.skipped += 1,
            Verdict::BadMetrics => summary.bad_metrics += 1,
        }
        if !record.integrity_ok {
            summary.integrity_failures += 1;
        }
        summary.bogo_ops += record.bogo_ops;
        summary.user_time += record.user_time;
        summary.sys_time += record.sys_time;
        summary.max_rss_kib = summary.max_rss_kib.max(record.max_rss_kib);
        if record.duration > Duration::ZERO {
            timed += 1;
            total_time += record.duration;
        }
    }
    if timed > 0 {
        summary.real_time = total_time / timed;
    }
    summary.ops_per_sec_real = rate(summary.bogo_ops, summary.real_time);
    summary.ops_per_sec_cpu = rate(summary.bogo_ops, summary.user_time + summary.sys_time);
    summary.metrics = named_metrics(region, outcomes);

    if summary.bogo_ops == 0 && !records.is_empty() && elapsed > ZERO_OPS_THRESHOLD {
        if region.warn_once(WarnOnce::ZERO_BOGO_OPS) {
            log::warn!(
                "{stressor}: no bogo-ops were counted in {elapsed:?}, its metrics may be meaningless"
            );
        } else {
            log::debug!("{stressor}: no bogo-ops were counted in {elapsed:?}");
        }
    }
    (summary, records)
}

/// Combine the named metrics of several instances
fn named_metrics(region: &SharedRegion, outcomes: &[InstanceOutcome]) -> Vec<MetricSummary> {
    // Slot index -> (description offset, kind, values)
    let mut slots: Vec<Option<(u32, MeanKind, Vec<f64>)>> = Vec::new();
    for outcome in outcomes {
        let stats = region.stats(outcome.instance.slot);
        if !stats.completed.load(Ordering::Acquire) {
            continue;
        }
        for (index, description, value, kind) in stats.recorded_metrics() {
            if slots.len() <= index {
                slots.resize(index + 1, None);
            }
            slots[index]
                .get_or_insert_with(|| (description, kind, Vec::new()))
                .2
                .push(value);
        }
    }
    let heap = region.heap();
    slots
        .into_iter()
        .flatten()
        .map(|(description, kind, values)| MetricSummary {
            description: heap
                .get(HeapStr::from_offset(description))
                .unwrap_or("<unknown metric>")
                .to_owned(),
            kind,
            value: combine(kind, &values),
        })
        .collect()
}

/// Combine values according to a mean kind
pub fn combine(kind: MeanKind, values: &[f64]) -> Option<f64> {
    let values = values.iter().copied();
    match kind {
        MeanKind::Total => Some(values.sum()),
        MeanKind::Maximum => values.reduce(f64::max),
        MeanKind::GeometricMean => geometric_mean(values),
        MeanKind::HarmonicMean => harmonic_mean(values),
    }
}

/// Geometric mean of the positive finite values
///
/// The running product is kept as a mantissa and a separate binary exponent,
/// so multiplying many large or small values neither overflows nor underflows.
///
pub fn geometric_mean(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let mut mantissa = 1.0f64;
    let mut exponent = 0i64;
    let mut count = 0u32;
    for value in values {
        if !(value > 0.0 && value.is_finite()) {
            continue;
        }
        let (m, e) = frexp(value);
        let (m, e2) = frexp(mantissa * m);
        mantissa = m;
        exponent += i64::from(e) + i64::from(e2);
        count += 1;
    }
    (count > 0).then(|| {
        let n = f64::from(count);
        mantissa.powf(1.0 / n) * (exponent as f64 / n).exp2()
    })
}

/// Harmonic mean of the positive finite values
pub fn harmonic_mean(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let (count, inverse_sum) = values
        .into_iter()
        .filter(|&v| v > 0.0 && v.is_finite())
        .fold((0u32, 0.0f64), |(n, sum), v| (n + 1, sum + 1.0 / v));
    (count > 0 && inverse_sum > 0.0).then(|| f64::from(count) / inverse_sum)
}

/// Split a positive finite number into a mantissa in [0.5, 1) and a power
/// of two
fn frexp(x: f64) -> (f64, i32) {
    const EXPONENT_MASK: u64 = 0x7ff << 52;
    if x == 0.0 || !x.is_finite() {
        return (x, 0);
    }
    let bits = x.to_bits();
    let biased = ((bits & EXPONENT_MASK) >> 52) as i32;
    if biased == 0 {
        // Subnormal, scale into the normal range first
        let (m, e) = frexp(x * 2f64.powi(64));
        return (m, e - 64);
    }
    let mantissa = f64::from_bits((bits & !EXPONENT_MASK) | (1022 << 52));
    (mantissa, biased - 1022)
}

/// Rate of bogo-ops per second
fn rate(ops: u64, time: Duration) -> f64 {
    let secs = time.as_secs_f64();
    if secs > 0.0 {
        ops as f64 / secs
    } else {
        0.0
    }
}

/// Run time after which zero bogo-ops is suspicious
const ZERO_OPS_THRESHOLD: Duration = Duration::from_secs(30);
