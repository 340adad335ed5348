//! Tests of coordinated stressor runs

mod fixture;

use crate::fixture::{RunTest, COUNTER_METRIC, IDLE_TASK, SLOW_SETUP_STEP};
use more_asserts::{assert_ge, assert_gt, assert_le, assert_lt};
use nix::{
    sys::signal::{kill, Signal},
    unistd::getpid,
};
use pretty_assertions::assert_eq;
use std::time::{Duration, Instant};
use stressrun::{
    barrier::BarrierOutcome,
    signals::{FORCE_KILL_THRESHOLD, REMINDER_INTERVAL},
    MeanKind, RunMode, Verdict,
};

#[test]
fn quota_is_split_between_instances() {
    let report = RunTest::new(RunMode::Sequential)
        .stressor("counter", 4, 100)
        .run();
    assert!(report.success);
    assert!(!report.interrupted);
    assert_eq!(report.counts.started, 4);
    assert_eq!(report.counts.failed, 0);

    let mut ops = report
        .instances
        .iter()
        .map(|record| (record.instance, record.bogo_ops))
        .collect::<Vec<_>>();
    ops.sort_unstable();
    assert_eq!(ops, [(0, 25), (1, 25), (2, 25), (3, 25)]);
    assert!(report.instances.iter().all(|r| r.verdict == Verdict::Passed));
    assert!(report.instances.iter().all(|r| r.completed && r.run_ok));

    let [summary] = &report.summaries[..] else {
        panic!("expected one summary, got {:?}", report.summaries)
    };
    assert_eq!(summary.stressor, "counter");
    assert_eq!(summary.instances, 4);
    assert_eq!(summary.passed, 4);
    assert_eq!(summary.bogo_ops, 100);
    let [metric] = &summary.metrics[..] else {
        panic!("expected one metric, got {:?}", summary.metrics)
    };
    assert_eq!(metric.description, COUNTER_METRIC);
    assert_eq!(metric.kind, MeanKind::Total);
    assert_eq!(metric.value, Some(100.0));
}

#[test]
fn crash_aborts_siblings() {
    let start = Instant::now();
    let report = RunTest::new(RunMode::Parallel)
        .configure(|config| {
            config.abort_on_failure = true;
            config.timeout = Some(Duration::from_secs(30));
        })
        .stressor("crasher", 1, 0)
        .stressor("sleeper", 3, 0)
        .run();
    assert_lt!(start.elapsed(), Duration::from_secs(15));
    assert!(!report.success);
    assert_eq!(report.counts.started, 4);
    assert_eq!(report.counts.failed, 1);
    assert_ge!(report.counts.alarmed, 3);

    let crasher = &report.summaries[0];
    assert_eq!(crasher.stressor, "crasher");
    assert_eq!(crasher.failed, 1);
    assert!(crasher.spoils_run());
    let sleeper = &report.summaries[1];
    assert_eq!(sleeper.stressor, "sleeper");
    assert_eq!(sleeper.passed, 3);
    assert!(!sleeper.spoils_run());

    let crashed = report
        .instances
        .iter()
        .find(|r| r.stressor == "crasher")
        .expect("crasher was reaped");
    assert_eq!(crashed.verdict, Verdict::Failed);
    assert!(!crashed.completed);
}

#[test]
fn permutations_run_in_order() {
    let report = RunTest::new(RunMode::Permute)
        .stressor("counter-a", 1, 10)
        .stressor("counter-b", 1, 10)
        .stressor("counter-c", 1, 10)
        .run();
    assert!(report.success);
    assert_eq!(
        report
            .groups
            .iter()
            .map(|group| group.members.clone())
            .collect::<Vec<_>>(),
        [
            vec![0],
            vec![1],
            vec![0, 1],
            vec![2],
            vec![0, 2],
            vec![1, 2],
            vec![0, 1, 2]
        ]
    );
    for pair in report.groups.windows(2) {
        assert_le!(pair[0].finished, pair[1].started);
    }

    // Each stressor runs in 4 of the 7 subsets
    assert_eq!(report.summaries.len(), 12);
    assert_eq!(report.counts.started, 12);
    for name in ["counter-a", "counter-b", "counter-c"] {
        let runs = report
            .summaries
            .iter()
            .filter(|s| s.stressor == name)
            .collect::<Vec<_>>();
        assert_eq!(runs.len(), 4);
        assert!(runs.iter().all(|s| s.bogo_ops == 10 && s.passed == 1));
    }
}

#[test]
fn stop_before_barrier_release() {
    let start = Instant::now();
    let report = RunTest::new(RunMode::Parallel)
        .configure(|config| config.timeout = Some(Duration::from_secs(1)))
        .stressor("straggler", 4, 0)
        .run();
    assert_lt!(start.elapsed(), Duration::from_secs(15));
    assert_eq!(report.groups[0].barrier, BarrierOutcome::Cancelled);
    assert_eq!(report.counts.started, 4);
    assert_eq!(report.counts.reaped, 4);
    assert!(report.success);
    for record in &report.instances {
        assert_eq!(record.verdict, Verdict::Passed);
        assert_eq!(record.bogo_ops, 0);
        assert_eq!(record.start_time_ns, 0);
    }
}

#[test]
fn barrier_timeout_releases_ready_instances() {
    let report = RunTest::new(RunMode::Parallel)
        .configure(|config| {
            config.timeout = Some(Duration::from_secs(2));
            config.barrier_timeout = Duration::from_millis(300);
        })
        .stressor("straggler", 4, 0)
        .run();
    assert_eq!(
        report.groups[0].barrier,
        BarrierOutcome::TimedOut { stragglers: 2 }
    );
    assert!(report.success);
    for record in &report.instances {
        if record.instance < 2 {
            assert_gt!(record.bogo_ops, 0);
        } else {
            assert_eq!(record.bogo_ops, 0);
        }
    }
}

#[test]
fn instances_start_together() {
    let report = RunTest::new(RunMode::Parallel)
        .configure(|config| config.timeout = Some(Duration::from_secs(1)))
        .stressor("slow-setup", 4, 0)
        .run();
    assert!(report.success);
    assert_eq!(report.groups[0].barrier, BarrierOutcome::Released);

    let starts = report
        .instances
        .iter()
        .map(|r| r.start_time_ns)
        .collect::<Vec<_>>();
    assert!(starts.iter().all(|&start| start > 0));
    let earliest = starts.iter().min().copied().unwrap_or(0);
    let latest = starts.iter().max().copied().unwrap_or(0);
    let spread = Duration::from_nanos(latest - earliest);
    assert_lt!(spread, SLOW_SETUP_STEP);
}

#[test]
fn deadline_ends_unbounded_runs() {
    let start = Instant::now();
    let report = RunTest::new(RunMode::Parallel)
        .configure(|config| config.timeout = Some(Duration::from_secs(1)))
        .stressor("counter", 2, 0)
        .run();
    let elapsed = start.elapsed();
    assert_ge!(elapsed, Duration::from_secs(1));
    assert_lt!(elapsed, Duration::from_secs(15));
    assert!(report.success);
    for record in &report.instances {
        assert_eq!(record.verdict, Verdict::Passed);
        assert_gt!(record.bogo_ops, 0);
        assert_gt!(record.duration, Duration::ZERO);
    }
    let summary = &report.summaries[0];
    assert_gt!(summary.ops_per_sec_real, 0.0);
}

#[test]
fn deadline_kills_stubborn_instances() {
    let start = Instant::now();
    let report = RunTest::new(RunMode::Parallel)
        .configure(|config| config.timeout = Some(Duration::from_secs(1)))
        .stressor("stubborn", 2, 0)
        .run();
    let elapsed = start.elapsed();
    let escalation = REMINDER_INTERVAL * (FORCE_KILL_THRESHOLD + 1);
    assert_ge!(elapsed, escalation);
    assert_lt!(elapsed, Duration::from_secs(1) + escalation + Duration::from_secs(5));
    assert_eq!(report.counts.alarmed, 2);
    assert!(report.success);
    for record in &report.instances {
        assert_eq!(record.verdict, Verdict::Passed);
        assert!(!record.completed);
    }
}

#[test]
fn exit_codes_become_verdicts() {
    let report = RunTest::new(RunMode::Sequential)
        .stressor("no-resource", 1, 0)
        .stressor("bad-metrics", 1, 0)
        .stressor("exiter", 1, 0)
        .stressor("panicker", 1, 0)
        .stressor("signaled", 1, 0)
        .run();
    assert!(!report.success);
    assert_eq!(report.summaries.len(), 5);
    assert_eq!(report.summaries[0].skipped, 1);
    assert!(!report.summaries[0].spoils_run());
    assert_eq!(report.summaries[1].bad_metrics, 1);
    assert!(report.summaries[1].spoils_run());
    assert_eq!(report.summaries[2].failed, 1);
    assert_eq!(report.summaries[3].failed, 1);
    assert_eq!(report.summaries[4].failed, 1);
    assert_eq!(report.counts.failed, 3);
}

#[test]
fn signaled_exit_aborts_siblings() {
    let start = Instant::now();
    let report = RunTest::new(RunMode::Parallel)
        .configure(|config| {
            config.abort_on_failure = true;
            config.timeout = Some(Duration::from_secs(30));
        })
        .stressor("signaled", 1, 0)
        .stressor("sleeper", 2, 0)
        .run();
    assert_lt!(start.elapsed(), Duration::from_secs(15));
    assert!(!report.success);
    assert_eq!(report.counts.failed, 1);
    assert_eq!(report.summaries[0].failed, 1);
    assert_eq!(report.summaries[1].passed, 2);
}

#[test]
fn scheduling_policies_and_background_tasks() {
    let report = RunTest::new(RunMode::Parallel)
        .configure(|config| {
            config.timeout = Some(Duration::from_secs(1));
            config.aggressive = true;
            config.pin_cpus = true;
            config.nice = Some(5);
        })
        .background(IDLE_TASK)
        .stressor("counter", 4, 0)
        .run();
    assert!(report.success);
    assert!(!report.interrupted);
    assert_eq!(report.counts.started, 4);
    assert_eq!(report.counts.failed, 0);
    for record in &report.instances {
        assert_eq!(record.verdict, Verdict::Passed);
        assert!(record.completed);
        assert_gt!(record.bogo_ops, 0);
    }
}

#[test]
fn excluded_and_unsupported_are_not_run() {
    let report = RunTest::new(RunMode::Sequential)
        .configure(|config| config.exclude = vec!["counter-a".into()])
        .stressor("counter-a", 2, 10)
        .stressor("unsupported", 2, 10)
        .stressor("counter", 2, 10)
        .run();
    assert!(report.success);
    assert_eq!(report.groups.len(), 1);
    assert_eq!(report.counts.started, 2);
    assert!(report.instances.iter().all(|r| r.stressor == "counter"));
}

#[test]
fn interrupt_ends_invocation() {
    // Only interrupt once we own the coordinator lock
    let test = RunTest::new(RunMode::Sequential)
        .configure(|config| config.timeout = Some(Duration::from_secs(30)))
        .stressor("sleeper", 2, 0)
        .stressor("counter", 2, 0);
    let interrupter = std::thread::spawn(|| {
        std::thread::sleep(Duration::from_millis(500));
        kill(getpid(), Signal::SIGINT).expect("Failed to interrupt ourselves");
    });
    let report = test.run();
    interrupter.join().expect("Interrupter thread panicked");
    assert!(report.interrupted);
    assert_eq!(report.groups.len(), 1);
    assert_eq!(report.counts.started, 2);
    assert!(report
        .instances
        .iter()
        .all(|r| r.stressor == "sleeper" && r.verdict == Verdict::Passed));
}
