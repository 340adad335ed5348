//! Fake stressors and coordinator test harness

use simplelog::{Config as LogConfig, LevelFilter, TestLogger};
use std::{
    sync::{Mutex, MutexGuard, Once},
    time::Duration,
};
use stressrun::{
    background::BackgroundTask, signals, Args, Config, Coordinator, ExitCode, MeanKind, Registry, RunList, RunMode,
    RunReport, RunRequest, Stressor, StressorClass,
};

/// Runs until its quota, its deadline or a stop request, counting one
/// bogo-op per iteration
pub struct Counter(pub &'static str);
//
impl Stressor for Counter {
    fn name(&self) -> &'static str {
        self.0
    }

    fn classes(&self) -> StressorClass {
        StressorClass::CPU
    }

    fn run(&self, args: &mut Args<'_>) -> ExitCode {
        while args.keep_running() {
            args.bogo_inc();
        }
        let ops = args.bogo_counter() as f64;
        match args.metric(0, COUNTER_METRIC, ops, MeanKind::Total) {
            Ok(()) => ExitCode::Success,
            Err(e) => {
                log::error!("{e}");
                ExitCode::Failure
            }
        }
    }
}

/// Metric recorded by `Counter`
pub const COUNTER_METRIC: &str = "bogo-ops counted";

/// Like `Counter`, but sleeps a bit between bogo-ops
pub struct Sleeper;
//
impl Stressor for Sleeper {
    fn name(&self) -> &'static str {
        "sleeper"
    }

    fn classes(&self) -> StressorClass {
        StressorClass::SCHEDULER
    }

    fn run(&self, args: &mut Args<'_>) -> ExitCode {
        while args.keep_running() {
            std::thread::sleep(Duration::from_millis(1));
            args.bogo_inc();
        }
        ExitCode::Success
    }
}

/// Crashes with SIGSEGV as soon as it starts
pub struct Crasher;
//
impl Stressor for Crasher {
    fn name(&self) -> &'static str {
        "crasher"
    }

    fn classes(&self) -> StressorClass {
        StressorClass::PATHOLOGICAL
    }

    fn run(&self, args: &mut Args<'_>) -> ExitCode {
        if !args.sync_start() {
            return ExitCode::Success;
        }
        // Give siblings some time to start working
        std::thread::sleep(Duration::from_millis(100));
        // SAFETY: Deliberately killing the current process
        unsafe { libc::raise(libc::SIGSEGV) };
        ExitCode::Failure
    }
}

/// Spends an instance-dependent time in setup before reaching the barrier
pub struct SlowSetup;
//
impl Stressor for SlowSetup {
    fn name(&self) -> &'static str {
        "slow-setup"
    }

    fn classes(&self) -> StressorClass {
        StressorClass::OS
    }

    fn run(&self, args: &mut Args<'_>) -> ExitCode {
        std::thread::sleep(SLOW_SETUP_STEP * args.instance());
        while args.keep_running() {
            args.bogo_inc();
        }
        ExitCode::Success
    }
}

/// Setup time step of `SlowSetup`
pub const SLOW_SETUP_STEP: Duration = Duration::from_millis(100);

/// The upper half of its instances never finish their setup
pub struct Straggler;
//
impl Stressor for Straggler {
    fn name(&self) -> &'static str {
        "straggler"
    }

    fn classes(&self) -> StressorClass {
        StressorClass::OS
    }

    fn run(&self, args: &mut Args<'_>) -> ExitCode {
        if args.instance() >= args.instances() / 2 {
            while signals::keep_running() {
                std::thread::sleep(Duration::from_millis(5));
            }
        }
        while args.keep_running() {
            args.bogo_inc();
        }
        ExitCode::Success
    }
}

/// Starts working, then ignores every stop request
pub struct Stubborn;
//
impl Stressor for Stubborn {
    fn name(&self) -> &'static str {
        "stubborn"
    }

    fn classes(&self) -> StressorClass {
        StressorClass::PATHOLOGICAL
    }

    fn run(&self, args: &mut Args<'_>) -> ExitCode {
        args.sync_start();
        loop {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

/// Reports a fixed exit code without doing anything
pub struct Fixed(pub &'static str, pub ExitCode);
//
impl Stressor for Fixed {
    fn name(&self) -> &'static str {
        self.0
    }

    fn classes(&self) -> StressorClass {
        StressorClass::empty()
    }

    fn run(&self, _args: &mut Args<'_>) -> ExitCode {
        self.1
    }
}

/// Calls `exit()` behind the coordinator's back
pub struct Exiter;
//
impl Stressor for Exiter {
    fn name(&self) -> &'static str {
        "exiter"
    }

    fn classes(&self) -> StressorClass {
        StressorClass::OS
    }

    fn run(&self, _args: &mut Args<'_>) -> ExitCode {
        std::process::exit(0)
    }
}

/// Panics
pub struct Panicker;
//
impl Stressor for Panicker {
    fn name(&self) -> &'static str {
        "panicker"
    }

    fn classes(&self) -> StressorClass {
        StressorClass::OS
    }

    fn run(&self, _args: &mut Args<'_>) -> ExitCode {
        panic!("this stressor always panics")
    }
}

/// Never supported
pub struct Unsupported;
//
impl Stressor for Unsupported {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    fn classes(&self) -> StressorClass {
        StressorClass::INTERRUPT
    }

    fn supported(&self) -> Result<(), String> {
        Err("needs hardware that does not exist".into())
    }

    fn run(&self, _args: &mut Args<'_>) -> ExitCode {
        ExitCode::Failure
    }
}

static COUNTER: Counter = Counter("counter");
static COUNTER_A: Counter = Counter("counter-a");
static COUNTER_B: Counter = Counter("counter-b");
static COUNTER_C: Counter = Counter("counter-c");
static NO_RESOURCE: Fixed = Fixed("no-resource", ExitCode::NoResource);
static BAD_METRICS: Fixed = Fixed("bad-metrics", ExitCode::MetricsUntrustworthy);
static SIGNALED: Fixed = Fixed("signaled", ExitCode::Signaled);

/// Every fake stressor
static STRESSORS: [&dyn Stressor; 15] = [
    &COUNTER,
    &COUNTER_A,
    &COUNTER_B,
    &COUNTER_C,
    &Sleeper,
    &Crasher,
    &SlowSetup,
    &Straggler,
    &NO_RESOURCE,
    &BAD_METRICS,
    &SIGNALED,
    &Stubborn,
    &Exiter,
    &Panicker,
    &Unsupported,
];

/// Registry of the fake stressors
pub fn registry() -> Registry {
    Registry::new(&STRESSORS).expect("Fake stressor names are unique")
}

/// Background task that idles until asked to stop
pub const IDLE_TASK: BackgroundTask = BackgroundTask {
    name: "idler",
    body: idle,
};

/// Body of `IDLE_TASK`
fn idle() -> ExitCode {
    while signals::keep_running() {
        std::thread::sleep(Duration::from_millis(5));
    }
    ExitCode::Success
}

/// Coordinator test
///
/// Coordinator tests manipulate process-wide signal and timer state, so they
/// must not run concurrently. The test holds a global lock for its lifetime.
///
pub struct RunTest {
    /// Coordinator configuration
    config: Config,

    /// Requested runs
    requests: Vec<RunRequest>,

    /// Background helpers
    background: Vec<BackgroundTask>,

    /// Serialization of coordinator tests
    _guard: MutexGuard<'static, ()>,
}
//
impl RunTest {
    /// Set up a test in some run mode
    pub fn new(mode: RunMode) -> Self {
        static LOGGER: Once = Once::new();
        LOGGER.call_once(|| {
            // Ignore failure, another test binary logger may already be set
            let _ = TestLogger::init(LevelFilter::Debug, LogConfig::default());
        });
        static GUARD: Mutex<()> = Mutex::new(());
        let guard = GUARD.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Self {
            config: Config {
                mode,
                timeout: Some(Duration::from_secs(60)),
                barrier_timeout: Duration::from_secs(60),
                ..Default::default()
            },
            requests: Vec::new(),
            background: Vec::new(),
            _guard: guard,
        }
    }

    /// Tune the configuration
    pub fn configure(mut self, f: impl FnOnce(&mut Config)) -> Self {
        f(&mut self.config);
        self
    }

    /// Request a stressor
    pub fn stressor(mut self, name: &str, instances: u32, ops: u64) -> Self {
        self.requests.push(RunRequest {
            stressor: name.to_owned(),
            instances,
            ops,
        });
        self
    }

    /// Run a helper in the background
    pub fn background(mut self, task: BackgroundTask) -> Self {
        self.background.push(task);
        self
    }

    /// Run the coordinator and check invariants that always hold
    pub fn run(self) -> RunReport {
        let mut runs = RunList::resolve(&registry(), &self.requests).expect("Known stressors");
        let mut coordinator = Coordinator::new(&self.config);
        for task in self.background {
            coordinator = coordinator.with_background(task);
        }
        let report = coordinator
            .run(&mut runs)
            .expect("Coordinator should not fail");

        // Accounting is conserved at quiescence
        let counts = report.counts;
        assert_eq!(counts.started, counts.reaped);
        assert_eq!(counts.started, counts.exited);
        assert_eq!(counts.running(), 0);
        assert_eq!(report.instances.len() as u64, counts.reaped);

        // Summaries agree with instance records
        assert_eq!(
            report.summaries.iter().map(|s| s.instances).sum::<u32>() as u64,
            counts.started
        );
        assert_eq!(
            report.summaries.iter().map(|s| s.bogo_ops).sum::<u64>(),
            report.instances.iter().map(|r| r.bogo_ops).sum::<u64>()
        );

        // Nothing was corrupted
        assert!(report.instances.iter().all(|r| r.integrity_ok));
        report
    }
}
