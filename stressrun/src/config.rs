//! Coordinator configuration

use crate::shared::DEFAULT_HEAP_SIZE;
use nix::sys::signal::Signal;
use std::time::Duration;

/// How selected stressors are grouped into runs
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum RunMode {
    /// One stressor at a time
    #[default]
    Sequential,

    /// Every stressor at once
    Parallel,

    /// Every non-empty subset of the stressors, one subset at a time
    Permute,
}
//
impl RunMode {
    /// Run timeout used when none was specified
    pub fn default_timeout(self) -> Duration {
        match self {
            Self::Sequential => DEFAULT_SEQUENTIAL_TIMEOUT,
            Self::Parallel | Self::Permute => DEFAULT_PARALLEL_TIMEOUT,
        }
    }
}

/// Coordinator settings, already validated by the caller
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    /// Run grouping
    pub mode: RunMode,

    /// Timeout of each run, defaults to a mode-specific value
    pub timeout: Option<Duration>,

    /// Stop every instance as soon as one of them fails
    pub abort_on_failure: bool,

    /// Ask stressors to verify their results
    pub verify: bool,

    /// Try to keep instances away from the OOM killer
    pub oom_avoid: bool,

    /// Keep moving instances across CPUs while they run
    pub aggressive: bool,

    /// Pin instance i to CPU i modulo the number of CPUs
    pub pin_cpus: bool,

    /// Nice level applied inside instances
    pub nice: Option<i32>,

    /// Drop every capability inside instances once they are set up
    pub drop_capabilities: bool,

    /// Signal used to ask instances to stop
    pub stop_signal: Signal,

    /// Size of the shared heap in bytes
    pub heap_size: usize,

    /// Maximal time to wait for instances at the start barrier
    pub barrier_timeout: Duration,

    /// Names of stressors that must not run
    pub exclude: Vec<String>,

    /// Maximal number of stressors in permute mode
    pub permute_cap: usize,
}
//
impl Config {
    /// Effective timeout of each run
    pub fn run_timeout(&self) -> Duration {
        self.timeout.unwrap_or_else(|| self.mode.default_timeout())
    }
}
//
impl Default for Config {
    fn default() -> Self {
        Self {
            mode: RunMode::default(),
            timeout: None,
            abort_on_failure: false,
            verify: false,
            oom_avoid: false,
            aggressive: false,
            pin_cpus: false,
            nice: None,
            drop_capabilities: true,
            stop_signal: Signal::SIGALRM,
            heap_size: DEFAULT_HEAP_SIZE,
            barrier_timeout: DEFAULT_BARRIER_TIMEOUT,
            exclude: Vec::new(),
            permute_cap: DEFAULT_PERMUTE_CAP,
        }
    }
}

/// Default run timeout in sequential mode
pub const DEFAULT_SEQUENTIAL_TIMEOUT: Duration = Duration::from_secs(60);

/// Default run timeout in parallel and permute modes
pub const DEFAULT_PARALLEL_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Default start barrier timeout
pub const DEFAULT_BARRIER_TIMEOUT: Duration = Duration::from_secs(2);

/// Default cap on the number of permuted stressors
pub const DEFAULT_PERMUTE_CAP: usize = 16;

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn run_timeout(mode: RunMode, secs: Option<u64>) {
            let config = Config {
                mode,
                timeout: secs.map(Duration::from_secs),
                ..Default::default()
            };
            match secs {
                Some(secs) => prop_assert_eq!(config.run_timeout(), Duration::from_secs(secs)),
                None => prop_assert_eq!(config.run_timeout(), mode.default_timeout()),
            }
        }
    }

    #[test]
    fn sequential_is_shorter() {
        assert!(RunMode::Sequential.default_timeout() < RunMode::Parallel.default_timeout());
        assert_eq!(
            RunMode::Permute.default_timeout(),
            RunMode::Parallel.default_timeout()
        );
    }
}
