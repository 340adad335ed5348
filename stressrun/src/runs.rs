//! Resolved list of stressor runs
//!
//! Runs are stored in a `Vec` whose order is the run order. They are
//! mutated only by the exclusion and support passes (and transiently by
//! permute mode) before any instance is forked.

use crate::{registry::Registry, stressor::Stressor};
use std::{
    fmt::{self, Debug, Formatter},
    num::NonZeroUsize,
};
use thiserror::Error;

/// Request for one stressor, as produced by the command line or a job file
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RunRequest {
    /// Stressor name
    pub stressor: String,

    /// Number of instances, 0 means one per CPU
    pub instances: u32,

    /// Total bogo-op budget of the instances, 0 means unbounded
    pub ops: u64,
}

/// Why a run will not be executed
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum IgnoreReason {
    /// The run is active
    #[default]
    None,

    /// The stressor cannot run on this host
    Unsupported,

    /// The user asked for this stressor not to run
    Excluded,

    /// Temporarily left out of the current permutation subset
    Permuted,
}

/// One selected stressor and its instances
#[derive(Clone, Copy)]
pub struct StressorRun {
    /// Stressor descriptor
    stressor: &'static dyn Stressor,

    /// Number of instances to fork
    instances: u32,

    /// Total bogo-op budget, 0 means unbounded
    bogo_max_ops: u64,

    /// Whether the run is active
    ignore: IgnoreReason,
}
//
impl StressorRun {
    /// Set up a run, 0 instances meaning one per CPU
    pub fn new(stressor: &'static dyn Stressor, instances: u32, bogo_max_ops: u64) -> Self {
        let instances = if instances == 0 {
            online_cpus().get() as u32
        } else {
            instances
        };
        Self {
            stressor,
            instances,
            bogo_max_ops,
            ignore: IgnoreReason::None,
        }
    }

    /// Stressor descriptor
    pub fn stressor(&self) -> &'static dyn Stressor {
        self.stressor
    }

    /// Stressor name
    pub fn name(&self) -> &'static str {
        self.stressor.name()
    }

    /// Number of instances to fork
    pub fn instances(&self) -> u32 {
        self.instances
    }

    /// Total bogo-op budget, 0 means unbounded
    pub fn bogo_max_ops(&self) -> u64 {
        self.bogo_max_ops
    }

    /// Why this run is ignored, if it is
    pub fn ignore_reason(&self) -> IgnoreReason {
        self.ignore
    }

    /// Truth that this run will be executed
    pub fn is_active(&self) -> bool {
        self.ignore == IgnoreReason::None
    }

    /// Bogo-op quota of one instance
    pub fn instance_quota(&self, instance: u32) -> u64 {
        instance_quota(self.bogo_max_ops, self.instances, instance)
    }
}
//
impl Debug for StressorRun {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("StressorRun")
            .field("stressor", &self.name())
            .field("instances", &self.instances)
            .field("bogo_max_ops", &self.bogo_max_ops)
            .field("ignore", &self.ignore)
            .finish()
    }
}

/// Split a bogo-op budget across instances
///
/// The first `total % instances` instances get one extra op, so the quotas
/// add up to `total`, and when `total` is nonzero no instance gets zero
/// (which would mean "unbounded").
///
pub fn instance_quota(total: u64, instances: u32, instance: u32) -> u64 {
    if total == 0 || instances == 0 {
        return 0;
    }
    let instances = u64::from(instances);
    let base = total / instances;
    let extra = u64::from(u64::from(instance) < total % instances);
    (base + extra).max(1)
}

/// Ordered list of runs
#[derive(Clone, Debug, Default)]
pub struct RunList(Vec<StressorRun>);
//
impl RunList {
    /// Build the list from requests, in request order
    pub fn resolve(registry: &Registry, requests: &[RunRequest]) -> Result<Self, ResolveError> {
        let mut runs = Vec::with_capacity(requests.len());
        for request in requests {
            let stressor = registry
                .get(&request.stressor)
                .ok_or_else(|| ResolveError::UnknownStressor(request.stressor.clone()))?;
            runs.push(StressorRun::new(stressor, request.instances, request.ops));
        }
        Ok(Self(runs))
    }

    /// Build the list by drawing `count` instances at random among the
    /// supported, non-excluded stressors of the registry
    pub fn random(
        registry: &Registry,
        count: u32,
        exclude: &[String],
        rng: &mut fastrand::Rng,
    ) -> Result<Self, ResolveError> {
        let candidates = registry
            .iter()
            .filter(|s| !exclude.iter().any(|name| name == s.name()))
            .filter(|s| s.supported().is_ok())
            .collect::<Vec<_>>();
        if candidates.is_empty() {
            return Err(ResolveError::NoCandidates);
        }
        let mut counts = vec![0u32; candidates.len()];
        for _ in 0..count {
            counts[rng.usize(..candidates.len())] += 1;
        }
        Ok(Self(
            candidates
                .into_iter()
                .zip(counts)
                .filter(|(_, count)| *count > 0)
                .map(|(stressor, count)| StressorRun::new(stressor, count, 0))
                .collect(),
        ))
    }

    /// Add a run at the end of the list
    pub fn push(&mut self, run: StressorRun) {
        self.0.push(run);
    }

    /// Access a run by index
    pub fn get(&self, index: usize) -> Option<&StressorRun> {
        self.0.get(index)
    }

    /// Enumerate runs in order
    pub fn iter(&self) -> impl Iterator<Item = &StressorRun> + '_ {
        self.0.iter()
    }

    /// Number of runs, including ignored ones
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Truth that the list is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Indices of the active runs
    pub fn active(&self) -> Vec<usize> {
        (0..self.0.len()).filter(|&i| self.0[i].is_active()).collect()
    }

    /// Mark runs of excluded stressors
    pub fn exclude(&mut self, names: &[String]) {
        for run in &mut self.0 {
            if run.is_active() && names.iter().any(|name| name == run.name()) {
                log::info!("Excluding stressor {}", run.name());
                run.ignore = IgnoreReason::Excluded;
            }
        }
    }

    /// Ask every active run's stressor whether it can run on this host
    pub fn check_support(&mut self) {
        for run in &mut self.0 {
            if !run.is_active() {
                continue;
            }
            if let Err(reason) = run.stressor.supported() {
                log::warn!("Skipping stressor {}: {reason}", run.name());
                run.ignore = IgnoreReason::Unsupported;
            }
        }
    }

    /// Temporarily ignore every active run that is not in `subset`
    ///
    /// Returns the previous state, to be given back to `restore()`.
    ///
    pub fn isolate(&mut self, subset: &[usize]) -> Vec<IgnoreReason> {
        let saved = self.0.iter().map(|run| run.ignore).collect();
        for (index, run) in self.0.iter_mut().enumerate() {
            if run.is_active() && !subset.contains(&index) {
                run.ignore = IgnoreReason::Permuted;
            }
        }
        saved
    }

    /// Undo `isolate()`
    pub fn restore(&mut self, saved: Vec<IgnoreReason>) {
        debug_assert_eq!(saved.len(), self.0.len());
        for (run, ignore) in self.0.iter_mut().zip(saved) {
            run.ignore = ignore;
        }
    }
}

/// Failure to resolve run requests
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ResolveError {
    /// No stressor has this name
    #[error("unknown stressor {0:?}")]
    UnknownStressor(String),

    /// Random selection has nothing to pick from
    #[error("no supported stressor to pick from")]
    NoCandidates,
}

/// Number of online CPUs
pub fn online_cpus() -> NonZeroUsize {
    std::thread::available_parallelism().unwrap_or_else(|e| {
        log::warn!("Failed to query the number of CPUs ({e}), assuming {FALLBACK_CPUS}");
        NonZeroUsize::new(FALLBACK_CPUS).expect("FALLBACK_CPUS is not zero")
    })
}

/// Number of CPUs assumed when it cannot be queried
const FALLBACK_CPUS: usize = 4;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        exit::ExitCode,
        stressor::{Args, StressorClass},
    };
    use assert_matches::assert_matches;
    use more_asserts::{assert_ge, assert_lt};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    struct Dummy(&'static str, bool);
    //
    impl Stressor for Dummy {
        fn name(&self) -> &'static str {
            self.0
        }

        fn classes(&self) -> StressorClass {
            StressorClass::CPU
        }

        fn supported(&self) -> Result<(), String> {
            if self.1 {
                Ok(())
            } else {
                Err("not on this host".into())
            }
        }

        fn run(&self, _args: &mut Args<'_>) -> ExitCode {
            ExitCode::Success
        }
    }

    static X: Dummy = Dummy("x", true);
    static Y: Dummy = Dummy("y", true);
    static Z: Dummy = Dummy("z", false);
    static TABLE: [&dyn Stressor; 3] = [&X, &Y, &Z];

    fn registry() -> Registry {
        Registry::new(&TABLE).unwrap()
    }

    fn request(name: &str, instances: u32, ops: u64) -> RunRequest {
        RunRequest {
            stressor: name.into(),
            instances,
            ops,
        }
    }

    proptest! {
        #[test]
        fn quota_distribution(total in 0u64..1_000_000, instances in 1u32..512) {
            let quotas = (0..instances)
                .map(|i| instance_quota(total, instances, i))
                .collect::<Vec<_>>();
            let sum = quotas.iter().sum::<u64>();
            if total == 0 {
                prop_assert_eq!(sum, 0);
            } else {
                assert_ge!(sum, total);
                assert_lt!(sum - total, u64::from(instances));
                prop_assert!(quotas.iter().all(|&q| q > 0));
                let ceil = (total + u64::from(instances) - 1) / u64::from(instances);
                prop_assert!(quotas.iter().all(|&q| q <= ceil));
            }
        }
    }

    #[test]
    fn hundred_ops_four_instances() {
        let quotas = (0..4).map(|i| instance_quota(100, 4, i)).collect::<Vec<_>>();
        assert_eq!(quotas, [25, 25, 25, 25]);
        let quotas = (0..4).map(|i| instance_quota(102, 4, i)).collect::<Vec<_>>();
        assert_eq!(quotas, [26, 26, 25, 25]);
    }

    #[test]
    fn resolve() {
        let runs = RunList::resolve(&registry(), &[request("y", 3, 10), request("x", 0, 0)])
            .unwrap();
        assert_eq!(runs.len(), 2);
        let first = runs.get(0).unwrap();
        assert_eq!((first.name(), first.instances(), first.bogo_max_ops()), ("y", 3, 10));
        assert_eq!(
            runs.get(1).unwrap().instances() as usize,
            online_cpus().get()
        );
        assert_matches!(
            RunList::resolve(&registry(), &[request("nope", 1, 0)]),
            Err(ResolveError::UnknownStressor(name)) if name == "nope"
        );
    }

    #[test]
    fn exclusion_and_support() {
        let mut runs = RunList::resolve(
            &registry(),
            &[request("x", 1, 0), request("y", 1, 0), request("z", 1, 0)],
        )
        .unwrap();
        runs.exclude(&["y".to_owned()]);
        runs.check_support();
        let reasons = runs.iter().map(|r| r.ignore_reason()).collect::<Vec<_>>();
        assert_eq!(
            reasons,
            [
                IgnoreReason::None,
                IgnoreReason::Excluded,
                IgnoreReason::Unsupported
            ]
        );
        assert_eq!(runs.active(), [0]);
    }

    #[test]
    fn isolate_and_restore() {
        let mut runs = RunList::resolve(
            &registry(),
            &[request("x", 1, 0), request("y", 1, 0), request("z", 1, 0)],
        )
        .unwrap();
        runs.check_support();
        let saved = runs.isolate(&[1]);
        assert_eq!(runs.active(), [1]);
        assert_eq!(runs.get(0).unwrap().ignore_reason(), IgnoreReason::Permuted);
        assert_eq!(runs.get(2).unwrap().ignore_reason(), IgnoreReason::Unsupported);
        runs.restore(saved);
        assert_eq!(runs.active(), [0, 1]);
    }

    #[test]
    fn random_selection() {
        let mut rng = fastrand::Rng::with_seed(42);
        let runs = RunList::random(&registry(), 50, &["x".to_owned()], &mut rng).unwrap();
        // Only y is both supported and not excluded
        assert_eq!(runs.len(), 1);
        let run = runs.get(0).unwrap();
        assert_eq!((run.name(), run.instances()), ("y", 50));

        let runs = RunList::random(&registry(), 200, &[], &mut rng).unwrap();
        assert_eq!(runs.iter().map(|r| r.instances()).sum::<u32>(), 200);
        assert!(runs.iter().all(|r| r.name() != "z"));

        assert_eq!(
            RunList::random(&registry(), 1, &["x".to_owned(), "y".to_owned()], &mut rng).err(),
            Some(ResolveError::NoCandidates)
        );
    }
}
