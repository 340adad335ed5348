//! Exit code taxonomy shared by stressor instances and the coordinator
//!
//! A forked instance reports how its workload went through two channels only:
//! its statistics slot in shared memory, and the POSIX exit code it leaves
//! with. The latter is drawn from the closed set below, and the reaper's
//! classification logic depends on these exact numbers.

use std::fmt;

/// Exit code of a stressor instance
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum ExitCode {
    /// The workload ran to completion
    Success,

    /// Generic failure (also used when the workload panics)
    Failure,

    /// Some stressors did not succeed (only used as a whole-process status)
    NotSuccess,

    /// The workload could not obtain a resource it needs
    NoResource,

    /// The workload is not implemented on this platform
    NotImplemented,

    /// The workload caught a fatal signal and reported it
    Signaled,

    /// Library code called `exit()` underneath the stressor
    BySysExit,

    /// The workload ran, but its metrics should not be trusted
    MetricsUntrustworthy,
}
//
impl ExitCode {
    /// Raw POSIX exit code
    pub const fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Failure => 1,
            Self::NotSuccess => 2,
            Self::NoResource => 3,
            Self::NotImplemented => 4,
            Self::Signaled => 5,
            Self::BySysExit => 6,
            Self::MetricsUntrustworthy => 7,
        }
    }

    /// Decode a raw POSIX exit code, if it belongs to the taxonomy
    pub const fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => Self::Success,
            1 => Self::Failure,
            2 => Self::NotSuccess,
            3 => Self::NoResource,
            4 => Self::NotImplemented,
            5 => Self::Signaled,
            6 => Self::BySysExit,
            7 => Self::MetricsUntrustworthy,
            _ => return None,
        })
    }
}
//
impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let description = match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::NotSuccess => "not all stressors succeeded",
            Self::NoResource => "no resource",
            Self::NotImplemented => "not implemented",
            Self::Signaled => "caught a fatal signal",
            Self::BySysExit => "unexpected exit() call",
            Self::MetricsUntrustworthy => "untrustworthy metrics",
        };
        write!(f, "{description} ({})", self.code())
    }
}

/// What an instance's termination means for the run summary
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Verdict {
    /// The instance did its job
    Passed,

    /// The instance could not run here, which is not a bug
    Skipped,

    /// The instance failed
    Failed,

    /// The instance ran but its numbers cannot be trusted
    BadMetrics,
}
//
impl Verdict {
    /// Verdict associated with a normal exit with a given code
    pub fn from_exit(code: i32) -> Self {
        match ExitCode::from_code(code) {
            Some(ExitCode::Success) => Self::Passed,
            Some(ExitCode::NoResource | ExitCode::NotImplemented) => Self::Skipped,
            Some(ExitCode::MetricsUntrustworthy) => Self::BadMetrics,
            Some(
                ExitCode::Failure
                | ExitCode::NotSuccess
                | ExitCode::Signaled
                | ExitCode::BySysExit,
            )
            | None => Self::Failed,
        }
    }

    /// Truth that this verdict makes the overall run unsuccessful
    pub fn spoils_run(self) -> bool {
        matches!(self, Self::Failed | Self::BadMetrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn code_is_bijective(exit: ExitCode) {
            prop_assert_eq!(ExitCode::from_code(exit.code()), Some(exit));
        }

        #[test]
        fn unknown_codes_fail(code in 8..256i32) {
            prop_assert_eq!(ExitCode::from_code(code), None);
            prop_assert_eq!(Verdict::from_exit(code), Verdict::Failed);
        }
    }

    #[test]
    fn verdicts() {
        assert_eq!(Verdict::from_exit(0), Verdict::Passed);
        assert_eq!(Verdict::from_exit(3), Verdict::Skipped);
        assert_eq!(Verdict::from_exit(4), Verdict::Skipped);
        assert_eq!(Verdict::from_exit(7), Verdict::BadMetrics);
        assert_eq!(Verdict::from_exit(1), Verdict::Failed);
        assert_eq!(Verdict::from_exit(5), Verdict::Failed);
        assert_eq!(Verdict::from_exit(6), Verdict::Failed);
        assert!(!Verdict::Skipped.spoils_run());
        assert!(Verdict::BadMetrics.spoils_run());
    }
}
