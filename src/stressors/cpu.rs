//! Number crunching

use std::{hint::black_box, time::Instant};
use stressrun::{Args, ExitCode, MeanKind, Stressor, StressorClass, StressorOption};

/// Mixes integer and floating-point arithmetic
pub struct Cpu;
//
impl Stressor for Cpu {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn classes(&self) -> StressorClass {
        StressorClass::CPU
    }

    fn options(&self) -> &'static [StressorOption] {
        &[StressorOption {
            name: "verify",
            help: "compare every result with a reference computation",
        }]
    }

    fn run(&self, args: &mut Args<'_>) -> ExitCode {
        let seed = u64::from(args.instance()) + 1;
        let reference = crunch(seed);
        if !args.sync_start() {
            return ExitCode::Success;
        }
        let start = Instant::now();
        while args.keep_running() {
            let result = crunch(black_box(seed));
            if args.verify() && result != reference {
                log::error!(
                    "{} instance {}: computed {result:#x}, expected {reference:#x}",
                    args.name(),
                    args.instance()
                );
                return ExitCode::Failure;
            }
            args.bogo_inc();
        }

        let elapsed = start.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            let rounds = (args.bogo_counter() * u64::from(CRUNCH_ROUNDS)) as f64 / elapsed;
            let description = "crunch rounds per second";
            if let Err(e) = args.metric(0, description, rounds, MeanKind::GeometricMean) {
                log::warn!("{} instance {}: {e}", args.name(), args.instance());
            }
        }
        ExitCode::Success
    }
}

/// One bogo-op worth of computation
fn crunch(seed: u64) -> u64 {
    let mut state = seed;
    let mut acc = 0.0f64;
    for _ in 0..CRUNCH_ROUNDS {
        state = state
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        acc += ((state >> 11) as f64).sqrt();
    }
    state ^ acc.to_bits()
}

/// Loop iterations per bogo-op
const CRUNCH_ROUNDS: u32 = 4096;

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn crunch_is_deterministic(seed: u64) {
            prop_assert_eq!(crunch(seed), crunch(black_box(seed)));
        }
    }

    #[test]
    fn seeds_matter() {
        assert_ne!(crunch(1), crunch(2));
    }
}
