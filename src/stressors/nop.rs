//! Stressor that only counts, to measure coordination overhead

use stressrun::{Args, ExitCode, Stressor, StressorClass};

/// Does nothing, as fast as possible
pub struct Nop;
//
impl Stressor for Nop {
    fn name(&self) -> &'static str {
        "nop"
    }

    fn classes(&self) -> StressorClass {
        StressorClass::empty()
    }

    fn run(&self, args: &mut Args<'_>) -> ExitCode {
        while args.keep_running() {
            args.bogo_inc();
        }
        ExitCode::Success
    }
}
