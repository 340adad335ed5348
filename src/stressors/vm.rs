//! Memory stressor
//!
//! Each instance owns a buffer and keeps writing a new pattern into every
//! page of it. When memory is short, the buffer shrinks instead of failing.

use stressrun::{
    shared::{page_size, WarnOnce},
    Args, ExitCode, MeanKind, Stressor, StressorClass, StressorOption,
};

/// Dirties pages of a private buffer
pub struct Vm;
//
impl Stressor for Vm {
    fn name(&self) -> &'static str {
        "vm"
    }

    fn classes(&self) -> StressorClass {
        StressorClass::MEMORY | StressorClass::VM
    }

    fn options(&self) -> &'static [StressorOption] {
        &[StressorOption {
            name: "verify",
            help: "read back every page after writing it",
        }]
    }

    fn run(&self, args: &mut Args<'_>) -> ExitCode {
        let requested = (TOTAL_BYTES / args.instances().max(1) as usize).max(MIN_BYTES);
        let Some(mut buffer) = allocate(requested) else {
            log::info!(
                "{} instance {}: could not allocate even {MIN_BYTES} bytes, skipping",
                args.name(),
                args.instance()
            );
            return ExitCode::NoResource;
        };
        if buffer.len() < requested && args.region().warn_once(SHRUNK) {
            log::warn!(
                "{}: memory is short, buffers were shrunk to {} bytes",
                args.name(),
                buffer.len()
            );
        }
        let description = "buffer size per instance (MiB)";
        let mib = buffer.len() as f64 / (1024.0 * 1024.0);
        if let Err(e) = args.metric(0, description, mib, MeanKind::GeometricMean) {
            log::warn!("{} instance {}: {e}", args.name(), args.instance());
        }

        let page = page_size();
        let mut pattern = 0u8;
        while args.keep_running() {
            pattern = pattern.wrapping_add(1);
            for byte in buffer.iter_mut().step_by(page) {
                *byte = pattern;
            }
            if args.verify() {
                if let Some(offset) = buffer.iter().step_by(page).position(|&b| b != pattern) {
                    log::error!(
                        "{} instance {}: page {offset} reads back wrong data",
                        args.name(),
                        args.instance()
                    );
                    return ExitCode::Failure;
                }
            }
            args.bogo_inc();
        }
        ExitCode::Success
    }
}

/// Allocate a zeroed buffer of at most `size` bytes, halving on failure
fn allocate(mut size: usize) -> Option<Vec<u8>> {
    loop {
        let mut buffer = Vec::new();
        if buffer.try_reserve_exact(size).is_ok() {
            buffer.resize(size, 0);
            return Some(buffer);
        }
        size /= 2;
        if size < MIN_BYTES {
            return None;
        }
    }
}

/// Memory shared by all instances
const TOTAL_BYTES: usize = 256 * 1024 * 1024;

/// Smallest buffer worth stressing
const MIN_BYTES: usize = 4 * 1024 * 1024;

/// Warning about shrunk buffers
const SHRUNK: WarnOnce = WarnOnce::custom(0);
