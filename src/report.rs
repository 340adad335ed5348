//! Human-readable output

use stressrun::{metrics::StressorSummary, ExitCode, Registry, RunReport};

/// Print the stressor table
pub fn list(registry: &Registry) {
    let width = registry
        .iter()
        .map(|stressor| stressor.name().len())
        .max()
        .unwrap_or(0);
    for stressor in registry.iter() {
        let support = match stressor.supported() {
            Ok(()) => String::new(),
            Err(reason) => format!(" (unsupported: {reason})"),
        };
        println!(
            "{:width$}  {}{support}",
            stressor.name(),
            stressor.classes()
        );
        for option in stressor.options() {
            println!("{:width$}    --{:<16} {}", "", option.name, option.help);
        }
    }
}

/// Print per-stressor summaries and the final verdict
pub fn summaries(report: &RunReport) {
    if report.summaries.is_empty() {
        return;
    }
    println!(
        "{:<16} {:>5} {:>5} {:>5} {:>5} {:>12} {:>10} {:>14} {:>14}",
        "stressor",
        "inst",
        "pass",
        "fail",
        "skip",
        "bogo ops",
        "real (s)",
        "ops/s (real)",
        "ops/s (cpu)"
    );
    for summary in &report.summaries {
        print_summary(summary);
    }
    if report.interrupted {
        println!("Run was interrupted, some stressors did not run");
    }
    println!(
        "{} run: {} passed, {} failed, {} skipped, {} untrustworthy",
        if report.success { "Successful" } else { "Unsuccessful" },
        count(report, |s| s.passed),
        count(report, |s| s.failed),
        count(report, |s| s.skipped),
        count(report, |s| s.bad_metrics + s.integrity_failures)
    );
}

/// Print one summary line, followed by its named metrics
fn print_summary(summary: &StressorSummary) {
    println!(
        "{:<16} {:>5} {:>5} {:>5} {:>5} {:>12} {:>10.2} {:>14.2} {:>14.2}",
        summary.stressor,
        summary.instances,
        summary.passed,
        summary.failed,
        summary.skipped,
        summary.bogo_ops,
        summary.real_time.as_secs_f64(),
        summary.ops_per_sec_real,
        summary.ops_per_sec_cpu
    );
    for metric in &summary.metrics {
        match metric.value {
            Some(value) => println!("    {:<40} {value:>14.2}", metric.description),
            None => println!("    {:<40} {:>14}", metric.description, "n/a"),
        }
    }
}

/// Sum some count over every summary
fn count(report: &RunReport, field: impl Fn(&StressorSummary) -> u32) -> u32 {
    report.summaries.iter().map(field).sum()
}

/// How the process should exit after a run
pub fn exit_code(report: &RunReport) -> ExitCode {
    if report.success {
        ExitCode::Success
    } else if count(report, |s| s.failed) > 0 {
        ExitCode::NotSuccess
    } else {
        ExitCode::MetricsUntrustworthy
    }
}
