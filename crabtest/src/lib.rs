//! # crabtest
//!
//! A library for production testing of OrangeCrab r0.2 boards.
//!
//! This crate provides the core functionality for one board's bring-up run:
//!
//! - Driving the `ecpprog` JTAG programmer and `dfu-util`
//! - Discovering the board's USB-CDC serial interface
//! - Parsing the test firmware's line-oriented telemetry
//! - Scoring the analog calibration sweep, power rails and battery charger
//! - Rendering the pass/fail result record
//!
//! ## Example
//!
//! ```rust,no_run
//! use crabtest::orchestrator::{HarnessConfig, Orchestrator, SerialLink};
//! use crabtest::process::SystemRunner;
//! use crabtest::report;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = HarnessConfig::default();
//!     let orchestrator = Orchestrator::new(&config, SystemRunner, SerialLink);
//!
//!     let summary = orchestrator.run(&mut |stage| {
//!         println!("-> {stage}");
//!     });
//!
//!     println!("{}", report::banner(summary.outcome));
//!     std::process::exit(report::exit_code(summary.outcome));
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod calibration;
pub mod discovery;
pub mod error;
pub mod orchestrator;
pub mod process;
pub mod report;
pub mod session;
pub mod telemetry;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications).
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupt_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    use std::sync::atomic::{AtomicBool, Ordering};

    static TEST_INTERRUPT_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

    let flag = TEST_INTERRUPT_FLAG
        .get_or_init(|| {
            let shared = Arc::new(AtomicBool::new(false));
            let checker = Arc::clone(&shared);
            set_interrupt_checker(move || checker.load(Ordering::Relaxed));
            shared
        })
        .clone();

    flag.store(value, Ordering::Relaxed);
}

// Re-exports for convenience
pub use {
    calibration::{CalibrationModel, Verdict, analyze, analyze_battery},
    discovery::{DiscoveredPort, discover_ports, find_board, open_port, wait_for_board},
    error::{Error, Result},
    orchestrator::{
        DeviceLink, HarnessConfig, Orchestrator, SerialLink, Stage, StageResult, TestReport,
        advance,
    },
    process::{ProcessRunner, RunOutput, SystemRunner},
    report::{banner, exit_code, render_record, render_verdict, write_record},
    session::{SessionState, run_session},
    telemetry::{CalibrationPoint, Outcome, RailSample, TelemetryEvent, classify},
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_checker_default_false() {
        test_set_interrupted(false);
        assert!(!is_interrupt_requested());
    }

    #[test]
    fn test_interrupt_checker_toggle_true_false() {
        test_set_interrupted(true);
        assert!(is_interrupt_requested());

        test_set_interrupted(false);
        assert!(!is_interrupt_requested());
    }
}
