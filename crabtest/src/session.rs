//! One serial session against the test firmware.
//!
//! A session owns the open serial handle for its whole lifetime: it reads
//! telemetry lines, dispatches them through the classifier, accumulates
//! calibration data in a [`SessionState`] and runs the analyzer when the
//! firmware signals the end of its sweep. The loop is a busy-poll with a
//! short idle back-off, matching the firmware's unbuffered line emission.

use std::collections::BTreeMap;
use std::io::Read;
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::calibration::{CalibrationModel, Verdict, analyze, analyze_battery};
use crate::error::{Error, Result};
use crate::telemetry::{CalibrationPoint, Outcome, TelemetryEvent, classify};

/// Idle delay when a read returns no data.
pub const IDLE_BACKOFF: Duration = Duration::from_millis(10);

/// Accumulated state of one serial session.
///
/// Created fresh per session; mutated only by [`run_session`]. The verdict
/// and debug buffers survive a failed session so the orchestrator can still
/// render a complete record.
#[derive(Debug, Default)]
pub struct SessionState {
    /// Calibration sweep samples, in emission order.
    pub points: Vec<CalibrationPoint>,
    /// Last recorded raw code per rail name.
    pub rails: BTreeMap<String, i32>,
    /// Raw battery-rail codes, in emission order.
    pub battery_codes: Vec<i32>,
    /// Verdicts, in emission order.
    pub verdicts: Vec<Verdict>,
    /// Every raw line read, for the result record's debug section.
    pub debug_lines: Vec<String>,
    /// Whether at least one line was received on this session.
    pub saw_telemetry: bool,
    analyzed: bool,
}

impl SessionState {
    /// Create an empty session state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether every collected verdict passed.
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.verdicts.iter().all(|v| v.outcome == Outcome::Pass)
    }
}

/// What a line dispatch decided about the loop.
enum Dispatch {
    Continue,
    Finished,
}

/// Run one session to completion over `reader`.
///
/// Blocks until the firmware emits its session terminator, a named test
/// fails, or the link drops. Reads that time out back off for
/// [`IDLE_BACKOFF`]; end-of-stream and hard I/O faults surface as
/// [`Error::Disconnect`], which the orchestrator treats as retryable.
pub fn run_session<R: Read>(
    mut reader: R,
    model: &CalibrationModel,
    state: &mut SessionState,
) -> Result<()> {
    let mut pending: Vec<u8> = Vec::new();
    let mut buf = [0u8; 256];

    loop {
        if crate::is_interrupt_requested() {
            return Err(Error::Interrupted);
        }

        match reader.read(&mut buf) {
            Ok(0) => {
                return Err(Error::Disconnect("end of stream".to_string()));
            },
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                while let Some(line) = take_line(&mut pending) {
                    if line.is_empty() {
                        continue;
                    }
                    match dispatch_line(&line, model, state)? {
                        Dispatch::Continue => {},
                        Dispatch::Finished => return Ok(()),
                    }
                }
            },
            Err(e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                thread::sleep(IDLE_BACKOFF);
            },
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {},
            Err(e) => {
                warn!("serial read fault: {e}");
                return Err(Error::Disconnect(e.to_string()));
            },
        }
    }
}

/// Split one complete line off the front of `pending`, if present.
fn take_line(pending: &mut Vec<u8>) -> Option<String> {
    let newline = pending.iter().position(|&b| b == b'\n')?;
    let raw: Vec<u8> = pending.drain(..=newline).collect();
    let text = String::from_utf8_lossy(&raw);
    Some(text.trim_matches(['\r', '\n']).to_string())
}

/// Classify and apply one telemetry line.
fn dispatch_line(
    line: &str,
    model: &CalibrationModel,
    state: &mut SessionState,
) -> Result<Dispatch> {
    state.saw_telemetry = true;
    state.debug_lines.push(line.to_string());

    match classify(line) {
        TelemetryEvent::Info(text) => {
            info!("{text}");
        },
        TelemetryEvent::TestResult { name, outcome } => {
            state.verdicts.push(Verdict { subject: name.clone(), outcome, detail: None });
            if outcome == Outcome::Fail {
                return Err(Error::TestFailed { name });
            }
        },
        TelemetryEvent::CalibrationSample(point) => {
            state.points.push(point);
        },
        TelemetryEvent::RailSample(sample) => {
            if sample.rail.contains("VBAT") {
                state.battery_codes.push(sample.adc_code);
            } else {
                state.rails.insert(sample.rail, sample.adc_code);
            }
        },
        TelemetryEvent::CalibrationFinished => {
            run_analysis(model, state)?;
        },
        TelemetryEvent::BatteryFinished => {
            if let Some(verdict) = analyze_battery(model, &state.battery_codes) {
                let failed = verdict.outcome == Outcome::Fail;
                let name = verdict.subject.clone();
                state.verdicts.push(verdict);
                if failed {
                    return Err(Error::TestFailed { name });
                }
            }
        },
        TelemetryEvent::SessionFinished => {
            run_analysis(model, state)?;
            debug!("session finished after {} lines", state.debug_lines.len());
            return Ok(Dispatch::Finished);
        },
        TelemetryEvent::Raw(_) => {},
    }

    Ok(Dispatch::Continue)
}

/// Run the calibration/rail analysis exactly once per session.
///
/// The full verdict set is recorded before the session is failed, so the
/// result record shows every channel and rail, not just the first offender.
fn run_analysis(model: &CalibrationModel, state: &mut SessionState) -> Result<()> {
    if state.analyzed {
        return Ok(());
    }
    state.analyzed = true;

    let verdicts = analyze(model, &state.points, &state.rails, &mut state.debug_lines);
    let first_failure = verdicts
        .iter()
        .find(|v| v.outcome == Outcome::Fail)
        .map(|v| v.subject.clone());
    state.verdicts.extend(verdicts);

    match first_failure {
        Some(name) => Err(Error::TestFailed { name }),
        None => Ok(()),
    }
}
