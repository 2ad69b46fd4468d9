//! Result record rendering and the on-disk log sink.
//!
//! One record is written per board: a banner for the overall outcome, the
//! ordered verdict list, then the raw serial log captured during the
//! session. The filename embeds the outcome and a timestamp so a shift's
//! worth of boards sorts chronologically on disk.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use log::info;

use crate::calibration::Verdict;
use crate::error::Result;
use crate::telemetry::Outcome;

/// Divider between the verdict section and the raw serial log.
const RAW_LOG_DIVIDER: &str = "-=-=-=-=-= RAW serial log -=-=-=-=-=-=";

/// Render one verdict as a record line: `TEST: <subject padded>{OK|FAIL}`.
#[must_use]
pub fn render_verdict(verdict: &Verdict) -> String {
    format!("TEST: {:<20}{}", verdict.subject, verdict.outcome.as_record_str())
}

/// The multi-line banner announcing the overall outcome.
#[must_use]
pub fn banner(outcome: Outcome) -> String {
    let word = match outcome {
        Outcome::Pass => "PASS",
        Outcome::Fail => "FAIL",
    };
    format!(
        "\n  ############################\n  #          {word}            #\n  ############################"
    )
}

/// Process exit status for an outcome.
#[must_use]
pub fn exit_code(outcome: Outcome) -> i32 {
    match outcome {
        Outcome::Pass => 0,
        Outcome::Fail => 1,
    }
}

/// Render the full record body.
#[must_use]
pub fn render_record(verdicts: &[Verdict], debug_lines: &[String]) -> String {
    let mut out = String::new();
    for verdict in verdicts {
        out.push_str(&render_verdict(verdict));
        out.push('\n');
    }
    out.push('\n');
    out.push_str(RAW_LOG_DIVIDER);
    out.push('\n');
    for line in debug_lines {
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// Write the record to `<log_dir>/<PASS|FAIL>-<timestamp>.txt`.
///
/// Creates the log directory when it does not exist. Returns the path of
/// the record written.
pub fn write_record(
    log_dir: &Path,
    outcome: Outcome,
    verdicts: &[Verdict],
    debug_lines: &[String],
) -> Result<PathBuf> {
    fs::create_dir_all(log_dir)?;

    let stamp = Local::now().format("%Y-%m-%d-%H:%M:%S");
    let word = match outcome {
        Outcome::Pass => "PASS",
        Outcome::Fail => "FAIL",
    };
    let path = log_dir.join(format!("{word}-{stamp}.txt"));

    fs::write(&path, render_record(verdicts, debug_lines))?;
    info!("result record written to {}", path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdicts() -> Vec<Verdict> {
        vec![
            Verdict::pass("GPIO"),
            Verdict::fail("ADC CH0").with_detail("mean error 0.31"),
        ]
    }

    #[test]
    fn test_render_verdict_pads_subject() {
        assert_eq!(render_verdict(&Verdict::pass("GPIO")), "TEST: GPIO                OK");
        assert_eq!(
            render_verdict(&Verdict::fail("ADC CH0")),
            "TEST: ADC CH0             FAIL"
        );
    }

    #[test]
    fn test_banner_mentions_outcome() {
        assert!(banner(Outcome::Pass).contains("PASS"));
        assert!(banner(Outcome::Fail).contains("FAIL"));
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(Outcome::Pass), 0);
        assert_eq!(exit_code(Outcome::Fail), 1);
    }

    #[test]
    fn test_record_layout() {
        let record = render_record(&verdicts(), &["Info: hello".to_string()]);
        let verdict_pos = record.find("TEST: GPIO").unwrap();
        let divider_pos = record.find(RAW_LOG_DIVIDER).unwrap();
        let raw_pos = record.find("Info: hello").unwrap();
        assert!(verdict_pos < divider_pos);
        assert!(divider_pos < raw_pos);
    }

    #[test]
    fn test_write_record_creates_dir_and_embeds_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("log");

        let path = write_record(&log_dir, Outcome::Fail, &verdicts(), &[]).unwrap();
        let name = path.file_name().unwrap().to_string_lossy();
        assert!(name.starts_with("FAIL-"));
        assert!(name.ends_with(".txt"));
        assert!(fs::read_to_string(&path).unwrap().contains("TEST: GPIO"));
    }
}
