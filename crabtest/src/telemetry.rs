//! Telemetry line classification.
//!
//! The test firmware emits newline-terminated ASCII lines over its USB-CDC
//! serial interface. Every line falls into one of a small set of shapes:
//!
//! ```text
//! Info: <free text>
//! Test:<name>|<Started|Pass|Failed>
//! Test:ADC, Finish          (calibration sweep terminator)
//! Test:BATT, Finish         (battery sweep terminator)
//! Test:DONE, Finish         (session terminator)
//! CH=<n>, DAC=<code>, ADC=<code>
//! <RAIL>-ADC=<code>
//! ```
//!
//! [`classify`] maps one decoded line to a [`TelemetryEvent`]. It is a pure
//! function of the line: repeated calls with the same input produce the same
//! event. Malformed sample lines are parsed through explicit [`ParseError`]
//! results and downgraded to [`TelemetryEvent::Raw`] here; telemetry noise
//! must never abort a session.

use thiserror::Error;

/// Pass/fail outcome of a single named judgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The judgment succeeded.
    Pass,
    /// The judgment failed.
    Fail,
}

impl Outcome {
    /// Render as the result-record column text.
    #[must_use]
    pub fn as_record_str(&self) -> &'static str {
        match self {
            Self::Pass => "OK",
            Self::Fail => "FAIL",
        }
    }
}

/// One (channel, DAC code, ADC code) triple from the calibration sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationPoint {
    /// Analog channel index (0..=5).
    pub channel: u8,
    /// DAC code driven onto the channel (0..=4095).
    pub dac_code: u16,
    /// Raw ADC code read back.
    pub adc_code: i32,
}

/// One raw ADC reading tagged with a power-rail name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RailSample {
    /// Rail name, e.g. `3V3` or `VBAT`.
    pub rail: String,
    /// Raw ADC code.
    pub adc_code: i32,
}

/// Classified telemetry line.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    /// Informational message from the firmware.
    Info(String),
    /// A firmware-named test finished with the given outcome.
    TestResult {
        /// Test name, text before the first `|`.
        name: String,
        /// Reported outcome.
        outcome: Outcome,
    },
    /// One calibration sweep sample.
    CalibrationSample(CalibrationPoint),
    /// One power-rail sample.
    RailSample(RailSample),
    /// `Test:ADC, Finish` — the calibration sweep is complete.
    CalibrationFinished,
    /// `Test:BATT, Finish` — the battery sweep is complete.
    BatteryFinished,
    /// `Test:DONE, Finish` — the firmware test sequence is complete.
    SessionFinished,
    /// Anything else, kept verbatim for the debug log.
    Raw(String),
}

/// Why a sample line could not be parsed.
///
/// These never leave the parser layer: the caller's policy is to drop the
/// sample and fall back to [`TelemetryEvent::Raw`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// A required `key=value` pair was absent.
    #[error("missing key `{0}`")]
    MissingKey(&'static str),
    /// A value failed integer conversion.
    #[error("bad integer `{0}`")]
    BadInteger(String),
    /// The line does not carry a recognizable rail tag.
    #[error("no rail name")]
    NoRailName,
}

/// Classify one decoded telemetry line.
///
/// Precedence: `Info:` prefix, `Test:` prefix, `CH=` sample, rail `ADC`
/// sample, raw fallback. First match wins. Callers must skip empty lines;
/// an empty input classifies as `Raw("")`.
#[must_use]
pub fn classify(line: &str) -> TelemetryEvent {
    if let Some(rest) = line.strip_prefix("Info:") {
        return TelemetryEvent::Info(rest.trim().to_string());
    }

    if let Some(rest) = line.strip_prefix("Test:") {
        return classify_test(rest);
    }

    if line.contains("CH=") {
        return match parse_calibration_sample(line) {
            Ok(point) => TelemetryEvent::CalibrationSample(point),
            Err(e) => {
                log::trace!("dropping malformed calibration sample {line:?}: {e}");
                TelemetryEvent::Raw(line.to_string())
            },
        };
    }

    if line.contains("ADC") {
        return match parse_rail_sample(line) {
            Ok(sample) => TelemetryEvent::RailSample(sample),
            Err(e) => {
                log::trace!("dropping malformed rail sample {line:?}: {e}");
                TelemetryEvent::Raw(line.to_string())
            },
        };
    }

    TelemetryEvent::Raw(line.to_string())
}

/// Classify the remainder of a `Test:` line.
fn classify_test(rest: &str) -> TelemetryEvent {
    if rest.contains("DONE, Finish") {
        return TelemetryEvent::SessionFinished;
    }
    if rest.contains("ADC, Finish") {
        return TelemetryEvent::CalibrationFinished;
    }
    if rest.contains("BATT, Finish") {
        return TelemetryEvent::BatteryFinished;
    }

    let lower = rest.to_lowercase();
    if lower.contains("started") {
        return TelemetryEvent::Info(rest.trim().to_string());
    }

    let name = rest.split('|').next().unwrap_or(rest).trim().to_string();
    if lower.contains("pass") {
        return TelemetryEvent::TestResult { name, outcome: Outcome::Pass };
    }
    if lower.contains("failed") {
        return TelemetryEvent::TestResult { name, outcome: Outcome::Fail };
    }

    TelemetryEvent::Raw(format!("Test:{rest}"))
}

/// Parse a `CH=<n>, DAC=<code>, ADC=<code>` sample line.
///
/// Pairs that do not split as `key=value` are skipped; the three expected
/// keys must all be present and integral.
fn parse_calibration_sample(line: &str) -> Result<CalibrationPoint, ParseError> {
    let mut channel = None;
    let mut dac = None;
    let mut adc = None;

    for pair in line.split(',') {
        let Some((key, value)) = pair.trim().split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "CH" => channel = Some(parse_int(value)?),
            "DAC" => dac = Some(parse_int(value)?),
            "ADC" => adc = Some(parse_int(value)?),
            _ => {},
        }
    }

    let channel = channel.ok_or(ParseError::MissingKey("CH"))?;
    let dac_code = dac.ok_or(ParseError::MissingKey("DAC"))?;
    let adc_code = adc.ok_or(ParseError::MissingKey("ADC"))?;

    let channel =
        u8::try_from(channel).map_err(|_| ParseError::BadInteger(channel.to_string()))?;
    let dac_code =
        u16::try_from(dac_code).map_err(|_| ParseError::BadInteger(dac_code.to_string()))?;

    Ok(CalibrationPoint { channel, dac_code, adc_code })
}

/// Parse a `<RAIL>-ADC=<code>` rail sample line.
///
/// The rail name is recovered by splitting the left side of `=` on `-` and
/// taking the component that is not the `ADC` tag.
fn parse_rail_sample(line: &str) -> Result<RailSample, ParseError> {
    let (lhs, rhs) = line.split_once('=').ok_or(ParseError::NoRailName)?;
    let adc_code = parse_int(rhs.trim())?;

    let rail = lhs
        .trim()
        .split('-')
        .map(str::trim)
        .find(|part| !part.is_empty() && *part != "ADC")
        .ok_or(ParseError::NoRailName)?;

    Ok(RailSample { rail: rail.to_string(), adc_code })
}

fn parse_int(value: &str) -> Result<i32, ParseError> {
    value
        .parse::<i32>()
        .map_err(|_| ParseError::BadInteger(value.to_string()))
}
