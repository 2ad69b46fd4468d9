//! Top-level bring-up sequence for one board.
//!
//! The orchestrator walks a fixed stage sequence: load the test image into
//! SRAM, wait for the board's serial interface, run the telemetry session,
//! burn the bootloader into flash, load the reboot-monitor image, wait for
//! the bootloader to enumerate on USB (operator presses `btn0`), then push
//! the application image over DFU. Any fatal stage failure aborts the rest
//! of the run; the caller renders exactly one result record either way.

use std::fmt;
use std::io::Read;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use log::{info, warn};
use serde::Deserialize;

use crate::calibration::{CalibrationModel, Verdict};
use crate::discovery;
use crate::error::{Error, Result};
use crate::process::ProcessRunner;
use crate::session::{SessionState, run_session};
use crate::telemetry::Outcome;

/// One discrete step of the bring-up sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Load the test image into SRAM and check the JTAG ID.
    FlashTest,
    /// Poll for the board's USB-CDC serial interface.
    AwaitDevice,
    /// Run the telemetry session to completion.
    RunSession,
    /// Burn the bootloader image into flash.
    FlashBootloader,
    /// Load the reboot-monitor image into SRAM.
    FlashRecovery,
    /// Poll for the DFU bootloader to enumerate.
    AwaitBootloaderEnum,
    /// Push the application image over DFU.
    PushApplication,
    /// Every stage passed.
    Done,
    /// A fatal stage failure ended the run early.
    Aborted,
}

impl Stage {
    /// Whether the sequence has ended.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Aborted)
    }

    /// The stage label used in messages and logging.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::FlashTest => "flash test image",
            Self::AwaitDevice => "wait for device",
            Self::RunSession => "run test session",
            Self::FlashBootloader => "flash bootloader",
            Self::FlashRecovery => "flash reboot monitor",
            Self::AwaitBootloaderEnum => "wait for DFU bootloader",
            Self::PushApplication => "push application",
            Self::Done => "done",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Terminal result of one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageResult {
    /// The stage that produced this result.
    pub stage: Stage,
    /// Pass or fail.
    pub outcome: Outcome,
    /// Human-readable summary for the log.
    pub message: String,
}

/// The transition function of the stage machine.
///
/// The machine only advances on a terminal [`StageResult`] of the current
/// stage; any failure routes to [`Stage::Aborted`].
#[must_use]
pub fn advance(stage: Stage, outcome: Outcome) -> Stage {
    if outcome == Outcome::Fail {
        return match stage {
            Stage::Done => Stage::Done,
            _ => Stage::Aborted,
        };
    }

    match stage {
        Stage::FlashTest => Stage::AwaitDevice,
        Stage::AwaitDevice => Stage::RunSession,
        Stage::RunSession => Stage::FlashBootloader,
        Stage::FlashBootloader => Stage::FlashRecovery,
        Stage::FlashRecovery => Stage::AwaitBootloaderEnum,
        Stage::AwaitBootloaderEnum => Stage::PushApplication,
        Stage::PushApplication => Stage::Done,
        Stage::Done => Stage::Done,
        Stage::Aborted => Stage::Aborted,
    }
}

/// All tunables of one harness run.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Device programmer binary.
    pub programmer: String,
    /// DFU utility binary.
    pub dfu_util: String,
    /// Test image loaded into SRAM for the telemetry session.
    pub test_image: PathBuf,
    /// Bootloader image burned into flash.
    pub bootloader_image: PathBuf,
    /// Reboot-monitor image loaded into SRAM after the bootloader.
    pub recovery_image: PathBuf,
    /// Application image pushed over DFU.
    pub app_image: PathBuf,
    /// Token the programmer must print when the test image loads.
    pub test_idcode: String,
    /// Token the programmer must print when the reboot monitor loads.
    pub recovery_idcode: String,
    /// Product string advertised by the DFU bootloader.
    pub bootloader_name: String,
    /// Upload completion marker in the DFU utility's output.
    pub download_marker: String,
    /// Upload status-OK marker in the DFU utility's output.
    pub status_ok_marker: String,
    /// Serial descriptor substrings identifying the board.
    pub port_descriptors: Vec<String>,
    /// Serial discovery poll interval in milliseconds.
    pub device_poll_ms: u64,
    /// Serial discovery deadline in seconds; absent = wait forever.
    pub device_timeout_secs: Option<u64>,
    /// DFU enumeration poll interval in milliseconds.
    pub enum_poll_ms: u64,
    /// DFU enumeration deadline in seconds; absent = wait for the button.
    pub enum_timeout_secs: Option<u64>,
    /// Re-discovery attempts after a disconnect before telemetry started.
    pub session_retries: u32,
    /// Analog calibration model for this board revision.
    pub calibration: CalibrationModel,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            programmer: "ecpprog".to_string(),
            dfu_util: "dfu-util".to_string(),
            test_image: PathBuf::from("prebuilt/orangecrab-test-85F.bit"),
            bootloader_image: PathBuf::from("prebuilt/foboot-v3.1-orangecrab-r0.2-25F.bit"),
            recovery_image: PathBuf::from("prebuilt/orangecrab-reboot-25F.bit"),
            app_image: PathBuf::from("prebuilt/blink_fw.dfu"),
            test_idcode: "IDCODE: 0x41113043".to_string(),
            recovery_idcode: "IDCODE: 0x41111043".to_string(),
            bootloader_name: "OrangeCrab r0.2 DFU Bootloader".to_string(),
            download_marker: "Download done.".to_string(),
            status_ok_marker: "status(0) = No error condition is present".to_string(),
            port_descriptors: vec![
                "OrangeCrab ACM".to_string(),
                "OrangeCrab CDC".to_string(),
            ],
            device_poll_ms: 200,
            device_timeout_secs: None,
            enum_poll_ms: 200,
            enum_timeout_secs: None,
            session_retries: 3,
            calibration: CalibrationModel::default(),
        }
    }
}

impl HarnessConfig {
    /// Serial discovery poll interval.
    #[must_use]
    pub fn device_poll(&self) -> Duration {
        Duration::from_millis(self.device_poll_ms)
    }

    /// Serial discovery deadline.
    #[must_use]
    pub fn device_timeout(&self) -> Option<Duration> {
        self.device_timeout_secs.map(Duration::from_secs)
    }

    /// DFU enumeration poll interval.
    #[must_use]
    pub fn enum_poll(&self) -> Duration {
        Duration::from_millis(self.enum_poll_ms)
    }

    /// DFU enumeration deadline.
    #[must_use]
    pub fn enum_timeout(&self) -> Option<Duration> {
        self.enum_timeout_secs.map(Duration::from_secs)
    }
}

/// Access to the board's serial link.
///
/// Separated behind a trait so the orchestrator can be driven end-to-end
/// against canned transcripts in tests.
pub trait DeviceLink {
    /// Block until the board's serial interface appears; returns the port name.
    fn wait_for_device(&mut self, config: &HarnessConfig) -> Result<String>;

    /// Open the named port as a byte stream for one session.
    fn open(&mut self, port: &str) -> Result<Box<dyn Read + Send>>;
}

/// [`DeviceLink`] over real serial ports.
#[derive(Debug, Default)]
pub struct SerialLink;

impl DeviceLink for SerialLink {
    fn wait_for_device(&mut self, config: &HarnessConfig) -> Result<String> {
        let port = discovery::wait_for_board(
            &config.port_descriptors,
            config.device_poll(),
            config.device_timeout(),
        )?;
        Ok(port.name)
    }

    fn open(&mut self, port: &str) -> Result<Box<dyn Read + Send>> {
        let handle = discovery::open_port(port)?;
        Ok(Box::new(handle))
    }
}

/// Final report of one board's bring-up run.
#[derive(Debug)]
pub struct TestReport {
    /// Overall outcome: Pass only when every stage completed.
    pub outcome: Outcome,
    /// All verdicts, in emission order.
    pub verdicts: Vec<Verdict>,
    /// The raw serial log plus analyzer debug lines.
    pub debug_lines: Vec<String>,
    /// Terminal result of each stage that ran.
    pub stages: Vec<StageResult>,
}

/// What a stage handler decided.
enum StageFlow {
    Result(StageResult),
    /// Disconnect before telemetry started: go back to discovery.
    RetryDevice,
}

/// Drives one board through the full bring-up sequence.
pub struct Orchestrator<'a, P: ProcessRunner, L: DeviceLink> {
    config: &'a HarnessConfig,
    runner: P,
    link: L,
    port: Option<String>,
    session_attempts: u32,
    verdicts: Vec<Verdict>,
    debug_lines: Vec<String>,
}

impl<'a, P: ProcessRunner, L: DeviceLink> Orchestrator<'a, P, L> {
    /// Create an orchestrator over the given process runner and device link.
    pub fn new(config: &'a HarnessConfig, runner: P, link: L) -> Self {
        Self {
            config,
            runner,
            link,
            port: None,
            session_attempts: 0,
            verdicts: Vec::new(),
            debug_lines: Vec::new(),
        }
    }

    /// Run the whole sequence and produce the final report.
    ///
    /// Never panics and never exits the process; every failure mode,
    /// including operator interruption, folds into the report. `progress`
    /// is called on entry to each stage.
    pub fn run(mut self, progress: &mut dyn FnMut(Stage)) -> TestReport {
        let mut stage = Stage::FlashTest;
        let mut stages = Vec::new();

        while !stage.is_terminal() {
            progress(stage);
            info!("stage: {stage}");

            let flow = match self.run_stage(stage) {
                Ok(flow) => flow,
                Err(e) => StageFlow::Result(StageResult {
                    stage,
                    outcome: Outcome::Fail,
                    message: e.to_string(),
                }),
            };

            match flow {
                StageFlow::Result(result) => {
                    if result.outcome == Outcome::Fail {
                        warn!("stage {} failed: {}", result.stage, result.message);
                    } else {
                        info!("stage {} passed: {}", result.stage, result.message);
                    }
                    stage = advance(result.stage, result.outcome);
                    stages.push(result);
                },
                StageFlow::RetryDevice => {
                    warn!(
                        "device dropped before telemetry; retrying discovery ({}/{})",
                        self.session_attempts, self.config.session_retries
                    );
                    stage = Stage::AwaitDevice;
                },
            }
        }

        let outcome = if stage == Stage::Done { Outcome::Pass } else { Outcome::Fail };
        TestReport {
            outcome,
            verdicts: self.verdicts,
            debug_lines: self.debug_lines,
            stages,
        }
    }

    fn run_stage(&mut self, stage: Stage) -> Result<StageFlow> {
        let config = self.config;
        match stage {
            Stage::FlashTest => {
                self.flash_checked(stage, &config.test_image, &config.test_idcode)
            },
            Stage::AwaitDevice => self.await_device(),
            Stage::RunSession => self.run_telemetry_session(),
            Stage::FlashBootloader => self.flash_bootloader(),
            Stage::FlashRecovery => {
                self.flash_checked(stage, &config.recovery_image, &config.recovery_idcode)
            },
            Stage::AwaitBootloaderEnum => self.await_bootloader(),
            Stage::PushApplication => self.push_application(),
            Stage::Done | Stage::Aborted => unreachable!("terminal stage has no handler"),
        }
    }

    /// Load an image into SRAM and verify the device identifier in the
    /// programmer's output.
    fn flash_checked(
        &mut self,
        stage: Stage,
        image: &std::path::Path,
        idcode: &str,
    ) -> Result<StageFlow> {
        let image = image.to_string_lossy();
        let output = self.runner.run(&self.config.programmer, &["-S", &image])?;
        let ok = output.success && output.contains(idcode);
        let message = if ok {
            format!("JTAG: {idcode} detected")
        } else {
            format!("JTAG load error (exit ok: {})", output.success)
        };
        Ok(StageFlow::Result(StageResult {
            stage,
            outcome: if ok { Outcome::Pass } else { Outcome::Fail },
            message,
        }))
    }

    /// Burn the bootloader; the reference streams this load and only
    /// checks the exit status.
    fn flash_bootloader(&mut self) -> Result<StageFlow> {
        let image = self.config.bootloader_image.to_string_lossy().into_owned();
        let output = self.runner.run(&self.config.programmer, &[&image])?;
        let ok = output.success;
        Ok(StageFlow::Result(StageResult {
            stage: Stage::FlashBootloader,
            outcome: if ok { Outcome::Pass } else { Outcome::Fail },
            message: if ok {
                "bootloader written to flash".to_string()
            } else {
                "programmer exited with failure".to_string()
            },
        }))
    }

    fn await_device(&mut self) -> Result<StageFlow> {
        let port = self.link.wait_for_device(self.config)?;
        let message = format!("serial interface at {port}");
        self.port = Some(port);
        Ok(StageFlow::Result(StageResult {
            stage: Stage::AwaitDevice,
            outcome: Outcome::Pass,
            message,
        }))
    }

    fn run_telemetry_session(&mut self) -> Result<StageFlow> {
        let port = self
            .port
            .clone()
            .ok_or_else(|| Error::Config("no port selected before session".to_string()))?;
        let reader = self.link.open(&port)?;
        self.session_attempts += 1;

        let mut state = SessionState::new();
        let result = run_session(reader, &self.config.calibration, &mut state);

        // Session artifacts survive into the record even on failure.
        self.verdicts.append(&mut state.verdicts);
        self.debug_lines.append(&mut state.debug_lines);

        match result {
            Ok(()) => Ok(StageFlow::Result(StageResult {
                stage: Stage::RunSession,
                outcome: Outcome::Pass,
                message: "telemetry session finished, all tests passed".to_string(),
            })),
            Err(e)
                if e.is_retryable()
                    && !state.saw_telemetry
                    && self.session_attempts <= self.config.session_retries =>
            {
                info!("link dropped before telemetry: {e}");
                Ok(StageFlow::RetryDevice)
            },
            Err(e) => Ok(StageFlow::Result(StageResult {
                stage: Stage::RunSession,
                outcome: Outcome::Fail,
                message: e.to_string(),
            })),
        }
    }

    fn await_bootloader(&mut self) -> Result<StageFlow> {
        info!("Please press `btn0` on the DUT to enter the bootloader");
        let start = Instant::now();

        loop {
            if crate::is_interrupt_requested() {
                return Err(Error::Interrupted);
            }

            let output = self.runner.run(&self.config.dfu_util, &["-l"])?;
            if output.contains(&self.config.bootloader_name) {
                self.verdicts.push(Verdict::pass("DFU Detect"));
                return Ok(StageFlow::Result(StageResult {
                    stage: Stage::AwaitBootloaderEnum,
                    outcome: Outcome::Pass,
                    message: "DFU bootloader enumerated".to_string(),
                }));
            }

            if let Some(limit) = self.config.enum_timeout() {
                if start.elapsed() >= limit {
                    return Err(Error::Timeout(format!(
                        "bootloader did not enumerate within {}s",
                        limit.as_secs()
                    )));
                }
            }

            std::thread::sleep(self.config.enum_poll());
        }
    }

    fn push_application(&mut self) -> Result<StageFlow> {
        let image = self.config.app_image.to_string_lossy().into_owned();
        let output = self.runner.run(&self.config.dfu_util, &["-D", &image])?;

        // Two independent markers, per the upload tool's output contract.
        let ok = output.contains(&self.config.download_marker)
            && output.contains(&self.config.status_ok_marker);

        let verdict = if ok {
            Verdict::pass("DFU Download")
        } else {
            Verdict::fail("DFU Download")
        };
        self.verdicts.push(verdict);

        Ok(StageFlow::Result(StageResult {
            stage: Stage::PushApplication,
            outcome: if ok { Outcome::Pass } else { Outcome::Fail },
            message: if ok {
                "application downloaded".to_string()
            } else {
                "download or status marker missing".to_string()
            },
        }))
    }
}
