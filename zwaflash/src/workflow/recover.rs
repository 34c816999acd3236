//! Adapter recovery: diagnose, then reinstall firmware when needed.

use super::outcome::{RecoverResult, RecoveryOutcome};
use super::{FirmwareRequest, RecoveryChoice, WorkflowContext};
use crate::diagnose::{DiagnosisResult, Remediation, diagnose};
use crate::driver::DriverFactory;
use crate::entry::BootloaderEntry;
use crate::error::{Error, Result};
use crate::firmware::{FirmwareImage, FirmwareTarget};
use crate::flash::flash_controller;
use crate::mode::DeviceMode;
use crate::session::ControllerSession;
use log::{info, warn};

/// Steps of the recovery workflow.
#[derive(Debug)]
pub enum RecoverState {
    /// Classify the adapter.
    Diagnose,
    /// Ask how to repair it.
    ChooseRecovery(DiagnosisResult),
    /// Download or load the replacement image.
    Acquire(FirmwareRequest),
    /// Write the image and check the result.
    Flash {
        /// Image to write.
        image: FirmwareImage,
        /// Whether the user supplied the image.
        custom: bool,
    },
    /// Finished.
    Summary(RecoverResult),
}

fn classify_flash(result: Result<DeviceMode>, custom: bool) -> Result<RecoverResult> {
    let mode = match result {
        Ok(mode) | Err(Error::UnexpectedMode(mode)) => mode,
        Err(Error::PostFlashVerificationFailed(_)) => DeviceMode::Unknown,
        Err(Error::Interrupted) => return Err(Error::Interrupted),
        Err(e) => {
            warn!("Recovery flash failed: {e}");
            return Ok(RecoverResult::Recovery(RecoveryOutcome::RecoveryFailed));
        },
    };
    Ok(match mode {
        DeviceMode::ApplicationProtocol => RecoverResult::Recovery(RecoveryOutcome::Recovered),
        // A custom image may legitimately be end-device firmware.
        DeviceMode::CommandLineMenu | DeviceMode::Unknown if custom => {
            RecoverResult::Diagnosis(DiagnosisResult::EndDeviceFirmware)
        },
        _ => RecoverResult::Recovery(RecoveryOutcome::RecoveryFailed),
    })
}

impl RecoverState {
    /// Phase name reported to observers.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Diagnose => "diagnose",
            Self::ChooseRecovery(_) => "choose-recovery",
            Self::Acquire(_) => "acquire",
            Self::Flash { .. } => "flash",
            Self::Summary(_) => "summary",
        }
    }

    /// Run this step and return the next one.
    ///
    /// A failed connection is diagnosed, not returned as an error; only an
    /// interruption ends the workflow early.
    pub fn next<F: DriverFactory>(
        self,
        connection: &mut Result<ControllerSession<F>>,
        entry: &BootloaderEntry<F>,
        ctx: &mut WorkflowContext<'_>,
    ) -> Result<Self> {
        Ok(match self {
            Self::Diagnose => {
                let result = diagnose(connection)?;
                match result.remediation() {
                    Remediation::Summary => Self::Summary(RecoverResult::Diagnosis(result)),
                    Remediation::OfferRecovery => Self::ChooseRecovery(result),
                }
            },
            Self::ChooseRecovery(diagnosis) => match ctx
                .prompter()
                .choose_recovery(diagnosis)?
            {
                RecoveryChoice::Latest => Self::Acquire(FirmwareRequest::Latest),
                RecoveryChoice::Custom(path) => Self::Acquire(FirmwareRequest::File(path)),
                RecoveryChoice::Abort => {
                    ctx.message("Recovery skipped");
                    Self::Summary(RecoverResult::Diagnosis(diagnosis))
                },
            },
            Self::Acquire(request) => {
                let custom = request != FirmwareRequest::Latest;
                match ctx.acquire(FirmwareTarget::Controller, &request) {
                    Ok(image) => Self::Flash { image, custom },
                    Err(Error::Interrupted) => return Err(Error::Interrupted),
                    Err(e) if custom => {
                        warn!("Could not load the recovery image: {e}");
                        Self::Summary(RecoverResult::Recovery(RecoveryOutcome::RecoveryFailed))
                    },
                    Err(e) => {
                        warn!("Could not download the latest firmware: {e}");
                        Self::Summary(RecoverResult::Recovery(RecoveryOutcome::DownloadFailed))
                    },
                }
            },
            Self::Flash { image, custom } => {
                let Ok(session) = connection else {
                    return Ok(Self::Summary(RecoverResult::Recovery(RecoveryOutcome::RecoveryFailed)));
                };
                let mut sink = ctx.progress_sink();
                let flashed = flash_controller(session, &image, entry, &mut sink);
                Self::Summary(classify_flash(flashed, custom)?)
            },
            summary @ Self::Summary(_) => summary,
        })
    }
}

/// Diagnose the adapter and repair it if the user agrees.
pub fn recover<F: DriverFactory>(
    connection: &mut Result<ControllerSession<F>>,
    entry: &BootloaderEntry<F>,
    ctx: &mut WorkflowContext<'_>,
) -> Result<RecoverResult> {
    let mut state = RecoverState::Diagnose;
    loop {
        ctx.phase(state.name());
        state = match state {
            RecoverState::Summary(result) => {
                info!("Recovery finished: {}", result.outcome().tag);
                return Ok(result);
            },
            step => step.next(connection, entry, ctx)?,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::scripted::ScriptedFactory;
    use crate::entry::{EntryConfig, EntryTimings};
    use crate::firmware::gbl::tests::sample_gbl;
    use crate::firmware::http::MockHttpClient;
    use crate::firmware::{FirmwareDigest, FirmwareSourceConfig};
    use crate::port::DEFAULT_BAUD;
    use crate::port::mock::MockLink;
    use crate::workflow::tests::Recorder;
    use crate::workflow::{FixedAnswers, WorkflowContext};

    const INDEX: &str = "https://index.test/releases/latest";
    const ASSET: &str = "https://dl.test/zwa2_7.23.1.gbl";

    fn entry() -> BootloaderEntry<ScriptedFactory> {
        BootloaderEntry::new(EntryConfig {
            timings: EntryTimings::immediate(),
            ..EntryConfig::default()
        })
    }

    fn connect(factory: &ScriptedFactory) -> Result<ControllerSession<ScriptedFactory>> {
        let (link, _handle) = MockLink::opened("mock0", DEFAULT_BAUD);
        ControllerSession::connect(factory.clone(), Box::new(link), DEFAULT_BAUD)
    }

    fn sources() -> FirmwareSourceConfig {
        FirmwareSourceConfig::default()
            .with_controller_index_url(INDEX)
            .with_proxy(false)
    }

    fn release_server(firmware: Vec<u8>, digest: &str) -> MockHttpClient {
        let index = format!(
            r#"{{"tag_name": "v7.23.1", "assets": [
                {{"name": "zwa2_7.23.1.gbl", "browser_download_url": "{ASSET}", "digest": "{digest}"}}
            ]}}"#
        );
        let mut http = MockHttpClient::new();
        http.expect_get()
            .withf(|url| url == INDEX)
            .returning(move |_| Ok(index.clone().into_bytes()));
        http.expect_get()
            .withf(|url| url == ASSET)
            .returning(move |_| Ok(firmware.clone()));
        http
    }

    fn run(
        factory: &ScriptedFactory,
        http: &MockHttpClient,
        answers: FixedAnswers,
    ) -> (RecoverResult, Recorder) {
        let mut connection = connect(factory);
        let mut answers = answers;
        let mut recorder = Recorder::default();
        let mut ctx = WorkflowContext::new(http, &mut answers, &mut recorder).with_sources(sources());
        let result = recover(&mut connection, &entry(), &mut ctx).unwrap();
        drop(ctx);
        (result, recorder)
    }

    fn latest() -> FixedAnswers {
        FixedAnswers {
            recovery: RecoveryChoice::Latest,
            ..FixedAnswers::default()
        }
    }

    #[test]
    fn test_unknown_firmware_recovered_with_latest() {
        let firmware = sample_gbl(&[0xA5; 256]);
        let digest = FirmwareDigest::compute(&firmware).to_string();
        let http = release_server(firmware.clone(), &digest);

        let factory = ScriptedFactory::new();
        factory
            .then_start(Some(DeviceMode::Unknown))
            .then_start(Some(DeviceMode::Bootloader))
            .then_start(Some(DeviceMode::ApplicationProtocol))
            .update_progress(&[25, 75, 100]);

        let (result, recorder) = run(&factory, &http, latest());
        assert_eq!(result, RecoverResult::Recovery(RecoveryOutcome::Recovered));
        assert_eq!(
            recorder.phases(),
            vec!["diagnose", "choose-recovery", "acquire", "flash", "summary"]
        );
        assert!(
            factory
                .calls()
                .contains(&format!("firmware_update:{}", firmware.len()))
        );
        assert_eq!(recorder.progress().last(), Some(&100));
    }

    #[test]
    fn test_digest_mismatch_is_download_failure() {
        let firmware = sample_gbl(&[0xA5; 256]);
        let digest = FirmwareDigest::compute(b"something else").to_string();
        let http = release_server(firmware, &digest);

        let factory = ScriptedFactory::new();
        factory.otherwise(DeviceMode::Unknown);

        let (result, _) = run(&factory, &http, latest());
        assert_eq!(result, RecoverResult::Recovery(RecoveryOutcome::DownloadFailed));
        assert_eq!(factory.count("start"), 1);
    }

    #[test]
    fn test_healthy_adapter_skips_to_summary() {
        let http = MockHttpClient::new();
        let factory = ScriptedFactory::new();
        factory.otherwise(DeviceMode::ApplicationProtocol);

        let (result, recorder) = run(&factory, &http, latest());
        assert_eq!(result, RecoverResult::Diagnosis(DiagnosisResult::NoIssues));
        assert_eq!(recorder.phases(), vec!["diagnose", "summary"]);
    }

    #[test]
    fn test_connection_failure_skips_to_summary() {
        let http = MockHttpClient::new();
        let factory = ScriptedFactory::new();

        let (result, _) = run(&factory, &http, latest());
        assert_eq!(result, RecoverResult::Diagnosis(DiagnosisResult::ConnectionFailed));
    }

    #[test]
    fn test_abort_keeps_diagnosis() {
        let http = MockHttpClient::new();
        let factory = ScriptedFactory::new();
        factory.otherwise(DeviceMode::Unknown);

        let (result, _) = run(&factory, &http, FixedAnswers::default());
        assert_eq!(result, RecoverResult::Diagnosis(DiagnosisResult::UnknownFirmware));
    }

    #[test]
    fn test_custom_end_device_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir
            .path()
            .join("end_device.gbl");
        std::fs::write(&path, sample_gbl(&[1; 32])).unwrap();

        let http = MockHttpClient::new();
        let factory = ScriptedFactory::new();
        factory
            .then_start(Some(DeviceMode::Bootloader))
            .then_start(Some(DeviceMode::CommandLineMenu))
            .leave_to(None);

        let answers = FixedAnswers {
            recovery: RecoveryChoice::Custom(path),
            ..FixedAnswers::default()
        };
        let (result, _) = run(&factory, &http, answers);
        assert_eq!(result, RecoverResult::Diagnosis(DiagnosisResult::EndDeviceFirmware));
    }

    #[test]
    fn test_flash_failure_is_recovery_failed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir
            .path()
            .join("zwa2.gbl");
        std::fs::write(&path, sample_gbl(&[1; 32])).unwrap();

        let http = MockHttpClient::new();
        let factory = ScriptedFactory::new();
        factory
            .otherwise(DeviceMode::Bootloader)
            .leave_to(None)
            .update_fails();

        let answers = FixedAnswers {
            recovery: RecoveryChoice::Custom(path),
            ..FixedAnswers::default()
        };
        let (result, _) = run(&factory, &http, answers);
        assert_eq!(result, RecoverResult::Recovery(RecoveryOutcome::RecoveryFailed));
    }

    #[test]
    fn test_classify_flash() {
        assert_eq!(
            classify_flash(Err(Error::UnexpectedMode(DeviceMode::Bootloader)), true).unwrap(),
            RecoverResult::Recovery(RecoveryOutcome::RecoveryFailed)
        );
        assert_eq!(
            classify_flash(Err(Error::UnexpectedMode(DeviceMode::CommandLineMenu)), false).unwrap(),
            RecoverResult::Recovery(RecoveryOutcome::RecoveryFailed)
        );
        assert!(matches!(classify_flash(Err(Error::Interrupted), true), Err(Error::Interrupted)));
    }
}
