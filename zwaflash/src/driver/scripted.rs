//! Scripted controller driver for engine tests.

use crate::driver::{ControllerDriver, DriverFactory, ProgressSink, StartFailure};
use crate::error::{Error, Result};
use crate::mode::DeviceMode;
use crate::port::SerialLink;
use crate::protocol::MenuOption;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
struct Script {
    /// Mode found by each successive start; `None` makes that start fail.
    starts: VecDeque<Option<DeviceMode>>,
    /// Mode used once `starts` runs dry.
    fallback: Option<DeviceMode>,
    direct_entry: bool,
    leave_result: Option<DeviceMode>,
    update_fails: bool,
    update_progress: Vec<u8>,
    options: Vec<MenuOption>,
    messages: VecDeque<String>,
    calls: Vec<String>,
}

/// Test-side control over every driver a [`ScriptedFactory`] starts.
#[derive(Clone, Default)]
pub(crate) struct ScriptedFactory {
    script: Arc<Mutex<Script>>,
}

impl ScriptedFactory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn with(&self, f: impl FnOnce(&mut Script)) -> &Self {
        f(&mut self
            .script
            .lock()
            .unwrap());
        self
    }

    /// Queue the outcome of the next start.
    pub(crate) fn then_start(&self, mode: Option<DeviceMode>) -> &Self {
        self.with(|s| {
            s.starts
                .push_back(mode);
        })
    }

    /// Mode reported by starts after the queue is exhausted.
    pub(crate) fn otherwise(&self, mode: DeviceMode) -> &Self {
        self.with(|s| s.fallback = Some(mode))
    }

    /// Offer the direct enter-bootloader command.
    pub(crate) fn direct_entry(&self) -> &Self {
        self.with(|s| s.direct_entry = true)
    }

    /// Mode reached by `leave_bootloader`; `None` makes it fail.
    pub(crate) fn leave_to(&self, mode: Option<DeviceMode>) -> &Self {
        self.with(|s| s.leave_result = mode)
    }

    pub(crate) fn update_fails(&self) -> &Self {
        self.with(|s| s.update_fails = true)
    }

    pub(crate) fn update_progress(&self, steps: &[u8]) -> &Self {
        self.with(|s| s.update_progress = steps.to_vec())
    }

    pub(crate) fn option(&self, num: u8, label: &str) -> &Self {
        self.with(|s| {
            s.options
                .push(MenuOption {
                    num,
                    label: label.to_string(),
                });
        })
    }

    /// Queue a bootloader message for the next `wait_for_message`.
    pub(crate) fn message(&self, text: &str) -> &Self {
        self.with(|s| {
            s.messages
                .push_back(text.to_string());
        })
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.script
            .lock()
            .unwrap()
            .calls
            .clone()
    }

    pub(crate) fn count(&self, call: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.as_str() == call)
            .count()
    }
}

impl DriverFactory for ScriptedFactory {
    fn start(
        &self,
        link: Box<dyn SerialLink>,
    ) -> std::result::Result<Box<dyn ControllerDriver>, StartFailure> {
        let mut script = self
            .script
            .lock()
            .unwrap();
        script
            .calls
            .push("start".into());
        let next = script
            .starts
            .pop_front()
            .unwrap_or(script.fallback);
        drop(script);

        match next {
            Some(mode) if link.is_open() => Ok(Box::new(ScriptedDriver {
                link,
                mode,
                script: Arc::clone(&self.script),
            })),
            _ => Err(StartFailure {
                link,
                error: Error::Timeout("driver did not become ready".into()),
            }),
        }
    }
}

pub(crate) struct ScriptedDriver {
    link: Box<dyn SerialLink>,
    mode: DeviceMode,
    script: Arc<Mutex<Script>>,
}

impl ScriptedDriver {
    fn log(&self, call: impl Into<String>) {
        self.script
            .lock()
            .unwrap()
            .calls
            .push(call.into());
    }
}

impl ControllerDriver for ScriptedDriver {
    fn mode(&self) -> DeviceMode {
        self.mode
    }

    fn supports_enter_bootloader(&self) -> bool {
        self.script
            .lock()
            .unwrap()
            .direct_entry
    }

    fn enter_bootloader(&mut self) -> Result<()> {
        self.log("enter_bootloader");
        self.mode = DeviceMode::Bootloader;
        Ok(())
    }

    fn leave_bootloader(&mut self) -> Result<()> {
        self.log("leave_bootloader");
        let result = self
            .script
            .lock()
            .unwrap()
            .leave_result;
        match result {
            Some(mode) => {
                self.mode = mode;
                Ok(())
            },
            None => Err(Error::Protocol("application did not start".into())),
        }
    }

    fn firmware_update(&mut self, data: &[u8], progress: ProgressSink<'_>) -> Result<()> {
        self.log(format!("firmware_update:{}", data.len()));
        let (fails, steps) = {
            let script = self
                .script
                .lock()
                .unwrap();
            (script.update_fails, script.update_progress.clone())
        };
        for pct in steps {
            progress(pct);
        }
        if fails {
            return Err(Error::Xmodem("upload rejected".into()));
        }
        Ok(())
    }

    fn bootloader_options(&self) -> Vec<MenuOption> {
        self.script
            .lock()
            .unwrap()
            .options
            .clone()
    }

    fn select_option(&mut self, num: u8) -> Result<()> {
        self.log(format!("select:{num}"));
        Ok(())
    }

    fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        self.log(format!("write:{}", String::from_utf8_lossy(data)));
        Ok(())
    }

    fn wait_for_message(
        &mut self,
        predicate: &dyn Fn(&str) -> bool,
        _timeout: Duration,
    ) -> Result<Option<String>> {
        let next = self
            .script
            .lock()
            .unwrap()
            .messages
            .pop_front();
        Ok(next.filter(|m| predicate(m)))
    }

    fn destroy(self: Box<Self>) -> Box<dyn SerialLink> {
        self.log("destroy");
        self.link
    }
}
