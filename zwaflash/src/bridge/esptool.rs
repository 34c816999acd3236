//! Bridge flashing through the external `esptool` program.

use crate::bridge::BridgeFlasher;
use crate::error::{Error, Result};
use log::{debug, info, trace};
use std::io::{self, Read, Write};
use std::process::{Child, ChildStdout, Command, Stdio};
use std::thread::{self, JoinHandle};

#[cfg(test)]
use mockall::automock;

/// Captured result of an external command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Whether the process exited successfully.
    pub success: bool,
    /// Standard output, lossily decoded.
    pub stdout: String,
    /// Standard error, lossily decoded.
    pub stderr: String,
}

/// A started external command whose output is read as it is produced.
pub trait RunningCommand: Send {
    /// Next non-empty stdout line, `None` once stdout is closed.
    ///
    /// Both `\n` and `\r` end a line, so overwritten progress lines arrive
    /// one by one.
    fn next_line(&mut self) -> Result<Option<String>>;

    /// Drain the remaining output and wait for the process to exit.
    fn wait(self: Box<Self>) -> Result<CommandOutput>;
}

/// Runs external programs.
#[cfg_attr(test, automock)]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` to completion.
    fn run(&self, program: &str, args: Vec<String>) -> Result<CommandOutput>;

    /// Start `program` with `args` and stream its stdout.
    fn spawn(&self, program: &str, args: Vec<String>) -> Result<Box<dyn RunningCommand>>;
}

/// Runs programs with `std::process::Command`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: Vec<String>) -> Result<CommandOutput> {
        debug!("Running {program} {}", args.join(" "));
        let output = Command::new(program)
            .args(&args)
            .output()
            .map_err(|e| Error::Tool(format!("Failed to execute {program}: {e}")))?;
        Ok(CommandOutput {
            success: output
                .status
                .success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn spawn(&self, program: &str, args: Vec<String>) -> Result<Box<dyn RunningCommand>> {
        debug!("Starting {program} {}", args.join(" "));
        let mut child = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Tool(format!("Failed to execute {program}: {e}")))?;

        // Drained on its own thread so a chatty stderr cannot stall stdout.
        let stderr = child
            .stderr
            .take()
            .map(|mut pipe| {
                thread::spawn(move || {
                    let mut bytes = Vec::new();
                    let _ = pipe.read_to_end(&mut bytes);
                    String::from_utf8_lossy(&bytes).into_owned()
                })
            });
        let stdout = child
            .stdout
            .take();

        Ok(Box::new(SystemProcess {
            child,
            stdout,
            stderr,
            pending: Vec::new(),
            captured: String::new(),
        }))
    }
}

struct SystemProcess {
    child: Child,
    stdout: Option<ChildStdout>,
    stderr: Option<JoinHandle<String>>,
    pending: Vec<u8>,
    captured: String,
}

impl SystemProcess {
    fn take_line(&mut self) -> Option<String> {
        while let Some(pos) = self
            .pending
            .iter()
            .position(|b| matches!(b, b'\n' | b'\r'))
        {
            let line: Vec<u8> = self
                .pending
                .drain(..=pos)
                .collect();
            let text = String::from_utf8_lossy(&line[..pos])
                .trim_end()
                .to_string();
            if !text.is_empty() {
                return Some(text);
            }
        }
        None
    }
}

impl RunningCommand for SystemProcess {
    fn next_line(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(line) = self.take_line() {
                self.captured
                    .push_str(&line);
                self.captured
                    .push('\n');
                return Ok(Some(line));
            }

            let Some(stdout) = self
                .stdout
                .as_mut()
            else {
                return Ok(None);
            };
            let mut chunk = [0u8; 512];
            match stdout.read(&mut chunk) {
                Ok(0) => {
                    self.stdout = None;
                    // Flush an unterminated last line.
                    self.pending
                        .push(b'\n');
                },
                Ok(n) => self
                    .pending
                    .extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn wait(mut self: Box<Self>) -> Result<CommandOutput> {
        while self
            .next_line()?
            .is_some()
        {}
        let status = self
            .child
            .wait()?;
        let stderr = self
            .stderr
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        Ok(CommandOutput {
            success: status.success(),
            stdout: std::mem::take(&mut self.captured),
            stderr,
        })
    }
}

/// Extract the percentage from an esptool `Writing at 0x... (NN %)` line.
pub fn parse_progress(line: &str) -> Option<u8> {
    let end = line.rfind(" %)")?;
    let start = line[..end].rfind('(')?;
    line[start + 1..end]
        .trim()
        .parse()
        .ok()
        .filter(|pct| *pct <= 100)
}

/// [`BridgeFlasher`] driving `esptool`.
pub struct EsptoolFlasher<R: CommandRunner = SystemRunner> {
    runner: R,
    program: String,
    port: String,
    baud_rate: u32,
}

impl EsptoolFlasher<SystemRunner> {
    /// Flasher for the ROM bootloader port `port`.
    pub fn new(program: impl Into<String>, port: impl Into<String>) -> Self {
        Self::with_runner(SystemRunner, program, port)
    }
}

impl<R: CommandRunner> EsptoolFlasher<R> {
    /// Flasher with an explicit runner.
    pub fn with_runner(runner: R, program: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            runner,
            program: program.into(),
            port: port.into(),
            baud_rate: 460_800,
        }
    }

    /// Set the transfer baud rate.
    #[must_use]
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    fn base_args(&self, before: &str, after: &str) -> Vec<String> {
        vec![
            "--chip".into(),
            "auto".into(),
            "--port".into(),
            self.port
                .clone(),
            "--baud".into(),
            self.baud_rate
                .to_string(),
            "--before".into(),
            before.into(),
            "--after".into(),
            after.into(),
        ]
    }

    fn check(&self, output: CommandOutput) -> Result<CommandOutput> {
        if !output.success {
            let detail = if output
                .stderr
                .trim()
                .is_empty()
            {
                output
                    .stdout
                    .trim()
            } else {
                output
                    .stderr
                    .trim()
            };
            return Err(Error::Tool(format!("{} failed: {detail}", self.program)));
        }
        Ok(output)
    }

    fn run(&self, args: Vec<String>) -> Result<CommandOutput> {
        let output = self
            .runner
            .run(&self.program, args)?;
        self.check(output)
    }
}

impl<R: CommandRunner> BridgeFlasher for EsptoolFlasher<R> {
    fn connect(&mut self) -> Result<()> {
        let mut args = self.base_args("no_reset", "no_reset");
        args.push("chip_id".into());
        let output = self.run(args)?;
        if let Some(line) = output
            .stdout
            .lines()
            .find(|l| l.starts_with("Chip is"))
        {
            info!("{}", line.trim());
        }
        Ok(())
    }

    fn write_flash(
        &mut self,
        offset: u32,
        data: &[u8],
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<()> {
        let mut image = tempfile::Builder::new()
            .prefix("zwaflash-bridge-")
            .suffix(".bin")
            .tempfile()?;
        image.write_all(data)?;
        image.flush()?;

        let mut args = self.base_args("no_reset", "no_reset");
        args.extend([
            "write_flash".to_string(),
            "-z".to_string(),
            "--flash_size".to_string(),
            "keep".to_string(),
            format!("0x{offset:X}"),
            image
                .path()
                .display()
                .to_string(),
        ]);

        info!("Writing {} bytes at 0x{offset:X}", data.len());
        let mut process = self
            .runner
            .spawn(&self.program, args)?;

        let total = data.len();
        while let Some(line) = process.next_line()? {
            match parse_progress(&line) {
                Some(pct) => progress(total * usize::from(pct) / 100, total),
                None => trace!("{}: {line}", self.program),
            }
        }
        self.check(process.wait()?)?;
        progress(total, total);
        Ok(())
    }

    fn reset_after(&mut self) -> Result<()> {
        let mut args = self.base_args("no_reset", "hard_reset");
        args.push("chip_id".into());
        self.run(args)?;
        debug!("Bridge hard reset issued");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn ok(stdout: &str) -> CommandOutput {
        CommandOutput {
            success: true,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    #[test]
    fn test_parse_progress() {
        assert_eq!(parse_progress("Writing at 0x00010000... (12 %)"), Some(12));
        assert_eq!(parse_progress("Writing at 0x00120000... (100 %)"), Some(100));
        assert_eq!(parse_progress("Hash of data verified."), None);
        assert_eq!(parse_progress("(abc %)"), None);
    }

    /// Process that hands out scripted stdout lines.
    struct ScriptedProcess {
        lines: VecDeque<String>,
        output: CommandOutput,
        exited: Arc<AtomicBool>,
    }

    impl ScriptedProcess {
        fn boxed(stdout: &str, success: bool, exited: &Arc<AtomicBool>) -> Box<dyn RunningCommand> {
            Box::new(Self {
                lines: stdout
                    .lines()
                    .map(str::to_string)
                    .collect(),
                output: CommandOutput {
                    success,
                    stdout: stdout.to_string(),
                    stderr: if success { String::new() } else { "A fatal error occurred: write failed".into() },
                },
                exited: Arc::clone(exited),
            })
        }
    }

    impl RunningCommand for ScriptedProcess {
        fn next_line(&mut self) -> Result<Option<String>> {
            Ok(self
                .lines
                .pop_front())
        }

        fn wait(self: Box<Self>) -> Result<CommandOutput> {
            self.exited
                .store(true, Ordering::SeqCst);
            Ok(self.output)
        }
    }

    #[test]
    fn test_write_flash_arguments_and_progress() {
        let exited = Arc::new(AtomicBool::new(false));
        let process_exited = Arc::clone(&exited);
        let mut runner = MockCommandRunner::new();
        runner
            .expect_spawn()
            .withf(|program, args| {
                program == "esptool"
                    && args.contains(&"write_flash".to_string())
                    && args.contains(&"-z".to_string())
                    && args.contains(&"keep".to_string())
                    && args.contains(&"0x0".to_string())
                    && args.contains(&"/dev/ttyACM1".to_string())
            })
            .times(1)
            .returning(move |_, _| {
                Ok(ScriptedProcess::boxed(
                    "Compressed 1000 bytes\nWriting at 0x00000000... (50 %)\nWriting at 0x00004000... (100 %)\n",
                    true,
                    &process_exited,
                ))
            });

        let mut flasher = EsptoolFlasher::with_runner(runner, "esptool", "/dev/ttyACM1");
        let mut seen = Vec::new();
        flasher
            .write_flash(0, &[0u8; 1000], &mut |w, t| seen.push((w, t, exited.load(Ordering::SeqCst))))
            .unwrap();

        assert_eq!(
            seen,
            vec![(500, 1000, false), (1000, 1000, false), (1000, 1000, true)]
        );
    }

    #[test]
    fn test_failed_write_is_tool_error() {
        let exited = Arc::new(AtomicBool::new(false));
        let process_exited = Arc::clone(&exited);
        let mut runner = MockCommandRunner::new();
        runner
            .expect_spawn()
            .returning(move |_, _| Ok(ScriptedProcess::boxed("Writing at 0x0... (10 %)\n", false, &process_exited)));

        let mut flasher = EsptoolFlasher::with_runner(runner, "esptool", "/dev/ttyACM1");
        let mut seen = Vec::new();
        let err = flasher
            .write_flash(0, &[0u8; 100], &mut |w, _| seen.push(w))
            .unwrap_err();
        assert!(matches!(err, Error::Tool(ref msg) if msg.contains("write failed")));
        assert_eq!(seen, vec![10]);
    }

    #[cfg(unix)]
    #[test]
    fn test_system_process_splits_carriage_returns() {
        let mut process = SystemRunner
            .spawn("sh", vec!["-c".into(), "printf 'a (5 %%)\\rb (60 %%)\\r\\ndone'".into()])
            .unwrap();
        let mut lines = Vec::new();
        while let Some(line) = process
            .next_line()
            .unwrap()
        {
            lines.push(line);
        }
        assert_eq!(lines, vec!["a (5 %)", "b (60 %)", "done"]);
        let output = process
            .wait()
            .unwrap();
        assert!(output.success);
        assert_eq!(output.stdout, "a (5 %)\nb (60 %)\ndone\n");
    }

    #[test]
    fn test_failed_run_is_tool_error() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .returning(|_, _| {
                Ok(CommandOutput {
                    success: false,
                    stdout: String::new(),
                    stderr: "A fatal error occurred: Failed to connect".into(),
                })
            });

        let mut flasher = EsptoolFlasher::with_runner(runner, "esptool", "/dev/ttyACM1");
        let err = flasher.connect().unwrap_err();
        assert!(matches!(err, Error::Tool(ref msg) if msg.contains("Failed to connect")));
    }

    #[test]
    fn test_reset_after_hard_resets() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|program, args| {
                program == "esptool"
                    && args
                        .windows(2)
                        .any(|w| w[0] == "--after" && w[1] == "hard_reset")
            })
            .times(1)
            .returning(|_, _| Ok(ok("")));

        let mut flasher = EsptoolFlasher::with_runner(runner, "esptool", "/dev/ttyACM1");
        flasher.reset_after().unwrap();
    }
}
