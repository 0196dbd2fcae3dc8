// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Running external programs.

Everything this crate does to a bundle on disk beyond plain file edits goes
through Apple's command line tools (`codesign`, `xattr`, `security`). Those
invocations are funneled through the [CommandRunner] trait so the signing
pipeline can be driven against a recording implementation in tests and a
no-op implementation in dry-run mode.
*/

use {
    crate::error::BundleCodesignError,
    log::{info, warn},
    std::{
        fmt::Formatter,
        io::{BufRead, BufReader},
        sync::{mpsc, Arc},
        time::{Duration, Instant},
    },
};

/// How often a running child is polled when a timeout is in effect.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Describes a single invocation of an external program.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
    stream_output: bool,
}

impl CommandInvocation {
    /// Construct a new invocation of the named program without arguments.
    pub fn new(program: impl ToString) -> Self {
        Self {
            program: program.to_string(),
            args: vec![],
            timeout: None,
            stream_output: false,
        }
    }

    /// Append a single argument.
    pub fn arg(mut self, arg: impl ToString) -> Self {
        self.args.push(arg.to_string());
        self
    }

    /// Append several arguments.
    pub fn args(mut self, args: impl IntoIterator<Item = impl ToString>) -> Self {
        self.args.extend(args.into_iter().map(|x| x.to_string()));
        self
    }

    /// Bound the wall-clock time the process may run for.
    ///
    /// `None` (the default) waits indefinitely.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Log the process output line by line while it runs.
    ///
    /// When streaming, stderr is merged into stdout.
    pub fn stream_output(mut self, stream: bool) -> Self {
        self.stream_output = stream;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// The full argument vector, program first.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    pub fn timeout_value(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn is_streaming(&self) -> bool {
        self.stream_output
    }
}

impl std::fmt::Display for CommandInvocation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.program)?;

        for arg in &self.args {
            if arg.contains(' ') {
                f.write_fmt(format_args!(" \"{}\"", arg))?;
            } else {
                f.write_fmt(format_args!(" {}", arg))?;
            }
        }

        Ok(())
    }
}

/// The result of a process that ran to completion.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code. `None` if the process was terminated by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Construct a successful output with the given stdout.
    pub fn success_with_stdout(stdout: impl ToString) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    /// Construct a failed output with the given exit code and stderr.
    pub fn failure(status: i32, stderr: impl ToString) -> Self {
        Self {
            status: Some(status),
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Diagnostic text of the process: stderr if present, otherwise stdout.
    pub fn diagnostics(&self) -> String {
        if self.stderr.trim().is_empty() {
            self.stdout.trim().to_string()
        } else {
            self.stderr.trim().to_string()
        }
    }

    /// Convert a non-zero exit into [BundleCodesignError::CommandFailed].
    pub fn into_checked(self, program: &str) -> Result<Self, BundleCodesignError> {
        if self.success() {
            Ok(self)
        } else {
            Err(BundleCodesignError::CommandFailed {
                program: program.to_string(),
                status: self.status,
                output: self.diagnostics(),
            })
        }
    }
}

/// Runs external programs.
///
/// Implementations block until the program exits. A non-zero exit is not an
/// error at this layer: it is reported through [CommandOutput::status] and
/// interpreted by the caller.
pub trait CommandRunner {
    fn run(&self, invocation: &CommandInvocation) -> Result<CommandOutput, BundleCodesignError>;
}

/// A [CommandRunner] that spawns real processes via `duct`.
#[derive(Clone, Copy, Debug, Default)]
pub struct DuctCommandRunner;

impl DuctCommandRunner {
    fn spawn_error(invocation: &CommandInvocation, source: std::io::Error) -> BundleCodesignError {
        BundleCodesignError::CommandSpawn {
            program: invocation.program.clone(),
            source,
        }
    }

    fn timed_out(invocation: &CommandInvocation, timeout: Duration) -> BundleCodesignError {
        BundleCodesignError::CommandTimeout {
            program: invocation.program.clone(),
            timeout,
        }
    }

    fn run_captured(
        &self,
        invocation: &CommandInvocation,
    ) -> Result<CommandOutput, BundleCodesignError> {
        let handle = duct::cmd(&invocation.program, &invocation.args)
            .stdout_capture()
            .stderr_capture()
            .unchecked()
            .start()
            .map_err(|e| Self::spawn_error(invocation, e))?;

        let output = if let Some(timeout) = invocation.timeout_value() {
            let start_time = Instant::now();

            loop {
                if let Some(output) = handle
                    .try_wait()
                    .map_err(|e| Self::spawn_error(invocation, e))?
                {
                    break output.clone();
                }

                if start_time.elapsed() >= timeout {
                    warn!("killing {} after {}s", invocation.program, timeout.as_secs_f64());
                    handle
                        .kill()
                        .map_err(|e| Self::spawn_error(invocation, e))?;
                    return Err(Self::timed_out(invocation, timeout));
                }

                std::thread::sleep(POLL_INTERVAL);
            }
        } else {
            handle
                .wait()
                .map_err(|e| Self::spawn_error(invocation, e))?
                .clone()
        };

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    // Lines are read on a helper thread so a child that goes silent is still
    // killed once the timeout expires.
    fn run_streaming(
        &self,
        invocation: &CommandInvocation,
    ) -> Result<CommandOutput, BundleCodesignError> {
        let reader = Arc::new(
            duct::cmd(&invocation.program, &invocation.args)
                .stderr_to_stdout()
                .unchecked()
                .reader()
                .map_err(|e| Self::spawn_error(invocation, e))?,
        );

        let (tx, rx) = mpsc::channel();
        let thread_reader = reader.clone();
        std::thread::spawn(move || {
            for line in BufReader::new(&*thread_reader).lines() {
                let failed = line.is_err();

                if tx.send(line).is_err() || failed {
                    break;
                }
            }
        });

        let start_time = Instant::now();
        let mut stdout = String::new();

        loop {
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(line) => {
                    let line = line.map_err(|e| Self::spawn_error(invocation, e))?;
                    info!("{}> {}", invocation.program, line);
                    stdout.push_str(&line);
                    stdout.push('\n');
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }

            if let Some(timeout) = invocation.timeout_value() {
                if start_time.elapsed() >= timeout {
                    warn!("killing {} after {}s", invocation.program, timeout.as_secs_f64());
                    reader
                        .kill()
                        .map_err(|e| Self::spawn_error(invocation, e))?;
                    return Err(Self::timed_out(invocation, timeout));
                }
            }
        }

        let output = reader
            .try_wait()
            .map_err(|e| Self::spawn_error(invocation, e))?
            .ok_or_else(|| {
                Self::spawn_error(
                    invocation,
                    std::io::Error::new(std::io::ErrorKind::Other, "unable to wait on command"),
                )
            })?;

        Ok(CommandOutput {
            status: output.status.code(),
            stdout,
            stderr: String::new(),
        })
    }
}

impl CommandRunner for DuctCommandRunner {
    fn run(&self, invocation: &CommandInvocation) -> Result<CommandOutput, BundleCodesignError> {
        info!("running {}", invocation);

        if invocation.is_streaming() {
            self.run_streaming(invocation)
        } else {
            self.run_captured(invocation)
        }
    }
}

/// A [CommandRunner] that only logs what it would run.
///
/// Every invocation reports success with empty output.
#[derive(Clone, Copy, Debug, Default)]
pub struct DryRunCommandRunner;

impl CommandRunner for DryRunCommandRunner {
    fn run(&self, invocation: &CommandInvocation) -> Result<CommandOutput, BundleCodesignError> {
        warn!("dry run: would run {}", invocation);

        Ok(CommandOutput::success_with_stdout(""))
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::error::ErrorCategory};

    #[test]
    fn invocation_argv_and_display() {
        let invocation = CommandInvocation::new("codesign")
            .arg("--sign")
            .arg("ABCDEF")
            .args(["My App.app"]);

        assert_eq!(
            invocation.argv(),
            vec!["codesign", "--sign", "ABCDEF", "My App.app"]
        );
        assert_eq!(
            format!("{}", invocation),
            "codesign --sign ABCDEF \"My App.app\""
        );
    }

    #[test]
    fn output_diagnostics_prefers_stderr() {
        let mut output = CommandOutput::success_with_stdout("stdout text\n");
        assert_eq!(output.diagnostics(), "stdout text");

        output.stderr = "stderr text\n".into();
        assert_eq!(output.diagnostics(), "stderr text");
    }

    #[test]
    fn into_checked_translates_failure() {
        let err = CommandOutput::failure(2, "boom")
            .into_checked("xattr")
            .unwrap_err();

        assert!(matches!(
            &err,
            BundleCodesignError::CommandFailed { program, status: Some(2), output }
                if program == "xattr" && output == "boom"
        ));
        assert_eq!(err.category(), ErrorCategory::Process);
    }

    #[test]
    fn dry_run_never_fails() -> anyhow::Result<()> {
        let output = DryRunCommandRunner.run(&CommandInvocation::new("does-not-exist"))?;
        assert!(output.success());

        Ok(())
    }

    #[test]
    fn duct_captures_streams_and_status() -> anyhow::Result<()> {
        if cfg!(target_family = "windows") {
            eprintln!("skipping test because it requires a POSIX shell");
            return Ok(());
        }

        let invocation = CommandInvocation::new("sh")
            .arg("-c")
            .arg("echo out; echo err 1>&2; exit 3");
        let output = DuctCommandRunner.run(&invocation)?;

        assert_eq!(output.status, Some(3));
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert!(!output.success());

        Ok(())
    }

    #[test]
    fn duct_streaming_merges_stderr() -> anyhow::Result<()> {
        if cfg!(target_family = "windows") {
            eprintln!("skipping test because it requires a POSIX shell");
            return Ok(());
        }

        let invocation = CommandInvocation::new("sh")
            .arg("-c")
            .arg("echo one; echo two 1>&2")
            .stream_output(true);
        let output = DuctCommandRunner.run(&invocation)?;

        assert!(output.success());
        assert!(output.stdout.contains("one\n"));
        assert!(output.stdout.contains("two\n"));

        Ok(())
    }

    #[test]
    fn duct_timeout_kills_child() {
        if cfg!(target_family = "windows") {
            eprintln!("skipping test because it requires a POSIX shell");
            return;
        }

        let invocation = CommandInvocation::new("sleep")
            .arg("5")
            .timeout(Some(Duration::from_millis(100)));

        let start = Instant::now();
        let err = DuctCommandRunner.run(&invocation).unwrap_err();

        assert!(matches!(err, BundleCodesignError::CommandTimeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn duct_streaming_timeout_kills_silent_child() {
        if cfg!(target_family = "windows") {
            eprintln!("skipping test because it requires a POSIX shell");
            return;
        }

        let invocation = CommandInvocation::new("sleep")
            .arg("5")
            .stream_output(true)
            .timeout(Some(Duration::from_millis(100)));

        let start = Instant::now();
        let err = DuctCommandRunner.run(&invocation).unwrap_err();

        assert!(matches!(err, BundleCodesignError::CommandTimeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn duct_missing_program_is_spawn_error() {
        let err = DuctCommandRunner
            .run(&CommandInvocation::new("bundle-codesign-no-such-program"))
            .unwrap_err();

        assert!(matches!(err, BundleCodesignError::CommandSpawn { .. }));
        assert_eq!(err.category(), ErrorCategory::Process);
    }
}
