// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Interface to Apple's `codesign` and `xattr` tools. */

use {
    crate::{
        error::BundleCodesignError,
        process::{CommandInvocation, CommandRunner},
    },
    log::{info, warn},
    std::{
        path::{Path, PathBuf},
        time::Duration,
    },
};

/// Describes how a secure timestamp is requested during signing.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TimestampServer {
    /// Apple's default timestamp server.
    ///
    /// Corresponds to the bare `--timestamp` flag.
    Default,

    /// A custom timestamp server.
    ///
    /// Corresponds to `--timestamp=URL`.
    Url(String),
}

/// Represents an invocation of `codesign --sign` against a single path.
#[derive(Clone, Debug)]
pub struct CodesignInvocation {
    identity: String,
    target: PathBuf,
    force: bool,
    timestamp_server: Option<TimestampServer>,
    hardened_runtime: bool,
    entitlements: Option<PathBuf>,
    timeout: Option<Duration>,
    stream_output: bool,
}

impl CodesignInvocation {
    /// Construct a new instance signing `target` with the identity `identity`.
    ///
    /// `identity` is anything `codesign --sign` accepts. We always pass the
    /// certificate hash.
    pub fn new(identity: impl ToString, target: impl AsRef<Path>) -> Self {
        Self {
            identity: identity.to_string(),
            target: target.as_ref().to_path_buf(),
            force: false,
            timestamp_server: None,
            hardened_runtime: false,
            entitlements: None,
            timeout: None,
            stream_output: false,
        }
    }

    /// Replace an existing signature.
    ///
    /// Activates the `--force` flag.
    pub fn force(&mut self) -> &mut Self {
        self.force = true;
        self
    }

    /// Request a secure timestamp.
    pub fn timestamp_server(&mut self, server: TimestampServer) -> &mut Self {
        self.timestamp_server = Some(server);
        self
    }

    /// Enable the hardened runtime.
    ///
    /// Passes `--options runtime`.
    pub fn hardened_runtime(&mut self) -> &mut Self {
        self.hardened_runtime = true;
        self
    }

    /// Embed entitlements read from a plist file.
    pub fn entitlements(&mut self, path: impl AsRef<Path>) -> &mut Self {
        self.entitlements = Some(path.as_ref().to_path_buf());
        self
    }

    /// Bound how long `codesign` may run.
    pub fn timeout(&mut self, timeout: Option<Duration>) -> &mut Self {
        self.timeout = timeout;
        self
    }

    /// Log `codesign` output as it is produced.
    pub fn stream_output(&mut self, stream: bool) -> &mut Self {
        self.stream_output = stream;
        self
    }

    /// The path being signed.
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Arguments passed to `codesign`, not including the program name.
    pub fn arguments(&self) -> Vec<String> {
        let mut args = vec!["--verbose".to_string()];

        if self.force {
            args.push("--force".to_string());
        }

        match &self.timestamp_server {
            Some(TimestampServer::Default) => {
                args.push("--timestamp".to_string());
            }
            Some(TimestampServer::Url(url)) => {
                args.push(format!("--timestamp={}", url));
            }
            None => {}
        }

        args.push("--sign".to_string());
        args.push(self.identity.clone());

        if self.hardened_runtime {
            args.push("--options".to_string());
            args.push("runtime".to_string());
        }

        if let Some(path) = &self.entitlements {
            args.push("--entitlements".to_string());
            args.push(path.display().to_string());
        }

        args.push(self.target.display().to_string());

        args
    }

    fn invocation(&self) -> CommandInvocation {
        CommandInvocation::new("codesign")
            .args(self.arguments())
            .timeout(self.timeout)
            .stream_output(self.stream_output)
    }

    /// Run `codesign` with requested options.
    ///
    /// A non-zero exit is turned into [BundleCodesignError::SigningFailure]
    /// carrying the tool's diagnostics.
    pub fn run(&self, runner: &dyn CommandRunner) -> Result<(), BundleCodesignError> {
        let output = runner.run(&self.invocation())?;

        if output.success() {
            Ok(())
        } else {
            let diagnostics = output.diagnostics();
            warn!("codesign error: {}", diagnostics);

            Err(BundleCodesignError::SigningFailure {
                path: self.target.clone(),
                status: output.status,
                output: diagnostics,
            })
        }
    }
}

/// Remove the embedded signature from `path`.
///
/// Returns whether a signature was removed. An unsigned object is not an
/// error.
pub fn remove_signature(
    runner: &dyn CommandRunner,
    path: &Path,
) -> Result<bool, BundleCodesignError> {
    let invocation = CommandInvocation::new("codesign")
        .arg("--remove-signature")
        .arg(path.display());

    let output = runner.run(&invocation)?;

    if output.success() {
        Ok(true)
    } else if output.diagnostics().contains("not signed") {
        info!("{} is not signed; nothing to remove", path.display());
        Ok(false)
    } else {
        Err(BundleCodesignError::SigningFailure {
            path: path.to_path_buf(),
            status: output.status,
            output: output.diagnostics(),
        })
    }
}

/// Recursively clear extended attributes on every file under `path`.
///
/// Files without extended attributes are left alone, so this can be run
/// any number of times.
pub fn remove_extended_attributes(
    runner: &dyn CommandRunner,
    path: &Path,
) -> Result<(), BundleCodesignError> {
    let invocation = CommandInvocation::new("xattr")
        .arg("-cr")
        .arg(path.display());

    runner.run(&invocation)?.into_checked("xattr")?;

    Ok(())
}

/// Verify the signature of `path` and everything nested in it.
pub fn verify_signature(
    runner: &dyn CommandRunner,
    path: &Path,
) -> Result<(), BundleCodesignError> {
    let invocation = CommandInvocation::new("codesign")
        .args(["--verify", "--deep", "--strict", "--verbose=2"])
        .arg(path.display());

    let output = runner.run(&invocation)?;

    if output.success() {
        info!("{} has a valid signature", path.display());
        Ok(())
    } else {
        Err(BundleCodesignError::VerificationFailure {
            path: path.to_path_buf(),
            output: output.diagnostics(),
        })
    }
}
