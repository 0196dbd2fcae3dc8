// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    crate::signer::SigningState,
    std::{path::PathBuf, time::Duration},
    thiserror::Error,
};

/// Broad classification of a [BundleCodesignError].
///
/// Callers (and the CLI) use this to decide how a failure is reported.
/// Configuration and format problems are always detected before the bundle
/// is mutated.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorCategory {
    /// Invalid bundle path, unknown identity, bad option value.
    Configuration,
    /// An invocation of the signing tool exited non-zero.
    Signing,
    /// Something on disk was missing or of the wrong type.
    Filesystem,
    /// Malformed or unsupported property list / option file data.
    Format,
    /// A helper process could not be run to completion.
    Process,
    /// The pipeline was driven out of sequence.
    Pipeline,
}

/// Unified error type for bundle signing.
#[derive(Debug, Error)]
pub enum BundleCodesignError {
    #[error("bundle path does not exist: {0}")]
    BundleNotFound(PathBuf),

    #[error("bundle path is not a directory: {0}")]
    BundleNotDirectory(PathBuf),

    #[error("bundle path {path} does not have required suffix {suffix}")]
    BundleBadSuffix { path: PathBuf, suffix: &'static str },

    #[error("no installed signing identity matches {0:?}")]
    IdentityNotFound(String),

    #[error("requested signing identity {requested:?} does not match resolved identity {resolved:?}")]
    IdentityMismatch { requested: String, resolved: String },

    #[error("invalid option: {0}")]
    InvalidOption(String),

    #[error("signing {path} failed (exit status {status:?}): {output}")]
    SigningFailure {
        path: PathBuf,
        status: Option<i32>,
        output: String,
    },

    #[error("signature verification of {path} failed: {output}")]
    VerificationFailure { path: PathBuf, output: String },

    #[error("required component does not exist: {0}")]
    ComponentMissing(PathBuf),

    #[error("component {path} is not a {expected}")]
    ComponentUnexpectedType { path: PathBuf, expected: &'static str },

    #[error("{inner} is nested in {outer} but would be signed after it")]
    SigningOrderViolation { inner: PathBuf, outer: PathBuf },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("error walking directory tree: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("bad discovery pattern: {0}")]
    GlobPattern(#[from] glob::PatternError),

    #[error("error evaluating discovery pattern: {0}")]
    Glob(#[from] glob::GlobError),

    #[error("error parsing plist XML: {0}")]
    PlistParseXml(plist::Error),

    #[error("error serializing plist to XML: {0}")]
    PlistSerializeXml(plist::Error),

    #[error("plist XML is not valid UTF-8: {0}")]
    PlistBadUtf8(#[from] std::string::FromUtf8Error),

    #[error("unsupported plist value type: {0}")]
    PlistUnsupportedValue(&'static str),

    #[error("{0} does not contain a plist dictionary")]
    PlistNotDictionary(PathBuf),

    #[error("key {key} in {path} is not a string")]
    PlistKeyNotString { path: PathBuf, key: String },

    #[error("error parsing runner options: {0}")]
    OptionsYaml(#[from] serde_yaml::Error),

    #[error("unable to run {program}: {source}")]
    CommandSpawn {
        program: String,
        source: std::io::Error,
    },

    #[error("{program} did not finish within {}s", .timeout.as_secs_f64())]
    CommandTimeout { program: String, timeout: Duration },

    #[error("{program} failed (exit status {status:?}): {output}")]
    CommandFailed {
        program: String,
        status: Option<i32>,
        output: String,
    },

    #[error("cannot run {stage} while pipeline is {state:?}")]
    StageOutOfOrder {
        stage: &'static str,
        state: SigningState,
    },
}

impl BundleCodesignError {
    /// Resolve the [ErrorCategory] of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::BundleNotFound(_)
            | Self::BundleNotDirectory(_)
            | Self::BundleBadSuffix { .. }
            | Self::IdentityNotFound(_)
            | Self::IdentityMismatch { .. }
            | Self::InvalidOption(_) => ErrorCategory::Configuration,
            Self::SigningFailure { .. } | Self::VerificationFailure { .. } => {
                ErrorCategory::Signing
            }
            Self::ComponentMissing(_)
            | Self::ComponentUnexpectedType { .. }
            | Self::SigningOrderViolation { .. }
            | Self::Io(_)
            | Self::Walk(_)
            | Self::GlobPattern(_)
            | Self::Glob(_) => ErrorCategory::Filesystem,
            Self::PlistParseXml(_)
            | Self::PlistSerializeXml(_)
            | Self::PlistBadUtf8(_)
            | Self::PlistUnsupportedValue(_)
            | Self::PlistNotDictionary(_)
            | Self::PlistKeyNotString { .. }
            | Self::OptionsYaml(_) => ErrorCategory::Format,
            Self::CommandSpawn { .. } | Self::CommandTimeout { .. } | Self::CommandFailed { .. } => {
                ErrorCategory::Process
            }
            Self::StageOutOfOrder { .. } => ErrorCategory::Pipeline,
        }
    }
}
