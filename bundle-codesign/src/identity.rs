// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Locating code signing identities.

use {
    crate::{
        error::BundleCodesignError,
        process::{CommandInvocation, CommandRunner},
    },
    log::{debug, warn},
    once_cell::sync::Lazy,
    regex::Regex,
    std::fmt::Formatter,
};

/// Matches a `  1) 0123ABCD... "Developer ID Application: Org (TEAMID)"` line.
static FIND_IDENTITY_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)^\s*\d+\)\s+([0-9a-fA-F]+)\s+"([^"]+)""#)
        .expect("find-identity regex should compile")
});

/// A code signing identity installed on the machine.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct SigningIdentity {
    hash: String,
    name: String,
}

impl SigningIdentity {
    pub fn new(hash: impl ToString, name: impl ToString) -> Self {
        Self {
            hash: hash.to_string(),
            name: name.to_string(),
        }
    }

    /// SHA-1 fingerprint of the certificate, as hex.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Display name of the certificate.
    ///
    /// e.g. `Developer ID Application: Your Organization (1AB1234567)`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a user supplied selector refers to this identity.
    ///
    /// The selector matches if it equals the name, is a prefix of the name,
    /// or equals the certificate hash (ignoring case).
    pub fn matches(&self, selector: &str) -> bool {
        !selector.is_empty()
            && (self.name.starts_with(selector) || self.hash.eq_ignore_ascii_case(selector))
    }
}

impl std::fmt::Display for SigningIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{} ({})", self.name, self.hash))
    }
}

/// Provides the installed signing identities.
///
/// Implementations must return identities in a stable order: resolution picks
/// the first match.
pub trait IdentityLister {
    fn list_identities(&self) -> Result<Vec<SigningIdentity>, BundleCodesignError>;
}

/// A fixed list of identities.
impl IdentityLister for Vec<SigningIdentity> {
    fn list_identities(&self) -> Result<Vec<SigningIdentity>, BundleCodesignError> {
        Ok(self.clone())
    }
}

/// Lists identities through `security find-identity`.
pub struct SecurityIdentityLister<'a> {
    runner: &'a dyn CommandRunner,
    policy: String,
}

impl<'a> SecurityIdentityLister<'a> {
    /// Construct an instance listing valid identities for the `basic` policy.
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self {
            runner,
            policy: "basic".to_string(),
        }
    }

    /// Use a different `-p` policy (e.g. `codesigning`).
    pub fn policy(mut self, policy: impl ToString) -> Self {
        self.policy = policy.to_string();
        self
    }

    fn invocation(&self) -> CommandInvocation {
        CommandInvocation::new("security")
            .arg("find-identity")
            .arg("-p")
            .arg(&self.policy)
            .arg("-v")
    }
}

impl<'a> IdentityLister for SecurityIdentityLister<'a> {
    fn list_identities(&self) -> Result<Vec<SigningIdentity>, BundleCodesignError> {
        let output = self
            .runner
            .run(&self.invocation())?
            .into_checked("security")?;

        Ok(parse_find_identity_output(&output.stdout))
    }
}

/// Parse the output of `security find-identity`, preserving listing order.
pub fn parse_find_identity_output(text: &str) -> Vec<SigningIdentity> {
    FIND_IDENTITY_LINE
        .captures_iter(text)
        .map(|caps| SigningIdentity::new(&caps[1], &caps[2]))
        .collect()
}

/// Find the first identity matched by `selector`.
///
/// When several identities match, the first in listing order wins.
pub fn resolve_identity<'a>(
    identities: &'a [SigningIdentity],
    selector: &str,
) -> Option<&'a SigningIdentity> {
    debug!("searching for signing identity matching {:?}", selector);

    let found = identities.iter().find(|identity| identity.matches(selector));

    match found {
        Some(identity) => debug!("found signing identity {}", identity),
        None => warn!("did not find signing identity matching {:?}", selector),
    }

    found
}
