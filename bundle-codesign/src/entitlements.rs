// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Entitlements handling.

Entitlements are handed to `codesign` as an XML plist file. [EntitlementsFile]
owns such a file inside a private temporary directory which is deleted when
the value is dropped, including when signing fails part way.
*/

use {
    crate::{error::BundleCodesignError, plist_codec},
    log::debug,
    plist::{Dictionary, Value},
    std::path::{Path, PathBuf},
};

/// Hardened runtime entitlements granted to hardened components by default.
///
/// See <https://developer.apple.com/documentation/security/hardened_runtime>.
pub const DEFAULT_HARDENED_RUNTIME_ENTITLEMENTS: &[&str] = &[
    "com.apple.security.smartcard",
    "com.apple.security.automation.apple-events",
    "com.apple.security.cs.allow-dyld-environment-variables",
    "com.apple.security.cs.allow-jit",
    "com.apple.security.cs.allow-unsigned-executable-memory",
    "com.apple.security.cs.debugger",
    "com.apple.security.cs.disable-executable-page-protection",
    "com.apple.security.cs.disable-library-validation",
    "com.apple.security.get-task-allow",
    "com.apple.security.device.audio-input",
    "com.apple.security.device.camera",
    "com.apple.security.personal-information.photos-library",
    "com.apple.security.personal-information.location",
    "com.apple.security.personal-information.addressbook",
    "com.apple.security.personal-information.calendars",
];

/// Obtain the default entitlements set.
///
/// Every key in [DEFAULT_HARDENED_RUNTIME_ENTITLEMENTS] maps to `true`.
pub fn default_entitlements() -> Dictionary {
    DEFAULT_HARDENED_RUNTIME_ENTITLEMENTS
        .iter()
        .map(|key| (key.to_string(), Value::Boolean(true)))
        .collect()
}

/// An entitlements plist written to a temporary location.
pub struct EntitlementsFile {
    // Held for its Drop.
    _temp_dir: tempfile::TempDir,
    path: PathBuf,
}

impl EntitlementsFile {
    /// Write entitlements to a new temporary file.
    pub fn create(entitlements: &Dictionary) -> Result<Self, BundleCodesignError> {
        let xml = plist_codec::encode(&Value::Dictionary(entitlements.clone()))?;

        let temp_dir = tempfile::Builder::new()
            .prefix("bundle-codesign-")
            .tempdir()?;
        let path = temp_dir.path().join("entitlements.plist");
        std::fs::write(&path, &xml)?;

        debug!("wrote entitlements to {}:\n{}", path.display(), xml);

        Ok(Self {
            _temp_dir: temp_dir,
            path,
        })
    }

    /// Path of the entitlements plist.
    pub fn path(&self) -> &Path {
        &self.path
    }
}
