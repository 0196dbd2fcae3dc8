// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Signing configuration.

use {
    crate::{
        bundle::Bundle,
        codesign::TimestampServer,
        component::ComponentCategory,
        entitlements::default_entitlements,
        error::BundleCodesignError,
        identity::{resolve_identity, IdentityLister, SigningIdentity},
        plist_codec,
    },
    log::{debug, info},
    plist::{Dictionary, Value},
    serde::{Deserialize, Serialize},
    std::{
        path::{Path, PathBuf},
        time::Duration,
    },
};

/// Identity selector used when none is configured.
pub const DEFAULT_IDENTITY_SELECTOR: &str = "Developer ID Application";

/// Usage description keys that must be present before the root is signed.
const DEFAULT_USAGE_DESCRIPTION_KEYS: &[&str] = &[
    "NSAppleEventsUsageDescription",
    "NSCalendarsUsageDescription",
    "NSContactsUsageDescription",
    "NSRemindersUsageDescription",
    "NSCameraUsageDescription",
    "NSMicrophoneUsageDescription",
    "NSLocationUsageDescription",
    "NSPhotoLibraryUsageDescription",
    "NSSystemAdministrationUsageDescription",
];

/// Settings controlling a single signing run.
///
/// Every field has a default, so an options file only needs to name what it
/// changes.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct RunnerOptions {
    /// Delete `*.cstemp` files left behind by interrupted `codesign` runs.
    pub remove_temp_files: bool,
    /// Strip extended attributes and the root signature before signing.
    pub pre_cleanup: bool,
    /// Delete the embedded scripting runtime instead of signing it.
    pub remove_scripting_runtime: bool,
    /// Delete `Plugins` directories of internal components.
    pub remove_component_plugins: bool,
    /// Move plugin `manifest.json` files into `Contents/Resources`.
    pub move_plugin_manifest: bool,
    /// Component categories to sign. Always processed in signing order.
    pub categories: Vec<ComponentCategory>,
    /// Request a secure timestamp for every signature.
    pub timestamp: bool,
    /// Timestamp server to use instead of Apple's.
    pub timestamp_url: Option<String>,
    pub lowercase_executable_name: bool,
    /// Verify the bundle signature at the end of the run.
    pub verify: bool,
    /// Log mutations instead of performing them.
    pub dry_run: bool,
    pub stream_output: bool,
    /// Wall-clock bound for every external command.
    pub command_timeout_secs: Option<u64>,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            remove_temp_files: true,
            pre_cleanup: true,
            remove_scripting_runtime: true,
            remove_component_plugins: false,
            move_plugin_manifest: false,
            categories: ComponentCategory::ALL.to_vec(),
            timestamp: true,
            timestamp_url: None,
            lowercase_executable_name: true,
            verify: true,
            dry_run: false,
            stream_output: false,
            command_timeout_secs: None,
        }
    }
}

impl RunnerOptions {
    /// Parse options from YAML text.
    pub fn from_yaml_str(text: &str) -> Result<Self, BundleCodesignError> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Parse options from a YAML file.
    pub fn from_yaml_path(path: &Path) -> Result<Self, BundleCodesignError> {
        let text = std::fs::read_to_string(path)?;

        Self::from_yaml_str(&text)
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_secs.map(Duration::from_secs)
    }

    /// How secure timestamps are requested, if at all.
    pub fn timestamp_server(&self) -> Option<TimestampServer> {
        match (self.timestamp, &self.timestamp_url) {
            (false, _) => None,
            (true, Some(url)) => Some(TimestampServer::Url(url.clone())),
            (true, None) => Some(TimestampServer::Default),
        }
    }

    /// Check option values and put categories in signing order.
    fn normalized(&self) -> Result<Self, BundleCodesignError> {
        if self.command_timeout_secs == Some(0) {
            return Err(BundleCodesignError::InvalidOption(
                "command-timeout-secs must be greater than 0".into(),
            ));
        }

        match &self.timestamp_url {
            Some(_) if !self.timestamp => {
                return Err(BundleCodesignError::InvalidOption(
                    "timestamp-url requires timestamp to be enabled".into(),
                ));
            }
            Some(url) if url.trim().is_empty() => {
                return Err(BundleCodesignError::InvalidOption(
                    "timestamp-url must not be empty".into(),
                ));
            }
            _ => {}
        }

        let mut res = self.clone();
        res.categories.sort();
        res.categories.dedup();

        Ok(res)
    }
}

/// Configuration of a signing run, as supplied by the caller.
///
/// Nothing is checked until [CodesignConfig::validate].
#[derive(Clone, Debug)]
pub struct CodesignConfig {
    bundle_path: PathBuf,
    identity: Option<String>,
    hardened_runtime: bool,
    entitlements: Dictionary,
    info_plist_keys: Dictionary,
    options: RunnerOptions,
}

impl CodesignConfig {
    /// Construct an instance signing the bundle at `bundle_path` with defaults.
    pub fn new(bundle_path: impl AsRef<Path>) -> Self {
        Self {
            bundle_path: bundle_path.as_ref().to_path_buf(),
            identity: None,
            hardened_runtime: true,
            entitlements: Dictionary::new(),
            info_plist_keys: Dictionary::new(),
            options: RunnerOptions::default(),
        }
    }

    pub fn bundle_path(&self) -> &Path {
        &self.bundle_path
    }

    /// The explicitly requested identity selector, if any.
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// Request a signing identity by name, name prefix or certificate hash.
    ///
    /// An empty value means automatic selection.
    pub fn set_identity(&mut self, identity: impl ToString) {
        let identity = identity.to_string();

        self.identity = if identity.is_empty() {
            None
        } else {
            Some(identity)
        };
    }

    /// The selector used for identity resolution.
    pub fn identity_selector(&self) -> &str {
        self.identity.as_deref().unwrap_or(DEFAULT_IDENTITY_SELECTOR)
    }

    pub fn hardened_runtime(&self) -> bool {
        self.hardened_runtime
    }

    /// Set whether hardened components and the root get `--options runtime`.
    pub fn set_hardened_runtime(&mut self, value: bool) {
        self.hardened_runtime = value;
    }

    /// Entitlements merged over the defaults.
    pub fn entitlement_overrides(&self) -> &Dictionary {
        &self.entitlements
    }

    pub fn set_entitlement_overrides(&mut self, entitlements: Dictionary) {
        self.entitlements = entitlements;
    }

    /// Add or replace a single entitlement.
    pub fn add_entitlement(&mut self, key: impl ToString, value: impl Into<Value>) {
        self.entitlements.insert(key.to_string(), value.into());
    }

    /// Read entitlement overrides from an XML plist file.
    pub fn set_entitlements_file(&mut self, path: &Path) -> Result<(), BundleCodesignError> {
        let text = std::fs::read_to_string(path)?;
        self.entitlements = plist_codec::decode_dictionary(&text, path)?;

        Ok(())
    }

    /// `Info.plist` keys merged over [Self::default_info_plist_properties].
    pub fn info_plist_overrides(&self) -> &Dictionary {
        &self.info_plist_keys
    }

    pub fn set_info_plist_overrides(&mut self, keys: Dictionary) {
        self.info_plist_keys = keys;
    }

    /// Read `Info.plist` overrides from an XML plist file.
    pub fn set_info_plist_overrides_file(
        &mut self,
        path: &Path,
    ) -> Result<(), BundleCodesignError> {
        let text = std::fs::read_to_string(path)?;
        self.info_plist_keys = plist_codec::decode_dictionary(&text, path)?;

        Ok(())
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut RunnerOptions {
        &mut self.options
    }

    pub fn set_options(&mut self, options: RunnerOptions) {
        self.options = options;
    }

    /// Keys written into the root `Info.plist` when no overrides are given.
    ///
    /// Usage descriptions cannot be added once the bundle is signed, so they
    /// are always present, if empty.
    pub fn default_info_plist_properties() -> Dictionary {
        let mut dict = Dictionary::new();
        dict.insert(
            "NSRequiresAquaSystemAppearance".to_string(),
            Value::String("NO".to_string()),
        );

        for key in DEFAULT_USAGE_DESCRIPTION_KEYS {
            dict.insert(key.to_string(), Value::String(String::new()));
        }

        dict
    }

    /// The entitlements granted to hardened components.
    pub fn entitlements(&self) -> Dictionary {
        plist_codec::merge(&default_entitlements(), &self.entitlements)
    }

    /// The keys merged into the root `Info.plist` during finalization.
    pub fn info_plist_properties(&self) -> Dictionary {
        plist_codec::merge(&Self::default_info_plist_properties(), &self.info_plist_keys)
    }

    /// Find the first installed identity matching `candidate`.
    pub fn resolve_identity(
        &self,
        lister: &dyn IdentityLister,
        candidate: &str,
    ) -> Result<Option<SigningIdentity>, BundleCodesignError> {
        let identities = lister.list_identities()?;

        Ok(resolve_identity(&identities, candidate).cloned())
    }

    /// Validate this configuration for signing.
    ///
    /// Nothing on disk is modified. On success, everything the signing run
    /// needs is resolved and captured in the returned value.
    pub fn validate(
        &self,
        lister: &dyn IdentityLister,
    ) -> Result<ValidatedConfig, BundleCodesignError> {
        debug!("validating configuration for {}", self.bundle_path.display());

        let options = self.options.normalized()?;
        let bundle = Bundle::new_app_from_path(&self.bundle_path)?;

        // Surface format problems now rather than half way through a run.
        bundle.info_plist()?;
        let entitlements = self.entitlements();
        plist_codec::encode(&Value::Dictionary(entitlements.clone()))?;
        let info_plist_properties = self.info_plist_properties();
        plist_codec::encode(&Value::Dictionary(info_plist_properties.clone()))?;

        let selector = self.identity_selector();
        let identity = self
            .resolve_identity(lister, selector)?
            .ok_or_else(|| BundleCodesignError::IdentityNotFound(selector.to_string()))?;

        if let Some(requested) = &self.identity {
            if !identity.matches(requested) {
                return Err(BundleCodesignError::IdentityMismatch {
                    requested: requested.clone(),
                    resolved: identity.to_string(),
                });
            }
        }

        debug!("hardened runtime entitlements: {:?}", entitlements);
        debug!("Info.plist properties to merge: {:?}", info_plist_properties);
        info!("signing {} with {}", bundle.name(), identity);

        Ok(ValidatedConfig {
            bundle,
            identity,
            hardened_runtime: self.hardened_runtime,
            entitlements,
            info_plist_properties,
            options,
        })
    }
}

/// A configuration that passed [CodesignConfig::validate].
#[derive(Debug)]
pub struct ValidatedConfig {
    bundle: Bundle,
    identity: SigningIdentity,
    hardened_runtime: bool,
    entitlements: Dictionary,
    info_plist_properties: Dictionary,
    options: RunnerOptions,
}

impl ValidatedConfig {
    pub fn bundle(&self) -> &Bundle {
        &self.bundle
    }

    pub fn bundle_mut(&mut self) -> &mut Bundle {
        &mut self.bundle
    }

    pub fn identity(&self) -> &SigningIdentity {
        &self.identity
    }

    pub fn hardened_runtime(&self) -> bool {
        self.hardened_runtime
    }

    pub fn entitlements(&self) -> &Dictionary {
        &self.entitlements
    }

    pub fn info_plist_properties(&self) -> &Dictionary {
        &self.info_plist_properties
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{error::ErrorCategory, testutil::*},
        indoc::indoc,
    };

    fn identities() -> Vec<SigningIdentity> {
        vec![
            SigningIdentity::new("AAAA", "Apple Development: Jane Doe (ABCDE12345)"),
            SigningIdentity::new("BBBB", "Developer ID Application: Example Org (1AB1234567)"),
            SigningIdentity::new("CCCC", "Developer ID Application: Other Org (9ZY9876543)"),
        ]
    }

    #[test]
    fn options_defaults() {
        let options = RunnerOptions::default();

        assert!(options.remove_temp_files);
        assert!(options.pre_cleanup);
        assert!(!options.move_plugin_manifest);
        assert_eq!(options.categories, ComponentCategory::ALL.to_vec());
        assert_eq!(options.timestamp_server(), Some(TimestampServer::Default));
        assert_eq!(options.command_timeout(), None);
    }

    #[test]
    fn options_from_yaml() -> anyhow::Result<()> {
        let options = RunnerOptions::from_yaml_str(indoc! {"
            remove-temp-files: false
            categories:
              - frameworks
              - plugins
            timestamp-url: http://timestamp.example.com
            command-timeout-secs: 600
        "})?;

        assert!(!options.remove_temp_files);
        assert!(options.pre_cleanup);
        assert_eq!(
            options.timestamp_server(),
            Some(TimestampServer::Url("http://timestamp.example.com".into()))
        );
        assert_eq!(options.command_timeout(), Some(Duration::from_secs(600)));

        let normalized = options.normalized()?;
        assert_eq!(
            normalized.categories,
            vec![ComponentCategory::Plugins, ComponentCategory::Frameworks]
        );

        Ok(())
    }

    #[test]
    fn options_rejects_unknown() {
        let err = RunnerOptions::from_yaml_str("sign-everything: true\n").unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Format);

        let err = RunnerOptions::from_yaml_str("categories: [widgets]\n").unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Format);
    }

    #[test]
    fn options_invalid_values() {
        let options = RunnerOptions {
            command_timeout_secs: Some(0),
            ..Default::default()
        };
        assert!(matches!(
            options.normalized(),
            Err(BundleCodesignError::InvalidOption(_))
        ));

        let options = RunnerOptions {
            timestamp: false,
            timestamp_url: Some("http://ts.example.com".into()),
            ..Default::default()
        };
        assert!(matches!(
            options.normalized(),
            Err(BundleCodesignError::InvalidOption(_))
        ));
    }

    #[test]
    fn default_properties() {
        let config = CodesignConfig::new("/tmp/App.app");

        let properties = config.info_plist_properties();
        assert_eq!(properties.len(), 10);
        assert_eq!(
            properties.get("NSRequiresAquaSystemAppearance"),
            Some(&Value::String("NO".into()))
        );
        assert_eq!(
            properties.get("NSCameraUsageDescription"),
            Some(&Value::String(String::new()))
        );
        assert_eq!(config.entitlements(), default_entitlements());
    }

    #[test]
    fn overrides_merge_over_defaults() {
        let mut config = CodesignConfig::new("/tmp/App.app");
        config.add_entitlement("com.apple.security.cs.debugger", false);
        config.add_entitlement("com.apple.security.network.client", true);

        let mut keys = Dictionary::new();
        keys.insert(
            "NSCameraUsageDescription".into(),
            Value::String("Scans barcodes".into()),
        );
        config.set_info_plist_overrides(keys);

        let entitlements = config.entitlements();
        assert_eq!(
            entitlements.get("com.apple.security.cs.debugger"),
            Some(&Value::Boolean(false))
        );
        assert_eq!(
            entitlements.get("com.apple.security.network.client"),
            Some(&Value::Boolean(true))
        );
        assert_eq!(entitlements.len(), 16);

        assert_eq!(
            config.info_plist_properties().get("NSCameraUsageDescription"),
            Some(&Value::String("Scans barcodes".into()))
        );
    }

    #[test]
    fn overrides_from_files() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let path = temp_dir.path().join("entitlements.plist");
        std::fs::write(
            &path,
            indoc! {r#"
                <?xml version="1.0" encoding="UTF-8"?>
                <plist version="1.0">
                <dict>
                    <key>com.apple.security.cs.allow-jit</key>
                    <false/>
                </dict>
                </plist>
            "#},
        )?;

        let mut config = CodesignConfig::new("/tmp/App.app");
        config.set_entitlements_file(&path)?;
        assert_eq!(
            config.entitlements().get("com.apple.security.cs.allow-jit"),
            Some(&Value::Boolean(false))
        );

        std::fs::write(&path, "<plist><array></array></plist>")?;
        assert!(matches!(
            config.set_info_plist_overrides_file(&path),
            Err(BundleCodesignError::PlistNotDictionary(_))
        ));

        Ok(())
    }

    #[test]
    fn validate_bundle_path() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let identities = identities();

        for path in [
            temp_dir.path().join("Missing.app"),
            {
                let file = temp_dir.path().join("File.app");
                std::fs::write(&file, b"")?;
                file
            },
            create_app_bundle(temp_dir.path(), "Wrong.bundle", "Wrong")?,
        ] {
            let err = CodesignConfig::new(&path).validate(&identities).unwrap_err();
            assert_eq!(err.category(), ErrorCategory::Configuration, "{}", err);
        }

        Ok(())
    }

    #[test]
    fn validate_resolves_identity() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let root = create_app_bundle(temp_dir.path(), "App.app", "App")?;

        let validated = CodesignConfig::new(&root).validate(&identities())?;
        assert_eq!(validated.identity().hash(), "BBBB");
        assert!(validated.hardened_runtime());
        assert_eq!(validated.bundle().name(), "App.app");

        let mut config = CodesignConfig::new(&root);
        config.set_identity("CCCC");
        assert_eq!(config.validate(&identities())?.identity().hash(), "CCCC");

        config.set_identity("");
        assert_eq!(config.identity(), None);
        assert_eq!(config.identity_selector(), DEFAULT_IDENTITY_SELECTOR);

        Ok(())
    }

    #[test]
    fn validate_unknown_identity() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let root = create_app_bundle(temp_dir.path(), "App.app", "App")?;

        let mut config = CodesignConfig::new(&root);
        config.set_identity("Developer ID Application: Nobody (0000000000)");

        let err = config.validate(&identities()).unwrap_err();
        assert!(matches!(err, BundleCodesignError::IdentityNotFound(_)));
        assert_eq!(err.category(), ErrorCategory::Configuration);

        let err = CodesignConfig::new(&root)
            .validate(&Vec::<SigningIdentity>::new())
            .unwrap_err();
        assert!(matches!(err, BundleCodesignError::IdentityNotFound(_)));

        Ok(())
    }

    #[test]
    fn validate_rejects_unsupported_entitlement() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let root = create_app_bundle(temp_dir.path(), "App.app", "App")?;

        let mut config = CodesignConfig::new(&root);
        config.add_entitlement("com.example.ratio", Value::Real(0.5));

        let err = config.validate(&identities()).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Format);

        Ok(())
    }
}
