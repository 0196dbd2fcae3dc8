// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bundles backed by a directory.

use {
    crate::{error::BundleCodesignError, plist_codec},
    log::{debug, info},
    once_cell::unsync::OnceCell,
    plist::{Dictionary, Value},
    std::path::{Path, PathBuf},
};

/// Suffix an application bundle directory must carry.
pub const REQUIRED_BUNDLE_SUFFIX: &str = ".app";

/// An Apple bundle backed by a filesystem directory.
///
/// The `Info.plist` is parsed on first access and cached for the lifetime of
/// the instance. Writes through [Bundle::write_info_plist] refresh the cache.
#[derive(Debug)]
pub struct Bundle {
    /// Root directory of this bundle.
    root: PathBuf,

    /// Name of the root directory.
    root_name: String,

    /// Where the `Info.plist` lives (or would live).
    info_plist_path: PathBuf,

    info_plist: OnceCell<Dictionary>,
}

impl Bundle {
    /// Open an existing bundle directory.
    ///
    /// Only the directory itself is checked. A missing `Info.plist` is
    /// reported when metadata is first accessed.
    pub fn new_from_path(directory: &Path) -> Result<Self, BundleCodesignError> {
        if !directory.exists() {
            return Err(BundleCodesignError::BundleNotFound(directory.to_path_buf()));
        }
        if !directory.is_dir() {
            return Err(BundleCodesignError::BundleNotDirectory(
                directory.to_path_buf(),
            ));
        }

        let root_name = directory
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();

        // Frameworks keep their plist in `Resources/` (usually a symlink into
        // `Versions/Current`). Everything else uses `Contents/`.
        let contents_plist = directory.join("Contents").join("Info.plist");
        let framework_plist = directory.join("Resources").join("Info.plist");

        let info_plist_path = if !contents_plist.is_file() && framework_plist.is_file() {
            framework_plist
        } else {
            contents_plist
        };

        Ok(Self {
            root: directory.to_path_buf(),
            root_name,
            info_plist_path,
            info_plist: OnceCell::new(),
        })
    }

    /// Open an application bundle, requiring the `.app` suffix.
    pub fn new_app_from_path(directory: &Path) -> Result<Self, BundleCodesignError> {
        let bundle = Self::new_from_path(directory)?;

        if !bundle.root_name.ends_with(REQUIRED_BUNDLE_SUFFIX) {
            return Err(BundleCodesignError::BundleBadSuffix {
                path: directory.to_path_buf(),
                suffix: REQUIRED_BUNDLE_SUFFIX,
            });
        }

        Ok(bundle)
    }

    /// The root directory of this bundle.
    pub fn root_dir(&self) -> &Path {
        &self.root
    }

    /// The on-disk name of this bundle, including its suffix.
    pub fn name(&self) -> &str {
        &self.root_name
    }

    /// Resolve a path relative to the `Contents` directory.
    pub fn resolve_path(&self, path: impl AsRef<Path>) -> PathBuf {
        self.root.join("Contents").join(path.as_ref())
    }

    /// Obtain the path to the `Info.plist` file.
    pub fn info_plist_path(&self) -> &Path {
        &self.info_plist_path
    }

    /// Obtain the parsed `Info.plist` file.
    pub fn info_plist(&self) -> Result<&Dictionary, BundleCodesignError> {
        self.info_plist.get_or_try_init(|| {
            if !self.info_plist_path.is_file() {
                return Err(BundleCodesignError::ComponentMissing(
                    self.info_plist_path.clone(),
                ));
            }

            debug!("parsing {}", self.info_plist_path.display());
            plist_codec::read_dictionary_file(&self.info_plist_path)
        })
    }

    /// Obtain an `Info.plist` key as a `String`.
    ///
    /// Will return `None` if the specified key doesn't exist. Errors if the key value
    /// is not a string.
    pub fn info_plist_key_string(&self, key: &str) -> Result<Option<String>, BundleCodesignError> {
        match self.info_plist()?.get(key) {
            Some(value) => Ok(Some(
                value
                    .as_string()
                    .ok_or_else(|| BundleCodesignError::PlistKeyNotString {
                        path: self.info_plist_path.clone(),
                        key: key.to_string(),
                    })?
                    .to_string(),
            )),
            None => Ok(None),
        }
    }

    /// Obtain the bundle identifier.
    ///
    /// This retrieves `CFBundleIdentifier` from the `Info.plist`.
    pub fn identifier(&self) -> Result<Option<String>, BundleCodesignError> {
        self.info_plist_key_string("CFBundleIdentifier")
    }

    /// Obtain the name of the bundle's main executable file.
    ///
    /// This retrieves `CFBundleExecutable` from the `Info.plist`.
    pub fn main_executable(&self) -> Result<Option<String>, BundleCodesignError> {
        self.info_plist_key_string("CFBundleExecutable")
    }

    /// Replace the `Info.plist` with new content.
    pub fn write_info_plist(&mut self, dict: Dictionary) -> Result<(), BundleCodesignError> {
        plist_codec::write_dictionary_file(&self.info_plist_path, &dict)?;

        self.info_plist = OnceCell::from(dict);

        Ok(())
    }

    /// The `Info.plist` content with `CFBundleExecutable` lowercased.
    ///
    /// Returns `None` when there is nothing to change.
    pub fn lowercased_executable_plist(
        &self,
    ) -> Result<Option<(String, Dictionary)>, BundleCodesignError> {
        let executable = match self.main_executable()? {
            Some(name) if !name.is_empty() => name,
            _ => return Ok(None),
        };

        let lowered = executable.to_lowercase();
        if lowered == executable {
            return Ok(None);
        }

        let mut dict = self.info_plist()?.clone();
        dict.insert(
            "CFBundleExecutable".to_string(),
            Value::String(lowered.clone()),
        );

        info!(
            "changing bundle executable name of {}: {} -> {}",
            self.root_name, executable, lowered
        );

        Ok(Some((lowered, dict)))
    }

    /// The `Info.plist` content with `overrides` deep merged over it.
    ///
    /// Keys not named by `overrides` are preserved.
    pub fn merged_info_plist(&self, overrides: &Dictionary) -> Result<Dictionary, BundleCodesignError> {
        Ok(plist_codec::merge(self.info_plist()?, overrides))
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{error::ErrorCategory, testutil::create_app_bundle},
    };

    #[test]
    fn validation() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;

        let missing = temp_dir.path().join("Missing.app");
        assert!(matches!(
            Bundle::new_app_from_path(&missing),
            Err(BundleCodesignError::BundleNotFound(_))
        ));

        let file = temp_dir.path().join("File.app");
        std::fs::write(&file, b"not a bundle")?;
        assert!(matches!(
            Bundle::new_app_from_path(&file),
            Err(BundleCodesignError::BundleNotDirectory(_))
        ));

        let wrong_suffix = temp_dir.path().join("Thing.bundle");
        std::fs::create_dir(&wrong_suffix)?;
        let err = Bundle::new_app_from_path(&wrong_suffix).unwrap_err();
        assert!(matches!(
            err,
            BundleCodesignError::BundleBadSuffix { suffix: ".app", .. }
        ));
        assert_eq!(err.category(), ErrorCategory::Configuration);

        // Nested bundles are not held to the suffix.
        Bundle::new_from_path(&wrong_suffix)?;

        Ok(())
    }

    #[test]
    fn metadata_access() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let root = create_app_bundle(temp_dir.path(), "My App.app", "MyApp")?;

        let bundle = Bundle::new_app_from_path(&root)?;
        assert_eq!(bundle.name(), "My App.app");
        assert_eq!(bundle.info_plist_path(), root.join("Contents/Info.plist"));
        assert_eq!(bundle.main_executable()?, Some("MyApp".to_string()));
        assert_eq!(
            bundle.identifier()?,
            Some("com.example.myapp".to_string())
        );
        assert_eq!(bundle.info_plist_key_string("Missing")?, None);

        Ok(())
    }

    #[test]
    fn info_plist_is_cached() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let root = create_app_bundle(temp_dir.path(), "App.app", "App")?;

        let bundle = Bundle::new_app_from_path(&root)?;
        assert_eq!(bundle.main_executable()?, Some("App".to_string()));

        std::fs::remove_file(root.join("Contents/Info.plist"))?;
        assert_eq!(bundle.main_executable()?, Some("App".to_string()));

        // A fresh instance sees the live filesystem.
        let err = Bundle::new_app_from_path(&root)?.info_plist().unwrap_err();
        assert!(matches!(err, BundleCodesignError::ComponentMissing(_)));

        Ok(())
    }

    #[test]
    fn framework_plist_location() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let framework = temp_dir.path().join("Foo.framework");
        std::fs::create_dir_all(framework.join("Resources"))?;

        let mut dict = Dictionary::new();
        dict.insert("CFBundleExecutable".into(), Value::String("Foo".into()));
        plist_codec::write_dictionary_file(&framework.join("Resources/Info.plist"), &dict)?;

        let bundle = Bundle::new_from_path(&framework)?;
        assert_eq!(
            bundle.info_plist_path(),
            framework.join("Resources/Info.plist")
        );
        assert_eq!(bundle.main_executable()?, Some("Foo".to_string()));

        Ok(())
    }

    #[test]
    fn non_string_key() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let root = create_app_bundle(temp_dir.path(), "App.app", "App")?;

        let mut bundle = Bundle::new_app_from_path(&root)?;
        let mut dict = bundle.info_plist()?.clone();
        dict.insert("CFBundleExecutable".into(), Value::Boolean(true));
        bundle.write_info_plist(dict)?;

        assert!(matches!(
            bundle.main_executable(),
            Err(BundleCodesignError::PlistKeyNotString { .. })
        ));

        Ok(())
    }

    #[test]
    fn lowercase_and_merge() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let root = create_app_bundle(temp_dir.path(), "App.app", "MyApp")?;

        let mut bundle = Bundle::new_app_from_path(&root)?;
        let (name, dict) = bundle.lowercased_executable_plist()?.unwrap();
        assert_eq!(name, "myapp");
        bundle.write_info_plist(dict)?;

        assert!(bundle.lowercased_executable_plist()?.is_none());
        assert_eq!(
            Bundle::new_app_from_path(&root)?.main_executable()?,
            Some("myapp".to_string())
        );

        let mut overrides = Dictionary::new();
        overrides.insert(
            "NSRequiresAquaSystemAppearance".into(),
            Value::String("NO".into()),
        );
        let merged = bundle.merged_info_plist(&overrides)?;
        assert_eq!(
            merged.get("CFBundleIdentifier"),
            Some(&Value::String("com.example.myapp".into()))
        );
        assert_eq!(
            merged.get("NSRequiresAquaSystemAppearance"),
            Some(&Value::String("NO".into()))
        );

        Ok(())
    }
}
