// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Signing of whole application bundles.

[Codesigner] drives a bundle through four stages:

1. pre-cleanup: leftovers of earlier runs and unsignable content are removed,
   extended attributes are cleared and existing signatures are stripped from
   the root and from every nested component.
2. component signing: every [ComponentCategory] pass in signing order, each
   component deepest first.
3. root signing: the bundle itself.
4. finalization: `Info.plist` edits followed by re-signing the root and,
   optionally, verification.

Stages can be driven one at a time but only in this order. The first failure
stops the run. Nothing is retried.
*/

use {
    crate::{
        bundle::Bundle,
        codesign::{
            remove_extended_attributes, remove_signature, verify_signature, CodesignInvocation,
        },
        component::{ComponentCategory, SigningPlan},
        config::{CodesignConfig, ValidatedConfig},
        entitlements::EntitlementsFile,
        error::BundleCodesignError,
        identity::IdentityLister,
        logging::LogContext,
        plist_codec,
        process::{CommandRunner, DryRunCommandRunner},
    },
    log::{debug, info, warn},
    plist::{Dictionary, Value},
    std::{
        collections::HashSet,
        fmt::Formatter,
        path::{Path, PathBuf},
    },
};

static DRY_RUN_RUNNER: DryRunCommandRunner = DryRunCommandRunner;

/// Progress of a bundle through the signing pipeline.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SigningState {
    Unsigned,
    PreCleaned,
    ComponentsSigned,
    RootSigned,
    Finalized,
}

impl std::fmt::Display for SigningState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Unsigned => "unsigned",
            Self::PreCleaned => "pre-cleaned",
            Self::ComponentsSigned => "components-signed",
            Self::RootSigned => "root-signed",
            Self::Finalized => "finalized",
        })
    }
}

impl Default for SigningState {
    fn default() -> Self {
        Self::Unsigned
    }
}

/// What a signing run did to a bundle.
#[derive(Clone, Debug, Default)]
pub struct SigningReport {
    /// Every path passed to `codesign --sign`, in order.
    pub signed: Vec<PathBuf>,
    /// Files and directories deleted during pre-cleanup.
    pub removed: Vec<PathBuf>,
    /// Files moved during pre-cleanup, as (from, to).
    pub moved: Vec<(PathBuf, PathBuf)>,
    /// `Info.plist` files rewritten.
    pub plists_written: Vec<PathBuf>,
    pub state: SigningState,
}

/// Signs an application bundle and everything nested in it.
pub struct Codesigner<'a> {
    config: ValidatedConfig,
    runner: &'a dyn CommandRunner,
    log: &'a LogContext,
    state: SigningState,
    report: SigningReport,
    entitlements_file: Option<EntitlementsFile>,
}

impl<'a> Codesigner<'a> {
    /// Construct a new instance.
    ///
    /// In dry-run mode `runner` is never used: commands are only logged.
    pub fn new(
        config: ValidatedConfig,
        runner: &'a dyn CommandRunner,
        log: &'a LogContext,
    ) -> Self {
        let runner: &'a dyn CommandRunner = if config.options().dry_run {
            &DRY_RUN_RUNNER
        } else {
            runner
        };

        Self {
            config,
            runner,
            log,
            state: SigningState::Unsigned,
            report: SigningReport::default(),
            entitlements_file: None,
        }
    }

    pub fn state(&self) -> SigningState {
        self.state
    }

    pub fn report(&self) -> &SigningReport {
        &self.report
    }

    pub fn config(&self) -> &ValidatedConfig {
        &self.config
    }

    fn dry_run(&self) -> bool {
        self.config.options().dry_run
    }

    fn root(&self) -> PathBuf {
        self.config.bundle().root_dir().to_path_buf()
    }

    fn require_state(
        &self,
        stage: &'static str,
        expected: SigningState,
    ) -> Result<(), BundleCodesignError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(BundleCodesignError::StageOutOfOrder {
                stage,
                state: self.state,
            })
        }
    }

    fn advance(&mut self, state: SigningState) {
        debug!("signing state {} -> {}", self.state, state);
        self.state = state;
        self.report.state = state;
    }

    fn remove_path(&mut self, path: &Path) -> Result<(), BundleCodesignError> {
        if self.dry_run() {
            warn!("dry run: would remove {}", path.display());
        } else {
            info!("removing {}", path.display());

            if path.is_dir() {
                std::fs::remove_dir_all(path)?;
            } else {
                std::fs::remove_file(path)?;
            }
        }

        self.report.removed.push(path.to_path_buf());

        Ok(())
    }

    fn write_plist(&mut self, path: &Path, dict: Dictionary) -> Result<(), BundleCodesignError> {
        if self.dry_run() {
            warn!("dry run: would write {}", path.display());
        } else if path == self.config.bundle().info_plist_path() {
            self.config.bundle_mut().write_info_plist(dict)?;
        } else {
            plist_codec::write_dictionary_file(path, &dict)?;
        }

        self.report.plists_written.push(path.to_path_buf());

        Ok(())
    }

    /// Path of the entitlements file, created on first use.
    fn entitlements_path(&mut self) -> Result<PathBuf, BundleCodesignError> {
        let file = match self.entitlements_file.take() {
            Some(file) => file,
            None => EntitlementsFile::create(self.config.entitlements())?,
        };

        let path = file.path().to_path_buf();
        self.entitlements_file = Some(file);

        Ok(path)
    }

    fn sign_path(
        &mut self,
        path: &Path,
        hardened_runtime: bool,
    ) -> Result<(), BundleCodesignError> {
        let options = self.config.options();

        let mut invocation = CodesignInvocation::new(self.config.identity().hash(), path);
        invocation
            .force()
            .timeout(options.command_timeout())
            .stream_output(options.stream_output);

        if let Some(server) = options.timestamp_server() {
            invocation.timestamp_server(server);
        }

        if hardened_runtime {
            let entitlements = self.entitlements_path()?;
            invocation.hardened_runtime().entitlements(entitlements);
        }

        info!("signing {}", path.display());
        invocation.run(self.runner)?;
        self.report.signed.push(path.to_path_buf());

        Ok(())
    }

    /// Stage 1: prepare the bundle for signing.
    pub fn pre_cleanup(&mut self) -> Result<(), BundleCodesignError> {
        self.require_state("pre-cleanup", SigningState::Unsigned)?;

        let log = self.log;
        log.group("pre-cleanup", || self.pre_cleanup_inner())?;

        self.advance(SigningState::PreCleaned);

        Ok(())
    }

    fn pre_cleanup_inner(&mut self) -> Result<(), BundleCodesignError> {
        let root = self.root();
        let options = self.config.options().clone();

        if options.remove_temp_files {
            let mut temp_files = vec![];

            for entry in walkdir::WalkDir::new(&root).sort_by_file_name() {
                let entry = entry?;

                if entry.file_type().is_file()
                    && entry.path().extension().map(|x| x == "cstemp").unwrap_or(false)
                {
                    temp_files.push(entry.into_path());
                }
            }

            for path in temp_files {
                self.remove_path(&path)?;
            }
        }

        if options.remove_scripting_runtime {
            let runtime = self.config.bundle().resolve_path("Resources/php/Mac");

            if runtime.exists() {
                self.remove_path(&runtime)?;
            }
        }

        if options.remove_component_plugins {
            let pattern = format!(
                "{}/Contents/Components/*/Plugins",
                glob::Pattern::escape(&root.to_string_lossy())
            );

            let mut plugin_dirs = vec![];
            for path in glob::glob(&pattern)? {
                let path = path?;
                if path.is_dir() {
                    plugin_dirs.push(path);
                }
            }

            for path in plugin_dirs {
                self.remove_path(&path)?;
            }
        }

        if options.move_plugin_manifest {
            let pattern = format!(
                "{}/Contents/Plugins/*.bundle/Contents/manifest.json",
                glob::Pattern::escape(&root.to_string_lossy())
            );

            for source in glob::glob(&pattern)? {
                let source = source?;
                let dest_dir = source
                    .parent()
                    .map(|contents| contents.join("Resources"))
                    .ok_or_else(|| BundleCodesignError::ComponentMissing(source.clone()))?;
                let dest = dest_dir.join("manifest.json");

                if self.dry_run() {
                    warn!(
                        "dry run: would move {} to {}",
                        source.display(),
                        dest.display()
                    );
                } else {
                    info!("moving {} to {}", source.display(), dest.display());
                    std::fs::create_dir_all(&dest_dir)?;
                    std::fs::rename(&source, &dest)?;
                }

                self.report.moved.push((source, dest));
            }
        }

        if options.pre_cleanup {
            remove_extended_attributes(self.runner, &root)?;
            remove_signature(self.runner, &root)?;

            for path in self.nested_signed_paths(&options.categories)? {
                remove_signature(self.runner, &path)?;
            }
        }

        Ok(())
    }

    /// Nested paths whose existing signatures are stripped during pre-cleanup.
    ///
    /// Every component the run will sign, plus each top-level entry of
    /// `Contents/Native Components`. Paths removed earlier in pre-cleanup are
    /// skipped.
    fn nested_signed_paths(
        &self,
        categories: &[ComponentCategory],
    ) -> Result<Vec<PathBuf>, BundleCodesignError> {
        let root = self.root();
        let plan = SigningPlan::discover(&root, categories)?;

        let mut candidates = plan
            .components()
            .iter()
            .map(|c| c.path.clone())
            .collect::<Vec<_>>();

        let native = self.config.bundle().resolve_path("Native Components");
        if native.is_dir() {
            let pattern = format!("{}/*", glob::Pattern::escape(&native.to_string_lossy()));
            let options = glob::MatchOptions {
                require_literal_leading_dot: true,
                ..Default::default()
            };

            for path in glob::glob_with(&pattern, options)? {
                candidates.push(path?);
            }
        }

        let mut seen = HashSet::new();

        Ok(candidates
            .into_iter()
            .filter(|path| !self.report.removed.iter().any(|r| path.starts_with(r)))
            .filter(|path| seen.insert(path.clone()))
            .collect())
    }

    /// Stage 2: sign nested components, leaves first.
    pub fn sign_components(&mut self) -> Result<(), BundleCodesignError> {
        self.require_state("component signing", SigningState::PreCleaned)?;

        let root = self.root();
        let categories = self.config.options().categories.clone();

        self.log.section("signing nested components");

        let plan = SigningPlan::discover(&root, &categories)?;
        info!("{} components to sign", plan.len());

        for category in categories {
            let components = plan
                .category_components(category)
                .filter(|c| !self.report.removed.iter().any(|r| c.path.starts_with(r)))
                .cloned()
                .collect::<Vec<_>>();

            let log = self.log;
            log.group(&format!("sign {}", category), || {
                if components.is_empty() {
                    info!("no {} components found", category);
                }

                for component in &components {
                    if component.lowercase_executable
                        && self.config.options().lowercase_executable_name
                    {
                        self.lowercase_nested_executable(&component.path)?;
                    }

                    if component.path.is_dir()
                        && component.path.extension().map(|x| x == "app").unwrap_or(false)
                    {
                        self.update_nested_info_plist(&component.path)?;
                    }

                    let hardened = component.hardened_runtime && self.config.hardened_runtime();
                    self.sign_path(&component.path, hardened)?;
                }

                Ok::<(), BundleCodesignError>(())
            })?;
        }

        self.advance(SigningState::ComponentsSigned);

        Ok(())
    }

    fn lowercase_nested_executable(&mut self, path: &Path) -> Result<(), BundleCodesignError> {
        let bundle = Bundle::new_from_path(path)?;

        if let Some((_, dict)) = bundle.lowercased_executable_plist()? {
            self.write_plist(bundle.info_plist_path(), dict)?;
        }

        Ok(())
    }

    // Nested applications get the same Info.plist keys as the root.
    fn update_nested_info_plist(&mut self, path: &Path) -> Result<(), BundleCodesignError> {
        let bundle = Bundle::new_from_path(path)?;

        if !bundle.info_plist_path().is_file() {
            debug!("{} has no Info.plist; skipping", path.display());
            return Ok(());
        }

        let dict = bundle.merged_info_plist(self.config.info_plist_properties())?;

        if &dict != bundle.info_plist()? {
            info!("updating {}", bundle.info_plist_path().display());
            self.write_plist(bundle.info_plist_path(), dict)?;
        }

        Ok(())
    }

    /// Stage 3: sign the bundle itself.
    pub fn sign_root(&mut self) -> Result<(), BundleCodesignError> {
        self.require_state("root signing", SigningState::ComponentsSigned)?;

        let root = self.root();
        let hardened = self.config.hardened_runtime();

        let log = self.log;
        log.group("sign root bundle", || self.sign_path(&root, hardened))?;

        self.advance(SigningState::RootSigned);

        Ok(())
    }

    /// Stage 4: apply `Info.plist` changes, re-sign and verify.
    pub fn finalize(&mut self) -> Result<(), BundleCodesignError> {
        self.require_state("finalize", SigningState::RootSigned)?;

        let log = self.log;
        log.group("finalize", || self.finalize_inner())?;

        self.advance(SigningState::Finalized);

        Ok(())
    }

    fn finalize_inner(&mut self) -> Result<(), BundleCodesignError> {
        let root = self.root();
        let info_plist_path = self.config.bundle().info_plist_path().to_path_buf();

        let mut dict = self
            .config
            .bundle()
            .merged_info_plist(self.config.info_plist_properties())?;

        if self.config.options().lowercase_executable_name {
            if let Some(Value::String(executable)) = dict.get_mut("CFBundleExecutable") {
                let lowered = executable.to_lowercase();

                if lowered != *executable {
                    info!("changing bundle executable name: {} -> {}", executable, lowered);
                    *executable = lowered;
                }
            }
        }

        if &dict != self.config.bundle().info_plist()? {
            info!("updating {}", info_plist_path.display());
            self.write_plist(&info_plist_path, dict)?;
        } else {
            debug!("{} already up to date", info_plist_path.display());
        }

        // Editing Info.plist invalidates the sealed resources of the root.
        let hardened = self.config.hardened_runtime();
        self.sign_path(&root, hardened)?;

        if self.config.options().verify {
            if self.dry_run() {
                warn!("dry run: skipping verification of {}", root.display());
            } else {
                verify_signature(self.runner, &root)?;
            }
        }

        Ok(())
    }

    /// Run every remaining stage.
    pub fn run(&mut self) -> Result<(), BundleCodesignError> {
        self.log
            .section(&format!("signing {}", self.config.bundle().name()));

        if self.state == SigningState::Unsigned {
            self.pre_cleanup()?;
        }
        if self.state == SigningState::PreCleaned {
            self.sign_components()?;
        }
        if self.state == SigningState::ComponentsSigned {
            self.sign_root()?;
        }
        if self.state == SigningState::RootSigned {
            self.finalize()?;
        }

        info!(
            "signed {} paths in {}",
            self.report.signed.len(),
            self.config.bundle().name()
        );

        Ok(())
    }

    /// Consume the instance, returning what it did.
    ///
    /// Dropping the instance also removes its temporary entitlements file.
    pub fn into_report(self) -> SigningReport {
        self.report
    }
}

/// Validate `config` and sign the bundle it names.
///
/// Configuration problems are reported before anything on disk changes.
pub fn codesign_bundle(
    config: &CodesignConfig,
    lister: &dyn IdentityLister,
    runner: &dyn CommandRunner,
    log: &LogContext,
) -> Result<SigningReport, BundleCodesignError> {
    let validated = config.validate(lister)?;

    let mut signer = Codesigner::new(validated, runner, log);
    signer.run()?;

    Ok(signer.into_report())
}

/// The component categories of a bundle that contain something to sign.
///
/// Useful to preview a run.
pub fn discover_categories(
    bundle_root: &Path,
) -> Result<Vec<(ComponentCategory, usize)>, BundleCodesignError> {
    let plan = SigningPlan::discover(bundle_root, &ComponentCategory::ALL)?;

    Ok(ComponentCategory::ALL
        .iter()
        .map(|c| (*c, plan.category_components(*c).count()))
        .filter(|(_, count)| *count > 0)
        .collect())
}
