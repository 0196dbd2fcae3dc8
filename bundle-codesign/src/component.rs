// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Discovery of signable components inside a bundle.

A bundle is signed in passes, one per [ComponentCategory], in the order of
[ComponentCategory::ALL]. Each category carries a static [CategoryPolicy]
describing where its components live, how they are found and how they are
signed. Discovery always reads the live filesystem: nothing is cached between
runs.

`codesign` seals the signatures of nested code into the signature of the
enclosing code. Anything nested must therefore be signed before whatever
contains it. Within a category this is achieved by signing the deepest paths
first. Across categories it is a property of the category order, which
[SigningPlan::discover] checks before anything is signed.
*/

use {
    crate::error::BundleCodesignError,
    log::debug,
    serde::{Deserialize, Serialize},
    std::{
        collections::HashSet,
        fmt::Formatter,
        path::{Path, PathBuf},
    },
};

/// Kinds of bundle content signed as a distinct pass.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComponentCategory {
    /// MeCab morphological analyzer bundle.
    NlpLibraries,
    /// Embedded PHP FastCGI interpreter.
    ScriptingRuntime,
    /// Cyrus SASL authentication plugins.
    SaslPlugins,
    /// Libraries shipped for the mobile build chain.
    Mobile,
    /// Database engine libraries.
    Database,
    NativeComponents,
    InternalComponents,
    /// Privileged helper and installer tools.
    HelperTools,
    /// Sparkle style updater application.
    Updater,
    Plugins,
    Frameworks,
    BinDirectory,
    /// Loose files directly under `Contents/`.
    ContentsFiles,
}

impl ComponentCategory {
    /// Every category, in signing order.
    pub const ALL: [Self; 13] = [
        Self::NlpLibraries,
        Self::ScriptingRuntime,
        Self::SaslPlugins,
        Self::Mobile,
        Self::Database,
        Self::NativeComponents,
        Self::InternalComponents,
        Self::HelperTools,
        Self::Updater,
        Self::Plugins,
        Self::Frameworks,
        Self::BinDirectory,
        Self::ContentsFiles,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NlpLibraries => "nlp-libraries",
            Self::ScriptingRuntime => "scripting-runtime",
            Self::SaslPlugins => "sasl-plugins",
            Self::Mobile => "mobile",
            Self::Database => "database",
            Self::NativeComponents => "native-components",
            Self::InternalComponents => "internal-components",
            Self::HelperTools => "helper-tools",
            Self::Updater => "updater",
            Self::Plugins => "plugins",
            Self::Frameworks => "frameworks",
            Self::BinDirectory => "bin-directory",
            Self::ContentsFiles => "contents-files",
        }
    }

    /// Obtain the signing policy for this category.
    pub fn policy(&self) -> &'static CategoryPolicy {
        match self {
            Self::NlpLibraries => &NLP_LIBRARIES,
            Self::ScriptingRuntime => &SCRIPTING_RUNTIME,
            Self::SaslPlugins => &SASL_PLUGINS,
            Self::Mobile => &MOBILE,
            Self::Database => &DATABASE,
            Self::NativeComponents => &NATIVE_COMPONENTS,
            Self::InternalComponents => &INTERNAL_COMPONENTS,
            Self::HelperTools => &HELPER_TOOLS,
            Self::Updater => &UPDATER,
            Self::Plugins => &PLUGINS,
            Self::Frameworks => &FRAMEWORKS,
            Self::BinDirectory => &BIN_DIRECTORY,
            Self::ContentsFiles => &CONTENTS_FILES,
        }
    }
}

impl std::fmt::Display for ComponentCategory {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ComponentCategory {
    type Err = BundleCodesignError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|c| c.as_str() == s)
            .copied()
            .ok_or_else(|| {
                BundleCodesignError::InvalidOption(format!("unknown component category: {}", s))
            })
    }
}

/// What a discovered filesystem entry must be.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EntryKind {
    File,
    Directory,
    Any,
}

impl EntryKind {
    fn admits(&self, file_type: std::fs::FileType) -> bool {
        match self {
            Self::File => file_type.is_file(),
            Self::Directory => file_type.is_dir(),
            Self::Any => file_type.is_file() || file_type.is_dir(),
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            Self::File => "regular file",
            Self::Directory => "directory",
            Self::Any => "file or directory",
        }
    }
}

/// How entries are found below an anchor directory.
#[derive(Clone, Copy, Debug)]
pub enum Discovery {
    /// A glob pattern relative to the anchor.
    ///
    /// A pattern without wildcards names an exact entry: if it exists with
    /// the wrong [EntryKind], discovery fails.
    Pattern(&'static str),

    /// Every entry at any depth below the anchor whose file name matches one
    /// of the patterns.
    Recursive(&'static [&'static str]),
}

/// One source of components for a category.
#[derive(Clone, Copy, Debug)]
pub struct DiscoveryRule {
    /// Directories, relative to the bundle root, searched by this rule.
    ///
    /// Missing anchors are skipped.
    pub anchors: &'static [&'static str],
    pub discovery: Discovery,
    pub kind: EntryKind,
    /// File names never treated as components.
    pub exclude: &'static [&'static str],
    /// Sign with `--options runtime` and the run's entitlements.
    pub hardened_runtime: bool,
}

/// Signing policy of a [ComponentCategory].
#[derive(Clone, Copy, Debug)]
pub struct CategoryPolicy {
    pub rules: &'static [DiscoveryRule],
    /// Lowercase `CFBundleExecutable` in each component's own `Info.plist`
    /// before signing it.
    pub lowercase_executable: bool,
}

const fn rule(
    anchors: &'static [&'static str],
    discovery: Discovery,
    kind: EntryKind,
    hardened_runtime: bool,
) -> DiscoveryRule {
    DiscoveryRule {
        anchors,
        discovery,
        kind,
        exclude: &[],
        hardened_runtime,
    }
}

static NLP_LIBRARIES: CategoryPolicy = CategoryPolicy {
    rules: &[rule(
        &["Contents/Resources/mecab"],
        Discovery::Pattern("mecab.bundle"),
        EntryKind::Directory,
        false,
    )],
    lowercase_executable: true,
};

static SCRIPTING_RUNTIME: CategoryPolicy = CategoryPolicy {
    rules: &[rule(
        &["Contents/Resources/php/Mac"],
        Discovery::Pattern("php-fcgi-4d"),
        EntryKind::File,
        true,
    )],
    lowercase_executable: false,
};

static SASL_PLUGINS: CategoryPolicy = CategoryPolicy {
    rules: &[rule(
        &["Contents/SASL Plugins"],
        Discovery::Pattern("*.plugin"),
        EntryKind::Any,
        false,
    )],
    lowercase_executable: false,
};

static MOBILE: CategoryPolicy = CategoryPolicy {
    rules: &[rule(
        &["Contents/Resources/Mobile"],
        Discovery::Recursive(&["*.dylib"]),
        EntryKind::File,
        false,
    )],
    lowercase_executable: false,
};

static DATABASE: CategoryPolicy = CategoryPolicy {
    rules: &[rule(
        &["Contents/Database", "Contents/Server Database"],
        Discovery::Recursive(&["*.dylib"]),
        EntryKind::File,
        false,
    )],
    lowercase_executable: false,
};

static NATIVE_COMPONENTS: CategoryPolicy = CategoryPolicy {
    rules: &[
        rule(
            &["Contents/Native Components"],
            Discovery::Recursive(&["*.dylib", "*.so", "*.app", "*.framework"]),
            EntryKind::Any,
            false,
        ),
        rule(
            &["Contents/Native Components"],
            Discovery::Pattern("*"),
            EntryKind::Any,
            false,
        ),
    ],
    lowercase_executable: false,
};

static INTERNAL_COMPONENTS: CategoryPolicy = CategoryPolicy {
    rules: &[rule(
        &["Contents/Resources/Internal Components", "Contents/Components"],
        Discovery::Recursive(&["*.html", "*.htm", "*.json", "*.js", "*.dylib"]),
        EntryKind::File,
        false,
    )],
    lowercase_executable: false,
};

static HELPER_TOOLS: CategoryPolicy = CategoryPolicy {
    rules: &[
        rule(
            &["Contents/MacOS"],
            Discovery::Pattern("HelperTool"),
            EntryKind::File,
            true,
        ),
        rule(
            &["Contents/MacOS"],
            Discovery::Pattern("InstallTool"),
            EntryKind::File,
            true,
        ),
        rule(
            &["Contents/MacOS"],
            Discovery::Pattern("InstallTool.app/Contents/Library/LaunchServices/*"),
            EntryKind::File,
            true,
        ),
        rule(
            &["Contents/MacOS"],
            Discovery::Pattern("InstallTool.app"),
            EntryKind::Directory,
            true,
        ),
    ],
    lowercase_executable: false,
};

static UPDATER: CategoryPolicy = CategoryPolicy {
    rules: &[
        rule(
            &["Contents/Resources/Updater/Updater.app/Contents/Frameworks"],
            Discovery::Recursive(&["*.dylib", "*.framework", "*.app", "*.xpc"]),
            EntryKind::Any,
            false,
        ),
        rule(
            &["Contents/Resources/Updater"],
            Discovery::Pattern("Updater.app"),
            EntryKind::Directory,
            true,
        ),
    ],
    lowercase_executable: false,
};

static PLUGINS: CategoryPolicy = CategoryPolicy {
    rules: &[
        rule(
            &["Contents/Plugins"],
            Discovery::Pattern("*.bundle/Contents/manifest.json"),
            EntryKind::File,
            true,
        ),
        rule(
            &["Contents/Plugins"],
            Discovery::Pattern("*.bundle/Contents/Resources/manifest.json"),
            EntryKind::File,
            true,
        ),
        rule(
            &["Contents/Plugins"],
            Discovery::Pattern("*.bundle"),
            EntryKind::Directory,
            false,
        ),
    ],
    lowercase_executable: false,
};

static FRAMEWORKS: CategoryPolicy = CategoryPolicy {
    rules: &[rule(
        &["Contents/Frameworks"],
        Discovery::Pattern("*"),
        EntryKind::Any,
        false,
    )],
    lowercase_executable: false,
};

static BIN_DIRECTORY: CategoryPolicy = CategoryPolicy {
    rules: &[rule(
        &["Contents/Resources/bin"],
        Discovery::Recursive(&["*"]),
        EntryKind::File,
        true,
    )],
    lowercase_executable: false,
};

static CONTENTS_FILES: CategoryPolicy = CategoryPolicy {
    rules: &[DiscoveryRule {
        anchors: &["Contents"],
        discovery: Discovery::Pattern("*"),
        kind: EntryKind::File,
        exclude: &["PkgInfo", "CodeResources", "Info.plist"],
        hardened_runtime: false,
    }],
    lowercase_executable: false,
};

/// A signable filesystem object discovered inside a bundle.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Component {
    pub path: PathBuf,
    pub category: ComponentCategory,
    /// Sign with the hardened runtime and the run's entitlements.
    pub hardened_runtime: bool,
    pub lowercase_executable: bool,
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

fn has_wildcards(pattern: &str) -> bool {
    pattern.contains(|c: char| matches!(c, '*' | '?' | '['))
}

/// Resolve entries matched by a relative glob pattern below `anchor`.
fn discover_pattern(
    anchor: &Path,
    pattern: &str,
    rule: &DiscoveryRule,
) -> Result<Vec<PathBuf>, BundleCodesignError> {
    if !has_wildcards(pattern) {
        let path = anchor.join(pattern);

        return match std::fs::symlink_metadata(&path) {
            Ok(metadata) if metadata.file_type().is_symlink() => Ok(vec![]),
            Ok(metadata) if rule.kind.admits(metadata.file_type()) => Ok(vec![path]),
            Ok(_) => Err(BundleCodesignError::ComponentUnexpectedType {
                path,
                expected: rule.kind.describe(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(vec![]),
            Err(e) => Err(e.into()),
        };
    }

    let full_pattern = format!(
        "{}/{}",
        glob::Pattern::escape(&anchor.to_string_lossy()),
        pattern
    );
    let options = glob::MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: true,
    };

    let mut res = vec![];

    for path in glob::glob_with(&full_pattern, options)? {
        let path = path?;
        let metadata = std::fs::symlink_metadata(&path)?;

        if !metadata.file_type().is_symlink() && rule.kind.admits(metadata.file_type()) {
            res.push(path);
        }
    }

    Ok(res)
}

/// Walk `anchor` for entries whose name matches any of `patterns`.
fn discover_recursive(
    anchor: &Path,
    patterns: &[&str],
    rule: &DiscoveryRule,
) -> Result<Vec<PathBuf>, BundleCodesignError> {
    let patterns = patterns
        .iter()
        .map(|p| glob::Pattern::new(p))
        .collect::<Result<Vec<_>, _>>()?;

    let mut res = vec![];

    let walk = walkdir::WalkDir::new(anchor)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_hidden(entry.file_name()));

    for entry in walk {
        let entry = entry?;
        let file_type = entry.file_type();

        if file_type.is_symlink() || !rule.kind.admits(file_type) {
            continue;
        }

        let name = entry.file_name().to_string_lossy();
        if patterns.iter().any(|p| p.matches(&name)) {
            res.push(entry.into_path());
        }
    }

    Ok(res)
}

/// Discover the components of one category, in signing order.
///
/// Paths in `seen` are skipped. Newly discovered paths are added to it.
pub fn discover_category(
    bundle_root: &Path,
    category: ComponentCategory,
    seen: &mut HashSet<PathBuf>,
) -> Result<Vec<Component>, BundleCodesignError> {
    let policy = category.policy();
    let mut components = vec![];

    for rule in policy.rules {
        for anchor in rule.anchors {
            let anchor = bundle_root.join(anchor);

            if !anchor.is_dir() {
                debug!("{} does not exist; skipping", anchor.display());
                continue;
            }

            let paths = match rule.discovery {
                Discovery::Pattern(pattern) => discover_pattern(&anchor, pattern, rule)?,
                Discovery::Recursive(patterns) => discover_recursive(&anchor, patterns, rule)?,
            };

            for path in paths {
                let hidden = path
                    .strip_prefix(bundle_root)
                    .map(|rel| rel.iter().any(is_hidden))
                    .unwrap_or(false);
                let excluded = path
                    .file_name()
                    .map(|name| rule.exclude.iter().any(|x| name == *x))
                    .unwrap_or(false);

                if hidden || excluded || path == bundle_root || !seen.insert(path.clone()) {
                    continue;
                }

                components.push(Component {
                    path,
                    category,
                    hardened_runtime: rule.hardened_runtime,
                    lowercase_executable: policy.lowercase_executable,
                });
            }
        }
    }

    // Deepest first. Ties in path order.
    components.sort_by(|a, b| {
        b.path
            .components()
            .count()
            .cmp(&a.path.components().count())
            .then_with(|| a.path.cmp(&b.path))
    });

    Ok(components)
}

/// The ordered list of components to sign in a run.
#[derive(Clone, Debug, Default)]
pub struct SigningPlan {
    components: Vec<Component>,
}

impl SigningPlan {
    /// Discover the components of `categories` under `bundle_root`.
    ///
    /// Categories are processed in the order given. A path matched by more
    /// than one category is planned once, by the first. The resulting order
    /// is checked so nothing is signed after something containing it.
    pub fn discover(
        bundle_root: &Path,
        categories: &[ComponentCategory],
    ) -> Result<Self, BundleCodesignError> {
        let mut seen = HashSet::new();
        let mut components = vec![];

        for category in categories {
            let found = discover_category(bundle_root, *category, &mut seen)?;
            debug!("discovered {} {} components", found.len(), category);
            components.extend(found);
        }

        let plan = Self { components };
        plan.check_order()?;

        Ok(plan)
    }

    /// Construct a plan from explicit components.
    pub fn from_components(components: Vec<Component>) -> Result<Self, BundleCodesignError> {
        let plan = Self { components };
        plan.check_order()?;

        Ok(plan)
    }

    /// Ensure no component is nested inside one planned before it.
    pub fn check_order(&self) -> Result<(), BundleCodesignError> {
        let mut planned = HashSet::<&Path>::new();

        for component in &self.components {
            if let Some(outer) = component
                .path
                .ancestors()
                .skip(1)
                .find(|ancestor| planned.contains(ancestor))
            {
                return Err(BundleCodesignError::SigningOrderViolation {
                    inner: component.path.clone(),
                    outer: outer.to_path_buf(),
                });
            }

            planned.insert(&component.path);
        }

        Ok(())
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    /// Components of a single category, in signing order.
    pub fn category_components(
        &self,
        category: ComponentCategory,
    ) -> impl Iterator<Item = &Component> {
        self.components
            .iter()
            .filter(move |c| c.category == category)
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }
}
