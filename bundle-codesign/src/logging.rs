// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Structured log output for CI systems.

Regular diagnostics go through the `log` facade. What this module adds are the
group and section markers CI systems use to fold log output. Markers are
written as bare lines on stderr, the same stream `env_logger` writes to, so
they stay ordered with the records they fold. The [LogContext] carrying the
CI backend is handed to the signing pipeline by its caller.
*/

use {
    crate::error::BundleCodesignError,
    log::{info, Level},
    std::{cell::RefCell, fmt::Formatter},
};

/// A CI system whose log markers we emit.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CiBackend {
    /// No markers.
    Plain,
    /// Azure Pipelines logging commands.
    Azure,
    /// GitHub Actions workflow commands.
    GitHub,
}

impl CiBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::Azure => "azure",
            Self::GitHub => "github",
        }
    }

    /// Detect the backend from environment variables set by the CI system.
    pub fn detect() -> Self {
        Self::detect_from(|key| std::env::var_os(key).is_some())
    }

    /// Detect the backend given a predicate for whether an env var is set.
    pub fn detect_from(is_set: impl Fn(&str) -> bool) -> Self {
        if is_set("TF_BUILD") {
            Self::Azure
        } else if is_set("GITHUB_ACTIONS") {
            Self::GitHub
        } else {
            Self::Plain
        }
    }

    pub fn group_start_marker(&self, name: &str) -> Option<String> {
        match self {
            Self::Plain => None,
            Self::Azure => Some(format!("##[group]{}", name)),
            Self::GitHub => Some(format!("::group::{}", name)),
        }
    }

    pub fn group_end_marker(&self) -> Option<String> {
        match self {
            Self::Plain => None,
            Self::Azure => Some("##[endgroup]".to_string()),
            Self::GitHub => Some("::endgroup::".to_string()),
        }
    }

    /// GitHub has no section command.
    pub fn section_marker(&self, name: &str) -> Option<String> {
        match self {
            Self::Azure => Some(format!("##[section]{}", name)),
            Self::Plain | Self::GitHub => None,
        }
    }

    /// Prefix for log lines of the given level.
    pub fn level_prefix(&self, level: Level) -> &'static str {
        match (self, level) {
            (Self::Azure, Level::Error) => "##[error]",
            (Self::Azure, Level::Warn) => "##[warning]",
            (Self::GitHub, Level::Error) => "::error::",
            (Self::GitHub, Level::Warn) => "::warning::",
            _ => "",
        }
    }
}

impl std::fmt::Display for CiBackend {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CiBackend {
    type Err = BundleCodesignError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain" => Ok(Self::Plain),
            "azure" => Ok(Self::Azure),
            "github" => Ok(Self::GitHub),
            _ => Err(BundleCodesignError::InvalidOption(format!(
                "unknown CI backend: {}",
                s
            ))),
        }
    }
}

#[derive(Debug)]
enum MarkerSink {
    Stderr,
    Memory(RefCell<Vec<String>>),
}

/// Where and how pipeline progress markers are written.
#[derive(Debug)]
pub struct LogContext {
    backend: CiBackend,
    sink: MarkerSink,
}

impl Default for LogContext {
    fn default() -> Self {
        Self::new(CiBackend::Plain)
    }
}

impl LogContext {
    /// Construct an instance writing markers to stderr.
    pub fn new(backend: CiBackend) -> Self {
        Self {
            backend,
            sink: MarkerSink::Stderr,
        }
    }

    /// Construct an instance collecting markers in memory.
    pub fn captured(backend: CiBackend) -> Self {
        Self {
            backend,
            sink: MarkerSink::Memory(RefCell::new(vec![])),
        }
    }

    pub fn backend(&self) -> CiBackend {
        self.backend
    }

    /// Markers emitted so far by a [LogContext::captured] instance.
    pub fn captured_lines(&self) -> Vec<String> {
        match &self.sink {
            MarkerSink::Stderr => vec![],
            MarkerSink::Memory(lines) => lines.borrow().clone(),
        }
    }

    fn emit(&self, line: String) {
        match &self.sink {
            MarkerSink::Stderr => eprintln!("{}", line),
            MarkerSink::Memory(lines) => lines.borrow_mut().push(line),
        }
    }

    pub fn group_start(&self, name: &str) {
        match self.backend.group_start_marker(name) {
            Some(marker) => self.emit(marker),
            None => info!("{}", name),
        }
    }

    pub fn group_end(&self) {
        if let Some(marker) = self.backend.group_end_marker() {
            self.emit(marker);
        }
    }

    pub fn section(&self, name: &str) {
        match self.backend.section_marker(name) {
            Some(marker) => self.emit(marker),
            None => info!("{}", name),
        }
    }

    /// Run `f` inside a named group.
    ///
    /// The group is closed whether or not `f` succeeds.
    pub fn group<T, E>(&self, name: &str, f: impl FnOnce() -> Result<T, E>) -> Result<T, E> {
        self.group_start(name);
        let res = f();
        self.group_end();

        res
    }
}

#[cfg(test)]
mod tests {
    use {super::*, std::collections::HashSet};

    #[test]
    fn detection() {
        let env = |vars: &'static [&'static str]| {
            let set = vars.iter().copied().collect::<HashSet<_>>();
            move |key: &str| set.contains(key)
        };

        assert_eq!(CiBackend::detect_from(env(&[])), CiBackend::Plain);
        assert_eq!(CiBackend::detect_from(env(&["TF_BUILD"])), CiBackend::Azure);
        assert_eq!(
            CiBackend::detect_from(env(&["GITHUB_ACTIONS"])),
            CiBackend::GitHub
        );
        assert_eq!(
            CiBackend::detect_from(env(&["GITHUB_ACTIONS", "TF_BUILD"])),
            CiBackend::Azure
        );
    }

    #[test]
    fn parse() -> anyhow::Result<()> {
        for backend in [CiBackend::Plain, CiBackend::Azure, CiBackend::GitHub] {
            assert_eq!(backend.as_str().parse::<CiBackend>()?, backend);
        }
        assert!("jenkins".parse::<CiBackend>().is_err());

        Ok(())
    }

    #[test]
    fn azure_markers() {
        let log = LogContext::captured(CiBackend::Azure);

        log.section("Signing App.app");
        let res: Result<(), &str> = log.group("plugins", || Err("boom"));
        assert!(res.is_err());

        assert_eq!(
            log.captured_lines(),
            vec!["##[section]Signing App.app", "##[group]plugins", "##[endgroup]"]
        );
        assert_eq!(CiBackend::Azure.level_prefix(Level::Warn), "##[warning]");
        assert_eq!(CiBackend::Azure.level_prefix(Level::Info), "");
    }

    #[test]
    fn github_markers() {
        let log = LogContext::captured(CiBackend::GitHub);

        log.section("Signing App.app");
        log.group_start("frameworks");
        log.group_end();

        assert_eq!(
            log.captured_lines(),
            vec!["::group::frameworks", "::endgroup::"]
        );
        assert_eq!(CiBackend::GitHub.level_prefix(Level::Error), "::error::");
    }

    #[test]
    fn plain_has_no_markers() {
        let log = LogContext::captured(CiBackend::Plain);

        log.section("Signing");
        let value: Result<u8, ()> = log.group("frameworks", || Ok(7));

        assert_eq!(value, Ok(7));
        assert!(log.captured_lines().is_empty());
    }
}
