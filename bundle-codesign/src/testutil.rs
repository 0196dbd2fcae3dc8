// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    crate::{
        error::BundleCodesignError,
        process::{CommandInvocation, CommandOutput, CommandRunner},
    },
    anyhow::Result,
    plist::{Dictionary, Value},
    std::{
        cell::RefCell,
        path::{Path, PathBuf},
    },
};

struct ScriptedResponse {
    program: String,
    needle: Option<String>,
    output: CommandOutput,
}

/// A [CommandRunner] recording every invocation and replying from a script.
///
/// Unscripted invocations succeed with empty output.
#[derive(Default)]
pub struct RecordingRunner {
    responses: Vec<ScriptedResponse>,
    commands: RefCell<Vec<Vec<String>>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply to invocations of `program` with `stdout`.
    pub fn respond(mut self, program: &str, stdout: &str) -> Self {
        self.responses.push(ScriptedResponse {
            program: program.to_string(),
            needle: None,
            output: CommandOutput::success_with_stdout(stdout),
        });
        self
    }

    /// Fail every invocation of `program`.
    pub fn fail(mut self, program: &str, status: i32, stderr: &str) -> Self {
        self.responses.push(ScriptedResponse {
            program: program.to_string(),
            needle: None,
            output: CommandOutput::failure(status, stderr),
        });
        self
    }

    /// Fail invocations of `program` having an argument containing `needle`.
    pub fn fail_on(mut self, program: &str, needle: &str, status: i32, stderr: &str) -> Self {
        self.responses.push(ScriptedResponse {
            program: program.to_string(),
            needle: Some(needle.to_string()),
            output: CommandOutput::failure(status, stderr),
        });
        self
    }

    /// Every argv seen so far, in order.
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.commands.borrow().clone()
    }

    /// Targets of `codesign --sign` invocations, in order.
    pub fn signed_paths(&self) -> Vec<PathBuf> {
        self.commands
            .borrow()
            .iter()
            .filter(|argv| argv[0] == "codesign" && argv.iter().any(|a| a == "--sign"))
            .filter_map(|argv| argv.last().map(PathBuf::from))
            .collect()
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, invocation: &CommandInvocation) -> Result<CommandOutput, BundleCodesignError> {
        self.commands.borrow_mut().push(invocation.argv());

        let response = self.responses.iter().find(|r| {
            r.program == invocation.program()
                && r
                    .needle
                    .as_ref()
                    .map(|needle| invocation.arguments().iter().any(|a| a.contains(needle)))
                    .unwrap_or(true)
        });

        Ok(response
            .map(|r| r.output.clone())
            .unwrap_or_else(|| CommandOutput::success_with_stdout("")))
    }
}

/// Write a small file, creating parent directories.
pub fn write_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, b"\xca\xfe\xba\xbe")?;

    Ok(())
}

fn info_plist(executable: &str) -> Dictionary {
    let mut dict = Dictionary::new();
    dict.insert(
        "CFBundleExecutable".into(),
        Value::String(executable.into()),
    );
    dict.insert(
        "CFBundleIdentifier".into(),
        Value::String(format!("com.example.{}", executable.to_lowercase())),
    );
    dict.insert("CFBundleName".into(), Value::String(executable.into()));
    dict.insert("CFBundleVersion".into(), Value::String("1.0".into()));

    dict
}

/// Create `parent/name` as a minimal application bundle.
pub fn create_app_bundle(parent: &Path, name: &str, executable: &str) -> Result<PathBuf> {
    let root = parent.join(name);
    let contents = root.join("Contents");

    let mut dict = info_plist(executable);
    dict.insert("CFBundlePackageType".into(), Value::String("APPL".into()));

    write_file(&contents.join("MacOS").join(executable))?;
    Value::Dictionary(dict).to_file_xml(contents.join("Info.plist"))?;
    std::fs::write(contents.join("PkgInfo"), b"APPL????")?;

    Ok(root)
}

/// Create a bundle with a `Contents/` layout at `path`.
pub fn create_nested_bundle(path: &Path, executable: &str) -> Result<()> {
    let contents = path.join("Contents");

    write_file(&contents.join("MacOS").join(executable))?;
    Value::Dictionary(info_plist(executable)).to_file_xml(contents.join("Info.plist"))?;

    Ok(())
}

/// Create a shallow framework at `path`.
pub fn create_framework(path: &Path, name: &str) -> Result<()> {
    write_file(&path.join(name))?;
    std::fs::create_dir_all(path.join("Resources"))?;
    Value::Dictionary(info_plist(name)).to_file_xml(path.join("Resources").join("Info.plist"))?;

    Ok(())
}
