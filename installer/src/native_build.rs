//! Native library build with bounded, clean-state retries.
//!
//! A build is `bootstrap → configure → make`. A failed attempt is recorded
//! with its stage, exit code and classified diagnostics, the tree is cleaned,
//! and the next attempt starts over. The expected artifact on disk, not any
//! exit status, decides success.

use crate::configure_args::{ConfigureArg, render_args};
use crate::diagnostics::{Diagnostic, classify, suggested_packages};
use crate::environment::PackageFamily;
use crate::error::{InstallerError, Result};
use crate::exec::{CommandExecutor, Invocation, combined_text};
use crate::toolchain::{CompilerRequirement, check_compiler};
use camino::{Utf8Path, Utf8PathBuf};
use log::{debug, info, warn};
use std::fmt;
use std::num::NonZeroUsize;

/// Library produced by a ModSecurity build, relative to its source tree.
pub const MODSECURITY_LIBRARY: &str = "src/.libs/libmodsecurity.so";

/// Scripts that generate `configure`, in preference order.
const BOOTSTRAP_SCRIPTS: [&str; 2] = ["build.sh", "autogen.sh"];

/// Step of a build attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStage {
    /// Generating the `configure` script.
    Bootstrap,
    /// Running `configure`.
    Configure,
    /// Running `make`.
    Compile,
    /// Running `make install`.
    Install,
}

impl fmt::Display for BuildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Bootstrap => "bootstrap",
            Self::Configure => "configure",
            Self::Compile => "compile",
            Self::Install => "install",
        })
    }
}

/// One failed build attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Stage that failed.
    pub stage: BuildStage,
    /// Exit code of the failing step; `None` when killed by a signal.
    pub exit_code: Option<i32>,
    /// Findings from the step's output.
    pub diagnostics: Vec<Diagnostic>,
}

/// Render attempt history, followed by a package hint when one is known.
#[must_use]
pub fn render_attempts(attempts: &[AttemptRecord]) -> String {
    let mut text = String::new();
    for record in attempts {
        let status = record
            .exit_code
            .map_or_else(|| "terminated by signal".to_owned(), |c| format!("exit status {c}"));
        text.push_str(&format!(
            "\n  attempt {}: {} failed ({status})",
            record.attempt, record.stage
        ));
        for diagnostic in &record.diagnostics {
            text.push_str(&format!("\n    - {diagnostic}"));
        }
    }
    let all: Vec<Diagnostic> = attempts
        .iter()
        .flat_map(|r| r.diagnostics.iter().cloned())
        .collect();
    let packages = suggested_packages(&all);
    if !packages.is_empty() {
        text.push_str("\ninstall the missing development packages and retry: ");
        text.push_str(&packages.join(" "));
    }
    text
}

/// What to build and how to recognise that it was built.
#[derive(Debug, Clone)]
pub struct BuildTarget {
    /// Identity used in messages, e.g. `modsecurity 3.0.14`.
    pub name: String,
    /// Source tree to build in.
    pub source_dir: Utf8PathBuf,
    /// Arguments passed to `configure`, one argv element each.
    pub configure_args: Vec<ConfigureArg>,
    /// Expected output, relative to `source_dir`.
    pub artifact: Utf8PathBuf,
    /// Compiler the build needs.
    pub compiler: CompilerRequirement,
}

impl BuildTarget {
    /// Absolute path of the expected output.
    #[must_use]
    pub fn artifact_path(&self) -> Utf8PathBuf {
        self.source_dir.join(&self.artifact)
    }
}

/// Result of [`NativeBuilder::build`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutput {
    /// Path of the produced artifact.
    pub artifact: Utf8PathBuf,
    /// Attempts made; zero when an existing build was reused.
    pub attempts: u32,
}

impl BuildOutput {
    /// Whether a previous build was reused without running anything.
    #[must_use]
    pub const fn reused(&self) -> bool {
        self.attempts == 0
    }
}

/// Runs configure/make builds.
pub struct NativeBuilder<'a> {
    executor: &'a dyn CommandExecutor,
    family: PackageFamily,
    jobs: NonZeroUsize,
    force: bool,
}

impl<'a> NativeBuilder<'a> {
    /// Create a builder. `family` selects package suggestions in
    /// diagnostics; `force` rebuilds even when the artifact exists.
    #[must_use]
    pub const fn new(
        executor: &'a dyn CommandExecutor,
        family: PackageFamily,
        jobs: NonZeroUsize,
        force: bool,
    ) -> Self {
        Self {
            executor,
            family,
            jobs,
            force,
        }
    }

    /// Build `target`, making at most `max_retries + 1` attempts.
    ///
    /// # Errors
    ///
    /// Returns [`InstallerError::ToolchainTooOld`] or
    /// [`InstallerError::ToolchainMissing`] before any build step runs,
    /// [`InstallerError::BuildFailure`] with every attempt's record once
    /// retries are exhausted, and [`InstallerError::Command`] when a build
    /// tool cannot be started at all.
    pub fn build(&self, target: &BuildTarget, max_retries: u32) -> Result<BuildOutput> {
        let artifact = target.artifact_path();
        if !self.force && artifact.is_file() {
            info!("{} already built at {artifact}; skipping", target.name);
            return Ok(BuildOutput {
                artifact,
                attempts: 0,
            });
        }

        let compiler = check_compiler(self.executor, &target.compiler)?;
        debug!("building {} with {} {}", target.name, compiler.program, compiler.version);

        let total = max_retries.saturating_add(1);
        let mut history = Vec::new();
        for attempt in 1..=total {
            if attempt > 1 || self.force {
                self.clean(target)?;
            }
            match self.attempt(target, attempt)? {
                None if artifact.is_file() => {
                    return Ok(BuildOutput {
                        artifact,
                        attempts: attempt,
                    });
                }
                None => history.push(AttemptRecord {
                    attempt,
                    stage: BuildStage::Compile,
                    exit_code: Some(0),
                    diagnostics: vec![Diagnostic::Unclassified {
                        tail: format!("make succeeded but {artifact} was not produced"),
                    }],
                }),
                Some(record) => history.push(record),
            }
            warn!("build attempt {attempt}/{total} of {} failed", target.name);
        }

        Err(InstallerError::BuildFailure {
            artifact: target.name.clone(),
            attempts: history,
        })
    }

    /// Run `make install` in a built tree.
    ///
    /// # Errors
    ///
    /// Returns [`InstallerError::BuildFailure`] with a single
    /// [`BuildStage::Install`] record when installation fails.
    pub fn install(&self, target: &BuildTarget) -> Result<()> {
        let invocation = Invocation::new("make")
            .arg("install")
            .current_dir(target.source_dir.clone());
        match self.step(BuildStage::Install, 1, &invocation)? {
            None => Ok(()),
            Some(record) => Err(InstallerError::BuildFailure {
                artifact: target.name.clone(),
                attempts: vec![record],
            }),
        }
    }

    fn attempt(&self, target: &BuildTarget, attempt: u32) -> Result<Option<AttemptRecord>> {
        let dir = &target.source_dir;
        if !dir.join("configure").is_file() {
            let Some(script) = BOOTSTRAP_SCRIPTS
                .iter()
                .find(|script| dir.join(script).is_file())
            else {
                return Ok(Some(AttemptRecord {
                    attempt,
                    stage: BuildStage::Bootstrap,
                    exit_code: None,
                    diagnostics: vec![Diagnostic::Unclassified {
                        tail: format!("{dir} has no configure, build.sh or autogen.sh"),
                    }],
                }));
            };
            let bootstrap = Invocation::new("sh").arg(*script).current_dir(dir.clone());
            if let Some(record) = self.step(BuildStage::Bootstrap, attempt, &bootstrap)? {
                return Ok(Some(record));
            }
        }

        let configure = Invocation::new("sh")
            .arg("./configure")
            .args(render_args(&target.configure_args))
            .current_dir(dir.clone());
        if let Some(record) = self.step(BuildStage::Configure, attempt, &configure)? {
            return Ok(Some(record));
        }

        let make = Invocation::new("make")
            .arg(format!("-j{}", self.jobs))
            .current_dir(dir.clone());
        self.step(BuildStage::Compile, attempt, &make)
    }

    fn step(
        &self,
        stage: BuildStage,
        attempt: u32,
        invocation: &Invocation,
    ) -> Result<Option<AttemptRecord>> {
        run_stage(self.executor, self.family, stage, attempt, invocation)
    }

    /// Remove build products, leaving sources untouched.
    fn clean(&self, target: &BuildTarget) -> Result<()> {
        let dir = &target.source_dir;
        if dir.join("Makefile").is_file() {
            let invocation = Invocation::new("make").arg("clean").current_dir(dir.clone());
            let output = self.executor.run(&invocation)?;
            if !output.status.success() {
                debug!("make clean in {dir} exited unsuccessfully");
            }
        }
        remove_if_present(&target.artifact_path())
    }
}

/// Run one build step; `None` on success, the attempt record on failure.
pub(crate) fn run_stage(
    executor: &dyn CommandExecutor,
    family: PackageFamily,
    stage: BuildStage,
    attempt: u32,
    invocation: &Invocation,
) -> Result<Option<AttemptRecord>> {
    info!("{stage}: {invocation}");
    let output = executor.run(invocation)?;
    if output.status.success() {
        return Ok(None);
    }
    Ok(Some(AttemptRecord {
        attempt,
        stage,
        exit_code: output.status.code(),
        diagnostics: classify(&combined_text(&output), family),
    }))
}

fn remove_if_present(path: &Utf8Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

#[cfg(test)]
#[path = "native_build_tests.rs"]
mod tests;
