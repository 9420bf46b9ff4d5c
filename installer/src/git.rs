//! Git operations: cloning mirrors and inspecting submodules.
//!
//! All commands run through a [`CommandExecutor`] with a timeout and with
//! interactive credential prompts disabled, so an unreachable or private
//! mirror fails fast instead of hanging.

use crate::error::{InstallerError, Result};
use crate::exec::{CommandExecutor, Invocation, combined_text, describe_status, tail_lines};
use camino::Utf8Path;
use std::process::Output;
use std::time::Duration;

/// Checkout state reported by `git submodule status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmoduleState {
    /// Checked out at the recorded commit (leading space).
    Current,
    /// Not initialised; no commit checked out (leading `-`).
    Uninitialized,
    /// Checked out at a different commit (leading `+`).
    OutOfDate,
    /// Merge conflicts (leading `U`).
    Conflicted,
}

/// One line of `git submodule status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmoduleStatus {
    /// Checkout state.
    pub state: SubmoduleState,
    /// Recorded commit hash.
    pub commit: String,
    /// Path relative to the repository root.
    pub path: String,
}

/// Parse `git submodule status` output. Unrecognised lines are skipped.
///
/// # Examples
///
/// ```
/// use modsec_installer::git::{SubmoduleState, parse_submodule_status};
///
/// let parsed = parse_submodule_status(
///     "-a1b2c3 bindings/python\n 0d9e8f test/test-cases/secrules-language-tests (heads/master)\n",
/// );
/// assert_eq!(parsed[0].state, SubmoduleState::Uninitialized);
/// assert_eq!(parsed[1].path, "test/test-cases/secrules-language-tests");
/// ```
#[must_use]
pub fn parse_submodule_status(text: &str) -> Vec<SubmoduleStatus> {
    text.lines()
        .filter_map(|line| {
            let mut chars = line.chars();
            let state = match chars.next()? {
                ' ' => SubmoduleState::Current,
                '-' => SubmoduleState::Uninitialized,
                '+' => SubmoduleState::OutOfDate,
                'U' => SubmoduleState::Conflicted,
                _ => return None,
            };
            let mut fields = chars.as_str().split_whitespace();
            let commit = fields.next()?.to_owned();
            let path = fields.next()?.to_owned();
            Some(SubmoduleStatus {
                state,
                commit,
                path,
            })
        })
        .collect()
}

/// Git client bound to a command executor.
#[derive(Clone, Copy)]
pub struct GitClient<'a> {
    executor: &'a dyn CommandExecutor,
    timeout: Duration,
}

impl<'a> GitClient<'a> {
    /// Create a client whose network operations are bounded by `timeout`.
    #[must_use]
    pub fn new(executor: &'a dyn CommandExecutor, timeout: Duration) -> Self {
        Self { executor, timeout }
    }

    /// Clone `url` into `dest` recursively.
    ///
    /// `depth` of zero clones full history. `reference` selects a branch or
    /// tag.
    ///
    /// # Errors
    ///
    /// Returns [`InstallerError::Git`] if the clone exits non-zero, or
    /// [`InstallerError::Command`] if it cannot start or times out.
    pub fn clone_repository(
        &self,
        url: &str,
        reference: Option<&str>,
        depth: u32,
        dest: &Utf8Path,
    ) -> Result<()> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut invocation = Invocation::new("git").args(["clone", "--recursive"]);
        if depth > 0 {
            invocation = invocation.arg(format!("--depth={depth}"));
        }
        if let Some(reference) = reference {
            invocation = invocation.args(["--branch", reference]);
        }
        let invocation = invocation.args([url, dest.as_str()]);
        let output = self.run_network(invocation)?;
        check("clone", &output)
    }

    /// Report the status of every declared submodule.
    ///
    /// # Errors
    ///
    /// Returns [`InstallerError::Git`] if `git submodule status` fails.
    pub fn submodule_status(&self, repo: &Utf8Path) -> Result<Vec<SubmoduleStatus>> {
        let output = self.executor.run(
            &Invocation::new("git")
                .args(["submodule", "status"])
                .current_dir(repo),
        )?;
        check("submodule status", &output)?;
        Ok(parse_submodule_status(&String::from_utf8_lossy(
            &output.stdout,
        )))
    }

    /// Initialise and update the given submodule paths recursively.
    ///
    /// # Errors
    ///
    /// Returns [`InstallerError::Git`] if the update exits non-zero, or
    /// [`InstallerError::Command`] if it cannot start or times out.
    pub fn submodule_update(&self, repo: &Utf8Path, paths: &[String]) -> Result<()> {
        let invocation = Invocation::new("git")
            .args(["submodule", "update", "--init", "--recursive", "--"])
            .args(paths.iter().map(String::as_str))
            .current_dir(repo);
        let output = self.run_network(invocation)?;
        check("submodule update", &output)
    }

    fn run_network(&self, invocation: Invocation) -> Result<Output> {
        self.executor.run(
            &invocation
                .env("GIT_TERMINAL_PROMPT", "0")
                .timeout(self.timeout),
        )
    }
}

fn check(operation: &'static str, output: &Output) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    let detail = tail_lines(&combined_text(output), 3);
    Err(InstallerError::Git {
        operation,
        message: if detail.is_empty() {
            describe_status(output)
        } else {
            format!("{}: {detail}", describe_status(output))
        },
    })
}
