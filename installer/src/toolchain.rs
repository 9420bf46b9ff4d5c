//! C++ compiler detection and minimum-version enforcement.
//!
//! The native library needs C++17, which rules out the stock compilers of
//! older enterprise distributions. The probe runs `<compiler> --version` for
//! each configured candidate and accepts the first one new enough.

use crate::error::{InstallerError, Result};
use crate::exec::{CommandExecutor, Invocation, combined_text};
use log::{debug, warn};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// A dotted compiler version, compared numerically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "String")]
pub struct CompilerVersion {
    major: u32,
    minor: u32,
    patch: u32,
}

impl CompilerVersion {
    /// Create a version from its components.
    #[must_use]
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Find the first `N.N` or `N.N.N` token in `--version` output.
    ///
    /// # Examples
    ///
    /// ```
    /// use modsec_installer::toolchain::CompilerVersion;
    ///
    /// let found = CompilerVersion::from_version_output(
    ///     "g++ (GCC) 4.8.5 20150623 (Red Hat 4.8.5-44)",
    /// );
    /// assert_eq!(found, Some(CompilerVersion::new(4, 8, 5)));
    /// ```
    #[must_use]
    pub fn from_version_output(text: &str) -> Option<Self> {
        text.lines().find_map(|line| {
            line.split_whitespace().find_map(|token| {
                let digits: String = token
                    .trim_start_matches('(')
                    .chars()
                    .take_while(|c| c.is_ascii_digit() || *c == '.')
                    .collect();
                digits.parse().ok()
            })
        })
    }
}

impl FromStr for CompilerVersion {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim_end_matches('.').split('.').collect();
        if !(2..=3).contains(&parts.len()) {
            return Err(format!("`{s}` is not a dotted version"));
        }
        let mut numbers = [0_u32; 3];
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            *slot = part
                .parse()
                .map_err(|_| format!("`{s}` is not a dotted version"))?;
        }
        let [major, minor, patch] = numbers;
        Ok(Self::new(major, minor, patch))
    }
}

impl TryFrom<String> for CompilerVersion {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for CompilerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Compilers to try, in order, and the oldest acceptable version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerRequirement {
    candidates: Vec<String>,
    minimum: CompilerVersion,
}

impl CompilerRequirement {
    /// Create a requirement.
    #[must_use]
    pub const fn new(candidates: Vec<String>, minimum: CompilerVersion) -> Self {
        Self {
            candidates,
            minimum,
        }
    }

    /// Minimum acceptable version.
    #[must_use]
    pub const fn minimum(&self) -> CompilerVersion {
        self.minimum
    }
}

/// A compiler that satisfied the requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedCompiler {
    /// Program name as probed.
    pub program: String,
    /// Parsed version.
    pub version: CompilerVersion,
}

/// Check `requirement` against the compilers on this machine.
///
/// # Errors
///
/// Returns [`InstallerError::ToolchainTooOld`] when a compiler was found but
/// none is recent enough, and [`InstallerError::ToolchainMissing`] when no
/// candidate could be run.
pub fn check_compiler(
    executor: &dyn CommandExecutor,
    requirement: &CompilerRequirement,
) -> Result<DetectedCompiler> {
    let mut too_old: Option<DetectedCompiler> = None;
    for program in &requirement.candidates {
        let invocation = Invocation::new(program.as_str())
            .arg("--version")
            .timeout(PROBE_TIMEOUT);
        let output = match executor.run(&invocation) {
            Ok(output) if output.status.success() => output,
            Ok(_) => {
                debug!("{program} --version exited unsuccessfully");
                continue;
            }
            Err(e) => {
                debug!("{program} unavailable: {e}");
                continue;
            }
        };
        let Some(version) = CompilerVersion::from_version_output(&combined_text(&output)) else {
            warn!("could not read a version from `{program} --version`");
            continue;
        };
        let detected = DetectedCompiler {
            program: program.clone(),
            version,
        };
        if version >= requirement.minimum {
            debug!("using {program} {version}");
            return Ok(detected);
        }
        too_old.get_or_insert(detected);
    }

    match too_old {
        Some(found) => Err(InstallerError::ToolchainTooOld {
            compiler: found.program,
            found: found.version.to_string(),
            minimum: requirement.minimum.to_string(),
        }),
        None => Err(InstallerError::ToolchainMissing {
            tried: requirement.candidates.join(", "),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::MockCommandExecutor;
    use crate::test_utils::{failure_output, output_with};
    use rstest::rstest;

    fn requirement() -> CompilerRequirement {
        CompilerRequirement::new(
            vec!["g++".to_owned(), "c++".to_owned()],
            CompilerVersion::new(7, 0, 0),
        )
    }

    #[rstest]
    #[case::rhel("g++ (GCC) 4.8.5 20150623 (Red Hat 4.8.5-44)", CompilerVersion::new(4, 8, 5))]
    #[case::ubuntu(
        "g++ (Ubuntu 11.4.0-1ubuntu1~22.04) 11.4.0\nCopyright (C) 2021",
        CompilerVersion::new(11, 4, 0)
    )]
    #[case::clang("Ubuntu clang version 14.0.0-1ubuntu1.1", CompilerVersion::new(14, 0, 0))]
    #[case::two_part("c++ (Alpine 12.2) 12.2", CompilerVersion::new(12, 2, 0))]
    fn parses_version_from_banner(#[case] banner: &str, #[case] expected: CompilerVersion) {
        assert_eq!(CompilerVersion::from_version_output(banner), Some(expected));
    }

    #[rstest]
    #[case("7.0.0", "6.5.0")]
    #[case("10.1.0", "9.9.9")]
    #[case("7.1.0", "7.0.10")]
    fn versions_compare_numerically(#[case] newer: &str, #[case] older: &str) {
        let newer: CompilerVersion = newer.parse().expect("newer");
        let older: CompilerVersion = older.parse().expect("older");
        assert!(newer > older);
    }

    #[test]
    fn accepts_first_recent_compiler() {
        let mut executor = MockCommandExecutor::new();
        executor
            .expect_run()
            .withf(|inv| inv.program() == "g++" && inv.arguments() == ["--version"])
            .times(1)
            .returning(|_| Ok(output_with(0, "g++ (GCC) 11.3.1 20220421\n", "")));

        let found = check_compiler(&executor, &requirement()).expect("compiler accepted");

        assert_eq!(found.program, "g++");
        assert_eq!(found.version, CompilerVersion::new(11, 3, 1));
    }

    #[test]
    fn old_compiler_is_rejected_with_versions() {
        let mut executor = MockCommandExecutor::new();
        executor
            .expect_run()
            .returning(|_| Ok(output_with(0, "g++ (GCC) 4.8.5 20150623\n", "")));

        let err = check_compiler(&executor, &requirement()).expect_err("too old");

        match err {
            InstallerError::ToolchainTooOld { found, minimum, .. } => {
                assert_eq!(found, "4.8.5");
                assert_eq!(minimum, "7.0.0");
            }
            other => panic!("expected ToolchainTooOld, got {other:?}"),
        }
    }

    #[test]
    fn falls_back_to_next_candidate() {
        let mut executor = MockCommandExecutor::new();
        executor
            .expect_run()
            .withf(|inv| inv.program() == "g++")
            .returning(|_| {
                Err(InstallerError::Command {
                    program: "g++".to_owned(),
                    reason: "program not found on PATH".to_owned(),
                })
            });
        executor
            .expect_run()
            .withf(|inv| inv.program() == "c++")
            .returning(|_| Ok(output_with(0, "c++ (GCC) 8.5.0\n", "")));

        let found = check_compiler(&executor, &requirement()).expect("fallback compiler");
        assert_eq!(found.program, "c++");
    }

    #[test]
    fn no_runnable_compiler_is_missing() {
        let mut executor = MockCommandExecutor::new();
        executor
            .expect_run()
            .returning(|_| Ok(failure_output("boom")));

        let err = check_compiler(&executor, &requirement()).expect_err("missing");
        assert!(matches!(err, InstallerError::ToolchainMissing { ref tried } if tried == "g++, c++"));
    }
}
