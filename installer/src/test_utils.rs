//! Shared test utilities for the installer crate.

use crate::error::{InstallerError, Result};
use crate::exec::{CommandExecutor, Invocation};
use camino::{Utf8Path, Utf8PathBuf};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::io::Write;
use std::process::{ExitStatus, Output};
use tempfile::TempDir;

/// Creates an `ExitStatus` from an exit code (Unix implementation).
#[cfg(unix)]
#[must_use]
pub fn exit_status(code: i32) -> ExitStatus {
    use std::os::unix::process::ExitStatusExt;

    ExitStatus::from_raw(code << 8)
}

/// Creates an `ExitStatus` from an exit code (Windows implementation).
#[cfg(windows)]
#[must_use]
pub fn exit_status(code: i32) -> ExitStatus {
    use std::os::windows::process::ExitStatusExt;

    ExitStatus::from_raw(code as u32)
}

/// Creates a successful command `Output` with empty stdout and stderr.
#[must_use]
pub fn success_output() -> Output {
    output_with(0, "", "")
}

/// Creates a failed command `Output` with the given stderr message.
#[must_use]
pub fn failure_output(stderr: &str) -> Output {
    output_with(1, "", stderr)
}

/// Creates an `Output` with the given exit code and stream contents.
#[must_use]
pub fn output_with(code: i32, stdout: &str, stderr: &str) -> Output {
    Output {
        status: exit_status(code),
        stdout: stdout.as_bytes().to_vec(),
        stderr: stderr.as_bytes().to_vec(),
    }
}

type Effect = Box<dyn Fn(&Invocation)>;

/// Represents an expected command invocation for testing.
pub struct ExpectedCall {
    /// The program expected to run (e.g. "git").
    pub cmd: String,
    /// The arguments expected, in order.
    pub args: Vec<String>,
    /// The result to return when this command is invoked.
    pub result: Result<Output>,
    effect: Option<Effect>,
}

impl ExpectedCall {
    /// Expect `cmd args...` and answer with `result`.
    pub fn new<S: AsRef<str>>(cmd: &str, args: &[S], result: Result<Output>) -> Self {
        Self {
            cmd: cmd.to_owned(),
            args: args.iter().map(|a| a.as_ref().to_owned()).collect(),
            result,
            effect: None,
        }
    }

    /// Expect `cmd args...` and answer with a zero exit status.
    pub fn ok<S: AsRef<str>>(cmd: &str, args: &[S]) -> Self {
        Self::new(cmd, args, Ok(success_output()))
    }

    /// Run `effect` when the call is matched, before returning the result.
    ///
    /// Used to simulate the filesystem side effects of the real command, such
    /// as `make` producing a library.
    #[must_use]
    pub fn with_effect(mut self, effect: impl Fn(&Invocation) + 'static) -> Self {
        self.effect = Some(Box::new(effect));
        self
    }
}

impl fmt::Debug for ExpectedCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpectedCall")
            .field("cmd", &self.cmd)
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}

/// A stub implementation of `CommandExecutor` for testing.
///
/// Records expected command invocations and returns predefined results,
/// allowing tests to verify command execution without side effects. An
/// unexpected or mismatched call yields [`InstallerError::StubMismatch`].
#[derive(Debug, Default)]
pub struct StubExecutor {
    expected: RefCell<VecDeque<ExpectedCall>>,
    calls: Cell<usize>,
}

impl StubExecutor {
    /// Creates a new `StubExecutor` with the given expected calls.
    #[must_use]
    pub fn new(expected: Vec<ExpectedCall>) -> Self {
        Self {
            expected: RefCell::new(expected.into()),
            calls: Cell::new(0),
        }
    }

    /// Number of invocations received so far, matched or not.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.get()
    }

    /// Asserts that all expected command invocations have been consumed.
    ///
    /// # Panics
    ///
    /// Panics if there are remaining expected calls that were not invoked.
    pub fn assert_finished(&self) {
        let remaining = self.expected.borrow();
        assert!(
            remaining.is_empty(),
            "expected no further command invocations, still waiting for {remaining:?}"
        );
    }
}

impl CommandExecutor for StubExecutor {
    fn run(&self, invocation: &Invocation) -> Result<Output> {
        self.calls.set(self.calls.get() + 1);
        let Some(call) = self.expected.borrow_mut().pop_front() else {
            return Err(InstallerError::StubMismatch {
                message: format!("unexpected command invocation: {invocation}"),
            });
        };

        if call.cmd != invocation.program() || call.args.as_slice() != invocation.arguments() {
            return Err(InstallerError::StubMismatch {
                message: format!(
                    "expected `{} {}`, got `{invocation}`",
                    call.cmd,
                    call.args.join(" ")
                ),
            });
        }

        if let Some(effect) = &call.effect {
            effect(invocation);
        }
        call.result
    }
}

/// Creates a temporary directory and returns it with its UTF-8 path.
///
/// # Panics
///
/// Panics if the directory cannot be created or its path is not UTF-8.
#[must_use]
pub fn utf8_temp_dir() -> (TempDir, Utf8PathBuf) {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = Utf8PathBuf::try_from(dir.path().to_path_buf()).expect("UTF-8 temp path");
    (dir, path)
}

/// Writes a gzip-compressed tarball at `dest` holding `entries`.
///
/// Entry names are used verbatim, so a common leading directory produces an
/// archive shaped like an upstream source release.
///
/// # Panics
///
/// Panics on any I/O error.
pub fn write_tar_gz(dest: &Utf8Path, entries: &[(&str, &[u8])]) {
    let file = std::fs::File::create(dest).expect("create archive");
    let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::fast());
    let mut builder = tar::Builder::new(encoder);
    for (name, contents) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, name, *contents)
            .expect("append entry");
    }
    let encoder = builder.into_inner().expect("finish tar");
    encoder.finish().expect("finish gzip");
}

/// Writes a zip archive at `dest` holding `entries`.
///
/// # Panics
///
/// Panics on any I/O error.
pub fn write_zip(dest: &Utf8Path, entries: &[(&str, &[u8])]) {
    let file = std::fs::File::create(dest).expect("create archive");
    let mut writer = zip::ZipWriter::new(file);
    for (name, contents) in entries {
        writer
            .start_file(*name, zip::write::SimpleFileOptions::default())
            .expect("start zip entry");
        writer.write_all(contents).expect("write zip entry");
    }
    writer.finish().expect("finish zip");
}

/// Runs `f` with `XDG_CACHE_HOME` pointing at `cache_home`.
#[must_use]
pub fn with_cache_home<R>(cache_home: &Utf8Path, f: impl FnOnce() -> R) -> R {
    temp_env::with_var("XDG_CACHE_HOME", Some(cache_home.as_str()), f)
}
