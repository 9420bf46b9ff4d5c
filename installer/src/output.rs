//! Output formatting for the installer CLI.
//!
//! Progress and results go to stderr as plain lines. Library diagnostics
//! flow through the `log` facade and are rendered by `env_logger` on the same
//! stream.

use camino::Utf8Path;
use log::LevelFilter;
use std::fmt::Display;
use std::io::Write;

/// Write one line to `stderr`, ignoring write failures.
pub fn write_stderr_line(stderr: &mut dyn Write, message: impl Display) {
    if writeln!(stderr, "{message}").is_err() {
        // Best-effort logging; ignore write failures.
    }
}

/// Write a progress line unless `quiet` is set.
pub fn progress(quiet: bool, stderr: &mut dyn Write, message: impl Display) {
    if !quiet {
        write_stderr_line(stderr, message);
    }
}

/// Log level selected by `-v`/`-q`.
///
/// # Example
///
/// ```
/// use log::LevelFilter;
/// use modsec_installer::output::level_for;
///
/// assert_eq!(level_for(0, false), LevelFilter::Warn);
/// assert_eq!(level_for(2, false), LevelFilter::Debug);
/// assert_eq!(level_for(0, true), LevelFilter::Error);
/// ```
#[must_use]
pub const fn level_for(verbosity: u8, quiet: bool) -> LevelFilter {
    if quiet {
        return LevelFilter::Error;
    }
    match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Environment variable that overrides the `-v`/`-q` log filter, using
/// `env_logger` directive syntax (`debug`, `modsec_installer::resolver=trace`).
pub const LOG_ENV: &str = "MODSEC_INSTALLER_LOG";

/// `env_logger` builder writing `LEVEL message` lines to stderr at `level`.
///
/// Directives in [`LOG_ENV`] are applied on top of `level`.
#[must_use]
pub fn logger_builder(level: LevelFilter) -> env_logger::Builder {
    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(level)
        .format_timestamp(None)
        .format_target(false)
        .target(env_logger::Target::Stderr)
        .parse_env(env_logger::Env::new().filter(LOG_ENV));
    builder
}

/// Install the global logger for `-v`/`-q`. A logger that is already
/// installed is left in place.
pub fn init_logging(verbosity: u8, quiet: bool) {
    if logger_builder(level_for(verbosity, quiet)).try_init().is_err() {
        // Another logger was installed first; keep it.
    }
}

/// Format a success message after installation.
#[must_use]
pub fn success_message(module: &Utf8Path, binary: &Utf8Path) -> String {
    format!(
        "Installed {module}\nAdd `load_module {module};` to the main context of the {binary} configuration, then reload nginx."
    )
}

/// Format the message for a module the host refused to load.
#[must_use]
pub fn quarantine_message(quarantined: &Utf8Path, diagnostic: &str) -> String {
    format!(
        "The built module is not binary compatible with the running nginx and was not installed.\nQuarantined at {quarantined}\nnginx said: {diagnostic}"
    )
}

/// Configuration information for dry-run output.
///
/// # Example
///
/// ```
/// use camino::Utf8PathBuf;
/// use modsec_installer::output::DryRunInfo;
///
/// let work = Utf8PathBuf::from("/tmp/modsecurity_build");
/// let cache = Utf8PathBuf::from("/root/.cache/modsec-installer");
///
/// let info = DryRunInfo {
///     work_dir: &work,
///     cache_dir: &cache,
///     package_family: "rhel",
///     modsecurity_version: "3.0.14",
///     connector_version: "1.0.3",
///     nginx_binary: None,
///     install_prefix: "/usr/local/modsecurity",
///     jobs: 4,
///     max_retries: 2,
///     force: false,
///     skip_deps: false,
/// };
///
/// let output = info.display_text();
/// assert!(output.contains("Dry run"));
/// assert!(output.contains("3.0.14"));
/// ```
#[derive(Debug)]
pub struct DryRunInfo<'a> {
    /// Transient build directory.
    pub work_dir: &'a Utf8Path,
    /// Artifact cache root.
    pub cache_dir: &'a Utf8Path,
    /// Detected package family.
    pub package_family: &'a str,
    /// ModSecurity version to build.
    pub modsecurity_version: &'a str,
    /// Connector version to build.
    pub connector_version: &'a str,
    /// Explicit host binary, if any.
    pub nginx_binary: Option<&'a Utf8Path>,
    /// Installation prefix of the library.
    pub install_prefix: &'a str,
    /// Parallel make jobs.
    pub jobs: usize,
    /// Build retries after the first failure.
    pub max_retries: u32,
    /// Whether caches and previous builds are ignored.
    pub force: bool,
    /// Whether dependency installation is skipped.
    pub skip_deps: bool,
}

impl DryRunInfo<'_> {
    /// Format the dry-run information for display.
    #[must_use]
    pub fn display_text(&self) -> String {
        let binary = self
            .nginx_binary
            .map_or_else(|| "auto-detect".to_owned(), ToString::to_string);
        [
            "Dry run - no files will be modified".to_owned(),
            String::new(),
            format!("Work directory: {}", self.work_dir),
            format!("Cache directory: {}", self.cache_dir),
            format!("Package family: {}", self.package_family),
            format!("ModSecurity version: {}", self.modsecurity_version),
            format!("Connector version: {}", self.connector_version),
            format!("nginx binary: {binary}"),
            format!("Install prefix: {}", self.install_prefix),
            format!("Parallel jobs: {}", self.jobs),
            format!("Max retries: {}", self.max_retries),
            format!("Force: {}", self.force),
            format!("Skip deps: {}", self.skip_deps),
        ]
        .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::{Level, Log, Metadata};
    use rstest::rstest;

    #[rstest]
    #[case::quiet_wins(3, true, LevelFilter::Error)]
    #[case::default(0, false, LevelFilter::Warn)]
    #[case::verbose(1, false, LevelFilter::Info)]
    #[case::very_verbose(5, false, LevelFilter::Trace)]
    fn verbosity_maps_to_level(
        #[case] verbosity: u8,
        #[case] quiet: bool,
        #[case] expected: LevelFilter,
    ) {
        assert_eq!(level_for(verbosity, quiet), expected);
    }

    #[rstest]
    #[case::quiet(0, true, Level::Error, Level::Warn)]
    #[case::default(0, false, Level::Warn, Level::Info)]
    #[case::verbose(1, false, Level::Info, Level::Debug)]
    fn logger_passes_records_at_the_selected_level(
        #[case] verbosity: u8,
        #[case] quiet: bool,
        #[case] shown: Level,
        #[case] hidden: Level,
    ) {
        let logger = temp_env::with_var_unset(LOG_ENV, || {
            logger_builder(level_for(verbosity, quiet)).build()
        });
        let record = |level| Metadata::builder().level(level).build();

        assert!(logger.enabled(&record(shown)));
        assert!(!logger.enabled(&record(hidden)));
    }

    #[test]
    fn environment_directives_override_flags() {
        let logger = temp_env::with_var(LOG_ENV, Some("trace"), || {
            logger_builder(LevelFilter::Warn).build()
        });
        assert_eq!(logger.filter(), LevelFilter::Trace);
    }

    #[rstest]
    #[case::quiet(true, "")]
    #[case::loud(false, "fetching\n")]
    fn progress_respects_quiet(#[case] quiet: bool, #[case] expected: &str) {
        let mut stderr = Vec::new();
        progress(quiet, &mut stderr, "fetching");
        assert_eq!(String::from_utf8_lossy(&stderr), expected);
    }

    #[test]
    fn success_message_names_module_and_binary() {
        let msg = success_message(
            Utf8Path::new("/usr/lib64/nginx/modules/ngx_http_modsecurity_module.so"),
            Utf8Path::new("/usr/sbin/nginx"),
        );
        assert!(msg.contains("load_module /usr/lib64/nginx/modules/ngx_http_modsecurity_module.so;"));
        assert!(msg.contains("/usr/sbin/nginx"));
    }

    #[test]
    fn dry_run_reports_auto_detect_without_binary() {
        let work = Utf8Path::new("/w");
        let cache = Utf8Path::new("/c");
        let info = DryRunInfo {
            work_dir: work,
            cache_dir: cache,
            package_family: "debian",
            modsecurity_version: "3.0.14",
            connector_version: "1.0.3",
            nginx_binary: None,
            install_prefix: "/usr/local/modsecurity",
            jobs: 1,
            max_retries: 0,
            force: true,
            skip_deps: false,
        };

        let text = info.display_text();
        assert!(text.contains("nginx binary: auto-detect"));
        assert!(text.contains("Force: true"));
        assert!(text.contains("Package family: debian"));
    }
}
