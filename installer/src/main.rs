//! ModSecurity installer CLI entrypoint.
//!
//! This binary fetches, builds and verifies the ModSecurity nginx connector
//! against the running nginx, and installs it only when nginx accepts it.

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use modsec_installer::cache::CacheStore;
use modsec_installer::cli::Cli;
use modsec_installer::config::InstallerConfig;
use modsec_installer::dirs::{BaseDirs, DEFAULT_WORK_DIR, SystemBaseDirs, default_cache_root};
use modsec_installer::download::HttpDownloader;
use modsec_installer::environment::{EnvironmentProfile, PackageFamily};
use modsec_installer::error::Result;
use modsec_installer::exec::SystemCommandExecutor;
use modsec_installer::git::GitClient;
use modsec_installer::output::{
    DryRunInfo, init_logging, progress, quarantine_message, success_message, write_stderr_line,
};
use modsec_installer::packages::SystemPackageInstaller;
use modsec_installer::pipeline::{PipelineContext, PipelineOutcome, run_pipeline};
use modsec_installer::resolver::{NetworkFetcher, RetryPolicy, SourceResolver};
use modsec_installer::workdir::{InterruptGuard, WorkDir};
use std::io::Write;

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbosity, cli.quiet);
    let mut stderr = std::io::stderr();
    let run_result = run(&cli, &mut stderr);
    let exit_code = exit_code_for_run_result(run_result, &mut stderr);
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
}

fn run(cli: &Cli, stderr: &mut dyn Write) -> Result<i32> {
    let environment = environment_for_cli(cli, &SystemBaseDirs, Utf8Path::new("/"))?;
    let cache = CacheStore::new(environment.cache_root());

    if cli.clear_cache {
        cache.clear()?;
        progress(
            cli.quiet,
            stderr,
            format!("Cleared cache at {}", cache.root()),
        );
        return Ok(0);
    }

    // Dry-run mode: show what would be done without side effects
    if cli.dry_run {
        print_dry_run_info(cli, &environment, stderr);
        return Ok(0);
    }

    let guard = InterruptGuard::new();
    guard.install()?;
    let work_dir = WorkDir::acquire(environment.work_root(), &guard)?;

    let executor = SystemCommandExecutor;
    let fetch = &environment.config().fetch;
    let downloader = HttpDownloader::new(fetch.download_timeout());
    let fetcher = NetworkFetcher::new(
        GitClient::new(&executor, fetch.git_timeout()),
        &downloader,
        fetch.clone_depth,
    );
    let resolver = SourceResolver::new(
        &cache,
        &fetcher,
        work_dir.path().join("downloads"),
        RetryPolicy::new(fetch.attempts_per_mirror, fetch.retry_delay()),
    );
    let packages = SystemPackageInstaller::new(&executor, environment.family());
    let context = PipelineContext {
        environment: &environment,
        executor: &executor,
        cache: &cache,
        resolver: &resolver,
        packages: &packages,
        work_dir: work_dir.path(),
        force: cli.force,
        skip_deps: cli.skip_deps,
        max_retries: environment.config().build.max_retries,
        quiet: cli.quiet,
    };

    let outcome = run_pipeline(&context, stderr)?;
    match &outcome {
        PipelineOutcome::Installed { module, binary } => {
            progress(cli.quiet, stderr, "");
            progress(cli.quiet, stderr, success_message(module, binary));
            work_dir.finish()?;
        }
        // The quarantined module lives in the work directory; keep it.
        PipelineOutcome::Quarantined { path, diagnostic } => {
            write_stderr_line(stderr, quarantine_message(path, diagnostic));
        }
    }
    Ok(outcome.exit_code())
}

/// Loads configuration, applies command-line overrides and fixes the
/// environment for the run.
fn environment_for_cli(
    cli: &Cli,
    dirs: &dyn BaseDirs,
    system_root: &Utf8Path,
) -> Result<EnvironmentProfile> {
    let mut config = InstallerConfig::load(cli.config.as_deref())?;
    apply_overrides(cli, &mut config);
    let cache_root = cli
        .cache_dir
        .clone()
        .unwrap_or_else(|| default_cache_root(dirs));
    let work_root = cli
        .work_dir
        .clone()
        .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_WORK_DIR));
    Ok(EnvironmentProfile::new(
        PackageFamily::detect(system_root),
        config,
        cache_root,
        work_root,
    ))
}

fn apply_overrides(cli: &Cli, config: &mut InstallerConfig) {
    if let Some(binary) = &cli.nginx_binary {
        config.host.binary = Some(binary.clone());
    }
    if let Some(retries) = cli.max_retries {
        config.build.max_retries = retries;
    }
}

fn print_dry_run_info(cli: &Cli, environment: &EnvironmentProfile, stderr: &mut dyn Write) {
    let config = environment.config();
    let info = DryRunInfo {
        work_dir: environment.work_root(),
        cache_dir: environment.cache_root(),
        package_family: &environment.family().to_string(),
        modsecurity_version: &config.versions.modsecurity,
        connector_version: &config.versions.connector,
        nginx_binary: config.host.binary.as_deref(),
        install_prefix: config.build.install_prefix.as_str(),
        jobs: environment.jobs().get(),
        max_retries: config.build.max_retries,
        force: cli.force,
        skip_deps: cli.skip_deps,
    };
    write_stderr_line(stderr, info.display_text());
}

fn exit_code_for_run_result(result: Result<i32>, stderr: &mut dyn Write) -> i32 {
    match result {
        Ok(code) => code,
        Err(err) => {
            write_stderr_line(stderr, format!("error: {err}"));
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modsec_installer::error::InstallerError;
    use modsec_installer::test_utils::utf8_temp_dir;
    use rstest::rstest;

    struct FixedDirs(Utf8PathBuf);

    impl BaseDirs for FixedDirs {
        fn cache_dir(&self) -> Option<Utf8PathBuf> {
            Some(self.0.clone())
        }
    }

    #[rstest]
    #[case::installed(Ok(0), 0)]
    #[case::quarantined(Ok(3), 3)]
    fn exit_code_for_run_result_passes_outcome_codes_through(
        #[case] result: Result<i32>,
        #[case] expected: i32,
    ) {
        let mut stderr = Vec::new();
        let exit_code = exit_code_for_run_result(result, &mut stderr);
        assert_eq!(exit_code, expected);
        assert!(stderr.is_empty());
    }

    #[test]
    fn exit_code_for_run_result_prints_error_and_returns_one() {
        let err = InstallerError::WorkDirBusy {
            path: Utf8PathBuf::from("/tmp/modsecurity_build"),
        };

        let mut stderr = Vec::new();
        let exit_code = exit_code_for_run_result(Err(err), &mut stderr);
        assert_eq!(exit_code, 1);

        let stderr_text = String::from_utf8(stderr).expect("stderr was not UTF-8");
        assert!(stderr_text.contains("/tmp/modsecurity_build is in use"));
    }

    #[test]
    fn overrides_replace_configured_values() {
        let cli = Cli::parse_from([
            "modsec-installer",
            "--nginx-binary",
            "/opt/nginx/sbin/nginx",
            "--max-retries",
            "5",
        ]);
        let mut config = InstallerConfig::default();

        apply_overrides(&cli, &mut config);

        assert_eq!(config.host.binary, Some(Utf8PathBuf::from("/opt/nginx/sbin/nginx")));
        assert_eq!(config.build.max_retries, 5);
    }

    #[test]
    fn environment_uses_platform_cache_unless_overridden() {
        let (_guard, root) = utf8_temp_dir();
        let dirs = FixedDirs(root.join("xdg"));

        let defaulted = environment_for_cli(&Cli::default(), &dirs, &root).expect("environment");
        assert_eq!(defaulted.cache_root(), root.join("xdg/modsec-installer"));
        assert_eq!(defaulted.work_root(), Utf8Path::new(DEFAULT_WORK_DIR));
        assert_eq!(defaulted.family(), PackageFamily::Unknown);

        let cli = Cli {
            cache_dir: Some(root.join("cache")),
            work_dir: Some(root.join("work")),
            ..Cli::default()
        };
        let explicit = environment_for_cli(&cli, &dirs, &root).expect("environment");
        assert_eq!(explicit.cache_root(), root.join("cache"));
        assert_eq!(explicit.work_root(), root.join("work"));
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        let (_guard, root) = utf8_temp_dir();
        let cli = Cli {
            config: Some(root.join("absent.toml")),
            ..Cli::default()
        };

        let err = environment_for_cli(&cli, &FixedDirs(root.clone()), &root)
            .expect_err("config must exist");
        assert!(matches!(err, InstallerError::InvalidConfig { .. }));
    }

    #[test]
    fn dry_run_prints_configuration_without_side_effects() {
        let (_guard, root) = utf8_temp_dir();
        let cli = Cli {
            dry_run: true,
            cache_dir: Some(root.join("cache")),
            work_dir: Some(root.join("work")),
            ..Cli::default()
        };
        let mut stderr = Vec::new();

        let code = run(&cli, &mut stderr).expect("dry run");

        assert_eq!(code, 0);
        let text = String::from_utf8(stderr).expect("stderr was not UTF-8");
        assert!(text.contains("Dry run - no files will be modified"));
        assert!(text.contains(root.join("work").as_str()));
        assert!(!root.join("work").exists());
    }

    #[test]
    fn clear_cache_empties_the_cache_and_exits() {
        let (_guard, root) = utf8_temp_dir();
        let cache = root.join("cache");
        std::fs::create_dir_all(cache.join("nginx/1.24.0")).expect("slot");
        std::fs::write(cache.join("nginx/1.24.0/nginx-1.24.0.tar.gz"), b"x").expect("entry");
        let cli = Cli {
            clear_cache: true,
            quiet: true,
            cache_dir: Some(cache.clone()),
            ..Cli::default()
        };
        let mut stderr = Vec::new();

        let code = run(&cli, &mut stderr).expect("cleared");

        assert_eq!(code, 0);
        assert!(stderr.is_empty());
        assert!(!cache.join("nginx").exists());
    }
}
