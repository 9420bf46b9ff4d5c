//! Fetch, build, verify and install pipeline orchestration.
//!
//! This module sequences the components for one run: source acquisition for
//! the library and connector, the library build (with one dependency-install
//! recovery), the host probe, the dynamic module build, and the compatibility
//! gate in front of the install step.

use crate::cache::CacheStore;
use crate::config::{KIND_CONNECTOR, KIND_MODSECURITY, KIND_NGINX};
use crate::configure_args::ConfigureArg;
use crate::diagnostics::suggested_packages;
use crate::environment::EnvironmentProfile;
use crate::error::{InstallerError, Result};
use crate::exec::CommandExecutor;
use crate::git::GitClient;
use crate::host::{HostBinaryProfile, HostProbe};
use crate::host_module::HostIntegrationBuilder;
use crate::native_build::{
    AttemptRecord, BuildOutput, BuildTarget, MODSECURITY_LIBRARY, NativeBuilder,
};
use crate::output::progress;
use crate::packages::{InstallOutcome, PackageInstaller};
use crate::resolver::{RetryPolicy, SourceResolver};
use crate::stager::Stager;
use crate::submodule::SubmoduleInitializer;
use crate::verify::{CompatibilityStatus, CompatibilityVerifier};
use camino::{Utf8Path, Utf8PathBuf};
use log::{debug, warn};
use std::io::Write;

/// Exit code for a run whose module was quarantined.
pub const QUARANTINE_EXIT_CODE: i32 = 3;

/// Context for a pipeline run.
pub struct PipelineContext<'a> {
    /// Machine description and configuration.
    pub environment: &'a EnvironmentProfile,
    /// Runs every external command.
    pub executor: &'a dyn CommandExecutor,
    /// Artifact cache shared with `resolver`.
    pub cache: &'a CacheStore,
    /// Source acquisition.
    pub resolver: &'a SourceResolver<'a>,
    /// Development package installation.
    pub packages: &'a dyn PackageInstaller,
    /// Locked build directory.
    pub work_dir: &'a Utf8Path,
    /// Ignore cached artifacts and previous builds.
    pub force: bool,
    /// Never install missing development packages.
    pub skip_deps: bool,
    /// Retries after the first failed library build.
    pub max_retries: u32,
    /// Suppress progress output.
    pub quiet: bool,
}

/// How a run ended, short of an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// The module passed verification and was installed.
    Installed {
        /// Installed module path.
        module: Utf8PathBuf,
        /// Host binary it was verified against.
        binary: Utf8PathBuf,
    },
    /// The host refused the module as binary incompatible; nothing was
    /// installed.
    Quarantined {
        /// Renamed module path.
        path: Utf8PathBuf,
        /// Host diagnostic.
        diagnostic: String,
    },
}

impl PipelineOutcome {
    /// Process exit code for this outcome.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Installed { .. } => 0,
            Self::Quarantined { .. } => QUARANTINE_EXIT_CODE,
        }
    }
}

/// Run every stage in order.
///
/// # Errors
///
/// Returns the first stage error. A binary-incompatible module is not an
/// error; see [`PipelineOutcome::Quarantined`].
pub fn run_pipeline(context: &PipelineContext<'_>, stderr: &mut dyn Write) -> Result<PipelineOutcome> {
    let library_src = prepare_modsecurity(context, stderr)?;
    build_modsecurity(context, &library_src, stderr)?;
    let connector_version = &context.environment.config().versions.connector;
    let connector_src = prepare_source(context, KIND_CONNECTOR, connector_version, stderr)?;
    let profile = probe_host(context, stderr)?;
    let module = build_module(context, &profile, &connector_src, stderr)?;
    verify_and_stage(context, &module, &profile, stderr)
}

/// Check out the library sources, or reuse a previous run's built tree.
///
/// # Errors
///
/// Propagates resolution and submodule errors.
pub fn prepare_modsecurity(context: &PipelineContext<'_>, stderr: &mut dyn Write) -> Result<Utf8PathBuf> {
    let existing = context.work_dir.join(KIND_MODSECURITY);
    if !context.force && existing.join(MODSECURITY_LIBRARY).is_file() {
        progress(
            context.quiet,
            stderr,
            format!("Reusing ModSecurity build in {existing}"),
        );
        return Ok(existing);
    }
    let version = &context.environment.config().versions.modsecurity;
    prepare_source(context, KIND_MODSECURITY, version, stderr)
}

/// Resolve `kind` at `version` into `<work_dir>/<kind>` with its submodules
/// initialised.
///
/// A repository whose submodules had to be fetched is written back to the
/// cache so the next run starts complete.
///
/// # Errors
///
/// Returns [`InstallerError::AllMirrorsFailed`] when no mirror delivers, and
/// [`InstallerError::Submodule`] when nested dependencies stay missing.
pub fn prepare_source(
    context: &PipelineContext<'_>,
    kind: &str,
    version: &str,
    stderr: &mut dyn Write,
) -> Result<Utf8PathBuf> {
    let config = context.environment.config();
    let spec = config.artifact(kind, version)?;
    if context.force {
        context.resolver.invalidate(&spec)?;
    }
    progress(context.quiet, stderr, format!("Fetching {spec}..."));
    let checkout = context.resolver.checkout(&spec, &context.work_dir.join(kind))?;
    for failure in &checkout.resolved.failures {
        progress(context.quiet, stderr, format!("  skipped {failure}"));
    }
    progress(
        context.quiet,
        stderr,
        format!("  {spec} from {}", checkout.resolved.source),
    );

    let git = GitClient::new(context.executor, config.fetch.git_timeout());
    let retry = RetryPolicy::new(config.fetch.attempts_per_mirror, config.fetch.retry_delay());
    let report = SubmoduleInitializer::new(git)
        .with_retry(retry)
        .ensure(&checkout.root)?;
    debug!("submodules of {spec}: {report:?}");
    if report.changed_tree() && checkout.resolved.path.is_dir() {
        match context.cache.put(spec.kind(), spec.version(), &checkout.root) {
            Ok(entry) => debug!("re-cached {spec} with submodules at {}", entry.path),
            Err(err) => warn!("could not re-cache {spec} with submodules: {err}"),
        }
    }
    Ok(checkout.root)
}

/// Build and install the library in `source_dir`.
///
/// When the build fails for missing development packages, and `skip_deps`
/// is off, the suggested packages are installed and the build is repeated
/// once from a clean tree.
///
/// # Errors
///
/// Returns [`InstallerError::BuildFailure`] carrying every attempt,
/// toolchain errors, or [`InstallerError::DependencyInstall`] when no
/// suggested package could be installed.
pub fn build_modsecurity(
    context: &PipelineContext<'_>,
    source_dir: &Utf8Path,
    stderr: &mut dyn Write,
) -> Result<Utf8PathBuf> {
    let config = context.environment.config();
    let policy = &config.build;
    let target = BuildTarget {
        name: format!("{KIND_MODSECURITY} {}", config.versions.modsecurity),
        source_dir: source_dir.to_owned(),
        configure_args: vec![ConfigureArg::KeyValue(
            "--prefix".to_owned(),
            policy.install_prefix.to_string(),
        )],
        artifact: Utf8PathBuf::from(MODSECURITY_LIBRARY),
        compiler: policy.compiler_requirement(),
    };
    progress(context.quiet, stderr, format!("Building {}...", target.name));

    let builder = native_builder(context, context.force);
    let output = match builder.build(&target, context.max_retries) {
        Ok(output) => output,
        Err(InstallerError::BuildFailure { artifact, attempts }) => {
            let packages = missing_packages(&attempts);
            if context.skip_deps || packages.is_empty() {
                return Err(InstallerError::BuildFailure { artifact, attempts });
            }
            install_dependencies(context, &packages, stderr)?;
            progress(
                context.quiet,
                stderr,
                format!("Rebuilding {} with the new packages...", target.name),
            );
            rebuild(context, &target, attempts)?
        }
        Err(err) => return Err(err),
    };

    let installed = policy.install_prefix.join("lib").join("libmodsecurity.so");
    if output.reused() && installed.is_file() {
        debug!("{} already installed at {installed}", target.name);
    } else {
        builder.install(&target)?;
    }
    Ok(output.artifact)
}

fn native_builder<'a>(context: &PipelineContext<'a>, force: bool) -> NativeBuilder<'a> {
    NativeBuilder::new(
        context.executor,
        context.environment.family(),
        context.environment.jobs(),
        force,
    )
}

fn missing_packages(attempts: &[AttemptRecord]) -> Vec<String> {
    let diagnostics: Vec<_> = attempts
        .iter()
        .flat_map(|record| record.diagnostics.iter().cloned())
        .collect();
    suggested_packages(&diagnostics)
}

fn install_dependencies(
    context: &PipelineContext<'_>,
    packages: &[String],
    stderr: &mut dyn Write,
) -> Result<()> {
    progress(
        context.quiet,
        stderr,
        format!("Installing missing development packages: {}", packages.join(" ")),
    );
    match context.packages.install(packages)? {
        InstallOutcome::Success => Ok(()),
        InstallOutcome::Partial { failed } => {
            warn!("could not install {}; rebuilding anyway", failed.join(" "));
            Ok(())
        }
        InstallOutcome::Failure { failed } => Err(InstallerError::DependencyInstall {
            packages: failed.join(" "),
            message: "no package could be installed; install them manually or rerun with --skip-deps".to_owned(),
        }),
    }
}

/// One more attempt from a clean tree. A failure reports the earlier
/// attempts followed by this one.
fn rebuild(
    context: &PipelineContext<'_>,
    target: &BuildTarget,
    mut history: Vec<AttemptRecord>,
) -> Result<BuildOutput> {
    match native_builder(context, true).build(target, 0) {
        Err(InstallerError::BuildFailure { artifact, attempts }) => {
            let offset = u32::try_from(history.len()).unwrap_or(u32::MAX);
            history.extend(attempts.into_iter().map(|mut record| {
                record.attempt = record.attempt.saturating_add(offset);
                record
            }));
            Err(InstallerError::BuildFailure {
                artifact,
                attempts: history,
            })
        }
        other => other,
    }
}

/// Find and probe the host binary.
///
/// # Errors
///
/// Returns [`InstallerError::HostProbe`] or
/// [`InstallerError::HostConfigUnavailable`].
pub fn probe_host(context: &PipelineContext<'_>, stderr: &mut dyn Write) -> Result<HostBinaryProfile> {
    let config = context.environment.config();
    let probe = HostProbe::new(context.executor, &config.host);
    let binary = probe.discover_binary()?;
    let profile = probe.probe(&binary)?;
    progress(
        context.quiet,
        stderr,
        format!("Host nginx {} at {binary}", profile.version),
    );
    Ok(profile)
}

/// Build the connector as a dynamic module of the probed host.
///
/// # Errors
///
/// Propagates [`HostIntegrationBuilder::build_dynamic_module`] errors.
pub fn build_module(
    context: &PipelineContext<'_>,
    profile: &HostBinaryProfile,
    connector_src: &Utf8Path,
    stderr: &mut dyn Write,
) -> Result<Utf8PathBuf> {
    let config = context.environment.config();
    if context.force {
        let spec = config.artifact(KIND_NGINX, &profile.version.to_string())?;
        context.resolver.invalidate(&spec)?;
    }
    progress(
        context.quiet,
        stderr,
        format!(
            "Building {} against nginx {}...",
            config.host.module_filename, profile.version
        ),
    );
    HostIntegrationBuilder::new(
        context.executor,
        context.resolver,
        context.environment,
        context.work_dir,
    )
    .with_modsecurity_prefix(config.build.install_prefix.clone())
    .build_dynamic_module(profile, connector_src)
}

/// Test `module` against the host and install it only if it loads.
///
/// # Errors
///
/// Returns [`InstallerError::ConfigError`] when the host rejects the module
/// for a reason other than binary incompatibility, and
/// [`InstallerError::Install`] when the module directory is not writable.
pub fn verify_and_stage(
    context: &PipelineContext<'_>,
    module: &Utf8Path,
    profile: &HostBinaryProfile,
    stderr: &mut dyn Write,
) -> Result<PipelineOutcome> {
    progress(
        context.quiet,
        stderr,
        format!("Verifying {module} against {}...", profile.binary_path),
    );
    let marker = &context.environment.config().host.incompatible_marker;
    let verdict = CompatibilityVerifier::new(context.executor, marker).verify(module, profile)?;
    match verdict.status {
        CompatibilityStatus::Compatible => {
            let stager = Stager::new(profile.module_install_dir.clone());
            progress(
                context.quiet,
                stderr,
                format!("Installing module to {}...", stager.target_dir()),
            );
            stager.prepare()?;
            let installed = stager.stage(module, &verdict)?;
            Ok(PipelineOutcome::Installed {
                module: installed,
                binary: profile.binary_path.clone(),
            })
        }
        CompatibilityStatus::BinaryIncompatible => Ok(PipelineOutcome::Quarantined {
            path: verdict.quarantined.unwrap_or_else(|| module.to_owned()),
            diagnostic: verdict.diagnostic,
        }),
        CompatibilityStatus::ConfigError => Err(InstallerError::ConfigError {
            module: module.to_owned(),
            diagnostic: verdict.diagnostic,
        }),
    }
}

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;
