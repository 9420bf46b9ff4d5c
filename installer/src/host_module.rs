//! Building the connector as a dynamic module of the running host.
//!
//! The host's own source release, at the exact version it reports, is
//! configured with the host's own arguments plus one
//! `--add-dynamic-module`, and only the `modules` target is built. The host
//! binary itself is never rebuilt or reinstalled.

use crate::config::KIND_NGINX;
use crate::configure_args::{COMPAT_FLAG, has_option, module_build_args, render_args};
use crate::environment::EnvironmentProfile;
use crate::error::{InstallerError, Result};
use crate::exec::{CommandExecutor, Invocation};
use crate::host::HostBinaryProfile;
use crate::native_build::{BuildStage, run_stage};
use crate::resolver::SourceResolver;
use camino::{Utf8Path, Utf8PathBuf};
use log::{info, warn};

/// Builds dynamic modules against a probed host binary.
pub struct HostIntegrationBuilder<'a> {
    executor: &'a dyn CommandExecutor,
    resolver: &'a SourceResolver<'a>,
    environment: &'a EnvironmentProfile,
    work_dir: Utf8PathBuf,
    modsecurity_prefix: Option<Utf8PathBuf>,
}

impl<'a> HostIntegrationBuilder<'a> {
    /// Create a builder that checks host sources out under `work_dir`.
    #[must_use]
    pub fn new(
        executor: &'a dyn CommandExecutor,
        resolver: &'a SourceResolver<'a>,
        environment: &'a EnvironmentProfile,
        work_dir: impl Into<Utf8PathBuf>,
    ) -> Self {
        Self {
            executor,
            resolver,
            environment,
            work_dir: work_dir.into(),
            modsecurity_prefix: None,
        }
    }

    /// Point the connector's configure script at a ModSecurity installed
    /// under `prefix` (via `MODSECURITY_INC` and `MODSECURITY_LIB`).
    #[must_use]
    pub fn with_modsecurity_prefix(mut self, prefix: impl Into<Utf8PathBuf>) -> Self {
        self.modsecurity_prefix = Some(prefix.into());
        self
    }

    /// Build the module in `module_source_dir` against `profile` and return
    /// the path of the produced module file.
    ///
    /// # Errors
    ///
    /// Returns [`InstallerError::HostConfigUnavailable`] if the host's
    /// configure arguments cannot be parsed (no default is ever assumed),
    /// resolver errors for the host sources, [`InstallerError::BuildFailure`]
    /// when configure or make fails, and [`InstallerError::ModuleNotProduced`]
    /// when make succeeds without producing the module.
    pub fn build_dynamic_module(
        &self,
        profile: &HostBinaryProfile,
        module_source_dir: &Utf8Path,
    ) -> Result<Utf8PathBuf> {
        let host_args = profile.configure_args()?;
        if !has_option(&host_args, COMPAT_FLAG) {
            warn!(
                "{} was built without {COMPAT_FLAG}; the module will only load if every other configure option matches exactly",
                profile.binary_path
            );
        }

        let version = profile.version.to_string();
        let spec = self.environment.config().artifact(KIND_NGINX, &version)?;
        let checkout = self
            .resolver
            .checkout(&spec, &self.work_dir.join(format!("nginx-{version}")))?;
        let host_src = checkout.root;
        info!("host sources for {spec} ready at {host_src} (from {})", checkout.resolved.source);

        let args = render_args(&module_build_args(&host_args, module_source_dir));
        let mut configure = Invocation::new("sh")
            .arg("./configure")
            .args(args)
            .current_dir(host_src.clone());
        if let Some(prefix) = &self.modsecurity_prefix {
            configure = configure
                .env("MODSECURITY_INC", prefix.join("include").as_str())
                .env("MODSECURITY_LIB", prefix.join("lib").as_str());
        }
        let make = Invocation::new("make")
            .arg(format!("-j{}", self.environment.jobs()))
            .arg("modules")
            .current_dir(host_src.clone());

        let name = format!("{} module for nginx {version}", self.module_filename());
        for (stage, invocation) in [(BuildStage::Configure, &configure), (BuildStage::Compile, &make)] {
            if let Some(record) =
                run_stage(self.executor, self.environment.family(), stage, 1, invocation)?
            {
                return Err(InstallerError::BuildFailure {
                    artifact: name,
                    attempts: vec![record],
                });
            }
        }

        let module = host_src.join("objs").join(self.module_filename());
        if !module.is_file() {
            return Err(InstallerError::ModuleNotProduced { path: module });
        }
        Ok(module)
    }

    fn module_filename(&self) -> &str {
        &self.environment.config().host.module_filename
    }
}
