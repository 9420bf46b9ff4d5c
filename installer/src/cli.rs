//! CLI argument definitions for the ModSecurity installer.
//!
//! This module defines the command-line interface using clap. It is separated
//! from the main entrypoint to keep the binary small and focused on
//! orchestration.

use camino::Utf8PathBuf;
use clap::Parser;

/// Build and install the ModSecurity nginx connector for the running nginx.
#[derive(Parser, Debug)]
#[command(name = "modsec-installer")]
#[command(version, about)]
#[command(long_about = concat!(
    "Build and install the ModSecurity nginx connector for the running nginx.\n\n",
    "Sources are fetched from an ordered list of mirrors with retries and kept in ",
    "a local cache, so later runs work offline. The ModSecurity library is built ",
    "with automatic retries; missing development packages are installed and the ",
    "build is repeated once.\n\n",
    "The connector is compiled as a dynamic module against the exact version and ",
    "configure arguments of the installed nginx, then loaded into a throwaway ",
    "configuration test. Only a module that passes is installed. A module nginx ",
    "reports as not binary compatible is renamed with an .incompatible suffix and ",
    "the run exits with status 3.",
))]
#[command(after_help = concat!(
    "EXIT STATUS:\n",
    "  0    module installed\n",
    "  1    the pipeline failed\n",
    "  3    module built but quarantined as binary incompatible\n",
    "  130  interrupted\n\n",
    "EXAMPLES:\n",
    "  Build and install against the detected nginx:\n",
    "    $ modsec-installer\n\n",
    "  Use a specific nginx binary and keep build output verbose:\n",
    "    $ modsec-installer --nginx-binary /www/server/nginx/sbin/nginx -vv\n\n",
    "  Rebuild everything, ignoring the cache:\n",
    "    $ modsec-installer --force\n\n",
    "  Preview without building:\n",
    "    $ modsec-installer --dry-run",
))]
pub struct Cli {
    /// Ignore cached sources and previous builds.
    #[arg(long)]
    pub force: bool,

    /// Never install missing development packages.
    #[arg(long)]
    pub skip_deps: bool,

    /// Transient build directory [default: /tmp/modsecurity_build].
    #[arg(long, value_name = "DIR")]
    pub work_dir: Option<Utf8PathBuf>,

    /// Artifact cache directory [default: platform-specific].
    #[arg(long, value_name = "DIR")]
    pub cache_dir: Option<Utf8PathBuf>,

    /// Configuration file [default: ./modsec-installer.toml if present].
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<Utf8PathBuf>,

    /// Path of the running nginx binary [default: auto-detect].
    #[arg(long, value_name = "PATH")]
    pub nginx_binary: Option<Utf8PathBuf>,

    /// Library build retries after the first failure [default: from config].
    #[arg(long, value_name = "N")]
    pub max_retries: Option<u32>,

    /// Empty the artifact cache and exit.
    #[arg(long)]
    pub clear_cache: bool,

    /// Show configuration and exit without building.
    #[arg(long)]
    pub dry_run: bool,

    /// Increase log verbosity (repeatable: -v, -vv, -vvv).
    #[arg(
        short,
        long = "verbose",
        alias = "verbosity",
        action = clap::ArgAction::Count,
        conflicts_with = "quiet"
    )]
    pub verbosity: u8,

    /// Suppress progress output (errors still shown).
    #[arg(short, long, conflicts_with = "verbosity")]
    pub quiet: bool,
}

impl Default for Cli {
    /// Creates a `Cli` with every flag disabled and nothing overridden.
    ///
    /// # Examples
    ///
    /// ```
    /// use modsec_installer::cli::Cli;
    ///
    /// let cli = Cli::default();
    /// assert!(!cli.force);
    /// assert!(cli.nginx_binary.is_none());
    /// ```
    fn default() -> Self {
        Self {
            force: false,
            skip_deps: false,
            work_dir: None,
            cache_dir: None,
            config: None,
            nginx_binary: None,
            max_retries: None,
            clear_cache: false,
            dry_run: false,
            verbosity: 0,
            quiet: false,
        }
    }
}

#[cfg(test)]
#[path = "cli_tests.rs"]
mod tests;
