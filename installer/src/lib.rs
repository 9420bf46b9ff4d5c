//! ModSecurity installer library.
//!
//! This crate provides the fetch, cache, build and verify pipeline that
//! installs the ModSecurity connector into a running nginx. It is used by the
//! `modsec-installer` CLI binary and can be consumed programmatically for
//! testing or custom installation workflows.
//!
//! # Modules
//!
//! - [`archive`] - Archive integrity checks and safe extraction
//! - [`artifact`] - Artifact identities and ordered mirror lists
//! - [`cache`] - Content cache keyed by artifact kind and version
//! - [`cli`] - Command-line argument definitions
//! - [`config`] - TOML configuration with complete defaults
//! - [`configure_args`] - Parsing and filtering of host configure arguments
//! - [`diagnostics`] - Build log classification and package suggestions
//! - [`dirs`] - Directory resolution abstraction for platform-specific paths
//! - [`download`] - HTTP archive downloads
//! - [`environment`] - Immutable description of the machine
//! - [`error`] - Semantic error types with recovery hints
//! - [`exec`] - External command execution with timeouts
//! - [`fallback`] - Ordered first-success combinator
//! - [`git`] - Repository cloning and submodule commands
//! - [`host`] - Host binary discovery and probing
//! - [`host_module`] - Dynamic module builds against the host
//! - [`native_build`] - Retrying configure/make builds
//! - [`output`] - Progress, logging and dry-run formatting
//! - [`packages`] - Development package installation
//! - [`pipeline`] - End-to-end pipeline orchestration
//! - [`resolver`] - Cache-first artifact resolution over mirrors
//! - [`stager`] - Atomic module installation
//! - [`submodule`] - Idempotent nested dependency initialisation
//! - [`toolchain`] - Compiler detection and version checks
//! - [`verify`] - Compatibility testing and quarantine
//! - [`workdir`] - Locked work directories and interrupt cleanup

pub mod archive;
pub mod artifact;
pub mod cache;
pub mod cli;
pub mod config;
pub mod configure_args;
pub mod diagnostics;
pub mod dirs;
pub mod download;
pub mod environment;
pub mod error;
pub mod exec;
pub mod fallback;
pub mod git;
pub mod host;
pub mod host_module;
pub mod native_build;
pub mod output;
pub mod packages;
pub mod pipeline;
pub mod resolver;
pub mod stager;
pub mod submodule;
pub mod toolchain;
pub mod verify;
pub mod workdir;

#[cfg(any(test, feature = "test-support"))]
pub mod test_utils;
