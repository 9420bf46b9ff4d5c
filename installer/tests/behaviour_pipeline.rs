//! Behaviour-driven tests for the build and verification stages.
//!
//! These scenarios cover the install gate for incompatible modules,
//! submodule short-circuiting, and missing-header diagnostics.

use camino::{Utf8Path, Utf8PathBuf};
use modsec_installer::artifact::Mirror;
use modsec_installer::cache::CacheStore;
use modsec_installer::config::InstallerConfig;
use modsec_installer::configure_args::ConfigureArg;
use modsec_installer::diagnostics::Diagnostic;
use modsec_installer::environment::{EnvironmentProfile, PackageFamily};
use modsec_installer::error::{self, InstallerError};
use modsec_installer::exec::{CommandExecutor, Invocation};
use modsec_installer::git::GitClient;
use modsec_installer::host::HostBinaryProfile;
use modsec_installer::native_build::{BuildOutput, BuildTarget, MODSECURITY_LIBRARY, NativeBuilder};
use modsec_installer::packages::{InstallOutcome, PackageInstaller};
use modsec_installer::pipeline::{PipelineContext, PipelineOutcome, verify_and_stage};
use modsec_installer::resolver::{MirrorFetcher, RetryPolicy, SourceResolver};
use modsec_installer::submodule::{SubmoduleInitializer, SubmoduleReport};
use modsec_installer::test_utils::{ExpectedCall, StubExecutor, output_with, utf8_temp_dir};
use modsec_installer::toolchain::{CompilerRequirement, CompilerVersion};
use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};
use std::cell::RefCell;
use std::num::NonZeroUsize;
use std::process::Output;
use std::time::Duration;
use tempfile::TempDir;

const MODULE_NAME: &str = "ngx_http_modsecurity_module.so";
const INCOMPATIBLE: &str = "nginx: [emerg] module \"/tmp/build/objs/ngx_http_modsecurity_module.so\" is not binary compatible in /tmp/verify/nginx.conf:1\n";
const GPP_11: &str = "g++ (GCC) 11.2.1 20220127 (Red Hat 11.2.1-9)\n";
const MISSING_PCRE: &str =
    "src/utils/regex.h:20:10: fatal error: pcre.h: No such file or directory\ncompilation terminated.\n";

/// Answers every command with the same output, whatever its arguments.
struct FixedExecutor(fn() -> Output);

impl CommandExecutor for FixedExecutor {
    fn run(&self, _invocation: &Invocation) -> error::Result<Output> {
        Ok((self.0)())
    }
}

/// Never reached: the verification stage does not fetch anything.
struct OfflineFetcher;

impl MirrorFetcher for OfflineFetcher {
    fn fetch(&self, mirror: &Mirror, _dest_dir: &Utf8Path) -> error::Result<Utf8PathBuf> {
        Err(InstallerError::MirrorUnavailable {
            url: mirror.url.clone(),
            reason: "offline".to_owned(),
        })
    }
}

/// Never reached: the verification stage does not install packages.
struct NoPackages;

impl PackageInstaller for NoPackages {
    fn install(&self, packages: &[String]) -> error::Result<InstallOutcome> {
        Ok(InstallOutcome::Failure {
            failed: packages.to_vec(),
        })
    }
}

// ---------------------------------------------------------------------------
// Verification world
// ---------------------------------------------------------------------------

struct VerifyWorld {
    _temp_dir: TempDir,
    root: Utf8PathBuf,
    module: RefCell<Option<Utf8PathBuf>>,
    host_output: RefCell<Option<fn() -> Output>>,
    outcome: RefCell<Option<error::Result<PipelineOutcome>>>,
}

impl VerifyWorld {
    fn module_dir(&self) -> Utf8PathBuf {
        self.root.join("modules")
    }
}

#[fixture]
fn verify_world() -> VerifyWorld {
    let (temp_dir, root) = utf8_temp_dir();
    VerifyWorld {
        _temp_dir: temp_dir,
        root,
        module: RefCell::new(None),
        host_output: RefCell::new(None),
        outcome: RefCell::new(None),
    }
}

fn incompatible_host() -> Output {
    output_with(1, "", INCOMPATIBLE)
}

#[given("a built dynamic module")]
fn given_built_module(verify_world: &VerifyWorld) {
    let objs = verify_world.root.join("nginx-1.24.0/objs");
    std::fs::create_dir_all(&objs).expect("create objs");
    let module = objs.join(MODULE_NAME);
    std::fs::write(&module, b"\x7fELF module").expect("write module");
    verify_world.module.replace(Some(module));
}

#[given("a host that rejects the module as not binary compatible")]
fn given_rejecting_host(verify_world: &VerifyWorld) {
    verify_world.host_output.replace(Some(incompatible_host));
}

#[when("the module is verified and staged")]
fn when_verified(verify_world: &VerifyWorld) {
    let module = verify_world.module.borrow().clone().expect("module not built");
    let respond = verify_world.host_output.borrow().expect("host not configured");
    let executor = FixedExecutor(respond);
    let environment = EnvironmentProfile::new(
        PackageFamily::Rhel,
        InstallerConfig::default(),
        verify_world.root.join("cache"),
        verify_world.root.join("work"),
    );
    let cache = CacheStore::new(environment.cache_root());
    let fetcher = OfflineFetcher;
    let resolver = SourceResolver::new(
        &cache,
        &fetcher,
        verify_world.root.join("scratch"),
        RetryPolicy::new(1, Duration::ZERO),
    );
    let work_dir = verify_world.root.join("work");
    let context = PipelineContext {
        environment: &environment,
        executor: &executor,
        cache: &cache,
        resolver: &resolver,
        packages: &NoPackages,
        work_dir: &work_dir,
        force: false,
        skip_deps: false,
        max_retries: 0,
        quiet: true,
    };
    let profile = HostBinaryProfile {
        version: "1.24.0".parse().expect("version"),
        raw_configure_args: "--prefix=/usr/share/nginx --with-compat".to_owned(),
        binary_path: Utf8PathBuf::from("/usr/sbin/nginx"),
        module_install_dir: verify_world.module_dir(),
    };
    let mut stderr = Vec::new();
    let outcome = verify_and_stage(&context, &module, &profile, &mut stderr);
    verify_world.outcome.replace(Some(outcome));
}

#[then("the module is quarantined")]
fn then_quarantined(verify_world: &VerifyWorld) {
    let outcome = verify_world.outcome.borrow();
    let outcome = outcome.as_ref().expect("not verified");
    let Ok(PipelineOutcome::Quarantined { path, diagnostic }) = outcome else {
        panic!("expected quarantine, got {outcome:?}");
    };
    assert!(path.as_str().ends_with(&format!("{MODULE_NAME}.incompatible")));
    assert!(path.is_file());
    assert!(diagnostic.contains("is not binary compatible"));
    let original = verify_world.module.borrow().clone().expect("module");
    assert!(!original.exists(), "the original module name must be freed");
}

#[then("nothing is installed into the module directory")]
fn then_nothing_installed(verify_world: &VerifyWorld) {
    let dir = verify_world.module_dir();
    let installed = dir.exists()
        && std::fs::read_dir(&dir)
            .expect("list module dir")
            .next()
            .is_some();
    assert!(!installed, "{dir} must stay empty");
}

// ---------------------------------------------------------------------------
// Submodule world
// ---------------------------------------------------------------------------

struct SubmoduleWorld {
    _temp_dir: TempDir,
    repo: Utf8PathBuf,
    executor: StubExecutor,
    report: RefCell<Option<error::Result<SubmoduleReport>>>,
}

#[fixture]
fn submodule_world() -> SubmoduleWorld {
    let (temp_dir, root) = utf8_temp_dir();
    SubmoduleWorld {
        _temp_dir: temp_dir,
        repo: root.join("ModSecurity-nginx"),
        executor: StubExecutor::new(Vec::new()),
        report: RefCell::new(None),
    }
}

#[given("a source tree without a .gitmodules file")]
fn given_tree_without_gitmodules(submodule_world: &SubmoduleWorld) {
    std::fs::create_dir_all(submodule_world.repo.join(".git")).expect("create repo");
    std::fs::write(submodule_world.repo.join("config"), b"ngx_addon_name=x\n").expect("config");
}

#[when("submodules are ensured")]
fn when_submodules_ensured(submodule_world: &SubmoduleWorld) {
    let git = GitClient::new(&submodule_world.executor, Duration::from_secs(5));
    let report = SubmoduleInitializer::new(git).ensure(&submodule_world.repo);
    submodule_world.report.replace(Some(report));
}

#[then("no submodules are reported")]
fn then_no_submodules(submodule_world: &SubmoduleWorld) {
    let report = submodule_world.report.borrow();
    let report = report.as_ref().expect("not ensured");
    assert!(matches!(report, Ok(SubmoduleReport::NoDeclarations)));
}

#[then("no git command is run")]
fn then_no_git(submodule_world: &SubmoduleWorld) {
    assert_eq!(submodule_world.executor.call_count(), 0);
}

// ---------------------------------------------------------------------------
// Build world
// ---------------------------------------------------------------------------

struct BuildWorld {
    _temp_dir: TempDir,
    source: Utf8PathBuf,
    calls: RefCell<Vec<ExpectedCall>>,
    result: RefCell<Option<error::Result<BuildOutput>>>,
}

#[fixture]
fn build_world() -> BuildWorld {
    let (temp_dir, root) = utf8_temp_dir();
    BuildWorld {
        _temp_dir: temp_dir,
        source: root.join("modsecurity"),
        calls: RefCell::new(Vec::new()),
        result: RefCell::new(None),
    }
}

#[given("a library source tree with a configure script")]
fn given_library_tree(build_world: &BuildWorld) {
    std::fs::create_dir_all(&build_world.source).expect("create source");
    std::fs::write(build_world.source.join("configure"), b"#!/bin/sh\n").expect("configure");
}

#[given("a configure step that fails for a missing pcre.h")]
fn given_failing_configure(build_world: &BuildWorld) {
    let mut calls = build_world.calls.borrow_mut();
    calls.push(ExpectedCall::new("g++", &["--version"], Ok(output_with(0, GPP_11, ""))));
    for _ in 0..2 {
        calls.push(ExpectedCall::new(
            "sh",
            &["./configure", "--prefix=/usr/local/modsecurity"],
            Ok(output_with(1, "", MISSING_PCRE)),
        ));
    }
}

#[when("the library is built with one retry")]
fn when_built(build_world: &BuildWorld) {
    let executor = StubExecutor::new(build_world.calls.take());
    let target = BuildTarget {
        name: "modsecurity 3.0.14".to_owned(),
        source_dir: build_world.source.clone(),
        configure_args: vec![ConfigureArg::KeyValue(
            "--prefix".to_owned(),
            "/usr/local/modsecurity".to_owned(),
        )],
        artifact: Utf8PathBuf::from(MODSECURITY_LIBRARY),
        compiler: CompilerRequirement::new(vec!["g++".to_owned()], CompilerVersion::new(7, 0, 0)),
    };
    let jobs = NonZeroUsize::new(4).expect("non-zero");
    let result = NativeBuilder::new(&executor, PackageFamily::Rhel, jobs, false).build(&target, 1);
    executor.assert_finished();
    build_world.result.replace(Some(result));
}

#[then("the build fails after 2 attempts")]
fn then_build_fails(build_world: &BuildWorld) {
    let result = build_world.result.borrow();
    let result = result.as_ref().expect("not built");
    assert!(
        matches!(result, Err(InstallerError::BuildFailure { attempts, .. }) if attempts.len() == 2),
        "expected two failed attempts, got {result:?}"
    );
}

#[then("every attempt names the missing header pcre.h from pcre-devel")]
fn then_missing_header_named(build_world: &BuildWorld) {
    let result = build_world.result.borrow();
    let Some(Err(err @ InstallerError::BuildFailure { attempts, .. })) = result.as_ref() else {
        panic!("expected a build failure");
    };
    let expected = Diagnostic::MissingHeader {
        header: "pcre.h".to_owned(),
        package: Some("pcre-devel".to_owned()),
    };
    for record in attempts {
        assert!(
            record.diagnostics.contains(&expected),
            "attempt {} lacks the header hint: {:?}",
            record.attempt,
            record.diagnostics
        );
    }
    assert!(err.to_string().contains("pcre-devel"));
}

// ---------------------------------------------------------------------------
// Scenario bindings
// ---------------------------------------------------------------------------

#[scenario(path = "tests/features/installer.feature", index = 2)]
fn scenario_quarantine_incompatible_module(verify_world: VerifyWorld) {
    let _ = verify_world;
}

#[scenario(path = "tests/features/installer.feature", index = 3)]
fn scenario_no_declared_submodules(submodule_world: SubmoduleWorld) {
    let _ = submodule_world;
}

#[scenario(path = "tests/features/installer.feature", index = 4)]
fn scenario_missing_header_hint(build_world: BuildWorld) {
    let _ = build_world;
}
