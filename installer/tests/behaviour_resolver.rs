//! Behaviour-driven tests for mirror fallback and cache recovery.
//!
//! The network is replaced by a scripted fetcher: named mirrors refuse every
//! request, the rest serve a small nginx source archive.

use camino::{Utf8Path, Utf8PathBuf};
use logtest::Logger;
use rstest::fixture;
use rstest_bdd_macros::{given, scenario, then, when};
use std::cell::RefCell;
use std::time::Duration;
use modsec_installer::artifact::{ArtifactKind, ArtifactSpec, Mirror, MirrorKind};
use modsec_installer::cache::CacheStore;
use modsec_installer::error::{self, InstallerError};
use modsec_installer::resolver::{
    MirrorFetcher, Resolved, ResolvedSource, RetryPolicy, SourceResolver, artifact_file_name,
};
use modsec_installer::test_utils::{utf8_temp_dir, write_tar_gz};
use tempfile::TempDir;

const FIRST_MIRROR: &str = "https://mirror-one.test/download/nginx-{version}.tar.gz";
const SECOND_MIRROR: &str = "https://mirror-two.test/download/nginx-{version}.tar.gz";
const VERSION: &str = "1.24.0";

#[derive(Default)]
struct ScriptedFetcher {
    refused: RefCell<Vec<String>>,
    calls: RefCell<Vec<String>>,
}

impl MirrorFetcher for ScriptedFetcher {
    fn fetch(&self, mirror: &Mirror, dest_dir: &Utf8Path) -> error::Result<Utf8PathBuf> {
        self.calls.borrow_mut().push(mirror.url.clone());
        if self.refused.borrow().contains(&mirror.url) {
            return Err(InstallerError::MirrorUnavailable {
                url: mirror.url.clone(),
                reason: "connection refused".to_owned(),
            });
        }
        let archive = dest_dir.join(artifact_file_name(&mirror.url, MirrorKind::Archive));
        write_tar_gz(
            &archive,
            &[("nginx-1.24.0/configure", b"#!/bin/sh\necho nginx\n")],
        );
        Ok(archive)
    }
}

// ---------------------------------------------------------------------------
// Resolver world
// ---------------------------------------------------------------------------

struct ResolverWorld {
    _temp_dir: TempDir,
    root: Utf8PathBuf,
    cache: CacheStore,
    fetcher: ScriptedFetcher,
    mirrors: RefCell<Vec<Mirror>>,
    result: RefCell<Option<error::Result<Resolved>>>,
}

impl ResolverWorld {
    fn new() -> Self {
        let (temp_dir, root) = utf8_temp_dir();
        Self {
            cache: CacheStore::new(root.join("cache")),
            _temp_dir: temp_dir,
            root,
            fetcher: ScriptedFetcher::default(),
            mirrors: RefCell::new(Vec::new()),
            result: RefCell::new(None),
        }
    }

    fn spec(&self) -> ArtifactSpec {
        ArtifactSpec::new("nginx", VERSION, self.mirrors.borrow().clone())
            .expect("valid artifact spec")
    }

    fn resolved(&self) -> Resolved {
        let result = self.result.borrow();
        match result.as_ref().expect("sources not resolved") {
            Ok(resolved) => resolved.clone(),
            Err(err) => panic!("resolution failed: {err}"),
        }
    }

    fn kind() -> ArtifactKind {
        ArtifactKind::new("nginx")
    }
}

#[fixture]
fn resolver_world() -> ResolverWorld {
    ResolverWorld::new()
}

#[given("an empty artifact cache")]
fn given_empty_cache(resolver_world: &ResolverWorld) {
    let entry = resolver_world
        .cache
        .get(&ResolverWorld::kind(), VERSION)
        .expect("cache readable");
    assert!(entry.is_none());
}

#[given("an artifact cache holding a zero-byte nginx archive")]
fn given_zero_byte_entry(resolver_world: &ResolverWorld) {
    let slot = resolver_world.cache.slot_dir(&ResolverWorld::kind(), VERSION);
    std::fs::create_dir_all(&slot).expect("create slot");
    std::fs::write(slot.join("nginx-1.24.0.tar.gz"), b"").expect("write empty entry");
    resolver_world
        .mirrors
        .borrow_mut()
        .push(Mirror::archive(FIRST_MIRROR));
    resolver_world
        .fetcher
        .refused
        .borrow_mut()
        .push(FIRST_MIRROR.replace("{version}", VERSION));
}

#[given("a first mirror that refuses connections")]
fn given_refusing_mirror(resolver_world: &ResolverWorld) {
    resolver_world
        .mirrors
        .borrow_mut()
        .push(Mirror::archive(FIRST_MIRROR));
    resolver_world
        .fetcher
        .refused
        .borrow_mut()
        .push(FIRST_MIRROR.replace("{version}", VERSION));
}

#[given("a second mirror that serves the archive")]
fn given_serving_mirror(resolver_world: &ResolverWorld) {
    resolver_world
        .mirrors
        .borrow_mut()
        .push(Mirror::archive(SECOND_MIRROR));
}

#[when("the nginx sources are resolved")]
fn when_resolved(resolver_world: &ResolverWorld) {
    let spec = resolver_world.spec();
    let resolver = SourceResolver::new(
        &resolver_world.cache,
        &resolver_world.fetcher,
        resolver_world.root.join("scratch"),
        RetryPolicy::new(2, Duration::ZERO),
    );
    resolver_world.result.replace(Some(resolver.resolve(&spec)));
}

#[then("the archive comes from the second mirror")]
fn then_from_second_mirror(resolver_world: &ResolverWorld) {
    let resolved = resolver_world.resolved();
    assert_eq!(
        resolved.source,
        ResolvedSource::Mirror(SECOND_MIRROR.replace("{version}", VERSION))
    );
}

#[then("the failure of the first mirror is reported")]
fn then_first_failure_reported(resolver_world: &ResolverWorld) {
    let resolved = resolver_world.resolved();
    let first = FIRST_MIRROR.replace("{version}", VERSION);
    assert_eq!(resolved.failures.len(), 1);
    assert_eq!(resolved.failures[0].origin, first);
    assert!(resolved.failures[0].reason.contains("connection refused"));
    let attempts_on_first = resolver_world
        .fetcher
        .calls
        .borrow()
        .iter()
        .filter(|url| **url == first)
        .count();
    assert_eq!(attempts_on_first, 2, "each mirror gets its full retry budget");
}

#[then("the archive is stored in the cache")]
fn then_cached(resolver_world: &ResolverWorld) {
    let entry = resolver_world
        .cache
        .get(&ResolverWorld::kind(), VERSION)
        .expect("cache readable")
        .expect("entry present");
    assert_eq!(entry.path, resolver_world.resolved().path);
    assert!(entry.size_bytes > 0);
}

#[then("the cached archive is no longer empty")]
fn then_cache_repaired(resolver_world: &ResolverWorld) {
    let entry = resolver_world
        .cache
        .get(&ResolverWorld::kind(), VERSION)
        .expect("cache readable")
        .expect("entry present");
    assert!(entry.size_bytes > 0);
    assert_eq!(
        resolver_world
            .fetcher
            .calls
            .borrow()
            .iter()
            .filter(|url| url.contains("mirror-two"))
            .count(),
        1
    );
}

// ---------------------------------------------------------------------------
// Scenario bindings
// ---------------------------------------------------------------------------

#[scenario(path = "tests/features/installer.feature", index = 0)]
fn scenario_mirror_fallback(resolver_world: ResolverWorld) {
    let _ = resolver_world;
}

#[scenario(path = "tests/features/installer.feature", index = 1)]
fn scenario_zero_byte_cache_entry(resolver_world: ResolverWorld) {
    let _ = resolver_world;
}

#[test]
fn failing_mirror_is_named_in_a_warning() {
    let mut logger = Logger::start();
    let world = ResolverWorld::new();
    given_refusing_mirror(&world);
    given_serving_mirror(&world);
    when_resolved(&world);
    let first = FIRST_MIRROR.replace("{version}", VERSION);

    let mut warned = false;
    while let Some(record) = logger.pop() {
        if record.level() == log::Level::Warn && record.args().to_string().contains(&first) {
            warned = true;
            break;
        }
    }

    assert!(warned, "expected a warning naming {first}");
}
