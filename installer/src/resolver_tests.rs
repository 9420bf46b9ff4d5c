//! Tests for mirror fallback, caching, and checkout.

use super::*;
use crate::artifact::ArtifactKind;
use crate::download::{DownloadError, MockDownloader};
use crate::test_utils::{StubExecutor, utf8_temp_dir, write_tar_gz};
use rstest::{fixture, rstest};
use std::cell::Cell;
use tempfile::TempDir;

const MIRROR_A: &str = "https://mirror-a.test/nginx-1.24.0.tar.gz";
const MIRROR_B: &str = "https://mirror-b.test/nginx-1.24.0.tar.gz";

struct Env {
    _guard: TempDir,
    root: Utf8PathBuf,
    cache: CacheStore,
}

#[fixture]
fn env() -> Env {
    let (guard, root) = utf8_temp_dir();
    Env {
        cache: CacheStore::new(root.join("cache")),
        root,
        _guard: guard,
    }
}

fn spec() -> ArtifactSpec {
    ArtifactSpec::new(
        "nginx",
        "1.24.0",
        vec![Mirror::archive(MIRROR_A), Mirror::archive(MIRROR_B)],
    )
    .expect("valid spec")
}

fn no_retry() -> RetryPolicy {
    RetryPolicy::new(1, Duration::ZERO)
}

fn write_payload(dest: &Utf8Path, contents: &[u8]) -> Result<Utf8PathBuf> {
    let path = dest.join("nginx-1.24.0.tar.gz");
    std::fs::write(&path, contents)?;
    Ok(path)
}

fn timed_out(mirror: &Mirror) -> InstallerError {
    InstallerError::MirrorUnavailable {
        url: mirror.url.clone(),
        reason: "timed out after 180s".to_owned(),
    }
}

#[rstest]
fn cache_hit_skips_every_mirror(env: Env) {
    let seed = env.root.join("seed.tar.gz");
    std::fs::write(&seed, b"cached").expect("seed");
    env.cache
        .put(spec().kind(), "1.24.0", &seed)
        .expect("seed cache");
    let mut fetcher = MockMirrorFetcher::new();
    fetcher.expect_fetch().never();

    let resolver = SourceResolver::new(&env.cache, &fetcher, env.root.join("scratch"), no_retry());
    let resolved = resolver.resolve(&spec()).expect("cache hit");

    assert_eq!(resolved.source, ResolvedSource::Cache);
    assert_eq!(std::fs::read(&resolved.path).expect("read"), b"cached");
}

#[rstest]
fn first_mirror_timeout_falls_back_to_second(env: Env) {
    let mut fetcher = MockMirrorFetcher::new();
    fetcher
        .expect_fetch()
        .withf(|m, _| m.url == MIRROR_A)
        .times(1)
        .returning(|m, _| Err(timed_out(m)));
    fetcher
        .expect_fetch()
        .withf(|m, _| m.url == MIRROR_B)
        .times(1)
        .returning(|_, dest| write_payload(dest, b"from b"));

    let resolver = SourceResolver::new(&env.cache, &fetcher, env.root.join("scratch"), no_retry());
    let resolved = resolver.resolve(&spec()).expect("second mirror succeeds");

    assert_eq!(resolved.source, ResolvedSource::Mirror(MIRROR_B.to_owned()));
    assert_eq!(std::fs::read(&resolved.path).expect("read"), b"from b");
    let failure = resolved.failures.first().expect("first mirror failure");
    assert_eq!(failure.origin, MIRROR_A);
    assert!(failure.reason.contains("timed out"));

    let cached = env
        .cache
        .get(spec().kind(), "1.24.0")
        .expect("get")
        .expect("now cached");
    assert_eq!(cached.path, resolved.path);
}

#[rstest]
fn zero_byte_cache_entry_is_refetched_and_overwritten(env: Env) {
    let slot = env.cache.slot_dir(spec().kind(), "1.24.0");
    std::fs::create_dir_all(&slot).expect("slot");
    std::fs::write(slot.join("nginx-1.24.0.tar.gz"), b"").expect("empty entry");

    let mut fetcher = MockMirrorFetcher::new();
    fetcher
        .expect_fetch()
        .times(1)
        .returning(|_, dest| write_payload(dest, b"fresh bytes"));

    let resolver = SourceResolver::new(&env.cache, &fetcher, env.root.join("scratch"), no_retry());
    let resolved = resolver.resolve(&spec()).expect("refetch");

    assert!(matches!(resolved.source, ResolvedSource::Mirror(_)));
    let entry = env
        .cache
        .get(spec().kind(), "1.24.0")
        .expect("get")
        .expect("hit");
    assert_eq!(entry.size_bytes, 11);
}

#[rstest]
fn all_mirrors_failing_reports_each_reason(env: Env) {
    let mut fetcher = MockMirrorFetcher::new();
    fetcher
        .expect_fetch()
        .times(2)
        .returning(|m, _| Err(timed_out(m)));

    let resolver = SourceResolver::new(&env.cache, &fetcher, env.root.join("scratch"), no_retry());
    let err = resolver.resolve(&spec()).expect_err("all fail");

    match err {
        InstallerError::AllMirrorsFailed { artifact, failures } => {
            assert_eq!(artifact, "nginx 1.24.0");
            let origins: Vec<_> = failures.iter().map(|f| f.origin.as_str()).collect();
            assert_eq!(origins, [MIRROR_A, MIRROR_B]);
        }
        other => panic!("expected AllMirrorsFailed, got {other:?}"),
    }
    assert!(env.cache.get(spec().kind(), "1.24.0").expect("get").is_none());
}

#[rstest]
fn each_mirror_is_retried_before_moving_on(env: Env) {
    let calls = Cell::new(0u32);
    let mut fetcher = MockMirrorFetcher::new();
    fetcher
        .expect_fetch()
        .withf(|m, _| m.url == MIRROR_A)
        .times(3)
        .returning(move |m, dest| {
            // Fails twice, then succeeds on the third attempt.
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(timed_out(m))
            } else {
                write_payload(dest, b"third time")
            }
        });

    let resolver = SourceResolver::new(
        &env.cache,
        &fetcher,
        env.root.join("scratch"),
        RetryPolicy::new(3, Duration::ZERO),
    );
    let resolved = resolver.resolve(&spec()).expect("third attempt succeeds");

    assert_eq!(resolved.source, ResolvedSource::Mirror(MIRROR_A.to_owned()));
    assert!(resolved.failures.is_empty());
}

#[rstest]
#[case::only_first(&[true, false, false], Some(0))]
#[case::only_last(&[false, false, true], Some(2))]
#[case::middle_and_last(&[false, true, true], Some(1))]
#[case::none(&[false, false, false], None)]
#[case::all(&[true, true, true], Some(0))]
fn result_always_comes_from_first_reachable_mirror(
    env: Env,
    #[case] reachable: &'static [bool],
    #[case] expected: Option<usize>,
) {
    let mirrors: Vec<Mirror> = (0..reachable.len())
        .map(|i| Mirror::archive(format!("https://m{i}.test/a.tar.gz")))
        .collect();
    let spec = ArtifactSpec::new("nginx", "1.24.0", mirrors).expect("spec");
    let mut fetcher = MockMirrorFetcher::new();
    fetcher.expect_fetch().returning(move |m, dest| {
        let index: usize = m
            .url
            .trim_start_matches("https://m")
            .split('.')
            .next()
            .and_then(|s| s.parse().ok())
            .expect("index in URL");
        if reachable.get(index).copied().unwrap_or(false) {
            write_payload(dest, format!("mirror {index}").as_bytes())
        } else {
            Err(timed_out(m))
        }
    });

    let resolver = SourceResolver::new(&env.cache, &fetcher, env.root.join("scratch"), no_retry());
    let result = resolver.resolve(&spec);

    match (result, expected) {
        (Ok(resolved), Some(index)) => {
            assert_eq!(
                resolved.source,
                ResolvedSource::Mirror(format!("https://m{index}.test/a.tar.gz"))
            );
            assert_eq!(resolved.failures.len(), index);
        }
        (Err(InstallerError::AllMirrorsFailed { failures, .. }), None) => {
            assert_eq!(failures.len(), reachable.len());
        }
        (other, expected) => panic!("unexpected {other:?} for expected {expected:?}"),
    }
}

#[rstest]
fn corrupt_download_is_a_mirror_failure_and_never_cached(env: Env) {
    let mut downloader = MockDownloader::new();
    downloader
        .expect_download()
        .withf(|url, _| url == MIRROR_A)
        .returning(|_, dest| {
            std::fs::write(dest, b"<html>not an archive</html>").map_err(DownloadError::Io)?;
            Ok(27)
        });
    downloader
        .expect_download()
        .withf(|url, _| url == MIRROR_B)
        .returning(|_, dest| {
            let dest = Utf8Path::from_path(dest).expect("UTF-8 path");
            write_tar_gz(dest, &[("nginx-1.24.0/configure", b"#!/bin/sh\n")]);
            Ok(1)
        });
    let executor = StubExecutor::new(Vec::new());
    let fetcher = NetworkFetcher::new(
        GitClient::new(&executor, Duration::from_secs(1)),
        &downloader,
        2,
    );

    let resolver = SourceResolver::new(&env.cache, &fetcher, env.root.join("scratch"), no_retry());
    let resolved = resolver.resolve(&spec()).expect("second mirror is valid");

    assert_eq!(resolved.source, ResolvedSource::Mirror(MIRROR_B.to_owned()));
    let failure = resolved.failures.first().expect("corrupt mirror recorded");
    assert!(failure.reason.contains("integrity check failed"));
    assert_eq!(executor.call_count(), 0);
}

#[rstest]
fn checkout_extracts_archive_into_fresh_tree(env: Env) {
    let mut fetcher = MockMirrorFetcher::new();
    fetcher.expect_fetch().times(1).returning(|_, dest| {
        let path = dest.join("nginx-1.24.0.tar.gz");
        write_tar_gz(
            &path,
            &[("nginx-1.24.0/auto/configure", b"#!/bin/sh\n")],
        );
        Ok(path)
    });

    let resolver = SourceResolver::new(&env.cache, &fetcher, env.root.join("scratch"), no_retry());
    let dest = env.root.join("work/nginx");
    std::fs::create_dir_all(dest.join("stale")).expect("stale tree");

    let checkout = resolver.checkout(&spec(), &dest).expect("checkout");

    assert_eq!(checkout.root, dest.join("nginx-1.24.0"));
    assert!(checkout.root.join("auto/configure").is_file());
    assert!(!dest.join("stale").exists());
}

#[rstest]
fn checkout_copies_cached_repositories(env: Env) {
    let repo = env.root.join("seed/ModSecurity");
    std::fs::create_dir_all(repo.join(".git")).expect("repo");
    std::fs::write(repo.join("build.sh"), b"#!/bin/sh\n").expect("file");
    let kind = ArtifactKind::from("modsecurity");
    env.cache.put(&kind, "3.0.14", &repo).expect("seed cache");
    let mut fetcher = MockMirrorFetcher::new();
    fetcher.expect_fetch().never();
    let spec = ArtifactSpec::new(kind, "3.0.14", vec![Mirror::git("https://x.test/ModSecurity.git")])
        .expect("spec");

    let resolver = SourceResolver::new(&env.cache, &fetcher, env.root.join("scratch"), no_retry());
    let dest = env.root.join("work/modsecurity");
    let checkout = resolver.checkout(&spec, &dest).expect("checkout");

    assert_eq!(checkout.root, dest);
    assert!(dest.join("build.sh").is_file());
    assert!(checkout.resolved.path.starts_with(env.cache.root()));
}

#[test]
fn retry_delay_grows_linearly() {
    let policy = RetryPolicy::new(3, Duration::from_secs(2));
    assert_eq!(policy.delay_before(1), Duration::ZERO);
    assert_eq!(policy.delay_before(2), Duration::from_secs(2));
    assert_eq!(policy.delay_before(3), Duration::from_secs(4));
}

#[test]
fn zero_attempts_still_tries_once() {
    assert_eq!(RetryPolicy::new(0, Duration::ZERO).attempts(), 1);
}

#[rstest]
#[case("https://gitee.com/supine-win/ModSecurity-nginx.git", MirrorKind::Git, "ModSecurity-nginx")]
#[case("https://x.test/repo/", MirrorKind::Git, "repo")]
#[case("https://x.test/", MirrorKind::Archive, "x.test")]
#[case("https://x.test/dl/a.zip#frag", MirrorKind::Archive, "a.zip")]
fn file_names_from_urls(#[case] url: &str, #[case] kind: MirrorKind, #[case] expected: &str) {
    assert_eq!(artifact_file_name(url, kind), expected);
}
