//! End-to-end builds against a temporary store.
//!
//! Steps run with host isolation: the "package manager" is a small shell
//! script that writes into the staging rootfs, and remote installers are
//! served by an in-memory fetcher.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use tempfile::TempDir;

use envbuild::cancel::{self, CancelSignal};
use envbuild::config::{BuilderConfig, Isolation};
use envbuild::fetch::{sha256_hex, FetchError, Fetcher};
use envbuild::image::{BaseImage, ImageStore};
use envbuild::step::{PackageManager, VerificationPolicy};
use envbuild::verify::VerifySpec;
use envbuild::{BuildError, BuildRequest, BuildState, EnvironmentBuilder, ProvisioningStep, Recipe, StepKind};

const RUSTUP_URL: &str = "https://installer.example/rustup-init.sh";

/// Installs a fake toolchain under /opt/rust and records its arguments.
const RUSTUP_SCRIPT: &str = r#"set -e
mkdir -p "$ENVBUILD_ROOT/opt/rust/bin"
printf '#!/bin/sh\necho rustc 1.80.0\n' > "$ENVBUILD_ROOT/opt/rust/bin/rustc"
chmod 755 "$ENVBUILD_ROOT/opt/rust/bin/rustc"
echo "$@" > "$ENVBUILD_ROOT/opt/rust/installed-with"
"#;

/// Serves fixed bodies and records every URL requested.
#[derive(Default)]
struct FakeFetcher {
    bodies: HashMap<String, Vec<u8>>,
    requests: Mutex<Vec<String>>,
}

impl FakeFetcher {
    fn serving(url: &str, body: &str) -> Self {
        let mut fetcher = Self::default();
        fetcher.bodies.insert(url.to_string(), body.as_bytes().to_vec());
        fetcher
    }

    fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch(&self, url: &Url) -> Result<Vec<u8>, FetchError> {
        self.requests.lock().unwrap().push(url.to_string());
        self.bodies
            .get(url.as_str())
            .cloned()
            .ok_or(FetchError::Status(404))
    }

    async fn probe(&self, _url: &Url) -> Result<(), FetchError> {
        Ok(())
    }
}

struct Fixture {
    dir: TempDir,
    base: BaseImage,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("base-src");
        fs::create_dir_all(src.join("etc")).unwrap();
        fs::create_dir_all(src.join("usr/bin")).unwrap();
        fs::write(src.join("etc/os-release"), "ID=ubuntu\nVERSION_ID=\"22.04\"\n").unwrap();
        fs::write(src.join("usr/bin/sh"), "#!shell\n").unwrap();
        fs::set_permissions(src.join("usr/bin/sh"), fs::Permissions::from_mode(0o755)).unwrap();

        let base = BaseImage::new("ubuntu", "22.04").unwrap();
        ImageStore::open(dir.path().join("store"))
            .unwrap()
            .import_base(&base, &src)
            .unwrap();
        Self { dir, base }
    }

    fn store_dir(&self) -> PathBuf {
        self.dir.path().join("store")
    }

    fn store(&self) -> ImageStore {
        ImageStore::open(self.store_dir()).unwrap()
    }

    fn builder(&self, fetcher: Arc<dyn Fetcher>, cancel: CancelSignal) -> EnvironmentBuilder {
        let config = BuilderConfig {
            store_dir: self.store_dir(),
            isolation: Isolation::Host,
            step_timeout_secs: 30,
            ..BuilderConfig::default()
        };
        EnvironmentBuilder::new(config, self.store(), fetcher, cancel)
    }

    fn request(&self, steps: Vec<ProvisioningStep>) -> BuildRequest {
        let mut request = BuildRequest::new(self.base.clone(), steps);
        request.package_manager = fake_apt();
        request
    }

    /// Nothing published and no work directory left behind.
    fn assert_store_clean(&self) {
        let store = self.store();
        assert!(store.list_images().unwrap().is_empty(), "an image was published");
        assert!(store.stale_work_dirs().unwrap().is_empty(), "work directory left behind");
    }

    fn assert_base_untouched(&self) {
        let rootfs = self.store().base_rootfs(&self.base);
        let mut names: Vec<_> = fs::read_dir(&rootfs)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["etc", "usr"]);
    }
}

/// Package manager stand-in: `update` writes index files, `install` creates
/// an executable per package plus a cache entry. A package named `missing`
/// fails like apt does for an unknown package; `lingering` forks a child that
/// writes dpkg state after a delay, the way apt leaves dpkg running.
fn fake_apt() -> PackageManager {
    PackageManager {
        update: vec![
            "sh".into(),
            "-c".into(),
            "mkdir -p var/lib/apt/lists && echo index > var/lib/apt/lists/archive_Packages".into(),
        ],
        install: vec![
            "sh".into(),
            "-c".into(),
            r#"set -e
for p in "$@"; do
  if [ "$p" = missing ]; then echo "E: Unable to locate package $p" >&2; exit 100; fi
  if [ "$p" = slow ]; then sleep 10; fi
  if [ "$p" = lingering ]; then
    (sleep 2; mkdir -p "$ENVBUILD_ROOT/usr/lib/dpkg"; echo late > "$ENVBUILD_ROOT/usr/lib/dpkg/status") &
    wait
  fi
  mkdir -p usr/bin var/cache/apt/archives
  printf '#!/bin/sh\n' > "usr/bin/$p"
  chmod 755 "usr/bin/$p"
  head -c 4096 /dev/zero > "var/cache/apt/archives/$p.deb"
done"#
                .into(),
            "apt-get".into(),
        ],
        env: [("DEBIAN_FRONTEND".to_string(), "noninteractive".to_string())].into(),
    }
}

fn install(order: usize, packages: &[&str]) -> ProvisioningStep {
    ProvisioningStep::new(
        order,
        StepKind::PackageInstall {
            packages: packages.iter().map(|s| s.to_string()).collect(),
        },
    )
}

fn rustup(order: usize, verify: VerificationPolicy) -> ProvisioningStep {
    ProvisioningStep::new(
        order,
        StepKind::RemoteScriptInstall {
            url: RUSTUP_URL.into(),
            verify,
            args: vec!["-y".into(), "--profile".into(), "minimal".into()],
            interpreter: "sh".into(),
        },
    )
}

fn cleanup(order: usize, paths: &[&str]) -> ProvisioningStep {
    ProvisioningStep::new(
        order,
        StepKind::Cleanup {
            paths: paths.iter().map(|s| s.to_string()).collect(),
            keep: Default::default(),
        },
    )
}

fn pinned() -> VerificationPolicy {
    VerificationPolicy::Sha256(sha256_hex(RUSTUP_SCRIPT.as_bytes()))
}

fn toolchain_steps() -> Vec<ProvisioningStep> {
    vec![
        install(0, &["curl", "qemu-system-x86_64", "gcc"]),
        rustup(1, pinned()),
        cleanup(2, &["/var/lib/apt/lists", "/var/cache/apt/archives"]),
    ]
}

fn dir_size(path: &Path) -> u64 {
    envbuild::step::builder::dir_size(path).unwrap()
}

#[tokio::test]
async fn test_toolchain_image() {
    let fx = Fixture::new();
    let fetcher = Arc::new(FakeFetcher::serving(RUSTUP_URL, RUSTUP_SCRIPT));
    let mut builder = fx.builder(fetcher.clone(), CancelSignal::never());

    let mut request = fx.request(toolchain_steps());
    request.tag = Some("rust-qemu-dev".into());
    request.verify = VerifySpec {
        executables: vec![
            "/usr/bin/gcc".into(),
            "/usr/bin/qemu-system-x86_64".into(),
            "/opt/rust/bin/rustc".into(),
        ],
        empty_dirs: vec!["/var/lib/apt/lists".into(), "/var/cache/apt/archives".into()],
    };

    let image = builder.build(&request).await.unwrap();
    assert_eq!(builder.state(), BuildState::Complete);
    assert_eq!(
        builder.history(),
        &[
            BuildState::Pending,
            BuildState::Applying(0),
            BuildState::Applying(1),
            BuildState::Applying(2),
            BuildState::Verifying,
            BuildState::Complete,
        ]
    );
    assert_eq!(fetcher.requests(), vec![RUSTUP_URL.to_string()]);

    let store = fx.store();
    let rootfs = store.image_rootfs(&image.id);
    assert_eq!(
        fs::read_to_string(rootfs.join("opt/rust/installed-with")).unwrap().trim(),
        "-y --profile minimal"
    );
    // Staged installer is gone.
    assert!(!rootfs.join("tmp/.envbuild-step-2.sh").exists());

    assert_eq!(image.layers.len(), 3);
    assert_eq!(
        image.layers.iter().map(|l| l.kind.as_str()).collect::<Vec<_>>(),
        vec!["package-install", "remote-script", "cleanup"]
    );
    // Cleanup removed the index and the three cached .deb files.
    assert_eq!(image.layers[2].removed, 4);
    assert_eq!(store.resolve("rust-qemu-dev").unwrap(), image);
    fx.assert_base_untouched();
}

#[tokio::test]
async fn test_cleanup_reduces_size_and_keeps_tools() {
    let fx = Fixture::new();
    let fetcher: Arc<dyn Fetcher> = Arc::new(FakeFetcher::default());

    let mut builder = fx.builder(fetcher.clone(), CancelSignal::never());
    let without = builder
        .build(&fx.request(vec![install(0, &["gcc", "make"])]))
        .await
        .unwrap();

    let mut builder = fx.builder(fetcher, CancelSignal::never());
    let with = builder
        .build(&fx.request(vec![
            install(0, &["gcc", "make"]),
            cleanup(1, &["/var/cache/apt/archives", "/var/lib/apt/lists"]),
        ]))
        .await
        .unwrap();

    let store = fx.store();
    let small = store.image_rootfs(&with.id);
    let large = store.image_rootfs(&without.id);
    assert!(dir_size(&small) < dir_size(&large));
    for tool in ["gcc", "make"] {
        let mode = fs::metadata(small.join("usr/bin").join(tool))
            .unwrap()
            .permissions()
            .mode();
        assert_ne!(mode & 0o111, 0, "{} lost its execute bit", tool);
    }
    assert!(small.join("var/cache/apt/archives").is_dir());
    assert_eq!(fs::read_dir(small.join("var/cache/apt/archives")).unwrap().count(), 0);
}

#[tokio::test]
async fn test_builds_are_deterministic() {
    let first = Fixture::new();
    let second = Fixture::new();

    let build = |fx: &Fixture| {
        let fetcher = Arc::new(FakeFetcher::serving(RUSTUP_URL, RUSTUP_SCRIPT));
        let mut builder = fx.builder(fetcher, CancelSignal::never());
        let request = fx.request(toolchain_steps());
        async move { builder.build(&request).await.unwrap() }
    };

    let a = build(&first).await;
    let b = build(&second).await;
    assert_eq!(a.id, b.id);
    assert_eq!(a.digest, b.digest);
    assert_eq!(a.base_digest, b.base_digest);
    assert_eq!(a.input_digest, b.input_digest);
    assert_eq!(
        a.layers.iter().map(|l| &l.digest).collect::<Vec<_>>(),
        b.layers.iter().map(|l| &l.digest).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn test_failed_step_halts_build() {
    let fx = Fixture::new();
    let fetcher = Arc::new(FakeFetcher::serving(RUSTUP_URL, RUSTUP_SCRIPT));
    let mut builder = fx.builder(fetcher.clone(), CancelSignal::never());

    let request = fx.request(vec![
        install(0, &["curl"]),
        install(1, &["missing"]),
        rustup(2, pinned()),
    ]);

    match builder.build(&request).await {
        Err(BuildError::StepExecutionFailure { step, reason }) => {
            assert_eq!(step.order, 1);
            assert_eq!(step.kind, "package-install");
            assert!(reason.contains("Unable to locate package missing"), "{}", reason);
        }
        other => panic!("expected StepExecutionFailure, got {:?}", other),
    }
    assert_eq!(
        builder.history(),
        &[
            BuildState::Pending,
            BuildState::Applying(0),
            BuildState::Applying(1),
            BuildState::Failed,
        ]
    );
    // The step after the failure never ran.
    assert!(fetcher.requests().is_empty());
    fx.assert_store_clean();
    fx.assert_base_untouched();
}

#[tokio::test]
async fn test_malformed_step_rejected_before_any_work() {
    let fx = Fixture::new();
    let fetcher = Arc::new(FakeFetcher::serving(RUSTUP_URL, RUSTUP_SCRIPT));
    let mut builder = fx.builder(fetcher.clone(), CancelSignal::never());

    let mut bad = rustup(1, pinned());
    if let StepKind::RemoteScriptInstall { url, .. } = &mut bad.kind {
        *url = "http://installer.example/rustup-init.sh".into();
    }
    let request = fx.request(vec![install(0, &["curl"]), bad, cleanup(2, &["/tmp"])]);

    match builder.build(&request).await {
        Err(BuildError::MalformedStepSpec { step, reason }) => {
            assert_eq!(step.order, 1);
            assert!(reason.contains("https"), "{}", reason);
        }
        other => panic!("expected MalformedStepSpec, got {:?}", other),
    }
    assert!(fetcher.requests().is_empty());
    assert_eq!(builder.history(), &[BuildState::Pending, BuildState::Failed]);
    fx.assert_store_clean();
}

#[tokio::test]
async fn test_empty_step_list() {
    let fx = Fixture::new();
    let mut builder = fx.builder(Arc::new(FakeFetcher::default()), CancelSignal::never());
    assert!(matches!(
        builder.build(&fx.request(Vec::new())).await,
        Err(BuildError::EmptyStepList)
    ));
    fx.assert_store_clean();
}

#[tokio::test]
async fn test_integrity_violation_never_executes_script() {
    let fx = Fixture::new();
    let tampered = format!("{}touch \"$ENVBUILD_ROOT/pwned\"\n", RUSTUP_SCRIPT);
    let fetcher = Arc::new(FakeFetcher::serving(RUSTUP_URL, &tampered));
    let mut builder = fx.builder(fetcher.clone(), CancelSignal::never());

    let request = fx.request(vec![install(0, &["curl"]), rustup(1, pinned())]);
    match builder.build(&request).await {
        Err(BuildError::IntegrityViolation {
            step,
            expected,
            actual,
        }) => {
            assert_eq!(step.order, 1);
            assert_eq!(expected, sha256_hex(RUSTUP_SCRIPT.as_bytes()));
            assert_eq!(actual, sha256_hex(tampered.as_bytes()));
        }
        other => panic!("expected IntegrityViolation, got {:?}", other),
    }
    assert_eq!(fetcher.requests().len(), 1);
    fx.assert_store_clean();
}

#[tokio::test]
async fn test_unreachable_installer_is_network_failure() {
    let fx = Fixture::new();
    let fetcher = Arc::new(FakeFetcher::default());
    let mut builder = fx.builder(fetcher, CancelSignal::never());

    match builder.build(&fx.request(vec![rustup(0, pinned())])).await {
        Err(BuildError::NetworkFailure { step, url, .. }) => {
            assert_eq!(step.order, 0);
            assert_eq!(url, RUSTUP_URL);
        }
        other => panic!("expected NetworkFailure, got {:?}", other),
    }
    fx.assert_store_clean();
}

#[tokio::test]
async fn test_step_timeout_fails_build() {
    let fx = Fixture::new();
    let mut builder = fx.builder(Arc::new(FakeFetcher::default()), CancelSignal::never());

    let mut slow = install(0, &["slow"]);
    slow.timeout_secs = Some(1);
    match builder.build(&fx.request(vec![slow])).await {
        Err(BuildError::StepExecutionFailure { step, reason }) => {
            assert_eq!(step.order, 0);
            assert!(reason.contains("timed out"), "{}", reason);
        }
        other => panic!("expected StepExecutionFailure, got {:?}", other),
    }
    fx.assert_store_clean();
}

#[tokio::test]
async fn test_timed_out_step_leaves_no_process_behind() {
    let fx = Fixture::new();
    let mut builder = fx.builder(Arc::new(FakeFetcher::default()), CancelSignal::never());

    let mut step = install(0, &["lingering"]);
    step.timeout_secs = Some(1);
    match builder.build(&fx.request(vec![step])).await {
        Err(BuildError::StepExecutionFailure { reason, .. }) => {
            assert!(reason.contains("timed out"), "{}", reason);
        }
        other => panic!("expected StepExecutionFailure, got {:?}", other),
    }
    fx.assert_store_clean();

    // The forked writer would have recreated the work directory by now.
    tokio::time::sleep(Duration::from_secs(3)).await;
    fx.assert_store_clean();
}

#[tokio::test]
async fn test_cancellation_publishes_nothing() {
    let fx = Fixture::new();
    let (handle, signal) = cancel::channel();
    let mut builder = fx.builder(Arc::new(FakeFetcher::default()), signal);

    let request = fx.request(vec![install(0, &["slow"]), cleanup(1, &["/var/cache/apt/archives"])]);
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.cancel();
    });

    match builder.build(&request).await {
        Err(BuildError::Cancelled { step: Some(step) }) => assert_eq!(step.order, 0),
        other => panic!("expected Cancelled, got {:?}", other),
    }
    canceller.await.unwrap();
    assert_eq!(builder.state(), BuildState::Failed);
    fx.assert_store_clean();
}

#[tokio::test]
async fn test_failed_verification_publishes_nothing() {
    let fx = Fixture::new();
    let mut builder = fx.builder(Arc::new(FakeFetcher::default()), CancelSignal::never());

    let mut request = fx.request(vec![install(0, &["gcc"])]);
    request.tag = Some("dev".into());
    request.verify = VerifySpec {
        executables: vec!["/usr/bin/gcc".into(), "/opt/rust/bin/rustc".into()],
        empty_dirs: Vec::new(),
    };

    match builder.build(&request).await {
        Err(BuildError::VerificationFailed { failures }) => {
            assert_eq!(failures.len(), 1);
            assert!(failures[0].starts_with("/opt/rust/bin/rustc"));
        }
        other => panic!("expected VerificationFailed, got {:?}", other),
    }
    assert_eq!(builder.history().last(), Some(&BuildState::Failed));
    assert!(fx.store().read_tag("dev").unwrap().is_none());
    fx.assert_store_clean();
}

#[tokio::test]
async fn test_insecure_skip_runs_unverified_script() {
    let fx = Fixture::new();
    let fetcher = Arc::new(FakeFetcher::serving(RUSTUP_URL, RUSTUP_SCRIPT));
    let mut builder = fx.builder(fetcher, CancelSignal::never());

    let image = builder
        .build(&fx.request(vec![rustup(0, VerificationPolicy::InsecureSkip)]))
        .await
        .unwrap();
    assert!(fx.store().image_rootfs(&image.id).join("opt/rust/bin/rustc").is_file());
}

#[tokio::test]
async fn test_recipe_round_trip_build() {
    let fx = Fixture::new();
    let recipe = Recipe::from_toml(&format!(
        r#"
        [base]
        name = "ubuntu"
        tag = "22.04"

        [image]
        tag = "rust-qemu-dev"

        [package_manager]
        update = []
        install = ["sh", "-c", "mkdir -p usr/bin && for p in \"$@\"; do touch usr/bin/$p && chmod 755 usr/bin/$p; done", "apt-get"]

        [[step]]
        kind = "package-install"
        packages = ["gcc", "curl"]

        [[step]]
        kind = "remote-script"
        url = "{url}"
        verify = {{ sha256 = "{sha}" }}
        args = ["-y"]

        [verify]
        executables = ["/usr/bin/gcc", "/opt/rust/bin/rustc"]
        "#,
        url = RUSTUP_URL,
        sha = sha256_hex(RUSTUP_SCRIPT.as_bytes()),
    ))
    .unwrap();

    let fetcher = Arc::new(FakeFetcher::serving(RUSTUP_URL, RUSTUP_SCRIPT));
    let mut builder = fx.builder(fetcher.clone(), CancelSignal::never());
    let image = builder.build(&recipe.build_request(false)).await.unwrap();
    assert_eq!(image.tag.as_deref(), Some("rust-qemu-dev"));

    // Second build of the unchanged recipe is skipped without fetching.
    let again = builder.build(&recipe.build_request(false)).await.unwrap();
    assert_eq!(again, image);
    assert_eq!(fetcher.requests().len(), 1);
}
