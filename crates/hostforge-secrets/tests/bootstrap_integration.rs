use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use hostforge_core::{MemoryTriggerStore, TriggerStore};
use hostforge_exec::{CommandResult, ExecError, RemoteExecutor};
use hostforge_secrets::*;

const OUTPUT: &str = "\
Waiting for vault to start...
Key                      Value
--START TOKENS--
root_token: hvs.root
recovery_keys:
  - r1
  - r2
  - r3
  - r4
  - r5
--END TOKENS--
Success!
";

/// Answers every script with fixed output and counts the runs
struct ScriptedExecutor {
    status: i32,
    stdout: String,
    runs: AtomicUsize,
}

impl ScriptedExecutor {
    fn new(status: i32, stdout: &str) -> Arc<Self> {
        Arc::new(Self {
            status,
            stdout: stdout.to_string(),
            runs: AtomicUsize::new(0),
        })
    }

    fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedExecutor {
    async fn run(&self, _script: &str) -> Result<CommandResult, ExecError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        // Give concurrent callers a chance to interleave
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(CommandResult {
            status: self.status,
            stdout: self.stdout.clone(),
            stderr: String::new(),
            duration: Duration::from_millis(1),
        })
    }

    async fn run_with_timeout(
        &self,
        script: &str,
        _timeout: Duration,
    ) -> Result<CommandResult, ExecError> {
        self.run(script).await
    }

    async fn copy(&self, _contents: &[u8], _destination: &Path, _mode: u32) -> Result<(), ExecError> {
        Ok(())
    }

    fn executor_type(&self) -> &'static str {
        "scripted"
    }
}

fn connector(store: Arc<MemorySecretStore>) -> StoreConnector {
    Arc::new(move |bundle: &SecretBundle| -> Result<Arc<dyn SecretStore>, SecretStoreError> {
        assert_eq!(bundle.root_token(), "hvs.root");
        Ok(store.clone())
    })
}

struct Fixture {
    executor: Arc<ScriptedExecutor>,
    state: Arc<MemoryTriggerStore>,
    secrets: Arc<MemorySecretStore>,
    dir: tempfile::TempDir,
}

impl Fixture {
    fn new(status: i32, stdout: &str) -> Self {
        Self {
            executor: ScriptedExecutor::new(status, stdout),
            state: Arc::new(MemoryTriggerStore::new()),
            secrets: Arc::new(MemorySecretStore::new()),
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn bootstrap(&self) -> SecretBootstrap {
        SecretBootstrap::new(
            "vault",
            "vault operator init",
            self.executor.clone(),
            self.state.clone(),
            connector(self.secrets.clone()),
        )
        .rescue_path(self.dir.path().join("rescue/vault.json"))
    }
}

#[tokio::test]
async fn test_bootstrap_runs_script_once() {
    let fixture = Fixture::new(0, OUTPUT);

    let first = fixture.bootstrap().run().await.unwrap();
    let second = fixture.bootstrap().run().await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first.path(), "vault/data/keys");
    assert_eq!(first.version, 1);
    assert_eq!(fixture.executor.runs(), 1);
    assert_eq!(fixture.secrets.versions("vault", "keys").await, 1);
    assert!(!fixture.bootstrap().rescue_file().exists());
}

#[tokio::test]
async fn test_concurrent_bootstraps_share_one_run() {
    let fixture = Fixture::new(0, OUTPUT);
    let first = fixture.bootstrap();
    let second = fixture.bootstrap();

    let (a, b) = tokio::join!(first.run(), second.run());

    // The second caller waits and then finds the stored secret
    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(fixture.executor.runs(), 1);
    assert_eq!(fixture.secrets.versions("vault", "keys").await, 1);
}

#[tokio::test]
async fn test_stored_entry_holds_bundle() {
    let fixture = Fixture::new(0, OUTPUT);
    fixture.bootstrap().run().await.unwrap();

    let latest = fixture
        .secrets
        .read_latest("vault", "keys")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(latest.data["rootToken"], "hvs.root");
    assert_eq!(latest.data["recoveryKey5"], "r5");
    assert_eq!(latest.data.len(), 6);
}

#[tokio::test]
async fn test_extraction_failure_is_never_retried() {
    let fixture = Fixture::new(0, "--START TOKENS--\nroot_token: x\nrecovery_keys: [a,b,c,d]\n--END TOKENS--");

    let err = fixture.bootstrap().run().await.unwrap_err();
    assert!(matches!(
        err,
        BootstrapError::Extraction(ExtractionError::WrongShareCount { found: 4, .. })
    ));

    let again = fixture.bootstrap().run().await.unwrap_err();
    assert!(matches!(again, BootstrapError::PreviouslyAttempted { .. }));
    assert_eq!(fixture.executor.runs(), 1);
    assert_eq!(fixture.secrets.versions("vault", "keys").await, 0);
}

#[tokio::test]
async fn test_failed_script_blocks_reruns() {
    let fixture = Fixture::new(2, "Error initializing: Vault is already initialized");

    let err = fixture.bootstrap().run().await.unwrap_err();
    assert!(matches!(err, BootstrapError::InitFailed { status: 2 }));
    assert!(!err.to_string().contains("already initialized"));

    assert!(matches!(
        fixture.bootstrap().run().await,
        Err(BootstrapError::PreviouslyAttempted { .. })
    ));
    assert_eq!(fixture.executor.runs(), 1);
}

#[tokio::test]
async fn test_unavailable_store_keeps_rescue_copy() {
    let fixture = Fixture::new(0, OUTPUT);
    fixture.secrets.set_unavailable(true);

    let err = fixture.bootstrap().run().await.unwrap_err();
    let BootstrapError::Materialize { rescue, .. } = &err else {
        panic!("expected materialize error, got {err:?}");
    };
    assert!(!err.to_string().contains("hvs.root"));

    let mode = std::fs::metadata(rescue).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
    let saved = std::fs::read_to_string(rescue).unwrap();
    assert!(saved.contains("hvs.root"));

    // Still down: the script is not re-run and the rescue copy stays
    assert!(matches!(
        fixture.bootstrap().run().await,
        Err(BootstrapError::Materialize { .. })
    ));
    assert!(rescue.exists());

    fixture.secrets.set_unavailable(false);
    let secret = fixture.bootstrap().run().await.unwrap();

    assert_eq!(secret.version, 1);
    assert_eq!(fixture.executor.runs(), 1);
    assert!(!rescue.exists());
}

#[tokio::test]
async fn test_corrupt_state_is_reported() {
    let fixture = Fixture::new(0, OUTPUT);
    fixture
        .state
        .record(
            "vault/bootstrap",
            hostforge_core::StepRecord::new(Vec::new()).with_output("state", "half-done"),
        )
        .await
        .unwrap();

    assert!(matches!(
        fixture.bootstrap().run().await,
        Err(BootstrapError::CorruptState(_))
    ));
    assert_eq!(fixture.executor.runs(), 0);
}

#[tokio::test]
async fn test_changed_bundle_adds_version() {
    let secrets = MemorySecretStore::new();
    let layout = SecretLayout::default();
    let bundle = |root: &str| {
        SecretBundle::new(root.to_string(), ["a", "b", "c", "d", "e"].map(String::from)).unwrap()
    };

    materialize(&secrets, bundle("one"), &layout).await.unwrap();
    let same = materialize(&secrets, bundle("one"), &layout).await.unwrap();
    let changed = materialize(&secrets, bundle("two"), &layout).await.unwrap();

    assert!(!same.written);
    assert!(changed.written);
    assert_eq!(changed.secret.version, 2);
}
