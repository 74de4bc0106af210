use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tokio::sync::broadcast;

use chute_core::{Chute, HostConfig};
use chute_pipeline::uci::ConfigKind;
use chute_pipeline::{
    reporter, ChuteStore, MockConfd, MockController, MockHostServices, MockInstaller,
    MockRuntime, PipelineSettings, ReporterHandle, ReporterSettings, StepEnv, UpdateDescriptor,
    UpdateManager, UpdateOutcome,
};

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// A node with mocked collaborators, torn down on drop.
pub struct Node {
    pub root: PathBuf,
    pub settings: Arc<PipelineSettings>,
    pub store: ChuteStore,
    pub manager: UpdateManager,
    pub reporter: ReporterHandle,
    pub runtime: MockRuntime,
    pub confd: MockConfd,
    pub installer: MockInstaller,
    pub services: MockHostServices,
    pub controller: MockController,
    shutdown: broadcast::Sender<()>,
}

impl Node {
    /// A node with two wired ports and one radio.
    pub fn start() -> Node {
        let id = COUNTER.fetch_add(1, Ordering::Relaxed);
        let root = std::env::temp_dir().join(format!(
            "chuted-integration-{}-{id}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&root);
        std::fs::create_dir_all(root.join("config")).unwrap();
        fake_device(&root.join("sys"), "eth0", false);
        fake_device(&root.join("sys"), "eth1", false);
        fake_device(&root.join("sys"), "wlan0", true);

        let settings = Arc::new(PipelineSettings {
            host_config: root.join("hostconfig.yaml"),
            os_config_dir: root.join("config"),
            sysfs_root: root.join("sys"),
            chute_data_dir: root.join("data"),
            subnet_pool: "192.168.128.0/17".parse().unwrap(),
            chute_prefix: 24,
            default_memory: None,
            runtime_timeout: Duration::from_secs(5),
            confd_timeout: Duration::from_secs(5),
            installer_timeout: Duration::from_secs(5),
        });
        let store = ChuteStore::open(root.join("chutes.yaml")).unwrap();

        let runtime = MockRuntime::new();
        let confd = MockConfd::new();
        let installer = MockInstaller::new();
        let services = MockHostServices::new();
        let controller = MockController::new();

        let env = StepEnv {
            settings: settings.clone(),
            store: store.clone(),
            runtime: Arc::new(runtime.clone()),
            confd: Arc::new(confd.clone()),
            installer: Arc::new(installer.clone()),
            services: Arc::new(services.clone()),
        };

        let (shutdown, _) = broadcast::channel(1);
        let (reporter, _) = reporter::spawn(
            ReporterSettings {
                retry_base: Duration::from_millis(10),
                retry_max: Duration::from_millis(50),
                ..ReporterSettings::default()
            },
            Some(Arc::new(controller.clone())),
            shutdown.subscribe(),
        );
        let (manager, _) =
            UpdateManager::spawn(env, 16, Some(reporter.clone()), shutdown.subscribe());

        Node {
            root,
            settings,
            store,
            manager,
            reporter,
            runtime,
            confd,
            installer,
            services,
            controller,
            shutdown,
        }
    }

    /// Submit a descriptor and wait for its outcome.
    pub async fn submit(&self, descriptor: Value) -> Result<UpdateOutcome> {
        let descriptor: UpdateDescriptor =
            serde_json::from_value(descriptor).context("descriptor does not parse")?;
        let ticket = self.manager.add(descriptor, None)?;
        let outcome = tokio::time::timeout(Duration::from_secs(20), ticket.wait())
            .await
            .context("update did not finish in time")??;
        Ok(outcome)
    }

    pub fn chute(&self, name: &str) -> Option<Chute> {
        self.store.get(name)
    }

    /// Contents of a generated OS config file, if it exists.
    pub fn os_file(&self, kind: ConfigKind) -> Option<String> {
        std::fs::read_to_string(kind.path(&self.settings.os_config_dir)).ok()
    }

    pub fn host_config(&self) -> Option<HostConfig> {
        HostConfig::load_optional(&self.settings.host_config).unwrap()
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

/// Create `<sysfs>/class/net/<name>` with a device link, and a wireless
/// marker when `wifi` is set.
pub fn fake_device(sysfs: &Path, name: &str, wifi: bool) {
    let dir = sysfs.join("class").join("net").join(name);
    std::fs::create_dir_all(dir.join("device")).unwrap();
    if wifi {
        std::fs::create_dir_all(dir.join("wireless")).unwrap();
    }
}

/// Chute descriptor for a single light service with one LAN interface.
pub fn create_chute(name: &str, version: u64) -> Value {
    serde_json::json!({
        "class": "chute",
        "type": "create",
        "name": name,
        "new": {
            "version": version,
            "services": {
                "main": {
                    "image": "python2",
                    "command": format!("python -u {name}.py"),
                    "interfaces": {
                        "lan": {
                            "type": "lan",
                            "dhcp": {"start": 100, "limit": 50, "lease": "12h"}
                        }
                    }
                }
            }
        }
    })
}

pub fn chute_op(kind: &str, name: &str) -> Value {
    serde_json::json!({"class": "chute", "type": kind, "name": name})
}

/// Poll `check` until it holds or `timeout_ms` passes.
pub async fn wait_for<F>(timeout_ms: u64, mut check: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    bail!("condition not met within {timeout_ms}ms")
}
