//! In-memory container runtime for tests and dry runs.
//!
//! Records every call and lets a test inject a failure for one operation on
//! one container (or image tag).

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::*;

#[derive(Debug, Clone)]
pub struct MockContainer {
    pub spec: ContainerSpec,
    pub running: bool,
}

#[derive(Default)]
struct Inner {
    containers: BTreeMap<String, MockContainer>,
    images: BTreeSet<String>,
    calls: Vec<String>,
    faults: HashSet<(String, String)>,
}

#[derive(Clone, Default)]
pub struct MockRuntime {
    inner: Arc<Mutex<Inner>>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next and every later `op` on `target` until cleared.
    pub fn fail_on(&self, op: &str, target: &str) {
        self.inner
            .lock()
            .faults
            .insert((op.to_string(), target.to_string()));
    }

    pub fn clear_faults(&self) {
        self.inner.lock().faults.clear();
    }

    /// Calls in order, formatted `op name`.
    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().calls.clone()
    }

    pub fn container(&self, name: &str) -> Option<MockContainer> {
        self.inner.lock().containers.get(name).cloned()
    }

    pub fn container_names(&self) -> Vec<String> {
        self.inner.lock().containers.keys().cloned().collect()
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.container(name).is_some_and(|c| c.running)
    }

    pub fn images(&self) -> Vec<String> {
        self.inner.lock().images.iter().cloned().collect()
    }

    /// Seed a container as if it had been created earlier.
    pub fn insert(&self, spec: ContainerSpec, running: bool) {
        self.inner
            .lock()
            .containers
            .insert(spec.name.clone(), MockContainer { spec, running });
    }

    fn enter(&self, op: &str, target: &str) -> Result<parking_lot::MutexGuard<'_, Inner>> {
        let mut inner = self.inner.lock();
        inner.calls.push(format!("{op} {target}"));
        if inner.faults.contains(&(op.to_string(), target.to_string())) {
            return Err(RuntimeError::Other(format!("injected failure: {op} {target}")));
        }
        Ok(inner)
    }
}

fn not_found(name: &str) -> RuntimeError {
    RuntimeError::NotFound(name.to_string())
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    fn runtime_type(&self) -> &'static str {
        "mock"
    }

    async fn prepare_image(&self, spec: &ImageSpec) -> Result<()> {
        let mut inner = self.enter("prepare_image", &spec.tag)?;
        inner.images.insert(spec.tag.clone());
        Ok(())
    }

    async fn remove_image(&self, tag: &str) -> Result<()> {
        let mut inner = self.enter("remove_image", tag)?;
        inner.images.remove(tag);
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<()> {
        let mut inner = self.enter("create", &spec.name)?;
        if inner.containers.contains_key(&spec.name) {
            return Err(RuntimeError::Conflict {
                name: spec.name.clone(),
                status: "already created".into(),
            });
        }
        if !inner.images.contains(&spec.image) {
            return Err(RuntimeError::Other(format!("no such image: {}", spec.image)));
        }
        inner.containers.insert(
            spec.name.clone(),
            MockContainer {
                spec: spec.clone(),
                running: false,
            },
        );
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<()> {
        let mut inner = self.enter("start", name)?;
        let container = inner.containers.get_mut(name).ok_or_else(|| not_found(name))?;
        if container.running {
            return Err(RuntimeError::Conflict {
                name: name.to_string(),
                status: "running".into(),
            });
        }
        container.running = true;
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        let mut inner = self.enter("stop", name)?;
        let container = inner.containers.get_mut(name).ok_or_else(|| not_found(name))?;
        container.running = false;
        Ok(())
    }

    async fn restart(&self, name: &str) -> Result<()> {
        let mut inner = self.enter("restart", name)?;
        let container = inner.containers.get_mut(name).ok_or_else(|| not_found(name))?;
        container.running = true;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let mut inner = self.enter("remove", name)?;
        inner.containers.remove(name);
        Ok(())
    }

    async fn inspect(&self, name: &str) -> Result<Option<ContainerInspect>> {
        let inner = self.enter("inspect", name)?;
        Ok(inner.containers.get(name).map(|c| ContainerInspect {
            name: format!("/{name}"),
            state: ContainerState {
                status: if c.running { "running" } else { "exited" }.to_string(),
                pid: if c.running { 1000 } else { 0 },
                running: c.running,
            },
            config: ContainerConfig {
                env: Some(c.spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect()),
            },
            network_settings: NetworkSettings::default(),
        }))
    }

    async fn list_chute_containers(&self) -> Result<Vec<String>> {
        let inner = self.enter("list", "*")?;
        Ok(inner
            .containers
            .values()
            .filter(|c| c.spec.labels.contains_key(CHUTE_LABEL))
            .map(|c| c.spec.name.clone())
            .collect())
    }
}
