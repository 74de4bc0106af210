//! Scripted configuration daemon for tests.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::*;

#[derive(Default)]
struct Inner {
    calls: Vec<String>,
    statuses: Vec<SectionStatus>,
    failing: HashSet<String>,
}

#[derive(Clone, Default)]
pub struct MockConfd {
    inner: Arc<Mutex<Inner>>,
}

impl MockConfd {
    pub fn new() -> Self {
        Self::default()
    }

    /// Statuses every later reload answers with.
    pub fn set_statuses(&self, statuses: Vec<SectionStatus>) {
        self.inner.lock().statuses = statuses;
    }

    /// Make `op` (`reload`, `reload_all`, `unload_all`, `wait_system_up`) fail.
    pub fn fail_on(&self, op: &str) {
        self.inner.lock().failing.insert(op.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().calls.clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.inner
            .lock()
            .calls
            .iter()
            .filter(|c| c.split_whitespace().next() == Some(op))
            .count()
    }

    fn record(&self, op: &str, arg: Option<&str>) -> Result<Vec<SectionStatus>> {
        let mut inner = self.inner.lock();
        inner.calls.push(match arg {
            Some(arg) => format!("{op} {arg}"),
            None => op.to_string(),
        });
        if inner.failing.contains(op) {
            return Err(ConfdError::Remote(format!("injected failure: {op}")));
        }
        Ok(inner.statuses.clone())
    }
}

#[async_trait]
impl ConfdClient for MockConfd {
    async fn reload(&self, name: &str) -> Result<Vec<SectionStatus>> {
        self.record("reload", Some(name))
    }

    async fn reload_all(&self) -> Result<Vec<SectionStatus>> {
        self.record("reload_all", None)
    }

    async fn unload_all(&self) -> Result<()> {
        self.record("unload_all", None).map(|_| ())
    }

    async fn wait_system_up(&self) -> Result<()> {
        self.record("wait_system_up", None).map(|_| ())
    }
}
