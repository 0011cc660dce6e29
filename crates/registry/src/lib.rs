//! Kedge registry – module lifecycle.
//!
//! Modules register as `(name, group, start, stop)`. [`Registry::start`] spawns
//! every module's `start` on its own task in registration order; a supervisor
//! per module logs failures and panics without touching the other modules.
//! [`Running::shutdown`] cancels the root token, calls `stop` in reverse order
//! and waits a bounded grace period for each task.

#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use thiserror::Error;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub const DEFAULT_GRACE: Duration = Duration::from_secs(10);

/// A long-running unit of the process.
#[async_trait::async_trait]
pub trait Module: Send + Sync + 'static {
    fn name(&self) -> &str;
    fn group(&self) -> &str;

    /// Run until `cancel` fires. Returning early is logged but does not stop siblings.
    async fn start(&self, cancel: CancellationToken) -> anyhow::Result<()>;

    /// Release resources. May be called more than once.
    async fn stop(&self) {}
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("module {0} is already registered")]
    Duplicate(String),
}

/// How a module task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleExit {
    Completed,
    Failed(String),
    Panicked,
    /// Did not finish within the grace period and was aborted.
    TimedOut,
}

pub struct Registry {
    modules: Vec<Arc<dyn Module>>,
    names: HashSet<String>,
    root: CancellationToken,
    grace: Duration,
}

impl Registry {
    pub fn new(root: CancellationToken) -> Self {
        Self { modules: Vec::new(), names: HashSet::new(), root, grace: DEFAULT_GRACE }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn register(&mut self, module: Arc<dyn Module>) -> Result<(), RegistryError> {
        let name = module.name().to_string();
        if !self.names.insert(name.clone()) {
            return Err(RegistryError::Duplicate(name));
        }
        info!(module = %name, group = %module.group(), "module registered");
        self.modules.push(module);
        Ok(())
    }

    pub fn names(&self) -> Vec<String> {
        self.modules.iter().map(|m| m.name().to_string()).collect()
    }

    pub fn start(self) -> Running {
        let mut entries = Vec::with_capacity(self.modules.len());
        for module in self.modules {
            let name = module.name().to_string();
            let token = self.root.child_token();
            let task_module = Arc::clone(&module);
            let inner = tokio::spawn(async move { task_module.start(token).await });
            let abort = inner.abort_handle();
            let supervisor = tokio::spawn(supervise(name.clone(), inner));
            info!(module = %name, "module started");
            entries.push(Entry { name, module, abort, supervisor });
        }
        Running { entries, root: self.root, grace: self.grace }
    }
}

struct Entry {
    name: String,
    module: Arc<dyn Module>,
    abort: AbortHandle,
    supervisor: JoinHandle<ModuleExit>,
}

async fn supervise(name: String, inner: JoinHandle<anyhow::Result<()>>) -> ModuleExit {
    match inner.await {
        Ok(Ok(())) => {
            info!(module = %name, "module exited");
            ModuleExit::Completed
        }
        Ok(Err(e)) => {
            error!(module = %name, error = ?e, "module failed");
            counter!("module_failures_total", 1u64, "module" => name.clone());
            ModuleExit::Failed(e.to_string())
        }
        Err(e) if e.is_panic() => {
            error!(module = %name, "module panicked; other modules keep running");
            counter!("module_failures_total", 1u64, "module" => name.clone());
            ModuleExit::Panicked
        }
        Err(_) => ModuleExit::TimedOut,
    }
}

/// Handle to the started modules.
pub struct Running {
    entries: Vec<Entry>,
    root: CancellationToken,
    grace: Duration,
}

impl Running {
    pub fn root(&self) -> &CancellationToken {
        &self.root
    }

    /// Names of modules whose task has already ended.
    pub fn finished(&self) -> Vec<String> {
        self.entries.iter().filter(|e| e.supervisor.is_finished()).map(|e| e.name.clone()).collect()
    }

    /// Cancel the root token, stop modules in reverse order and collect how each ended.
    pub async fn shutdown(self) -> Vec<(String, ModuleExit)> {
        self.root.cancel();
        let mut report = Vec::with_capacity(self.entries.len());
        for entry in self.entries.into_iter().rev() {
            entry.module.stop().await;
            let exit = match tokio::time::timeout(self.grace, entry.supervisor).await {
                Ok(Ok(exit)) => exit,
                Ok(Err(_)) => ModuleExit::Panicked,
                Err(_) => {
                    warn!(module = %entry.name, grace_ms = self.grace.as_millis() as u64, "module did not stop in time; aborting");
                    entry.abort.abort();
                    ModuleExit::TimedOut
                }
            };
            info!(module = %entry.name, exit = ?exit, "module stopped");
            report.push((entry.name, exit));
        }
        report
    }
}
