//! Worker registry - static table of workers populated at startup.
//!
//! # Invariants
//! - Worker ids are unique
//! - `max_concurrency >= 1`
//! - Capability sets never change after registration; only `current_load` moves
//! - `current_load <= max_concurrency` at every instant (enforced by CAS in `try_acquire`)

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{CommandExecutor, WorkerExecutor};
use crate::task::{format_capabilities, Capability, CapabilitySet};

/// An execution unit with a capability set and a concurrency limit.
pub struct Worker {
    id: String,
    capabilities: CapabilitySet,
    max_concurrency: usize,
    current_load: AtomicUsize,
    executor: Arc<dyn WorkerExecutor>,
}

impl Worker {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    pub fn current_load(&self) -> usize {
        self.current_load.load(Ordering::Acquire)
    }

    pub fn has_capacity(&self) -> bool {
        self.current_load() < self.max_concurrency
    }

    /// `true` if this worker's capabilities are a superset of `required`.
    pub fn can_handle(&self, required: &CapabilitySet) -> bool {
        required.is_subset(&self.capabilities)
    }

    pub fn executor(&self) -> Arc<dyn WorkerExecutor> {
        Arc::clone(&self.executor)
    }

    /// Compare-and-increment the load.
    ///
    /// # Postcondition
    /// Returns `true` iff the load was incremented without exceeding `max_concurrency`.
    pub(crate) fn try_acquire(&self) -> bool {
        self.current_load
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |load| {
                (load < self.max_concurrency).then_some(load + 1)
            })
            .is_ok()
    }

    /// Decrement the load, never below zero.
    pub(crate) fn release(&self) {
        let _ = self
            .current_load
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |load| {
                load.checked_sub(1)
            });
    }

    pub fn info(&self) -> WorkerInfo {
        WorkerInfo {
            id: self.id.clone(),
            capabilities: self.capabilities.clone(),
            max_concurrency: self.max_concurrency,
            current_load: self.current_load(),
            executor: self.executor.describe(),
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("capabilities", &format_capabilities(&self.capabilities))
            .field("max_concurrency", &self.max_concurrency)
            .field("current_load", &self.current_load())
            .finish()
    }
}

/// Serializable snapshot of a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: String,
    pub capabilities: CapabilitySet,
    pub max_concurrency: usize,
    pub current_load: usize,
    pub executor: String,
}

/// One worker entry in the registry file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub id: String,
    pub capabilities: Vec<String>,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Shell command that executes a task
    pub command: Option<String>,
}

fn default_max_concurrency() -> usize {
    1
}

/// Top-level layout of the registry YAML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkersFile {
    #[serde(default)]
    pub workers: Vec<WorkerSpec>,
}

/// Static worker table. Insertion order is the dispatch tie-break order.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: Vec<Arc<Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker.
    ///
    /// # Errors
    /// `DuplicateWorker` if the id is taken, `ZeroConcurrency` if `max_concurrency == 0`.
    pub fn register(
        &mut self,
        id: impl Into<String>,
        capabilities: CapabilitySet,
        max_concurrency: usize,
        executor: Arc<dyn WorkerExecutor>,
    ) -> Result<(), RegistryError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(RegistryError::EmptyId);
        }
        if self.workers.iter().any(|w| w.id == id) {
            return Err(RegistryError::DuplicateWorker(id));
        }
        if max_concurrency == 0 {
            return Err(RegistryError::ZeroConcurrency(id));
        }
        self.workers.push(Arc::new(Worker {
            id,
            capabilities,
            max_concurrency,
            current_load: AtomicUsize::new(0),
            executor,
        }));
        Ok(())
    }

    /// Build a registry from file specs. Every spec must carry a command.
    pub fn from_specs(specs: &[WorkerSpec], working_dir: &Path) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        let mut seen = HashSet::new();
        for spec in specs {
            if !seen.insert(spec.id.clone()) {
                return Err(RegistryError::DuplicateWorker(spec.id.clone()));
            }
            let capabilities = spec
                .capabilities
                .iter()
                .map(|raw| {
                    raw.parse::<Capability>()
                        .map_err(|_| RegistryError::UnknownCapability {
                            worker: spec.id.clone(),
                            capability: raw.clone(),
                        })
                })
                .collect::<Result<CapabilitySet, _>>()?;
            let command = spec
                .command
                .clone()
                .filter(|c| !c.trim().is_empty())
                .ok_or_else(|| RegistryError::MissingCommand(spec.id.clone()))?;
            let executor = Arc::new(CommandExecutor::new(command, PathBuf::from(working_dir)));
            registry.register(spec.id.clone(), capabilities, spec.max_concurrency, executor)?;
        }
        Ok(registry)
    }

    /// Parse registry YAML.
    pub fn from_yaml(yaml: &str, working_dir: &Path) -> Result<Self, RegistryError> {
        let file: WorkersFile =
            serde_yaml::from_str(yaml).map_err(|e| RegistryError::Parse(e.to_string()))?;
        Self::from_specs(&file.workers, working_dir)
    }

    /// Load the registry file at `path`.
    pub async fn load_file(path: &Path, working_dir: &Path) -> Result<Self, RegistryError> {
        let yaml = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| RegistryError::Io(format!("{}: {}", path.display(), e)))?;
        let registry = Self::from_yaml(&yaml, working_dir)?;
        tracing::info!(
            "Loaded {} workers from {}",
            registry.len(),
            path.display()
        );
        Ok(registry)
    }

    /// All workers declaring `capability`, in insertion order.
    pub fn find_workers(&self, capability: Capability) -> Vec<Arc<Worker>> {
        self.workers
            .iter()
            .filter(|w| w.capabilities.contains(&capability))
            .cloned()
            .collect()
    }

    /// Workers whose capability set covers `required`, in insertion order.
    pub fn capable_of(&self, required: &CapabilitySet) -> Vec<Arc<Worker>> {
        self.workers
            .iter()
            .filter(|w| w.can_handle(required))
            .cloned()
            .collect()
    }

    pub fn has_capable(&self, required: &CapabilitySet) -> bool {
        self.workers.iter().any(|w| w.can_handle(required))
    }

    pub fn get(&self, id: &str) -> Option<Arc<Worker>> {
        self.workers.iter().find(|w| w.id == id).cloned()
    }

    pub fn workers(&self) -> &[Arc<Worker>] {
        &self.workers
    }

    pub fn infos(&self) -> Vec<WorkerInfo> {
        self.workers.iter().map(|w| w.info()).collect()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

/// Errors raised while building the registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Worker id cannot be empty")]
    EmptyId,

    #[error("Duplicate worker id '{0}'")]
    DuplicateWorker(String),

    #[error("Worker '{0}' must allow at least one concurrent task")]
    ZeroConcurrency(String),

    #[error("Worker '{worker}' declares unknown capability '{capability}'")]
    UnknownCapability { worker: String, capability: String },

    #[error("Worker '{0}' has no command configured")]
    MissingCommand(String),

    #[error("Failed to parse worker registry: {0}")]
    Parse(String),

    #[error("Failed to read worker registry: {0}")]
    Io(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::{FnExecutor, TaskInput, WorkerContext, WorkerOutput};

    fn noop() -> Arc<dyn WorkerExecutor> {
        Arc::new(FnExecutor::new(|_: TaskInput, _: WorkerContext| async {
            Ok(WorkerOutput::new("ok"))
        }))
    }

    fn caps(list: &[Capability]) -> CapabilitySet {
        list.iter().copied().collect()
    }

    #[test]
    fn test_find_workers_by_capability() {
        let mut registry = WorkerRegistry::new();
        registry
            .register("coder", caps(&[Capability::Implement, Capability::Test]), 2, noop())
            .unwrap();
        registry
            .register("scribe", caps(&[Capability::Document]), 1, noop())
            .unwrap();

        let testers = registry.find_workers(Capability::Test);
        assert_eq!(testers.len(), 1);
        assert_eq!(testers[0].id(), "coder");
        assert!(registry.find_workers(Capability::Research).is_empty());
    }

    #[test]
    fn test_capable_of_requires_superset() {
        let mut registry = WorkerRegistry::new();
        registry
            .register("coder", caps(&[Capability::Implement]), 1, noop())
            .unwrap();
        assert!(registry.has_capable(&caps(&[Capability::Implement])));
        assert!(!registry.has_capable(&caps(&[Capability::Implement, Capability::Test])));
        assert!(registry.has_capable(&CapabilitySet::new()));
    }

    #[test]
    fn test_register_rejects_duplicates_and_zero_capacity() {
        let mut registry = WorkerRegistry::new();
        registry.register("a", CapabilitySet::new(), 1, noop()).unwrap();
        assert_eq!(
            registry.register("a", CapabilitySet::new(), 1, noop()),
            Err(RegistryError::DuplicateWorker("a".to_string()))
        );
        assert_eq!(
            registry.register("b", CapabilitySet::new(), 0, noop()),
            Err(RegistryError::ZeroConcurrency("b".to_string()))
        );
    }

    #[test]
    fn test_acquire_never_exceeds_capacity() {
        let mut registry = WorkerRegistry::new();
        registry.register("a", CapabilitySet::new(), 2, noop()).unwrap();
        let worker = registry.get("a").unwrap();
        assert!(worker.try_acquire());
        assert!(worker.has_capacity());
        assert!(worker.try_acquire());
        assert!(!worker.has_capacity());
        assert!(!worker.try_acquire());
        assert_eq!(worker.current_load(), 2);
        worker.release();
        worker.release();
        worker.release();
        assert_eq!(worker.current_load(), 0);
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
workers:
  - id: coder
    capabilities: [implement, Test]
    max_concurrency: 2
    command: "cat"
  - id: scribe
    capabilities: [document]
    command: "cat"
"#;
        let registry = WorkerRegistry::from_yaml(yaml, Path::new(".")).unwrap();
        assert_eq!(registry.len(), 2);
        let coder = registry.get("coder").unwrap();
        assert_eq!(coder.max_concurrency(), 2);
        assert_eq!(coder.capabilities(), &caps(&[Capability::Implement, Capability::Test]));
        assert_eq!(registry.get("scribe").unwrap().max_concurrency(), 1);
    }

    #[test]
    fn test_from_yaml_rejects_unknown_capability() {
        let yaml = "workers:\n  - id: x\n    capabilities: [juggle]\n    command: cat\n";
        let err = WorkerRegistry::from_yaml(yaml, Path::new(".")).unwrap_err();
        assert_eq!(
            err,
            RegistryError::UnknownCapability {
                worker: "x".to_string(),
                capability: "juggle".to_string()
            }
        );
    }

    #[test]
    fn test_from_yaml_requires_command() {
        let yaml = "workers:\n  - id: x\n    capabilities: [test]\n";
        assert_eq!(
            WorkerRegistry::from_yaml(yaml, Path::new(".")).unwrap_err(),
            RegistryError::MissingCommand("x".to_string())
        );
    }
}
