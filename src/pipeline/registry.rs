//! In-memory catalog of analysis modules
//!
//! Registration happens once at startup; afterwards only the enable/disable
//! kill-switch primitives mutate the catalog. Iteration order is the
//! registration order, so evidence ordering in results stays reproducible.

use crate::error::{Result, TraceryError};
use crate::pipeline::module::{AnalysisModule, ModuleDescriptor};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::info;

struct Registered {
    module: Arc<dyn AnalysisModule>,
    enabled: bool,
}

#[derive(Default)]
struct RegistryInner {
    modules: Vec<Registered>,
    index: HashMap<String, usize>,
}

/// Module registry with deterministic iteration order
#[derive(Default)]
pub struct ModuleRegistry {
    inner: RwLock<RegistryInner>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module; fails with `DuplicateModule` if the name exists
    pub fn register(&self, module: Arc<dyn AnalysisModule>) -> Result<()> {
        let mut inner = self.inner.write().expect("registry lock poisoned");

        let name = module.name().to_string();
        if inner.index.contains_key(&name) {
            return Err(TraceryError::DuplicateModule(name));
        }

        let position = inner.modules.len();
        info!(module = %name, version = %module.version(), "module registered");
        inner.modules.push(Registered {
            module,
            enabled: true,
        });
        inner.index.insert(name, position);
        Ok(())
    }

    /// Snapshot of the enabled modules, in registration order. The runner
    /// takes this once per batch, so a kill-switch flip never affects the
    /// in-flight batch.
    pub fn snapshot_enabled(&self) -> Vec<Arc<dyn AnalysisModule>> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .modules
            .iter()
            .filter(|r| r.enabled)
            .map(|r| r.module.clone())
            .collect()
    }

    /// Descriptors for every registered module, in registration order
    pub fn descriptors(&self) -> Vec<ModuleDescriptor> {
        let inner = self.inner.read().expect("registry lock poisoned");
        inner
            .modules
            .iter()
            .map(|r| ModuleDescriptor {
                name: r.module.name().to_string(),
                version: r.module.version().to_string(),
                input_kinds: r.module.input_kinds().iter().map(|s| s.to_string()).collect(),
                enabled: r.enabled,
            })
            .collect()
    }

    /// Disable a module (idempotent). Returns false for unknown names.
    pub fn disable(&self, name: &str) -> bool {
        self.set_enabled(name, false)
    }

    /// Enable a module (idempotent). Returns false for unknown names.
    pub fn enable(&self, name: &str) -> bool {
        self.set_enabled(name, true)
    }

    fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut inner = self.inner.write().expect("registry lock poisoned");
        match inner.index.get(name).copied() {
            Some(position) => {
                if inner.modules[position].enabled != enabled {
                    info!(module = %name, enabled, "module toggled");
                }
                inner.modules[position].enabled = enabled;
                true
            }
            None => false,
        }
    }
}
