//! Service manifest: which worker to run and which tools it serves.
//!
//! ```json
//! {
//!   "name": "sql-tools",
//!   "worker": { "program": "python3", "args": ["worker.py"], "cwd": ".", "env": {} },
//!   "bridge": { "call_timeout_secs": 90, "max_pending": 64, "eager_spawn": false },
//!   "tools": [ { "name": "query", "description": "...", "inputSchema": {} } ]
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use toolbridge::{
    CapabilityRegistry, CommandSpawner, OrchestratorConfig, ToolDescriptor, WorkerCapability,
    WorkerClient,
};

#[derive(Debug, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub name: Option<String>,
    pub worker: WorkerSection,
    #[serde(default)]
    pub bridge: BridgeSection,
    pub tools: Vec<ToolEntry>,
}

#[derive(Debug, Deserialize)]
pub struct WorkerSection {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Relative paths are resolved against the manifest's directory.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Bridge tuning. Unset values keep the library defaults.
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
pub struct BridgeSection {
    #[serde(default)]
    pub call_timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_pending: Option<usize>,
    #[serde(default)]
    pub eager_spawn: Option<bool>,
    #[serde(default)]
    pub exit_grace_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ToolEntry {
    #[serde(flatten)]
    pub descriptor: ToolDescriptor,
    /// Worker operation to forward to. Defaults to the tool name.
    #[serde(default)]
    pub operation: Option<String>,
}

impl ToolEntry {
    pub fn operation(&self) -> &str {
        self.operation
            .as_deref()
            .unwrap_or(self.descriptor.name.as_str())
    }
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read manifest {}", path.display()))?;
        let mut manifest: Manifest = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse manifest {}", path.display()))?;

        let base = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        if let Some(cwd) = &mut manifest.worker.cwd
            && cwd.is_relative()
        {
            *cwd = base.join(&*cwd);
        }

        Ok(manifest)
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("toolbridge")
    }

    pub fn spawner(&self) -> CommandSpawner {
        let worker = &self.worker;
        let mut spawner = CommandSpawner::new(&worker.program).args(&worker.args);
        if let Some(cwd) = &worker.cwd {
            spawner = spawner.current_dir(cwd);
        }
        for (key, value) in &worker.env {
            spawner = spawner.env(key, value);
        }
        spawner
    }

    /// Register every tool as a forward to the worker behind `client`.
    pub fn registry(&self, client: &WorkerClient) -> Result<CapabilityRegistry> {
        let mut registry = CapabilityRegistry::new();
        for tool in &self.tools {
            let handler = WorkerCapability::new(client.clone(), tool.operation());
            registry
                .register(tool.descriptor.clone(), Arc::new(handler))
                .context("invalid tool in manifest")?;
        }
        Ok(registry)
    }
}

impl BridgeSection {
    /// Values set in `overrides` win.
    pub fn merged(self, overrides: &BridgeSection) -> Self {
        Self {
            call_timeout_secs: overrides.call_timeout_secs.or(self.call_timeout_secs),
            max_pending: overrides.max_pending.or(self.max_pending),
            eager_spawn: overrides.eager_spawn.or(self.eager_spawn),
            exit_grace_secs: overrides.exit_grace_secs.or(self.exit_grace_secs),
        }
    }

    pub fn eager_spawn(&self) -> bool {
        self.eager_spawn.unwrap_or(false)
    }

    pub fn apply(&self, mut config: OrchestratorConfig) -> OrchestratorConfig {
        if let Some(secs) = self.call_timeout_secs {
            config = config.with_call_timeout(Duration::from_secs(secs));
        }
        if let Some(n) = self.max_pending {
            config = config.with_max_pending(n);
        }
        if let Some(secs) = self.exit_grace_secs {
            config = config.with_exit_grace(Duration::from_secs(secs));
        }
        config
    }
}
