use std::sync::Arc;

use arbor_core::{AgentEngine, EngineConfig};
use arbor_providers::ProviderRegistry;
use arbor_runtime::TerminalManager;
use arbor_workspace::Workspace;

mod http;

pub use http::{app_router, serve};

/// Everything the HTTP handlers need, cheap to clone per request.
#[derive(Clone)]
pub struct AppState {
    pub engine: AgentEngine,
    pub providers: ProviderRegistry,
    pub workspace: Workspace,
    pub terminals: TerminalManager,
}

impl AppState {
    pub fn new(config: EngineConfig) -> anyhow::Result<Self> {
        let workspace = Workspace::new(config.workspace_root.clone())?;
        let providers = ProviderRegistry::from_env(Some(config.logs_dir.clone()));
        let engine = AgentEngine::new(Arc::new(providers.clone()), workspace.clone(), config);
        let terminals = TerminalManager::new(workspace.clone());
        Ok(Self {
            engine,
            providers,
            workspace,
            terminals,
        })
    }
}
