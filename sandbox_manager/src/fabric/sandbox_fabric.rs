use std::{path::Path, sync::Arc};

use crate::host::HostProbe;
use crate::managers::{
    planner::ResourcePlanner,
    sandbox::{Sandbox, SandboxError, VirtualMachineCreator},
    sandbox_manager::SandboxManager,
};
use crate::storage::{config_store::ConfigStore, download_cache::ArtifactFetcher};

pub struct SandboxFabric;

impl SandboxFabric {
    /// Opens the configuration kept under `home_dir` and rebuilds the sandbox from it.
    pub async fn create_sandbox(
        home_dir: &Path,
        vm_creator: Box<dyn VirtualMachineCreator + Send + Sync>,
        host_probe: Box<dyn HostProbe>,
        fetcher: Arc<dyn ArtifactFetcher>,
    ) -> Result<Box<dyn Sandbox + Send + Sync>, SandboxError> {
        let store = ConfigStore::open(home_dir)
            .await
            .map_err(|err| SandboxError::Storage(err.to_string()))?;
        let sandbox = SandboxManager::load(
            Arc::new(store),
            ResourcePlanner::default(),
            host_probe,
            vm_creator,
            fetcher,
        )
        .await?;
        Ok(Box::new(sandbox))
    }
}
