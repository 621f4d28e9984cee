use std::{
    collections::BTreeMap,
    fmt,
    net::IpAddr,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use utils::file_system::{fs_repository::FileRepository, workspace_manager::WorkspaceManager};

use crate::managers::{
    planner::StoragePlacement, resources::ResourceSpec, virtual_disk::DiskFunction,
    virtual_machine::Backend,
};

pub const CONFIG_FILE_NAME: &str = "sandbox-config.yaml";

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ConfigStoreError {
    #[error("Virtual machine '{0}' is already configured.")]
    AlreadyExists(String),
    #[error("Virtual machine '{0}' is not configured.")]
    NoSuchVmConfig(String),
    #[error("Instance of '{vm_name}' started at {started_at} is already recorded.")]
    DuplicateInstance {
        vm_name: String,
        started_at: DateTime<Utc>,
    },
    #[error("No instance of '{vm_name}' started at {started_at}.")]
    NoSuchInstance {
        vm_name: String,
        started_at: DateTime<Utc>,
    },
    #[error("Instance can't go from {from:?} to {to:?}.")]
    InvalidTransition {
        from: InstanceState,
        to: InstanceState,
    },
    #[error("No directory is bound to {0}.")]
    MissingHostDirectory(HostDirectoryFunction),
    #[error("Host directory must be an absolute path: {0:?}")]
    RelativePath(PathBuf),
    #[error("Configuration database error: {0}")]
    Persistence(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HostDirectoryFunction {
    DownloadCache,
    VmOs,
    VmCluster,
    VmData,
    Backup,
}

impl HostDirectoryFunction {
    pub const ALL: [HostDirectoryFunction; 5] = [
        HostDirectoryFunction::DownloadCache,
        HostDirectoryFunction::VmOs,
        HostDirectoryFunction::VmCluster,
        HostDirectoryFunction::VmData,
        HostDirectoryFunction::Backup,
    ];

    pub fn default_subdirectory(&self) -> &'static str {
        match self {
            HostDirectoryFunction::DownloadCache => "download-cache",
            HostDirectoryFunction::VmOs => "vm-os",
            HostDirectoryFunction::VmCluster => "vm-cluster",
            HostDirectoryFunction::VmData => "vm-data",
            HostDirectoryFunction::Backup => "backup",
        }
    }

    pub fn for_disk(function: DiskFunction) -> Self {
        match function {
            DiskFunction::Os => HostDirectoryFunction::VmOs,
            DiskFunction::Cluster => HostDirectoryFunction::VmCluster,
            DiskFunction::Data => HostDirectoryFunction::VmData,
        }
    }

    pub fn disk_function(&self) -> Option<DiskFunction> {
        match self {
            HostDirectoryFunction::VmOs => Some(DiskFunction::Os),
            HostDirectoryFunction::VmCluster => Some(DiskFunction::Cluster),
            HostDirectoryFunction::VmData => Some(DiskFunction::Data),
            HostDirectoryFunction::DownloadCache | HostDirectoryFunction::Backup => None,
        }
    }
}

impl fmt::Display for HostDirectoryFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.default_subdirectory())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostDirectory {
    pub function: HostDirectoryFunction,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMachineConfig {
    pub name: String,
    pub backend: Backend,
    pub spec: ResourceSpec,
    pub disk_paths: BTreeMap<DiskFunction, PathBuf>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    Starting,
    Running,
    Failed,
    Stopped,
    Killed,
}

impl InstanceState {
    pub fn is_active(&self) -> bool {
        matches!(self, InstanceState::Starting | InstanceState::Running)
    }

    pub fn can_transition_to(&self, next: InstanceState) -> bool {
        matches!(
            (self, next),
            (
                InstanceState::Starting,
                InstanceState::Running | InstanceState::Failed
            ) | (
                InstanceState::Running,
                InstanceState::Stopped | InstanceState::Killed
            )
        )
    }
}

/// One run of a virtual machine. Closed instances are never modified again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMachineInstance {
    pub vm_name: String,
    pub started_at: DateTime<Utc>,
    pub granted: ResourceSpec,
    pub adjustments: Vec<String>,
    pub state: InstanceState,
    pub process_id: Option<u32>,
    pub ip_address: Option<IpAddr>,
    pub cluster_credentials: Option<String>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub execution_messages: Vec<String>,
}

impl VirtualMachineInstance {
    pub fn starting(vm_name: &str, granted: ResourceSpec, adjustments: Vec<String>) -> Self {
        Self {
            vm_name: vm_name.to_string(),
            started_at: Utc::now(),
            granted,
            adjustments,
            state: InstanceState::Starting,
            process_id: None,
            ip_address: None,
            cluster_credentials: None,
            stopped_at: None,
            execution_messages: vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelocationOutcome {
    Unchanged,
    Moved {
        from: PathBuf,
        to: PathBuf,
        files_moved: usize,
    },
    /// The old directory stays authoritative. Files that were already moved
    /// stay at the destination and the next attempt merges the rest.
    Interrupted {
        from: PathBuf,
        to: PathBuf,
        files_moved: usize,
        reason: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreTables {
    pub vm_configs: BTreeMap<String, VirtualMachineConfig>,
    pub vm_instances: Vec<VirtualMachineInstance>,
    pub host_directories: BTreeMap<HostDirectoryFunction, PathBuf>,
}

impl StoreTables {
    fn with_default_directories(home_dir: &Path) -> Self {
        let mut tables = StoreTables::default();
        tables.seed_missing_directories(home_dir);
        tables
    }

    fn seed_missing_directories(&mut self, home_dir: &Path) -> bool {
        let mut seeded = false;
        for function in HostDirectoryFunction::ALL {
            if !self.host_directories.contains_key(&function) {
                self.host_directories
                    .insert(function, home_dir.join(function.default_subdirectory()));
                seeded = true;
            }
        }
        seeded
    }

    fn instance_mut(
        &mut self,
        vm_name: &str,
        started_at: &DateTime<Utc>,
    ) -> Result<&mut VirtualMachineInstance, ConfigStoreError> {
        self.vm_instances
            .iter_mut()
            .find(|instance| instance.vm_name == vm_name && &instance.started_at == started_at)
            .ok_or_else(|| ConfigStoreError::NoSuchInstance {
                vm_name: vm_name.to_string(),
                started_at: *started_at,
            })
    }
}

/// The configuration database of one host.
///
/// Every write works on a copy of the tables that is persisted before it
/// replaces the in-memory state, so readers only ever see whole operations.
pub struct ConfigStore {
    tables: Mutex<FileRepository<StoreTables>>,
}

impl ConfigStore {
    pub async fn open(home_dir: &Path) -> Result<Self, ConfigStoreError> {
        tokio::fs::create_dir_all(home_dir)
            .await
            .map_err(|err| ConfigStoreError::Persistence(err.to_string()))?;
        let mut repository = FileRepository::open_or_create(
            || StoreTables::with_default_directories(home_dir),
            &home_dir.join(CONFIG_FILE_NAME),
        )
        .await
        .map_err(|err| ConfigStoreError::Persistence(err.to_string()))?;

        let mut tables = repository.get().clone();
        if tables.seed_missing_directories(home_dir) {
            warn!("Configuration database had unbound host directories, using defaults");
            repository
                .commit(tables)
                .await
                .map_err(|err| ConfigStoreError::Persistence(err.to_string()))?;
        }
        debug!("Opened configuration database {:?}", repository.path());
        Ok(Self {
            tables: Mutex::new(repository),
        })
    }

    async fn read<R>(&self, query: impl FnOnce(&StoreTables) -> R) -> R {
        query(self.tables.lock().await.get())
    }

    async fn transaction<R>(
        &self,
        operation: impl FnOnce(&mut StoreTables) -> Result<R, ConfigStoreError>,
    ) -> Result<R, ConfigStoreError> {
        let mut repository = self.tables.lock().await;
        let mut tables = repository.get().clone();
        let result = operation(&mut tables)?;
        repository
            .commit(tables)
            .await
            .map_err(|err| ConfigStoreError::Persistence(err.to_string()))?;
        Ok(result)
    }

    pub async fn add_vm_config(&self, config: VirtualMachineConfig) -> Result<(), ConfigStoreError> {
        self.transaction(|tables| {
            if tables.vm_configs.contains_key(&config.name) {
                return Err(ConfigStoreError::AlreadyExists(config.name));
            }
            tables.vm_configs.insert(config.name.clone(), config);
            Ok(())
        })
        .await
    }

    pub async fn get_vm_config(&self, name: &str) -> Result<VirtualMachineConfig, ConfigStoreError> {
        self.read(|tables| tables.vm_configs.get(name).cloned())
            .await
            .ok_or_else(|| ConfigStoreError::NoSuchVmConfig(name.to_string()))
    }

    pub async fn list_vm_configs(&self) -> Vec<VirtualMachineConfig> {
        self.read(|tables| tables.vm_configs.values().cloned().collect())
            .await
    }

    pub async fn update_vm_config(
        &self,
        name: &str,
        update: impl FnOnce(&mut VirtualMachineConfig),
    ) -> Result<VirtualMachineConfig, ConfigStoreError> {
        self.transaction(|tables| {
            let config = tables
                .vm_configs
                .get_mut(name)
                .ok_or_else(|| ConfigStoreError::NoSuchVmConfig(name.to_string()))?;
            update(config);
            config.updated_at = Utc::now();
            Ok(config.clone())
        })
        .await
    }

    /// Removes the configuration together with its whole instance history and
    /// returns how many instances were dropped.
    pub async fn delete_vm_config(&self, name: &str) -> Result<usize, ConfigStoreError> {
        self.transaction(|tables| {
            tables
                .vm_configs
                .remove(name)
                .ok_or_else(|| ConfigStoreError::NoSuchVmConfig(name.to_string()))?;
            let before = tables.vm_instances.len();
            tables.vm_instances.retain(|instance| instance.vm_name != name);
            Ok(before - tables.vm_instances.len())
        })
        .await
    }

    pub async fn add_instance(
        &self,
        instance: VirtualMachineInstance,
    ) -> Result<(), ConfigStoreError> {
        self.transaction(|tables| {
            if !tables.vm_configs.contains_key(&instance.vm_name) {
                return Err(ConfigStoreError::NoSuchVmConfig(instance.vm_name));
            }
            if tables.vm_instances.iter().any(|recorded| {
                recorded.vm_name == instance.vm_name && recorded.started_at == instance.started_at
            }) {
                return Err(ConfigStoreError::DuplicateInstance {
                    vm_name: instance.vm_name,
                    started_at: instance.started_at,
                });
            }
            tables.vm_instances.push(instance);
            Ok(())
        })
        .await
    }

    /// Moves an instance to `next_state`, applying `update` in the same
    /// transaction. Closing an instance stamps `stopped_at` unless `update` did.
    pub async fn update_instance(
        &self,
        vm_name: &str,
        started_at: &DateTime<Utc>,
        next_state: InstanceState,
        update: impl FnOnce(&mut VirtualMachineInstance),
    ) -> Result<VirtualMachineInstance, ConfigStoreError> {
        self.transaction(|tables| {
            let instance = tables.instance_mut(vm_name, started_at)?;
            if !instance.state.can_transition_to(next_state) {
                return Err(ConfigStoreError::InvalidTransition {
                    from: instance.state,
                    to: next_state,
                });
            }
            update(instance);
            instance.state = next_state;
            if !next_state.is_active() && instance.stopped_at.is_none() {
                instance.stopped_at = Some(Utc::now());
            }
            Ok(instance.clone())
        })
        .await
    }

    pub async fn last_instance(&self, vm_name: &str) -> Option<VirtualMachineInstance> {
        self.read(|tables| {
            tables
                .vm_instances
                .iter()
                .filter(|instance| instance.vm_name == vm_name)
                .max_by_key(|instance| instance.started_at)
                .cloned()
        })
        .await
    }

    pub async fn list_instances(&self, vm_name: &str) -> Vec<VirtualMachineInstance> {
        let mut instances: Vec<_> = self
            .read(|tables| {
                tables
                    .vm_instances
                    .iter()
                    .filter(|instance| instance.vm_name == vm_name)
                    .cloned()
                    .collect()
            })
            .await;
        instances.sort_by_key(|instance| instance.started_at);
        instances
    }

    pub async fn active_instances(&self) -> Vec<VirtualMachineInstance> {
        self.read(|tables| {
            tables
                .vm_instances
                .iter()
                .filter(|instance| instance.state.is_active())
                .cloned()
                .collect()
        })
        .await
    }

    /// Resources held by every starting or running instance except those of `excluding`.
    pub async fn committed_resources(&self, excluding: Option<&str>) -> Vec<ResourceSpec> {
        self.active_instances()
            .await
            .into_iter()
            .filter(|instance| Some(instance.vm_name.as_str()) != excluding)
            .map(|instance| instance.granted)
            .collect()
    }

    pub async fn host_directory(
        &self,
        function: HostDirectoryFunction,
    ) -> Result<PathBuf, ConfigStoreError> {
        self.read(|tables| tables.host_directories.get(&function).cloned())
            .await
            .ok_or(ConfigStoreError::MissingHostDirectory(function))
    }

    pub async fn host_directories(&self) -> Vec<HostDirectory> {
        self.read(|tables| {
            tables
                .host_directories
                .iter()
                .map(|(function, path)| HostDirectory {
                    function: *function,
                    path: path.clone(),
                })
                .collect()
        })
        .await
    }

    /// Rebinds a function to a directory without moving anything.
    pub async fn set_host_directory(
        &self,
        function: HostDirectoryFunction,
        path: &Path,
    ) -> Result<(), ConfigStoreError> {
        if !path.is_absolute() {
            return Err(ConfigStoreError::RelativePath(path.to_path_buf()));
        }
        self.transaction(|tables| {
            tables.host_directories.insert(function, path.to_path_buf());
            Ok(())
        })
        .await
    }

    pub async fn storage_placement(&self) -> Result<StoragePlacement, ConfigStoreError> {
        Ok(StoragePlacement {
            os_dir: self.host_directory(HostDirectoryFunction::VmOs).await?,
            cluster_dir: self.host_directory(HostDirectoryFunction::VmCluster).await?,
            data_dir: self.host_directory(HostDirectoryFunction::VmData).await?,
        })
    }

    /// Moves the directory bound to `function` into `new_path` and rebinds it.
    ///
    /// The binding and every disk path derived from it change only once all
    /// files arrived. The tables stay locked for the whole move.
    pub async fn move_storage_location(
        &self,
        function: HostDirectoryFunction,
        new_path: &Path,
    ) -> Result<RelocationOutcome, ConfigStoreError> {
        if !new_path.is_absolute() {
            return Err(ConfigStoreError::RelativePath(new_path.to_path_buf()));
        }
        let mut repository = self.tables.lock().await;
        let old_path = repository
            .get()
            .host_directories
            .get(&function)
            .cloned()
            .ok_or(ConfigStoreError::MissingHostDirectory(function))?;
        if old_path == new_path {
            return Ok(RelocationOutcome::Unchanged);
        }

        let interrupted = |files_moved: usize, reason: String| {
            warn!(
                "Moving {} from {:?} to {:?} interrupted: {}",
                function, old_path, new_path, reason
            );
            RelocationOutcome::Interrupted {
                from: old_path.clone(),
                to: new_path.to_path_buf(),
                files_moved,
                reason,
            }
        };
        let workspace = match WorkspaceManager::new(old_path.clone()).await {
            Ok(workspace) => workspace,
            Err(err) => return Ok(interrupted(0, err.to_string())),
        };
        let summary = match workspace.move_contents_to(new_path).await {
            Ok(summary) => summary,
            Err(err) => return Ok(interrupted(err.moved.files_moved, err.to_string())),
        };

        let mut tables = repository.get().clone();
        tables
            .host_directories
            .insert(function, new_path.to_path_buf());
        if let Some(disk_function) = function.disk_function() {
            let now = Utc::now();
            for config in tables.vm_configs.values_mut() {
                if let Some(disk_path) = config.disk_paths.get_mut(&disk_function) {
                    if let Ok(relative) = disk_path.strip_prefix(&old_path) {
                        *disk_path = new_path.join(relative);
                        config.updated_at = now;
                    }
                }
            }
        }
        repository
            .commit(tables)
            .await
            .map_err(|err| ConfigStoreError::Persistence(err.to_string()))?;
        info!(
            "Moved {} from {:?} to {:?} ({} files)",
            function, old_path, new_path, summary.files_moved
        );
        Ok(RelocationOutcome::Moved {
            from: old_path,
            to: new_path.to_path_buf(),
            files_moved: summary.files_moved,
        })
    }
}
