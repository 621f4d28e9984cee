use std::{collections::BTreeMap, path::Path};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{
    planner::{Infeasibility, ResourcePlan},
    resources::ResourceSpec,
    virtual_disk::{DiskFunction, DiskLayout, DiskProvider},
    virtual_machine::{Backend, State, VirtualMachine, VirtualMachineData, VmDisks},
};
use crate::storage::{
    config_store::{
        HostDirectory, HostDirectoryFunction, RelocationOutcome, VirtualMachineConfig,
        VirtualMachineInstance,
    },
    download_cache::ArtifactRequest,
};
use crate::ui::ProvisioningUi;

#[derive(Error, Debug, PartialEq, Eq, Clone)]
pub enum SandboxError {
    #[error("Virtual machine '{0}' doesn't exist.")]
    NoSuchVm(String),
    #[error("Virtual machine '{0}' already exists.")]
    AlreadyExists(String),
    #[error("Invalid virtual machine name '{0}': use letters, digits and '-' only.")]
    InvalidName(String),
    #[error("Operation conflicts with the current state: {0}")]
    Conflict(String),
    #[error("Not enough host resources: {0}")]
    Infeasible(Infeasibility),
    #[error("Resource planning failed: {0}")]
    Planning(String),
    #[error("Can't read host capabilities: {0}")]
    Host(String),
    #[error("Configuration store error: {0}")]
    Storage(String),
    #[error("Can't stage artifact: {0}")]
    Download(String),
    #[error("Disk operation failed: {0}")]
    Disk(String),
    #[error("Virtual machine operation failed: {0}")]
    VirtualMachine(String),
    #[error("Backend '{0}' is not supported on this host.")]
    UnsupportedBackend(Backend),
    #[error("Cancelled: {0}")]
    Cancelled(String),
    #[error("User interaction failed: {0}")]
    Ui(String),
}

/// Everything needed to bring a new machine into existence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmProvisioningRequest {
    pub name: String,
    pub backend: Backend,
    pub spec: ResourceSpec,
    /// Becomes the OS disk.
    pub os_image: ArtifactRequest,
    /// Staged next to the image, e.g. cluster tooling.
    pub artifacts: Vec<ArtifactRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualMachineDescription {
    pub config: VirtualMachineConfig,
    pub data: VirtualMachineData,
    pub last_instance: Option<VirtualMachineInstance>,
}

impl VirtualMachineDescription {
    pub fn state(&self) -> State {
        self.data.state
    }
}

#[async_trait]
pub trait Sandbox {
    async fn plan_resources(
        &self,
        preferred_gpu_model: Option<&str>,
    ) -> Result<ResourcePlan, SandboxError>;
    async fn create_vm(
        &self,
        request: VmProvisioningRequest,
        ui: &dyn ProvisioningUi,
    ) -> Result<VirtualMachineDescription, SandboxError>;
    /// Starts with the persisted shape unless `override_spec` is given.
    async fn start_vm(
        &self,
        name: &str,
        override_spec: Option<ResourceSpec>,
        ui: &dyn ProvisioningUi,
    ) -> Result<VirtualMachineInstance, SandboxError>;
    async fn stop_vm(&self, name: &str) -> Result<VirtualMachineInstance, SandboxError>;
    async fn kill_vm(&self, name: &str) -> Result<VirtualMachineInstance, SandboxError>;
    async fn resize_vm(
        &self,
        name: &str,
        disk_sizes_gb: BTreeMap<DiskFunction, u32>,
    ) -> Result<VirtualMachineConfig, SandboxError>;
    /// Returns how many history records went away with the machine.
    async fn delete_vm(&self, name: &str, ui: &dyn ProvisioningUi) -> Result<usize, SandboxError>;
    async fn inspect_vm(&self, name: &str) -> Result<VirtualMachineDescription, SandboxError>;
    async fn list_vms(&self) -> Vec<VirtualMachineDescription>;
    async fn vm_history(&self, name: &str) -> Result<Vec<VirtualMachineInstance>, SandboxError>;
    async fn move_storage_location(
        &self,
        function: HostDirectoryFunction,
        new_path: &Path,
        ui: &dyn ProvisioningUi,
    ) -> Result<RelocationOutcome, SandboxError>;
    async fn host_directories(&self) -> Vec<HostDirectory>;
}

/// Picks the driver of a backend and builds machine objects on top of it.
pub trait VirtualMachineCreator {
    fn disk_provider(
        &self,
        backend: Backend,
        layout: &DiskLayout,
    ) -> Result<Box<dyn DiskProvider + Send + Sync>, SandboxError>;
    fn create_vm(
        &self,
        name: &str,
        backend: Backend,
        disks: VmDisks,
        state: State,
    ) -> Result<Box<dyn VirtualMachine + Send + Sync>, SandboxError>;
}
