use std::{collections::BTreeMap, fmt, net::IpAddr};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{
    resources::ResourceSpec,
    virtual_disk::{DiskDescriptor, DiskFunction, VirtualDisk},
};

#[derive(Debug, Error, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum VirtualMachineError {
    #[error("Unsupported action: {0}")]
    UnsupportedAction(String),
    #[error("Disk operation failed: {0}")]
    DiskOperation(String),
    #[error("Can't launch the virtual machine: {0}")]
    VmLaunchFail(String),
    #[error("Virtual machine failed to start: {0}")]
    VmStartFail(String),
    #[error("Virtual machine can't be stopped: {0}")]
    VmStopFail(String),
    #[error("Virtual machine can't be destroyed: {0}")]
    VmDestroyFail(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Backend {
    LocalHypervisor,
    NativeLightweightVm,
    Cloud,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Backend::LocalHypervisor => "local hypervisor",
            Backend::NativeLightweightVm => "native lightweight vm",
            Backend::Cloud => "cloud",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Serialize, Deserialize)]
pub enum State {
    NotCreated,
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmEndpoint {
    pub ip_address: IpAddr,
    pub ssh_port: u16,
    pub kubernetes_port: u16,
    pub http_ingress_port: u16,
    pub https_ingress_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedVm {
    pub endpoint: VmEndpoint,
    pub process_id: Option<u32>,
    pub cluster_credentials: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMachineData {
    pub name: String,
    pub backend: Backend,
    pub state: State,
    pub granted: Option<ResourceSpec>,
    pub endpoint: Option<VmEndpoint>,
    pub disks: Vec<DiskDescriptor>,
    pub failure: Option<String>,
}

pub type VmDisks = BTreeMap<DiskFunction, Box<dyn VirtualDisk + Send + Sync>>;

#[async_trait]
pub trait VirtualMachine {
    async fn start(&mut self, spec: &ResourceSpec) -> Result<StartedVm, VirtualMachineError>;
    async fn stop(&mut self) -> Result<(), VirtualMachineError>;
    async fn kill(&mut self) -> Result<(), VirtualMachineError>;
    async fn resize_disks(&mut self, spec: &ResourceSpec) -> Result<(), VirtualMachineError>;
    async fn delete(&mut self) -> Result<(), VirtualMachineError>;
    /// Re-reads the backend and returns the state it implies.
    async fn refresh_state(&mut self) -> Result<State, VirtualMachineError>;
    fn get_data(&self) -> VirtualMachineData;
}
