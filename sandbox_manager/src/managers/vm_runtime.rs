use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::{resources::ResourceSpec, virtual_disk::DiskDescriptor, virtual_machine::VmEndpoint};

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum VmRuntimeError {
    #[error("Unable to launch Vm: {0}")]
    Launch(String),
    #[error("To stop the vm you need to launch it first.")]
    VmNotLaunched,
    #[error("Vm already has been launched.")]
    VmAlreadyLaunched,
    #[error("Vm didn't report its endpoint within {0} seconds.")]
    EndpointTimeout(u64),
    #[error("Vm exited before becoming ready: {0}")]
    ExitedEarly(String),
    #[error("Unable to get vm's exit code: {0}")]
    GetExitCode(String),
    #[error("Unable to shutdown vm: {0}")]
    Shutdown(String),
    #[error("Host port {0} is privileged, choose forwarded ports above 1023 or run as root.")]
    PrivilegedPort(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmStatus {
    NotLaunched,
    Launched,
    Exited(String),
}

/// Drives the process of one virtual machine on its backend.
#[async_trait]
pub trait VmRuntime {
    /// Returns the host process id of the launched machine when there is one.
    async fn launch_vm(
        &mut self,
        spec: &ResourceSpec,
        disks: &[DiskDescriptor],
    ) -> Result<Option<u32>, VmRuntimeError>;
    async fn wait_for_endpoint(&mut self, timeout: Duration) -> Result<VmEndpoint, VmRuntimeError>;
    async fn read_cluster_credentials(&mut self) -> Result<Option<String>, VmRuntimeError>;
    async fn shutdown(&mut self) -> Result<(), VmRuntimeError>;
    async fn kill(&mut self) -> Result<(), VmRuntimeError>;
    fn get_status(&mut self) -> Result<VmStatus, VmRuntimeError>;
}
