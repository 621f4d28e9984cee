use std::{path::PathBuf, sync::Arc, time::Duration};

use crate::managers::{
    sandbox::{SandboxError, VirtualMachineCreator},
    virtual_disk::{DiskLayout, DiskProvider},
    virtual_machine::{Backend, State, VirtualMachine, VmDisks},
    vm_manager::VirtualMachineManager,
    vm_runtime::VmRuntime,
};
use crate::virtualization::{
    command::CommandRunner,
    qemu_disk::QemuDiskProvider,
    qemu_runner::QemuRuntime,
    wsl_disk::{WslCli, WslDiskProvider},
    wsl_runner::WslRuntime,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QemuSettings {
    pub qemu: PathBuf,
    pub qemu_img: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WslSettings {
    pub wsl: PathBuf,
    pub helper_image: PathBuf,
}

/// Builds disks and machines for the backends this host can drive. A backend
/// without settings is reported as unsupported.
pub struct VirtualMachineFabric {
    qemu: Option<QemuSettings>,
    wsl: Option<WslSettings>,
    endpoint_wait_time: Duration,
    shutdown_grace: Duration,
    runner: Arc<dyn CommandRunner>,
}

impl VirtualMachineFabric {
    pub fn new(
        qemu: Option<QemuSettings>,
        wsl: Option<WslSettings>,
        endpoint_wait_time: Duration,
        shutdown_grace: Duration,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        VirtualMachineFabric {
            qemu,
            wsl,
            endpoint_wait_time,
            shutdown_grace,
            runner,
        }
    }

    fn qemu(&self) -> Result<&QemuSettings, SandboxError> {
        self.qemu
            .as_ref()
            .ok_or(SandboxError::UnsupportedBackend(Backend::LocalHypervisor))
    }

    fn wsl(&self) -> Result<WslCli, SandboxError> {
        self.wsl
            .as_ref()
            .map(|settings| WslCli::new(settings.wsl.clone(), self.runner.clone()))
            .ok_or(SandboxError::UnsupportedBackend(Backend::NativeLightweightVm))
    }
}

impl VirtualMachineCreator for VirtualMachineFabric {
    fn disk_provider(
        &self,
        backend: Backend,
        layout: &DiskLayout,
    ) -> Result<Box<dyn DiskProvider + Send + Sync>, SandboxError> {
        match backend {
            Backend::LocalHypervisor => Ok(Box::new(QemuDiskProvider::new(
                self.qemu()?.qemu_img.clone(),
                layout.clone(),
                self.runner.clone(),
            ))),
            Backend::NativeLightweightVm => {
                let cli = self.wsl()?;
                let helper_image = self
                    .wsl
                    .as_ref()
                    .map(|settings| settings.helper_image.clone())
                    .ok_or(SandboxError::UnsupportedBackend(backend))?;
                Ok(Box::new(WslDiskProvider::new(
                    cli,
                    helper_image,
                    layout.clone(),
                )))
            }
            Backend::Cloud => Err(SandboxError::UnsupportedBackend(backend)),
        }
    }

    fn create_vm(
        &self,
        name: &str,
        backend: Backend,
        disks: VmDisks,
        state: State,
    ) -> Result<Box<dyn VirtualMachine + Send + Sync>, SandboxError> {
        let runtime: Box<dyn VmRuntime + Send + Sync> = match backend {
            Backend::LocalHypervisor => Box::new(QemuRuntime::new(
                self.qemu()?.qemu.clone(),
                name.to_string(),
                self.runner.clone(),
                self.shutdown_grace,
            )),
            Backend::NativeLightweightVm => {
                Box::new(WslRuntime::new(self.wsl()?, name, self.shutdown_grace))
            }
            Backend::Cloud => return Err(SandboxError::UnsupportedBackend(backend)),
        };
        Ok(Box::new(VirtualMachineManager::new(
            name.to_string(),
            backend,
            state,
            disks,
            runtime,
            self.endpoint_wait_time,
        )))
    }
}
