use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use log::{debug, warn};

use super::{command::CommandRunner, vm_process::VmProcess};
use crate::managers::virtual_disk::{
    check_growth, DiskDescriptor, DiskFunction, DiskLayout, DiskProvider, VirtualDisk,
    VirtualDiskError,
};

const SIZE_FILE_NAME: &str = "max-size-gb";
const VHDX_FILE_NAME: &str = "ext4.vhdx";

/// The subset of `wsl.exe` the disks and the runtime need.
#[derive(Clone)]
pub struct WslCli {
    wsl: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl WslCli {
    pub fn new(wsl: PathBuf, runner: Arc<dyn CommandRunner>) -> Self {
        Self { wsl, runner }
    }

    pub async fn run(&self, args: &[&str]) -> Result<String, String> {
        let args: Vec<String> = args.iter().map(|arg| arg.to_string()).collect();
        self.runner
            .run(&self.wsl, &args)
            .await
            .map(|output| output.stdout_text())
            .map_err(|err| err.to_string())
    }

    pub fn spawn(&self, args: &[&str]) -> Result<Box<dyn VmProcess + Send + Sync>, String> {
        let args: Vec<String> = args.iter().map(|arg| arg.to_string()).collect();
        self.runner
            .spawn(&self.wsl, &args)
            .map_err(|err| err.to_string())
    }

    async fn list(&self, running_only: bool) -> Result<Vec<String>, String> {
        let output = if running_only {
            self.run(&["--list", "--running", "--quiet"]).await?
        } else {
            self.run(&["--list", "--quiet"]).await?
        };
        Ok(output
            .lines()
            .map(|line| line.trim().trim_matches('\0').to_string())
            .filter(|line| !line.is_empty())
            .collect())
    }

    pub async fn is_registered(&self, distribution: &str) -> Result<bool, String> {
        Ok(self.list(false).await?.iter().any(|name| name == distribution))
    }

    pub async fn is_running(&self, distribution: &str) -> Result<bool, String> {
        Ok(self.list(true).await?.iter().any(|name| name == distribution))
    }

    pub async fn terminate(&self, distribution: &str) -> Result<(), String> {
        self.run(&["--terminate", distribution]).await.map(|_| ())
    }
}

/// A WSL distribution holding one disk of a machine. Cluster and data
/// distributions have to run for the machine to mount them.
pub struct WslDisk {
    descriptor: DiskDescriptor,
    distribution: String,
    cli: WslCli,
    service: Option<Box<dyn VmProcess + Send + Sync>>,
}

impl WslDisk {
    async fn write_size(dir: &Path, size_gb: u32) -> Result<(), VirtualDiskError> {
        tokio::fs::write(dir.join(SIZE_FILE_NAME), size_gb.to_string())
            .await
            .map_err(|err| VirtualDiskError::Backend(err.to_string()))
    }
}

#[async_trait]
impl VirtualDisk for WslDisk {
    fn descriptor(&self) -> &DiskDescriptor {
        &self.descriptor
    }

    async fn resize(&mut self, new_size_gb: u32) -> Result<(), VirtualDiskError> {
        if !check_growth(self.descriptor.max_size_gb, new_size_gb)? {
            return Ok(());
        }
        let size = format!("{}GB", new_size_gb);
        self.cli
            .run(&["--manage", &self.distribution, "--resize", &size])
            .await
            .map_err(VirtualDiskError::Backend)?;
        Self::write_size(&self.descriptor.storage_path, new_size_gb).await?;
        self.descriptor.max_size_gb = new_size_gb;
        Ok(())
    }

    async fn delete(&mut self) -> Result<(), VirtualDiskError> {
        if self
            .cli
            .is_registered(&self.distribution)
            .await
            .map_err(VirtualDiskError::Backend)?
        {
            self.cli
                .run(&["--unregister", &self.distribution])
                .await
                .map_err(VirtualDiskError::Backend)?;
        }
        match tokio::fs::remove_dir_all(&self.descriptor.storage_path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(VirtualDiskError::Backend(err.to_string())),
        }
    }

    fn is_service_required(&self) -> bool {
        self.descriptor.function != DiskFunction::Os
    }

    async fn is_service_running(&self) -> Result<bool, VirtualDiskError> {
        self.cli
            .is_running(&self.distribution)
            .await
            .map_err(VirtualDiskError::Service)
    }

    async fn start_service(&mut self) -> Result<(), VirtualDiskError> {
        let service = self
            .cli
            .spawn(&["-d", &self.distribution, "--exec", "sleep", "infinity"])
            .map_err(VirtualDiskError::Service)?;
        debug!("Started distribution {}", self.distribution);
        self.service = Some(service);
        Ok(())
    }

    async fn stop_service(&mut self) -> Result<(), VirtualDiskError> {
        self.cli
            .terminate(&self.distribution)
            .await
            .map_err(VirtualDiskError::Service)?;
        if let Some(mut service) = self.service.take() {
            if let Err(err) = service.kill().await {
                warn!("Can't stop keep-alive of {}: {}", self.distribution, err);
            }
        }
        Ok(())
    }
}

pub struct WslDiskProvider {
    cli: WslCli,
    helper_image: PathBuf,
    layout: DiskLayout,
}

impl WslDiskProvider {
    /// Blank disks are imported from `helper_image`, a minimal root file system.
    pub fn new(cli: WslCli, helper_image: PathBuf, layout: DiskLayout) -> Self {
        Self {
            cli,
            helper_image,
            layout,
        }
    }

    fn disk(&self, vm_name: &str, function: DiskFunction, size_gb: u32) -> WslDisk {
        let distribution = DiskLayout::disk_name(vm_name, function);
        WslDisk {
            descriptor: DiskDescriptor {
                vm_name: vm_name.to_string(),
                function,
                storage_path: self.layout.dir(function).join(&distribution),
                max_size_gb: size_gb,
                is_ssd: self.layout.is_ssd(function),
            },
            distribution,
            cli: self.cli.clone(),
            service: None,
        }
    }

    async fn import(
        &self,
        vm_name: &str,
        function: DiskFunction,
        image: &Path,
        size_gb: u32,
    ) -> Result<Box<dyn VirtualDisk + Send + Sync>, VirtualDiskError> {
        let disk = self.disk(vm_name, function, size_gb);
        if self
            .cli
            .is_registered(&disk.distribution)
            .await
            .map_err(VirtualDiskError::Backend)?
        {
            return Err(VirtualDiskError::AlreadyExists {
                vm_name: vm_name.to_string(),
                function,
            });
        }
        let dir = disk.descriptor.storage_path.clone();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|err| VirtualDiskError::Backend(err.to_string()))?;

        let dir_arg = dir.display().to_string();
        let image_arg = image.display().to_string();
        let size = format!("{}GB", size_gb);
        let imported = async {
            self.cli
                .run(&["--import", &disk.distribution, &dir_arg, &image_arg, "--version", "2"])
                .await?;
            self.cli
                .run(&["--manage", &disk.distribution, "--resize", &size])
                .await?;
            Ok::<(), String>(())
        }
        .await;
        if let Err(err) = imported {
            if let Err(cleanup) = self.cli.run(&["--unregister", &disk.distribution]).await {
                debug!("Nothing to unregister for {}: {}", disk.distribution, cleanup);
            }
            if let Err(cleanup) = tokio::fs::remove_dir_all(&dir).await {
                warn!("Can't remove partial disk {:?}: {}", dir, cleanup);
            }
            return Err(VirtualDiskError::Backend(err));
        }
        WslDisk::write_size(&dir, size_gb).await?;
        Ok(Box::new(disk))
    }
}

#[async_trait]
impl DiskProvider for WslDiskProvider {
    async fn create_blank(
        &self,
        vm_name: &str,
        function: DiskFunction,
        size_gb: u32,
    ) -> Result<Box<dyn VirtualDisk + Send + Sync>, VirtualDiskError> {
        self.import(vm_name, function, &self.helper_image, size_gb)
            .await
    }

    async fn create_from_image(
        &self,
        vm_name: &str,
        image_path: &Path,
        size_gb: u32,
    ) -> Result<Box<dyn VirtualDisk + Send + Sync>, VirtualDiskError> {
        if !tokio::fs::try_exists(image_path)
            .await
            .map_err(|err| VirtualDiskError::Backend(err.to_string()))?
        {
            return Err(VirtualDiskError::ImageNotFound(image_path.to_path_buf()));
        }
        self.import(vm_name, DiskFunction::Os, image_path, size_gb)
            .await
    }

    async fn try_find_by_name(
        &self,
        vm_name: &str,
        function: DiskFunction,
    ) -> Result<Option<Box<dyn VirtualDisk + Send + Sync>>, VirtualDiskError> {
        let distribution = DiskLayout::disk_name(vm_name, function);
        if !self
            .cli
            .is_registered(&distribution)
            .await
            .map_err(VirtualDiskError::Backend)?
        {
            return Ok(None);
        }
        let dir = self.layout.dir(function).join(&distribution);
        let size_gb = match tokio::fs::read_to_string(dir.join(SIZE_FILE_NAME)).await {
            Ok(content) => content.trim().parse().unwrap_or_default(),
            Err(err) => {
                warn!("Size of {} is unknown: {}", distribution, err);
                0
            }
        };
        Ok(Some(Box::new(self.disk(vm_name, function, size_gb))))
    }

    async fn adopt_relocated(
        &self,
        vm_name: &str,
        function: DiskFunction,
    ) -> Result<(), VirtualDiskError> {
        let disk = self.disk(vm_name, function, 0);
        let vhdx = disk.descriptor.storage_path.join(VHDX_FILE_NAME);
        if !tokio::fs::try_exists(&vhdx)
            .await
            .map_err(|err| VirtualDiskError::Backend(err.to_string()))?
        {
            warn!("No {} to register for {}", VHDX_FILE_NAME, disk.distribution);
            return Ok(());
        }
        // WSL remembers the old location until the distribution is imported again.
        if self
            .cli
            .is_registered(&disk.distribution)
            .await
            .map_err(VirtualDiskError::Backend)?
        {
            self.cli
                .run(&["--unregister", &disk.distribution])
                .await
                .map_err(VirtualDiskError::Backend)?;
        }
        let vhdx_arg = vhdx.display().to_string();
        self.cli
            .run(&["--import-in-place", &disk.distribution, &vhdx_arg])
            .await
            .map_err(VirtualDiskError::Backend)?;
        debug!("Registered {} at {:?}", disk.distribution, vhdx);
        Ok(())
    }
}
