use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::Deserialize;

use super::command::CommandRunner;
use crate::managers::virtual_disk::{
    check_growth, DiskDescriptor, DiskFunction, DiskLayout, DiskProvider, VirtualDisk,
    VirtualDiskError,
};

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Deserialize)]
struct ImageInfo {
    #[serde(rename = "virtual-size")]
    virtual_size: u64,
}

async fn read_size_gb(
    runner: &dyn CommandRunner,
    qemu_img: &Path,
    path: &Path,
) -> Result<u32, VirtualDiskError> {
    let output = runner
        .run(
            qemu_img,
            &[
                String::from("info"),
                String::from("--output=json"),
                path.display().to_string(),
            ],
        )
        .await
        .map_err(|err| VirtualDiskError::Backend(err.to_string()))?;
    let info: ImageInfo = serde_json::from_slice(&output.stdout)
        .map_err(|err| VirtualDiskError::Backend(format!("unreadable image info: {}", err)))?;
    Ok(info.virtual_size.div_ceil(GIB) as u32)
}

async fn resize_image(
    runner: &dyn CommandRunner,
    qemu_img: &Path,
    path: &Path,
    size_gb: u32,
) -> Result<(), VirtualDiskError> {
    runner
        .run(
            qemu_img,
            &[
                String::from("resize"),
                path.display().to_string(),
                format!("{}G", size_gb),
            ],
        )
        .await
        .map(|_| ())
        .map_err(|err| VirtualDiskError::Backend(err.to_string()))
}

/// A qcow2 image used by the local hypervisor.
pub struct QemuDisk {
    descriptor: DiskDescriptor,
    qemu_img: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

#[async_trait]
impl VirtualDisk for QemuDisk {
    fn descriptor(&self) -> &DiskDescriptor {
        &self.descriptor
    }

    async fn resize(&mut self, new_size_gb: u32) -> Result<(), VirtualDiskError> {
        if !check_growth(self.descriptor.max_size_gb, new_size_gb)? {
            return Ok(());
        }
        resize_image(
            self.runner.as_ref(),
            &self.qemu_img,
            &self.descriptor.storage_path,
            new_size_gb,
        )
        .await?;
        self.descriptor.max_size_gb = new_size_gb;
        Ok(())
    }

    async fn delete(&mut self) -> Result<(), VirtualDiskError> {
        match tokio::fs::remove_file(&self.descriptor.storage_path).await {
            Ok(()) => {
                info!("Deleted disk {:?}", self.descriptor.storage_path);
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(VirtualDiskError::Backend(err.to_string())),
        }
    }

    fn is_service_required(&self) -> bool {
        false
    }

    async fn is_service_running(&self) -> Result<bool, VirtualDiskError> {
        Ok(false)
    }

    async fn start_service(&mut self) -> Result<(), VirtualDiskError> {
        Ok(())
    }

    async fn stop_service(&mut self) -> Result<(), VirtualDiskError> {
        Ok(())
    }
}

pub struct QemuDiskProvider {
    qemu_img: PathBuf,
    layout: DiskLayout,
    runner: Arc<dyn CommandRunner>,
}

impl QemuDiskProvider {
    pub fn new(qemu_img: PathBuf, layout: DiskLayout, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            qemu_img,
            layout,
            runner,
        }
    }

    fn disk_path(&self, vm_name: &str, function: DiskFunction) -> PathBuf {
        self.layout
            .dir(function)
            .join(format!("{}.qcow2", DiskLayout::disk_name(vm_name, function)))
    }

    fn disk(&self, vm_name: &str, function: DiskFunction, size_gb: u32) -> QemuDisk {
        QemuDisk {
            descriptor: DiskDescriptor {
                vm_name: vm_name.to_string(),
                function,
                storage_path: self.disk_path(vm_name, function),
                max_size_gb: size_gb,
                is_ssd: self.layout.is_ssd(function),
            },
            qemu_img: self.qemu_img.clone(),
            runner: self.runner.clone(),
        }
    }

    async fn prepare_target(
        &self,
        vm_name: &str,
        function: DiskFunction,
    ) -> Result<PathBuf, VirtualDiskError> {
        let path = self.disk_path(vm_name, function);
        if tokio::fs::try_exists(&path)
            .await
            .map_err(|err| VirtualDiskError::Backend(err.to_string()))?
        {
            return Err(VirtualDiskError::AlreadyExists {
                vm_name: vm_name.to_string(),
                function,
            });
        }
        tokio::fs::create_dir_all(self.layout.dir(function))
            .await
            .map_err(|err| VirtualDiskError::Backend(err.to_string()))?;
        Ok(path)
    }

    async fn discard(path: &Path) {
        if let Err(err) = tokio::fs::remove_file(path).await {
            if err.kind() != io::ErrorKind::NotFound {
                warn!("Can't remove partial disk {:?}: {}", path, err);
            }
        }
    }

    async fn convert_and_grow(
        &self,
        image_path: &Path,
        path: &Path,
        size_gb: u32,
    ) -> Result<u32, VirtualDiskError> {
        self.runner
            .run(
                &self.qemu_img,
                &[
                    String::from("convert"),
                    String::from("-O"),
                    String::from("qcow2"),
                    image_path.display().to_string(),
                    path.display().to_string(),
                ],
            )
            .await
            .map_err(|err| VirtualDiskError::Backend(err.to_string()))?;
        let image_size_gb = read_size_gb(self.runner.as_ref(), &self.qemu_img, path).await?;
        if size_gb > image_size_gb {
            resize_image(self.runner.as_ref(), &self.qemu_img, path, size_gb).await?;
            Ok(size_gb)
        } else {
            Ok(image_size_gb)
        }
    }
}

#[async_trait]
impl DiskProvider for QemuDiskProvider {
    async fn create_blank(
        &self,
        vm_name: &str,
        function: DiskFunction,
        size_gb: u32,
    ) -> Result<Box<dyn VirtualDisk + Send + Sync>, VirtualDiskError> {
        let path = self.prepare_target(vm_name, function).await?;
        let created = self
            .runner
            .run(
                &self.qemu_img,
                &[
                    String::from("create"),
                    String::from("-f"),
                    String::from("qcow2"),
                    path.display().to_string(),
                    format!("{}G", size_gb),
                ],
            )
            .await;
        if let Err(err) = created {
            Self::discard(&path).await;
            return Err(VirtualDiskError::Backend(err.to_string()));
        }
        debug!("Created blank disk {:?} ({} GB)", path, size_gb);
        Ok(Box::new(self.disk(vm_name, function, size_gb)))
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
        let path = self.prepare_target(vm_name, DiskFunction::Os).await?;
        match self.convert_and_grow(image_path, &path, size_gb).await {
            Ok(final_size_gb) => {
                debug!("Created disk {:?} from {:?}", path, image_path);
                Ok(Box::new(self.disk(vm_name, DiskFunction::Os, final_size_gb)))
            }
            Err(err) => {
                Self::discard(&path).await;
                Err(err)
            }
        }
    }

    async fn try_find_by_name(
        &self,
        vm_name: &str,
        function: DiskFunction,
    ) -> Result<Option<Box<dyn VirtualDisk + Send + Sync>>, VirtualDiskError> {
        let path = self.disk_path(vm_name, function);
        if !tokio::fs::try_exists(&path)
            .await
            .map_err(|err| VirtualDiskError::Backend(err.to_string()))?
        {
            return Ok(None);
        }
        let size_gb = read_size_gb(self.runner.as_ref(), &self.qemu_img, &path).await?;
        Ok(Some(Box::new(self.disk(vm_name, function, size_gb))))
    }
}
