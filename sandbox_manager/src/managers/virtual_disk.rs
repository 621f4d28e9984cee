use std::{
    collections::BTreeSet,
    fmt,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{planner::StoragePlacement, resources::ResourceSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DiskFunction {
    Os,
    Cluster,
    Data,
}

impl DiskFunction {
    pub const ALL: [DiskFunction; 3] = [DiskFunction::Os, DiskFunction::Cluster, DiskFunction::Data];

    pub fn as_str(&self) -> &'static str {
        match self {
            DiskFunction::Os => "os",
            DiskFunction::Cluster => "cluster",
            DiskFunction::Data => "data",
        }
    }
}

impl fmt::Display for DiskFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum VirtualDiskError {
    #[error("Disk '{function}' of virtual machine '{vm_name}' already exists.")]
    AlreadyExists {
        vm_name: String,
        function: DiskFunction,
    },
    #[error("Disk image not found: {0:?}")]
    ImageNotFound(PathBuf),
    #[error("Can't shrink disk from {current_gb} GB to {requested_gb} GB.")]
    ShrinkNotSupported { current_gb: u32, requested_gb: u32 },
    #[error("Disk operation failed: {0}")]
    Backend(String),
    #[error("Disk attachment service failure: {0}")]
    Service(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskDescriptor {
    pub vm_name: String,
    pub function: DiskFunction,
    pub storage_path: PathBuf,
    pub max_size_gb: u32,
    pub is_ssd: bool,
}

/// Where the disks of one machine live and which of them sit on solid state drives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskLayout {
    pub placement: StoragePlacement,
    pub ssd: BTreeSet<DiskFunction>,
}

impl DiskLayout {
    pub fn new(placement: StoragePlacement, spec: &ResourceSpec) -> Self {
        let ssd = [
            (DiskFunction::Os, spec.os_disk_is_ssd),
            (DiskFunction::Cluster, spec.cluster_disk_is_ssd),
            (DiskFunction::Data, spec.data_disk_is_ssd),
        ]
        .into_iter()
        .filter_map(|(function, is_ssd)| is_ssd.then_some(function))
        .collect();
        Self { placement, ssd }
    }

    pub fn dir(&self, function: DiskFunction) -> &Path {
        self.placement.dir(function)
    }

    pub fn is_ssd(&self, function: DiskFunction) -> bool {
        self.ssd.contains(&function)
    }

    pub fn disk_name(vm_name: &str, function: DiskFunction) -> String {
        format!("{}-{}", vm_name, function)
    }
}

#[async_trait]
pub trait VirtualDisk {
    fn descriptor(&self) -> &DiskDescriptor;
    async fn resize(&mut self, new_size_gb: u32) -> Result<(), VirtualDiskError>;
    async fn delete(&mut self) -> Result<(), VirtualDiskError>;
    fn is_service_required(&self) -> bool;
    async fn is_service_running(&self) -> Result<bool, VirtualDiskError>;
    async fn start_service(&mut self) -> Result<(), VirtualDiskError>;
    async fn stop_service(&mut self) -> Result<(), VirtualDiskError>;
}

/// Creates and finds the disks of one backend. Callers look a disk up with
/// `try_find_by_name` before creating it, so `AlreadyExists` always means an
/// unexpected leftover rather than a disk to reuse.
#[async_trait]
pub trait DiskProvider {
    async fn create_blank(
        &self,
        vm_name: &str,
        function: DiskFunction,
        size_gb: u32,
    ) -> Result<Box<dyn VirtualDisk + Send + Sync>, VirtualDiskError>;
    async fn create_from_image(
        &self,
        vm_name: &str,
        image_path: &Path,
        size_gb: u32,
    ) -> Result<Box<dyn VirtualDisk + Send + Sync>, VirtualDiskError>;
    async fn try_find_by_name(
        &self,
        vm_name: &str,
        function: DiskFunction,
    ) -> Result<Option<Box<dyn VirtualDisk + Send + Sync>>, VirtualDiskError>;
    /// Points the backend at a disk whose directory was moved into this layout.
    /// Backends that address disks by path alone have nothing to do.
    async fn adopt_relocated(
        &self,
        _vm_name: &str,
        _function: DiskFunction,
    ) -> Result<(), VirtualDiskError> {
        Ok(())
    }
}

pub fn check_growth(current_gb: u32, requested_gb: u32) -> Result<bool, VirtualDiskError> {
    if requested_gb < current_gb {
        Err(VirtualDiskError::ShrinkNotSupported {
            current_gb,
            requested_gb,
        })
    } else {
        Ok(requested_gb > current_gb)
    }
}
