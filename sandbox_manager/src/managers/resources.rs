use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::virtual_disk::DiskFunction;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub model_name: String,
    pub memory_mb: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveInfo {
    pub path: PathBuf,
    pub free_space_mb: u64,
    pub is_ssd: bool,
}

/// Point-in-time view of the host, read fresh before every planning decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSnapshot {
    pub logical_processors: u32,
    pub total_memory_mb: u64,
    pub free_memory_mb: u64,
    pub drives: Vec<DriveInfo>,
    pub gpus: Vec<GpuInfo>,
}

impl HostSnapshot {
    /// The drive holding `path`: the one with the longest matching mount path.
    pub fn drive_for(&self, path: &Path) -> Option<&DriveInfo> {
        self.drives
            .iter()
            .filter(|drive| path.starts_with(&drive.path))
            .max_by_key(|drive| drive.path.components().count())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForwarding {
    pub ssh_port: u16,
    pub kubernetes_port: u16,
    pub http_port: u16,
    pub https_port: u16,
}

impl Default for PortForwarding {
    fn default() -> Self {
        Self {
            ssh_port: 3022,
            kubernetes_port: 6443,
            http_port: 8080,
            https_port: 8443,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub processors: u32,
    pub memory_gb: u32,
    pub gpu_model: Option<String>,
    pub gpu_memory_gb: u32,
    pub gpu_count: u32,
    pub os_disk_gb: u32,
    pub cluster_disk_gb: u32,
    pub data_disk_gb: u32,
    pub os_disk_is_ssd: bool,
    pub cluster_disk_is_ssd: bool,
    pub data_disk_is_ssd: bool,
    pub ports: PortForwarding,
}

impl ResourceSpec {
    pub fn disk_size_gb(&self, function: DiskFunction) -> u32 {
        match function {
            DiskFunction::Os => self.os_disk_gb,
            DiskFunction::Cluster => self.cluster_disk_gb,
            DiskFunction::Data => self.data_disk_gb,
        }
    }

    pub fn set_disk_size_gb(&mut self, function: DiskFunction, size_gb: u32) {
        match function {
            DiskFunction::Os => self.os_disk_gb = size_gb,
            DiskFunction::Cluster => self.cluster_disk_gb = size_gb,
            DiskFunction::Data => self.data_disk_gb = size_gb,
        }
    }

    pub fn set_disk_is_ssd(&mut self, function: DiskFunction, is_ssd: bool) {
        match function {
            DiskFunction::Os => self.os_disk_is_ssd = is_ssd,
            DiskFunction::Cluster => self.cluster_disk_is_ssd = is_ssd,
            DiskFunction::Data => self.data_disk_is_ssd = is_ssd,
        }
    }

    pub fn uses_gpu(&self) -> bool {
        self.gpu_model.is_some() && self.gpu_count > 0
    }
}
