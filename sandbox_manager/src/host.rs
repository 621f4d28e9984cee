use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use log::{debug, warn};
#[cfg(unix)]
use nix::{
    sys::signal::{
        self,
        Signal::{SIGKILL, SIGTERM},
    },
    unistd::Pid,
};
use thiserror::Error;

use crate::managers::resources::{DriveInfo, GpuInfo, HostSnapshot};
use crate::virtualization::command::CommandRunner;

const MEMINFO_PATH: &str = "/proc/meminfo";

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum HostProbeError {
    #[error("Can't read processor count: {0}")]
    Processors(String),
    #[error("Can't read memory information: {0}")]
    Memory(String),
    #[error("Can't read drive holding {path:?}: {reason}")]
    Drive { path: PathBuf, reason: String },
    #[error("Can't signal process {pid}: {reason}")]
    Signal { pid: u32, reason: String },
}

/// Reads the host fresh on every call, nothing is cached.
#[async_trait]
pub trait HostProbe: Send + Sync {
    /// `storage_dirs` are the directories whose drives the snapshot reports.
    async fn snapshot(&self, storage_dirs: &[PathBuf]) -> Result<HostSnapshot, HostProbeError>;
    fn is_process_alive(&self, pid: u32) -> bool;
    /// Asks the process to terminate, or kills it right away unless `graceful`.
    fn signal_process(&self, pid: u32, graceful: bool) -> Result<(), HostProbeError>;
}

pub struct LinuxHostProbe {
    nvidia_smi: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl LinuxHostProbe {
    pub fn new(nvidia_smi: PathBuf, runner: Arc<dyn CommandRunner>) -> Self {
        Self { nvidia_smi, runner }
    }

    async fn read_gpus(&self) -> Vec<GpuInfo> {
        let args = [
            String::from("--query-gpu=name,memory.total"),
            String::from("--format=csv,noheader,nounits"),
        ];
        match self.runner.run(&self.nvidia_smi, &args).await {
            Ok(output) => parse_gpus(&output.stdout_text()),
            Err(err) => {
                debug!("No GPUs reported: {}", err);
                vec![]
            }
        }
    }
}

#[async_trait]
impl HostProbe for LinuxHostProbe {
    async fn snapshot(&self, storage_dirs: &[PathBuf]) -> Result<HostSnapshot, HostProbeError> {
        let logical_processors = std::thread::available_parallelism()
            .map(|count| count.get() as u32)
            .map_err(|err| HostProbeError::Processors(err.to_string()))?;
        let meminfo = tokio::fs::read_to_string(MEMINFO_PATH)
            .await
            .map_err(|err| HostProbeError::Memory(err.to_string()))?;
        let (total_memory_mb, free_memory_mb) = parse_meminfo(&meminfo)?;

        let mut drives = BTreeMap::new();
        for dir in storage_dirs {
            let drive = read_drive(dir).map_err(|err| HostProbeError::Drive {
                path: dir.clone(),
                reason: err.to_string(),
            })?;
            drives.insert(drive.path.clone(), drive);
        }

        Ok(HostSnapshot {
            logical_processors,
            total_memory_mb,
            free_memory_mb,
            drives: drives.into_values().collect(),
            gpus: self.read_gpus().await,
        })
    }

    #[cfg(unix)]
    fn is_process_alive(&self, pid: u32) -> bool {
        // No signal only checks that the process exists.
        signal::kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    #[cfg(not(unix))]
    fn is_process_alive(&self, _pid: u32) -> bool {
        false
    }

    #[cfg(unix)]
    fn signal_process(&self, pid: u32, graceful: bool) -> Result<(), HostProbeError> {
        let signal = if graceful { SIGTERM } else { SIGKILL };
        signal::kill(Pid::from_raw(pid as i32), signal).map_err(|err| HostProbeError::Signal {
            pid,
            reason: err.to_string(),
        })
    }

    #[cfg(not(unix))]
    fn signal_process(&self, pid: u32, _graceful: bool) -> Result<(), HostProbeError> {
        Err(HostProbeError::Signal {
            pid,
            reason: String::from("signals are only supported on Unix systems"),
        })
    }
}

/// Returns `(total, available)` in megabytes.
pub fn parse_meminfo(meminfo: &str) -> Result<(u64, u64), HostProbeError> {
    let field = |name: &str| {
        meminfo
            .lines()
            .find_map(|line| line.strip_prefix(name))
            .and_then(|rest| rest.trim_start_matches(':').split_whitespace().next())
            .and_then(|kilobytes| kilobytes.parse::<u64>().ok())
            .map(|kilobytes| kilobytes / 1024)
            .ok_or_else(|| HostProbeError::Memory(format!("{} is missing", name)))
    };
    Ok((field("MemTotal")?, field("MemAvailable")?))
}

pub fn parse_gpus(output: &str) -> Vec<GpuInfo> {
    output
        .lines()
        .filter_map(|line| {
            let (name, memory) = line.rsplit_once(',')?;
            Some(GpuInfo {
                model_name: name.trim().to_string(),
                memory_mb: memory.trim().parse().ok()?,
            })
        })
        .collect()
}

/// The closest ancestor of `path` that exists. Storage directories are created lazily.
fn existing_ancestor(path: &Path) -> &Path {
    path.ancestors()
        .find(|ancestor| ancestor.exists())
        .unwrap_or_else(|| Path::new("/"))
}

#[cfg(unix)]
fn read_drive(dir: &Path) -> std::io::Result<DriveInfo> {
    use std::os::unix::fs::MetadataExt;

    let existing = existing_ancestor(dir);
    let device = std::fs::metadata(existing)?.dev();
    let mut mount_point = existing;
    while let Some(parent) = mount_point.parent() {
        if std::fs::metadata(parent)?.dev() != device {
            break;
        }
        mount_point = parent;
    }
    Ok(DriveInfo {
        path: mount_point.to_path_buf(),
        free_space_mb: free_space_bytes(mount_point)? / (1024 * 1024),
        is_ssd: is_solid_state(device),
    })
}

#[cfg(not(unix))]
fn read_drive(_dir: &Path) -> std::io::Result<DriveInfo> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "drive probing is only supported on Unix systems",
    ))
}

#[cfg(unix)]
fn free_space_bytes(path: &Path) -> std::io::Result<u64> {
    use std::os::unix::ffi::OsStrExt;

    let path_cstr = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err))?;
    // SAFETY: statvfs is a C struct of plain integers, zero is a valid value.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: path_cstr is a valid null-terminated C string and stat is a
    // valid mutable reference for the duration of the call.
    let result = unsafe { libc::statvfs(path_cstr.as_ptr(), &mut stat) };
    if result != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
}

/// Splits a Linux `dev_t` into major and minor numbers.
fn split_device(device: u64) -> (u64, u64) {
    let major = ((device >> 8) & 0xfff) | ((device >> 32) & !0xfff);
    let minor = (device & 0xff) | ((device >> 12) & !0xff);
    (major, minor)
}

fn is_solid_state(device: u64) -> bool {
    let (major, minor) = split_device(device);
    let block = PathBuf::from(format!("/sys/dev/block/{}:{}", major, minor));
    // Partitions keep the queue attributes on their parent device.
    for queue in [block.join("queue"), block.join("..").join("queue")] {
        if let Ok(rotational) = std::fs::read_to_string(queue.join("rotational")) {
            return rotational.trim() == "0";
        }
    }
    warn!(
        "Can't tell whether block device {}:{} is a solid state drive",
        major, minor
    );
    false
}
