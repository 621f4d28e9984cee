use std::{
    net::{IpAddr, Ipv4Addr},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU32, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use sandbox_manager::{
    fabric::sandbox_fabric::SandboxFabric,
    host::{HostProbe, HostProbeError},
    managers::{
        resources::{DriveInfo, HostSnapshot, PortForwarding, ResourceSpec},
        sandbox::{Sandbox, SandboxError, VirtualMachineCreator, VmProvisioningRequest},
        virtual_disk::{
            check_growth, DiskDescriptor, DiskFunction, DiskLayout, DiskProvider, VirtualDisk,
            VirtualDiskError,
        },
        virtual_machine::{
            Backend, StartedVm, State, VirtualMachine, VirtualMachineData, VirtualMachineError,
            VmDisks, VmEndpoint,
        },
    },
    storage::download_cache::{
        ArtifactFetcher, ArtifactRequest, ArtifactStream, DownloadCacheError,
    },
    ui::{ProvisioningUi, UiError},
};

pub const IMAGE_URL: &str = "https://images.example.com/sandbox-os.img";
/// OS disks made from the image never get smaller than the image itself.
pub const IMAGE_SIZE_GB: u32 = 20;

pub struct TestHome {
    dir: tempfile::TempDir,
}

impl TestHome {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

pub struct FakeHost {
    pub free_memory_gb: u64,
}

#[async_trait]
impl HostProbe for FakeHost {
    async fn snapshot(&self, _storage_dirs: &[PathBuf]) -> Result<HostSnapshot, HostProbeError> {
        Ok(HostSnapshot {
            logical_processors: 16,
            total_memory_mb: 32 * 1024,
            free_memory_mb: self.free_memory_gb * 1024,
            drives: vec![DriveInfo {
                path: PathBuf::from("/"),
                free_space_mb: 1024 * 1024,
                is_ssd: true,
            }],
            gpus: vec![],
        })
    }

    fn is_process_alive(&self, _pid: u32) -> bool {
        false
    }

    fn signal_process(&self, pid: u32, _graceful: bool) -> Result<(), HostProbeError> {
        Err(HostProbeError::Signal {
            pid,
            reason: String::from("no such process"),
        })
    }
}

#[derive(Default)]
pub struct FakeFetcher {
    pub opened: AtomicUsize,
}

struct OneChunk {
    content: Option<Vec<u8>>,
}

#[async_trait]
impl ArtifactStream for OneChunk {
    fn total_size(&self) -> Option<u64> {
        self.content.as_ref().map(|content| content.len() as u64)
    }

    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, DownloadCacheError> {
        Ok(self.content.take())
    }
}

#[async_trait]
impl ArtifactFetcher for FakeFetcher {
    async fn open(&self, url: &str) -> Result<Box<dyn ArtifactStream>, DownloadCacheError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(OneChunk {
            content: Some(format!("content of {}", url).into_bytes()),
        }))
    }
}

/// Disks are plain files holding their size.
struct FileDisk {
    descriptor: DiskDescriptor,
}

impl FileDisk {
    async fn write(descriptor: DiskDescriptor) -> Result<Self, VirtualDiskError> {
        tokio::fs::create_dir_all(descriptor.storage_path.parent().unwrap())
            .await
            .map_err(|err| VirtualDiskError::Backend(err.to_string()))?;
        tokio::fs::write(
            &descriptor.storage_path,
            descriptor.max_size_gb.to_string(),
        )
        .await
        .map_err(|err| VirtualDiskError::Backend(err.to_string()))?;
        Ok(Self { descriptor })
    }
}

#[async_trait]
impl VirtualDisk for FileDisk {
    fn descriptor(&self) -> &DiskDescriptor {
        &self.descriptor
    }

    async fn resize(&mut self, new_size_gb: u32) -> Result<(), VirtualDiskError> {
        self.descriptor.max_size_gb = new_size_gb;
        *self = FileDisk::write(self.descriptor.clone()).await?;
        Ok(())
    }

    async fn delete(&mut self) -> Result<(), VirtualDiskError> {
        tokio::fs::remove_file(&self.descriptor.storage_path)
            .await
            .map_err(|err| VirtualDiskError::Backend(err.to_string()))
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

struct FileDiskProvider {
    layout: DiskLayout,
}

impl FileDiskProvider {
    fn descriptor(&self, vm_name: &str, function: DiskFunction, size_gb: u32) -> DiskDescriptor {
        DiskDescriptor {
            vm_name: vm_name.to_string(),
            function,
            storage_path: self
                .layout
                .dir(function)
                .join(format!("{}.img", DiskLayout::disk_name(vm_name, function))),
            max_size_gb: size_gb,
            is_ssd: self.layout.is_ssd(function),
        }
    }
}

#[async_trait]
impl DiskProvider for FileDiskProvider {
    async fn create_blank(
        &self,
        vm_name: &str,
        function: DiskFunction,
        size_gb: u32,
    ) -> Result<Box<dyn VirtualDisk + Send + Sync>, VirtualDiskError> {
        let disk = FileDisk::write(self.descriptor(vm_name, function, size_gb)).await?;
        Ok(Box::new(disk))
    }

    async fn create_from_image(
        &self,
        vm_name: &str,
        image_path: &Path,
        size_gb: u32,
    ) -> Result<Box<dyn VirtualDisk + Send + Sync>, VirtualDiskError> {
        if !image_path.exists() {
            return Err(VirtualDiskError::ImageNotFound(image_path.to_path_buf()));
        }
        self.create_blank(vm_name, DiskFunction::Os, size_gb.max(IMAGE_SIZE_GB))
            .await
    }

    async fn try_find_by_name(
        &self,
        vm_name: &str,
        function: DiskFunction,
    ) -> Result<Option<Box<dyn VirtualDisk + Send + Sync>>, VirtualDiskError> {
        let descriptor = self.descriptor(vm_name, function, 0);
        match tokio::fs::read_to_string(&descriptor.storage_path).await {
            Ok(size) => Ok(Some(Box::new(FileDisk {
                descriptor: DiskDescriptor {
                    max_size_gb: size.trim().parse().unwrap_or_default(),
                    ..descriptor
                },
            }))),
            Err(_) => Ok(None),
        }
    }
}

struct FakeVm {
    name: String,
    backend: Backend,
    state: State,
    disks: VmDisks,
    granted: Option<ResourceSpec>,
    endpoint: Option<VmEndpoint>,
    next_pid: Arc<AtomicU32>,
}

#[async_trait]
impl VirtualMachine for FakeVm {
    async fn start(&mut self, spec: &ResourceSpec) -> Result<StartedVm, VirtualMachineError> {
        if !matches!(self.state, State::Stopped | State::Failed) {
            return Err(VirtualMachineError::UnsupportedAction(format!(
                "{} is {:?}",
                self.name, self.state
            )));
        }
        self.state = State::Starting;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let endpoint = VmEndpoint {
            ip_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ssh_port: spec.ports.ssh_port,
            kubernetes_port: spec.ports.kubernetes_port,
            http_ingress_port: spec.ports.http_port,
            https_ingress_port: spec.ports.https_port,
        };
        self.state = State::Running;
        self.granted = Some(spec.clone());
        self.endpoint = Some(endpoint);
        Ok(StartedVm {
            endpoint,
            process_id: Some(self.next_pid.fetch_add(1, Ordering::SeqCst)),
            cluster_credentials: None,
        })
    }

    async fn stop(&mut self) -> Result<(), VirtualMachineError> {
        self.state = State::Stopped;
        self.endpoint = None;
        Ok(())
    }

    async fn kill(&mut self) -> Result<(), VirtualMachineError> {
        self.stop().await
    }

    async fn resize_disks(&mut self, spec: &ResourceSpec) -> Result<(), VirtualMachineError> {
        for (function, disk) in self.disks.iter_mut() {
            let size_gb = spec.disk_size_gb(*function);
            let grows = check_growth(disk.descriptor().max_size_gb, size_gb)
                .map_err(|err| VirtualMachineError::DiskOperation(err.to_string()))?;
            if grows {
                disk.resize(size_gb)
                    .await
                    .map_err(|err| VirtualMachineError::DiskOperation(err.to_string()))?;
            }
        }
        Ok(())
    }

    async fn delete(&mut self) -> Result<(), VirtualMachineError> {
        for disk in self.disks.values_mut() {
            disk.delete()
                .await
                .map_err(|err| VirtualMachineError::VmDestroyFail(err.to_string()))?;
        }
        self.disks.clear();
        self.state = State::NotCreated;
        Ok(())
    }

    async fn refresh_state(&mut self) -> Result<State, VirtualMachineError> {
        Ok(self.state)
    }

    fn get_data(&self) -> VirtualMachineData {
        VirtualMachineData {
            name: self.name.clone(),
            backend: self.backend,
            state: self.state,
            granted: self.granted.clone(),
            endpoint: self.endpoint,
            disks: self
                .disks
                .values()
                .map(|disk| disk.descriptor().clone())
                .collect(),
            failure: None,
        }
    }
}

/// Builds file backed disks and in-memory machines for every backend but the cloud.
#[derive(Default)]
pub struct FakeCreator {
    next_pid: Arc<AtomicU32>,
}

impl VirtualMachineCreator for FakeCreator {
    fn disk_provider(
        &self,
        backend: Backend,
        layout: &DiskLayout,
    ) -> Result<Box<dyn DiskProvider + Send + Sync>, SandboxError> {
        match backend {
            Backend::Cloud => Err(SandboxError::UnsupportedBackend(backend)),
            _ => Ok(Box::new(FileDiskProvider {
                layout: layout.clone(),
            })),
        }
    }

    fn create_vm(
        &self,
        name: &str,
        backend: Backend,
        disks: VmDisks,
        state: State,
    ) -> Result<Box<dyn VirtualMachine + Send + Sync>, SandboxError> {
        self.next_pid.fetch_max(1000, Ordering::SeqCst);
        Ok(Box::new(FakeVm {
            name: name.to_string(),
            backend,
            state,
            disks,
            granted: None,
            endpoint: None,
            next_pid: self.next_pid.clone(),
        }))
    }
}

/// Remembers everything shown and answers questions with `answer`.
pub struct RecordingUi {
    pub answer: bool,
    pub lines: Mutex<Vec<String>>,
}

impl RecordingUi {
    pub fn new(answer: bool) -> Self {
        Self {
            answer,
            lines: Mutex::new(vec![]),
        }
    }

    fn record(&self, line: String) {
        self.lines.lock().unwrap().push(line);
    }
}

#[async_trait]
impl ProvisioningUi for RecordingUi {
    fn display_step(&self, step: &str) {
        self.record(format!("step: {}", step));
    }

    fn display_command_launch(&self, command: &str) {
        self.record(format!("launch: {}", command));
    }

    fn display_command_result(&self, command: &str, success: bool, _output: &str) {
        self.record(format!("result: {} {}", command, success));
    }

    fn display_message(&self, message: &str) {
        self.record(message.to_string());
    }

    fn display_progress(&self, label: &str, _total: u64, _done: u64, percent: u8) {
        self.record(format!("progress: {} {}", label, percent));
    }

    async fn ask_yes_no(&self, question: &str) -> Result<bool, UiError> {
        self.record(format!("question: {}", question));
        Ok(self.answer)
    }

    async fn ask_text(&self, _question: &str) -> Result<String, UiError> {
        Err(UiError::Closed)
    }
}

pub async fn create_sandbox(
    home: &Path,
    fetcher: Arc<FakeFetcher>,
    free_memory_gb: u64,
) -> Box<dyn Sandbox + Send + Sync> {
    SandboxFabric::create_sandbox(
        home,
        Box::new(FakeCreator::default()),
        Box::new(FakeHost { free_memory_gb }),
        fetcher,
    )
    .await
    .unwrap()
}

pub fn create_example_spec() -> ResourceSpec {
    ResourceSpec {
        processors: 4,
        memory_gb: 8,
        gpu_model: None,
        gpu_memory_gb: 0,
        gpu_count: 0,
        os_disk_gb: 10,
        cluster_disk_gb: 25,
        data_disk_gb: 50,
        os_disk_is_ssd: false,
        cluster_disk_is_ssd: false,
        data_disk_is_ssd: false,
        ports: PortForwarding::default(),
    }
}

pub fn create_request(name: &str) -> VmProvisioningRequest {
    VmProvisioningRequest {
        name: name.to_string(),
        backend: Backend::LocalHypervisor,
        spec: create_example_spec(),
        os_image: ArtifactRequest::from_url(IMAGE_URL),
        artifacts: vec![ArtifactRequest::from_url(
            "https://images.example.com/k3s-airgap.tar",
        )],
    }
}

#[allow(dead_code)]
pub fn disk_files(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|entry| entry.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}
