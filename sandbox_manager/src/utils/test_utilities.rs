use crate::host::{HostProbe, HostProbeError};
use crate::managers::{
    planner::StoragePlacement,
    resources::{DriveInfo, HostSnapshot, PortForwarding, ResourceSpec},
    sandbox::{SandboxError, VirtualMachineCreator},
    virtual_disk::{
        DiskDescriptor, DiskFunction, DiskLayout, DiskProvider, VirtualDisk, VirtualDiskError,
    },
    virtual_machine::{
        Backend, StartedVm, State, VirtualMachine, VirtualMachineData, VirtualMachineError,
        VmDisks, VmEndpoint,
    },
    vm_runtime::{VmRuntime, VmRuntimeError, VmStatus},
};
use crate::storage::download_cache::{ArtifactFetcher, ArtifactStream, DownloadCacheError};
use crate::ui::{ProvisioningUi, UiError};
use crate::virtualization::{
    command::{CommandError, CommandOutput, CommandRunner},
    vm_process::{VmHandlerError, VmProcess},
};
use async_trait::async_trait;
use mockall::mock;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

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

pub fn create_example_placement() -> StoragePlacement {
    StoragePlacement {
        os_dir: PathBuf::from("/var/lib/sandbox/vm-os"),
        cluster_dir: PathBuf::from("/var/lib/sandbox/vm-cluster"),
        data_dir: PathBuf::from("/var/lib/sandbox/vm-data"),
    }
}

pub fn create_placement_in(dir: &Path) -> StoragePlacement {
    StoragePlacement {
        os_dir: dir.join("os"),
        cluster_dir: dir.join("cluster"),
        data_dir: dir.join("data"),
    }
}

pub fn create_example_snapshot() -> HostSnapshot {
    HostSnapshot {
        logical_processors: 16,
        total_memory_mb: 32 * 1024,
        free_memory_mb: 24 * 1024,
        drives: vec![DriveInfo {
            path: PathBuf::from("/"),
            free_space_mb: 500 * 1024,
            is_ssd: true,
        }],
        gpus: vec![],
    }
}

pub fn create_example_disk_descriptor(function: DiskFunction) -> DiskDescriptor {
    let placement = create_example_placement();
    DiskDescriptor {
        vm_name: String::from("lab"),
        function,
        storage_path: placement
            .dir(function)
            .join(format!("{}.qcow2", DiskLayout::disk_name("lab", function))),
        max_size_gb: create_example_spec().disk_size_gb(function),
        is_ssd: false,
    }
}

pub fn create_example_disk(function: DiskFunction, services_required: bool) -> MockVirtualDisk {
    let mut disk = MockVirtualDisk::new();
    disk.expect_descriptor()
        .return_const(create_example_disk_descriptor(function));
    disk.expect_is_service_required()
        .return_const(services_required);
    disk.expect_is_service_running().returning(|| Ok(false));
    disk.expect_start_service().returning(|| Ok(()));
    disk.expect_stop_service().returning(|| Ok(()));
    disk.expect_delete().returning(|| Ok(()));
    disk.expect_resize().returning(|_| Ok(()));
    disk
}

pub fn create_example_endpoint() -> VmEndpoint {
    VmEndpoint {
        ip_address: IpAddr::V4(Ipv4Addr::new(10, 0, 2, 15)),
        ssh_port: 3022,
        kubernetes_port: 6443,
        http_ingress_port: 80,
        https_ingress_port: 443,
    }
}

pub fn create_example_started_vm() -> StartedVm {
    StartedVm {
        endpoint: create_example_endpoint(),
        process_id: Some(42),
        cluster_credentials: Some(String::from("apiVersion: v1\n")),
    }
}

pub fn create_example_vm_data(state: State) -> VirtualMachineData {
    VirtualMachineData {
        name: String::from("lab"),
        backend: Backend::LocalHypervisor,
        state,
        granted: None,
        endpoint: None,
        disks: DiskFunction::ALL
            .into_iter()
            .map(create_example_disk_descriptor)
            .collect(),
        failure: None,
    }
}

mock! {
    pub VirtualDisk {}

    #[async_trait]
    impl VirtualDisk for VirtualDisk {
        fn descriptor(&self) -> &DiskDescriptor;
        async fn resize(&mut self, new_size_gb: u32) -> Result<(), VirtualDiskError>;
        async fn delete(&mut self) -> Result<(), VirtualDiskError>;
        fn is_service_required(&self) -> bool;
        async fn is_service_running(&self) -> Result<bool, VirtualDiskError>;
        async fn start_service(&mut self) -> Result<(), VirtualDiskError>;
        async fn stop_service(&mut self) -> Result<(), VirtualDiskError>;
    }
}

mock! {
    pub DiskProvider {}

    #[async_trait]
    impl DiskProvider for DiskProvider {
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
        async fn adopt_relocated(
            &self,
            vm_name: &str,
            function: DiskFunction,
        ) -> Result<(), VirtualDiskError>;
    }
}

mock! {
    pub VmRuntime {}

    #[async_trait]
    impl VmRuntime for VmRuntime {
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
}

mock! {
    pub VirtualMachine {}

    #[async_trait]
    impl VirtualMachine for VirtualMachine {
        async fn start(&mut self, spec: &ResourceSpec) -> Result<StartedVm, VirtualMachineError>;
        async fn stop(&mut self) -> Result<(), VirtualMachineError>;
        async fn kill(&mut self) -> Result<(), VirtualMachineError>;
        async fn resize_disks(&mut self, spec: &ResourceSpec) -> Result<(), VirtualMachineError>;
        async fn delete(&mut self) -> Result<(), VirtualMachineError>;
        async fn refresh_state(&mut self) -> Result<State, VirtualMachineError>;
        fn get_data(&self) -> VirtualMachineData;
    }
}

mock! {
    pub VirtualMachineCreator {}

    impl VirtualMachineCreator for VirtualMachineCreator {
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
}

mock! {
    pub HostProbe {}

    #[async_trait]
    impl HostProbe for HostProbe {
        async fn snapshot(&self, storage_dirs: &[PathBuf]) -> Result<HostSnapshot, HostProbeError>;
        fn is_process_alive(&self, pid: u32) -> bool;
        fn signal_process(&self, pid: u32, graceful: bool) -> Result<(), HostProbeError>;
    }
}

mock! {
    pub ProvisioningUi {}

    #[async_trait]
    impl ProvisioningUi for ProvisioningUi {
        fn display_step(&self, step: &str);
        fn display_command_launch(&self, command: &str);
        fn display_command_result(&self, command: &str, success: bool, output: &str);
        fn display_message(&self, message: &str);
        fn display_progress(&self, label: &str, total: u64, done: u64, percent: u8);
        async fn ask_yes_no(&self, question: &str) -> Result<bool, UiError>;
        async fn ask_text(&self, question: &str) -> Result<String, UiError>;
    }
}

mock! {
    pub CommandRunner {}

    #[async_trait]
    impl CommandRunner for CommandRunner {
        async fn run(&self, program: &Path, args: &[String]) -> Result<CommandOutput, CommandError>;
        fn spawn(
            &self,
            program: &Path,
            args: &[String],
        ) -> Result<Box<dyn VmProcess + Send + Sync>, CommandError>;
    }
}

mock! {
    pub VmProcess {}

    #[async_trait]
    impl VmProcess for VmProcess {
        fn id(&self) -> Option<u32>;
        fn try_get_exit_status(&mut self) -> Result<Option<String>, VmHandlerError>;
        async fn shutdown(&mut self, grace: Duration) -> Result<(), VmHandlerError>;
        async fn kill(&mut self) -> Result<(), VmHandlerError>;
    }
}

mock! {
    pub ArtifactFetcher {}

    #[async_trait]
    impl ArtifactFetcher for ArtifactFetcher {
        async fn open(&self, url: &str) -> Result<Box<dyn ArtifactStream>, DownloadCacheError>;
    }
}
