use std::{
    net::{IpAddr, Ipv4Addr},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use log::{debug, info, trace};
use tokio::{io::AsyncReadExt, net::TcpStream, time::Instant};

use super::{command::CommandRunner, vm_process::VmProcess};
use crate::managers::{
    resources::{PortForwarding, ResourceSpec},
    virtual_disk::DiskDescriptor,
    virtual_machine::VmEndpoint,
    vm_runtime::{VmRuntime, VmRuntimeError, VmStatus},
};

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const BANNER_WAIT: Duration = Duration::from_secs(5);
const UNPRIVILEGED_PORT_START: &str = "/proc/sys/net/ipv4/ip_unprivileged_port_start";

/// QEMU accepts forwarded connections as soon as it runs, so only the sshd
/// banner proves that the guest is up.
async fn read_ssh_banner(endpoint: &VmEndpoint, wait: Duration) -> bool {
    let probe = async {
        let mut stream = TcpStream::connect((endpoint.ip_address, endpoint.ssh_port)).await?;
        let mut banner = [0u8; 4];
        stream.read_exact(&mut banner).await?;
        Ok::<bool, std::io::Error>(&banner == b"SSH-")
    };
    matches!(tokio::time::timeout(wait, probe).await, Ok(Ok(true)))
}

/// Host ports below `unprivileged_start` can't be bound by ordinary users.
fn check_forwarded_ports(
    ports: &PortForwarding,
    unprivileged_start: u16,
    is_root: bool,
) -> Result<(), VmRuntimeError> {
    if is_root {
        return Ok(());
    }
    let forwarded = [
        ports.ssh_port,
        ports.kubernetes_port,
        ports.http_port,
        ports.https_port,
    ];
    match forwarded.into_iter().find(|port| *port < unprivileged_start) {
        Some(port) => Err(VmRuntimeError::PrivilegedPort(port)),
        None => Ok(()),
    }
}

#[cfg(unix)]
fn running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(not(unix))]
fn running_as_root() -> bool {
    false
}

fn unprivileged_port_start() -> u16 {
    std::fs::read_to_string(UNPRIVILEGED_PORT_START)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(1024)
}

/// Runs a machine as a `qemu-system` process with user mode networking. The
/// guest is reachable through host port forwards on the loopback address.
pub struct QemuRuntime {
    qemu: PathBuf,
    vm_name: String,
    runner: Arc<dyn CommandRunner>,
    shutdown_grace: Duration,
    vm: Option<Box<dyn VmProcess + Send + Sync>>,
    endpoint: Option<VmEndpoint>,
}

impl QemuRuntime {
    pub fn new(
        qemu: PathBuf,
        vm_name: String,
        runner: Arc<dyn CommandRunner>,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            qemu,
            vm_name,
            runner,
            shutdown_grace,
            vm: None,
            endpoint: None,
        }
    }

    pub fn build_args(&self, spec: &ResourceSpec, disks: &[DiskDescriptor]) -> Vec<String> {
        let mut args = vec![];
        args.extend([String::from("-name"), self.vm_name.clone()]);
        args.extend([String::from("-accel"), String::from("kvm")]);
        args.extend([String::from("-accel"), String::from("tcg")]);
        args.extend([String::from("-smp"), spec.processors.to_string()]);
        args.extend([String::from("-m"), format!("{}G", spec.memory_gb)]);
        for disk in disks {
            args.push(String::from("-drive"));
            args.push(format!(
                "file={},if=virtio,format=qcow2",
                disk.storage_path.display()
            ));
        }
        let ports = &spec.ports;
        args.push(String::from("-netdev"));
        args.push(format!(
            "user,id=net0,hostfwd=tcp::{}-:22,hostfwd=tcp::{}-:6443,hostfwd=tcp::{}-:80,hostfwd=tcp::{}-:443",
            ports.ssh_port, ports.kubernetes_port, ports.http_port, ports.https_port
        ));
        args.extend([
            String::from("-device"),
            String::from("virtio-net-pci,netdev=net0"),
        ]);
        args.push(String::from("-nographic"));
        args
    }

    fn exit_status(&mut self) -> Result<Option<String>, VmRuntimeError> {
        match self.vm.as_mut() {
            Some(vm) => vm
                .try_get_exit_status()
                .map_err(|err| VmRuntimeError::GetExitCode(err.to_string())),
            None => Err(VmRuntimeError::VmNotLaunched),
        }
    }
}

#[async_trait]
impl VmRuntime for QemuRuntime {
    async fn launch_vm(
        &mut self,
        spec: &ResourceSpec,
        disks: &[DiskDescriptor],
    ) -> Result<Option<u32>, VmRuntimeError> {
        if matches!(self.get_status()?, VmStatus::Launched) {
            return Err(VmRuntimeError::VmAlreadyLaunched);
        }
        if spec.uses_gpu() {
            return Err(VmRuntimeError::Launch(String::from(
                "GPU passthrough isn't supported by the local hypervisor",
            )));
        }
        check_forwarded_ports(
            &spec.ports,
            unprivileged_port_start(),
            running_as_root(),
        )?;
        let args = self.build_args(spec, disks);
        trace!("Launching {} with {:?}", self.vm_name, args);
        let vm = self
            .runner
            .spawn(&self.qemu, &args)
            .map_err(|err| VmRuntimeError::Launch(err.to_string()))?;
        let process_id = vm.id();
        self.vm = Some(vm);
        self.endpoint = Some(VmEndpoint {
            ip_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ssh_port: spec.ports.ssh_port,
            kubernetes_port: spec.ports.kubernetes_port,
            http_ingress_port: spec.ports.http_port,
            https_ingress_port: spec.ports.https_port,
        });
        info!("Launched {} (pid {:?})", self.vm_name, process_id);
        Ok(process_id)
    }

    async fn wait_for_endpoint(&mut self, timeout: Duration) -> Result<VmEndpoint, VmRuntimeError> {
        let endpoint = self.endpoint.ok_or(VmRuntimeError::VmNotLaunched)?;
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(exit_status) = self.exit_status()? {
                return Err(VmRuntimeError::ExitedEarly(exit_status));
            }
            let wait = deadline
                .saturating_duration_since(Instant::now())
                .clamp(POLL_INTERVAL, BANNER_WAIT);
            if read_ssh_banner(&endpoint, wait).await {
                debug!("{} answers ssh on port {}", self.vm_name, endpoint.ssh_port);
                return Ok(endpoint);
            }
            if Instant::now() >= deadline {
                return Err(VmRuntimeError::EndpointTimeout(timeout.as_secs()));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn read_cluster_credentials(&mut self) -> Result<Option<String>, VmRuntimeError> {
        // The guest is only reachable over ssh, the deployment layer fetches them.
        Ok(None)
    }

    async fn shutdown(&mut self) -> Result<(), VmRuntimeError> {
        let mut vm = self.vm.take().ok_or(VmRuntimeError::VmNotLaunched)?;
        self.endpoint = None;
        vm.shutdown(self.shutdown_grace)
            .await
            .map_err(|err| VmRuntimeError::Shutdown(err.to_string()))
    }

    async fn kill(&mut self) -> Result<(), VmRuntimeError> {
        let mut vm = self.vm.take().ok_or(VmRuntimeError::VmNotLaunched)?;
        self.endpoint = None;
        vm.kill()
            .await
            .map_err(|err| VmRuntimeError::Shutdown(err.to_string()))
    }

    fn get_status(&mut self) -> Result<VmStatus, VmRuntimeError> {
        match self.exit_status() {
            Ok(Some(exit_status)) => Ok(VmStatus::Exited(exit_status)),
            Ok(None) => Ok(VmStatus::Launched),
            Err(VmRuntimeError::VmNotLaunched) => Ok(VmStatus::NotLaunched),
            Err(err) => Err(err),
        }
    }
}
