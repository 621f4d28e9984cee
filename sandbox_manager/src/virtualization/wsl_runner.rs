use std::{net::IpAddr, time::Duration};

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::time::Instant;

use super::{vm_process::VmProcess, wsl_disk::WslCli};
use crate::managers::{
    resources::ResourceSpec,
    virtual_disk::{DiskDescriptor, DiskFunction, DiskLayout},
    virtual_machine::VmEndpoint,
    vm_runtime::{VmRuntime, VmRuntimeError, VmStatus},
};

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const CLUSTER_CREDENTIALS_PATH: &str = "/etc/rancher/k3s/k3s.yaml";

/// Boots the cluster inside the OS distribution of a machine. Processor and
/// memory limits of WSL are global to the host, so they aren't applied here.
pub struct WslRuntime {
    cli: WslCli,
    distribution: String,
    shutdown_grace: Duration,
    vm: Option<Box<dyn VmProcess + Send + Sync>>,
    ports: Option<(u16, u16, u16, u16)>,
}

impl WslRuntime {
    pub fn new(cli: WslCli, vm_name: &str, shutdown_grace: Duration) -> Self {
        Self {
            cli,
            distribution: DiskLayout::disk_name(vm_name, DiskFunction::Os),
            shutdown_grace,
            vm: None,
            ports: None,
        }
    }

    pub fn boot_args(&self, spec: &ResourceSpec) -> Vec<String> {
        let server = format!(
            "k3s server --https-listen-port {} --write-kubeconfig-mode 644",
            spec.ports.kubernetes_port
        );
        vec![
            String::from("-d"),
            self.distribution.clone(),
            String::from("--exec"),
            String::from("/bin/sh"),
            String::from("-c"),
            server,
        ]
    }

    async fn read_ip_address(&self) -> Option<IpAddr> {
        let output = self
            .cli
            .run(&["-d", &self.distribution, "--exec", "hostname", "-I"])
            .await
            .map_err(|err| debug!("{} has no address yet: {}", self.distribution, err))
            .ok()?;
        output
            .split_whitespace()
            .find_map(|address| address.parse::<IpAddr>().ok())
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
impl VmRuntime for WslRuntime {
    async fn launch_vm(
        &mut self,
        spec: &ResourceSpec,
        _disks: &[DiskDescriptor],
    ) -> Result<Option<u32>, VmRuntimeError> {
        if matches!(self.get_status()?, VmStatus::Launched) {
            return Err(VmRuntimeError::VmAlreadyLaunched);
        }
        let args = self.boot_args(spec);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let vm = self.cli.spawn(&args).map_err(VmRuntimeError::Launch)?;
        let process_id = vm.id();
        self.vm = Some(vm);
        self.ports = Some((
            spec.ports.ssh_port,
            spec.ports.kubernetes_port,
            spec.ports.http_port,
            spec.ports.https_port,
        ));
        info!("Launched {} (pid {:?})", self.distribution, process_id);
        Ok(process_id)
    }

    async fn wait_for_endpoint(&mut self, timeout: Duration) -> Result<VmEndpoint, VmRuntimeError> {
        let (ssh_port, kubernetes_port, http_ingress_port, https_ingress_port) =
            self.ports.ok_or(VmRuntimeError::VmNotLaunched)?;
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(exit_status) = self.exit_status()? {
                return Err(VmRuntimeError::ExitedEarly(exit_status));
            }
            if let Some(ip_address) = self.read_ip_address().await {
                return Ok(VmEndpoint {
                    ip_address,
                    ssh_port,
                    kubernetes_port,
                    http_ingress_port,
                    https_ingress_port,
                });
            }
            if Instant::now() >= deadline {
                return Err(VmRuntimeError::EndpointTimeout(timeout.as_secs()));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn read_cluster_credentials(&mut self) -> Result<Option<String>, VmRuntimeError> {
        match self
            .cli
            .run(&["-d", &self.distribution, "--exec", "cat", CLUSTER_CREDENTIALS_PATH])
            .await
        {
            Ok(credentials) if !credentials.trim().is_empty() => Ok(Some(credentials)),
            Ok(_) => Ok(None),
            Err(err) => {
                debug!("No cluster credentials in {}: {}", self.distribution, err);
                Ok(None)
            }
        }
    }

    async fn shutdown(&mut self) -> Result<(), VmRuntimeError> {
        let mut vm = self.vm.take().ok_or(VmRuntimeError::VmNotLaunched)?;
        self.ports = None;
        self.cli
            .terminate(&self.distribution)
            .await
            .map_err(VmRuntimeError::Shutdown)?;
        vm.shutdown(self.shutdown_grace)
            .await
            .map_err(|err| VmRuntimeError::Shutdown(err.to_string()))
    }

    async fn kill(&mut self) -> Result<(), VmRuntimeError> {
        let mut vm = self.vm.take().ok_or(VmRuntimeError::VmNotLaunched)?;
        self.ports = None;
        if let Err(err) = self.cli.terminate(&self.distribution).await {
            warn!("Can't terminate {}: {}", self.distribution, err);
        }
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
