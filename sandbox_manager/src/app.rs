use std::{collections::BTreeMap, sync::Arc, time::Duration};

use anyhow::Error;
use log::{debug, info, warn};
use tokio::select;

use super::cli::{Cli, Command, ResourceArgs};
use super::fabric::{
    sandbox_fabric::SandboxFabric,
    vm_fabric::{QemuSettings, VirtualMachineFabric, WslSettings},
};
use super::host::LinuxHostProbe;
use super::managers::{
    planner::ResourcePlan,
    sandbox::{Sandbox, VirtualMachineDescription, VmProvisioningRequest},
    virtual_disk::DiskFunction,
    virtual_machine::{Backend, State},
};
use super::storage::{download_cache::ArtifactRequest, http_fetcher::HttpFetcher};
use super::ui::{ConsoleUi, ProvisioningUi};
use super::virtualization::command::{CommandRunner, HostCommandRunner};

const FOREGROUND_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub struct App {
    sandbox: Box<dyn Sandbox + Send + Sync>,
    ui: ConsoleUi,
    command: Command,
}

impl App {
    pub async fn new(cli: Cli) -> anyhow::Result<Self, Error> {
        let runner: Arc<dyn CommandRunner> = Arc::new(HostCommandRunner);
        let qemu = match (cli.qemu_path, cli.qemu_img_path) {
            (Some(qemu), Some(qemu_img)) => Some(QemuSettings { qemu, qemu_img }),
            (None, None) => None,
            _ => {
                warn!("QEMU needs both --qemu-path and --qemu-img-path, the backend is disabled.");
                None
            }
        };
        let wsl = match (cli.wsl_path, cli.wsl_helper_image) {
            (Some(wsl), Some(helper_image)) => Some(WslSettings { wsl, helper_image }),
            (None, None) => None,
            _ => {
                warn!("WSL needs both --wsl-path and --wsl-helper-image, the backend is disabled.");
                None
            }
        };
        let vm_fabric = VirtualMachineFabric::new(
            qemu,
            wsl,
            Duration::from_secs(cli.endpoint_wait_time_secs),
            Duration::from_secs(cli.shutdown_grace_secs),
            runner.clone(),
        );
        let host_probe = LinuxHostProbe::new(cli.nvidia_smi_path, runner);
        let fetcher = HttpFetcher::new(Duration::from_secs(cli.connect_timeout_secs))?;
        let sandbox = SandboxFabric::create_sandbox(
            &cli.home_dir,
            Box::new(vm_fabric),
            Box::new(host_probe),
            Arc::new(fetcher),
        )
        .await?;
        let ui = if cli.assume_yes {
            ConsoleUi::assume_yes()
        } else {
            ConsoleUi::default()
        };
        Ok(Self {
            sandbox,
            ui,
            command: cli.command,
        })
    }

    pub async fn run(self) -> anyhow::Result<(), Error> {
        let sandbox = self.sandbox.as_ref();
        let ui = &self.ui;
        match self.command {
            Command::Plan { gpu_model } => {
                let plan = sandbox.plan_resources(gpu_model.as_deref()).await?;
                display_plan(ui, &plan);
            }
            Command::Create {
                name,
                backend,
                image_url,
                artifact,
                resources,
            } => {
                let request = create_request(
                    sandbox,
                    ui,
                    name,
                    backend.into(),
                    &image_url,
                    &artifact,
                    &resources,
                )
                .await?;
                let description = sandbox.create_vm(request, ui).await?;
                display_description(ui, &description);
            }
            Command::Start {
                name,
                processors,
                memory_gb,
            } => {
                let override_spec = if processors.is_some() || memory_gb.is_some() {
                    let config = sandbox.inspect_vm(&name).await?.config;
                    let args = ResourceArgs {
                        processors,
                        memory_gb,
                        ..Default::default()
                    };
                    Some(args.apply_to(config.spec))
                } else {
                    None
                };
                sandbox.start_vm(&name, override_spec, ui).await?;
                run_in_foreground(sandbox, ui, &name).await?;
            }
            Command::Stop { name } => {
                let instance = sandbox.stop_vm(&name).await?;
                ui.display_message(&format!("Virtual machine {} is {:?}.", name, instance.state));
            }
            Command::Kill { name } => {
                let instance = sandbox.kill_vm(&name).await?;
                ui.display_message(&format!("Virtual machine {} is {:?}.", name, instance.state));
            }
            Command::Resize {
                name,
                os_disk_gb,
                cluster_disk_gb,
                data_disk_gb,
            } => {
                let sizes: BTreeMap<DiskFunction, u32> = [
                    (DiskFunction::Os, os_disk_gb),
                    (DiskFunction::Cluster, cluster_disk_gb),
                    (DiskFunction::Data, data_disk_gb),
                ]
                .into_iter()
                .filter_map(|(function, size)| size.map(|size| (function, size)))
                .collect();
                let config = sandbox.resize_vm(&name, sizes).await?;
                ui.display_message(&format!(
                    "Disks of {}: os {} GB, cluster {} GB, data {} GB.",
                    name,
                    config.spec.os_disk_gb,
                    config.spec.cluster_disk_gb,
                    config.spec.data_disk_gb
                ));
            }
            Command::Delete { name } => {
                let removed = sandbox.delete_vm(&name, ui).await?;
                ui.display_message(&format!(
                    "Virtual machine {} deleted together with {} history records.",
                    name, removed
                ));
            }
            Command::List => {
                for description in sandbox.list_vms().await {
                    ui.display_message(&format!(
                        "{:<24} {:<24} {:?}",
                        description.config.name,
                        description.config.backend,
                        description.state()
                    ));
                }
            }
            Command::Inspect { name } => {
                display_description(ui, &sandbox.inspect_vm(&name).await?);
            }
            Command::History { name } => {
                for instance in sandbox.vm_history(&name).await? {
                    let stopped_at = instance
                        .stopped_at
                        .map(|stopped_at| stopped_at.to_rfc3339())
                        .unwrap_or_else(|| String::from("-"));
                    ui.display_message(&format!(
                        "{} .. {} {:?} cpu {} memory {} GB {}",
                        instance.started_at.to_rfc3339(),
                        stopped_at,
                        instance.state,
                        instance.granted.processors,
                        instance.granted.memory_gb,
                        instance.execution_messages.join("; ")
                    ));
                }
            }
            Command::Dirs => {
                for directory in sandbox.host_directories().await {
                    ui.display_message(&format!(
                        "{:<16} {}",
                        directory.function,
                        directory.path.display()
                    ));
                }
            }
            Command::MoveStorage { function, path } => {
                sandbox
                    .move_storage_location(function.into(), &path, ui)
                    .await?;
            }
        }
        Ok(())
    }
}

async fn create_request(
    sandbox: &(dyn Sandbox + Send + Sync),
    ui: &dyn ProvisioningUi,
    name: String,
    backend: Backend,
    image_url: &str,
    artifacts: &[String],
    resources: &ResourceArgs,
) -> anyhow::Result<VmProvisioningRequest, Error> {
    let plan = sandbox
        .plan_resources(resources.gpu_model.as_deref())
        .await?;
    if !plan.recommended_feasible {
        ui.display_message(&format!(
            "This host can't run the recommended machine: {}",
            plan.recommended_reason.as_deref().unwrap_or_default()
        ));
    }
    Ok(VmProvisioningRequest {
        name,
        backend,
        spec: resources.apply_to(plan.recommended),
        os_image: ArtifactRequest::from_url(image_url),
        artifacts: artifacts
            .iter()
            .map(|url| ArtifactRequest::from_url(url))
            .collect(),
    })
}

/// Virtual machine processes die with this process, so a started machine is
/// watched until it exits or the user interrupts.
async fn run_in_foreground(
    sandbox: &(dyn Sandbox + Send + Sync),
    ui: &dyn ProvisioningUi,
    name: &str,
) -> anyhow::Result<(), Error> {
    ui.display_message("Press Ctrl-C to stop the virtual machine.");
    let mut interval = tokio::time::interval(FOREGROUND_POLL_INTERVAL);
    loop {
        select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("Interrupt received, stopping {}", name);
                ui.display_step(&format!("Stopping virtual machine {}", name));
                let instance = sandbox.stop_vm(name).await?;
                ui.display_message(&format!("Virtual machine {} is {:?}.", name, instance.state));
                return Ok(());
            }
            _ = interval.tick() => {
                let description = sandbox.inspect_vm(name).await?;
                debug!("{} is {:?}", name, description.state());
                if description.state() != State::Running {
                    let reason = description
                        .last_instance
                        .map(|instance| instance.execution_messages.join("; "))
                        .unwrap_or_default();
                    ui.display_message(&format!(
                        "Virtual machine {} exited: {}",
                        name, reason
                    ));
                    return Ok(());
                }
            }
        }
    }
}

fn display_plan(ui: &dyn ProvisioningUi, plan: &ResourcePlan) {
    let tiers = [
        (
            "minimum",
            &plan.minimum,
            Some(plan.minimum_feasible),
            &plan.minimum_reason,
        ),
        (
            "recommended",
            &plan.recommended,
            Some(plan.recommended_feasible),
            &plan.recommended_reason,
        ),
        ("maximum", &plan.maximum, None, &None),
    ];
    for (label, spec, feasible, reason) in tiers {
        let gpu = spec
            .gpu_model
            .as_ref()
            .map(|model| format!(", {} x {}", spec.gpu_count, model))
            .unwrap_or_default();
        ui.display_message(&format!(
            "{:<12} {} processors, {} GB memory, disks {}/{}/{} GB{}",
            label,
            spec.processors,
            spec.memory_gb,
            spec.os_disk_gb,
            spec.cluster_disk_gb,
            spec.data_disk_gb,
            gpu
        ));
        if let (Some(false), Some(reason)) = (feasible, reason) {
            ui.display_message(&format!("             not feasible: {}", reason));
        }
    }
}

fn display_description(ui: &dyn ProvisioningUi, description: &VirtualMachineDescription) {
    let config = &description.config;
    ui.display_message(&format!(
        "{} ({}) is {:?}",
        config.name,
        config.backend,
        description.state()
    ));
    ui.display_message(&format!(
        "  {} processors, {} GB memory",
        config.spec.processors, config.spec.memory_gb
    ));
    for (function, path) in &config.disk_paths {
        ui.display_message(&format!(
            "  {} disk {} GB at {}",
            function,
            config.spec.disk_size_gb(*function),
            path.display()
        ));
    }
    if let Some(endpoint) = &description.data.endpoint {
        ui.display_message(&format!(
            "  {} ssh {} kubernetes {} http {} https {}",
            endpoint.ip_address,
            endpoint.ssh_port,
            endpoint.kubernetes_port,
            endpoint.http_ingress_port,
            endpoint.https_ingress_port
        ));
    }
    if let Some(failure) = &description.data.failure {
        ui.display_message(&format!("  last failure: {}", failure));
    }
}
