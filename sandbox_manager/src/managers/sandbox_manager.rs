use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::Mutex;

use super::{
    planner::{ResourcePlan, ResourcePlanner, StoragePlacement},
    resources::{HostSnapshot, ResourceSpec},
    sandbox::{
        Sandbox, SandboxError, VirtualMachineCreator, VirtualMachineDescription,
        VmProvisioningRequest,
    },
    virtual_disk::{DiskFunction, DiskLayout, VirtualDisk},
    virtual_machine::{State, VirtualMachine, VirtualMachineError, VmDisks},
};
use crate::host::HostProbe;
use crate::storage::{
    config_store::{
        ConfigStore, ConfigStoreError, HostDirectory, HostDirectoryFunction, InstanceState,
        RelocationOutcome, VirtualMachineConfig, VirtualMachineInstance,
    },
    download_cache::{ArtifactFetcher, ArtifactRequest, DownloadCache, ProgressObserver},
};
use crate::ui::{ProvisioningUi, UiProgress};

type SharedVm = Arc<Mutex<Box<dyn VirtualMachine + Send + Sync>>>;

fn storage_error(err: ConfigStoreError) -> SandboxError {
    match err {
        ConfigStoreError::NoSuchVmConfig(name) => SandboxError::NoSuchVm(name),
        ConfigStoreError::AlreadyExists(name) => SandboxError::AlreadyExists(name),
        err => SandboxError::Storage(err.to_string()),
    }
}

fn vm_error(err: VirtualMachineError) -> SandboxError {
    match err {
        VirtualMachineError::UnsupportedAction(reason) => SandboxError::Conflict(reason),
        VirtualMachineError::DiskOperation(reason) => SandboxError::Disk(reason),
        err => SandboxError::VirtualMachine(err.to_string()),
    }
}

fn validate_name(name: &str) -> Result<(), SandboxError> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-');
    if valid {
        Ok(())
    } else {
        Err(SandboxError::InvalidName(name.to_string()))
    }
}

fn progress_for<'a>(
    ui: &'a dyn ProvisioningUi,
) -> impl Fn(&ArtifactRequest) -> Box<dyn ProgressObserver + 'a> {
    move |artifact| Box::new(UiProgress::new(ui, &artifact.cache_key))
}

/// Keeps a machine name taken while it is being provisioned.
struct NameReservation<'a> {
    pending: &'a std::sync::Mutex<HashSet<String>>,
    name: String,
}

impl<'a> NameReservation<'a> {
    fn take(
        pending: &'a std::sync::Mutex<HashSet<String>>,
        name: &str,
    ) -> Result<Self, SandboxError> {
        let mut names = pending
            .lock()
            .map_err(|err| SandboxError::Conflict(err.to_string()))?;
        if !names.insert(name.to_string()) {
            return Err(SandboxError::AlreadyExists(name.to_string()));
        }
        Ok(Self {
            pending,
            name: name.to_string(),
        })
    }
}

impl Drop for NameReservation<'_> {
    fn drop(&mut self) {
        if let Ok(mut names) = self.pending.lock() {
            names.remove(&self.name);
        }
    }
}

pub struct SandboxManager {
    store: Arc<ConfigStore>,
    planner: ResourcePlanner,
    host_probe: Box<dyn HostProbe>,
    creator: Box<dyn VirtualMachineCreator + Send + Sync>,
    fetcher: Arc<dyn ArtifactFetcher>,
    machines: Mutex<HashMap<String, SharedVm>>,
    // Serializes the check of host resources with recording the new instance.
    admission: Mutex<()>,
    pending_creations: std::sync::Mutex<HashSet<String>>,
}

impl SandboxManager {
    /// Rebuilds every configured machine from what its backend still has and
    /// closes the instances left behind by processes that are gone.
    pub async fn load(
        store: Arc<ConfigStore>,
        planner: ResourcePlanner,
        host_probe: Box<dyn HostProbe>,
        creator: Box<dyn VirtualMachineCreator + Send + Sync>,
        fetcher: Arc<dyn ArtifactFetcher>,
    ) -> Result<Self, SandboxError> {
        let placement = store.storage_placement().await.map_err(storage_error)?;
        let mut machines = HashMap::new();
        for config in store.list_vm_configs().await {
            match Self::restore_vm(creator.as_ref(), &config, &placement).await {
                Ok(vm) => {
                    machines.insert(config.name.clone(), Arc::new(Mutex::new(vm)));
                }
                Err(SandboxError::UnsupportedBackend(backend)) => {
                    warn!(
                        "Skipping virtual machine {}: backend {} is not available.",
                        config.name, backend
                    );
                }
                Err(err) => return Err(err),
            }
        }

        let manager = SandboxManager {
            store,
            planner,
            host_probe,
            creator,
            fetcher,
            machines: Mutex::new(machines),
            admission: Mutex::new(()),
            pending_creations: std::sync::Mutex::new(HashSet::new()),
        };
        for instance in manager.store.active_instances().await {
            if manager.is_owned_elsewhere(&instance) {
                debug!(
                    "Instance of {} is still running as process {:?}",
                    instance.vm_name, instance.process_id
                );
                continue;
            }
            manager
                .close_instance(&instance, "The sandbox stopped while the instance was active.")
                .await?;
        }
        Ok(manager)
    }

    async fn restore_vm(
        creator: &(dyn VirtualMachineCreator + Send + Sync),
        config: &VirtualMachineConfig,
        placement: &StoragePlacement,
    ) -> Result<Box<dyn VirtualMachine + Send + Sync>, SandboxError> {
        let layout = DiskLayout::new(placement.clone(), &config.spec);
        let provider = creator.disk_provider(config.backend, &layout)?;
        let mut disks = VmDisks::new();
        for function in DiskFunction::ALL {
            match provider.try_find_by_name(&config.name, function).await {
                Ok(Some(disk)) => {
                    disks.insert(function, disk);
                }
                Ok(None) => warn!("Disk {} of {} is missing.", function, config.name),
                Err(err) => warn!("Can't look up disk {} of {}: {}", function, config.name, err),
            }
        }
        let state = if disks.len() == DiskFunction::ALL.len() {
            State::Stopped
        } else {
            State::Failed
        };
        creator.create_vm(&config.name, config.backend, disks, state)
    }

    async fn machine(&self, name: &str) -> Result<SharedVm, SandboxError> {
        if let Some(vm) = self.machines.lock().await.get(name) {
            return Ok(vm.clone());
        }
        match self.store.get_vm_config(name).await {
            Ok(config) => Err(SandboxError::UnsupportedBackend(config.backend)),
            Err(_) => Err(SandboxError::NoSuchVm(name.to_string())),
        }
    }

    async fn snapshot(&self, placement: &StoragePlacement) -> Result<HostSnapshot, SandboxError> {
        let dirs: Vec<PathBuf> = DiskFunction::ALL
            .iter()
            .map(|function| placement.dir(*function).to_path_buf())
            .collect();
        self.host_probe
            .snapshot(&dirs)
            .await
            .map_err(|err| SandboxError::Host(err.to_string()))
    }

    fn is_owned_elsewhere(&self, instance: &VirtualMachineInstance) -> bool {
        instance
            .process_id
            .is_some_and(|pid| self.host_probe.is_process_alive(pid))
    }

    async fn active_instance(&self, name: &str) -> Option<VirtualMachineInstance> {
        self.store
            .last_instance(name)
            .await
            .filter(|instance| instance.state.is_active())
    }

    async fn close_instance(
        &self,
        instance: &VirtualMachineInstance,
        message: &str,
    ) -> Result<VirtualMachineInstance, SandboxError> {
        let next_state = match instance.state {
            InstanceState::Starting => InstanceState::Failed,
            _ => InstanceState::Killed,
        };
        info!(
            "Closing instance of {} as {:?}: {}",
            instance.vm_name, next_state, message
        );
        self.store
            .update_instance(&instance.vm_name, &instance.started_at, next_state, |record| {
                record.execution_messages.push(message.to_string())
            })
            .await
            .map_err(storage_error)
    }

    /// Brings the machine and its recorded instance in line with the backend.
    async fn reconcile(
        &self,
        name: &str,
        vm: &mut (dyn VirtualMachine + Send + Sync),
    ) -> Result<State, SandboxError> {
        let before = vm.get_data().state;
        let state = vm.refresh_state().await.map_err(vm_error)?;
        if matches!(state, State::Starting | State::Running | State::Stopping) {
            return Ok(state);
        }
        if let Some(instance) = self.active_instance(name).await {
            if before == State::Running {
                let reason = vm
                    .get_data()
                    .failure
                    .unwrap_or_else(|| String::from("Virtual machine exited."));
                self.close_instance(&instance, &reason).await?;
            } else if !self.is_owned_elsewhere(&instance) {
                self.close_instance(&instance, "Virtual machine process is gone.")
                    .await?;
            }
        }
        Ok(state)
    }

    /// Decides the shape a start actually gets: the requested one when it
    /// fits, otherwise compute lowered to what is left but never below the
    /// minimum tier.
    fn admit(
        &self,
        snapshot: &HostSnapshot,
        committed: &[ResourceSpec],
        requested: &ResourceSpec,
        placement: &StoragePlacement,
    ) -> Result<(ResourceSpec, Vec<String>), SandboxError> {
        let planning_error = |err: super::planner::PlannerError| SandboxError::Planning(err.to_string());
        let infeasibility = match self
            .planner
            .check(snapshot, committed, requested, None)
            .map_err(planning_error)?
        {
            Ok(()) => return Ok((requested.clone(), vec![])),
            Err(infeasibility) => infeasibility,
        };
        let plan = self
            .planner
            .plan(snapshot, committed, placement, requested.gpu_model.as_deref())
            .map_err(planning_error)?;
        let (granted, adjustments) = self.planner.fit_to_maximum(requested, &plan.maximum);
        let minimum = &self.planner.policy().minimum;
        if granted.processors < minimum.processors || granted.memory_gb < minimum.memory_gb {
            return Err(SandboxError::Infeasible(infeasibility));
        }
        self.planner
            .check(snapshot, committed, &granted, None)
            .map_err(planning_error)?
            .map_err(SandboxError::Infeasible)?;
        Ok((granted, adjustments))
    }

    async fn stage_artifacts(
        &self,
        request: &VmProvisioningRequest,
        ui: &dyn ProvisioningUi,
    ) -> Result<Vec<PathBuf>, SandboxError> {
        let directory = self
            .store
            .host_directory(HostDirectoryFunction::DownloadCache)
            .await
            .map_err(storage_error)?;
        let cache = DownloadCache::new(directory, self.fetcher.clone());
        let mut requests = vec![request.os_image.clone()];
        requests.extend(request.artifacts.iter().cloned());
        cache
            .get_or_fetch_all(&requests, progress_for(ui))
            .await
            .map_err(|err| SandboxError::Download(err.to_string()))
    }

    async fn provision_disk(
        &self,
        request: &VmProvisioningRequest,
        function: DiskFunction,
        os_image: &Path,
        provider: &(dyn super::virtual_disk::DiskProvider + Send + Sync),
        ui: &dyn ProvisioningUi,
    ) -> Result<Box<dyn VirtualDisk + Send + Sync>, SandboxError> {
        let size_gb = request.spec.disk_size_gb(function);
        let disk_error = |err: super::virtual_disk::VirtualDiskError| SandboxError::Disk(err.to_string());
        if let Some(mut disk) = provider
            .try_find_by_name(&request.name, function)
            .await
            .map_err(disk_error)?
        {
            ui.display_message(&format!(
                "Reusing existing {} disk {:?}.",
                function,
                disk.descriptor().storage_path
            ));
            if disk.descriptor().max_size_gb < size_gb {
                disk.resize(size_gb).await.map_err(disk_error)?;
            }
            return Ok(disk);
        }

        let command = format!(
            "create {} disk of {} ({} GB)",
            function, request.name, size_gb
        );
        ui.display_command_launch(&command);
        let created = match function {
            DiskFunction::Os => {
                provider
                    .create_from_image(&request.name, os_image, size_gb)
                    .await
            }
            _ => provider.create_blank(&request.name, function, size_gb).await,
        };
        match created {
            Ok(disk) => {
                ui.display_command_result(
                    &command,
                    true,
                    &disk.descriptor().storage_path.display().to_string(),
                );
                Ok(disk)
            }
            Err(err) => {
                ui.display_command_result(&command, false, &err.to_string());
                Err(disk_error(err))
            }
        }
    }

    async fn finish_instance(
        &self,
        name: &str,
        instance: &VirtualMachineInstance,
        next_state: InstanceState,
    ) -> Result<VirtualMachineInstance, SandboxError> {
        self.store
            .update_instance(name, &instance.started_at, next_state, |_| {})
            .await
            .map_err(storage_error)
    }

    async fn describe(
        &self,
        name: &str,
        vm: &(dyn VirtualMachine + Send + Sync),
    ) -> Result<VirtualMachineDescription, SandboxError> {
        Ok(VirtualMachineDescription {
            config: self.store.get_vm_config(name).await.map_err(storage_error)?,
            data: vm.get_data(),
            last_instance: self.store.last_instance(name).await,
        })
    }

    /// Stops or kills an instance run by another sandbox process.
    async fn signal_foreign_instance(
        &self,
        name: &str,
        graceful: bool,
    ) -> Result<VirtualMachineInstance, SandboxError> {
        let instance = self.active_instance(name).await.ok_or_else(|| {
            SandboxError::Conflict(format!("Virtual machine '{}' is not running.", name))
        })?;
        let pid = match instance.process_id {
            Some(pid)
                if instance.state == InstanceState::Running
                    && self.is_owned_elsewhere(&instance) =>
            {
                pid
            }
            _ => {
                return Err(SandboxError::Conflict(format!(
                    "Virtual machine '{}' is {:?} and can't be reached.",
                    name, instance.state
                )))
            }
        };
        self.host_probe
            .signal_process(pid, graceful)
            .map_err(|err| SandboxError::Host(err.to_string()))?;
        let next_state = if graceful {
            InstanceState::Stopped
        } else {
            InstanceState::Killed
        };
        self.finish_instance(name, &instance, next_state).await
    }
}

#[async_trait]
impl Sandbox for SandboxManager {
    async fn plan_resources(
        &self,
        preferred_gpu_model: Option<&str>,
    ) -> Result<ResourcePlan, SandboxError> {
        let placement = self.store.storage_placement().await.map_err(storage_error)?;
        let snapshot = self.snapshot(&placement).await?;
        let committed = self.store.committed_resources(None).await;
        self.planner
            .plan(&snapshot, &committed, &placement, preferred_gpu_model)
            .map_err(|err| SandboxError::Planning(err.to_string()))
    }

    async fn create_vm(
        &self,
        request: VmProvisioningRequest,
        ui: &dyn ProvisioningUi,
    ) -> Result<VirtualMachineDescription, SandboxError> {
        validate_name(&request.name)?;
        let _reservation = NameReservation::take(&self.pending_creations, &request.name)?;
        if self.machines.lock().await.contains_key(&request.name)
            || self.store.get_vm_config(&request.name).await.is_ok()
        {
            return Err(SandboxError::AlreadyExists(request.name));
        }

        ui.display_step("Checking host resources");
        let placement = self.store.storage_placement().await.map_err(storage_error)?;
        let snapshot = self.snapshot(&placement).await?;
        self.planner
            .check(&snapshot, &[], &request.spec, Some(&placement))
            .map_err(|err| SandboxError::Planning(err.to_string()))?
            .map_err(SandboxError::Infeasible)?;
        let mut request = request;
        for function in DiskFunction::ALL {
            let is_ssd = snapshot
                .drive_for(placement.dir(function))
                .is_some_and(|drive| drive.is_ssd);
            request.spec.set_disk_is_ssd(function, is_ssd);
        }

        ui.display_step("Downloading artifacts");
        let staged = self.stage_artifacts(&request, ui).await?;
        let os_image = staged
            .first()
            .cloned()
            .ok_or_else(|| SandboxError::Download(String::from("OS image wasn't staged")))?;

        ui.display_step("Creating virtual disks");
        let layout = DiskLayout::new(placement, &request.spec);
        let provider = self.creator.disk_provider(request.backend, &layout)?;
        let mut disks = VmDisks::new();
        for function in DiskFunction::ALL {
            let disk = self
                .provision_disk(&request, function, &os_image, provider.as_ref(), ui)
                .await?;
            disks.insert(function, disk);
        }

        ui.display_step("Registering virtual machine");
        // Images and reused disks may be larger than requested.
        for (function, disk) in &disks {
            request
                .spec
                .set_disk_size_gb(*function, disk.descriptor().max_size_gb);
        }
        let disk_paths: BTreeMap<DiskFunction, PathBuf> = disks
            .iter()
            .map(|(function, disk)| (*function, disk.descriptor().storage_path.clone()))
            .collect();
        let vm = self
            .creator
            .create_vm(&request.name, request.backend, disks, State::Stopped)?;
        let now = Utc::now();
        let config = VirtualMachineConfig {
            name: request.name.clone(),
            backend: request.backend,
            spec: request.spec.clone(),
            disk_paths,
            created_at: now,
            updated_at: now,
        };
        self.store
            .add_vm_config(config.clone())
            .await
            .map_err(storage_error)?;
        let description = VirtualMachineDescription {
            config,
            data: vm.get_data(),
            last_instance: None,
        };
        self.machines
            .lock()
            .await
            .insert(request.name.clone(), Arc::new(Mutex::new(vm)));
        info!("Virtual machine {} created", request.name);
        Ok(description)
    }

    async fn start_vm(
        &self,
        name: &str,
        override_spec: Option<ResourceSpec>,
        ui: &dyn ProvisioningUi,
    ) -> Result<VirtualMachineInstance, SandboxError> {
        let vm = self.machine(name).await?;
        let mut vm = vm.lock().await;
        let state = self.reconcile(name, vm.as_mut()).await?;
        if state != State::Stopped && state != State::Failed {
            return Err(SandboxError::Conflict(format!(
                "Can't start virtual machine '{}' that is in {:?} state.",
                name, state
            )));
        }
        if let Some(instance) = self.active_instance(name).await {
            return Err(SandboxError::Conflict(format!(
                "Virtual machine '{}' is already {:?} in process {:?}.",
                name, instance.state, instance.process_id
            )));
        }
        let config = self.store.get_vm_config(name).await.map_err(storage_error)?;
        let requested = override_spec.unwrap_or(config.spec);

        ui.display_step("Checking host resources");
        let instance = {
            let _admission = self.admission.lock().await;
            let placement = self.store.storage_placement().await.map_err(storage_error)?;
            let snapshot = self.snapshot(&placement).await?;
            let committed = self.store.committed_resources(Some(name)).await;
            let (granted, adjustments) =
                self.admit(&snapshot, &committed, &requested, &placement)?;
            let mut instance = VirtualMachineInstance::starting(name, granted, adjustments);
            // Until the machine runs, the instance belongs to this process.
            instance.process_id = Some(std::process::id());
            self.store
                .add_instance(instance.clone())
                .await
                .map_err(storage_error)?;
            instance
        };
        for adjustment in &instance.adjustments {
            ui.display_message(adjustment);
        }

        ui.display_step(&format!("Starting virtual machine {}", name));
        match vm.start(&instance.granted).await {
            Ok(started) => {
                let running = self
                    .store
                    .update_instance(name, &instance.started_at, InstanceState::Running, |record| {
                        record.process_id = started.process_id;
                        record.ip_address = Some(started.endpoint.ip_address);
                        record.cluster_credentials = started.cluster_credentials.clone();
                    })
                    .await
                    .map_err(storage_error)?;
                self.store
                    .update_vm_config(name, |_| {})
                    .await
                    .map_err(storage_error)?;
                ui.display_message(&format!(
                    "Virtual machine {} is running at {} (ssh port {}, kubernetes port {}).",
                    name,
                    started.endpoint.ip_address,
                    started.endpoint.ssh_port,
                    started.endpoint.kubernetes_port
                ));
                Ok(running)
            }
            Err(err) => {
                let message = err.to_string();
                if let Err(store_err) = self
                    .store
                    .update_instance(name, &instance.started_at, InstanceState::Failed, |record| {
                        record.execution_messages.push(message)
                    })
                    .await
                {
                    warn!("Can't record failed start of {}: {}", name, store_err);
                }
                Err(vm_error(err))
            }
        }
    }

    async fn stop_vm(&self, name: &str) -> Result<VirtualMachineInstance, SandboxError> {
        let vm = self.machine(name).await?;
        let mut vm = vm.lock().await;
        if self.reconcile(name, vm.as_mut()).await? != State::Running {
            return self.signal_foreign_instance(name, true).await;
        }
        vm.stop().await.map_err(vm_error)?;
        let instance = self.active_instance(name).await.ok_or_else(|| {
            SandboxError::Storage(format!("No active instance of '{}' is recorded.", name))
        })?;
        self.finish_instance(name, &instance, InstanceState::Stopped)
            .await
    }

    async fn kill_vm(&self, name: &str) -> Result<VirtualMachineInstance, SandboxError> {
        let vm = self.machine(name).await?;
        let mut vm = vm.lock().await;
        let state = self.reconcile(name, vm.as_mut()).await?;
        if state != State::Running && state != State::Stopping {
            return self.signal_foreign_instance(name, false).await;
        }
        vm.kill().await.map_err(vm_error)?;
        let instance = self.active_instance(name).await.ok_or_else(|| {
            SandboxError::Storage(format!("No active instance of '{}' is recorded.", name))
        })?;
        self.finish_instance(name, &instance, InstanceState::Killed)
            .await
    }

    async fn resize_vm(
        &self,
        name: &str,
        disk_sizes_gb: BTreeMap<DiskFunction, u32>,
    ) -> Result<VirtualMachineConfig, SandboxError> {
        let vm = self.machine(name).await?;
        let mut vm = vm.lock().await;
        self.reconcile(name, vm.as_mut()).await?;
        if self.active_instance(name).await.is_some() {
            return Err(SandboxError::Conflict(format!(
                "Virtual machine '{}' has to be stopped to resize its disks.",
                name
            )));
        }
        let config = self.store.get_vm_config(name).await.map_err(storage_error)?;
        let actual_sizes: BTreeMap<DiskFunction, u32> = vm
            .get_data()
            .disks
            .iter()
            .map(|disk| (disk.function, disk.max_size_gb))
            .collect();
        let mut spec = config.spec.clone();
        let mut growth = config.spec.clone();
        for function in DiskFunction::ALL {
            let current_gb = actual_sizes
                .get(&function)
                .copied()
                .unwrap_or_default()
                .max(config.spec.disk_size_gb(function));
            let requested_gb = disk_sizes_gb.get(&function).copied().unwrap_or(current_gb);
            spec.set_disk_size_gb(function, requested_gb);
            growth.set_disk_size_gb(function, requested_gb.saturating_sub(current_gb));
        }

        let placement = self.store.storage_placement().await.map_err(storage_error)?;
        let snapshot = self.snapshot(&placement).await?;
        self.planner
            .check_disk_growth(&snapshot, &growth, &placement)
            .map_err(|err| SandboxError::Planning(err.to_string()))?
            .map_err(SandboxError::Infeasible)?;
        vm.resize_disks(&spec).await.map_err(vm_error)?;
        self.store
            .update_vm_config(name, |config| config.spec = spec)
            .await
            .map_err(storage_error)
    }

    async fn delete_vm(&self, name: &str, ui: &dyn ProvisioningUi) -> Result<usize, SandboxError> {
        let vm = self.machine(name).await?;
        let mut vm = vm.lock().await;
        let state = self.reconcile(name, vm.as_mut()).await?;
        if matches!(state, State::Starting | State::Running | State::Stopping)
            || self.active_instance(name).await.is_some()
        {
            return Err(SandboxError::Conflict(format!(
                "Can't delete virtual machine '{}' while it runs.",
                name
            )));
        }
        let confirmed = ui
            .ask_yes_no(&format!(
                "Delete virtual machine '{}' together with its disks and history?",
                name
            ))
            .await
            .map_err(|err| SandboxError::Ui(err.to_string()))?;
        if !confirmed {
            return Err(SandboxError::Cancelled(format!(
                "Virtual machine '{}' was kept.",
                name
            )));
        }

        ui.display_step(&format!("Deleting virtual machine {}", name));
        vm.delete().await.map_err(vm_error)?;
        let removed = self
            .store
            .delete_vm_config(name)
            .await
            .map_err(storage_error)?;
        self.machines.lock().await.remove(name);
        info!("Virtual machine {} deleted with {} instances", name, removed);
        Ok(removed)
    }

    async fn inspect_vm(&self, name: &str) -> Result<VirtualMachineDescription, SandboxError> {
        let vm = self.machine(name).await?;
        let mut vm = vm.lock().await;
        self.reconcile(name, vm.as_mut()).await?;
        self.describe(name, vm.as_ref()).await
    }

    async fn list_vms(&self) -> Vec<VirtualMachineDescription> {
        let mut machines: Vec<(String, SharedVm)> = self
            .machines
            .lock()
            .await
            .iter()
            .map(|(name, vm)| (name.clone(), vm.clone()))
            .collect();
        machines.sort_by(|left, right| left.0.cmp(&right.0));
        let mut descriptions = vec![];
        for (name, vm) in machines {
            let mut vm = vm.lock().await;
            if let Err(err) = self.reconcile(&name, vm.as_mut()).await {
                warn!("Can't refresh {}: {}", name, err);
            }
            match self.describe(&name, vm.as_ref()).await {
                Ok(description) => descriptions.push(description),
                Err(err) => warn!("Can't describe {}: {}", name, err),
            }
        }
        descriptions
    }

    async fn vm_history(&self, name: &str) -> Result<Vec<VirtualMachineInstance>, SandboxError> {
        self.store.get_vm_config(name).await.map_err(storage_error)?;
        Ok(self.store.list_instances(name).await)
    }

    async fn move_storage_location(
        &self,
        function: HostDirectoryFunction,
        new_path: &Path,
        ui: &dyn ProvisioningUi,
    ) -> Result<RelocationOutcome, SandboxError> {
        let mut machines: Vec<(String, SharedVm)> = self
            .machines
            .lock()
            .await
            .iter()
            .map(|(name, vm)| (name.clone(), vm.clone()))
            .collect();
        machines.sort_by(|left, right| left.0.cmp(&right.0));

        let mut locked = vec![];
        if function.disk_function().is_some() {
            for (name, vm) in machines {
                let mut vm = vm.lock_owned().await;
                let state = self.reconcile(&name, vm.as_mut()).await?;
                if matches!(state, State::Starting | State::Running | State::Stopping) {
                    return Err(SandboxError::Conflict(format!(
                        "Virtual machine '{}' must be stopped before its storage moves.",
                        name
                    )));
                }
                locked.push((name, vm));
            }
            if let Some(instance) = self.store.active_instances().await.first() {
                return Err(SandboxError::Conflict(format!(
                    "Virtual machine '{}' is {:?} in another process.",
                    instance.vm_name, instance.state
                )));
            }
        }

        ui.display_step(&format!("Moving {} to {}", function, new_path.display()));
        let outcome = self
            .store
            .move_storage_location(function, new_path)
            .await
            .map_err(storage_error)?;
        match &outcome {
            RelocationOutcome::Unchanged => {
                ui.display_message(&format!("{} already lives in {}.", function, new_path.display()))
            }
            RelocationOutcome::Moved { files_moved, .. } => {
                ui.display_message(&format!("Moved {} files.", files_moved));
                let placement = self.store.storage_placement().await.map_err(storage_error)?;
                for (name, vm) in locked.iter_mut() {
                    let config = self.store.get_vm_config(name).await.map_err(storage_error)?;
                    if let Some(disk_function) = function.disk_function() {
                        let layout = DiskLayout::new(placement.clone(), &config.spec);
                        self.creator
                            .disk_provider(config.backend, &layout)?
                            .adopt_relocated(name, disk_function)
                            .await
                            .map_err(|err| SandboxError::Disk(err.to_string()))?;
                    }
                    **vm = Self::restore_vm(self.creator.as_ref(), &config, &placement).await?;
                }
            }
            RelocationOutcome::Interrupted {
                files_moved,
                reason,
                from,
                ..
            } => ui.display_message(&format!(
                "Move stopped after {} files: {}. {} is still used, run the move again to finish it.",
                files_moved,
                reason,
                from.display()
            )),
        }
        Ok(outcome)
    }

    async fn host_directories(&self) -> Vec<HostDirectory> {
        self.store.host_directories().await
    }
}
