use super::resources::ResourceSpec;
use super::virtual_disk::{check_growth, DiskDescriptor, DiskFunction};
use super::virtual_machine::{
    Backend, StartedVm, State, VirtualMachine, VirtualMachineData, VirtualMachineError, VmDisks,
    VmEndpoint,
};
use super::vm_runtime::{VmRuntime, VmRuntimeError, VmStatus};

use async_trait::async_trait;
use log::{debug, info, warn};
use std::time::Duration;

/// Backend agnostic lifecycle of one machine and its disks.
pub struct VirtualMachineManager {
    name: String,
    backend: Backend,
    state: State,
    disks: VmDisks,
    runtime: Box<dyn VmRuntime + Send + Sync>,
    endpoint_wait_time: Duration,
    granted: Option<ResourceSpec>,
    endpoint: Option<VmEndpoint>,
    failure: Option<String>,
}

impl VirtualMachineManager {
    pub fn new(
        name: String,
        backend: Backend,
        state: State,
        disks: VmDisks,
        runtime: Box<dyn VmRuntime + Send + Sync>,
        endpoint_wait_time: Duration,
    ) -> Self {
        VirtualMachineManager {
            name,
            backend,
            state,
            disks,
            runtime,
            endpoint_wait_time,
            granted: None,
            endpoint: None,
            failure: None,
        }
    }

    fn descriptors(&self) -> Vec<DiskDescriptor> {
        self.disks
            .values()
            .map(|disk| disk.descriptor().clone())
            .collect()
    }

    fn fail(&mut self, err: VirtualMachineError) -> VirtualMachineError {
        warn!("Virtual machine {} failed: {}", self.name, err);
        self.state = State::Failed;
        self.failure = Some(err.to_string());
        self.granted = None;
        self.endpoint = None;
        err
    }

    async fn start_disk_services(&mut self) -> Result<(), VirtualMachineError> {
        for disk in self.disks.values_mut() {
            if !disk.is_service_required() {
                continue;
            }
            let running = disk
                .is_service_running()
                .await
                .map_err(|err| VirtualMachineError::DiskOperation(err.to_string()))?;
            if !running {
                debug!(
                    "Starting attachment service of disk {:?}",
                    disk.descriptor().storage_path
                );
                disk.start_service()
                    .await
                    .map_err(|err| VirtualMachineError::DiskOperation(err.to_string()))?;
            }
        }
        Ok(())
    }

    async fn stop_disk_services(&mut self) {
        for disk in self.disks.values_mut() {
            if disk.is_service_required() {
                if let Err(err) = disk.stop_service().await {
                    warn!(
                        "Can't stop attachment service of disk {:?}: {}",
                        disk.descriptor().storage_path,
                        err
                    );
                }
            }
        }
    }

    async fn handle_endpoint_result(
        &mut self,
        endpoint_result: Result<VmEndpoint, VmRuntimeError>,
    ) -> Result<VmEndpoint, VirtualMachineError> {
        let err = match endpoint_result {
            Ok(endpoint) => return Ok(endpoint),
            Err(err) => err,
        };
        let reason = match self.runtime.get_status() {
            Ok(VmStatus::Exited(exit_status)) => format!("{}, {}", err, exit_status),
            Ok(VmStatus::Launched) => match self.runtime.kill().await {
                Ok(()) => err.to_string(),
                Err(kill_err) => format!("{}, cleanup failed: {}", err, kill_err),
            },
            Ok(VmStatus::NotLaunched) => {
                format!("{}, vm hasn't been launched successfully", err)
            }
            Err(status_err) => format!("{}, {}", err, status_err),
        };
        Err(self.fail(VirtualMachineError::VmStartFail(reason)))
    }
}

#[async_trait]
impl VirtualMachine for VirtualMachineManager {
    async fn start(&mut self, spec: &ResourceSpec) -> Result<StartedVm, VirtualMachineError> {
        if self.state != State::Stopped && self.state != State::Failed {
            return Err(VirtualMachineError::UnsupportedAction(format!(
                "Can't start virtual machine that is in {:?} state.",
                self.state
            )));
        }
        if let Some(missing) = DiskFunction::ALL
            .iter()
            .find(|function| !self.disks.contains_key(function))
        {
            return Err(VirtualMachineError::DiskOperation(format!(
                "Disk '{}' of virtual machine '{}' is missing.",
                missing, self.name
            )));
        }

        self.state = State::Starting;
        self.failure = None;
        if let Err(err) = self.start_disk_services().await {
            return Err(self.fail(err));
        }

        let descriptors = self.descriptors();
        let process_id = match self.runtime.launch_vm(spec, &descriptors).await {
            Ok(process_id) => process_id,
            Err(err) => {
                return Err(self.fail(VirtualMachineError::VmLaunchFail(err.to_string())));
            }
        };

        let endpoint_result = self.runtime.wait_for_endpoint(self.endpoint_wait_time).await;
        let endpoint = self.handle_endpoint_result(endpoint_result).await?;
        let cluster_credentials = self
            .runtime
            .read_cluster_credentials()
            .await
            .unwrap_or_else(|err| {
                warn!("Can't read cluster credentials of {}: {}", self.name, err);
                None
            });

        self.state = State::Running;
        self.granted = Some(spec.clone());
        self.endpoint = Some(endpoint);
        info!("Virtual machine {} is running at {}", self.name, endpoint.ip_address);
        Ok(StartedVm {
            endpoint,
            process_id,
            cluster_credentials,
        })
    }

    async fn stop(&mut self) -> Result<(), VirtualMachineError> {
        if self.state != State::Running {
            return Err(VirtualMachineError::UnsupportedAction(format!(
                "Can't stop virtual machine that is in {:?} state.",
                self.state
            )));
        }

        self.state = State::Stopping;
        if let Err(err) = self.runtime.shutdown().await {
            self.state = State::Running;
            return Err(VirtualMachineError::VmStopFail(err.to_string()));
        }
        self.stop_disk_services().await;
        self.state = State::Stopped;
        self.granted = None;
        self.endpoint = None;
        info!("Virtual machine {} stopped", self.name);
        Ok(())
    }

    async fn kill(&mut self) -> Result<(), VirtualMachineError> {
        if self.state != State::Running && self.state != State::Stopping {
            return Err(VirtualMachineError::UnsupportedAction(format!(
                "Can't kill virtual machine that is in {:?} state.",
                self.state
            )));
        }
        self.runtime
            .kill()
            .await
            .map_err(|err| VirtualMachineError::VmStopFail(err.to_string()))?;
        self.stop_disk_services().await;
        self.state = State::Stopped;
        self.granted = None;
        self.endpoint = None;
        Ok(())
    }

    async fn resize_disks(&mut self, spec: &ResourceSpec) -> Result<(), VirtualMachineError> {
        if self.state != State::Stopped && self.state != State::Failed {
            return Err(VirtualMachineError::UnsupportedAction(format!(
                "Can't resize virtual machine that is in {:?} state.",
                self.state
            )));
        }

        let mut growing = vec![];
        for (function, disk) in &self.disks {
            if check_growth(disk.descriptor().max_size_gb, spec.disk_size_gb(*function))
                .map_err(|err| VirtualMachineError::DiskOperation(err.to_string()))?
            {
                growing.push(*function);
            }
        }
        for function in growing {
            if let Some(disk) = self.disks.get_mut(&function) {
                debug!(
                    "Resizing disk {:?} to {} GB",
                    disk.descriptor().storage_path,
                    spec.disk_size_gb(function)
                );
                disk.resize(spec.disk_size_gb(function))
                    .await
                    .map_err(|err| VirtualMachineError::DiskOperation(err.to_string()))?;
            }
        }
        Ok(())
    }

    async fn delete(&mut self) -> Result<(), VirtualMachineError> {
        if matches!(
            self.state,
            State::Starting | State::Running | State::Stopping
        ) {
            return Err(VirtualMachineError::UnsupportedAction(format!(
                "Can't delete virtual machine that is in {:?} state.",
                self.state
            )));
        }

        self.stop_disk_services().await;
        for function in DiskFunction::ALL {
            if let Some(mut disk) = self.disks.remove(&function) {
                if let Err(err) = disk.delete().await {
                    self.disks.insert(function, disk);
                    return Err(self.fail(VirtualMachineError::VmDestroyFail(err.to_string())));
                }
            }
        }
        self.state = State::NotCreated;
        info!("Virtual machine {} deleted", self.name);
        Ok(())
    }

    async fn refresh_state(&mut self) -> Result<State, VirtualMachineError> {
        if self.state == State::Running {
            let status = self
                .runtime
                .get_status()
                .map_err(|err| VirtualMachineError::VmStartFail(err.to_string()))?;
            if let VmStatus::Exited(reason) = status {
                self.fail(VirtualMachineError::VmStartFail(format!(
                    "Virtual machine exited unexpectedly: {}",
                    reason
                )));
            }
        }
        Ok(self.state)
    }

    fn get_data(&self) -> VirtualMachineData {
        VirtualMachineData {
            name: self.name.clone(),
            backend: self.backend,
            state: self.state,
            granted: self.granted.clone(),
            endpoint: self.endpoint,
            disks: self.descriptors(),
            failure: self.failure.clone(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::VirtualMachineManager;
    use crate::managers::virtual_disk::{DiskFunction, VirtualDiskError};
    use crate::managers::virtual_machine::{
        Backend, State, VirtualMachine, VirtualMachineError, VmDisks,
    };
    use crate::managers::vm_runtime::{VmRuntimeError, VmStatus};
    use crate::utils::test_utilities::{
        create_example_disk, create_example_disk_descriptor, create_example_endpoint,
        create_example_spec, MockVirtualDisk, MockVmRuntime,
    };
    use parameterized::parameterized;
    use std::time::Duration;

    #[tokio::test]
    async fn start() {
        let mut manager = create_vm_manager(None, None);
        let started = manager.start(&create_example_spec()).await.unwrap();
        assert_eq!(manager.state, State::Running);
        assert_eq!(started.endpoint, create_example_endpoint());
        assert_eq!(started.process_id, Some(42));
        assert_eq!(manager.get_data().granted, Some(create_example_spec()));
    }

    #[tokio::test]
    async fn start_from_failed() {
        let mut manager = create_vm_manager(None, None);
        manager.state = State::Failed;
        assert!(manager.start(&create_example_spec()).await.is_ok());
        assert_eq!(manager.state, State::Running);
    }

    #[tokio::test]
    #[parameterized(state = {State::NotCreated, State::Starting, State::Running, State::Stopping})]
    async fn start_invalid_state(state: State) {
        let mut manager = create_vm_manager(None, None);
        manager.state = state;
        assert_eq!(
            manager.start(&create_example_spec()).await,
            Err(VirtualMachineError::UnsupportedAction(format!(
                "Can't start virtual machine that is in {:?} state.",
                state
            )))
        );
        assert_eq!(manager.state, state);
    }

    #[tokio::test]
    async fn start_with_missing_disk() {
        let mut manager = create_vm_manager(None, None);
        manager.disks.remove(&DiskFunction::Data);
        assert!(matches!(
            manager.start(&create_example_spec()).await,
            Err(VirtualMachineError::DiskOperation(_))
        ));
        assert_eq!(manager.state, State::Stopped);
    }

    #[tokio::test]
    async fn start_launch_error() {
        let mut runtime = MockVmRuntime::new();
        runtime
            .expect_launch_vm()
            .returning(|_, _| Err(VmRuntimeError::Launch(String::new())));
        let mut manager = create_vm_manager(Some(runtime), None);
        assert_eq!(
            manager.start(&create_example_spec()).await,
            Err(VirtualMachineError::VmLaunchFail(String::from(
                "Unable to launch Vm: "
            )))
        );
        assert_eq!(manager.state, State::Failed);
        assert!(manager.get_data().failure.is_some());
    }

    #[tokio::test]
    async fn start_endpoint_timeout_kills_launched_vm() {
        let mut runtime = MockVmRuntime::new();
        runtime
            .expect_wait_for_endpoint()
            .returning(|_| Err(VmRuntimeError::EndpointTimeout(1)));
        runtime
            .expect_get_status()
            .returning(|| Ok(VmStatus::Launched));
        runtime.expect_kill().times(1).returning(|| Ok(()));
        let mut manager = create_vm_manager(Some(runtime), None);
        assert!(matches!(
            manager.start(&create_example_spec()).await,
            Err(VirtualMachineError::VmStartFail(_))
        ));
        assert_eq!(manager.state, State::Failed);
        assert_eq!(manager.get_data().endpoint, None);
    }

    #[tokio::test]
    async fn start_vm_exited_early() {
        let mut runtime = MockVmRuntime::new();
        runtime
            .expect_wait_for_endpoint()
            .returning(|_| Err(VmRuntimeError::ExitedEarly(String::from("exit status: 1"))));
        runtime
            .expect_get_status()
            .returning(|| Ok(VmStatus::Exited(String::from("exit status: 1"))));
        let mut manager = create_vm_manager(Some(runtime), None);
        assert!(matches!(
            manager.start(&create_example_spec()).await,
            Err(VirtualMachineError::VmStartFail(_))
        ));
        assert_eq!(manager.state, State::Failed);
    }

    #[tokio::test]
    async fn start_runs_required_disk_services() {
        let mut manager = create_vm_manager(None, Some(true));
        assert!(manager.start(&create_example_spec()).await.is_ok());
    }

    #[tokio::test]
    async fn start_disk_service_error() {
        let mut disks = VmDisks::new();
        for function in DiskFunction::ALL {
            let mut disk = create_example_disk(function, false);
            if function == DiskFunction::Cluster {
                disk = MockVirtualDisk::new();
                disk.expect_descriptor()
                    .return_const(create_example_disk_descriptor(function));
                disk.expect_is_service_required().return_const(true);
                disk.expect_is_service_running().returning(|| Ok(false));
                disk.expect_start_service()
                    .returning(|| Err(VirtualDiskError::Service(String::from("mount"))));
            }
            disks.insert(function, Box::new(disk));
        }
        let mut manager = create_vm_manager(None, None);
        manager.disks = disks;
        assert!(matches!(
            manager.start(&create_example_spec()).await,
            Err(VirtualMachineError::DiskOperation(_))
        ));
        assert_eq!(manager.state, State::Failed);
    }

    #[tokio::test]
    async fn stop() {
        let mut manager = create_vm_manager(None, None);
        manager.start(&create_example_spec()).await.unwrap();
        assert_eq!(manager.stop().await, Ok(()));
        assert_eq!(manager.state, State::Stopped);
        assert_eq!(manager.get_data().endpoint, None);
    }

    #[tokio::test]
    #[parameterized(state = {State::NotCreated, State::Stopped, State::Starting, State::Stopping, State::Failed})]
    async fn stop_invalid_state(state: State) {
        let mut manager = create_vm_manager(None, None);
        manager.state = state;
        assert_eq!(
            manager.stop().await,
            Err(VirtualMachineError::UnsupportedAction(format!(
                "Can't stop virtual machine that is in {:?} state.",
                state
            )))
        );
        assert_eq!(manager.state, state);
    }

    #[tokio::test]
    async fn stop_runtime_error_keeps_running() {
        let mut runtime = MockVmRuntime::new();
        runtime
            .expect_shutdown()
            .returning(|| Err(VmRuntimeError::Shutdown(String::new())));
        let mut manager = create_vm_manager(Some(runtime), None);
        manager.state = State::Running;
        assert_eq!(
            manager.stop().await,
            Err(VirtualMachineError::VmStopFail(
                VmRuntimeError::Shutdown(String::new()).to_string()
            ))
        );
        assert_eq!(manager.state, State::Running);
    }

    #[tokio::test]
    async fn kill() {
        let mut manager = create_vm_manager(None, None);
        manager.state = State::Running;
        assert_eq!(manager.kill().await, Ok(()));
        assert_eq!(manager.state, State::Stopped);
    }

    #[tokio::test]
    #[parameterized(state = {State::Stopped, State::Failed, State::NotCreated})]
    async fn delete(state: State) {
        let mut manager = create_vm_manager(None, None);
        manager.state = state;
        assert_eq!(manager.delete().await, Ok(()));
        assert_eq!(manager.state, State::NotCreated);
        assert!(manager.disks.is_empty());
    }

    #[tokio::test]
    #[parameterized(state = {State::Starting, State::Running, State::Stopping})]
    async fn delete_invalid_state(state: State) {
        let mut manager = create_vm_manager(None, None);
        manager.state = state;
        assert!(matches!(
            manager.delete().await,
            Err(VirtualMachineError::UnsupportedAction(_))
        ));
        assert_eq!(manager.disks.len(), 3);
    }

    #[tokio::test]
    async fn delete_disk_error_marks_failed() {
        let mut disk = MockVirtualDisk::new();
        disk.expect_descriptor()
            .return_const(create_example_disk_descriptor(DiskFunction::Data));
        disk.expect_is_service_required().return_const(false);
        disk.expect_delete()
            .returning(|| Err(VirtualDiskError::Backend(String::from("busy"))));
        let mut manager = create_vm_manager(None, None);
        manager.disks.insert(DiskFunction::Data, Box::new(disk));
        assert!(matches!(
            manager.delete().await,
            Err(VirtualMachineError::VmDestroyFail(_))
        ));
        assert_eq!(manager.state, State::Failed);
        assert!(manager.disks.contains_key(&DiskFunction::Data));
        assert!(!manager.disks.contains_key(&DiskFunction::Os));
    }

    #[tokio::test]
    async fn resize_rejects_shrink_before_touching_disks() {
        let mut manager = create_vm_manager(None, None);
        let mut spec = create_example_spec();
        spec.os_disk_gb -= 1;
        spec.data_disk_gb += 10;
        assert!(matches!(
            manager.resize_disks(&spec).await,
            Err(VirtualMachineError::DiskOperation(_))
        ));
    }

    #[tokio::test]
    async fn resize_grows_only_changed_disks() {
        let mut data_disk = MockVirtualDisk::new();
        data_disk
            .expect_descriptor()
            .return_const(create_example_disk_descriptor(DiskFunction::Data));
        data_disk
            .expect_resize()
            .withf(|size| *size == create_example_spec().data_disk_gb + 10)
            .times(1)
            .returning(|_| Ok(()));
        let mut manager = create_vm_manager(None, None);
        manager.disks.insert(DiskFunction::Data, Box::new(data_disk));
        let mut spec = create_example_spec();
        spec.data_disk_gb += 10;
        assert_eq!(manager.resize_disks(&spec).await, Ok(()));
    }

    #[tokio::test]
    async fn refresh_detects_exited_vm() {
        let mut runtime = MockVmRuntime::new();
        runtime
            .expect_get_status()
            .returning(|| Ok(VmStatus::Exited(String::from("signal: 9"))));
        let mut manager = create_vm_manager(Some(runtime), None);
        manager.state = State::Running;
        assert_eq!(manager.refresh_state().await, Ok(State::Failed));
        assert!(manager.get_data().failure.unwrap().contains("signal: 9"));
    }

    fn create_vm_manager(
        runtime: Option<MockVmRuntime>,
        services_required: Option<bool>,
    ) -> VirtualMachineManager {
        let mut runtime = runtime.unwrap_or_default();
        runtime.expect_launch_vm().returning(|_, _| Ok(Some(42)));
        runtime
            .expect_wait_for_endpoint()
            .returning(|_| Ok(create_example_endpoint()));
        runtime
            .expect_read_cluster_credentials()
            .returning(|| Ok(Some(String::from("kubeconfig"))));
        runtime.expect_shutdown().returning(|| Ok(()));
        runtime.expect_kill().returning(|| Ok(()));
        runtime
            .expect_get_status()
            .returning(|| Ok(VmStatus::Launched));

        let mut disks = VmDisks::new();
        for function in DiskFunction::ALL {
            disks.insert(
                function,
                Box::new(create_example_disk(
                    function,
                    services_required.unwrap_or(false),
                )),
            );
        }
        VirtualMachineManager::new(
            String::from("lab"),
            Backend::LocalHypervisor,
            State::Stopped,
            disks,
            Box::new(runtime),
            Duration::from_secs(1),
        )
    }
}
