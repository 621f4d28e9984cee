use std::{path::Path, time::Duration};

use async_trait::async_trait;
use log::{debug, warn};
#[cfg(unix)]
use nix::{
    sys::signal::{self, Signal::SIGTERM},
    unistd::Pid,
};
use thiserror::Error;
use tokio::process::{Child, Command};

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum VmHandlerError {
    #[error("Unable to spawn Vm: {0}")]
    Spawn(String),
    #[error("Vm exited right after launch: {0}")]
    Launch(String),
    #[error("Unable to kill Vm: {0}")]
    Kill(String),
    #[error("Unable to get vm's exit code: {0}")]
    Wait(String),
}

/// A running host process backing a virtual machine.
#[async_trait]
pub trait VmProcess {
    fn id(&self) -> Option<u32>;
    fn try_get_exit_status(&mut self) -> Result<Option<String>, VmHandlerError>;
    /// Asks the process to terminate and kills it once `grace` passed.
    async fn shutdown(&mut self, grace: Duration) -> Result<(), VmHandlerError>;
    async fn kill(&mut self) -> Result<(), VmHandlerError>;
}

pub struct VmHandler {
    vm_process: Child,
    program: String,
}

impl VmHandler {
    pub fn new(mut command: Command, program: &Path) -> Result<VmHandler, VmHandlerError> {
        let mut vm_process = command
            .spawn()
            .map_err(|err| VmHandlerError::Spawn(err.to_string()))?;
        match vm_process
            .try_wait()
            .map_err(|err| VmHandlerError::Wait(err.to_string()))?
        {
            Some(exit_status) => Err(VmHandlerError::Launch(exit_status.to_string())),
            None => Ok(VmHandler {
                vm_process,
                program: program.display().to_string(),
            }),
        }
    }

    #[cfg(unix)]
    fn terminate(&self) {
        if let Some(pid) = self.vm_process.id() {
            if let Err(err) = signal::kill(Pid::from_raw(pid as i32), SIGTERM) {
                warn!("Can't send SIGTERM to {} ({}): {}", self.program, pid, err);
            }
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self) {}
}

#[async_trait]
impl VmProcess for VmHandler {
    fn id(&self) -> Option<u32> {
        self.vm_process.id()
    }

    fn try_get_exit_status(&mut self) -> Result<Option<String>, VmHandlerError> {
        self.vm_process
            .try_wait()
            .map(|status| status.map(|status| status.to_string()))
            .map_err(|err| VmHandlerError::Wait(err.to_string()))
    }

    async fn shutdown(&mut self, grace: Duration) -> Result<(), VmHandlerError> {
        if self.try_get_exit_status()?.is_some() {
            return Ok(());
        }
        self.terminate();
        match tokio::time::timeout(grace, self.vm_process.wait()).await {
            Ok(status) => {
                let status = status.map_err(|err| VmHandlerError::Wait(err.to_string()))?;
                debug!("{} exited with {}", self.program, status);
                Ok(())
            }
            Err(_) => {
                warn!(
                    "{} didn't exit within {} seconds, killing it",
                    self.program,
                    grace.as_secs()
                );
                self.kill().await
            }
        }
    }

    async fn kill(&mut self) -> Result<(), VmHandlerError> {
        if self.try_get_exit_status()?.is_some() {
            return Ok(());
        }
        self.vm_process
            .kill()
            .await
            .map_err(|err| VmHandlerError::Kill(err.to_string()))
    }
}
