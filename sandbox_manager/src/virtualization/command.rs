use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use log::debug;
use thiserror::Error;
use tokio::process::Command;

use super::vm_process::{VmHandler, VmProcess};

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum CommandError {
    #[error("Can't run {program}: {reason}")]
    Spawn { program: String, reason: String },
    #[error("{program} failed with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn stdout_text(&self) -> String {
        decode_output(&self.stdout)
    }

    pub fn stderr_text(&self) -> String {
        decode_output(&self.stderr)
    }
}

/// Windows tools such as `wsl.exe` print UTF-16LE.
pub fn decode_output(bytes: &[u8]) -> String {
    let looks_utf16 = bytes.len() >= 2
        && bytes.len() % 2 == 0
        && bytes.iter().skip(1).step_by(2).all(|byte| *byte == 0);
    if looks_utf16 {
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    }
}

pub fn display_command(program: &Path, args: &[String]) -> String {
    let mut line = program.display().to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// Runs the host tools the backend drivers are built on.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs to completion. A non zero exit status is an error.
    async fn run(&self, program: &Path, args: &[String]) -> Result<CommandOutput, CommandError>;
    /// Starts a long running process, e.g. a virtual machine.
    fn spawn(
        &self,
        program: &Path,
        args: &[String],
    ) -> Result<Box<dyn VmProcess + Send + Sync>, CommandError>;
}

#[derive(Debug, Default)]
pub struct HostCommandRunner;

#[async_trait]
impl CommandRunner for HostCommandRunner {
    async fn run(&self, program: &Path, args: &[String]) -> Result<CommandOutput, CommandError> {
        debug!("Running: {}", display_command(program, args));
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| CommandError::Spawn {
                program: program.display().to_string(),
                reason: err.to_string(),
            })?;
        let output_data = CommandOutput {
            stdout: output.stdout,
            stderr: output.stderr,
        };
        if output.status.success() {
            Ok(output_data)
        } else {
            Err(CommandError::Failed {
                program: program.display().to_string(),
                status: output.status.to_string(),
                stderr: output_data.stderr_text().trim().to_string(),
            })
        }
    }

    fn spawn(
        &self,
        program: &Path,
        args: &[String],
    ) -> Result<Box<dyn VmProcess + Send + Sync>, CommandError> {
        debug!("Spawning: {}", display_command(program, args));
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        VmHandler::new(command, program)
            .map(|handler| Box::new(handler) as Box<dyn VmProcess + Send + Sync>)
            .map_err(|err| CommandError::Spawn {
                program: program.display().to_string(),
                reason: err.to_string(),
            })
    }
}
