use std::{
    io::{self, Write},
    sync::Mutex,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::storage::download_cache::ProgressObserver;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum UiError {
    #[error("Can't read the answer: {0}")]
    Input(String),
    #[error("Input closed before an answer was given.")]
    Closed,
}

/// Receives everything a provisioning operation wants to show, in the order it
/// happens. Prompts block the operation until they are answered.
#[async_trait]
pub trait ProvisioningUi: Send + Sync {
    fn display_step(&self, step: &str);
    fn display_command_launch(&self, command: &str);
    fn display_command_result(&self, command: &str, success: bool, output: &str);
    fn display_message(&self, message: &str);
    fn display_progress(&self, label: &str, total: u64, done: u64, percent: u8);
    async fn ask_yes_no(&self, question: &str) -> Result<bool, UiError>;
    async fn ask_text(&self, question: &str) -> Result<String, UiError>;
}

/// Forwards download ticks of one artifact to the ui.
pub struct UiProgress<'a> {
    ui: &'a dyn ProvisioningUi,
    label: String,
}

impl<'a> UiProgress<'a> {
    pub fn new(ui: &'a dyn ProvisioningUi, label: &str) -> Self {
        Self {
            ui,
            label: label.to_string(),
        }
    }
}

impl ProgressObserver for UiProgress<'_> {
    fn on_progress(&self, total: u64, downloaded: u64, percent: u8) {
        self.ui
            .display_progress(&self.label, total, downloaded, percent);
    }
}

#[derive(Default)]
pub struct ConsoleUi {
    output: Mutex<()>,
    assume_yes: bool,
}

impl ConsoleUi {
    /// Answers every yes or no question with yes.
    pub fn assume_yes() -> Self {
        Self {
            assume_yes: true,
            ..Default::default()
        }
    }

    fn write_line(&self, line: &str) {
        let _guard = self.output.lock();
        let mut stdout = io::stdout().lock();
        let _ = writeln!(stdout, "{}", line);
        let _ = stdout.flush();
    }

    async fn read_answer(&self, prompt: &str) -> Result<String, UiError> {
        {
            let _guard = self.output.lock();
            let mut stdout = io::stdout().lock();
            write!(stdout, "{} ", prompt).map_err(|err| UiError::Input(err.to_string()))?;
            stdout
                .flush()
                .map_err(|err| UiError::Input(err.to_string()))?;
        }
        let mut line = String::new();
        let read = BufReader::new(tokio::io::stdin())
            .read_line(&mut line)
            .await
            .map_err(|err| UiError::Input(err.to_string()))?;
        if read == 0 {
            return Err(UiError::Closed);
        }
        Ok(line.trim().to_string())
    }
}

#[async_trait]
impl ProvisioningUi for ConsoleUi {
    fn display_step(&self, step: &str) {
        self.write_line(&format!("==> {}", step));
    }

    fn display_command_launch(&self, command: &str) {
        self.write_line(&format!("    $ {}", command));
    }

    fn display_command_result(&self, command: &str, success: bool, output: &str) {
        let status = if success { "ok" } else { "FAILED" };
        if output.is_empty() {
            self.write_line(&format!("    {} [{}]", command, status));
        } else {
            self.write_line(&format!("    {} [{}]: {}", command, status, output));
        }
    }

    fn display_message(&self, message: &str) {
        self.write_line(message);
    }

    fn display_progress(&self, label: &str, total: u64, done: u64, percent: u8) {
        // Only every tenth percent, parallel downloads share the terminal.
        if percent % 10 == 0 {
            self.write_line(&format!(
                "    {}: {}% ({}/{} bytes)",
                label, percent, done, total
            ));
        }
    }

    async fn ask_yes_no(&self, question: &str) -> Result<bool, UiError> {
        if self.assume_yes {
            self.write_line(&format!("{} [y/n] y", question));
            return Ok(true);
        }
        loop {
            let answer = self.read_answer(&format!("{} [y/n]", question)).await?;
            match answer.to_lowercase().as_str() {
                "y" | "yes" => return Ok(true),
                "n" | "no" => return Ok(false),
                _ => self.write_line("Please answer 'y' or 'n'."),
            }
        }
    }

    async fn ask_text(&self, question: &str) -> Result<String, UiError> {
        self.read_answer(question).await
    }
}
