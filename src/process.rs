use std::path::{Path, PathBuf};

use crate::{
    error::{Error, Result},
    system::{self, ChildProcess, Launch},
};

/// One external executable whose lifecycle the supervisor drives.
pub trait SupervisedProcess: Send {
    fn name(&self) -> &str;

    /// Succeeds immediately when already running.
    fn start(&mut self) -> Result<()>;

    /// Must be a no-op when not running.
    fn stop(&mut self) -> Result<()>;

    /// Polls the OS; never a cached flag.
    fn is_running(&mut self) -> bool;
}

/// Runs the executable as a direct child of this process.
pub struct ProcessManager {
    name: String,
    launch: Launch,
    config_path: PathBuf,
    child: Option<ChildProcess>,
}

impl ProcessManager {
    pub fn new(name: impl Into<String>, launch: Launch, config_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            launch,
            config_path: config_path.into(),
            child: None,
        }
    }

    /// `xray run -c <config>`, logging into `log_directory`.
    pub fn xray(executable: &Path, config_path: &Path, log_directory: &Path) -> Self {
        let launch = Launch::new(executable)
            .arg("run")
            .arg("-c")
            .arg(config_path)
            .working_directory(log_directory)
            .log_path(log_directory.join("xray.log"));
        Self::new("xray", launch, config_path)
    }

    /// `mihomo -d <bin dir> -f <config.yaml>`, elevated since it creates the TUN device.
    pub fn tun(executable: &Path, config_path: &Path, log_directory: &Path) -> Self {
        let home = executable
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let launch = Launch::new(executable)
            .arg("-d")
            .arg(&home)
            .arg("-f")
            .arg(config_path)
            .working_directory(&home)
            .log_path(log_directory.join("tun.log"))
            .elevated(true);
        Self::new("tun", launch, config_path)
    }
}

impl SupervisedProcess for ProcessManager {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self) -> Result<()> {
        if self.is_running() {
            log::debug!("[process] {} already running", self.name);
            return Ok(());
        }

        if !self.config_path.is_file() {
            return Err(Error::Precondition(format!(
                "Config file not found at '{}'",
                self.config_path.display()
            )));
        }

        let child = system::spawn(&self.launch).map_err(|error| Error::Command {
            command: self.launch.display(),
            detail: error.to_string(),
        })?;
        log::info!("[process] {} started (pid {})", self.name, child.id());
        self.child = Some(child);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if !self.is_running() {
            return Ok(());
        }

        // The handle is released even if the kill fails, so "running" cannot stick.
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let process_id = child.id();
        match child.kill() {
            Ok(()) => {
                log::info!("[process] {} (pid {process_id}) killed", self.name);
                Ok(())
            }
            Err(error) => {
                log::warn!(
                    "[process] failed to kill {} (pid {process_id}): {error}",
                    self.name
                );
                Err(Error::Command {
                    command: format!("kill {process_id}"),
                    detail: error.to_string(),
                })
            }
        }
    }

    fn is_running(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(exit)) => {
                log::warn!("[process] {} exited on its own ({exit})", self.name);
                self.child = None;
                false
            }
            Err(error) => {
                log::warn!("[process] cannot poll {}: {error}", self.name);
                self.child = None;
                false
            }
        }
    }
}
