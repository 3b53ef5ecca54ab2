use std::{
    ffi::OsString,
    io::{self, Write},
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
};

use crate::error::{Error, Result};

pub mod proxy;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::*;

#[cfg(target_os = "windows")]
mod windows;
#[cfg(target_os = "windows")]
pub use windows::*;

#[cfg(target_os = "windows")]
pub(crate) const CREATE_NO_WINDOW: u32 = 0x08000000;

/// How to launch one supervised executable.
#[derive(Clone, Debug)]
pub struct Launch {
    pub program: PathBuf,
    pub arguments: Vec<OsString>,
    pub working_directory: Option<PathBuf>,
    /// stdout/stderr are appended here for direct launches.
    pub log_path: Option<PathBuf>,
    pub elevated: bool,
}

impl Launch {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            arguments: Vec::new(),
            working_directory: None,
            log_path: None,
            elevated: false,
        }
    }

    pub fn arg(mut self, argument: impl Into<OsString>) -> Self {
        self.arguments.push(argument.into());
        self
    }

    pub fn working_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(directory.into());
        self
    }

    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    pub fn elevated(mut self, elevated: bool) -> Self {
        self.elevated = elevated;
        self
    }

    pub fn display(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(
            self.arguments
                .iter()
                .map(|argument| argument.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }

    pub(crate) fn open_log(&self) -> Option<(Stdio, Stdio)> {
        let path = self.log_path.as_ref()?;
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let mut file = match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
        {
            Ok(file) => file,
            Err(error) => {
                log::warn!("[process] cannot open log {}: {error}", path.display());
                return None;
            }
        };
        let _ = writeln!(
            file,
            "=== {} started {} ===",
            self.display(),
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        );
        let stderr = file.try_clone().ok()?;
        Some((Stdio::from(file), Stdio::from(stderr)))
    }
}

pub struct ChildExit {
    pub code: Option<i32>,
}

impl std::fmt::Display for ChildExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code: {code}"),
            None => write!(f, "terminated by signal"),
        }
    }
}

pub enum ChildProcess {
    Direct {
        child: Child,
        elevated: bool,
        #[cfg(target_os = "windows")]
        _job_guard: Option<JobGuard>,
    },
    #[cfg(target_os = "windows")]
    Elevated { handle: ProcessHandle },
}

impl ChildProcess {
    pub fn id(&self) -> u32 {
        match self {
            Self::Direct { child, .. } => child.id(),
            #[cfg(target_os = "windows")]
            Self::Elevated { handle } => handle.id(),
        }
    }

    pub fn try_wait(&mut self) -> io::Result<Option<ChildExit>> {
        match self {
            Self::Direct { child, .. } => child
                .try_wait()
                .map(|status| status.map(|s| ChildExit { code: s.code() })),
            #[cfg(target_os = "windows")]
            Self::Elevated { handle } => Ok(handle.exit_code().map(|code| ChildExit {
                code: Some(code as i32),
            })),
        }
    }

    /// Forceful kill, no graceful shutdown.
    pub fn kill(&mut self) -> io::Result<()> {
        match self {
            Self::Direct {
                child, elevated, ..
            } => match child.kill() {
                Ok(()) => {
                    let _ = child.wait();
                    Ok(())
                }
                Err(error) if *elevated => {
                    log::info!(
                        "[process] plain kill of pid {} failed ({error}), retrying elevated",
                        child.id()
                    );
                    if elevate_terminate_process(child.id()) {
                        let _ = child.wait();
                        Ok(())
                    } else {
                        Err(error)
                    }
                }
                Err(error) => Err(error),
            },
            #[cfg(target_os = "windows")]
            Self::Elevated { handle } => handle.terminate(),
        }
    }
}

#[derive(Debug)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

pub fn run_silent_with_output<S: AsRef<std::ffi::OsStr>>(
    program: &Path,
    arguments: &[S],
) -> io::Result<CommandOutput> {
    let rendered = render_command(program, arguments);
    log::debug!("[cmd] {rendered}");

    let mut command = Command::new(program);
    command
        .args(arguments)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        command.creation_flags(CREATE_NO_WINDOW);
    }

    match command.output() {
        Ok(output) => {
            let success = output.status.success();
            let stdout = String::from_utf8_lossy(&output.stdout).to_string();
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            if !success {
                log::debug!(
                    "[cmd] FAILED (exit {}): {rendered}\n  stdout: {}\n  stderr: {}",
                    output.status.code().unwrap_or(-1),
                    stdout.trim(),
                    stderr.trim(),
                );
            } else {
                log::trace!("[cmd] OK: {rendered} -> stdout={}", stdout.trim());
            }
            Ok(CommandOutput {
                success,
                code: output.status.code(),
                stdout,
                stderr,
            })
        }
        Err(error) => {
            log::debug!("[cmd] spawn error for {}: {error}", program.display());
            Err(error)
        }
    }
}

/// Runs a helper and turns a non-zero exit into [`Error::Command`].
pub fn run_checked<S: AsRef<std::ffi::OsStr>>(program: &Path, arguments: &[S]) -> Result<String> {
    let command = render_command(program, arguments);
    let output = run_silent_with_output(program, arguments).map_err(|error| Error::Command {
        command: command.clone(),
        detail: error.to_string(),
    })?;

    if output.success {
        return Ok(output.stdout);
    }

    let detail = match (output.stderr.trim(), output.stdout.trim()) {
        ("", "") => match output.code {
            Some(code) => format!("exit code {code}"),
            None => "terminated by signal".to_string(),
        },
        ("", stdout) => stdout.to_string(),
        (stderr, _) => stderr.to_string(),
    };
    Err(Error::Command { command, detail })
}

fn render_command<S: AsRef<std::ffi::OsStr>>(program: &Path, arguments: &[S]) -> String {
    let mut parts = vec![program.display().to_string()];
    parts.extend(
        arguments
            .iter()
            .map(|argument| argument.as_ref().to_string_lossy().into_owned()),
    );
    parts.join(" ")
}

/// Values sent as `x-hwid`, `x-device-os`, `x-ver-os` and `x-device-model`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub hwid: String,
    pub os_name: String,
    pub os_version: String,
    pub device_model: String,
}

impl DeviceIdentity {
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("x-hwid", self.hwid.clone()),
            ("x-device-os", self.os_name.clone()),
            ("x-ver-os", self.os_version.clone()),
            ("x-device-model", self.device_model.clone()),
        ]
    }
}
