use std::{
    io,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::{Duration, Instant},
};

use sysinfo::{Pid, System};

const DISCORD_PROCESS: &str = "discord.exe";
const APP_DIRECTORY_PREFIX: &str = "app-";
const KILL_WAIT: Duration = Duration::from_secs(5);
const KILL_POLL: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
pub struct RunningProcess {
    pub pid: u32,
    pub name: String,
    pub executable: Option<PathBuf>,
}

/// The slice of the OS process table the Discord patcher needs.
pub trait ProcessTable: Send {
    fn processes(&mut self) -> Vec<RunningProcess>;
    fn kill(&mut self, pid: u32) -> bool;
    fn is_alive(&mut self, pid: u32) -> bool;
    /// Starts a program that outlives this process.
    fn launch_detached(&mut self, program: &Path, arguments: &[&str]) -> io::Result<()>;
}

pub struct SysinfoProcessTable {
    system: System,
}

impl SysinfoProcessTable {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SysinfoProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SysinfoProcessTable {
    fn processes(&mut self) -> Vec<RunningProcess> {
        self.system.refresh_processes();
        self.system
            .processes()
            .iter()
            .map(|(pid, process)| RunningProcess {
                pid: pid.as_u32(),
                name: process.name().to_string(),
                executable: process.exe().map(Path::to_path_buf),
            })
            .collect()
    }

    fn kill(&mut self, pid: u32) -> bool {
        self.system
            .process(Pid::from_u32(pid))
            .is_some_and(|process| process.kill())
    }

    fn is_alive(&mut self, pid: u32) -> bool {
        self.system.refresh_process(Pid::from_u32(pid))
    }

    fn launch_detached(&mut self, program: &Path, arguments: &[&str]) -> io::Result<()> {
        let mut command = Command::new(program);
        command
            .args(arguments)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(directory) = program.parent() {
            command.current_dir(directory);
        }

        #[cfg(target_os = "windows")]
        {
            use std::os::windows::process::CommandExt;
            command.creation_flags(crate::system::CREATE_NO_WINDOW);
        }

        command.spawn().map(|_| ())
    }
}

/// Greatest `app-*` subdirectory by plain string comparison of the suffix, so
/// `app-1.0.9` sorts above `app-1.0.10`.
pub fn latest_app_dir(root: &Path) -> Option<PathBuf> {
    std::fs::read_dir(root)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_ok_and(|kind| kind.is_dir()))
        .filter_map(|entry| {
            let name = entry.file_name().to_str()?.to_string();
            let suffix = name.strip_prefix(APP_DIRECTORY_PREFIX)?.to_string();
            Some((suffix, entry.path()))
        })
        .max_by(|(left, _), (right, _)| left.cmp(right))
        .map(|(_, path)| path)
}

/// Drops a SOCKS5 redirect payload into the Discord install.
pub struct DiscordProxyManager {
    discord_directory: PathBuf,
    payload_directory: PathBuf,
    dlls: Vec<String>,
    config_name: String,
    proxy_ip_address: String,
    proxy_port: u16,
    table: Box<dyn ProcessTable>,
}

impl DiscordProxyManager {
    pub fn new(
        discord_directory: impl Into<PathBuf>,
        payload_directory: impl Into<PathBuf>,
        dlls: &[&str],
        config_name: &str,
        proxy_ip_address: &str,
        proxy_port: u16,
        table: Box<dyn ProcessTable>,
    ) -> Self {
        Self {
            discord_directory: discord_directory.into(),
            payload_directory: payload_directory.into(),
            dlls: dlls.iter().map(|dll| dll.to_string()).collect(),
            config_name: config_name.to_string(),
            proxy_ip_address: proxy_ip_address.to_string(),
            proxy_port,
            table,
        }
    }

    fn payload_names(&self) -> impl Iterator<Item = &str> {
        self.dlls
            .iter()
            .map(String::as_str)
            .chain(std::iter::once(self.config_name.as_str()))
    }

    pub fn is_enabled(&self) -> bool {
        let Some(app_directory) = latest_app_dir(&self.discord_directory) else {
            return false;
        };
        self.payload_names()
            .all(|name| app_directory.join(name).is_file())
    }

    pub fn enable(&mut self) -> bool {
        let Some(app_directory) = latest_app_dir(&self.discord_directory) else {
            log::warn!(
                "[discord] no app-* directory under {}",
                self.discord_directory.display()
            );
            return false;
        };

        let executable = self.terminate_discord();

        if let Err(error) = self.install_payload(&app_directory) {
            log::warn!(
                "[discord] failed to install proxy into {}: {error}",
                app_directory.display()
            );
            return false;
        }
        log::info!("[discord] proxy installed into {}", app_directory.display());

        self.start_discord(executable.as_deref());
        true
    }

    pub fn disable(&mut self) {
        let Some(app_directory) = latest_app_dir(&self.discord_directory) else {
            return;
        };

        self.terminate_discord();

        let names: Vec<String> = self.payload_names().map(str::to_string).collect();
        for name in names {
            let path = app_directory.join(&name);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(error) if error.kind() == io::ErrorKind::NotFound => {}
                Err(error) => log::warn!("[discord] cannot remove {}: {error}", path.display()),
            }
        }
        log::info!("[discord] proxy removed from {}", app_directory.display());
    }

    fn install_payload(&self, app_directory: &Path) -> io::Result<()> {
        for dll in &self.dlls {
            std::fs::copy(self.payload_directory.join(dll), app_directory.join(dll))?;
        }
        std::fs::write(
            app_directory.join(&self.config_name),
            format!(
                "SOCKS5_PROXY_ADDRESS={}\nSOCKS5_PROXY_PORT={}\n",
                self.proxy_ip_address, self.proxy_port
            ),
        )
    }

    /// Kills every Discord process and returns the executable of the first one found.
    fn terminate_discord(&mut self) -> Option<PathBuf> {
        let discord: Vec<RunningProcess> = self
            .table
            .processes()
            .into_iter()
            .filter(|process| process.name.eq_ignore_ascii_case(DISCORD_PROCESS))
            .collect();
        let executable = discord
            .iter()
            .find_map(|process| process.executable.clone());

        if discord.is_empty() {
            return executable;
        }

        for process in &discord {
            if !self.table.kill(process.pid) {
                log::warn!("[discord] failed to kill pid {}", process.pid);
            }
        }

        let deadline = Instant::now() + KILL_WAIT;
        while discord.iter().any(|process| self.table.is_alive(process.pid)) {
            if Instant::now() >= deadline {
                log::warn!("[discord] processes still alive after {KILL_WAIT:?}");
                break;
            }
            std::thread::sleep(KILL_POLL);
        }
        log::info!("[discord] terminated {} processes", discord.len());
        executable
    }

    fn start_discord(&mut self, executable: Option<&Path>) {
        if let Some(executable) = executable.filter(|path| path.exists()) {
            match self.table.launch_detached(executable, &[]) {
                Ok(()) => return,
                Err(error) => log::warn!(
                    "[discord] cannot relaunch {}: {error}",
                    executable.display()
                ),
            }
        }

        let updater = self.discord_directory.join("Update.exe");
        if updater.exists()
            && let Err(error) = self
                .table
                .launch_detached(&updater, &["--processStart", "Discord.exe"])
        {
            log::warn!("[discord] cannot start {}: {error}", updater.display());
        }
    }
}
