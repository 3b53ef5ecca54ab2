use std::path::{Path, PathBuf};

pub const APP_NAME: &str = "XrayGUI";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn user_agent() -> String {
    format!("Happ/{APP_NAME}/{APP_VERSION}")
}

pub const PROXY_IP_ADDRESS: &str = "127.0.0.1";
pub const PROXY_PORT: u16 = 2080;

pub const SUBSCRIPTION_FILE: &str = "subscription.txt";
pub const CONFIGS_FILE: &str = "configs.json";
pub const ACTIVE_CONFIG_FILE: &str = "config.json";
pub const TUN_CONFIG_FILE: &str = "config.yaml";
pub const SETTINGS_FILE: &str = "settings.toml";

pub const DEFAULT_REMARK: &str = "No remark";

pub const DISCORD_PROXY_DLLS: &[&str] = &["DWrite.dll", "force-proxy.dll"];
pub const DISCORD_PROXY_CONFIG: &str = "proxy.txt";

pub const SERVICE_NAME: &str = "XrayGUIService";
pub const FIREWALL_RULE: &str = "XrayGUI";

pub const IPC_PORT: u16 = 47_821;
pub const IMPORT_URI_PREFIX: &str = "xraygui://import/";

#[cfg(target_os = "windows")]
const EXE_SUFFIX: &str = ".exe";
#[cfg(not(target_os = "windows"))]
const EXE_SUFFIX: &str = "";

/// Every on-disk location the supervisor touches.
#[derive(Clone, Debug)]
pub struct Paths {
    pub config_directory: PathBuf,
    pub log_directory: PathBuf,
    pub bin_directory: PathBuf,
    pub discord_directory: PathBuf,
}

impl Paths {
    pub fn discover() -> Self {
        let base = std::env::var_os("XRAYGUI_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(APP_NAME)
            });

        let bin_directory = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bin");

        let discord_directory = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Discord");

        Self::new(base, bin_directory, discord_directory)
    }

    pub fn new(base: PathBuf, bin_directory: PathBuf, discord_directory: PathBuf) -> Self {
        Self {
            config_directory: base.join("config"),
            log_directory: base.join("log"),
            bin_directory,
            discord_directory,
        }
    }

    pub fn ensure_directories(&self) {
        for directory in [&self.config_directory, &self.log_directory] {
            if let Err(error) = std::fs::create_dir_all(directory) {
                log::warn!(
                    "[startup] failed to create directory {}: {error}",
                    directory.display()
                );
            }
        }
    }

    pub fn subscription_path(&self) -> PathBuf {
        self.config_directory.join(SUBSCRIPTION_FILE)
    }

    pub fn configs_path(&self) -> PathBuf {
        self.config_directory.join(CONFIGS_FILE)
    }

    pub fn active_config_path(&self) -> PathBuf {
        self.config_directory.join(ACTIVE_CONFIG_FILE)
    }

    pub fn tun_config_path(&self) -> PathBuf {
        self.config_directory.join(TUN_CONFIG_FILE)
    }

    pub fn settings_path(&self) -> PathBuf {
        self.config_directory.join(SETTINGS_FILE)
    }

    pub fn xray_path(&self) -> PathBuf {
        self.bin_directory.join(format!("xray{EXE_SUFFIX}"))
    }

    pub fn tun_path(&self) -> PathBuf {
        self.bin_directory.join(format!("mihomo{EXE_SUFFIX}"))
    }

    pub fn nssm_path(&self) -> PathBuf {
        self.bin_directory.join(format!("nssm{EXE_SUFFIX}"))
    }

    /// Payload DLLs shipped next to the binaries.
    pub fn discord_payload_directory(&self) -> PathBuf {
        self.bin_directory.join("discord")
    }
}
