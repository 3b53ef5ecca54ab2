use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VpnBackend {
    /// xray runs as a child of this process.
    Process,
    /// xray runs as an NSSM-managed Windows service.
    Service,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppState {
    #[serde(default)]
    pub tun_enabled: bool,
    #[serde(default = "default_vpn_backend")]
    pub vpn_backend: VpnBackend,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

fn default_vpn_backend() -> VpnBackend {
    VpnBackend::Process
}

fn default_http_timeout_secs() -> u64 {
    30
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            tun_enabled: false,
            vpn_backend: default_vpn_backend(),
            http_timeout_secs: default_http_timeout_secs(),
        }
    }
}

impl AppState {
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(state) => {
                    log::info!("[app_state] loaded from {}", path.display());
                    state
                }
                Err(error) => {
                    log::warn!("[app_state] failed to parse {}: {error}", path.display());
                    Self::default()
                }
            },
            Err(_) => {
                log::info!(
                    "[app_state] no state file at {}, using defaults",
                    path.display()
                );
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) {
        if let Some(parent) = path.parent()
            && let Err(error) = std::fs::create_dir_all(parent)
        {
            log::warn!(
                "[app_state] failed to create state directory {}: {error}",
                parent.display()
            );
        }
        match toml::to_string_pretty(self) {
            Ok(content) => {
                if let Err(error) = std::fs::write(path, content) {
                    log::warn!("[app_state] failed to write {}: {error}", path.display());
                }
            }
            Err(error) => {
                log::warn!("[app_state] failed to serialize state: {error}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let state: AppState = toml::from_str("tun_enabled = true").unwrap();
        assert!(state.tun_enabled);
        assert_eq!(state.vpn_backend, VpnBackend::Process);
        assert_eq!(state.http_timeout_secs, 30);
    }

    #[test]
    fn garbage_file_falls_back_to_defaults() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("settings.toml");
        std::fs::write(&path, "tun_enabled = \"maybe\"").unwrap();

        let state = AppState::load(&path);
        assert!(!state.tun_enabled);
    }

    #[test]
    fn save_then_load_keeps_backend() {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("nested").join("settings.toml");
        let state = AppState {
            tun_enabled: true,
            vpn_backend: VpnBackend::Service,
            http_timeout_secs: 5,
        };
        state.save(&path);

        let loaded = AppState::load(&path);
        assert!(loaded.tun_enabled);
        assert_eq!(loaded.vpn_backend, VpnBackend::Service);
        assert_eq!(loaded.http_timeout_secs, 5);
    }
}
