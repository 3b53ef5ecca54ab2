use std::path::PathBuf;

use serde_json::Value;

use crate::{
    configuration::{DEFAULT_REMARK, Paths, user_agent},
    error::{Error, Result},
    persist::Transaction,
    subscription::SubscriptionClient,
    system::DeviceIdentity,
};

pub fn remark_of(config: &Value) -> &str {
    config
        .get("remarks")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_REMARK)
}

/// Subscription-derived server list and the one currently handed to xray.
pub struct ConfigManager {
    subscription_path: PathBuf,
    configs_path: PathBuf,
    active_config_path: PathBuf,
    tun_config_path: PathBuf,
    client: Box<dyn SubscriptionClient>,
    identity: DeviceIdentity,
    subscription_url: Option<String>,
    configs: Option<Vec<Value>>,
    current_remark: Option<String>,
}

impl ConfigManager {
    /// Restores the subscription URL, list and selection left by the previous run.
    pub fn load(paths: &Paths, client: Box<dyn SubscriptionClient>, identity: DeviceIdentity) -> Self {
        let mut manager = Self {
            subscription_path: paths.subscription_path(),
            configs_path: paths.configs_path(),
            active_config_path: paths.active_config_path(),
            tun_config_path: paths.tun_config_path(),
            client,
            identity,
            subscription_url: None,
            configs: None,
            current_remark: None,
        };

        manager.subscription_url = std::fs::read_to_string(&manager.subscription_path)
            .ok()
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty());

        manager.configs = match std::fs::read(&manager.configs_path) {
            Ok(bytes) => match serde_json::from_slice::<Vec<Value>>(&bytes) {
                Ok(configs) => Some(configs),
                Err(error) => {
                    log::warn!(
                        "[config] ignoring unreadable {}: {error}",
                        manager.configs_path.display()
                    );
                    None
                }
            },
            Err(_) => None,
        };

        manager.current_remark = std::fs::read(&manager.active_config_path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).ok())
            .map(|config| remark_of(&config).to_string());

        log::info!(
            "[config] loaded {} configs, current: {}",
            manager.configs().len(),
            manager.current_remark.as_deref().unwrap_or("<none>")
        );
        manager
    }

    pub fn subscription_url(&self) -> Option<&str> {
        self.subscription_url.as_deref()
    }

    pub fn configs(&self) -> &[Value] {
        self.configs.as_deref().unwrap_or_default()
    }

    pub fn remarks(&self) -> Vec<&str> {
        self.configs().iter().map(remark_of).collect()
    }

    pub fn current_remark(&self) -> Option<&str> {
        self.current_remark.as_deref()
    }

    fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = self.identity.headers();
        headers.push(("User-Agent", user_agent()));
        headers
    }

    /// Fetches the list and its TUN companion, then replaces all persisted files at once.
    /// Nothing on disk or in memory changes unless every step succeeds.
    pub fn import_configs(&mut self, url: &str) -> Result<()> {
        let url = url.trim();
        let base = url.trim_end_matches('/');
        let headers = self.headers();

        let reply = self.client.get(&format!("{base}/json"), &headers)?;
        if !reply.is_success() {
            return Err(Error::Transport(format!(
                "Subscription server returned status {}",
                reply.status
            )));
        }
        if let Some(reason) = reply.rejection() {
            log::warn!("[config] subscription rejected: {reason}");
            return Err(Error::Rejected(reason));
        }
        let configs: Vec<Value> = serde_json::from_slice(&reply.body)
            .map_err(|error| Error::Transport(format!("Malformed subscription JSON: {error}")))?;

        let selected = match &self.current_remark {
            None => configs.first(),
            Some(remark) => {
                let found = configs.iter().find(|config| remark_of(config) == remark);
                if found.is_none() {
                    log::warn!("[config] selected server '{remark}' is no longer offered");
                }
                found
            }
        };

        let tun_reply = self.client.get(&format!("{base}/mihomo"), &headers)?;
        if !tun_reply.is_success() {
            return Err(Error::Transport(format!(
                "Subscription server returned status {} for the TUN config",
                tun_reply.status
            )));
        }

        let mut transaction = Transaction::new()
            .write(&self.configs_path, serde_json::to_vec_pretty(&configs)?)
            .write(&self.tun_config_path, tun_reply.body.clone())
            .write(&self.subscription_path, url.as_bytes().to_vec());
        if let Some(config) = selected {
            transaction = transaction.write(&self.active_config_path, serde_json::to_vec_pretty(config)?);
        }
        transaction.commit()?;

        if let Some(config) = selected {
            self.current_remark = Some(remark_of(config).to_string());
        }
        log::info!("[config] imported {} configs from {url}", configs.len());
        self.configs = Some(configs);
        self.subscription_url = Some(url.to_string());
        Ok(())
    }

    /// First config whose remark matches becomes the active config.
    pub fn select_config(&mut self, remark: &str) -> bool {
        let Some(config) = self
            .configs
            .as_ref()
            .and_then(|configs| configs.iter().find(|config| remark_of(config) == remark))
        else {
            log::info!("[config] no config named '{remark}'");
            return false;
        };

        let written = serde_json::to_vec_pretty(config)
            .map_err(Error::from)
            .and_then(|content| {
                std::fs::write(&self.active_config_path, content).map_err(Error::from)
            });
        if let Err(error) = written {
            log::warn!(
                "[config] cannot write {}: {error}",
                self.active_config_path.display()
            );
            return false;
        }

        log::info!("[config] selected '{remark}'");
        self.current_remark = Some(remark.to_string());
        true
    }
}
