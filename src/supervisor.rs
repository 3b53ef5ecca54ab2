use std::{io, path::PathBuf};

use crate::{
    app_state::AppState,
    config_manager::ConfigManager,
    configuration::IMPORT_URI_PREFIX,
    discord::DiscordProxyManager,
    error::Error,
    process::SupervisedProcess,
    subscription::CancelToken,
    system::proxy::SystemProxyManager,
};

/// One consolidated view published after every composite operation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Status {
    pub vpn_running: bool,
    pub tun_running: bool,
    pub tun_enabled: bool,
    pub system_proxy_set: bool,
    pub system_proxy_enabled: bool,
    pub discord_proxy_enabled: bool,
    pub current_remark: Option<String>,
    pub servers: Vec<String>,
}

/// Where user-visible outcomes go.
pub trait Notifier {
    fn show_error(&mut self, message: &str);
    fn show_message(&mut self, message: &str);
    fn status_changed(&mut self, status: &Status);
}

pub struct Supervisor {
    vpn: Box<dyn SupervisedProcess>,
    tun: Box<dyn SupervisedProcess>,
    proxy: SystemProxyManager,
    configs: ConfigManager,
    discord: DiscordProxyManager,
    state: AppState,
    state_path: PathBuf,
    cancel: CancelToken,
    notifier: Box<dyn Notifier>,
}

fn or_false(result: io::Result<bool>, what: &str) -> bool {
    result.unwrap_or_else(|error| {
        log::warn!("[supervisor] cannot read {what}: {error}");
        false
    })
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vpn: Box<dyn SupervisedProcess>,
        tun: Box<dyn SupervisedProcess>,
        proxy: SystemProxyManager,
        configs: ConfigManager,
        discord: DiscordProxyManager,
        state: AppState,
        state_path: PathBuf,
        cancel: CancelToken,
        notifier: Box<dyn Notifier>,
    ) -> Self {
        Self {
            vpn,
            tun,
            proxy,
            configs,
            discord,
            state,
            state_path,
            cancel,
            notifier,
        }
    }

    pub fn status(&mut self) -> Status {
        Status {
            vpn_running: self.vpn.is_running(),
            tun_running: self.tun.is_running(),
            tun_enabled: self.state.tun_enabled,
            system_proxy_set: or_false(self.proxy.server_set(), "ProxyServer"),
            system_proxy_enabled: or_false(self.proxy.enable_set(), "ProxyEnable"),
            discord_proxy_enabled: self.discord.is_enabled(),
            current_remark: self.configs.current_remark().map(str::to_string),
            servers: self
                .configs
                .remarks()
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn refresh(&mut self) {
        let status = self.status();
        self.notifier.status_changed(&status);
    }

    fn error(&mut self, message: impl AsRef<str>) {
        log::warn!("[supervisor] {}", message.as_ref());
        self.notifier.show_error(message.as_ref());
    }

    fn set_tun_intent(&mut self, enabled: bool) {
        if self.state.tun_enabled != enabled {
            self.state.tun_enabled = enabled;
            self.state.save(&self.state_path);
        }
    }

    fn set_proxy_enable(&mut self, enable: bool) {
        if let Err(error) = self.proxy.set_enable(enable) {
            self.error(format!("Failed to update system proxy:\n{error}"));
        }
    }

    /// Starts TUN; on failure the intent is dropped so the next VPN start skips it.
    fn start_tun(&mut self) {
        if let Err(error) = self.tun.start() {
            self.set_tun_intent(false);
            self.error(format!("Failed to start TUN:\n{error}"));
        }
    }

    fn stop_all(&mut self) {
        if let Err(error) = self.vpn.stop() {
            self.error(format!("Failed to stop VPN:\n{error}"));
        }
        if self.tun.is_running()
            && let Err(error) = self.tun.stop()
        {
            self.error(format!("Failed to stop TUN:\n{error}"));
        }
    }

    fn vpn_off(&mut self) {
        log::info!("[supervisor] stopping {}", self.vpn.name());
        self.stop_all();
        self.set_proxy_enable(false);
    }

    fn vpn_on(&mut self) {
        if self.configs.current_remark().is_none() {
            self.error("Server is not selected");
            return;
        }
        log::info!("[supervisor] starting {}", self.vpn.name());
        match self.vpn.start() {
            Ok(()) => {
                self.set_proxy_enable(true);
                if self.state.tun_enabled {
                    self.start_tun();
                }
            }
            Err(error) => self.error(format!("Failed to start VPN:\n{error}")),
        }
    }

    pub fn toggle_vpn(&mut self) {
        if self.vpn.is_running() {
            self.vpn_off();
        } else {
            self.vpn_on();
        }
        self.refresh();
    }

    pub fn toggle_tun(&mut self) {
        if self.tun.is_running() {
            if let Err(error) = self.tun.stop() {
                self.error(format!("Failed to stop TUN:\n{error}"));
            }
            self.set_tun_intent(false);
        } else {
            self.set_tun_intent(true);
            if self.vpn.is_running() {
                self.start_tun();
            }
        }
        self.refresh();
    }

    pub fn toggle_system_proxy(&mut self) {
        let result = if or_false(self.proxy.server_set(), "ProxyServer") {
            self.proxy
                .delete_server()
                .and_then(|()| self.proxy.set_enable(false))
        } else {
            let running = self.vpn.is_running();
            self.proxy.set_server().and_then(|()| {
                if running {
                    self.proxy.set_enable(true)
                } else {
                    Ok(())
                }
            })
        };
        if let Err(error) = result {
            self.error(format!("Failed to update system proxy:\n{error}"));
        }
        self.refresh();
    }

    pub fn toggle_discord_proxy(&mut self) {
        if self.discord.is_enabled() {
            self.discord.disable();
        } else if !self.discord.enable() {
            self.error("Failed to enable Discord proxy");
        }
        self.refresh();
    }

    pub fn select_server(&mut self, remark: &str) {
        if !self.configs.select_config(remark) {
            self.error(format!("Server '{remark}' not found"));
        } else if self.vpn.is_running() {
            log::info!("[supervisor] restarting VPN for '{remark}'");
            self.vpn_off();
            self.vpn_on();
        }
        self.refresh();
    }

    pub fn import_subscription(&mut self, url: &str) {
        if url.trim().is_empty() {
            self.error("Invalid subscription URL");
            self.refresh();
            return;
        }
        self.fetch_subscription(url, "Subscription imported successfully", "import");
    }

    pub fn update_subscription(&mut self) {
        let Some(url) = self.configs.subscription_url().map(str::to_string) else {
            self.error("Please import a subscription first");
            self.refresh();
            return;
        };
        self.fetch_subscription(&url, "Subscription updated successfully", "update");
    }

    fn fetch_subscription(&mut self, url: &str, success: &str, verb: &str) {
        self.cancel.reset();
        match self.configs.import_configs(url) {
            Ok(()) => self.notifier.show_message(success),
            Err(Error::Rejected(reason)) => self.error(reason),
            Err(Error::Cancelled) => self.notifier.show_message("Cancelled"),
            Err(error) => self.error(format!("Failed to {verb} subscription:\n{error}")),
        }
        self.refresh();
    }

    /// Arguments forwarded from the command line or from a second instance.
    pub fn handle_arguments(&mut self, arguments: &[String]) {
        for argument in arguments {
            if let Some(url) = argument.strip_prefix(IMPORT_URI_PREFIX) {
                log::info!("[supervisor] import requested by URI");
                self.import_subscription(url);
            } else {
                log::debug!("[supervisor] ignoring argument {argument:?}");
            }
        }
    }

    pub fn shutdown(&mut self) {
        log::info!("[supervisor] shutting down");
        self.stop_all();
        if or_false(self.proxy.server_set(), "ProxyServer") {
            self.set_proxy_enable(false);
        }
    }
}


#[cfg(test)]
mod tests {
    use base64::Engine;

    use super::{fake::RecordingNotifier, *};
    use crate::{
        process::fake::FakeProcess,
        subscription::fake::FakeSubscription,
        configuration::{DISCORD_PROXY_CONFIG, DISCORD_PROXY_DLLS, Paths},
        discord::fake::FakeProcessTable,
        system::{DeviceIdentity, proxy::memory::MemoryProxy},
    };

    const URL: &str = "https://sub.example/abc";

    struct Harness {
        _directory: tempfile::TempDir,
        paths: Paths,
        vpn: FakeProcess,
        tun: FakeProcess,
        proxy: MemoryProxy,
        client: FakeSubscription,
        notifier: RecordingNotifier,
        supervisor: Supervisor,
    }

    impl Harness {
        fn new(tun: FakeProcess, state: AppState) -> Self {
            let directory = tempfile::tempdir().unwrap();
            let paths = Paths::new(
                directory.path().to_path_buf(),
                directory.path().join("bin"),
                directory.path().join("Discord"),
            );
            paths.ensure_directories();

            let vpn = FakeProcess::default();
            let proxy = MemoryProxy::default();
            let client = FakeSubscription::default();
            client
                .reply(
                    &format!("{URL}/json"),
                    200,
                    r#"[{"remarks":"Amsterdam"},{"remarks":"Berlin"}]"#,
                )
                .reply(&format!("{URL}/mihomo"), 200, "mode: rule\n");
            let notifier = RecordingNotifier::default();

            let configs = ConfigManager::load(
                &paths,
                Box::new(client.clone()),
                DeviceIdentity {
                    hwid: "hw".to_string(),
                    os_name: "Linux".to_string(),
                    os_version: "6".to_string(),
                    device_model: "Test".to_string(),
                },
            );
            let discord = DiscordProxyManager::new(
                &paths.discord_directory,
                paths.discord_payload_directory(),
                DISCORD_PROXY_DLLS,
                DISCORD_PROXY_CONFIG,
                "127.0.0.1",
                2080,
                Box::new(FakeProcessTable::default()),
            );

            let supervisor = Supervisor::new(
                Box::new(vpn.clone()),
                Box::new(tun.clone()),
                SystemProxyManager::new(Box::new(proxy.clone()), "127.0.0.1", 2080),
                configs,
                discord,
                state,
                paths.settings_path(),
                CancelToken::new(),
                Box::new(notifier.clone()),
            );

            Self {
                _directory: directory,
                paths,
                vpn,
                tun,
                proxy,
                client,
                notifier,
                supervisor,
            }
        }

        fn imported(tun: FakeProcess, state: AppState) -> Self {
            let mut harness = Self::new(tun, state);
            harness.supervisor.import_subscription(URL);
            harness.notifier.recorded.lock().unwrap().messages.clear();
            harness
        }

        fn errors(&self) -> Vec<String> {
            self.notifier.recorded.lock().unwrap().errors.clone()
        }

        fn last_status(&self) -> Status {
            self.notifier
                .recorded
                .lock()
                .unwrap()
                .statuses
                .last()
                .cloned()
                .unwrap()
        }
    }

    fn tun_wanted() -> AppState {
        AppState {
            tun_enabled: true,
            ..AppState::default()
        }
    }

    #[test]
    fn start_requires_a_selected_server() {
        let mut harness = Harness::new(FakeProcess::default(), AppState::default());

        harness.supervisor.toggle_vpn();

        assert!(!harness.vpn.running());
        assert_eq!(harness.errors(), vec!["Server is not selected".to_string()]);
    }

    #[test]
    fn start_and_stop_drive_proxy_flag() {
        let mut harness = Harness::imported(FakeProcess::default(), AppState::default());
        harness.proxy.state.lock().unwrap().server = Some("127.0.0.1:2080".to_string());

        harness.supervisor.toggle_vpn();
        assert!(harness.vpn.running());
        assert!(harness.proxy.state.lock().unwrap().enabled);
        assert!(!harness.tun.running());

        harness.supervisor.toggle_vpn();
        assert!(!harness.vpn.running());
        assert!(!harness.proxy.state.lock().unwrap().enabled);
        assert!(harness.errors().is_empty());
        assert!(!harness.last_status().vpn_running);
    }

    #[test]
    fn start_leaves_foreign_proxy_disabled() {
        let mut harness = Harness::imported(FakeProcess::default(), AppState::default());
        harness.proxy.state.lock().unwrap().server = Some("10.0.0.1:3128".to_string());

        harness.supervisor.toggle_vpn();

        assert!(harness.vpn.running());
        assert!(!harness.proxy.state.lock().unwrap().enabled);
    }

    #[test]
    fn tun_failure_keeps_vpn_and_drops_intent() {
        let mut harness = Harness::imported(FakeProcess::failing("wintun missing"), tun_wanted());

        harness.supervisor.toggle_vpn();

        assert!(harness.vpn.running());
        assert!(!harness.tun.running());
        assert_eq!(harness.errors().len(), 1);
        assert!(harness.errors()[0].contains("wintun missing"));

        let status = harness.last_status();
        assert!(status.vpn_running);
        assert!(!status.tun_enabled);
        assert!(!AppState::load(&harness.paths.settings_path()).tun_enabled);
    }

    #[test]
    fn tun_follows_vpn() {
        let mut harness = Harness::imported(FakeProcess::default(), tun_wanted());

        harness.supervisor.toggle_vpn();
        assert!(harness.tun.running());

        harness.supervisor.toggle_vpn();
        assert!(!harness.tun.running());
        assert!(harness.last_status().tun_enabled);
    }

    #[test]
    fn toggle_tun_records_intent_while_vpn_is_off() {
        let mut harness = Harness::imported(FakeProcess::default(), AppState::default());

        harness.supervisor.toggle_tun();
        assert!(!harness.tun.running());
        assert!(AppState::load(&harness.paths.settings_path()).tun_enabled);

        harness.supervisor.toggle_vpn();
        assert!(harness.tun.running());

        harness.supervisor.toggle_tun();
        assert!(!harness.tun.running());
        assert!(harness.vpn.running());
        assert!(!harness.last_status().tun_enabled);
    }

    #[test]
    fn select_server_restarts_running_vpn() {
        let mut harness = Harness::imported(FakeProcess::default(), tun_wanted());
        harness.supervisor.toggle_vpn();

        harness.supervisor.select_server("Berlin");

        let vpn = harness.vpn.state.lock().unwrap();
        assert!(vpn.running);
        assert_eq!(vpn.starts, 2);
        assert_eq!(vpn.stops, 1);
        drop(vpn);
        let tun = harness.tun.state.lock().unwrap();
        assert!(tun.running);
        assert_eq!(tun.starts, 2);
        assert_eq!(tun.stops, 1);
        drop(tun);
        assert!(harness.errors().is_empty());
        assert_eq!(harness.last_status().current_remark.as_deref(), Some("Berlin"));
    }

    #[test]
    fn failed_restart_stops_tun_and_clears_proxy_flag() {
        let mut harness = Harness::imported(FakeProcess::default(), tun_wanted());
        harness.supervisor.toggle_system_proxy();
        harness.supervisor.toggle_vpn();
        assert!(harness.proxy.state.lock().unwrap().enabled);
        harness.vpn.state.lock().unwrap().fail_start = Some("port in use".to_string());

        harness.supervisor.select_server("Berlin");

        assert!(!harness.vpn.running());
        assert!(!harness.tun.running());
        assert!(!harness.proxy.state.lock().unwrap().enabled);
        let errors = harness.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("Failed to start VPN"));
        assert!(errors[0].contains("port in use"));

        let status = harness.last_status();
        assert!(!status.vpn_running);
        assert_eq!(status.current_remark.as_deref(), Some("Berlin"));
    }

    #[test]
    fn select_unknown_server_reports_error() {
        let mut harness = Harness::imported(FakeProcess::default(), AppState::default());

        harness.supervisor.select_server("Ghost");

        assert_eq!(harness.errors(), vec!["Server 'Ghost' not found".to_string()]);
        assert_eq!(harness.last_status().current_remark.as_deref(), Some("Amsterdam"));
    }

    #[test]
    fn toggle_system_proxy_round_trip() {
        let mut harness = Harness::imported(FakeProcess::default(), AppState::default());
        harness.supervisor.toggle_vpn();

        harness.supervisor.toggle_system_proxy();
        {
            let state = harness.proxy.state.lock().unwrap();
            assert_eq!(state.server.as_deref(), Some("127.0.0.1:2080"));
            assert!(state.enabled);
        }

        harness.supervisor.toggle_system_proxy();
        let state = harness.proxy.state.lock().unwrap();
        assert_eq!(state.server, None);
        assert!(!state.enabled);
    }

    #[test]
    fn system_proxy_is_not_enabled_without_vpn() {
        let mut harness = Harness::new(FakeProcess::default(), AppState::default());

        harness.supervisor.toggle_system_proxy();

        let state = harness.proxy.state.lock().unwrap();
        assert_eq!(state.server.as_deref(), Some("127.0.0.1:2080"));
        assert!(!state.enabled);
    }

    #[test]
    fn rejected_import_shows_decoded_reason() {
        let mut harness = Harness::new(FakeProcess::default(), AppState::default());
        let encoded = base64::engine::general_purpose::STANDARD.encode("Limit reached");
        harness
            .client
            .announce(&format!("{URL}/json"), &format!("base64:{encoded}"));

        harness.supervisor.import_subscription(URL);

        assert_eq!(harness.errors(), vec!["Limit reached".to_string()]);
        assert!(harness.last_status().servers.is_empty());
    }

    #[test]
    fn blank_import_and_missing_update_are_errors() {
        let mut harness = Harness::new(FakeProcess::default(), AppState::default());

        harness.supervisor.import_subscription("   ");
        harness.supervisor.update_subscription();

        assert_eq!(
            harness.errors(),
            vec![
                "Invalid subscription URL".to_string(),
                "Please import a subscription first".to_string(),
            ]
        );
    }

    #[test]
    fn update_uses_stored_url() {
        let mut harness = Harness::imported(FakeProcess::default(), AppState::default());

        harness.supervisor.update_subscription();

        let recorded = harness.notifier.recorded.lock().unwrap();
        assert_eq!(recorded.messages, vec!["Subscription updated successfully"]);
        assert_eq!(recorded.statuses.last().unwrap().servers, vec!["Amsterdam", "Berlin"]);
    }

    #[test]
    fn import_uri_argument_is_handled() {
        let mut harness = Harness::new(FakeProcess::default(), AppState::default());

        harness.supervisor.handle_arguments(&[
            "--minimized".to_string(),
            format!("xraygui://import/{URL}"),
        ]);

        assert_eq!(harness.last_status().current_remark.as_deref(), Some("Amsterdam"));
        assert_eq!(
            harness.notifier.recorded.lock().unwrap().messages,
            vec!["Subscription imported successfully"]
        );
    }

    #[test]
    fn discord_failure_is_reported() {
        let mut harness = Harness::new(FakeProcess::default(), AppState::default());

        harness.supervisor.toggle_discord_proxy();

        assert_eq!(harness.errors(), vec!["Failed to enable Discord proxy".to_string()]);
    }

    #[test]
    fn shutdown_stops_everything_and_clears_own_proxy() {
        let mut harness = Harness::imported(FakeProcess::default(), tun_wanted());
        harness.supervisor.toggle_system_proxy();
        harness.supervisor.toggle_vpn();
        assert!(harness.proxy.state.lock().unwrap().enabled);

        harness.supervisor.shutdown();

        assert!(!harness.vpn.running());
        assert!(!harness.tun.running());
        assert!(!harness.proxy.state.lock().unwrap().enabled);
    }
}
