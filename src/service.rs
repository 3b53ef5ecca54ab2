use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use crate::{
    error::{Error, Result},
    firewall::FirewallManager,
    process::SupervisedProcess,
    system::{run_checked, run_silent_with_output},
};

/// Wraps an executable as an OS service through the bundled NSSM helper.
pub struct ServiceManager {
    nssm: PathBuf,
    service_name: String,
}

impl ServiceManager {
    pub fn new(nssm: impl Into<PathBuf>, service_name: impl Into<String>) -> Self {
        Self {
            nssm: nssm.into(),
            service_name: service_name.into(),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    fn require_helper(&self) -> Result<()> {
        if self.nssm.is_file() {
            Ok(())
        } else {
            Err(Error::Precondition(format!(
                "NSSM not found at '{}'",
                self.nssm.display()
            )))
        }
    }

    fn run(&self, arguments: &[OsString]) -> Result<String> {
        run_checked(&self.nssm, arguments)
    }

    fn command(&self, verb: &str) -> Vec<OsString> {
        vec![verb.into(), self.service_name.as_str().into()]
    }

    /// Registers the service and marks it auto-start. When the second step fails the
    /// service stays installed without autostart and the error is returned.
    pub fn install(&self, executable: &Path, arguments: &[OsString]) -> Result<()> {
        self.require_helper()?;
        if !executable.is_file() {
            return Err(Error::Precondition(format!(
                "Executable not found at '{}'",
                executable.display()
            )));
        }

        let mut install = self.command("install");
        install.push(executable.as_os_str().to_os_string());
        install.extend(arguments.iter().cloned());
        self.run(&install)?;
        log::info!("[service] {} installed", self.service_name);

        let mut autostart = self.command("set");
        autostart.push("Start".into());
        autostart.push("SERVICE_AUTO_START".into());
        self.run(&autostart)?;
        Ok(())
    }

    pub fn remove(&self) -> Result<()> {
        self.require_helper()?;
        let mut remove = self.command("remove");
        remove.push("confirm".into());
        self.run(&remove)?;
        log::info!("[service] {} removed", self.service_name);
        Ok(())
    }

    pub fn start(&self) -> Result<()> {
        self.require_helper()?;
        self.run(&self.command("start"))?;
        log::info!("[service] {} started", self.service_name);
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        self.require_helper()?;
        if !self.is_running() {
            return Ok(());
        }
        self.run(&self.command("stop"))?;
        log::info!("[service] {} stopped", self.service_name);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.status()
            .is_some_and(|status| status == "SERVICE_RUNNING")
    }

    pub fn is_installed(&self) -> bool {
        self.status().is_some()
    }

    fn status(&self) -> Option<String> {
        match run_silent_with_output(&self.nssm, &self.command("status")) {
            Ok(output) if output.success => Some(output.stdout.trim().to_string()),
            Ok(_) => None,
            Err(error) => {
                log::debug!("[service] status query failed: {error}");
                None
            }
        }
    }
}

/// Runs the VPN core as a service, opening the firewall for it while installed.
pub struct ServiceProcess {
    service: ServiceManager,
    firewall: FirewallManager,
    executable: PathBuf,
    arguments: Vec<OsString>,
    config_path: PathBuf,
}

impl ServiceProcess {
    pub fn new(
        service: ServiceManager,
        firewall: FirewallManager,
        executable: impl Into<PathBuf>,
        arguments: Vec<OsString>,
        config_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            service,
            firewall,
            executable: executable.into(),
            arguments,
            config_path: config_path.into(),
        }
    }

    /// The xray core as `<svc> run -c <config>`.
    pub fn xray(
        service: ServiceManager,
        firewall: FirewallManager,
        executable: &Path,
        config_path: &Path,
    ) -> Self {
        let arguments = vec!["run".into(), "-c".into(), config_path.as_os_str().to_os_string()];
        Self::new(service, firewall, executable, arguments, config_path)
    }
}

impl SupervisedProcess for ServiceProcess {
    fn name(&self) -> &str {
        self.service.service_name()
    }

    fn start(&mut self) -> Result<()> {
        if self.service.is_running() {
            return Ok(());
        }
        if !self.config_path.is_file() {
            return Err(Error::Precondition(format!(
                "Config file not found at '{}'",
                self.config_path.display()
            )));
        }

        self.firewall.add_rule(&self.executable)?;
        if self.service.is_installed() {
            log::debug!("[service] {} already installed", self.service.service_name());
        } else {
            self.service.install(&self.executable, &self.arguments)?;
        }
        self.service.start()
    }

    fn stop(&mut self) -> Result<()> {
        if !self.service.is_running() {
            return Ok(());
        }
        self.service.stop()?;
        self.service.remove()?;
        self.firewall.delete_rule()
    }

    fn is_running(&mut self) -> bool {
        self.service.is_running()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    /// Shell stand-in for nssm keeping the service state in a file.
    struct FakeNssm {
        directory: tempfile::TempDir,
    }

    impl FakeNssm {
        fn new() -> Self {
            let directory = tempfile::tempdir().unwrap();
            let root = directory.path().display().to_string();
            let script = format!(
                r#"#!/bin/sh
echo "$@" >> '{root}/calls.log'
state='{root}/state'
case "$1" in
  install) echo SERVICE_STOPPED > "$state" ;;
  set) [ -f '{root}/fail_set' ] && {{ echo 'set failed' >&2; exit 1; }}; [ -f "$state" ] || exit 3 ;;
  start) [ -f "$state" ] || {{ echo "Can't open service!" >&2; exit 3; }}; echo SERVICE_RUNNING > "$state" ;;
  stop) [ -f "$state" ] || exit 3; echo SERVICE_STOPPED > "$state" ;;
  remove) [ -f "$state" ] || exit 3; rm -f "$state" ;;
  status) [ -f "$state" ] || {{ echo "Can't open service!" >&2; exit 3; }}; cat "$state" ;;
esac
exit 0
"#
            );
            write_script(&directory.path().join("nssm"), &script);
            write_script(
                &directory.path().join("netsh"),
                &format!("#!/bin/sh\necho \"$@\" >> '{root}/netsh.log'\n"),
            );
            std::fs::write(directory.path().join("xray"), "").unwrap();
            std::fs::write(directory.path().join("config.json"), "{}").unwrap();
            Self { directory }
        }

        fn path(&self, name: &str) -> PathBuf {
            self.directory.path().join(name)
        }

        fn manager(&self) -> ServiceManager {
            ServiceManager::new(self.path("nssm"), "XrayGUIService")
        }

        fn calls(&self) -> Vec<String> {
            std::fs::read_to_string(self.path("calls.log"))
                .unwrap_or_default()
                .lines()
                .map(str::to_string)
                .collect()
        }

        fn service_process(&self) -> ServiceProcess {
            ServiceProcess::xray(
                self.manager(),
                FirewallManager::with_netsh(self.path("netsh"), "XrayGUI"),
                &self.path("xray"),
                &self.path("config.json"),
            )
        }
    }

    fn write_script(path: &Path, content: &str) {
        std::fs::write(path, content).unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn install_sets_autostart() {
        let fake = FakeNssm::new();
        let manager = fake.manager();

        manager
            .install(&fake.path("xray"), &["run".into()])
            .unwrap();

        let calls = fake.calls();
        assert_eq!(
            calls[0],
            format!("install XrayGUIService {} run", fake.path("xray").display())
        );
        assert_eq!(calls[1], "set XrayGUIService Start SERVICE_AUTO_START");
        assert!(manager.is_installed());
        assert!(!manager.is_running());
    }

    #[test]
    fn failed_autostart_leaves_service_installed() {
        let fake = FakeNssm::new();
        std::fs::write(fake.path("fail_set"), "").unwrap();
        let manager = fake.manager();

        let error = manager.install(&fake.path("xray"), &[]).unwrap_err();
        assert!(matches!(error, Error::Command { ref detail, .. } if detail == "set failed"));
        assert!(manager.is_installed());
    }

    #[test]
    fn start_stop_remove_cycle() {
        let fake = FakeNssm::new();
        let manager = fake.manager();
        manager.install(&fake.path("xray"), &[]).unwrap();

        manager.start().unwrap();
        assert!(manager.is_running());

        manager.stop().unwrap();
        assert!(!manager.is_running());
        manager.remove().unwrap();
        assert!(!manager.is_installed());
    }

    #[test]
    fn stop_is_idempotent() {
        let fake = FakeNssm::new();
        let manager = fake.manager();

        manager.stop().unwrap();
        manager.stop().unwrap();
        assert!(!fake.calls().iter().any(|call| call.starts_with("stop")));
    }

    #[test]
    fn missing_helper_is_a_precondition_error() {
        let manager = ServiceManager::new("/nonexistent/nssm.exe", "XrayGUIService");

        assert!(matches!(manager.start(), Err(Error::Precondition(_))));
        assert!(matches!(manager.stop(), Err(Error::Precondition(_))));
        assert!(matches!(manager.remove(), Err(Error::Precondition(_))));
        assert!(matches!(
            manager.install(Path::new("/bin/sh"), &[]),
            Err(Error::Precondition(_))
        ));
        assert!(!manager.is_running());
        assert!(!manager.is_installed());
    }

    #[test]
    fn install_requires_target_executable() {
        let fake = FakeNssm::new();
        let error = fake
            .manager()
            .install(Path::new("/nonexistent/xray"), &[])
            .unwrap_err();
        assert!(matches!(error, Error::Precondition(_)));
        assert!(fake.calls().is_empty());
    }

    #[test]
    fn service_process_round_trip() {
        let fake = FakeNssm::new();
        let mut process = fake.service_process();

        process.start().unwrap();
        assert!(process.is_running());
        process.start().unwrap();

        process.stop().unwrap();
        assert!(!process.is_running());
        process.stop().unwrap();

        let installs = fake
            .calls()
            .iter()
            .filter(|call| call.starts_with("install"))
            .count();
        assert_eq!(installs, 1);

        let firewall = std::fs::read_to_string(fake.path("netsh.log")).unwrap();
        let lines: Vec<&str> = firewall.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("advfirewall firewall add rule name=XrayGUI"));
        assert_eq!(lines[1], "advfirewall firewall delete rule name=XrayGUI");
    }

    #[test]
    fn service_process_skips_install_when_present() {
        let fake = FakeNssm::new();
        fake.manager().install(&fake.path("xray"), &[]).unwrap();
        let before = fake.calls().len();

        let mut process = fake.service_process();
        process.start().unwrap();

        let calls = fake.calls();
        assert!(!calls[before..].iter().any(|call| call.starts_with("install")));
        assert!(process.is_running());
    }

    #[test]
    fn service_process_requires_config() {
        let fake = FakeNssm::new();
        std::fs::remove_file(fake.path("config.json")).unwrap();

        let mut process = fake.service_process();
        assert!(matches!(process.start(), Err(Error::Precondition(_))));
        assert!(!fake.path("netsh.log").exists());
    }
}
