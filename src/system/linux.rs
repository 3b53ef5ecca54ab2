use std::{
    io,
    path::Path,
    process::{Command, Stdio},
};

use super::{ChildProcess, DeviceIdentity, Launch, proxy::ProxyStore, run_silent_with_output};

pub fn elevate_terminate_process(process_id: u32) -> bool {
    let process_id_string = process_id.to_string();
    run_silent_with_output(Path::new("pkexec"), &["kill", "-KILL", &process_id_string])
        .map(|output| output.success)
        .unwrap_or(false)
}

pub fn spawn(launch: &Launch) -> io::Result<ChildProcess> {
    let mut command = if launch.elevated {
        let mut command = Command::new("pkexec");
        command.arg(&launch.program);
        command
    } else {
        Command::new(&launch.program)
    };
    command.args(&launch.arguments).stdin(Stdio::null());

    if let Some(directory) = &launch.working_directory {
        command.current_dir(directory);
    }

    match launch.open_log() {
        Some((stdout, stderr)) => {
            command.stdout(stdout).stderr(stderr);
        }
        None => {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }
    }

    log::info!(
        "[process] spawning: {}{}",
        if launch.elevated { "pkexec " } else { "" },
        launch.display()
    );

    command.spawn().map(|child| ChildProcess::Direct {
        child,
        elevated: launch.elevated,
    })
}

/// GNOME proxy settings standing in for the registry `ProxyServer`/`ProxyEnable` pair:
/// the HTTP host/port carry the address, `mode == 'manual'` is the enabled flag.
pub struct GsettingsProxy;

impl GsettingsProxy {
    fn get(schema: &str, key: &str) -> io::Result<String> {
        let output = run_silent_with_output(Path::new("gsettings"), &["get", schema, key])?;
        if !output.success {
            return Err(io::Error::other(format!(
                "gsettings get {schema} {key}: {}",
                output.stderr.trim()
            )));
        }
        Ok(output.stdout.trim().trim_matches('\'').to_string())
    }

    fn set(schema: &str, key: &str, value: &str) -> io::Result<()> {
        let output = run_silent_with_output(Path::new("gsettings"), &["set", schema, key, value])?;
        if output.success {
            Ok(())
        } else {
            Err(io::Error::other(format!(
                "gsettings set {schema} {key}: {}",
                output.stderr.trim()
            )))
        }
    }
}

impl ProxyStore for GsettingsProxy {
    fn name(&self) -> &str {
        "GSettings"
    }

    fn server(&self) -> io::Result<Option<String>> {
        let host = Self::get("org.gnome.system.proxy.http", "host")?;
        if host.is_empty() {
            return Ok(None);
        }
        let port = Self::get("org.gnome.system.proxy.http", "port")?;
        Ok(Some(format!("{host}:{port}")))
    }

    fn set_server(&mut self, server: &str) -> io::Result<()> {
        let (host, port) = server.rsplit_once(':').unwrap_or((server, "0"));
        Self::set("org.gnome.system.proxy.http", "host", host)?;
        Self::set("org.gnome.system.proxy.http", "port", port)?;
        Self::set("org.gnome.system.proxy.https", "host", host)?;
        Self::set("org.gnome.system.proxy.https", "port", port)
    }

    fn delete_server(&mut self) -> io::Result<()> {
        for schema in ["org.gnome.system.proxy.http", "org.gnome.system.proxy.https"] {
            Self::set(schema, "host", "")?;
            Self::set(schema, "port", "0")?;
        }
        Ok(())
    }

    fn enabled(&self) -> io::Result<bool> {
        Ok(Self::get("org.gnome.system.proxy", "mode")? == "manual")
    }

    fn set_enabled(&mut self, enabled: bool) -> io::Result<()> {
        Self::set(
            "org.gnome.system.proxy",
            "mode",
            if enabled { "manual" } else { "none" },
        )
    }

    /// GSettings consumers watch the keys directly.
    fn notify_changed(&mut self) {}
}

pub fn system_proxy_store() -> Box<dyn ProxyStore> {
    Box::new(GsettingsProxy)
}

fn read_trimmed(path: &str) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|content| content.trim().to_string())
        .filter(|content| !content.is_empty())
}

pub fn device_identity() -> DeviceIdentity {
    DeviceIdentity {
        hwid: read_trimmed("/etc/machine-id")
            .or_else(|| read_trimmed("/var/lib/dbus/machine-id"))
            .unwrap_or_default(),
        os_name: "Linux".to_string(),
        os_version: read_trimmed("/proc/sys/kernel/osrelease").unwrap_or_default(),
        device_model: read_trimmed("/sys/class/dmi/id/product_name").unwrap_or_default(),
    }
}
