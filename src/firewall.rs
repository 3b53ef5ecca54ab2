use std::path::{Path, PathBuf};

use crate::{error::Result, system::run_checked};

/// Inbound allow rule for one executable, managed through `netsh advfirewall`.
pub struct FirewallManager {
    netsh: PathBuf,
    rule_name: String,
}

impl FirewallManager {
    pub fn new(rule_name: impl Into<String>) -> Self {
        Self::with_netsh("netsh", rule_name)
    }

    pub fn with_netsh(netsh: impl Into<PathBuf>, rule_name: impl Into<String>) -> Self {
        Self {
            netsh: netsh.into(),
            rule_name: rule_name.into(),
        }
    }

    pub fn add_rule(&self, executable: &Path) -> Result<()> {
        let program = std::path::absolute(executable).unwrap_or_else(|_| executable.to_path_buf());
        log::info!(
            "[firewall] adding inbound rule {} for {}",
            self.rule_name,
            program.display()
        );
        run_checked(
            &self.netsh,
            &[
                "advfirewall".to_string(),
                "firewall".to_string(),
                "add".to_string(),
                "rule".to_string(),
                format!("name={}", self.rule_name),
                "dir=in".to_string(),
                "action=allow".to_string(),
                format!("program={}", program.display()),
                "enable=yes".to_string(),
            ],
        )?;
        Ok(())
    }

    pub fn delete_rule(&self) -> Result<()> {
        log::info!("[firewall] deleting rule {}", self.rule_name);
        run_checked(
            &self.netsh,
            &[
                "advfirewall".to_string(),
                "firewall".to_string(),
                "delete".to_string(),
                "rule".to_string(),
                format!("name={}", self.rule_name),
            ],
        )?;
        Ok(())
    }
}
