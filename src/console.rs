use crate::supervisor::{Notifier, Status};

pub const HELP: &str = "\
commands:
  vpn              start or stop the VPN
  tun              toggle TUN mode
  proxy            toggle the system proxy
  discord          toggle the Discord proxy
  select <remark>  switch server
  import <url>     import a subscription
  update           refresh the current subscription
  servers          list servers
  status           show status
  cancel           abort a running subscription request
  quit             stop everything and exit";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    ToggleVpn,
    ToggleTun,
    ToggleSystemProxy,
    ToggleDiscordProxy,
    Select(String),
    Import(String),
    Update,
    Servers,
    Status,
    Cancel,
    Help,
    Quit,
}

/// `Ok(None)` for blank lines.
pub fn parse(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };

    let command = match verb.to_ascii_lowercase().as_str() {
        "vpn" => Command::ToggleVpn,
        "tun" => Command::ToggleTun,
        "proxy" => Command::ToggleSystemProxy,
        "discord" => Command::ToggleDiscordProxy,
        "select" if rest.is_empty() => return Err("usage: select <remark>".to_string()),
        "select" => Command::Select(rest.to_string()),
        "import" if rest.is_empty() => return Err("usage: import <url>".to_string()),
        "import" => Command::Import(rest.to_string()),
        "update" => Command::Update,
        "servers" => Command::Servers,
        "status" => Command::Status,
        "cancel" => Command::Cancel,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(format!("unknown command '{other}', type 'help'")),
    };
    Ok(Some(command))
}

fn on_off(value: bool) -> &'static str {
    if value { "on" } else { "off" }
}

pub fn render_status(status: &Status) -> String {
    format!(
        "VPN: {} | TUN: {} (wanted: {}) | system proxy: {} | Discord proxy: {} | server: {}",
        if status.vpn_running { "running" } else { "stopped" },
        on_off(status.tun_running),
        on_off(status.tun_enabled),
        if status.system_proxy_set && status.system_proxy_enabled {
            "on"
        } else if status.system_proxy_set {
            "set"
        } else {
            "off"
        },
        on_off(status.discord_proxy_enabled),
        status.current_remark.as_deref().unwrap_or("Not selected"),
    )
}

pub fn render_servers(status: &Status) -> String {
    if status.servers.is_empty() {
        return "no servers, import a subscription first".to_string();
    }
    status
        .servers
        .iter()
        .map(|remark| {
            let marker = if status.current_remark.as_deref() == Some(remark.as_str()) {
                '*'
            } else {
                ' '
            };
            format!("{marker} {remark}")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Prints outcomes to the terminal, repeating the status line only when it changes.
#[derive(Default)]
pub struct ConsoleNotifier {
    last_status: Option<Status>,
}

impl Notifier for ConsoleNotifier {
    fn show_error(&mut self, message: &str) {
        eprintln!("error: {message}");
    }

    fn show_message(&mut self, message: &str) {
        println!("{message}");
    }

    fn status_changed(&mut self, status: &Status) {
        if self.last_status.as_ref() != Some(status) {
            println!("{}", render_status(status));
            self.last_status = Some(status.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands() {
        assert_eq!(parse("  "), Ok(None));
        assert_eq!(parse("VPN"), Ok(Some(Command::ToggleVpn)));
        assert_eq!(
            parse("select  New York 2 "),
            Ok(Some(Command::Select("New York 2".to_string())))
        );
        assert_eq!(
            parse("import https://sub.example/abc"),
            Ok(Some(Command::Import("https://sub.example/abc".to_string())))
        );
        assert_eq!(parse("exit"), Ok(Some(Command::Quit)));
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse("select").is_err());
        assert!(parse("import   ").is_err());
        assert!(parse("launch").unwrap_err().contains("launch"));
    }

    #[test]
    fn status_line() {
        let status = Status {
            vpn_running: true,
            tun_enabled: true,
            system_proxy_set: true,
            system_proxy_enabled: true,
            current_remark: Some("Amsterdam".to_string()),
            ..Status::default()
        };
        assert_eq!(
            render_status(&status),
            "VPN: running | TUN: off (wanted: on) | system proxy: on | Discord proxy: off | server: Amsterdam"
        );
        assert!(render_status(&Status::default()).ends_with("server: Not selected"));
    }

    #[test]
    fn server_list_marks_current() {
        let status = Status {
            current_remark: Some("Berlin".to_string()),
            servers: vec!["Amsterdam".to_string(), "Berlin".to_string()],
            ..Status::default()
        };
        assert_eq!(render_servers(&status), "  Amsterdam\n* Berlin");
    }
}
