mod app_state;
mod config_manager;
mod configuration;
mod console;
mod discord;
mod error;
mod firewall;
mod persist;
mod process;
mod service;
mod single_instance;
mod subscription;
mod supervisor;
mod system;

use std::{
    io::BufRead,
    sync::{Arc, mpsc},
    thread,
    time::Duration,
};

use http_client::HttpClient;
use reqwest_client::ReqwestClient;

use crate::{
    app_state::{AppState, VpnBackend},
    config_manager::ConfigManager,
    configuration::{
        DISCORD_PROXY_CONFIG, DISCORD_PROXY_DLLS, FIREWALL_RULE, IPC_PORT, PROXY_IP_ADDRESS,
        PROXY_PORT, Paths, SERVICE_NAME,
    },
    console::{Command, ConsoleNotifier, HELP},
    discord::{DiscordProxyManager, SysinfoProcessTable},
    firewall::FirewallManager,
    process::{ProcessManager, SupervisedProcess},
    service::{ServiceManager, ServiceProcess},
    subscription::{CancelToken, HttpSubscriptionClient},
    supervisor::Supervisor,
    system::proxy::SystemProxyManager,
};

enum Event {
    Command(Command),
    Arguments(Vec<String>),
    InputClosed,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("xraygui=info"))
        .init();

    log::info!(
        "xraygui v{} starting (RUST_LOG={})",
        env!("CARGO_PKG_VERSION"),
        std::env::var("RUST_LOG").unwrap_or_else(|_| "<default: info>".into()),
    );

    let arguments: Vec<String> = std::env::args().skip(1).collect();

    let Some(instance) = single_instance::acquire(IPC_PORT) else {
        if single_instance::pass_to_primary(IPC_PORT, &arguments) {
            log::info!("[startup] arguments handed to the running instance");
            return;
        }
        eprintln!("XrayGUI is already running.");
        std::process::exit(1);
    };

    log::info!("[ipc] listening on port {:?}", instance.port());

    let paths = Paths::discover();
    paths.ensure_directories();
    log::info!(
        "[startup] config: {}, bin: {}",
        paths.config_directory.display(),
        paths.bin_directory.display()
    );

    let state = AppState::load(&paths.settings_path());
    let cancel = CancelToken::new();
    let mut supervisor = build_supervisor(&paths, state, cancel.clone());

    #[cfg(target_os = "windows")]
    system::install_ctrl_handler();

    let (sender, receiver) = mpsc::channel();
    {
        let sender = sender.clone();
        instance.listen(move |arguments| {
            let _ = sender.send(Event::Arguments(arguments));
        });
    }
    spawn_console_reader(sender, cancel);

    supervisor.handle_arguments(&arguments);
    supervisor.refresh();
    println!("type 'help' for commands");

    for event in receiver {
        match event {
            Event::Arguments(arguments) => supervisor.handle_arguments(&arguments),
            Event::Command(command) => {
                if !dispatch(&mut supervisor, command) {
                    break;
                }
            }
            Event::InputClosed => break,
        }
    }

    supervisor.shutdown();
    log::info!("[startup] bye");
}

/// Returns false once the user asked to quit.
fn dispatch(supervisor: &mut Supervisor, command: Command) -> bool {
    match command {
        Command::ToggleVpn => supervisor.toggle_vpn(),
        Command::ToggleTun => supervisor.toggle_tun(),
        Command::ToggleSystemProxy => supervisor.toggle_system_proxy(),
        Command::ToggleDiscordProxy => supervisor.toggle_discord_proxy(),
        Command::Select(remark) => supervisor.select_server(&remark),
        Command::Import(url) => supervisor.import_subscription(&url),
        Command::Update => supervisor.update_subscription(),
        Command::Servers => println!("{}", console::render_servers(&supervisor.status())),
        Command::Status => println!("{}", console::render_status(&supervisor.status())),
        Command::Help => println!("{HELP}"),
        // Handled on the input thread while a request is in flight.
        Command::Cancel => {}
        Command::Quit => return false,
    }
    true
}

fn spawn_console_reader(sender: mpsc::Sender<Event>, cancel: CancelToken) {
    thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            match console::parse(&line) {
                Ok(Some(Command::Cancel)) => cancel.cancel(),
                Ok(Some(command)) => {
                    let quit = command == Command::Quit;
                    if sender.send(Event::Command(command)).is_err() || quit {
                        return;
                    }
                }
                Ok(None) => {}
                Err(message) => eprintln!("{message}"),
            }
        }
        let _ = sender.send(Event::InputClosed);
    });
}

fn build_supervisor(paths: &Paths, state: AppState, cancel: CancelToken) -> Supervisor {
    let vpn: Box<dyn SupervisedProcess> = match state.vpn_backend {
        VpnBackend::Process => Box::new(ProcessManager::xray(
            &paths.xray_path(),
            &paths.active_config_path(),
            &paths.log_directory,
        )),
        VpnBackend::Service => Box::new(ServiceProcess::xray(
            ServiceManager::new(paths.nssm_path(), SERVICE_NAME),
            FirewallManager::new(FIREWALL_RULE),
            &paths.xray_path(),
            &paths.active_config_path(),
        )),
    };
    log::info!("[startup] VPN backend: {:?}", state.vpn_backend);

    let tun = ProcessManager::tun(
        &paths.tun_path(),
        &paths.tun_config_path(),
        &paths.log_directory,
    );

    let http_client: Arc<dyn HttpClient> = Arc::new(ReqwestClient::new());
    let subscription = HttpSubscriptionClient::new(
        http_client,
        Duration::from_secs(state.http_timeout_secs),
        cancel.clone(),
    );
    let configs = ConfigManager::load(paths, Box::new(subscription), system::device_identity());

    let discord = DiscordProxyManager::new(
        &paths.discord_directory,
        paths.discord_payload_directory(),
        DISCORD_PROXY_DLLS,
        DISCORD_PROXY_CONFIG,
        PROXY_IP_ADDRESS,
        PROXY_PORT,
        Box::new(SysinfoProcessTable::new()),
    );

    let proxy = SystemProxyManager::new(system::system_proxy_store(), PROXY_IP_ADDRESS, PROXY_PORT);

    Supervisor::new(
        vpn,
        Box::new(tun),
        proxy,
        configs,
        discord,
        state,
        paths.settings_path(),
        cancel,
        Box::new(ConsoleNotifier::default()),
    )
}
