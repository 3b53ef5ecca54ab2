use std::{
    io::{self, Read, Write},
    net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream},
    thread,
    time::Duration,
};

const CONNECT_TIMEOUT: Duration = Duration::from_millis(250);
const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Held by the first instance; the bound loopback port is the lock.
pub struct SingleInstanceGuard {
    listener: Option<TcpListener>,
}

impl SingleInstanceGuard {
    pub fn port(&self) -> Option<u16> {
        self.listener
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
            .map(|address| address.port())
    }

    /// Accepts forwarded argument lists on a background thread.
    pub fn listen<F>(self, mut forward: F)
    where
        F: FnMut(Vec<String>) + Send + 'static,
    {
        let Some(listener) = self.listener else {
            return;
        };
        thread::spawn(move || {
            for stream in listener.incoming() {
                match stream.and_then(read_arguments) {
                    Ok(arguments) => {
                        log::info!("[ipc] received {} arguments", arguments.len());
                        forward(arguments);
                    }
                    Err(error) => log::warn!("[ipc] dropped connection: {error}"),
                }
            }
        });
    }
}

fn read_arguments(mut stream: TcpStream) -> io::Result<Vec<String>> {
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    let mut payload = Vec::new();
    stream.read_to_end(&mut payload)?;
    serde_json::from_slice(&payload).map_err(io::Error::other)
}

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

/// `None` when another instance already owns the port.
pub fn acquire(port: u16) -> Option<SingleInstanceGuard> {
    match TcpListener::bind(loopback(port)) {
        Ok(listener) => Some(SingleInstanceGuard {
            listener: Some(listener),
        }),
        Err(error) if error.kind() == io::ErrorKind::AddrInUse => None,
        Err(error) => {
            log::warn!("[ipc] cannot bind 127.0.0.1:{port}: {error}");
            Some(SingleInstanceGuard { listener: None })
        }
    }
}

/// Sends this launch's arguments to the running instance.
pub fn pass_to_primary(port: u16, arguments: &[String]) -> bool {
    let send = || -> io::Result<()> {
        let mut stream = TcpStream::connect_timeout(&loopback(port), CONNECT_TIMEOUT)?;
        let payload = serde_json::to_vec(arguments).map_err(io::Error::other)?;
        stream.write_all(&payload)?;
        stream.flush()
    };
    match send() {
        Ok(()) => true,
        Err(error) => {
            log::warn!("[ipc] cannot reach running instance: {error}");
            false
        }
    }
}
