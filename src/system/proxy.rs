use std::io;

/// OS-global proxy settings, shared with every other program on the machine.
pub trait ProxyStore: Send {
    fn name(&self) -> &str;

    /// `None` when the address value is absent.
    fn server(&self) -> io::Result<Option<String>>;
    fn set_server(&mut self, server: &str) -> io::Result<()>;
    /// Absence of the value is not an error.
    fn delete_server(&mut self) -> io::Result<()>;

    fn enabled(&self) -> io::Result<bool>;
    fn set_enabled(&mut self, enabled: bool) -> io::Result<()>;

    /// Broadcasts that the settings changed so running consumers reload them.
    fn notify_changed(&mut self);
}

pub struct SystemProxyManager {
    store: Box<dyn ProxyStore>,
    address: String,
}

impl SystemProxyManager {
    pub fn new(store: Box<dyn ProxyStore>, ip_address: &str, port: u16) -> Self {
        Self {
            store,
            address: format!("{ip_address}:{port}"),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn set_server(&mut self) -> io::Result<()> {
        log::info!(
            "[proxy] {}: setting ProxyServer to {}",
            self.store.name(),
            self.address
        );
        self.store.set_server(&self.address)?;
        self.store.notify_changed();
        Ok(())
    }

    pub fn delete_server(&mut self) -> io::Result<()> {
        log::info!("[proxy] {}: removing ProxyServer", self.store.name());
        self.store.delete_server()?;
        self.store.notify_changed();
        Ok(())
    }

    /// Enabling is refused silently unless the stored address is ours, so another
    /// tool's proxy is never switched on by us.
    pub fn set_enable(&mut self, enable: bool) -> io::Result<()> {
        if enable && !self.server_set()? {
            log::info!(
                "[proxy] ProxyServer is not {}, leaving ProxyEnable untouched",
                self.address
            );
            return Ok(());
        }
        log::info!("[proxy] {}: ProxyEnable={enable}", self.store.name());
        self.store.set_enabled(enable)?;
        self.store.notify_changed();
        Ok(())
    }

    pub fn server_set(&self) -> io::Result<bool> {
        Ok(self.store.server()?.as_deref() == Some(self.address.as_str()))
    }

    pub fn enable_set(&self) -> io::Result<bool> {
        self.store.enabled()
    }
}
