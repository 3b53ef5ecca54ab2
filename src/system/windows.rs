use std::{
    io,
    process::{Child, Command, Stdio},
};

use super::{
    CREATE_NO_WINDOW, ChildProcess, DeviceIdentity, Launch,
    proxy::{ProxyStore, SystemProxyManager},
};
use crate::configuration::{PROXY_IP_ADDRESS, PROXY_PORT};

mod win32 {
    use windows::{
        Win32::{
            Foundation::{CloseHandle, HANDLE},
            System::{
                JobObjects::{
                    AssignProcessToJobObject, CreateJobObjectW, JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
                    JOBOBJECT_EXTENDED_LIMIT_INFORMATION, JobObjectExtendedLimitInformation,
                    SetInformationJobObject,
                },
                Threading::{GetProcessId, OpenProcess, PROCESS_TERMINATE, TerminateProcess},
            },
            UI::Shell::{SEE_MASK_NOCLOSEPROCESS, SHELLEXECUTEINFOW, ShellExecuteExW},
        },
        core::PCWSTR,
    };

    fn to_wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(std::iter::once(0)).collect()
    }

    pub fn terminate(process_id: u32, exit_code: u32) -> bool {
        unsafe {
            let handle = match OpenProcess(PROCESS_TERMINATE, false, process_id) {
                Ok(handle) => handle,
                Err(error) => {
                    log::warn!("[win32] OpenProcess failed for pid {process_id}: {error}");
                    return false;
                }
            };
            let result = TerminateProcess(handle, exit_code);
            let _ = CloseHandle(handle);
            if let Err(error) = result {
                log::warn!("[win32] TerminateProcess failed for pid {process_id}: {error}");
                return false;
            }
            true
        }
    }

    /// UAC `runas` launch that keeps the process handle for supervision.
    pub fn shell_execute_runas(
        file: &str,
        parameters: &str,
        directory: Option<&str>,
    ) -> Result<(HANDLE, u32), windows::core::Error> {
        let verb = to_wide("runas");
        let file_wide = to_wide(file);
        let parameters_wide = to_wide(parameters);
        let directory_wide = directory.map(to_wide);

        let mut info = SHELLEXECUTEINFOW {
            cbSize: std::mem::size_of::<SHELLEXECUTEINFOW>() as u32,
            fMask: SEE_MASK_NOCLOSEPROCESS,
            lpVerb: PCWSTR(verb.as_ptr()),
            lpFile: PCWSTR(file_wide.as_ptr()),
            lpParameters: PCWSTR(parameters_wide.as_ptr()),
            lpDirectory: directory_wide
                .as_ref()
                .map_or(PCWSTR::null(), |w| PCWSTR(w.as_ptr())),
            nShow: 0, // SW_HIDE
            ..Default::default()
        };

        unsafe { ShellExecuteExW(&mut info) }?;
        if info.hProcess.0.is_null() {
            return Err(windows::core::Error::new(
                windows::Win32::Foundation::E_FAIL,
                "ShellExecuteExW returned no process handle",
            ));
        }
        let process_id = unsafe { GetProcessId(info.hProcess) };
        Ok((info.hProcess, process_id))
    }

    /// All assigned processes die when the last handle closes (even on crash).
    pub fn create_kill_on_close_job() -> Option<HANDLE> {
        unsafe {
            let job = match CreateJobObjectW(None, None) {
                Ok(job) => job,
                Err(error) => {
                    log::warn!("[win32] CreateJobObjectW failed: {error}");
                    return None;
                }
            };

            let mut info = JOBOBJECT_EXTENDED_LIMIT_INFORMATION::default();
            info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;

            let result = SetInformationJobObject(
                job,
                JobObjectExtendedLimitInformation,
                &info as *const _ as *const std::ffi::c_void,
                std::mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
            );

            if let Err(error) = result {
                log::warn!("[win32] SetInformationJobObject failed: {error}");
                let _ = CloseHandle(job);
                return None;
            }

            Some(job)
        }
    }

    pub fn assign_process_to_job(job: HANDLE, process: HANDLE) -> bool {
        unsafe {
            match AssignProcessToJobObject(job, process) {
                Ok(()) => true,
                Err(error) => {
                    log::warn!("[win32] AssignProcessToJobObject failed: {error}");
                    false
                }
            }
        }
    }
}

pub struct JobGuard {
    handle: windows::Win32::Foundation::HANDLE,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        log::debug!("[job] closing job object handle");
        unsafe {
            let _ = windows::Win32::Foundation::CloseHandle(self.handle);
        }
    }
}

unsafe impl Send for JobGuard {}
unsafe impl Sync for JobGuard {}

fn create_child_job_guard(child: &Child) -> Option<JobGuard> {
    use std::os::windows::io::AsRawHandle;
    use windows::Win32::Foundation::HANDLE;

    let job = win32::create_kill_on_close_job()?;
    let process_handle = HANDLE(child.as_raw_handle());
    if win32::assign_process_to_job(job, process_handle) {
        log::info!(
            "[job] child pid={} assigned to kill-on-close job object",
            child.id(),
        );
        Some(JobGuard { handle: job })
    } else {
        unsafe {
            let _ = windows::Win32::Foundation::CloseHandle(job);
        }
        None
    }
}

/// Owned handle of a process started through `ShellExecuteExW`.
pub struct ProcessHandle {
    handle: windows::Win32::Foundation::HANDLE,
    process_id: u32,
}

unsafe impl Send for ProcessHandle {}

impl ProcessHandle {
    pub fn id(&self) -> u32 {
        self.process_id
    }

    pub fn exit_code(&self) -> Option<u32> {
        use windows::Win32::{
            Foundation::WAIT_OBJECT_0,
            System::Threading::{GetExitCodeProcess, WaitForSingleObject},
        };

        unsafe {
            if WaitForSingleObject(self.handle, 0) != WAIT_OBJECT_0 {
                return None;
            }
            let mut code = 0u32;
            GetExitCodeProcess(self.handle, &mut code).ok()?;
            Some(code)
        }
    }

    pub fn terminate(&self) -> io::Result<()> {
        use windows::Win32::System::Threading::{TerminateProcess, WaitForSingleObject};

        unsafe {
            TerminateProcess(self.handle, 1).map_err(|error| io::Error::other(error.to_string()))?;
            let _ = WaitForSingleObject(self.handle, 5000);
        }
        Ok(())
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        unsafe {
            let _ = windows::Win32::Foundation::CloseHandle(self.handle);
        }
    }
}

pub fn elevate_terminate_process(process_id: u32) -> bool {
    log::info!("[process] terminating pid {process_id} via native API");
    win32::terminate(process_id, 1)
}

fn quote_argument(argument: &str) -> String {
    if argument.is_empty() || argument.contains([' ', '\t', '"']) {
        format!("\"{}\"", argument.replace('"', "\\\""))
    } else {
        argument.to_string()
    }
}

pub fn spawn(launch: &Launch) -> io::Result<ChildProcess> {
    use std::os::windows::process::CommandExt;

    if launch.elevated && !is_running_as_admin() {
        let parameters = launch
            .arguments
            .iter()
            .map(|argument| quote_argument(&argument.to_string_lossy()))
            .collect::<Vec<_>>()
            .join(" ");
        let directory = launch
            .working_directory
            .as_ref()
            .map(|directory| directory.display().to_string());

        log::info!("[process] spawning elevated: {}", launch.display());

        let (handle, process_id) = win32::shell_execute_runas(
            &launch.program.display().to_string(),
            &parameters,
            directory.as_deref(),
        )
        .map_err(|error| {
            io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("UAC elevation was denied or ShellExecuteEx failed: {error}"),
            )
        })?;

        return Ok(ChildProcess::Elevated {
            handle: ProcessHandle { handle, process_id },
        });
    }

    log::info!("[process] spawning: {}", launch.display());

    let mut command = Command::new(&launch.program);
    command
        .args(&launch.arguments)
        .stdin(Stdio::null())
        .creation_flags(CREATE_NO_WINDOW);

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

    command.spawn().map(|child| {
        let _job_guard = create_child_job_guard(&child);
        ChildProcess::Direct {
            child,
            elevated: false,
            _job_guard,
        }
    })
}

pub fn is_running_as_admin() -> bool {
    use windows::Win32::UI::Shell::IsUserAnAdmin;
    unsafe { IsUserAnAdmin().as_bool() }
}

const INTERNET_SETTINGS_KEY: &str = r"Software\Microsoft\Windows\CurrentVersion\Internet Settings";

fn is_not_found(error: &windows::core::Error) -> bool {
    use windows::Win32::Foundation::ERROR_FILE_NOT_FOUND;
    error.code() == ERROR_FILE_NOT_FOUND.to_hresult()
}

fn to_io(error: windows::core::Error) -> io::Error {
    io::Error::other(error.to_string())
}

/// `HKCU\...\Internet Settings` values `ProxyServer` and `ProxyEnable`.
pub struct RegistryProxy;

impl ProxyStore for RegistryProxy {
    fn name(&self) -> &str {
        "Windows Registry"
    }

    fn server(&self) -> io::Result<Option<String>> {
        let key = windows_registry::CURRENT_USER
            .open(INTERNET_SETTINGS_KEY)
            .map_err(to_io)?;
        match key.get_string("ProxyServer") {
            Ok(server) => Ok(Some(server)),
            Err(error) if is_not_found(&error) => Ok(None),
            Err(error) => Err(to_io(error)),
        }
    }

    fn set_server(&mut self, server: &str) -> io::Result<()> {
        windows_registry::CURRENT_USER
            .create(INTERNET_SETTINGS_KEY)
            .and_then(|key| key.set_string("ProxyServer", server))
            .map_err(to_io)
    }

    fn delete_server(&mut self) -> io::Result<()> {
        let key = windows_registry::CURRENT_USER
            .create(INTERNET_SETTINGS_KEY)
            .map_err(to_io)?;
        match key.remove_value("ProxyServer") {
            Ok(()) => Ok(()),
            Err(error) if is_not_found(&error) => Ok(()),
            Err(error) => Err(to_io(error)),
        }
    }

    fn enabled(&self) -> io::Result<bool> {
        let key = windows_registry::CURRENT_USER
            .open(INTERNET_SETTINGS_KEY)
            .map_err(to_io)?;
        match key.get_u32("ProxyEnable") {
            Ok(value) => Ok(value != 0),
            Err(error) if is_not_found(&error) => Ok(false),
            Err(error) => Err(to_io(error)),
        }
    }

    fn set_enabled(&mut self, enabled: bool) -> io::Result<()> {
        windows_registry::CURRENT_USER
            .create(INTERNET_SETTINGS_KEY)
            .and_then(|key| key.set_u32("ProxyEnable", u32::from(enabled)))
            .map_err(to_io)
    }

    /// Some consumers only listen to one of the two codes.
    fn notify_changed(&mut self) {
        use windows::Win32::Networking::WinInet::{
            INTERNET_OPTION_REFRESH, INTERNET_OPTION_SETTINGS_CHANGED, InternetSetOptionW,
        };

        unsafe {
            let _ = InternetSetOptionW(None, INTERNET_OPTION_SETTINGS_CHANGED, None, 0);
            let _ = InternetSetOptionW(None, INTERNET_OPTION_REFRESH, None, 0);
        }
    }
}

pub fn system_proxy_store() -> Box<dyn ProxyStore> {
    Box::new(RegistryProxy)
}

pub fn device_identity() -> DeviceIdentity {
    let hwid = windows_registry::LOCAL_MACHINE
        .open(r"SOFTWARE\Microsoft\Cryptography")
        .and_then(|key| key.get_string("MachineGuid"))
        .unwrap_or_else(|error| {
            log::warn!("[identity] MachineGuid unavailable: {error}");
            String::new()
        });

    let os_version = windows_registry::LOCAL_MACHINE
        .open(r"SOFTWARE\Microsoft\Windows NT\CurrentVersion")
        .map(|key| {
            let major = key.get_u32("CurrentMajorVersionNumber").unwrap_or(10);
            let minor = key.get_u32("CurrentMinorVersionNumber").unwrap_or(0);
            let build = key.get_string("CurrentBuildNumber").unwrap_or_default();
            format!("{major}.{minor}.{build}")
        })
        .unwrap_or_default();

    let device_model = windows_registry::LOCAL_MACHINE
        .open(r"HARDWARE\DESCRIPTION\System\BIOS")
        .and_then(|key| key.get_string("SystemProductName"))
        .unwrap_or_default();

    DeviceIdentity {
        hwid,
        os_name: "Windows".to_string(),
        os_version,
        device_model,
    }
}

/// Drops our ProxyEnable flag when the console is closed under us.
pub fn install_ctrl_handler() {
    use windows::{
        Win32::System::Console::{
            CTRL_CLOSE_EVENT, CTRL_LOGOFF_EVENT, CTRL_SHUTDOWN_EVENT, SetConsoleCtrlHandler,
        },
        core::BOOL,
    };

    unsafe extern "system" fn handler(ctrl_type: u32) -> BOOL {
        match ctrl_type {
            x if x == CTRL_CLOSE_EVENT || x == CTRL_LOGOFF_EVENT || x == CTRL_SHUTDOWN_EVENT => {
                log::info!("[ctrl_handler] received control event {x}, clearing proxy flag");
                let mut proxy =
                    SystemProxyManager::new(Box::new(RegistryProxy), PROXY_IP_ADDRESS, PROXY_PORT);
                if proxy.server_set().unwrap_or(false) {
                    let _ = proxy.set_enable(false);
                }
                BOOL(1)
            }
            _ => BOOL(0),
        }
    }

    if let Err(error) = unsafe { SetConsoleCtrlHandler(Some(handler), true) } {
        log::warn!("[startup] SetConsoleCtrlHandler failed: {error}");
    } else {
        log::info!("[startup] console control handler installed");
    }
}
