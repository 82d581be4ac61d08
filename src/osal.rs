//! Operating system abstraction: host identification and power control

use crate::command::ProcessRunner;
use device_cloud_shared::status;
use std::collections::HashMap;
use std::process::Stdio;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info, warn};

const UNKNOWN: &str = "Unknown";
const OS_RELEASE_PATH: &str = "/etc/os-release";
const KERNEL_RELEASE_PATH: &str = "/proc/sys/kernel/osrelease";

/// Host platform families with distinct system commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    MacOs,
    Windows,
    Other,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "linux") {
            Platform::Linux
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else if cfg!(target_os = "windows") {
            Platform::Windows
        } else {
            Platform::Other
        }
    }

    pub fn is_posix(self) -> bool {
        matches!(self, Platform::Linux | Platform::MacOs)
    }
}

/// Operating system kernel version
pub async fn kernel_version() -> String {
    match Platform::current() {
        Platform::Linux => fs::read_to_string(KERNEL_RELEASE_PATH)
            .await
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| UNKNOWN.to_string()),
        Platform::MacOs => command_output("uname", &["-r"]).await,
        Platform::Windows => command_output("cmd", &["/C", "ver"]).await,
        Platform::Other => UNKNOWN.to_string(),
    }
}

/// Operating system name, e.g. `Ubuntu (GNU/Linux)`
pub async fn os_name() -> String {
    match Platform::current() {
        Platform::Linux => {
            let release = read_os_release().await;
            let distro = release.get("NAME").map(String::as_str).unwrap_or(UNKNOWN);
            format!("{} (GNU/Linux)", distro)
        }
        Platform::MacOs => "macOS".to_string(),
        Platform::Windows => "Windows".to_string(),
        Platform::Other => UNKNOWN.to_string(),
    }
}

/// Operating system version, e.g. `22.04-jammy`
pub async fn os_version() -> String {
    match Platform::current() {
        Platform::Linux => linux_version(&read_os_release().await),
        Platform::MacOs => command_output("sw_vers", &["-productVersion"]).await,
        Platform::Windows => command_output("cmd", &["/C", "ver"]).await,
        Platform::Other => UNKNOWN.to_string(),
    }
}

fn linux_version(release: &HashMap<String, String>) -> String {
    match (release.get("VERSION_ID"), release.get("VERSION_CODENAME")) {
        (Some(id), Some(codename)) if !codename.is_empty() => format!("{}-{}", id, codename),
        (Some(id), _) => id.clone(),
        (None, _) => UNKNOWN.to_string(),
    }
}

async fn read_os_release() -> HashMap<String, String> {
    fs::read_to_string(OS_RELEASE_PATH)
        .await
        .map(|text| parse_os_release(&text))
        .unwrap_or_default()
}

/// Parse `KEY=value` lines of an os-release file, stripping quotes
pub fn parse_os_release(text: &str) -> HashMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| {
            let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
            (key.trim().to_string(), value.to_string())
        })
        .collect()
}

async fn command_output(program: &str, args: &[&str]) -> String {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await;

    match output {
        Ok(output) if output.status.success() => {
            let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if text.is_empty() {
                UNKNOWN.to_string()
            } else {
                text
            }
        }
        Ok(output) => {
            debug!("[OSAL] {} exited with {}", program, output.status);
            UNKNOWN.to_string()
        }
        Err(e) => {
            debug!("[OSAL] Failed to run {}: {}", program, e);
            UNKNOWN.to_string()
        }
    }
}

/// Argument vector that halts or reboots the host; `None` if unsupported
pub fn shutdown_command(
    platform: Platform,
    delay_minutes: u32,
    reboot: bool,
    force: bool,
) -> Option<Vec<String>> {
    let argv: Vec<String> = match platform {
        Platform::Linux | Platform::MacOs => {
            let when = if delay_minutes == 0 {
                "now".to_string()
            } else {
                format!("+{}", delay_minutes)
            };
            let mode = if reboot { "-r" } else { "-h" };
            vec!["sudo".into(), "/sbin/shutdown".into(), mode.into(), when]
        }
        Platform::Windows => {
            let mode = if reboot { "/r" } else { "/s" };
            let mut argv = vec![
                "shutdown".to_string(),
                mode.to_string(),
                "/t".to_string(),
                (u64::from(delay_minutes) * 60).to_string(),
            ];
            if force {
                argv.push("/f".to_string());
            }
            argv
        }
        Platform::Other => return None,
    };
    Some(argv)
}

/// Reboot the host after `delay_minutes`
pub async fn reboot(runner: &dyn ProcessRunner, delay_minutes: i64, force: bool) -> i32 {
    power_off(runner, Platform::current(), delay_minutes, true, force).await
}

/// Halt the host after `delay_minutes`
pub async fn shutdown(runner: &dyn ProcessRunner, delay_minutes: i64, force: bool) -> i32 {
    power_off(runner, Platform::current(), delay_minutes, false, force).await
}

async fn power_off(
    runner: &dyn ProcessRunner,
    platform: Platform,
    delay_minutes: i64,
    reboot: bool,
    force: bool,
) -> i32 {
    let Ok(delay) = u32::try_from(delay_minutes) else {
        warn!("[OSAL] Invalid delay {} minutes", delay_minutes);
        return status::BAD_PARAMETER;
    };

    let Some(argv) = shutdown_command(platform, delay, reboot, force) else {
        warn!("[OSAL] Power control not supported on {:?}", platform);
        return status::NOT_SUPPORTED;
    };

    info!("[OSAL] Running {:?}", argv);
    match runner.run(&argv).await {
        Ok(output) => output.code.unwrap_or(status::EXECUTION_FAILURE),
        Err(e) => {
            warn!("[OSAL] Failed to run {:?}: {}", argv, e);
            status::EXECUTION_FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::ProcessOutput;
    use async_trait::async_trait;
    use std::io;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingRunner {
        calls: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl ProcessRunner for RecordingRunner {
        async fn run(&self, argv: &[String]) -> io::Result<ProcessOutput> {
            self.calls.lock().unwrap().push(argv.to_vec());
            Ok(ProcessOutput {
                code: Some(0),
                ..Default::default()
            })
        }
    }

    struct BrokenRunner;

    #[async_trait]
    impl ProcessRunner for BrokenRunner {
        async fn run(&self, _argv: &[String]) -> io::Result<ProcessOutput> {
            Err(io::Error::new(io::ErrorKind::NotFound, "no shutdown binary"))
        }
    }

    #[test]
    fn test_posix_shutdown_commands() {
        assert_eq!(
            shutdown_command(Platform::Linux, 0, false, true).unwrap(),
            vec!["sudo", "/sbin/shutdown", "-h", "now"]
        );
        assert_eq!(
            shutdown_command(Platform::MacOs, 5, true, true).unwrap(),
            vec!["sudo", "/sbin/shutdown", "-r", "+5"]
        );
    }

    #[test]
    fn test_windows_shutdown_command() {
        assert_eq!(
            shutdown_command(Platform::Windows, 2, false, true).unwrap(),
            vec!["shutdown", "/s", "/t", "120", "/f"]
        );
        assert_eq!(
            shutdown_command(Platform::Windows, 0, true, false).unwrap(),
            vec!["shutdown", "/r", "/t", "0"]
        );
    }

    #[test]
    fn test_unknown_platform_is_unsupported() {
        assert!(shutdown_command(Platform::Other, 0, false, true).is_none());
    }

    #[tokio::test]
    async fn test_power_off_status_codes() {
        let runner = RecordingRunner::default();

        assert_eq!(
            power_off(&runner, Platform::Other, 0, false, true).await,
            status::NOT_SUPPORTED
        );
        assert_eq!(
            power_off(&runner, Platform::Linux, -1, false, true).await,
            status::BAD_PARAMETER
        );
        assert!(runner.calls.lock().unwrap().is_empty());

        assert_eq!(power_off(&runner, Platform::Linux, 1, true, true).await, 0);
        assert_eq!(runner.calls.lock().unwrap()[0][2], "-r");

        assert_eq!(
            power_off(&BrokenRunner, Platform::Linux, 0, false, true).await,
            status::EXECUTION_FAILURE
        );
    }

    #[test]
    fn test_parse_os_release() {
        let text = "NAME=\"Ubuntu\"\nVERSION_ID=\"22.04\"\n# comment\nVERSION_CODENAME=jammy\n";
        let release = parse_os_release(text);

        assert_eq!(release["NAME"], "Ubuntu");
        assert_eq!(linux_version(&release), "22.04-jammy");
        assert_eq!(linux_version(&HashMap::new()), UNKNOWN);
    }

    #[tokio::test]
    async fn test_host_queries_never_empty() {
        assert!(!kernel_version().await.is_empty());
        assert!(!os_name().await.is_empty());
        assert!(!os_version().await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_program_reads_unknown() {
        assert_eq!(
            command_output("device-cloud-no-such-program", &[]).await,
            UNKNOWN
        );
    }
}
