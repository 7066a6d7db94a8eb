use super::privilege::run_elevated;
use super::OverlayClient;
use crate::error::{Error, Result};
use crate::utils::config::OverlayConfig;
use async_trait::async_trait;
use std::ffi::OsStr;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};

const REQUIRED_CAPS: [&str; 2] = ["cap_net_admin", "cap_net_raw"];

/// Overlay client backed by the system daemon, its CLI and systemd.
pub struct SystemOverlayClient {
    config: OverlayConfig,
}

impl SystemOverlayClient {
    pub fn new(config: OverlayConfig) -> Self {
        Self { config }
    }

    /// Monitoring is enabled while this marker file exists.
    fn monitor_flag_path(&self) -> PathBuf {
        self.config.user_token_path.with_file_name("monitor.enabled")
    }

    async fn elevated(&self, program: &OsStr, args: &[&OsStr]) -> Result<std::process::Output> {
        run_elevated(&self.config.elevate_command, program, args.iter().copied()).await
    }

    async fn elevated_command(&self, command: &[String]) -> Result<()> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| Error::validation("configured command is empty"))?;
        run_elevated(&self.config.elevate_command, OsStr::new(program), args).await?;
        Ok(())
    }

    async fn systemctl(&self, verb: &str) -> Result<()> {
        self.elevated(
            OsStr::new("systemctl"),
            &[OsStr::new(verb), OsStr::new(&self.config.service_name)],
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl OverlayClient for SystemOverlayClient {
    async fn installed_version(&self) -> Result<Option<String>> {
        let output = match Command::new(&self.config.cli_path).arg("-v").output().await {
            Ok(output) => output,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::DaemonUnreachable(e.to_string())),
        };

        if !output.status.success() {
            return Err(Error::DaemonUnreachable(format!(
                "{} -v failed: {}",
                self.config.cli_path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(parse_version(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn is_running(&self) -> Result<bool> {
        let status = Command::new("systemctl")
            .args(["is-active", "--quiet", self.config.service_name.as_str()])
            .status()
            .await
            .map_err(|e| Error::DaemonUnreachable(format!("systemctl unavailable: {}", e)))?;
        Ok(status.success())
    }

    async fn read_auth_token(&self) -> Result<Option<String>> {
        let mut denied = false;

        for path in [&self.config.user_token_path, &self.config.auth_token_path] {
            match tokio::fs::read_to_string(path).await {
                Ok(content) => {
                    let token = content.trim();
                    if !token.is_empty() {
                        return Ok(Some(token.to_string()));
                    }
                }
                Err(e) if e.kind() == IoErrorKind::PermissionDenied => {
                    debug!("Token at {} is not readable", path.display());
                    denied = true;
                }
                Err(e) if e.kind() == IoErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        if denied {
            Ok(None)
        } else {
            Err(Error::not_found(
                "auth token",
                self.config.auth_token_path.display().to_string(),
            ))
        }
    }

    async fn has_capabilities(&self) -> Result<bool> {
        let output = match Command::new("getcap")
            .arg(&self.config.daemon_binary)
            .output()
            .await
        {
            Ok(output) => output,
            Err(e) => {
                warn!("getcap unavailable, assuming no capabilities: {}", e);
                return Ok(false);
            }
        };
        Ok(has_required_caps(&String::from_utf8_lossy(&output.stdout)))
    }

    fn setcap_command(&self) -> String {
        format!(
            "sudo setcap {}=+eip {}",
            REQUIRED_CAPS.join(","),
            self.config.daemon_binary.display()
        )
    }

    async fn init_auth_token(&self) -> Result<String> {
        let output = self
            .elevated(
                OsStr::new("cat"),
                &[self.config.auth_token_path.as_os_str()],
            )
            .await?;

        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if token.is_empty() {
            return Err(Error::DaemonUnreachable(
                "daemon has not created an auth token yet".to_string(),
            ));
        }

        write_private(&self.config.user_token_path, &token).await?;
        info!("Cached overlay auth token at {}", self.config.user_token_path.display());
        Ok(token)
    }

    async fn install(&self) -> Result<()> {
        self.elevated_command(&self.config.install_command).await
    }

    async fn uninstall(&self) -> Result<()> {
        self.elevated_command(&self.config.uninstall_command).await?;
        match tokio::fs::remove_file(&self.config.user_token_path).await {
            Err(e) if e.kind() != IoErrorKind::NotFound => {
                warn!("Could not remove cached token: {}", e)
            }
            _ => {}
        }
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.systemctl("start").await
    }

    async fn stop(&self) -> Result<()> {
        self.systemctl("stop").await
    }

    async fn monitoring(&self) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.monitor_flag_path()).await?)
    }

    async fn set_monitoring(&self, enabled: bool) -> Result<()> {
        let path = self.monitor_flag_path();
        if enabled {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, b"").await?;
        } else {
            match tokio::fs::remove_file(&path).await {
                Err(e) if e.kind() != IoErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
        }
        debug!("Overlay monitoring flag set to {}", enabled);
        Ok(())
    }
}

/// First non-empty line of `<cli> -v`
fn parse_version(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

fn has_required_caps(getcap_output: &str) -> bool {
    REQUIRED_CAPS.iter().all(|cap| getcap_output.contains(cap))
}

async fn write_private(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, content).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(())
}
