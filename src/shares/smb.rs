use super::{Credentials, Share, ShareBackend, ShareKey, ShareType, SpaceStats};
use crate::error::{Error, Result};
use crate::utils::config::SharesConfig;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

static DU_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d+) blocks of size (\d+)\. (\d+) blocks available").expect("valid regex")
});

const AUTH_FAILURES: &[&str] = &[
    "NT_STATUS_LOGON_FAILURE",
    "NT_STATUS_ACCESS_DENIED",
    "NT_STATUS_WRONG_PASSWORD",
    "NT_STATUS_ACCOUNT_DISABLED",
    "NT_STATUS_ACCOUNT_LOCKED_OUT",
];

const UNREACHABLE: &[&str] = &[
    "NT_STATUS_HOST_UNREACHABLE",
    "NT_STATUS_NETWORK_UNREACHABLE",
    "NT_STATUS_CONNECTION_REFUSED",
    "NT_STATUS_IO_TIMEOUT",
    "NT_STATUS_UNSUCCESSFUL",
    "NT_STATUS_RESOURCE_NAME_NOT_FOUND",
];

/// SMB shares through the `smbclient` and `gio` command line tools.
///
/// Passwords travel through the `PASSWD` environment variable or stdin,
/// never through the argument list.
pub struct SmbClientBackend {
    config: SharesConfig,
}

impl SmbClientBackend {
    pub fn new(config: SharesConfig) -> Self {
        Self { config }
    }

    fn smbclient(&self, credentials: Option<&Credentials>) -> Command {
        let mut cmd = Command::new(&self.config.smbclient_path);
        cmd.arg("-W").arg(&self.config.workgroup);
        match credentials {
            Some(c) => {
                cmd.arg("-U").arg(&c.username);
                cmd.env("PASSWD", &c.password);
            }
            None => {
                cmd.arg("-N");
            }
        }
        cmd.stdin(Stdio::null());
        cmd
    }

    async fn run(&self, mut cmd: Command, subject: &str) -> Result<Output> {
        let output = tokio::time::timeout(self.config.command_timeout, cmd.output())
            .await
            .map_err(|_| Error::Timeout {
                what: subject.to_string(),
                elapsed_ms: self.config.command_timeout.as_millis() as u64,
            })?
            .map_err(|e| Error::NotReachable(format!("cannot run smbclient: {}", e)))?;

        if output.status.success() {
            return Ok(output);
        }
        let text = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        Err(classify_failure(&text, subject))
    }

    fn mount_point(&self, share: &ShareKey) -> Result<PathBuf> {
        let runtime = dirs::runtime_dir().ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "XDG_RUNTIME_DIR is not set, cannot locate gvfs mounts",
            ))
        })?;
        Ok(gvfs_mount_point(&runtime, share))
    }
}

/// Where gvfs exposes a mounted SMB share under the user's runtime dir.
fn gvfs_mount_point(runtime_dir: &Path, share: &ShareKey) -> PathBuf {
    runtime_dir.join("gvfs").join(format!(
        "smb-share:server={},share={}",
        share.host.to_lowercase(),
        share.name.to_lowercase()
    ))
}

#[async_trait]
impl ShareBackend for SmbClientBackend {
    async fn list_shares(&self, host: &str, credentials: Option<&Credentials>) -> Result<Vec<Share>> {
        let mut cmd = self.smbclient(credentials);
        cmd.arg("-g").arg("-L").arg(format!("//{}", host));

        let output = self.run(cmd, host).await?;
        let shares = parse_share_list(host, &String::from_utf8_lossy(&output.stdout));
        debug!(host, "smbclient listed {} shares", shares.len());
        Ok(shares)
    }

    async fn space(&self, share: &ShareKey, credentials: Option<&Credentials>) -> Result<SpaceStats> {
        let mut cmd = self.smbclient(credentials);
        cmd.arg(share.to_string()).arg("-c").arg("du");

        let subject = share.to_string();
        let output = self.run(cmd, &subject).await?;
        parse_du(&String::from_utf8_lossy(&output.stdout))
            .ok_or_else(|| Error::NotReachable(format!("{}: unexpected du output", subject)))
    }

    async fn open(&self, share: &ShareKey, credentials: Option<&Credentials>) -> Result<PathBuf> {
        let mount_point = self.mount_point(share)?;
        if tokio::fs::metadata(&mount_point).await.is_ok() {
            return Ok(mount_point);
        }

        let location = match credentials {
            Some(c) => format!("smb://{}@{}/{}", c.username, share.host, share.name),
            None => format!("smb://{}/{}", share.host, share.name),
        };
        let mut cmd = Command::new(&self.config.gio_path);
        cmd.arg("mount");
        if credentials.is_none() {
            cmd.arg("--anonymous");
        }
        cmd.arg(&location)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let subject = share.to_string();
        let mut child = cmd
            .spawn()
            .map_err(|e| Error::NotReachable(format!("cannot run gio: {}", e)))?;

        // gio asks for user, domain and password in that order.
        if let (Some(mut stdin), Some(c)) = (child.stdin.take(), credentials) {
            let answers = format!("{}\n{}\n{}\n", c.username, self.config.workgroup, c.password);
            stdin.write_all(answers.as_bytes()).await?;
        }

        let output = tokio::time::timeout(self.config.command_timeout, child.wait_with_output())
            .await
            .map_err(|_| Error::Timeout {
                what: format!("mounting {}", subject),
                elapsed_ms: self.config.command_timeout.as_millis() as u64,
            })??;

        let text = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        if !output.status.success() && !text.contains("already mounted") {
            return Err(classify_failure(&text, &subject));
        }

        if tokio::fs::metadata(&mount_point).await.is_err() {
            return Err(Error::NotReachable(format!(
                "{} mounted but {} is missing",
                subject,
                mount_point.display()
            )));
        }

        info!("Mounted {} at {}", subject, mount_point.display());
        Ok(mount_point)
    }
}

fn classify_failure(text: &str, subject: &str) -> Error {
    let upper = text.to_uppercase();
    if AUTH_FAILURES.iter().any(|s| upper.contains(s))
        || upper.contains("PERMISSION DENIED")
        || upper.contains("LOGIN FAILED")
    {
        return Error::AuthenticationFailed(subject.to_string());
    }
    if upper.contains("NT_STATUS_BAD_NETWORK_NAME") {
        return Error::not_found("share", subject);
    }
    if UNREACHABLE.iter().any(|s| upper.contains(s)) {
        return Error::NotReachable(subject.to_string());
    }
    let detail = text.lines().last().unwrap_or("").trim();
    Error::NotReachable(format!("{}: {}", subject, detail))
}

/// Parse `smbclient -g -L` output: `Type|Name|Comment` per line.
fn parse_share_list(host: &str, output: &str) -> Vec<Share> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.splitn(3, '|');
            let share_type = match fields.next()? {
                "Disk" => ShareType::Disk,
                "Printer" => ShareType::Printer,
                "IPC" => ShareType::Ipc,
                "Device" => ShareType::Device,
                _ => return None,
            };
            let name = fields.next()?.trim();
            if name.is_empty() {
                return None;
            }
            let comment = fields
                .next()
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string);
            Some(Share {
                host: host.to_string(),
                name: name.to_string(),
                share_type,
                pinned: false,
                comment,
                username: None,
            })
        })
        .collect()
}

fn parse_du(output: &str) -> Option<SpaceStats> {
    let caps = DU_LINE.captures(output)?;
    let blocks: u64 = caps[1].parse().ok()?;
    let size: u64 = caps[2].parse().ok()?;
    let free: u64 = caps[3].parse().ok()?;

    let total = blocks.checked_mul(size)?;
    let available = free.checked_mul(size)?.min(total);
    Some(SpaceStats {
        total,
        used: total - available,
        available,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn parses_grepable_listing() {
        let out = "Disk|photos|Family photos\nIPC|IPC$|IPC Service (nas)\nPrinter|laser|\nWorkgroup|WORKGROUP|NAS\n";
        let shares = parse_share_list("nas", out);
        assert_eq!(shares.len(), 3);
        assert_eq!(shares[0].name, "photos");
        assert_eq!(shares[0].comment.as_deref(), Some("Family photos"));
        assert_eq!(shares[1].share_type, ShareType::Ipc);
        assert_eq!(shares[2].share_type, ShareType::Printer);
        assert!(shares[2].comment.is_none());
    }

    #[test]
    fn parses_du() {
        let out = "\n\t\t1000 blocks of size 1024. 250 blocks available\nTotal number of bytes: 0\n";
        let stats = parse_du(out).unwrap();
        assert_eq!(stats.total, 1_024_000);
        assert_eq!(stats.available, 256_000);
        assert_eq!(stats.used, 768_000);
        assert!(parse_du("garbage").is_none());
    }

    #[test]
    fn failures_map_to_kinds() {
        let auth = classify_failure("session setup failed: NT_STATUS_LOGON_FAILURE", "//nas/x");
        assert_eq!(auth.kind(), ErrorKind::AuthenticationFailed);

        let down = classify_failure("do_connect: Connection to nas failed (Error NT_STATUS_HOST_UNREACHABLE)", "//nas/x");
        assert_eq!(down.kind(), ErrorKind::NotReachable);

        let missing = classify_failure("tree connect failed: NT_STATUS_BAD_NETWORK_NAME", "//nas/x");
        assert_eq!(missing.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn mount_point_lives_under_runtime_dir() {
        let point = gvfs_mount_point(Path::new("/run/user/1000"), &ShareKey::new("NAS", "Photos"));
        assert_eq!(
            point,
            PathBuf::from("/run/user/1000/gvfs/smb-share:server=nas,share=photos")
        );
    }

    #[test]
    fn credentials_stay_off_the_command_line() {
        let backend = SmbClientBackend::new(SharesConfig::default());
        let creds = Credentials {
            username: "alice".into(),
            password: "s3cret".into(),
        };
        let cmd = backend.smbclient(Some(&creds));
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(args.contains(&"alice".to_string()));
        assert!(!args.iter().any(|a| a.contains("s3cret")));
    }
}
