use crate::error::{Error, Result};
use std::ffi::OsStr;
use std::process::{Output, Stdio};
use tokio::process::Command;
use tracing::debug;

/// pkexec: authentication dialog dismissed.
const EXIT_DISMISSED: i32 = 126;
/// pkexec: not authorized or authentication failed.
const EXIT_NOT_AUTHORIZED: i32 = 127;

/// Run `program args..` through the elevation helper.
///
/// Refusal by the user or the policy maps to `PermissionDenied`; anything
/// else that prevents the command from succeeding maps to
/// `DaemonUnreachable`. Never retried here.
pub async fn run_elevated<I, S>(helper: &str, program: &OsStr, args: I) -> Result<Output>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(helper);
    cmd.arg(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!("Running elevated command: {:?}", cmd);

    let output = cmd.output().await.map_err(|e| {
        Error::DaemonUnreachable(format!("elevation helper {} unavailable: {}", helper, e))
    })?;

    check_elevated_status(&output, program)?;
    Ok(output)
}

fn check_elevated_status(output: &Output, program: &OsStr) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    match output.status.code() {
        Some(EXIT_DISMISSED) | Some(EXIT_NOT_AUTHORIZED) => Err(Error::PermissionDenied(
            if stderr.is_empty() {
                "elevation was refused".to_string()
            } else {
                stderr
            },
        )),
        code => Err(Error::DaemonUnreachable(format!(
            "{} exited with {:?}: {}",
            program.to_string_lossy(),
            code,
            stderr
        ))),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;

    fn output(code: i32, stderr: &str) -> Output {
        Output {
            status: ExitStatus::from_raw(code << 8),
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    #[test]
    fn dismissed_dialog_is_permission_denied() {
        let err = check_elevated_status(&output(126, ""), OsStr::new("systemctl")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        let err = check_elevated_status(&output(127, "Not authorized"), OsStr::new("systemctl"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }

    #[test]
    fn other_failures_are_daemon_unreachable() {
        let err = check_elevated_status(&output(5, "Unit not found"), OsStr::new("systemctl"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DaemonUnreachable);
        assert!(err.to_string().contains("Unit not found"));
        assert!(check_elevated_status(&output(0, ""), OsStr::new("true")).is_ok());
    }

    #[tokio::test]
    async fn missing_helper_is_daemon_unreachable() {
        let err = run_elevated("/nonexistent/elevate", OsStr::new("true"), Vec::<String>::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DaemonUnreachable);
    }
}
