//! TTY probe
//!
//! Runs a fixed shell command under the pseudo console so a client can see
//! what the child observes, then appends what the host observes about its
//! own end of the terminal.

#[cfg(windows)]
use std::path::PathBuf;

use crate::core::pty::{NativeCapabilities, PtySize};
use crate::request::ExecutionRequest;

/// Prefix for every line of the host-side report.
pub const REPORT_PREFIX: &str = "[tty-probe]";

#[cfg(unix)]
const PROBE_SCRIPT: &str =
    "echo tty-probe; if [ -t 1 ]; then echo stdout: tty; else echo stdout: not a tty; fi; stty size";

#[cfg(windows)]
const PROBE_SCRIPT: &str = "echo tty-probe& mode con";

/// The probe command sized `size`.
#[cfg(unix)]
pub fn probe_request(size: PtySize) -> ExecutionRequest {
    ExecutionRequest::new("/bin/sh", vec!["-c".to_string(), PROBE_SCRIPT.to_string()]).with_size(size)
}

/// The probe command sized `size`.
#[cfg(windows)]
pub fn probe_request(size: PtySize) -> ExecutionRequest {
    let shell = std::env::var_os("ComSpec")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(r"C:\Windows\System32\cmd.exe"));
    ExecutionRequest::new(
        shell,
        vec!["/d".to_string(), "/c".to_string(), PROBE_SCRIPT.to_string()],
    )
    .with_size(size)
}

/// Render the host-side capability lines, CRLF terminated like the
/// terminal output they follow.
pub fn format_report(capabilities: &NativeCapabilities) -> String {
    let device = if capabilities.character_device {
        "yes"
    } else {
        "no"
    };
    let mode = match &capabilities.mode_query {
        Ok(size) => format!("ok ({})", size),
        Err(detail) => format!("failed ({})", detail),
    };
    format!(
        "{REPORT_PREFIX} character device: {device} ({})\r\n{REPORT_PREFIX} terminal mode query: {mode}\r\n",
        capabilities.device_detail
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_lines() {
        let report = format_report(&NativeCapabilities {
            character_device: true,
            device_detail: "pseudo terminal master".into(),
            mode_query: Ok(PtySize::new(120, 30)),
        });
        assert_eq!(
            report,
            "[tty-probe] character device: yes (pseudo terminal master)\r\n\
             [tty-probe] terminal mode query: ok (120x30)\r\n"
        );
    }

    #[test]
    fn test_report_failed_query() {
        let report = format_report(&NativeCapabilities {
            character_device: false,
            device_detail: "anonymous pipe owned by the pseudo console".into(),
            mode_query: Err("ResizePseudoConsole failed".into()),
        });
        assert!(report.contains("character device: no (anonymous pipe"));
        assert!(report.contains("terminal mode query: failed (ResizePseudoConsole failed)"));
    }

    #[test]
    fn test_probe_request_uses_size() {
        let request = probe_request(PtySize::new(90, 20));
        assert_eq!(request.size, PtySize::new(90, 20));
        assert!(request.command_line().contains("tty-probe"));
    }
}
