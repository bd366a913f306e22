//! Network reachability check of the cape.

use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Return true if `host` answers a single ping request.
///
/// Some hosts drop ICMP even when up; a `false` only means no echo reply
/// was received.
pub async fn is_reachable(host: &str) -> bool {
    let count_flag = if cfg!(windows) { "-n" } else { "-c" };

    let status = Command::new("ping")
        .args([count_flag, "1", host])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;

    match status {
        Ok(status) => {
            debug!("ping {} exited with {}", host, status);
            status.success()
        }
        Err(e) => {
            debug!("Failed to run ping: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_host_is_unreachable() {
        assert!(!is_reachable("host.invalid").await);
    }
}
