//! Test helpers for timing-sensitive tests
//!
//! Overlay tests poll for asynchronous effects (handshakes completing on the
//! far side, gossip arriving) instead of sleeping a fixed amount.

use mumble_core::P2pConfig;
use mumble_crypto::EncryptedMessage;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Check if running in a CI environment
///
/// Checks common CI environment variables.
pub fn is_ci_environment() -> bool {
    std::env::var("CI").is_ok()
        || std::env::var("GITHUB_ACTIONS").is_ok()
        || std::env::var("GITLAB_CI").is_ok()
        || std::env::var("CIRCLECI").is_ok()
        || std::env::var("TRAVIS").is_ok()
}

/// Get CI-adjusted timeout duration
///
/// Returns a timeout that's longer in CI environments to account for
/// resource contention and slower machines.
pub fn ci_timeout(base_timeout: Duration) -> Duration {
    if is_ci_environment() {
        base_timeout.mul_f32(3.0)
    } else {
        base_timeout.mul_f32(1.5)
    }
}

/// Poll `condition` every 20ms until it holds or `timeout` (CI-adjusted) passes
///
/// Returns whether the condition was met.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + ci_timeout(timeout);
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Await `future` with a CI-adjusted timeout, `None` if it did not finish
pub async fn within<F: Future>(timeout: Duration, future: F) -> Option<F::Output> {
    tokio::time::timeout(ci_timeout(timeout), future).await.ok()
}

/// Loopback config with LAN discovery off and quiet background loops
pub fn test_config() -> P2pConfig {
    let mut config = P2pConfig {
        listen_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
        ..P2pConfig::default()
    };
    config.lan.enabled = false;
    config.reconnect.enabled = false;
    config
}

/// Deterministic stand-in for an encrypted payload
pub fn payload(seed: u8) -> EncryptedMessage {
    EncryptedMessage::new([seed; 12], vec![seed; 48], [seed.wrapping_add(1); 16])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ci_timeout() {
        let base = Duration::from_secs(10);
        let adjusted = ci_timeout(base);

        if is_ci_environment() {
            assert_eq!(adjusted, Duration::from_secs(30));
        } else {
            assert_eq!(adjusted, Duration::from_secs(15));
        }
    }

    #[test]
    fn test_config_is_loopback() {
        let config = test_config();
        assert!(config.listen_addr.ip().is_loopback());
        assert_eq!(config.listen_addr.port(), 0);
        assert!(!config.lan.enabled);
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_wait_until() {
        assert!(wait_until(Duration::from_millis(50), || true).await);
        assert!(!wait_until(Duration::from_millis(50), || false).await);
    }
}
