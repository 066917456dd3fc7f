//! Discovery tuning knobs

use std::time::Duration;

use crate::cidr::IpNetwork;
use crate::error::{DiscoError, DiscoResult};

/// Configuration for the discovery coordinator.
///
/// The defaults match the CLI defaults of the VPN binary.
#[derive(Debug, Clone)]
pub struct DiscoConfig {
    /// Offset added to a candidate's port when predicting symmetric-NAT
    /// allocations. May be negative.
    pub port_scan_offset: i32,
    /// How many predicted ports to probe per candidate.
    pub port_scan_count: u32,
    /// The whole port scan is paced to finish within this duration.
    pub port_scan_duration: Duration,
    /// Challenge rounds before escalating to the port scan.
    pub challenges_retry: u32,
    /// Wait before the first challenge round.
    pub challenges_initial_interval: Duration,
    /// Geometric growth factor of the challenge interval, ≥ 1.0.
    pub challenges_backoff_rate: f64,
    /// Local interfaces whose name starts with any of these prefixes are
    /// not used as candidates.
    pub ignored_interface_prefixes: Vec<String>,
    /// Addresses within these networks are neither advertised nor probed.
    pub ignored_local_cidrs: Vec<IpNetwork>,
}

impl Default for DiscoConfig {
    fn default() -> Self {
        Self {
            port_scan_offset: -1000,
            port_scan_count: 3000,
            port_scan_duration: Duration::from_secs(6),
            challenges_retry: 5,
            challenges_initial_interval: Duration::from_millis(200),
            challenges_backoff_rate: 1.65,
            ignored_interface_prefixes: Vec::new(),
            ignored_local_cidrs: Vec::new(),
        }
    }
}

impl DiscoConfig {
    /// Validate invariants that the flag parser cannot express.
    pub fn validate(&self) -> DiscoResult<()> {
        if self.challenges_backoff_rate < 1.0 {
            return Err(DiscoError::Config(format!(
                "challenges backoff rate must be >= 1.0, got {}",
                self.challenges_backoff_rate
            )));
        }
        Ok(())
    }

    /// True if the address must never be advertised or probed.
    pub fn is_ignored_addr(&self, addr: std::net::IpAddr) -> bool {
        self.ignored_local_cidrs.iter().any(|net| net.contains(addr))
    }

    /// True if candidates from this interface must be skipped.
    pub fn is_ignored_interface(&self, name: &str) -> bool {
        self.ignored_interface_prefixes
            .iter()
            .any(|prefix| name.starts_with(prefix.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(DiscoConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_shrinking_backoff() {
        let cfg = DiscoConfig {
            challenges_backoff_rate: 0.5,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn interface_prefix_filter() {
        let cfg = DiscoConfig {
            ignored_interface_prefixes: vec!["wg".into(), "docker".into()],
            ..Default::default()
        };
        assert!(cfg.is_ignored_interface("wg0"));
        assert!(cfg.is_ignored_interface("docker0"));
        assert!(!cfg.is_ignored_interface("eth0"));
    }

    #[test]
    fn cidr_filter() {
        let cfg = DiscoConfig {
            ignored_local_cidrs: vec!["100.99.0.0/24".parse().unwrap()],
            ..Default::default()
        };
        assert!(cfg.is_ignored_addr("100.99.0.7".parse().unwrap()));
        assert!(!cfg.is_ignored_addr("192.168.1.7".parse().unwrap()));
    }
}
