//! CLI flags and configuration assembly

use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use url::Url;

use peerguard_disco::{DiscoConfig, IpNetwork, ListenConfig, PeerId, TransportMode};
use peerguard_peermap::{FileSecretStore, PeerMetadata, PeerUrl, PeermapConfig};

/// Interface name prefixes that are never used for discovery, on top of
/// whatever the operator ignores explicitly.
const ALWAYS_IGNORED_INTERFACES: &[&str] =
    &["pg", "wg", "veth", "docker", "nerdctl", "tailscale"];

const DEFAULT_SECRET_FILE: &str = ".peerguard_network_secret.json";
const DEFAULT_KEY_FILE: &str = ".peerguard_node.key";

/// Run a VPN daemon backed by the peerguard p2p network
#[derive(Parser, Debug)]
#[command(name = "peerguard-vpn", version, about)]
pub struct Cli {
    /// peermap server URL
    #[arg(short = 's', long, env = "PG_SERVER")]
    pub server: Option<Url>,

    /// ipv4 address prefix (e.g. 100.99.0.1/24)
    #[arg(short = '4', long)]
    pub ipv4: Option<String>,

    /// ipv6 address prefix (e.g. fd00::1/64)
    #[arg(short = '6', long)]
    pub ipv6: Option<String>,

    /// nic name
    #[arg(long, default_value = "pg0")]
    pub tun: String,

    /// nic mtu
    #[arg(long, default_value_t = 1411)]
    pub mtu: u16,

    /// p2p udp listen port
    #[arg(long, default_value_t = 29877)]
    pub udp_port: u16,

    /// curve25519 private key in base58 format (default generate one)
    #[arg(long)]
    pub key: Option<String>,

    /// specify peers instead of auto-discovery
    /// (pg://<peerID>?alias1=<ipv4>&alias2=<ipv6>)
    #[arg(long = "peer")]
    pub peers: Vec<String>,

    /// scan ports offset when disco
    #[arg(long = "disco-port-scan-offset", default_value_t = -1000)]
    pub disco_port_scan_offset: i32,

    /// scan ports count when disco
    #[arg(long = "disco-port-scan-count", default_value_t = 3000)]
    pub disco_port_scan_count: u32,

    /// scan ports duration in seconds when disco
    #[arg(long = "disco-port-scan-duration", default_value_t = 6)]
    pub disco_port_scan_duration_secs: u64,

    /// ping challenges retry count when disco
    #[arg(long = "disco-challenges-retry", default_value_t = 5)]
    pub disco_challenges_retry: u32,

    /// ping challenges initial interval in milliseconds when disco
    #[arg(long = "disco-challenges-initial-interval", default_value_t = 200)]
    pub disco_challenges_initial_interval_ms: u64,

    /// ping challenges backoff rate when disco
    #[arg(long = "disco-challenges-backoff-rate", default_value_t = 1.65)]
    pub disco_challenges_backoff_rate: f64,

    /// ignore interfaces prefix when disco
    #[arg(long = "disco-ignored-interface")]
    pub disco_ignored_interfaces: Vec<String>,

    /// force to peer relay transport mode
    #[arg(long)]
    pub force_peer_relay: bool,

    /// force to server relay transport mode
    #[arg(long)]
    pub force_server_relay: bool,

    /// p2p network secret file (default ~/.peerguard_network_secret.json)
    #[arg(short = 'f', long = "secret-file")]
    pub secret_file: Option<PathBuf>,

    /// display a QR code when authentication is required
    #[arg(long)]
    pub auth_qr: bool,

    /// log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub loglevel: String,
}

/// Fully validated runtime configuration.
pub struct AppConfig {
    pub server: Url,
    pub listen: ListenConfig,
    pub disco: DiscoConfig,
    pub stun_servers: Vec<String>,
    pub transport_mode: TransportMode,
    pub peers: Vec<PeerUrl>,
    pub secret_store: FileSecretStore,
    pub auth_qr: bool,
    pub tun_name: String,
    pub mtu: u16,
    pub ipv4: Option<(Ipv4Addr, u8)>,
    pub ipv6: Option<(Ipv6Addr, u8)>,
    peer_id: PeerId,
    metadata: PeerMetadata,
}

impl AppConfig {
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let Some(server) = cli.server else {
            bail!("flag \"server\" not set (or export PG_SERVER)");
        };
        if cli.ipv4.is_none() && cli.ipv6.is_none() {
            bail!("at least one of the flags in the group [ipv4 ipv6] is required");
        }

        let mut ignored_cidrs: Vec<IpNetwork> = Vec::new();
        let ipv4 = cli
            .ipv4
            .as_deref()
            .map(|s| parse_prefix_v4(s, &mut ignored_cidrs))
            .transpose()?;
        let ipv6 = cli
            .ipv6
            .as_deref()
            .map(|s| parse_prefix_v6(s, &mut ignored_cidrs))
            .transpose()?;

        let mut ignored_interfaces = cli.disco_ignored_interfaces;
        ignored_interfaces.extend(ALWAYS_IGNORED_INTERFACES.iter().map(|s| s.to_string()));

        let disco = DiscoConfig {
            port_scan_offset: cli.disco_port_scan_offset,
            port_scan_count: cli.disco_port_scan_count,
            port_scan_duration: Duration::from_secs(cli.disco_port_scan_duration_secs),
            challenges_retry: cli.disco_challenges_retry,
            challenges_initial_interval: Duration::from_millis(
                cli.disco_challenges_initial_interval_ms,
            ),
            challenges_backoff_rate: cli.disco_challenges_backoff_rate,
            ignored_interface_prefixes: ignored_interfaces,
            ignored_local_cidrs: ignored_cidrs,
        };
        disco.validate()?;

        let key = match cli.key.as_deref() {
            Some(key) => peerguard_crypto::SecretKey::from_base58(key)
                .context("parse --key")?,
            None => peerguard_crypto::load_or_generate(&home_file(DEFAULT_KEY_FILE)?)
                .context("load or generate node key")?,
        };
        let public_key = key.public_key();
        let peer_id = PeerId::new(public_key.to_base58())?;

        let peers: Vec<PeerUrl> = cli
            .peers
            .iter()
            .map(|p| p.parse())
            .collect::<Result<_, _>>()
            .context("parse --peer")?;

        let transport_mode = if cli.force_peer_relay {
            TransportMode::ForcePeerRelay
        } else if cli.force_server_relay {
            TransportMode::ForceServerRelay
        } else {
            TransportMode::Auto
        };

        let secret_file = match cli.secret_file {
            Some(path) => path,
            None => home_file(DEFAULT_SECRET_FILE)?,
        };

        let mut listen = ListenConfig::new(peer_id.clone());
        listen.port = cli.udp_port;
        listen.keepalive = Duration::from_secs(6);

        let metadata = PeerMetadata {
            version: env!("CARGO_PKG_VERSION").to_string(),
            alias1: ipv4.map(|(addr, _)| addr.to_string()),
            alias2: ipv6.map(|(addr, _)| addr.to_string()),
            public_key: Some(*public_key.as_bytes()),
        };

        Ok(Self {
            server,
            listen,
            disco,
            stun_servers: peerguard_disco::stun::DEFAULT_STUN_SERVERS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            transport_mode,
            peers,
            secret_store: FileSecretStore::new(secret_file),
            auth_qr: cli.auth_qr,
            tun_name: cli.tun,
            mtu: cli.mtu,
            ipv4,
            ipv6,
            peer_id,
            metadata,
        })
    }

    pub fn peermap_config(&self) -> PeermapConfig {
        PeermapConfig {
            server: self.server.clone(),
            peer_id: self.peer_id.clone(),
            metadata: self.metadata.clone(),
            silence_mode: !self.peers.is_empty(),
        }
    }
}

fn parse_prefix_v4(s: &str, ignored: &mut Vec<IpNetwork>) -> Result<(Ipv4Addr, u8)> {
    let net: IpNetwork = s.parse().context("parse --ipv4")?;
    let std::net::IpAddr::V4(addr) = net.address else {
        bail!("--ipv4 expects an IPv4 prefix, got {s}");
    };
    ignored.push(net);
    Ok((addr, net.prefix_len))
}

fn parse_prefix_v6(s: &str, ignored: &mut Vec<IpNetwork>) -> Result<(Ipv6Addr, u8)> {
    let net: IpNetwork = s.parse().context("parse --ipv6")?;
    let std::net::IpAddr::V6(addr) = net.address else {
        bail!("--ipv6 expects an IPv6 prefix, got {s}");
    };
    ignored.push(net);
    Ok((addr, net.prefix_len))
}

fn home_file(name: &str) -> Result<PathBuf> {
    let dirs = directories::BaseDirs::new().context("resolve home directory")?;
    Ok(dirs.home_dir().join(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Vec<&'static str> {
        vec![
            "peerguard-vpn",
            "-s",
            "wss://pm.example.com",
            "-4",
            "100.99.0.1/24",
            "--key",
            // any 32-byte value in base58
            "11111111111111111111111111111111",
        ]
    }

    #[test]
    fn minimal_flags_build_a_config() {
        let cli = Cli::parse_from(base_args());
        let config = AppConfig::from_cli(cli).unwrap();
        assert_eq!(config.listen.port, 29877);
        assert_eq!(config.mtu, 1411);
        assert_eq!(config.transport_mode, TransportMode::Auto);
        // the overlay's own prefix is never probed
        assert!(config.disco.is_ignored_addr("100.99.0.7".parse().unwrap()));
        // built-in interface filters are appended
        assert!(config.disco.is_ignored_interface("wg0"));
        assert!(config.disco.is_ignored_interface("tailscale0"));
    }

    #[test]
    fn missing_server_is_fatal() {
        std::env::remove_var("PG_SERVER");
        let cli = Cli::parse_from(["peerguard-vpn", "-4", "100.99.0.1/24"]);
        assert!(AppConfig::from_cli(cli).is_err());
    }

    #[test]
    fn missing_address_family_is_fatal() {
        let cli = Cli::parse_from(["peerguard-vpn", "-s", "wss://pm.example.com"]);
        assert!(AppConfig::from_cli(cli).is_err());
    }

    #[test]
    fn static_peers_switch_to_silence_mode() {
        let mut args = base_args();
        args.extend(["--peer", "pg://remotepeer?alias1=100.99.0.2"]);
        let cli = Cli::parse_from(args);
        let config = AppConfig::from_cli(cli).unwrap();
        assert_eq!(config.peers.len(), 1);
        assert!(config.peermap_config().silence_mode);
    }

    #[test]
    fn relay_mode_flags() {
        let mut args = base_args();
        args.push("--force-server-relay");
        let config = AppConfig::from_cli(Cli::parse_from(args)).unwrap();
        assert_eq!(config.transport_mode, TransportMode::ForceServerRelay);

        let mut args = base_args();
        args.push("--force-peer-relay");
        let config = AppConfig::from_cli(Cli::parse_from(args)).unwrap();
        assert_eq!(config.transport_mode, TransportMode::ForcePeerRelay);
    }
}
