//! Static peer URLs
//!
//! Peers can be pinned in config as `pg://<peerID>?alias1=<ipv4>&alias2=<ipv6>`,
//! bypassing auto-discovery. Unknown query parameters are ignored.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use peerguard_disco::PeerId;
use url::Url;

use crate::error::PeermapError;

/// A statically configured peer with optional overlay address aliases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerUrl {
    pub peer_id: PeerId,
    /// Overlay IPv4 address of the peer.
    pub alias1: Option<Ipv4Addr>,
    /// Overlay IPv6 address of the peer.
    pub alias2: Option<Ipv6Addr>,
}

impl FromStr for PeerUrl {
    type Err = PeermapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url =
            Url::parse(s).map_err(|e| PeermapError::InvalidUrl(format!("{s}: {e}")))?;
        if url.scheme() != "pg" {
            return Err(PeermapError::InvalidUrl(format!(
                "unsupported scheme {}",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| PeermapError::InvalidUrl(format!("{s}: missing peer id")))?;
        let peer_id = PeerId::new(host)
            .map_err(|e| PeermapError::InvalidUrl(format!("{s}: {e}")))?;

        let mut alias1 = None;
        let mut alias2 = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "alias1" => alias1 = value.parse().ok(),
                "alias2" => alias2 = value.parse().ok(),
                _ => {}
            }
        }
        Ok(Self {
            peer_id,
            alias1,
            alias2,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_url() {
        let p: PeerUrl = "pg://8Zt2rT6PHN?alias1=100.99.0.2&alias2=fd00::2"
            .parse()
            .unwrap();
        assert_eq!(p.peer_id.as_str(), "8Zt2rT6PHN");
        assert_eq!(p.alias1, Some(Ipv4Addr::new(100, 99, 0, 2)));
        assert_eq!(p.alias2, Some("fd00::2".parse::<Ipv6Addr>().unwrap()));
    }

    #[test]
    fn aliases_are_optional_and_unknown_params_ignored() {
        let p: PeerUrl = "pg://somepeer?color=blue".parse().unwrap();
        assert_eq!(p.peer_id.as_str(), "somepeer");
        assert_eq!(p.alias1, None);
        assert_eq!(p.alias2, None);
    }

    #[test]
    fn preserves_peer_id_case() {
        let p: PeerUrl = "pg://AbCdEf".parse().unwrap();
        assert_eq!(p.peer_id.as_str(), "AbCdEf");
    }

    #[test]
    fn rejects_other_schemes() {
        assert!("https://peer".parse::<PeerUrl>().is_err());
        assert!("pg://".parse::<PeerUrl>().is_err());
    }

    #[test]
    fn unparsable_alias_is_dropped() {
        let p: PeerUrl = "pg://peer?alias1=not-an-ip".parse().unwrap();
        assert_eq!(p.alias1, None);
    }
}
