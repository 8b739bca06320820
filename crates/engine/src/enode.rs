//! Peer locators in the `enode://` URL form used by devp2p.

use crate::error::EngineError;
use std::fmt;
use std::str::FromStr;

const SCHEME: &str = "enode://";
const NODE_ID_LEN: usize = 64;

/// A parsed `enode://<node id>@<host>:<port>[?discport=<port>]` locator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Enode {
    pub node_id: [u8; NODE_ID_LEN],
    pub host: String,
    pub tcp_port: u16,
    pub discovery_port: Option<u16>,
}

impl Enode {
    pub fn node_id_hex(&self) -> String {
        hex::encode(self.node_id)
    }
}

fn invalid(url: &str, reason: impl Into<String>) -> EngineError {
    EngineError::InvalidEnode {
        url: url.to_string(),
        reason: reason.into(),
    }
}

fn parse_port(url: &str, value: &str, what: &str) -> Result<u16, EngineError> {
    match value.parse::<u16>() {
        Ok(0) | Err(_) => Err(invalid(url, format!("bad {what} `{value}`"))),
        Ok(port) => Ok(port),
    }
}

impl FromStr for Enode {
    type Err = EngineError;

    fn from_str(url: &str) -> Result<Self, Self::Err> {
        let rest = url
            .strip_prefix(SCHEME)
            .ok_or_else(|| invalid(url, "missing enode:// scheme"))?;
        let (id, location) = rest
            .split_once('@')
            .ok_or_else(|| invalid(url, "missing `@` separator"))?;

        let id_bytes = hex::decode(id).map_err(|e| invalid(url, format!("node id: {e}")))?;
        let node_id: [u8; NODE_ID_LEN] = id_bytes
            .try_into()
            .map_err(|bytes: Vec<u8>| invalid(url, format!("node id is {} bytes", bytes.len())))?;

        let (address, query) = match location.split_once('?') {
            Some((address, query)) => (address, Some(query)),
            None => (location, None),
        };
        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| invalid(url, "missing port"))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(invalid(url, "missing host"));
        }
        let tcp_port = parse_port(url, port, "tcp port")?;

        let mut discovery_port = None;
        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                match pair.split_once('=') {
                    // geth reports `discport=0` when discovery is off
                    Some(("discport", "0")) => discovery_port = None,
                    Some(("discport", value)) => {
                        discovery_port = Some(parse_port(url, value, "discovery port")?)
                    }
                    _ => return Err(invalid(url, format!("unsupported query `{pair}`"))),
                }
            }
        }

        Ok(Enode {
            node_id,
            host: host.to_string(),
            tcp_port,
            discovery_port,
        })
    }
}

impl fmt::Display for Enode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        write!(f, "{SCHEME}{}@{}:{}", self.node_id_hex(), host, self.tcp_port)?;
        match self.discovery_port {
            Some(port) if port != self.tcp_port => write!(f, "?discport={port}"),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const ID: &str = "a979fb575495b8d6db44f750317d0f4622bf4c2aa3365d6af7c284339968eef29b69ad0dce72a4d8db5ebb4968de0e3bec910127f134779fbcb0cb6d3331163c";

    #[test]
    fn parses_geth_node_info_url() {
        let url = format!("enode://{ID}@127.0.0.1:30303?discport=30301");
        let enode: Enode = url.parse().unwrap();
        assert_eq!(enode.node_id_hex(), ID);
        assert_eq!(enode.host, "127.0.0.1");
        assert_eq!(enode.tcp_port, 30303);
        assert_eq!(enode.discovery_port, Some(30301));
        assert_eq!(enode.to_string(), url);
    }

    #[test]
    fn omits_discport_when_it_matches_tcp_port() {
        let url = format!("enode://{ID}@10.0.0.2:30303?discport=30303");
        let enode: Enode = url.parse().unwrap();
        assert_eq!(enode.to_string(), format!("enode://{ID}@10.0.0.2:30303"));
    }

    #[test]
    fn zero_discport_means_no_discovery() {
        let enode: Enode = format!("enode://{ID}@127.0.0.1:30303?discport=0")
            .parse()
            .unwrap();
        assert_eq!(enode.discovery_port, None);
    }

    #[test]
    fn parses_bracketed_ipv6_host() {
        let enode: Enode = format!("enode://{ID}@[::1]:30303").parse().unwrap();
        assert_eq!(enode.host, "::1");
        assert_eq!(enode.to_string(), format!("enode://{ID}@[::1]:30303"));
    }

    #[test]
    fn rejects_malformed_urls() {
        let short_id = &ID[..100];
        for url in [
            format!("enr://{ID}@127.0.0.1:30303"),
            format!("enode://{ID}127.0.0.1:30303"),
            format!("enode://{short_id}@127.0.0.1:30303"),
            format!("enode://{}@127.0.0.1:30303", "zz".repeat(64)),
            format!("enode://{ID}@:30303"),
            format!("enode://{ID}@127.0.0.1"),
            format!("enode://{ID}@127.0.0.1:0"),
            format!("enode://{ID}@127.0.0.1:70000"),
            format!("enode://{ID}@127.0.0.1:30303?discport=abc"),
            format!("enode://{ID}@127.0.0.1:30303?foo=1"),
        ] {
            let err = url.parse::<Enode>().unwrap_err();
            assert!(
                matches!(err, EngineError::InvalidEnode { .. }),
                "{url} gave {err:?}"
            );
        }
    }

    proptest! {
        #[test]
        fn display_parses_back(id in proptest::array::uniform32(any::<u8>()), port in 1u16..=u16::MAX, disc in proptest::option::of(1u16..=u16::MAX)) {
            let mut node_id = [0u8; NODE_ID_LEN];
            node_id[..32].copy_from_slice(&id);
            node_id[32..].copy_from_slice(&id);
            let enode = Enode { node_id, host: "192.168.1.10".to_string(), tcp_port: port, discovery_port: disc };
            let parsed: Enode = enode.to_string().parse().unwrap();
            prop_assert_eq!(parsed.node_id, enode.node_id);
            prop_assert_eq!(parsed.tcp_port, port);
            prop_assert_eq!(parsed.discovery_port.unwrap_or(port), disc.unwrap_or(port));
        }
    }
}
