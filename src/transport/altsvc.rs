//! Peer gossip over the `Alt-Svc` header.
//!
//! Every response (and every outbound request) advertises the peer store's
//! known dial infos; every inbound header is decoded and its peers recorded.
//! There is no dedicated gossip endpoint.
//!
//! Wire form, one entry per peer:
//!
//! ```text
//! Alt-Svc: braidhttp="https://a.example:443", braidhttp="https://b.example:443"
//! ```
//!
//! Entries may carry `; key=value` metadata pairs after the dial address.

use std::collections::HashMap;

use crate::swarm::PeerDialInfo;

/// Encode dial infos into an `Alt-Svc` header value. The empty list encodes
/// to the empty string; the header is still set.
pub fn make_alt_svc_header(infos: &[PeerDialInfo]) -> String {
    infos
        .iter()
        .filter(|info| !info.dial_addr.is_empty())
        .map(|info| format!(r#"{}="{}""#, info.transport_name, info.dial_addr))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Decode an `Alt-Svc` header into `(transport name, dial addr, metadata)`
/// triples. Malformed entries are skipped.
pub fn parse_alt_svc_header(header: &str) -> Vec<(String, String, HashMap<String, String>)> {
    header
        .split(',')
        .filter_map(|entry| {
            let mut fields = entry.trim().split(';');
            let first = fields.next()?.trim();
            let (name, addr) = first.split_once('=')?;
            let name = name.trim();
            let addr = addr.trim().trim_matches('"');
            if name.is_empty() || addr.is_empty() {
                return None;
            }
            let mut metadata = HashMap::new();
            for field in fields {
                if let Some((k, v)) = field.trim().split_once('=') {
                    metadata.insert(
                        k.trim().to_string(),
                        v.trim().trim_matches('"').to_string(),
                    );
                }
            }
            Some((name.to_string(), addr.to_string(), metadata))
        })
        .collect()
}
