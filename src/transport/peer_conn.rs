//! Outbound peer connections and intra-cluster HTTP calls.

use tokio::sync::mpsc;
use tracing::warn;

use crate::error::{Error, Result};
use crate::swarm::{PeerDialInfo, TRANSPORT_NAME};
use crate::types::{Address, Hash, SessionId};

use super::{make_alt_svc_header, Transport};

/// Providers lookups against the authoritative host get this long.
const PROVIDERS_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// A lightweight handle on a remote peer: the shared HTTP client plus the
/// target dial address. Server-side contexts carry an empty dial address.
#[derive(Clone)]
pub struct PeerConn {
    transport: Transport,
    dial_addr: String,
    session_id: SessionId,
    device_unique_id: String,
    address: Address,
}

impl PeerConn {
    pub fn dial_addr(&self) -> &str {
        &self.dial_addr
    }

    pub fn dial_info(&self) -> PeerDialInfo {
        PeerDialInfo::new(TRANSPORT_NAME, self.dial_addr.clone())
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn device_unique_id(&self) -> &str {
        &self.device_unique_id
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// `HEAD` the peer: liveness probing plus an Alt-Svc exchange.
    pub async fn ping(&self) -> Result<()> {
        let req = self.transport.http_client().head(&self.dial_addr);
        self.transport.do_request(req).await.map(drop)
    }
}

impl Transport {
    /// A handle for dialing `dial_addr`. Fails with [`Error::PeerIsSelf`]
    /// for the node's own URLs and anything local.
    pub fn new_peer_conn(&self, dial_addr: &str) -> Result<PeerConn> {
        if self.is_own_url(dial_addr) || dial_addr.starts_with("localhost") {
            return Err(Error::PeerIsSelf);
        }
        self.peer_store()
            .add_dial_info(PeerDialInfo::new(TRANSPORT_NAME, dial_addr), "");
        Ok(self.make_peer_conn(dial_addr))
    }

    fn make_peer_conn(&self, dial_addr: &str) -> PeerConn {
        PeerConn {
            transport: self.clone(),
            dial_addr: dial_addr.to_string(),
            session_id: SessionId::default(),
            device_unique_id: String::new(),
            address: Address::default(),
        }
    }

    /// Ask the state URI's authoritative host who provides it, then stream
    /// peer handles for every non-self candidate. The channel closes when
    /// the producer finishes or the transport shuts down.
    pub async fn providers_of_state_uri(
        &self,
        state_uri: &str,
    ) -> Result<mpsc::Receiver<PeerConn>> {
        let mut providers = match self.fetch_providers_from_authoritative_host(state_uri).await {
            Ok(providers) => providers,
            Err(err) => {
                warn!(
                    %state_uri, %err,
                    "could not fetch providers of state URI from authoritative host"
                );
                return Err(err);
            }
        };

        let authority = state_uri.split('/').next().unwrap_or_default();
        if !authority.is_empty() {
            providers.push(format!("http://{authority}"));
        }

        let (sender, receiver) = mpsc::channel(8);
        let transport = self.clone();
        let mut done = self.done();
        tokio::spawn(async move {
            for provider in providers {
                if transport.is_own_url(&provider) {
                    continue;
                }
                let conn = transport.make_peer_conn(&provider);
                tokio::select! {
                    result = sender.send(conn) => {
                        if result.is_err() {
                            return;
                        }
                    }
                    _ = done.changed() => return,
                }
            }
        });
        Ok(receiver)
    }

    async fn fetch_providers_from_authoritative_host(
        &self,
        state_uri: &str,
    ) -> Result<Vec<String>> {
        let authority = state_uri
            .split('/')
            .next()
            .filter(|a| !a.is_empty())
            .ok_or_else(|| Error::BadRequest(format!("bad state URI: {state_uri}")))?;

        let url = format!("http://{authority}:80/providers");
        let req = self
            .http_client()
            .get(&url)
            .query(&[("state_uri", state_uri)])
            .timeout(PROVIDERS_TIMEOUT);

        let response = self.do_request(req).await?;
        Ok(response.json::<Vec<String>>().await?)
    }

    /// Blob-provider discovery is not part of this transport.
    pub async fn providers_of_blob(&self, _blob_id: Hash) -> Result<mpsc::Receiver<PeerConn>> {
        Err(Error::Unimplemented)
    }

    /// Blob announcement is not part of this transport.
    pub async fn announce_blob(&self, _blob_id: Hash) -> Result<()> {
        Err(Error::Unimplemented)
    }

    /// Send an outbound request, always attaching the gossip `Alt-Svc`
    /// header and consuming any returned one. Non-200 responses collapse
    /// into an error carrying status and body.
    pub(crate) async fn do_request(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response> {
        let alt_svc = make_alt_svc_header(&self.peer_store().all_dial_infos());
        let response = builder.header("Alt-Svc", alt_svc).send().await?;

        if let Some(value) = response
            .headers()
            .get("Alt-Svc")
            .and_then(|v| v.to_str().ok())
        {
            for (transport_name, dial_addr, _metadata) in super::parse_alt_svc_header(value) {
                self.peer_store()
                    .add_dial_info(PeerDialInfo::new(transport_name, dial_addr), "");
            }
        }

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Http {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_transport, test_transport_with_own_urls};

    #[test]
    fn test_new_peer_conn_rejects_own_urls() {
        let transport = test_transport_with_own_urls(vec!["https://me.example:443".into()]);
        let err = transport.new_peer_conn("https://me.example:443").unwrap_err();
        assert!(matches!(err, Error::PeerIsSelf));
    }

    #[test]
    fn test_new_peer_conn_rejects_localhost() {
        let transport = test_transport();
        let err = transport.new_peer_conn("localhost:8080").unwrap_err();
        assert!(matches!(err, Error::PeerIsSelf));
    }

    #[test]
    fn test_new_peer_conn_records_dial_info() {
        let transport = test_transport();
        let conn = transport.new_peer_conn("https://peer.example:443").unwrap();
        assert_eq!(conn.dial_addr(), "https://peer.example:443");
        assert!(transport
            .peer_store()
            .all_dial_infos()
            .contains(&PeerDialInfo::new(TRANSPORT_NAME, "https://peer.example:443")));
    }

    #[tokio::test]
    async fn test_blob_provider_discovery_is_unimplemented() {
        let transport = test_transport();
        assert!(matches!(
            transport.providers_of_blob(Hash([1; 32])).await.unwrap_err(),
            Error::Unimplemented
        ));
        assert!(matches!(
            transport.announce_blob(Hash([1; 32])).await.unwrap_err(),
            Error::Unimplemented
        ));
    }
}
