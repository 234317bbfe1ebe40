//! Peer bookkeeping and the protocol-handler interfaces the transport
//! drives.
//!
//! The transport is a dumb pipe with opinions: it parses the wire, then
//! hands everything to the tree/auth protocol handlers defined here. The
//! peer store records who we can dial and which addresses have proven
//! themselves.

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::tree::{EncryptedTx, Tx};
use crate::types::{Address, Keypath, SessionId, Signature, Version};

/// Name under which this transport registers dial info.
pub const TRANSPORT_NAME: &str = "braidhttp";

/// How a peer can be reached: a transport name plus a dial address.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerDialInfo {
    pub transport_name: String,
    pub dial_addr: String,
}

impl PeerDialInfo {
    pub fn new(transport_name: impl Into<String>, dial_addr: impl Into<String>) -> Self {
        PeerDialInfo {
            transport_name: transport_name.into(),
            dial_addr: dial_addr.into(),
        }
    }
}

/// Records peers, their dial info, and verified credentials. Implementations
/// are internally synchronized.
pub trait PeerStore: Send + Sync {
    fn add_dial_info(&self, dial_info: PeerDialInfo, device_unique_id: &str);

    fn add_verified_credentials(
        &self,
        dial_info: PeerDialInfo,
        device_unique_id: &str,
        address: Address,
        signing_pubkey: Option<Vec<u8>>,
        encryption_pubkey: Option<Vec<u8>>,
    );

    /// Every dial info currently known, in a stable order.
    fn all_dial_infos(&self) -> Vec<PeerDialInfo>;
}

/// Verified credentials recorded for a peer endpoint.
#[derive(Clone, Debug, Default)]
pub struct PeerCredentials {
    pub device_unique_id: String,
    pub address: Option<Address>,
    pub signing_pubkey: Option<Vec<u8>>,
    pub encryption_pubkey: Option<Vec<u8>>,
}

/// In-memory peer store.
#[derive(Default)]
pub struct MemoryPeerStore {
    peers: RwLock<HashMap<PeerDialInfo, PeerCredentials>>,
}

impl MemoryPeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn credentials(&self, dial_info: &PeerDialInfo) -> Option<PeerCredentials> {
        self.peers.read().get(dial_info).cloned()
    }
}

impl PeerStore for MemoryPeerStore {
    fn add_dial_info(&self, dial_info: PeerDialInfo, device_unique_id: &str) {
        let mut peers = self.peers.write();
        let entry = peers.entry(dial_info).or_default();
        if !device_unique_id.is_empty() {
            entry.device_unique_id = device_unique_id.to_string();
        }
    }

    fn add_verified_credentials(
        &self,
        dial_info: PeerDialInfo,
        device_unique_id: &str,
        address: Address,
        signing_pubkey: Option<Vec<u8>>,
        encryption_pubkey: Option<Vec<u8>>,
    ) {
        let mut peers = self.peers.write();
        let entry = peers.entry(dial_info).or_default();
        entry.device_unique_id = device_unique_id.to_string();
        entry.address = Some(address);
        if signing_pubkey.is_some() {
            entry.signing_pubkey = signing_pubkey;
        }
        if encryption_pubkey.is_some() {
            entry.encryption_pubkey = encryption_pubkey;
        }
    }

    fn all_dial_infos(&self) -> Vec<PeerDialInfo> {
        let mut infos: Vec<PeerDialInfo> = self.peers.read().keys().cloned().collect();
        infos.sort();
        infos
    }
}

/// What a subscriber wants delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionType {
    /// Raw transactions as they are applied.
    Txs,
    /// Materialized states after each applied tx.
    States,
}

impl FromStr for SubscriptionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "transactions" => Ok(SubscriptionType::Txs),
            "states" => Ok(SubscriptionType::States),
            other => Err(Error::BadRequest(format!(
                "bad subscription type: {other}"
            ))),
        }
    }
}

/// Ask the subscription layer to backfill history starting at a tx id.
#[derive(Clone, Copy, Debug)]
pub struct FetchHistoryOpts {
    pub from_tx: Version,
}

/// A request to open a writable subscription for a caller.
#[derive(Clone, Debug)]
pub struct SubscriptionRequest {
    pub state_uri: String,
    pub keypath: Keypath,
    pub subscription_type: SubscriptionType,
    pub fetch_history: Option<FetchHistoryOpts>,
    /// Verified addresses the subscription is scoped to.
    pub addresses: Vec<Address>,
}

/// One frame delivered to a subscriber.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionMsg {
    #[serde(rename = "stateURI")]
    pub state_uri: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tx: Option<Tx>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub state: Option<Value>,
    #[serde(default)]
    pub leaves: Vec<Version>,
}

/// A sink the subscription layer writes frames into. The transport supplies
/// implementations backed by a chunked HTTP response or a WebSocket.
#[async_trait]
pub trait WritableSubscription: Send + Sync {
    fn state_uri(&self) -> &str;

    async fn put(&self, msg: SubscriptionMsg) -> Result<()>;

    /// Stop delivering and release the underlying channel.
    async fn close(&self);
}

/// Fires when the subscription layer closes a writable subscription.
pub type SubscriptionClosed = oneshot::Receiver<()>;

/// Identity of the remote on an inbound request.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub dial_addr: Option<String>,
    pub session_id: SessionId,
    pub device_unique_id: String,
    /// Verified address, zero when the remote is anonymous.
    pub address: Address,
}

/// Tree-protocol callbacks the transport invokes for ingested traffic.
#[async_trait]
pub trait TreeProtocol: Send + Sync {
    async fn handle_tx_received(&self, tx: Tx, peer: PeerInfo);

    async fn handle_private_tx_received(&self, tx: EncryptedTx, peer: PeerInfo);

    async fn handle_ack_received(&self, state_uri: &str, tx_id: Version, peer: PeerInfo);

    /// Open a writable subscription. Returns a receiver that fires when the
    /// subscription layer closes it; the transport must keep the connection
    /// open until then.
    async fn handle_writable_subscription_opened(
        &self,
        request: SubscriptionRequest,
        subscription: std::sync::Arc<dyn WritableSubscription>,
    ) -> Result<SubscriptionClosed>;
}

/// The node's proof material for an identity challenge.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeIdentityResponse {
    pub signature: Signature,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub asym_enc_pubkey: Option<String>,
}

/// Auth-protocol callback: produce signed proofs for a remote's challenge.
#[async_trait]
pub trait AuthProtocol: Send + Sync {
    async fn respond_to_challenge(
        &self,
        challenge: &[u8],
    ) -> Result<Vec<ChallengeIdentityResponse>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_type_parsing() {
        assert_eq!(
            "states".parse::<SubscriptionType>().unwrap(),
            SubscriptionType::States
        );
        assert_eq!(
            "Transactions".parse::<SubscriptionType>().unwrap(),
            SubscriptionType::Txs
        );
        assert!("events".parse::<SubscriptionType>().is_err());
    }

    #[test]
    fn test_peer_store_records_dial_info() {
        let store = MemoryPeerStore::new();
        let info = PeerDialInfo::new(TRANSPORT_NAME, "https://peer.example:443");
        store.add_dial_info(info.clone(), "device-1");
        assert_eq!(store.all_dial_infos(), vec![info]);
    }

    #[test]
    fn test_peer_store_verified_credentials() {
        let store = MemoryPeerStore::new();
        let info = PeerDialInfo::new(TRANSPORT_NAME, "");
        store.add_verified_credentials(
            info.clone(),
            "device-1",
            Address([1; 20]),
            Some(vec![4, 5, 6]),
            None,
        );
        let creds = store.credentials(&info).unwrap();
        assert_eq!(creds.address, Some(Address([1; 20])));
        assert_eq!(creds.signing_pubkey, Some(vec![4, 5, 6]));
    }

    #[test]
    fn test_all_dial_infos_is_stably_ordered() {
        let store = MemoryPeerStore::new();
        store.add_dial_info(PeerDialInfo::new(TRANSPORT_NAME, "https://b"), "");
        store.add_dial_info(PeerDialInfo::new(TRANSPORT_NAME, "https://a"), "");
        let addrs: Vec<String> = store
            .all_dial_infos()
            .into_iter()
            .map(|i| i.dial_addr)
            .collect();
        assert_eq!(addrs, vec!["https://a", "https://b"]);
    }

    #[test]
    fn test_subscription_msg_serialization() {
        let msg = SubscriptionMsg {
            state_uri: "chat.example/room".into(),
            tx: None,
            state: Some(serde_json::json!({"messages": []})),
            leaves: vec![Version([3; 32])],
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["stateURI"], "chat.example/room");
        assert!(json.get("tx").is_none());
        assert!(json["leaves"][0].is_string());
    }
}
