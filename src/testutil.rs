//! In-memory collaborators for tests.
//!
//! These back the transport with just enough behavior to exercise every
//! endpoint: a fixture controller hub over plain JSON documents, a
//! recording tree protocol, and trivial auth handlers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{oneshot, Notify};

use crate::blob::MemoryBlobStore;
use crate::crypto::{keccak256, SigKeypair};
use crate::error::{Error, Result};
use crate::identity::MemoryKeyStore;
use crate::swarm::{
    AuthProtocol, ChallengeIdentityResponse, MemoryPeerStore, PeerInfo, SubscriptionClosed,
    SubscriptionMsg, SubscriptionRequest, TreeProtocol, WritableSubscription,
};
use crate::transport::{Transport, TransportConfig};
use crate::tree::nelson::BasicResolver;
use crate::tree::{ControllerHub, EncryptedTx, Node, Range, Tx};
use crate::types::{Keypath, Version};

/// Controller hub that knows nothing.
pub struct NullControllerHub;

#[async_trait]
impl ControllerHub for NullControllerHub {
    async fn fetch_tx(&self, state_uri: &str, _id: Version) -> Result<Tx> {
        Err(Error::NotFound(state_uri.to_string()))
    }

    async fn leaves(&self, state_uri: &str) -> Result<Vec<Version>> {
        Err(Error::NotFound(state_uri.to_string()))
    }

    async fn state_at_version(&self, state_uri: &str, _version: Option<Version>) -> Result<Node> {
        Err(Error::NotFound(state_uri.to_string()))
    }

    async fn query_index(
        &self,
        state_uri: &str,
        _version: Option<Version>,
        _keypath: &Keypath,
        _index_name: &Keypath,
        _index_arg: Option<Keypath>,
        _range: Option<Range>,
    ) -> Result<Node> {
        Err(Error::NotFound(state_uri.to_string()))
    }
}

/// Controller hub over fixture documents.
#[derive(Default)]
pub struct FixtureControllerHub {
    states: RwLock<HashMap<String, Value>>,
    txs: RwLock<HashMap<(String, Version), Tx>>,
    leaves: RwLock<HashMap<String, Vec<Version>>>,
    indices: RwLock<HashMap<(String, String), Value>>,
}

impl FixtureControllerHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_state(&self, state_uri: &str, value: Value) {
        self.states.write().insert(state_uri.to_string(), value);
        self.leaves.write().entry(state_uri.to_string()).or_default();
    }

    pub fn add_tx(&self, tx: Tx) {
        let state_uri = tx.state_uri.clone();
        let id = tx.id;
        self.txs.write().insert((state_uri.clone(), id), tx);
        self.leaves.write().insert(state_uri, vec![id]);
    }

    pub fn set_index(&self, state_uri: &str, index_name: &str, value: Value) {
        self.indices
            .write()
            .insert((state_uri.to_string(), index_name.to_string()), value);
    }
}

#[async_trait]
impl ControllerHub for FixtureControllerHub {
    async fn fetch_tx(&self, state_uri: &str, id: Version) -> Result<Tx> {
        self.txs
            .read()
            .get(&(state_uri.to_string(), id))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("tx {id} in {state_uri}")))
    }

    async fn leaves(&self, state_uri: &str) -> Result<Vec<Version>> {
        self.leaves
            .read()
            .get(state_uri)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("state URI {state_uri}")))
    }

    async fn state_at_version(&self, state_uri: &str, _version: Option<Version>) -> Result<Node> {
        self.states
            .read()
            .get(state_uri)
            .cloned()
            .map(Node::new)
            .ok_or_else(|| Error::NotFound(format!("state URI {state_uri}")))
    }

    async fn query_index(
        &self,
        state_uri: &str,
        _version: Option<Version>,
        _keypath: &Keypath,
        index_name: &Keypath,
        index_arg: Option<Keypath>,
        range: Option<Range>,
    ) -> Result<Node> {
        let index = self
            .indices
            .read()
            .get(&(state_uri.to_string(), index_name.to_string()))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("index {index_name} in {state_uri}")))?;
        let node = Node::new(index);
        match index_arg {
            Some(arg) => Ok(node.node_at(&arg, range)),
            None => Ok(node.node_at(&Keypath::default(), range)),
        }
    }
}

/// A subscription handed to [`RecordingTreeProtocol`].
pub struct SubscriptionHandle {
    pub request: SubscriptionRequest,
    pub sink: Arc<dyn WritableSubscription>,
    close_tx: Option<oneshot::Sender<()>>,
}

/// Tree protocol that records everything it is handed.
#[derive(Default)]
pub struct RecordingTreeProtocol {
    pub txs: Mutex<Vec<Tx>>,
    pub private_txs: Mutex<Vec<EncryptedTx>>,
    pub acks: Mutex<Vec<(String, Version)>>,
    pub peers: Mutex<Vec<PeerInfo>>,
    subscriptions: Mutex<Vec<SubscriptionHandle>>,
    notify: Notify,
}

impl RecordingTreeProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until a tx arrives, up to `timeout`.
    pub async fn wait_for_tx(&self, timeout: Duration) -> Tx {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(tx) = self.txs.lock().first().cloned() {
                return tx;
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                panic!("no tx arrived within {timeout:?}");
            }
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    pub fn subscription_request(&self, index: usize) -> Option<SubscriptionRequest> {
        self.subscriptions
            .lock()
            .get(index)
            .map(|handle| handle.request.clone())
    }

    /// Deliver a frame to every open subscription.
    pub async fn publish(&self, msg: SubscriptionMsg) {
        let sinks: Vec<Arc<dyn WritableSubscription>> = self
            .subscriptions
            .lock()
            .iter()
            .map(|handle| handle.sink.clone())
            .collect();
        for sink in sinks {
            let _ = sink.put(msg.clone()).await;
        }
    }

    /// Fire every subscription's close signal.
    pub fn close_all_subscriptions(&self) {
        for handle in self.subscriptions.lock().iter_mut() {
            if let Some(close_tx) = handle.close_tx.take() {
                let _ = close_tx.send(());
            }
        }
    }
}

#[async_trait]
impl TreeProtocol for RecordingTreeProtocol {
    async fn handle_tx_received(&self, tx: Tx, peer: PeerInfo) {
        self.txs.lock().push(tx);
        self.peers.lock().push(peer);
        self.notify.notify_waiters();
    }

    async fn handle_private_tx_received(&self, tx: EncryptedTx, peer: PeerInfo) {
        self.private_txs.lock().push(tx);
        self.peers.lock().push(peer);
    }

    async fn handle_ack_received(&self, state_uri: &str, tx_id: Version, peer: PeerInfo) {
        self.acks.lock().push((state_uri.to_string(), tx_id));
        self.peers.lock().push(peer);
    }

    async fn handle_writable_subscription_opened(
        &self,
        request: SubscriptionRequest,
        subscription: Arc<dyn WritableSubscription>,
    ) -> Result<SubscriptionClosed> {
        let (close_tx, close_rx) = oneshot::channel();
        self.subscriptions.lock().push(SubscriptionHandle {
            request,
            sink: subscription,
            close_tx: Some(close_tx),
        });
        Ok(close_rx)
    }
}

/// Tree protocol that accepts and ignores everything. Subscriptions stay
/// open until the transport shuts down.
#[derive(Default)]
pub struct NullTreeProtocol {
    holders: Mutex<Vec<oneshot::Sender<()>>>,
}

#[async_trait]
impl TreeProtocol for NullTreeProtocol {
    async fn handle_tx_received(&self, _tx: Tx, _peer: PeerInfo) {}

    async fn handle_private_tx_received(&self, _tx: EncryptedTx, _peer: PeerInfo) {}

    async fn handle_ack_received(&self, _state_uri: &str, _tx_id: Version, _peer: PeerInfo) {}

    async fn handle_writable_subscription_opened(
        &self,
        _request: SubscriptionRequest,
        _subscription: Arc<dyn WritableSubscription>,
    ) -> Result<SubscriptionClosed> {
        let (close_tx, close_rx) = oneshot::channel();
        self.holders.lock().push(close_tx);
        Ok(close_rx)
    }
}

/// Auth protocol with no identities to prove.
pub struct NullAuthProtocol;

#[async_trait]
impl AuthProtocol for NullAuthProtocol {
    async fn respond_to_challenge(
        &self,
        _challenge: &[u8],
    ) -> Result<Vec<ChallengeIdentityResponse>> {
        Ok(Vec::new())
    }
}

/// Auth protocol that proves one keypair's identity.
pub struct SigningAuthProtocol {
    pub keypair: SigKeypair,
}

#[async_trait]
impl AuthProtocol for SigningAuthProtocol {
    async fn respond_to_challenge(
        &self,
        challenge: &[u8],
    ) -> Result<Vec<ChallengeIdentityResponse>> {
        let signature = self.keypair.sign_hash(&keccak256(challenge))?;
        Ok(vec![ChallengeIdentityResponse {
            signature,
            asym_enc_pubkey: None,
        }])
    }
}

/// A transport over all-default in-memory collaborators.
pub fn test_transport() -> Transport {
    test_transport_with(Arc::new(NullTreeProtocol::default()))
}

/// A transport with a caller-supplied tree protocol.
pub fn test_transport_with(tree_protocol: Arc<dyn TreeProtocol>) -> Transport {
    test_transport_parts(
        TransportConfig {
            jwt_secret: b"test jwt secret".to_vec(),
            ..TransportConfig::default()
        },
        Arc::new(NullControllerHub),
        tree_protocol,
    )
}

/// A transport that considers `own_urls` to be itself.
pub fn test_transport_with_own_urls(own_urls: Vec<String>) -> Transport {
    test_transport_parts(
        TransportConfig {
            own_urls,
            jwt_secret: b"test jwt secret".to_vec(),
            ..TransportConfig::default()
        },
        Arc::new(NullControllerHub),
        Arc::new(NullTreeProtocol::default()),
    )
}

/// A transport over a fixture hub and a caller-supplied tree protocol.
pub fn test_transport_parts(
    config: TransportConfig,
    controller_hub: Arc<dyn ControllerHub>,
    tree_protocol: Arc<dyn TreeProtocol>,
) -> Transport {
    let key_store = Arc::new(MemoryKeyStore::new());
    let blob_store = Arc::new(MemoryBlobStore::new());
    let transport = Transport::new(
        config,
        controller_hub,
        key_store,
        blob_store.clone(),
        Arc::new(MemoryPeerStore::new()),
        Arc::new(BasicResolver::new(blob_store)),
        tree_protocol,
        Arc::new(NullAuthProtocol),
    )
    .expect("building a test transport cannot fail");
    transport
        .find_or_create_cookie_secret()
        .expect("cookie secret bootstrap");
    transport
}
