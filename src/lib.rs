//! braidhttp: Braid-over-HTTP transport for peer-to-peer state replication.
//!
//! Nodes exchange versioned, Merkle-linked transactions addressed by
//! logical *state URIs*, prove their identities with a signature
//! challenge/response, serve long-lived state subscriptions, and gossip
//! peer dial info, all multiplexed on a single verb-overloaded HTTP/1.1
//! surface served over plaintext and TLS 1.3.
//!
//! # Modules
//!
//! - [`transport`]: the HTTP protocol surface itself: routing, signed
//!   cookies, `AUTHORIZE`, subscriptions, state GET, tx/blob ingest,
//!   Alt-Svc gossip, and the outbound client.
//! - [`tree`]: txs, patches, state nodes, the controller-hub contract,
//!   and the "nelson" resolver that dereferences blob pointers.
//! - [`swarm`]: peer store, subscription types, and the protocol-handler
//!   interfaces the transport drives.
//! - [`identity`] / [`blob`]: key store and blob store contracts with
//!   in-memory implementations.
//! - [`crypto`] / [`types`]: recoverable secp256k1 signatures, Keccak-256
//!   hashing, and the fixed-size wire types.
//!
//! # Quick start
//!
//! ```ignore
//! use braidhttp::{Transport, TransportConfig};
//!
//! let transport = Transport::new(
//!     TransportConfig {
//!         listen_addr: "0.0.0.0:8080".into(),
//!         default_state_uri: Some("example.com/hello".into()),
//!         ..Default::default()
//!     },
//!     controller_hub,
//!     key_store,
//!     blob_store,
//!     peer_store,
//!     resolver,
//!     tree_protocol,
//!     auth_protocol,
//! )?;
//! transport.start().await?;
//! ```

pub mod blob;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod swarm;
pub mod testutil;
pub mod transport;
pub mod tree;
pub mod types;

pub use error::{Error, Result};
pub use swarm::TRANSPORT_NAME;
pub use transport::{PeerConn, TlsIdentity, Transport, TransportConfig};
pub use types::{Address, Hash, Keypath, SessionId, Signature, Version};
