//! The Braid-over-HTTP transport.
//!
//! One verb-overloaded HTTP surface, served over plaintext and TLS 1.3,
//! multiplexing identity challenges (`AUTHORIZE`), tx ingest (`PUT`, `ACK`),
//! blob ingest (`POST`), state reads and long-lived subscriptions (`GET`),
//! and peer gossip piggybacked on the `Alt-Svc` header of every exchange.
//!
//! The transport owns no replication logic. It parses the wire and drives
//! the [`TreeProtocol`]/[`AuthProtocol`] handlers, the controller hub, the
//! key store, the blob store, and the peer store.

mod altsvc;
mod auth;
mod blob;
mod peer_conn;
mod session;
mod state;
mod subscriptions;
mod tls;
mod tx;

pub use altsvc::{make_alt_svc_header, parse_alt_svc_header};
pub use peer_conn::PeerConn;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info, warn};

use crate::blob::BlobStore;
use crate::error::{Error, Result};
use crate::identity::KeyStore;
use crate::swarm::{
    AuthProtocol, PeerDialInfo, PeerInfo, PeerStore, TreeProtocol, TRANSPORT_NAME,
};
use crate::tree::nelson::Resolver;
use crate::tree::ControllerHub;
use crate::types::{Address, SessionId};

/// Expiry for pending identity challenges awaiting a signed response.
const PENDING_AUTH_TTL: Duration = Duration::from_secs(60);

/// Key in the key store's extra-user-data area holding the cookie secret.
const COOKIE_SECRET_KEY: &str = "http:cookiesecret";

/// TLS certificate material for the SSL listener, DER-encoded.
#[derive(Clone)]
pub struct TlsIdentity {
    pub cert_chain_der: Vec<Vec<u8>>,
    pub private_key_pkcs8_der: Vec<u8>,
}

/// Transport configuration.
#[derive(Clone)]
pub struct TransportConfig {
    /// Plaintext listen address, e.g. `127.0.0.1:8080`.
    pub listen_addr: String,
    /// TLS listen address. `None` disables the TLS listener.
    pub listen_addr_ssl: Option<String>,
    /// State URI assumed when a request names none.
    pub default_state_uri: Option<String>,
    /// URLs that identify this node; never dialed.
    pub own_urls: Vec<String>,
    pub tls_identity: Option<TlsIdentity>,
    /// Symmetric secret validating bearer JWTs.
    pub jwt_secret: Vec<u8>,
    pub dev_mode: bool,
    /// Browser client bundle served at `GET /braid.js`, when configured.
    pub browser_js: Option<Bytes>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            listen_addr: "127.0.0.1:0".into(),
            listen_addr_ssl: None,
            default_state_uri: None,
            own_urls: Vec::new(),
            tls_identity: None,
            jwt_secret: Vec::new(),
            dev_mode: false,
            browser_js: None,
        }
    }
}

struct PendingChallenge {
    challenge: Vec<u8>,
    created_at: Instant,
}

pub(crate) struct Inner {
    config: TransportConfig,
    controller_hub: Arc<dyn ControllerHub>,
    key_store: Arc<dyn KeyStore>,
    blob_store: Arc<dyn BlobStore>,
    peer_store: Arc<dyn PeerStore>,
    resolver: Arc<dyn Resolver>,
    tree_protocol: Arc<dyn TreeProtocol>,
    auth_protocol: Arc<dyn AuthProtocol>,

    cookie_secret: RwLock<[u8; 32]>,
    pending_authorizations: Mutex<HashMap<SessionId, PendingChallenge>>,
    own_urls: RwLock<HashSet<String>>,
    http_client: reqwest::Client,

    shutdown: watch::Sender<bool>,
    local_addr: RwLock<Option<SocketAddr>>,
    local_addr_ssl: RwLock<Option<SocketAddr>>,
}

/// Handle on a running (or startable) transport. Cheap to clone.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl Transport {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: TransportConfig,
        controller_hub: Arc<dyn ControllerHub>,
        key_store: Arc<dyn KeyStore>,
        blob_store: Arc<dyn BlobStore>,
        peer_store: Arc<dyn PeerStore>,
        resolver: Arc<dyn Resolver>,
        tree_protocol: Arc<dyn TreeProtocol>,
        auth_protocol: Arc<dyn AuthProtocol>,
    ) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .cookie_store(true)
            // Peer TLS is transport encryption only; trust lives in the
            // application-layer signature protocol.
            .danger_accept_invalid_certs(true)
            .build()?;

        let own_urls: HashSet<String> = config.own_urls.iter().cloned().collect();
        let (shutdown, _) = watch::channel(false);

        Ok(Transport {
            inner: Arc::new(Inner {
                config,
                controller_hub,
                key_store,
                blob_store,
                peer_store,
                resolver,
                tree_protocol,
                auth_protocol,
                cookie_secret: RwLock::new([0u8; 32]),
                pending_authorizations: Mutex::new(HashMap::new()),
                own_urls: RwLock::new(own_urls),
                http_client,
                shutdown,
                local_addr: RwLock::new(None),
                local_addr_ssl: RwLock::new(None),
            }),
        })
    }

    /// Bind both listeners and begin serving.
    pub async fn start(&self) -> Result<()> {
        let config = &self.inner.config;
        info!(addr = %config.listen_addr, "opening {TRANSPORT_NAME} transport");
        if let Some(ssl) = &config.listen_addr_ssl {
            info!(addr = %ssl, "opening {TRANSPORT_NAME} transport (ssl)");
            let own_url = if ssl.starts_with(':') {
                format!("https://localhost{ssl}")
            } else {
                format!("https://{ssl}")
            };
            self.inner.own_urls.write().insert(own_url);
        }

        self.find_or_create_cookie_secret()?;
        self.register_self_credentials()?;

        let router = self.router();

        let listener = TcpListener::bind(&config.listen_addr).await?;
        *self.inner.local_addr.write() = Some(listener.local_addr()?);
        let plain_router = router.clone();
        let mut shutdown = self.done();
        tokio::spawn(async move {
            let serve = axum::serve(listener, plain_router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.changed().await;
                });
            if let Err(err) = serve.await {
                error!(%err, "while running HTTP server");
            }
        });

        if let (Some(ssl_addr), Some(identity)) = (&config.listen_addr_ssl, &config.tls_identity) {
            let tls_config = Arc::new(tls::build_tls_server_config(identity)?);
            let listener = TcpListener::bind(ssl_addr).await?;
            *self.inner.local_addr_ssl.write() = Some(listener.local_addr()?);
            let transport = self.clone();
            tokio::spawn(async move {
                tls::run_tls_server(transport, listener, tls_config, router).await;
            });
        }

        Ok(())
    }

    /// Stop serving. Non-graceful: in-flight subscriptions end immediately.
    pub fn close(&self) {
        let _ = self.inner.shutdown.send(true);
    }

    pub fn name(&self) -> &'static str {
        TRANSPORT_NAME
    }

    /// Fires when the transport is shutting down.
    pub fn done(&self) -> watch::Receiver<bool> {
        self.inner.shutdown.subscribe()
    }

    /// Bound plaintext address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.read()
    }

    /// Bound TLS address, once started.
    pub fn local_addr_ssl(&self) -> Option<SocketAddr> {
        *self.inner.local_addr_ssl.read()
    }

    pub fn is_own_url(&self, url: &str) -> bool {
        self.inner.own_urls.read().contains(url)
    }

    pub(crate) fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    pub(crate) fn controller_hub(&self) -> &Arc<dyn ControllerHub> {
        &self.inner.controller_hub
    }

    pub(crate) fn key_store(&self) -> &Arc<dyn KeyStore> {
        &self.inner.key_store
    }

    pub(crate) fn blob_store(&self) -> &Arc<dyn BlobStore> {
        &self.inner.blob_store
    }

    pub(crate) fn peer_store(&self) -> &Arc<dyn PeerStore> {
        &self.inner.peer_store
    }

    pub(crate) fn resolver(&self) -> &Arc<dyn Resolver> {
        &self.inner.resolver
    }

    pub(crate) fn tree_protocol(&self) -> &Arc<dyn TreeProtocol> {
        &self.inner.tree_protocol
    }

    pub(crate) fn auth_protocol(&self) -> &Arc<dyn AuthProtocol> {
        &self.inner.auth_protocol
    }

    pub(crate) fn http_client(&self) -> &reqwest::Client {
        &self.inner.http_client
    }

    pub(crate) fn cookie_secret(&self) -> [u8; 32] {
        *self.inner.cookie_secret.read()
    }

    /// The axum router serving this transport.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(subscriptions::serve_ws))
            .fallback(dispatch)
            .method_not_allowed_fallback(dispatch)
            .layer(CorsLayer::permissive())
            .with_state(self.clone())
    }

    pub(crate) fn find_or_create_cookie_secret(&self) -> Result<()> {
        let existing = self
            .inner
            .key_store
            .extra_user_data(COOKIE_SECRET_KEY)?
            .and_then(|v| v.as_str().map(str::to_owned))
            .and_then(|s| hex::decode(s).ok())
            .and_then(|b| <[u8; 32]>::try_from(b).ok());

        let secret = match existing {
            Some(secret) => secret,
            None => {
                let secret: [u8; 32] = rand::random();
                self.inner
                    .key_store
                    .save_extra_user_data(COOKIE_SECRET_KEY, Value::String(hex::encode(secret)))?;
                secret
            }
        };
        *self.inner.cookie_secret.write() = secret;
        Ok(())
    }

    fn register_self_credentials(&self) -> Result<()> {
        let identities = self.inner.key_store.identities()?;
        let own_urls: Vec<String> = self.inner.own_urls.read().iter().cloned().collect();
        for identity in identities {
            for own_url in &own_urls {
                self.inner.peer_store.add_verified_credentials(
                    PeerDialInfo::new(TRANSPORT_NAME, own_url.clone()),
                    "self",
                    identity.address,
                    Some(identity.signing_pubkey.clone()),
                    identity.encryption_pubkey.clone(),
                );
            }
        }
        Ok(())
    }

    fn put_pending_authorization(&self, session_id: SessionId, challenge: Vec<u8>) {
        let mut pending = self.inner.pending_authorizations.lock();
        pending.retain(|_, entry| entry.created_at.elapsed() < PENDING_AUTH_TTL);
        pending.insert(
            session_id,
            PendingChallenge {
                challenge,
                created_at: Instant::now(),
            },
        );
    }

    fn pending_authorization(&self, session_id: SessionId) -> Option<Vec<u8>> {
        let pending = self.inner.pending_authorizations.lock();
        pending
            .get(&session_id)
            .filter(|entry| entry.created_at.elapsed() < PENDING_AUTH_TTL)
            .map(|entry| entry.challenge.clone())
    }

    fn remove_pending_authorization(&self, session_id: SessionId) {
        self.inner.pending_authorizations.lock().remove(&session_id);
    }

    /// Record peers advertised by a remote's `Alt-Svc` header.
    pub(crate) fn store_alt_svc_header_peers(&self, headers: &HeaderMap) {
        if let Some(value) = headers.get(header::ALT_SVC).and_then(|v| v.to_str().ok()) {
            for (transport_name, dial_addr, _metadata) in parse_alt_svc_header(value) {
                self.inner
                    .peer_store
                    .add_dial_info(PeerDialInfo::new(transport_name, dial_addr), "");
            }
        }
    }
}

/// Device unique id derived from a TLS client certificate, injected into
/// request extensions by the TLS accept loop.
#[derive(Clone)]
pub(crate) struct ClientCertDeviceId(pub String);

/// Per-request context assembled before dispatch: session, identity, and the
/// response decorations every reply carries.
pub(crate) struct RequestCtx {
    pub session_id: SessionId,
    pub address: Address,
    pub device_unique_id: String,
    set_cookies: Vec<String>,
    alt_svc: String,
}

impl RequestCtx {
    pub(crate) fn extract(transport: &Transport, req: &Request) -> Result<RequestCtx> {
        Self::extract_parts(
            transport,
            req.headers(),
            req.uri(),
            req.extensions().get::<ClientCertDeviceId>().cloned(),
        )
    }

    pub(crate) fn extract_parts(
        transport: &Transport,
        headers: &HeaderMap,
        uri: &Uri,
        client_cert_device_id: Option<ClientCertDeviceId>,
    ) -> Result<RequestCtx> {
        let mut set_cookies = Vec::new();

        let session_id = match transport.signed_cookie(headers, "sessionid") {
            Ok(bytes) => SessionId::from_bytes(&bytes)?,
            Err(_) => {
                let session_id = SessionId::random();
                set_cookies.push(transport.make_signed_cookie("sessionid", &session_id.0)?);
                session_id
            }
        };

        let address = transport.address_from_request(headers, uri)?;

        let device_unique_id = client_cert_device_id
            .map(|id| id.0)
            .unwrap_or_else(|| session_id.hex());

        // Gossip: advertise known peers on the way out, absorb the remote's
        // advertisements on the way in.
        let alt_svc = make_alt_svc_header(&transport.peer_store().all_dial_infos());
        transport.store_alt_svc_header_peers(headers);

        transport
            .peer_store()
            .add_dial_info(PeerDialInfo::new(TRANSPORT_NAME, ""), &device_unique_id);
        if !address.is_zero() {
            transport.peer_store().add_verified_credentials(
                PeerDialInfo::new(TRANSPORT_NAME, ""),
                &device_unique_id,
                address,
                None,
                None,
            );
        }

        Ok(RequestCtx {
            session_id,
            address,
            device_unique_id,
            set_cookies,
            alt_svc,
        })
    }

    /// Replace any previously minted cookie with a fresh signed one.
    pub(crate) fn set_signed_cookie(
        &mut self,
        transport: &Transport,
        name: &str,
        value: &[u8],
    ) -> Result<()> {
        let cookie = transport.make_signed_cookie(name, value)?;
        self.set_cookies.clear();
        self.set_cookies.push(cookie);
        Ok(())
    }

    pub(crate) fn peer_info(&self) -> PeerInfo {
        PeerInfo {
            dial_addr: None,
            session_id: self.session_id,
            device_unique_id: self.device_unique_id.clone(),
            address: self.address,
        }
    }

    /// Attach the Alt-Svc header and any pending cookies to a response.
    pub(crate) fn apply(&self, response: &mut Response) {
        if let Ok(value) = HeaderValue::from_str(&self.alt_svc) {
            response.headers_mut().insert(header::ALT_SVC, value);
        }
        for cookie in &self.set_cookies {
            if let Ok(value) = HeaderValue::from_str(cookie) {
                response.headers_mut().append(header::SET_COOKIE, value);
            }
        }
    }
}

/// Turn an error into the plain-text HTTP response the protocol promises.
pub(crate) fn error_response(err: &Error) -> Response {
    let status = err.status();
    if status.is_server_error() {
        error!(%err, "request failed");
    } else {
        debug!(%err, "rejected request");
    }
    (status, err.to_string()).into_response()
}

fn dump_requests_enabled() -> bool {
    matches!(
        std::env::var("HTTP_DUMP_REQUESTS").ok().as_deref(),
        Some("1") | Some("true") | Some("TRUE") | Some("True")
    )
}

/// The verb-overloaded entry point for everything except `GET /ws`.
#[axum::debug_handler]
async fn dispatch(State(transport): State<Transport>, req: Request) -> Response {
    if dump_requests_enabled() {
        debug!(
            method = %req.method(),
            uri = %req.uri(),
            headers = ?req.headers(),
            "incoming HTTP request"
        );
    }

    let mut ctx = match RequestCtx::extract(&transport, &req) {
        Ok(ctx) => ctx,
        Err(err) => {
            warn!(%err, "error preparing request context");
            return error_response(&err);
        }
    };

    let method = req.method().clone();
    let result = match method.as_str() {
        // Liveness polling and CORS preflight. The CORS layer fills in the
        // preflight headers.
        "HEAD" | "OPTIONS" => Ok(StatusCode::OK.into_response()),

        "AUTHORIZE" => auth::serve_authorize(&transport, &mut ctx, req.headers()).await,

        "GET" => {
            let path = req.uri().path().to_string();
            if path == "/braid.js" {
                state::serve_browser_js(&transport)
            } else if let Some(tx_id) = path.strip_prefix("/__tx/") {
                state::serve_get_tx(&transport, tx_id.to_string(), req.uri(), req.headers()).await
            } else if req.headers().contains_key("Subscribe") {
                subscriptions::serve_http_subscription(transport.clone(), &ctx, req.uri(), req.headers()).await
            } else {
                state::serve_get_state(&transport, &req).await
            }
        }

        "POST" => {
            if header_is_true(req.headers(), "Blob") {
                blob::serve_post_blob(&transport, req).await
            } else {
                Ok(StatusCode::OK.into_response())
            }
        }

        "ACK" => tx::serve_ack(&transport, &ctx, req).await,

        "PUT" => {
            if header_is_true(req.headers(), "Private") {
                tx::serve_put_private(&transport, &ctx, req).await
            } else {
                tx::serve_put(&transport, &ctx, req).await
            }
        }

        _ => Ok((StatusCode::METHOD_NOT_ALLOWED, "unsupported method").into_response()),
    };

    let mut response = match result {
        Ok(response) => response,
        Err(err) => error_response(&err),
    };
    ctx.apply(&mut response);
    response
}

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
}

pub(crate) fn header_is_true(headers: &HeaderMap, name: &str) -> bool {
    header_str(headers, name) == Some("true")
}

/// Parse the request's query string into a map.
pub(crate) fn query_params(uri: &Uri) -> HashMap<String, String> {
    uri.query()
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default()
}

/// Header value if present, else query parameter: headers win.
pub(crate) fn header_or_query<'a>(
    headers: &'a HeaderMap,
    params: &'a HashMap<String, String>,
    header_name: &str,
    query_name: &str,
) -> Option<&'a str> {
    header_str(headers, header_name).or_else(|| params.get(query_name).map(String::as_str))
}

pub(crate) fn json_response<T: serde::Serialize>(value: &T) -> Result<Response> {
    let body = serde_json::to_vec(value)?;
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .expect("response construction is infallible"))
}
