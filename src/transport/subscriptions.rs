//! Long-lived writable subscriptions over chunked HTTP and WebSocket.
//!
//! The transport builds a sink, hands it to the subscription layer via
//! `handle_writable_subscription_opened`, and keeps the connection open
//! until either the subscription's close signal or transport shutdown
//! fires. Frames are newline-delimited JSON.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::Response;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::swarm::{
    FetchHistoryOpts, SubscriptionClosed, SubscriptionMsg, SubscriptionRequest, SubscriptionType,
    WritableSubscription,
};
use crate::types::{Address, Keypath, Version};

use super::{error_response, header_or_query, query_params, ClientCertDeviceId, RequestCtx, Transport};

/// Frames buffered per subscriber before backpressure applies.
const SUBSCRIPTION_BUFFER: usize = 64;

struct SubscriptionParams {
    state_uri: String,
    keypath: Keypath,
    subscription_type: SubscriptionType,
    from_tx: Option<Version>,
}

fn parse_subscription_params(
    transport: &Transport,
    headers: &HeaderMap,
    uri: &Uri,
) -> Result<SubscriptionParams> {
    let params = query_params(uri);

    let state_uri = header_or_query(headers, &params, "State-URI", "state_uri")
        .map(str::to_owned)
        .or_else(|| transport.config().default_state_uri.clone())
        .ok_or_else(|| Error::BadRequest("missing State-URI".into()))?;

    let keypath = header_or_query(headers, &params, "Keypath", "keypath")
        .map(Keypath::new)
        .unwrap_or_default();

    let subscription_type = header_or_query(headers, &params, "Subscribe", "subscription_type")
        .ok_or_else(|| Error::BadRequest("missing Subscribe header".into()))?
        .parse()?;

    let from_tx = header_or_query(headers, &params, "From-Tx", "from_tx")
        .map(Version::from_hex)
        .transpose()?;

    Ok(SubscriptionParams {
        state_uri,
        keypath,
        subscription_type,
        from_tx,
    })
}

fn subscription_request(params: &SubscriptionParams, address: Address) -> SubscriptionRequest {
    SubscriptionRequest {
        state_uri: params.state_uri.clone(),
        keypath: params.keypath.clone(),
        subscription_type: params.subscription_type,
        fetch_history: params.from_tx.map(|from_tx| FetchHistoryOpts { from_tx }),
        addresses: vec![address],
    }
}

/// Sink that feeds a chunked HTTP response body.
pub struct HttpWritableSubscription {
    state_uri: String,
    sender: Mutex<Option<mpsc::Sender<Bytes>>>,
}

impl HttpWritableSubscription {
    fn new(state_uri: String, sender: mpsc::Sender<Bytes>) -> Self {
        HttpWritableSubscription {
            state_uri,
            sender: Mutex::new(Some(sender)),
        }
    }
}

#[async_trait]
impl WritableSubscription for HttpWritableSubscription {
    fn state_uri(&self) -> &str {
        &self.state_uri
    }

    async fn put(&self, msg: SubscriptionMsg) -> Result<()> {
        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or_else(|| Error::Internal("subscription closed".into()))?;
        let mut frame = serde_json::to_vec(&msg)?;
        frame.push(b'\n');
        sender
            .send(Bytes::from(frame))
            .await
            .map_err(|_| Error::Internal("subscriber went away".into()))
    }

    async fn close(&self) {
        self.sender.lock().take();
    }
}

/// Sink that feeds an upgraded WebSocket.
pub struct WsWritableSubscription {
    state_uri: String,
    addresses: Vec<Address>,
    sender: Mutex<Option<mpsc::Sender<SubscriptionMsg>>>,
}

impl WsWritableSubscription {
    fn new(state_uri: String, addresses: Vec<Address>, sender: mpsc::Sender<SubscriptionMsg>) -> Self {
        WsWritableSubscription {
            state_uri,
            addresses,
            sender: Mutex::new(Some(sender)),
        }
    }

    pub fn addresses(&self) -> &[Address] {
        &self.addresses
    }
}

#[async_trait]
impl WritableSubscription for WsWritableSubscription {
    fn state_uri(&self) -> &str {
        &self.state_uri
    }

    async fn put(&self, msg: SubscriptionMsg) -> Result<()> {
        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or_else(|| Error::Internal("subscription closed".into()))?;
        sender
            .send(msg)
            .await
            .map_err(|_| Error::Internal("subscriber went away".into()))
    }

    async fn close(&self) {
        self.sender.lock().take();
    }
}

/// `GET` with a `Subscribe` header: chunked long-poll subscription.
pub(super) async fn serve_http_subscription(
    transport: Transport,
    ctx: &RequestCtx,
    uri: &Uri,
    headers: &HeaderMap,
) -> Result<Response> {
    let params = parse_subscription_params(&transport, headers, uri)?;
    info!(
        address = %ctx.address,
        state_uri = %params.state_uri,
        "incoming http subscription"
    );

    let (frame_tx, frame_rx) = mpsc::channel::<Bytes>(SUBSCRIPTION_BUFFER);
    let subscription = Arc::new(HttpWritableSubscription::new(
        params.state_uri.clone(),
        frame_tx,
    ));

    let closed = transport
        .tree_protocol()
        .handle_writable_subscription_opened(
            subscription_request(&params, ctx.address),
            subscription.clone(),
        )
        .await?;

    spawn_subscription_watchdog(&transport, subscription, closed);

    let stream = ReceiverStream::new(frame_rx).map(Ok::<_, std::io::Error>);
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Subscribe", "keep-alive")
        .body(Body::from_stream(stream))
        .expect("response construction is infallible"))
}

/// Close the sink when the subscription layer or the transport shuts down.
/// Ending the sink drops the channel, which terminates the response body.
fn spawn_subscription_watchdog(
    transport: &Transport,
    subscription: Arc<dyn WritableSubscription>,
    closed: SubscriptionClosed,
) {
    let mut done = transport.done();
    tokio::spawn(async move {
        tokio::select! {
            _ = closed => {}
            _ = done.changed() => {}
        }
        subscription.close().await;
    });
}

/// `GET /ws`: WebSocket subscription.
pub(super) async fn serve_ws(
    State(transport): State<Transport>,
    headers: HeaderMap,
    uri: Uri,
    device_id: Option<axum::Extension<ClientCertDeviceId>>,
    ws: WebSocketUpgrade,
) -> Response {
    let ctx = match RequestCtx::extract_parts(
        &transport,
        &headers,
        &uri,
        device_id.map(|axum::Extension(id)| id),
    ) {
        Ok(ctx) => ctx,
        Err(err) => return error_response(&err),
    };

    let params = match parse_subscription_params(&transport, &headers, &uri) {
        Ok(params) => params,
        Err(err) => {
            let mut response = error_response(&err);
            ctx.apply(&mut response);
            return response;
        }
    };
    info!(
        address = %ctx.address,
        state_uri = %params.state_uri,
        "incoming websocket subscription"
    );

    let (frame_tx, frame_rx) = mpsc::channel::<SubscriptionMsg>(SUBSCRIPTION_BUFFER);
    let subscription = Arc::new(WsWritableSubscription::new(
        params.state_uri.clone(),
        vec![ctx.address],
        frame_tx,
    ));

    let closed = match transport
        .tree_protocol()
        .handle_writable_subscription_opened(
            subscription_request(&params, ctx.address),
            subscription.clone(),
        )
        .await
    {
        Ok(closed) => closed,
        Err(err) => {
            let mut response = error_response(&err);
            ctx.apply(&mut response);
            return response;
        }
    };

    let done = transport.done();
    let mut response =
        ws.on_upgrade(move |socket| drive_ws(socket, frame_rx, subscription, closed, done));
    ctx.apply(&mut response);
    response
}

async fn drive_ws(
    mut socket: WebSocket,
    mut frames: mpsc::Receiver<SubscriptionMsg>,
    subscription: Arc<WsWritableSubscription>,
    mut closed: SubscriptionClosed,
    mut done: tokio::sync::watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(msg) = frame else { break };
                let text = match serde_json::to_string(&msg) {
                    Ok(text) => text,
                    Err(err) => {
                        debug!(%err, "dropping unserializable subscription frame");
                        continue;
                    }
                };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // Inbound frames on a subscription socket are ignored.
                    Some(Ok(_)) => {}
                }
            }
            _ = &mut closed => break,
            _ = done.changed() => break,
        }
    }
    subscription.close().await;
    let _ = socket.send(Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_transport;

    #[test]
    fn test_parse_params_headers_win_over_query() {
        let transport = test_transport();
        let mut headers = HeaderMap::new();
        headers.insert("State-URI", "chat.example/header".parse().unwrap());
        headers.insert("Subscribe", "states".parse().unwrap());
        let uri: Uri = "/room?state_uri=chat.example/query&subscription_type=transactions"
            .parse()
            .unwrap();

        let params = parse_subscription_params(&transport, &headers, &uri).unwrap();
        assert_eq!(params.state_uri, "chat.example/header");
        assert_eq!(params.subscription_type, SubscriptionType::States);
    }

    #[test]
    fn test_parse_params_requires_subscription_type() {
        let transport = test_transport();
        let mut headers = HeaderMap::new();
        headers.insert("State-URI", "chat.example/room".parse().unwrap());
        let uri = Uri::from_static("/room");
        assert!(parse_subscription_params(&transport, &headers, &uri).is_err());
    }

    #[test]
    fn test_parse_params_from_tx() {
        let transport = test_transport();
        let version = Version::random();
        let mut headers = HeaderMap::new();
        headers.insert("State-URI", "chat.example/room".parse().unwrap());
        headers.insert("Subscribe", "transactions".parse().unwrap());
        headers.insert("From-Tx", version.hex().parse().unwrap());
        let uri = Uri::from_static("/room");

        let params = parse_subscription_params(&transport, &headers, &uri).unwrap();
        assert_eq!(params.from_tx, Some(version));
    }

    #[tokio::test]
    async fn test_http_sink_frames_are_newline_delimited_json() {
        let (tx, mut rx) = mpsc::channel(4);
        let sink = HttpWritableSubscription::new("chat.example/room".into(), tx);
        sink.put(SubscriptionMsg {
            state_uri: "chat.example/room".into(),
            tx: None,
            state: Some(serde_json::json!({"n": 1})),
            leaves: vec![],
        })
        .await
        .unwrap();

        let frame = rx.recv().await.unwrap();
        assert!(frame.ends_with(b"\n"));
        let parsed: serde_json::Value =
            serde_json::from_slice(&frame[..frame.len() - 1]).unwrap();
        assert_eq!(parsed["stateURI"], "chat.example/room");
    }

    #[tokio::test]
    async fn test_sink_put_after_close_errors() {
        let (tx, _rx) = mpsc::channel(4);
        let sink = HttpWritableSubscription::new("chat.example/room".into(), tx);
        sink.close().await;
        let err = sink
            .put(SubscriptionMsg {
                state_uri: "chat.example/room".into(),
                tx: None,
                state: None,
                leaves: vec![],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }
}
