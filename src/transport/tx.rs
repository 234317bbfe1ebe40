//! Tx ingestion: `PUT` (signed state txs, plain or multipart), `PUT` with
//! `Private: true` (encrypted txs), and `ACK`.

use axum::extract::{FromRequest, Multipart, Request};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tracing::info;

use crate::crypto;
use crate::error::{Error, Result};
use crate::tree::{EncryptedTx, Patch, Tx};
use crate::types::{Signature, Version};

use super::{header_is_true, header_str, RequestCtx, Transport};

/// Upper bound on tx and multipart bodies.
const MAX_TX_BODY_BYTES: usize = 10_000_000;

/// `PUT`: parse a signed tx and hand it to the tree protocol. The response
/// returns immediately; validation and application happen asynchronously.
pub(super) async fn serve_put(
    transport: &Transport,
    ctx: &RequestCtx,
    req: Request,
) -> Result<Response> {
    info!("incoming tx");
    let headers = req.headers().clone();

    let sig = match header_str(&headers, "Signature") {
        None => return Err(Error::BadRequest("missing Signature header".into())),
        Some(hex) => {
            Signature::from_hex(hex).map_err(|_| Error::BadRequest("bad Signature header".into()))?
        }
    };

    let id = match header_str(&headers, "Version") {
        None => Version::random(),
        Some(hex) => {
            Version::from_hex(hex).map_err(|_| Error::BadRequest("bad Version header".into()))?
        }
    };

    let parents = match header_str(&headers, "Parents") {
        None => Vec::new(),
        Some(csv) => csv
            .split(',')
            .map(|part| Version::from_hex(part.trim()))
            .collect::<Result<Vec<_>>>()
            .map_err(|_| Error::BadRequest("bad Parents header".into()))?,
    };

    let checkpoint = header_is_true(&headers, "Checkpoint");

    let state_uri = header_str(&headers, "State-URI")
        .map(str::to_owned)
        .or_else(|| transport.config().default_state_uri.clone())
        .unwrap_or_default();

    let is_multipart = header_str(&headers, "Content-Type")
        .map(|ct| ct.starts_with("multipart/form-data"))
        .unwrap_or(false);

    let (attachment, patches_text) = if is_multipart {
        read_multipart_tx(req).await?
    } else {
        let body = axum::body::to_bytes(req.into_body(), MAX_TX_BODY_BYTES)
            .await
            .map_err(|e| Error::BadRequest(format!("error reading body: {e}")))?;
        let text = String::from_utf8(body.to_vec())
            .map_err(|_| Error::BadRequest("body is not valid utf-8".into()))?;
        (None, Some(text))
    };

    let mut patches = Vec::new();
    if let Some(text) = patches_text {
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let patch: Patch = line
                .parse()
                .map_err(|_| Error::BadRequest(format!("bad patch string: {line}")))?;
            patches.push(patch);
        }
    }

    let mut tx = Tx {
        id,
        parents,
        sig,
        patches,
        attachment,
        state_uri,
        checkpoint,
        from: Default::default(),
    };

    let pubkey = crypto::recover_signing_pubkey(&tx.hash(), &tx.sig)
        .map_err(|_| Error::BadRequest("bad signature".into()))?;
    tx.from = crypto::pubkey_address(&pubkey);

    // Hand off without blocking the response.
    let tree_protocol = transport.tree_protocol().clone();
    let peer = ctx.peer_info();
    tokio::spawn(async move {
        tree_protocol.handle_tx_received(tx, peer).await;
    });

    Ok(StatusCode::OK.into_response())
}

/// Multipart tx bodies carry a file field `attachment` and a form value
/// `patches` (newline-separated patch lines).
async fn read_multipart_tx(req: Request) -> Result<(Option<Bytes>, Option<String>)> {
    let parse_err = || Error::BadRequest("error parsing multipart form".into());

    let mut multipart = Multipart::from_request(req, &())
        .await
        .map_err(|_| parse_err())?;

    let mut attachment = None;
    let mut patches = None;
    while let Some(field) = multipart.next_field().await.map_err(|_| parse_err())? {
        match field.name() {
            Some("attachment") => {
                attachment = Some(field.bytes().await.map_err(|_| parse_err())?);
            }
            Some("patches") => {
                patches = Some(field.text().await.map_err(|_| parse_err())?);
            }
            _ => {}
        }
    }

    if attachment.is_none() {
        return Err(parse_err());
    }
    Ok((attachment, patches))
}

/// `PUT` with `Private: true`: a JSON-encoded encrypted tx, relayed opaquely.
pub(super) async fn serve_put_private(
    transport: &Transport,
    ctx: &RequestCtx,
    req: Request,
) -> Result<Response> {
    info!("incoming private tx");

    let body = axum::body::to_bytes(req.into_body(), MAX_TX_BODY_BYTES)
        .await
        .map_err(|e| Error::BadRequest(format!("error reading body: {e}")))?;
    let encrypted_tx: EncryptedTx =
        serde_json::from_slice(&body).map_err(|_| Error::BadRequest("bad JSON".into()))?;

    transport
        .tree_protocol()
        .handle_private_tx_received(encrypted_tx, ctx.peer_info())
        .await;

    Ok(StatusCode::OK.into_response())
}

/// `ACK`: the body is a hex tx id; the state URI rides in a header.
pub(super) async fn serve_ack(
    transport: &Transport,
    ctx: &RequestCtx,
    req: Request,
) -> Result<Response> {
    let state_uri = header_str(req.headers(), "State-URI")
        .map(str::to_owned)
        .unwrap_or_default();

    let body = axum::body::to_bytes(req.into_body(), MAX_TX_BODY_BYTES)
        .await
        .map_err(|_| Error::BadRequest("error reading body".into()))?;
    let tx_id = std::str::from_utf8(&body)
        .ok()
        .and_then(|s| Version::from_hex(s).ok())
        .ok_or_else(|| Error::BadRequest("error reading body".into()))?;

    transport
        .tree_protocol()
        .handle_ack_received(&state_uri, tx_id, ctx.peer_info())
        .await;

    Ok(StatusCode::OK.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SigKeypair;
    use crate::testutil::{test_transport_with, RecordingTreeProtocol};
    use crate::types::Keypath;
    use axum::body::Body;
    use std::sync::Arc;
    use std::time::Duration;

    fn signed_tx_request(keypair: &SigKeypair, patches: &str) -> (Request, Version) {
        let id = Version::random();
        let tx = Tx {
            id,
            parents: vec![],
            sig: Signature::default(),
            patches: patches
                .lines()
                .filter(|l| !l.trim().is_empty())
                .map(|l| l.parse().unwrap())
                .collect(),
            attachment: None,
            state_uri: "chat.example/room".into(),
            checkpoint: false,
            from: Default::default(),
        };
        let sig = keypair.sign_hash(&tx.hash()).unwrap();

        let req = Request::builder()
            .method("PUT")
            .uri("/")
            .header("Signature", sig.hex())
            .header("Version", id.hex())
            .header("State-URI", "chat.example/room")
            .body(Body::from(patches.to_string()))
            .unwrap();
        (req, id)
    }

    #[tokio::test]
    async fn test_put_recovers_signer_and_hands_off() {
        let recording = Arc::new(RecordingTreeProtocol::new());
        let transport = test_transport_with(recording.clone());
        let keypair = SigKeypair::generate();

        let (req, id) = signed_tx_request(&keypair, ".messages[0:0] = [\"hello\"]\n");
        let ctx = RequestCtx::extract_parts(
            &transport,
            req.headers(),
            req.uri(),
            None,
        )
        .unwrap();

        let response = serve_put(&transport, &ctx, req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let tx = recording.wait_for_tx(Duration::from_secs(1)).await;
        assert_eq!(tx.id, id);
        assert_eq!(tx.from, keypair.address());
        assert_eq!(tx.patches.len(), 1);
        assert_eq!(tx.patches[0].keypath, Keypath::new("messages"));
    }

    #[tokio::test]
    async fn test_put_requires_signature_header() {
        let transport = test_transport_with(Arc::new(RecordingTreeProtocol::new()));
        let req = Request::builder()
            .method("PUT")
            .uri("/")
            .body(Body::from(".foo = 1"))
            .unwrap();
        let ctx =
            RequestCtx::extract_parts(&transport, req.headers(), req.uri(), None).unwrap();

        let err = serve_put(&transport, &ctx, req).await.unwrap_err();
        assert_eq!(err.to_string(), "bad request: missing Signature header");
    }

    #[tokio::test]
    async fn test_put_rejects_bad_patch_line() {
        let transport = test_transport_with(Arc::new(RecordingTreeProtocol::new()));
        let keypair = SigKeypair::generate();
        let sig = keypair.sign_hash(&crate::crypto::keccak256(b"x")).unwrap();

        let req = Request::builder()
            .method("PUT")
            .uri("/")
            .header("Signature", sig.hex())
            .body(Body::from("this is not a patch"))
            .unwrap();
        let ctx =
            RequestCtx::extract_parts(&transport, req.headers(), req.uri(), None).unwrap();

        let err = serve_put(&transport, &ctx, req).await.unwrap_err();
        assert!(err.to_string().contains("bad patch string"));
    }

    #[tokio::test]
    async fn test_put_rejects_wrong_signature() {
        let transport = test_transport_with(Arc::new(RecordingTreeProtocol::new()));
        let keypair = SigKeypair::generate();
        // Signature over unrelated bytes cannot recover to a consistent key
        // for this tx... but recovery itself may still succeed, yielding a
        // different address. A truncated signature must hard-fail.
        let _ = keypair;
        let req = Request::builder()
            .method("PUT")
            .uri("/")
            .header("Signature", "deadbeef")
            .body(Body::from(".foo = 1"))
            .unwrap();
        let ctx =
            RequestCtx::extract_parts(&transport, req.headers(), req.uri(), None).unwrap();

        let err = serve_put(&transport, &ctx, req).await.unwrap_err();
        assert_eq!(err.to_string(), "bad request: bad signature");
    }

    #[tokio::test]
    async fn test_ack_parses_hex_tx_id() {
        let recording = Arc::new(RecordingTreeProtocol::new());
        let transport = test_transport_with(recording.clone());
        let version = Version::random();

        let req = Request::builder()
            .method("ACK")
            .uri("/")
            .header("State-URI", "chat.example/room")
            .body(Body::from(version.hex()))
            .unwrap();
        let ctx =
            RequestCtx::extract_parts(&transport, req.headers(), req.uri(), None).unwrap();

        let response = serve_ack(&transport, &ctx, req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let acks = recording.acks.lock().clone();
        assert_eq!(acks, vec![("chat.example/room".to_string(), version)]);
    }

    #[tokio::test]
    async fn test_ack_rejects_bad_body() {
        let transport = test_transport_with(Arc::new(RecordingTreeProtocol::new()));
        let req = Request::builder()
            .method("ACK")
            .uri("/")
            .body(Body::from("not hex"))
            .unwrap();
        let ctx =
            RequestCtx::extract_parts(&transport, req.headers(), req.uri(), None).unwrap();
        assert!(serve_ack(&transport, &ctx, req).await.is_err());
    }

    #[tokio::test]
    async fn test_put_private_decodes_encrypted_tx() {
        let recording = Arc::new(RecordingTreeProtocol::new());
        let transport = test_transport_with(recording.clone());

        let encrypted = EncryptedTx {
            tx_id: Version::random(),
            encrypted_payload: hex::encode(b"ciphertext"),
            sender_public_key: hex::encode(b"pubkey"),
            recipient_address: crate::types::Address([5; 20]),
        };
        let req = Request::builder()
            .method("PUT")
            .uri("/")
            .header("Private", "true")
            .body(Body::from(serde_json::to_vec(&encrypted).unwrap()))
            .unwrap();
        let ctx =
            RequestCtx::extract_parts(&transport, req.headers(), req.uri(), None).unwrap();

        serve_put_private(&transport, &ctx, req).await.unwrap();
        assert_eq!(recording.private_txs.lock().len(), 1);
    }
}
