//! The `AUTHORIZE` verb: a three-phase challenge/response identity proof.
//!
//! Which phase runs is decided by header presence:
//!
//! | `Challenge` | `Response` | phase |
//! |-------------|------------|-------|
//! | present     | absent     | 1: prove *our* identity against the remote's challenge |
//! | absent      | absent     | 2a: issue the remote a challenge |
//! | absent      | present    | 2b: verify the remote's signed response |
//!
//! Phases 2a/2b are stateful across requests, keyed by session id. Entries
//! expire after 60 seconds so hostile clients cannot grow the map forever.

use axum::body::Body;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::info;

use crate::crypto::{self, keccak256};
use crate::error::{Error, Result};
use crate::swarm::{PeerDialInfo, TRANSPORT_NAME};
use crate::types::Signature;

use super::{header_str, json_response, RequestCtx, Transport};

/// Challenge length in bytes; hex-encoded on the wire.
const CHALLENGE_LEN: usize = 32;

pub(super) async fn serve_authorize(
    transport: &Transport,
    ctx: &mut RequestCtx,
    headers: &HeaderMap,
) -> Result<Response> {
    if let Some(challenge_hex) = header_str(headers, "Challenge") {
        serve_challenge_identity_response(transport, challenge_hex).await
    } else if let Some(response_hex) = header_str(headers, "Response") {
        serve_challenge_identity_check_response(transport, ctx, response_hex).await
    } else {
        serve_challenge_identity(transport, ctx)
    }
}

/// Phase 1: a remote node challenged us; reply with our signed proofs.
async fn serve_challenge_identity_response(
    transport: &Transport,
    challenge_hex: &str,
) -> Result<Response> {
    let challenge = hex::decode(challenge_hex)
        .map_err(|_| Error::BadRequest("Challenge header: bad challenge message".into()))?;

    let responses = transport
        .auth_protocol()
        .respond_to_challenge(&challenge)
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;

    json_response(&responses)
}

/// Phase 2a: the remote wants a challenge (browser nodes we cannot dial).
fn serve_challenge_identity(transport: &Transport, ctx: &RequestCtx) -> Result<Response> {
    let challenge: Vec<u8> = (0..CHALLENGE_LEN).map(|_| rand::random()).collect();
    transport.put_pending_authorization(ctx.session_id, challenge.clone());
    Ok(Response::new(Body::from(hex::encode(challenge))))
}

/// Phase 2b: the remote answered our challenge; recover their address, bind
/// it to the session via the signed `address` cookie, and record the
/// verified credential.
async fn serve_challenge_identity_check_response(
    transport: &Transport,
    ctx: &mut RequestCtx,
    response_hex: &str,
) -> Result<Response> {
    let challenge = transport
        .pending_authorization(ctx.session_id)
        .ok_or_else(|| Error::BadRequest("no pending authorization".into()))?;

    let sig = Signature::from_hex(response_hex)?;
    let pubkey = crypto::recover_signing_pubkey(&keccak256(&challenge), &sig)?;
    let address = crypto::pubkey_address(&pubkey);

    ctx.set_signed_cookie(transport, "address", address.as_bytes())?;

    transport.peer_store().add_verified_credentials(
        PeerDialInfo::new(TRANSPORT_NAME, ""),
        &ctx.device_unique_id,
        address,
        Some(pubkey.to_encoded_point(false).as_bytes().to_vec()),
        None,
    );
    transport.remove_pending_authorization(ctx.session_id);

    info!(%address, "authorized remote identity");
    Ok(StatusCode::OK.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SigKeypair;
    use crate::testutil::test_transport;
    use crate::types::SessionId;

    #[tokio::test]
    async fn test_challenge_then_response_binds_address() {
        let transport = test_transport();
        let session_id = SessionId::random();

        let challenge: Vec<u8> = (0..CHALLENGE_LEN).map(|_| rand::random()).collect();
        transport.put_pending_authorization(session_id, challenge.clone());

        let keypair = SigKeypair::generate();
        let sig = keypair.sign_hash(&keccak256(&challenge)).unwrap();

        let mut ctx = RequestCtx::extract_parts(
            &transport,
            &HeaderMap::new(),
            &axum::http::Uri::from_static("/"),
            None,
        )
        .unwrap();
        ctx.session_id = session_id;

        let response =
            serve_challenge_identity_check_response(&transport, &mut ctx, &sig.hex())
                .await
                .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // The pending entry is consumed.
        assert!(transport.pending_authorization(session_id).is_none());
    }

    #[tokio::test]
    async fn test_response_without_pending_challenge_is_rejected() {
        let transport = test_transport();
        let mut ctx = RequestCtx::extract_parts(
            &transport,
            &HeaderMap::new(),
            &axum::http::Uri::from_static("/"),
            None,
        )
        .unwrap();

        let err = serve_challenge_identity_check_response(&transport, &mut ctx, "deadbeef")
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_bad_hex_response_is_rejected_and_retryable() {
        let transport = test_transport();
        let session_id = SessionId::random();
        transport.put_pending_authorization(session_id, vec![1, 2, 3]);

        let mut ctx = RequestCtx::extract_parts(
            &transport,
            &HeaderMap::new(),
            &axum::http::Uri::from_static("/"),
            None,
        )
        .unwrap();
        ctx.session_id = session_id;

        let err = serve_challenge_identity_check_response(&transport, &mut ctx, "zzzz")
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        // Failure does not consume the pending challenge.
        assert!(transport.pending_authorization(session_id).is_some());
    }
}
