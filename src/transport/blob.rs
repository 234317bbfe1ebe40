//! Blob ingest: `POST` with `Blob: true` and a multipart `blob` field.

use axum::extract::{FromRequest, Multipart, Request};
use axum::response::Response;
use serde::Serialize;
use tracing::{error, info};

use crate::blob::Sha1Hash;
use crate::error::{Error, Result};
use crate::types::Hash;

use super::{json_response, Transport};

#[derive(Serialize)]
#[serde(rename_all = "UPPERCASE")]
struct StoreBlobResponse {
    sha1: Sha1Hash,
    sha3: Hash,
}

pub(super) async fn serve_post_blob(transport: &Transport, req: Request) -> Result<Response> {
    info!("incoming blob");

    let parse_err = || Error::BadRequest("error parsing multipart form".into());
    let mut multipart = Multipart::from_request(req, &())
        .await
        .map_err(|_| parse_err())?;

    let mut blob = None;
    while let Some(field) = multipart.next_field().await.map_err(|_| parse_err())? {
        if field.name() == Some("blob") {
            blob = Some(field.bytes().await.map_err(|_| parse_err())?);
        }
    }
    let blob = blob.ok_or_else(parse_err)?;

    let (sha1, sha3) = transport
        .blob_store()
        .store_blob(blob)
        .await
        .map_err(|err| {
            error!(%err, "error storing blob");
            Error::Internal("internal server error".into())
        })?;

    json_response(&StoreBlobResponse { sha1, sha3 })
}
