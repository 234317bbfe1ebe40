//! The "nelson" resolver: walks a state node, dereferences blob pointers,
//! and exposes content metadata.
//!
//! A node in the tree may be a *frame*: an object carrying `Content-Type`
//! (and optionally `Content-Length`) metadata alongside a `value` key that
//! holds the payload. Payloads may in turn be blob pointers of the form
//! `blob:sha3:<hex>`, which resolve through the blob store to raw bytes.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;

use crate::blob::BlobStore;
use crate::error::Result;
use crate::types::{Hash, Keypath};

use super::Node;

/// MIME type reported when nothing better is known. Callers typically fall
/// back to guessing from the filename extension.
pub const CONTENT_TYPE_OCTET_STREAM: &str = "application/octet-stream";

const FRAME_VALUE_KEY: &str = "value";
const FRAME_CONTENT_TYPE_KEY: &str = "Content-Type";
const FRAME_CONTENT_LENGTH_KEY: &str = "Content-Length";
const BLOB_REF_PREFIX: &str = "blob:sha3:";

/// A fully-resolved value ready to be written as a response body.
pub struct ResolvedValue {
    pub body: ResolvedBody,
    /// True if any referenced sub-resource could not be materialized; the
    /// transport reports such responses as 206 Partial Content.
    pub any_missing: bool,
}

pub enum ResolvedBody {
    Json(Value),
    Stream(BoxStream<'static, std::io::Result<Bytes>>),
}

/// Dereferences state nodes into typed, streamable values.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Walk `keypath` from `node`, passing through frames. `None` means the
    /// keypath does not exist.
    async fn seek(&self, node: &Node, keypath: &Keypath) -> Result<Option<Node>>;

    /// The content type the resolved node advertises.
    async fn content_type(&self, node: &Node) -> Result<String>;

    /// The advertised content length, or zero when unknown.
    async fn content_length(&self, node: &Node) -> Result<i64>;

    /// Materialize the node's value, dereferencing blob pointers.
    async fn value_recursive(&self, node: &Node) -> Result<Option<ResolvedValue>>;
}

/// Resolver over the in-tree frame/blob-pointer encoding, fetching blob
/// bytes from a [`BlobStore`].
pub struct BasicResolver {
    blob_store: Arc<dyn BlobStore>,
}

impl BasicResolver {
    pub fn new(blob_store: Arc<dyn BlobStore>) -> Self {
        BasicResolver { blob_store }
    }

    fn blob_ref_hash(value: &Value) -> Option<Hash> {
        let s = value.as_str()?;
        let hex_part = s.strip_prefix(BLOB_REF_PREFIX)?;
        let bytes = hex::decode(hex_part).ok()?;
        Hash::from_bytes(&bytes).ok()
    }

    fn frame_payload(value: &Value) -> Option<&Value> {
        let map = value.as_object()?;
        if map.contains_key(FRAME_CONTENT_TYPE_KEY) {
            map.get(FRAME_VALUE_KEY)
        } else {
            None
        }
    }
}

#[async_trait]
impl Resolver for BasicResolver {
    async fn seek(&self, node: &Node, keypath: &Keypath) -> Result<Option<Node>> {
        let mut current = match node.value() {
            Some(v) => v,
            None => return Ok(None),
        };
        for part in keypath.parts() {
            // Frames are transparent to traversal.
            if let Some(payload) = Self::frame_payload(&current) {
                current = payload.clone();
            }
            current = match &current {
                Value::Object(map) => match map.get(part) {
                    Some(v) => v.clone(),
                    None => return Ok(None),
                },
                Value::Array(items) => {
                    let idx = match Keypath::decode_slice_index(part)
                        .or_else(|| part.parse().ok())
                    {
                        Some(i) => i as usize,
                        None => return Ok(None),
                    };
                    match items.get(idx) {
                        Some(v) => v.clone(),
                        None => return Ok(None),
                    }
                }
                _ => return Ok(None),
            };
        }
        Ok(Some(Node::new(current)))
    }

    async fn content_type(&self, node: &Node) -> Result<String> {
        let value = match node.value() {
            Some(v) => v,
            None => return Ok(CONTENT_TYPE_OCTET_STREAM.into()),
        };
        if let Some(ct) = value
            .as_object()
            .and_then(|m| m.get(FRAME_CONTENT_TYPE_KEY))
            .and_then(|v| v.as_str())
        {
            return Ok(ct.to_string());
        }
        if Self::blob_ref_hash(&value).is_some() {
            return Ok(CONTENT_TYPE_OCTET_STREAM.into());
        }
        Ok("application/json".into())
    }

    async fn content_length(&self, node: &Node) -> Result<i64> {
        let value = match node.value() {
            Some(v) => v,
            None => return Ok(0),
        };
        let declared = value
            .as_object()
            .and_then(|m| m.get(FRAME_CONTENT_LENGTH_KEY))
            .and_then(|v| v.as_i64());
        Ok(declared.unwrap_or(0))
    }

    async fn value_recursive(&self, node: &Node) -> Result<Option<ResolvedValue>> {
        let mut value = match node.value() {
            Some(v) => v,
            None => return Ok(None),
        };
        while let Some(payload) = Self::frame_payload(&value) {
            value = payload.clone();
        }

        if let Some(hash) = Self::blob_ref_hash(&value) {
            return match self.blob_store.fetch_blob(hash).await? {
                Some(bytes) => Ok(Some(ResolvedValue {
                    body: ResolvedBody::Stream(
                        futures::stream::once(async move { Ok(bytes) }).boxed(),
                    ),
                    any_missing: false,
                })),
                None => Ok(Some(ResolvedValue {
                    body: ResolvedBody::Json(Value::Null),
                    any_missing: true,
                })),
            };
        }

        Ok(Some(ResolvedValue {
            body: ResolvedBody::Json(strip_frames(value)),
            any_missing: false,
        }))
    }
}

/// Replace nested frames with their payloads throughout a JSON document.
/// Blob pointers below the top level are left as pointer strings.
fn strip_frames(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            if map.contains_key(FRAME_CONTENT_TYPE_KEY) && map.contains_key(FRAME_VALUE_KEY) {
                let inner = map.into_iter().find(|(k, _)| k == FRAME_VALUE_KEY);
                return strip_frames(inner.map(|(_, v)| v).unwrap_or(Value::Null));
            }
            Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, strip_frames(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(strip_frames).collect()),
        other => other,
    }
}

/// Guess a MIME type from a filename extension. Falls back to
/// `application/octet-stream`.
pub fn guess_content_type_from_filename(filename: &str) -> String {
    let ext = filename.rsplit('.').next().unwrap_or_default();
    match ext.to_ascii_lowercase().as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/js",
        "json" => "application/json",
        "txt" => "text/plain",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "wasm" => "application/wasm",
        "pdf" => "application/pdf",
        "mp4" => "video/mp4",
        "mp3" => "audio/mpeg",
        _ => CONTENT_TYPE_OCTET_STREAM,
    }
    .to_string()
}

/// Make a blob pointer string for a SHA3 hash.
pub fn blob_ref(hash: Hash) -> String {
    format!("{BLOB_REF_PREFIX}{}", hash.hex())
}
