//! Transactions, patches, and materialized state nodes.
//!
//! The transport does not own the state machinery; it parses txs off the
//! wire, hands them to the controller hub, and reads state back out through
//! [`ControllerHub`] and the resolver in [`nelson`]. What lives here is the
//! data model those interfaces speak.

pub mod nelson;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::crypto::keccak256;
use crate::error::{Error, Result};
use crate::types::{Address, Hash, Keypath, Signature, Version};

/// A half-open range over a JSON array or string, used by the `json=S:E`
/// form of the `Range` header and by patch subscripts. Negative values are
/// offsets from the end.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub start: i64,
    pub end: i64,
}

impl Range {
    /// Resolve against a length: negative endpoints count back from `len`,
    /// and the result is clamped to `[0, len]`.
    pub fn resolve(&self, len: usize) -> (usize, usize) {
        let len = len as i64;
        let clamp = |v: i64| -> usize {
            let v = if v < 0 { len + v } else { v };
            v.clamp(0, len) as usize
        };
        let start = clamp(self.start);
        let end = clamp(self.end);
        (start, end.max(start))
    }
}

/// A single mutation against a state tree: a keypath, an optional range, and
/// a JSON value.
///
/// The wire form is one line per patch:
///
/// ```text
/// .messages[0:0] = [{"text":"hello"}]
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct Patch {
    pub keypath: Keypath,
    pub range: Option<Range>,
    pub value: Value,
}

impl FromStr for Patch {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self> {
        let line = line.trim();
        let eq = line
            .find(" = ")
            .ok_or_else(|| Error::BadRequest(format!("bad patch string: {line}")))?;
        let (lhs, rhs) = (&line[..eq], &line[eq + 3..]);

        let (path_part, range) = match (lhs.rfind('['), lhs.ends_with(']')) {
            (Some(open), true) => {
                let inner = &lhs[open + 1..lhs.len() - 1];
                let colon = inner
                    .find(':')
                    .ok_or_else(|| Error::BadRequest(format!("bad patch range: {lhs}")))?;
                let start = inner[..colon]
                    .parse()
                    .map_err(|_| Error::BadRequest(format!("bad patch range: {lhs}")))?;
                let end = inner[colon + 1..]
                    .parse()
                    .map_err(|_| Error::BadRequest(format!("bad patch range: {lhs}")))?;
                (&lhs[..open], Some(Range { start, end }))
            }
            _ => (lhs, None),
        };

        let segments: Vec<&str> = path_part
            .trim_start_matches('.')
            .split('.')
            .filter(|s| !s.is_empty())
            .collect();

        let value: Value = serde_json::from_str(rhs)
            .map_err(|_| Error::BadRequest(format!("bad patch string: {line}")))?;

        Ok(Patch {
            keypath: Keypath::new(segments.join("/")),
            range,
            value,
        })
    }
}

impl fmt::Display for Patch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.keypath.is_empty() {
            write!(f, ".")?;
        }
        for part in self.keypath.parts() {
            write!(f, ".{part}")?;
        }
        if let Some(range) = &self.range {
            write!(f, "[{}:{}]", range.start, range.end)?;
        }
        write!(f, " = {}", self.value)
    }
}

impl Serialize for Patch {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Patch {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// A signed transaction against a state URI.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tx {
    pub id: Version,
    pub parents: Vec<Version>,
    pub sig: Signature,
    pub patches: Vec<Patch>,
    #[serde(skip_serializing_if = "Option::is_none", default, with = "hex_bytes")]
    pub attachment: Option<Bytes>,
    #[serde(rename = "stateURI")]
    pub state_uri: String,
    pub checkpoint: bool,
    pub from: Address,
}

mod hex_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(
        value: &Option<Bytes>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_str(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Option<Bytes>, D::Error> {
        let opt: Option<String> = Option::deserialize(deserializer)?;
        match opt {
            Some(s) => Ok(Some(Bytes::from(
                hex::decode(&s).map_err(de::Error::custom)?,
            ))),
            None => Ok(None),
        }
    }
}

impl Tx {
    /// The digest the tx signature covers: Keccak-256 over a canonical byte
    /// serialization of the id, parents, state URI, patch lines, and
    /// attachment.
    pub fn hash(&self) -> Hash {
        let mut buf = Vec::new();
        buf.extend_from_slice(self.id.as_bytes());
        for parent in &self.parents {
            buf.extend_from_slice(parent.as_bytes());
        }
        buf.extend_from_slice(self.state_uri.as_bytes());
        buf.push(0);
        for patch in &self.patches {
            buf.extend_from_slice(patch.to_string().as_bytes());
            buf.push(b'\n');
        }
        if let Some(attachment) = &self.attachment {
            buf.extend_from_slice(attachment);
        }
        keccak256(&buf)
    }
}

/// A tx encrypted for a specific recipient, relayed opaquely.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedTx {
    pub tx_id: Version,
    pub encrypted_payload: String,
    pub sender_public_key: String,
    pub recipient_address: Address,
}

/// A materialized view into a state tree at some version: a shared JSON
/// document plus a keypath and optional range scoping the view.
#[derive(Clone, Debug)]
pub struct Node {
    root: Arc<Value>,
    keypath: Keypath,
    range: Option<Range>,
}

impl Node {
    pub fn new(value: Value) -> Self {
        Node {
            root: Arc::new(value),
            keypath: Keypath::default(),
            range: None,
        }
    }

    pub fn keypath(&self) -> &Keypath {
        &self.keypath
    }

    /// A sub-view at `keypath` (relative to this node) with `range` applied.
    pub fn node_at(&self, keypath: &Keypath, range: Option<Range>) -> Node {
        let mut combined = self.keypath.clone();
        for part in keypath.parts() {
            combined = combined.push(part);
        }
        Node {
            root: self.root.clone(),
            keypath: combined,
            range: range.or(self.range),
        }
    }

    fn lookup(&self) -> Option<&Value> {
        let mut current: &Value = &self.root;
        for part in self.keypath.parts() {
            match current {
                Value::Object(map) => current = map.get(part)?,
                Value::Array(items) => {
                    let idx = Keypath::decode_slice_index(part)
                        .or_else(|| part.parse().ok())? as usize;
                    current = items.get(idx)?;
                }
                _ => return None,
            }
        }
        Some(current)
    }

    pub fn exists(&self, keypath: &Keypath) -> bool {
        self.node_at(keypath, None).lookup().is_some()
    }

    /// The value at this node, with the view's range applied to arrays and
    /// strings.
    pub fn value(&self) -> Option<Value> {
        let value = self.lookup()?.clone();
        match (self.range, value) {
            (Some(range), Value::Array(items)) => {
                let (start, end) = range.resolve(items.len());
                Some(Value::Array(items[start..end].to_vec()))
            }
            (Some(range), Value::String(s)) => {
                let (start, end) = range.resolve(s.len());
                Some(Value::String(s.get(start..end).unwrap_or_default().to_string()))
            }
            (_, value) => Some(value),
        }
    }

    /// Length of the underlying resource: element count for arrays, key
    /// count for objects, byte length for strings, zero otherwise.
    pub fn length(&self) -> u64 {
        match self.lookup() {
            Some(Value::Array(items)) => items.len() as u64,
            Some(Value::Object(map)) => map.len() as u64,
            Some(Value::String(s)) => s.len() as u64,
            _ => 0,
        }
    }
}

/// The controller hub: fetches txs, tips, and materialized state for the
/// state URIs this node replicates. Implemented outside the transport.
#[async_trait]
pub trait ControllerHub: Send + Sync {
    async fn fetch_tx(&self, state_uri: &str, id: Version) -> Result<Tx>;

    /// The current tips of the state's version DAG.
    async fn leaves(&self, state_uri: &str) -> Result<Vec<Version>>;

    /// Materialize the state at `version` (`None` means the latest).
    async fn state_at_version(&self, state_uri: &str, version: Option<Version>) -> Result<Node>;

    /// Evaluate a secondary index. `index_arg` of `None` fetches the whole
    /// index.
    async fn query_index(
        &self,
        state_uri: &str,
        version: Option<Version>,
        keypath: &Keypath,
        index_name: &Keypath,
        index_arg: Option<Keypath>,
        range: Option<Range>,
    ) -> Result<Node>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_patch_simple() {
        let patch: Patch = ".foo.bar = {\"a\": 1}".parse().unwrap();
        assert_eq!(patch.keypath.as_str(), "foo/bar");
        assert!(patch.range.is_none());
        assert_eq!(patch.value, json!({"a": 1}));
    }

    #[test]
    fn test_parse_patch_with_range() {
        let patch: Patch = ".messages[0:0] = [{\"text\":\"hi\"}]".parse().unwrap();
        assert_eq!(patch.keypath.as_str(), "messages");
        assert_eq!(patch.range, Some(Range { start: 0, end: 0 }));
    }

    #[test]
    fn test_parse_patch_negative_range() {
        let patch: Patch = ".log[-10:-5] = []".parse().unwrap();
        assert_eq!(patch.range, Some(Range { start: -10, end: -5 }));
    }

    #[test]
    fn test_parse_patch_rejects_garbage() {
        assert!(Patch::from_str("not a patch").is_err());
        assert!(Patch::from_str(".foo = not json").is_err());
        assert!(Patch::from_str(".foo[1:] = 1").is_err());
    }

    #[test]
    fn test_patch_display_roundtrip() {
        for line in [
            ".foo.bar = {\"a\":1}",
            ".messages[0:0] = [\"x\"]",
            ". = {\"whole\":\"doc\"}",
        ] {
            let patch: Patch = line.parse().unwrap();
            let reparsed: Patch = patch.to_string().parse().unwrap();
            assert_eq!(patch, reparsed);
        }
    }

    #[test]
    fn test_tx_hash_changes_with_contents() {
        let tx = Tx {
            id: Version([1; 32]),
            parents: vec![],
            sig: Signature::default(),
            patches: vec![".foo = 1".parse().unwrap()],
            attachment: None,
            state_uri: "example.com/test".into(),
            checkpoint: false,
            from: Address::default(),
        };
        let mut other = tx.clone();
        other.state_uri = "example.com/other".into();
        assert_ne!(tx.hash(), other.hash());

        let mut with_attachment = tx.clone();
        with_attachment.attachment = Some(Bytes::from_static(b"hello"));
        assert_ne!(tx.hash(), with_attachment.hash());
    }

    #[test]
    fn test_node_lookup_and_length() {
        let node = Node::new(json!({
            "foo": {"bar": [1, 2, 3], "baz": "hello"},
        }));
        assert_eq!(
            node.node_at(&Keypath::new("foo/bar"), None).value(),
            Some(json!([1, 2, 3]))
        );
        assert_eq!(node.node_at(&Keypath::new("foo/bar"), None).length(), 3);
        assert_eq!(node.node_at(&Keypath::new("foo/baz"), None).length(), 5);
        assert!(!node.exists(&Keypath::new("foo/missing")));
    }

    #[test]
    fn test_node_range_on_array() {
        let node = Node::new(json!([0, 1, 2, 3, 4]));
        let ranged = node.node_at(&Keypath::default(), Some(Range { start: 1, end: -1 }));
        assert_eq!(ranged.value(), Some(json!([1, 2, 3])));
    }

    #[test]
    fn test_node_array_index_segment() {
        let node = Node::new(json!({"items": ["a", "b", "c"]}));
        let kp = Keypath::new("items").push(&Keypath::encode_slice_index(1));
        assert_eq!(node.node_at(&kp, None).value(), Some(json!("b")));
    }
}
