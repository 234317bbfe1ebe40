//! Slash-separated paths into a state tree.

use crate::error::{Error, Result};

/// A path into a state node. Segments are joined with `/`; the empty keypath
/// addresses the node itself.
///
/// Array subscripts in URL paths (`name[3]`) are rewritten during parsing
/// into two segments: `name` followed by the encoded slice index.
#[derive(Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Keypath(String);

impl Keypath {
    pub fn new(s: impl Into<String>) -> Self {
        Keypath(s.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The path segments, in order. Empty segments never occur.
    pub fn parts(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|p| !p.is_empty())
    }

    /// The final segment, if any.
    pub fn last_part(&self) -> Option<&str> {
        self.parts().last()
    }

    /// A new keypath with `segment` appended.
    pub fn push(&self, segment: &str) -> Keypath {
        if self.0.is_empty() {
            Keypath(segment.to_string())
        } else {
            Keypath(format!("{}/{}", self.0, segment))
        }
    }

    /// Encode an array index as a keypath segment: 16-digit zero-padded hex,
    /// so lexicographic segment order matches numeric order.
    pub fn encode_slice_index(index: u64) -> String {
        format!("{index:016x}")
    }

    /// Decode a segment produced by [`Keypath::encode_slice_index`].
    pub fn decode_slice_index(segment: &str) -> Option<u64> {
        if segment.len() != 16 {
            return None;
        }
        u64::from_str_radix(segment, 16).ok()
    }

    /// Build a keypath from a URL path. Empty segments are dropped and each
    /// `name[N]` segment is rewritten into `name` plus an encoded index.
    pub fn from_url_path(path: &str) -> Result<Keypath> {
        let mut segments = Vec::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            match part.find('[') {
                Some(idx) if part.ends_with(']') => {
                    let index: u64 = part[idx + 1..part.len() - 1]
                        .parse()
                        .map_err(|_| Error::BadRequest("bad slice index".into()))?;
                    if idx > 0 {
                        segments.push(part[..idx].to_string());
                    }
                    segments.push(Self::encode_slice_index(index));
                }
                _ => segments.push(part.to_string()),
            }
        }
        Ok(Keypath(segments.join("/")))
    }
}

impl std::fmt::Display for Keypath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for Keypath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Keypath({})", self.0)
    }
}

impl From<&str> for Keypath {
    fn from(s: &str) -> Self {
        Keypath::new(s)
    }
}
