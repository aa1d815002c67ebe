use crate::error::{AppError, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Opaque, versioned description of how a stored body was marshalled.
///
/// Rendered as `<media type>;codec=<id>;v=<version>`, e.g.
/// `application/json;codec=json;v=1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentDescriptor {
    pub media_type: String,
    pub codec: String,
    pub version: u32,
}

impl ContentDescriptor {
    pub fn new(media_type: impl Into<String>, codec: impl Into<String>, version: u32) -> Self {
        Self {
            media_type: media_type.into(),
            codec: codec.into(),
            version,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.split(';').map(str::trim);
        let media_type = parts.next().filter(|m| !m.is_empty())?;
        let mut codec = None;
        let mut version = None;
        for part in parts {
            if let Some(id) = part.strip_prefix("codec=") {
                codec = Some(id);
            } else if let Some(v) = part.strip_prefix("v=") {
                version = v.parse::<u32>().ok();
            }
        }
        Some(Self::new(media_type, codec?, version?))
    }
}

impl fmt::Display for ContentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};codec={};v={}", self.media_type, self.codec, self.version)
    }
}

/// Body decoded back into a form the content-negotiation layer can re-marshal.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayBody {
    Empty,
    Json(serde_json::Value),
    Text(String),
    Bytes(Vec<u8>),
}

/// Serializer capability resolved at replay time.
pub trait ContentCodec: Send + Sync {
    fn id(&self) -> &str;

    fn version(&self) -> u32 {
        1
    }

    fn unmarshal(&self, body: &[u8]) -> Result<ReplayBody>;
}

#[derive(Debug, Default)]
pub struct JsonCodec;

impl ContentCodec for JsonCodec {
    fn id(&self) -> &str {
        "json"
    }

    fn unmarshal(&self, body: &[u8]) -> Result<ReplayBody> {
        serde_json::from_slice(body)
            .map(ReplayBody::Json)
            .map_err(|e| AppError::Unmarshall(format!("invalid JSON body: {}", e)))
    }
}

#[derive(Debug, Default)]
pub struct TextCodec;

impl ContentCodec for TextCodec {
    fn id(&self) -> &str {
        "text"
    }

    fn unmarshal(&self, body: &[u8]) -> Result<ReplayBody> {
        String::from_utf8(body.to_vec())
            .map(ReplayBody::Text)
            .map_err(|e| AppError::Unmarshall(format!("body is not UTF-8: {}", e)))
    }
}

#[derive(Debug, Default)]
pub struct BytesCodec;

impl ContentCodec for BytesCodec {
    fn id(&self) -> &str {
        "bytes"
    }

    fn unmarshal(&self, body: &[u8]) -> Result<ReplayBody> {
        Ok(ReplayBody::Bytes(body.to_vec()))
    }
}

/// Registry mapping `(codec id, version)` to codecs.
#[derive(Clone, Default)]
pub struct ContentRegistry {
    codecs: HashMap<(String, u32), Arc<dyn ContentCodec>>,
}

impl ContentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the JSON, text and raw bytes codecs.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(JsonCodec));
        registry.register(Arc::new(TextCodec));
        registry.register(Arc::new(BytesCodec));
        registry
    }

    pub fn register(&mut self, codec: Arc<dyn ContentCodec>) {
        self.codecs
            .insert((codec.id().to_string(), codec.version()), codec);
    }

    pub fn unregister(&mut self, id: &str, version: u32) -> bool {
        self.codecs.remove(&(id.to_string(), version)).is_some()
    }

    /// Looks up the codec named by a stored descriptor string.
    pub fn resolve(&self, descriptor: &str) -> Option<Arc<dyn ContentCodec>> {
        let descriptor = ContentDescriptor::parse(descriptor)?;
        self.codecs
            .get(&(descriptor.codec, descriptor.version))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.codecs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }
}

impl fmt::Debug for ContentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.codecs.keys().collect();
        ids.sort();
        f.debug_struct("ContentRegistry").field("codecs", &ids).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_parse_and_display() {
        let d = ContentDescriptor::parse("application/json;codec=json;v=1").unwrap();
        assert_eq!(d.media_type, "application/json");
        assert_eq!(d.codec, "json");
        assert_eq!(d.version, 1);
        assert_eq!(d.to_string(), "application/json;codec=json;v=1");
    }

    #[test]
    fn test_descriptor_parse_rejects_incomplete() {
        assert!(ContentDescriptor::parse("").is_none());
        assert!(ContentDescriptor::parse("application/json").is_none());
        assert!(ContentDescriptor::parse("application/json;codec=json").is_none());
        assert!(ContentDescriptor::parse("application/json;codec=json;v=x").is_none());
    }

    #[test]
    fn test_resolve_by_codec_and_version() {
        let registry = ContentRegistry::with_defaults();
        assert_eq!(registry.len(), 3);
        assert!(registry.resolve("application/json;codec=json;v=1").is_some());
        assert!(registry.resolve("application/json;codec=json;v=2").is_none());
        assert!(registry.resolve("application/xml;codec=xml;v=1").is_none());
    }

    #[test]
    fn test_unregistered_codec_no_longer_resolves() {
        let mut registry = ContentRegistry::with_defaults();
        assert!(registry.unregister("text", 1));
        assert!(registry.resolve("text/plain;codec=text;v=1").is_none());
    }

    #[test]
    fn test_codecs_unmarshal() {
        assert_eq!(
            JsonCodec.unmarshal(br#"{"id":1}"#).unwrap(),
            ReplayBody::Json(serde_json::json!({"id": 1}))
        );
        assert!(JsonCodec.unmarshal(b"not json").is_err());
        assert_eq!(TextCodec.unmarshal(b"hi").unwrap(), ReplayBody::Text("hi".to_string()));
        assert!(TextCodec.unmarshal(&[0xff, 0xfe]).is_err());
        assert_eq!(BytesCodec.unmarshal(&[1, 2]).unwrap(), ReplayBody::Bytes(vec![1, 2]));
    }
}
