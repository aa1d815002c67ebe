use crate::error::{AppError, Result};
use crate::observability::mask_sensitive;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::net::SocketAddr;

/// Header carrying the client-supplied idempotency key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Proxy header consulted before the peer address to identify the client.
pub const FORWARDED_FOR_HEADER: &str = "X-Forwarded-For";

/// Identity-relevant description of an inbound request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestDescriptor {
    pub namespace: String,
    pub idempotency_key_header: Option<String>,
    pub client_identity: String,
    pub principal_name: Option<String>,
    pub session_id: Option<String>,
    pub method: String,
    pub path: String,
    pub query_string: Option<String>,
    pub body: Vec<u8>,
}

impl RequestDescriptor {
    pub fn new(
        namespace: impl Into<String>,
        method: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key_header = Some(key.into());
        self
    }

    pub fn with_client_identity(mut self, identity: impl Into<String>) -> Self {
        self.client_identity = identity.into();
        self
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal_name = Some(principal.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query_string = Some(query.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Buffers the whole body from `reader`.
    pub fn read_body<R: Read>(mut self, mut reader: R) -> Result<Self> {
        let mut body = Vec::new();
        reader.read_to_end(&mut body)?;
        self.body = body;
        Ok(self)
    }

    /// Builds a descriptor from the head of an `http` request and its buffered body.
    pub fn from_http_parts(
        namespace: impl Into<String>,
        parts: &http::request::Parts,
        peer: Option<SocketAddr>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        let idempotency_key_header = parts
            .headers
            .get(IDEMPOTENCY_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        Self {
            namespace: namespace.into(),
            idempotency_key_header,
            client_identity: client_identity(&parts.headers, peer),
            principal_name: None,
            session_id: None,
            method: parts.method.as_str().to_string(),
            path: parts.uri.path().to_string(),
            query_string: parts.uri.query().map(str::to_string),
            body: body.into(),
        }
    }

    /// Client-supplied key, if present and not blank.
    pub fn idempotency_key(&self) -> Option<&str> {
        self.idempotency_key_header
            .as_deref()
            .filter(|k| !k.trim().is_empty())
    }
}

/// First hop of the forwarding header, else the peer address, else empty.
pub fn client_identity(headers: &http::HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get(FORWARDED_FOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_default()
}

/// Canonical form hashed into the fingerprint. Field order is part of the contract.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CanonicalRequest<'a> {
    namespace: &'a str,
    idempotency_key_header: &'a str,
    remote_addr: &'a str,
    principal_name: &'a str,
    session_id: &'a str,
    method: &'a str,
    #[serde(rename = "requestURI")]
    request_uri: &'a str,
    query_string: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<&'a str>,
}

/// Maps request descriptors to SHA-256 fingerprints.
#[derive(Debug, Clone)]
pub struct Fingerprinter {
    key_header_mandatory: bool,
}

impl Fingerprinter {
    pub fn new(key_header_mandatory: bool) -> Self {
        Self {
            key_header_mandatory,
        }
    }

    pub fn key_header_mandatory(&self) -> bool {
        self.key_header_mandatory
    }

    /// Rejects requests lacking a key when the header is mandatory.
    pub fn check_key_header(&self, request: &RequestDescriptor) -> Result<()> {
        match request.idempotency_key() {
            Some(key) => {
                tracing::trace!(
                    key = %mask_sensitive(key, 2),
                    path = %request.path,
                    "Idempotency key provided"
                );
                Ok(())
            }
            None if self.key_header_mandatory => {
                tracing::trace!(
                    path = %request.path,
                    client = %request.client_identity,
                    "No idempotency key header provided"
                );
                Err(AppError::MissingIdempotencyKey(IDEMPOTENCY_KEY_HEADER.to_string()))
            }
            None => Ok(()),
        }
    }

    /// Computes the lowercase hex SHA-256 fingerprint of `request`.
    pub fn fingerprint(&self, request: &RequestDescriptor) -> Result<String> {
        let mut canonical = CanonicalRequest {
            namespace: &request.namespace,
            idempotency_key_header: request.idempotency_key_header.as_deref().unwrap_or(""),
            remote_addr: &request.client_identity,
            principal_name: request.principal_name.as_deref().unwrap_or(""),
            session_id: request.session_id.as_deref().unwrap_or(""),
            method: &request.method,
            request_uri: &request.path,
            query_string: request.query_string.as_deref().unwrap_or(""),
            body: None,
        };

        // The body is never logged.
        let without_body = serde_json::to_string(&canonical)
            .map_err(|e| AppError::Fingerprint(e.to_string()))?;

        let body_hex = hex::encode(&request.body);
        canonical.body = Some(&body_hex);
        let full = serde_json::to_string(&canonical)
            .map_err(|e| AppError::Fingerprint(e.to_string()))?;

        let mut hasher = Sha256::new();
        hasher.update(full.as_bytes());
        let fingerprint = hex::encode(hasher.finalize());

        tracing::trace!(
            canonical = %without_body,
            body_len = request.body.len(),
            fingerprint = %fingerprint,
            "Computed request fingerprint"
        );

        Ok(fingerprint)
    }
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::new(false)
    }
}
