use ahash::AHashMap;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use compact_str::{CompactString, ToCompactString};
use derive_more::{Deref, Display};
use std::net::SocketAddr;
use strum::IntoStaticStr;

/// Identifies one accepted connection for its whole lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deref, Display)]
pub struct RequestId(CompactString);

impl RequestId {
    /// Base64 encoded SHA-1 digest of a random UUID.
    pub fn generate() -> Self {
        let seed = uuid::Uuid::new_v4().to_string();
        let digest = sha1_smol::Sha1::from(seed.as_bytes()).digest().bytes();
        Self(STANDARD.encode(digest).to_compact_string())
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_compact_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    Connect,
    Delete,
    Get,
    Head,
    Options,
    Patch,
    Post,
    Put,
    Trace,
    Other(CompactString),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Method::Connect => "connect",
            Method::Delete => "delete",
            Method::Get => "get",
            Method::Head => "head",
            Method::Options => "options",
            Method::Patch => "patch",
            Method::Post => "post",
            Method::Put => "put",
            Method::Trace => "trace",
            Method::Other(token) => token.as_str(),
        }
    }

    /// Only these methods are ever dispatched to routes.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Method::Get | Method::Post | Method::Put | Method::Delete)
    }
}

impl From<&str> for Method {
    fn from(value: &str) -> Self {
        let lowered = value.to_ascii_lowercase();
        match lowered.as_str() {
            "connect" => Method::Connect,
            "delete" => Method::Delete,
            "get" => Method::Get,
            "head" => Method::Head,
            "options" => Method::Options,
            "patch" => Method::Patch,
            "post" => Method::Post,
            "put" => Method::Put,
            "trace" => Method::Trace,
            _ => Method::Other(lowered.to_compact_string()),
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Header names the server itself looks at. Keys are stored lower-cased.
#[allow(clippy::upper_case_acronyms, non_camel_case_types)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, IntoStaticStr)]
#[non_exhaustive]
pub enum Header {
    #[strum(serialize = "authorization")]
    AUTHORIZATION,
    /// Synthetic entry holding the multipart boundary split off `content-type`.
    #[strum(serialize = "boundary")]
    BOUNDARY,
    #[strum(serialize = "content-length")]
    CONTENT_LENGTH,
    #[strum(serialize = "content-type")]
    CONTENT_TYPE,
    #[strum(serialize = "cookie")]
    COOKIE,
    #[strum(serialize = "sec-websocket-key")]
    SEC_WEBSOCKET_KEY,
}

impl Header {
    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

/// Decoded body. The variant is chosen by the `content-type` header alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Payload {
    #[default]
    Empty,
    Text(String),
    Json(serde_json::Value),
    Form(AHashMap<String, String>),
}

impl Payload {
    pub fn is_empty(&self) -> bool {
        matches!(self, Payload::Empty)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_form(&self) -> Option<&AHashMap<String, String>> {
        match self {
            Payload::Form(fields) => Some(fields),
            _ => None,
        }
    }
}

/// The three tokens of the first line; present together or not at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: Method,
    pub path: String,
    pub protocol: String,
}

#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub peer: Option<SocketAddr>,
    pub line: Option<RequestLine>,
    pub headers: AHashMap<String, String>,
    pub query: AHashMap<String, String>,
    pub cookies: AHashMap<String, String>,
    pub payload: Payload,
    api_key: Option<String>,
}

impl Request {
    pub fn new(id: RequestId, peer: Option<SocketAddr>) -> Self {
        Self {
            id,
            peer,
            line: None,
            headers: AHashMap::new(),
            query: AHashMap::new(),
            cookies: AHashMap::new(),
            payload: Payload::Empty,
            api_key: None,
        }
    }

    /// An incomplete request never saw a request line and must not be dispatched.
    pub fn is_complete(&self) -> bool {
        self.line.is_some()
    }

    pub fn method(&self) -> Option<&Method> {
        self.line.as_ref().map(|line| &line.method)
    }

    pub fn path(&self) -> &str {
        self.line.as_ref().map(|line| line.path.as_str()).unwrap_or("")
    }

    pub fn protocol(&self) -> Option<&str> {
        self.line.as_ref().map(|line| line.protocol.as_str())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name.to_ascii_lowercase().as_str())
            .map(String::as_str)
    }

    pub fn known_header(&self, header: Header) -> Option<&str> {
        self.headers.get(header.as_str()).map(String::as_str)
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    /// Credential attached by the dispatcher once authorization passed.
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    pub(crate) fn set_api_key(&mut self, key: impl Into<String>) {
        self.api_key = Some(key.into());
    }
}
