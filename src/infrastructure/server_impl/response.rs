use crate::application::assets::ByteProvider;
use crate::application::{mime, pages};
use crate::domain::errors::ResponseError;
use crate::domain::request::{Header, Request};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::Serialize;
use std::fmt::Write;
use std::sync::Arc;
use strum::{EnumMessage, FromRepr};
use time::macros::format_description;
use time::OffsetDateTime;

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

#[repr(u16)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, EnumMessage, FromRepr)]
pub enum StatusCode {
    #[strum(message = "Switching Protocols")]
    SwitchingProtocols = 101,
    #[strum(message = "OK")]
    Ok = 200,
    #[strum(message = "Bad Request")]
    BadRequest = 400,
    #[strum(message = "Unauthorized")]
    Unauthorized = 401,
    #[strum(message = "Forbidden")]
    Forbidden = 403,
    #[strum(message = "Not Found")]
    NotFound = 404,
    #[strum(message = "Method Not Allowed")]
    MethodNotAllowed = 405,
    #[strum(message = "Internal Server Error")]
    InternalServerError = 500,
}

impl StatusCode {
    pub const fn code(self) -> u16 {
        self as u16
    }
}

impl From<StatusCode> for u16 {
    fn from(value: StatusCode) -> Self {
        value.code()
    }
}

pub fn reason_phrase(code: u16) -> &'static str {
    StatusCode::from_repr(code)
        .and_then(|status| status.get_message())
        .unwrap_or("Unknown")
}

/// `Sec-WebSocket-Accept` value for a client key (RFC 6455).
pub fn websocket_accept_key(client_key: &str) -> String {
    let mut hasher = sha1_smol::Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.digest().bytes())
}

fn http_date() -> String {
    let format = format_description!(
        "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
    );
    OffsetDateTime::now_utc()
        .format(format)
        .unwrap_or_else(|_| "Thu, 01 Jan 1970 00:00:00 GMT".to_string())
}

#[derive(Debug, Serialize)]
struct JsonError<'a> {
    status: bool,
    error: &'a str,
}

/// A fully described response, turned into wire bytes by [`Response::into_http`].
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub content_type: Option<String>,
    pub body: Option<Bytes>,
}

impl Response {
    pub fn new(status: impl Into<u16>) -> Self {
        Self {
            status: status.into(),
            headers: Vec::new(),
            content_type: None,
            body: None,
        }
    }

    pub fn with_body(
        status: impl Into<u16>,
        content_type: &str,
        body: impl Into<Bytes>,
    ) -> Self {
        let mut response = Self::new(status);
        response.content_type = Some(content_type.to_string());
        response.body = Some(body.into());
        response
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Status line, `Date`, custom headers, `content-type`, `content-length`, blank line, body.
    pub fn into_http(self) -> Bytes {
        let status = self.status;
        let reason = reason_phrase(status);
        let body_len = self.body.as_ref().map_or(0, Bytes::len);
        let mut head = String::with_capacity(128);

        // writing into a String cannot fail
        let _ = write!(head, "HTTP/1.1 {status} {reason}\r\nDate: {}\r\n", http_date());
        for (key, value) in &self.headers {
            let _ = write!(head, "{key}: {value}\r\n");
        }
        if let Some(content_type) = &self.content_type {
            let _ = write!(head, "{}: {content_type}\r\n", Header::CONTENT_TYPE.as_str());
        }
        if self.body.is_some() {
            let _ = write!(head, "{}: {body_len}\r\n", Header::CONTENT_LENGTH.as_str());
        }
        head.push_str("\r\n");

        let mut buf = Vec::with_capacity(head.len() + body_len);
        buf.extend_from_slice(head.as_bytes());
        if let Some(body) = self.body {
            buf.extend_from_slice(&body);
        }
        buf.into()
    }
}

/// Single-shot response sink for one connection.
///
/// The first `send_*` call serializes the whole response and seals the writer; every
/// later call fails with [`ResponseError::AlreadySent`] and writes nothing. The worker
/// owning the connection flushes the sealed bytes and closes the socket.
#[derive(Debug)]
pub struct ResponseWriter {
    assets: Arc<dyn ByteProvider>,
    status: Option<u16>,
    output: Option<Bytes>,
}

impl ResponseWriter {
    pub fn new(assets: Arc<dyn ByteProvider>) -> Self {
        Self {
            assets,
            status: None,
            output: None,
        }
    }

    pub fn assets(&self) -> &dyn ByteProvider {
        self.assets.as_ref()
    }

    pub fn is_sent(&self) -> bool {
        self.output.is_some()
    }

    /// Status code of the sent response, if any.
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// Consumes the writer, yielding the wire bytes of the sent response.
    pub fn into_output(self) -> Option<Bytes> {
        self.output
    }

    pub fn send(&mut self, response: Response) -> Result<(), ResponseError> {
        if self.is_sent() {
            return Err(ResponseError::AlreadySent);
        }
        self.status = Some(response.status);
        self.output = Some(response.into_http());
        Ok(())
    }

    pub fn send_json(
        &mut self,
        status: impl Into<u16>,
        json: impl Into<String>,
    ) -> Result<(), ResponseError> {
        let json: String = json.into();
        self.send(Response::with_body(status, mime::JSON, json))
    }

    pub fn send_json_with_headers(
        &mut self,
        status: impl Into<u16>,
        json: impl Into<String>,
        headers: &[(&str, &str)],
    ) -> Result<(), ResponseError> {
        let json: String = json.into();
        let response = headers.iter().fold(
            Response::with_body(status, mime::JSON, json),
            |response, (key, value)| response.header(*key, *value),
        );
        self.send(response)
    }

    /// Serializes `body` as the JSON response.
    pub fn send_serialized<T>(&mut self, status: impl Into<u16>, body: &T) -> Result<(), ResponseError>
    where
        T: Serialize,
    {
        let json =
            simd_json::to_string(body).map_err(|err| ResponseError::Serialize(err.to_string()))?;
        self.send_json(status, json)
    }

    /// `{"status":false,"error":"..."}`
    pub fn send_json_error(
        &mut self,
        status: impl Into<u16>,
        error: &str,
    ) -> Result<(), ResponseError> {
        self.send_serialized(status, &JsonError { status: false, error })
    }

    pub fn send_text(
        &mut self,
        status: impl Into<u16>,
        content_type: &str,
        text: impl Into<String>,
    ) -> Result<(), ResponseError> {
        let text: String = text.into();
        self.send(Response::with_body(status, content_type, text))
    }

    /// Renders `{token}` placeholders into `template` before sending it.
    pub fn send_template(
        &mut self,
        status: impl Into<u16>,
        content_type: &str,
        template: &str,
        placeholders: &[(&str, &str)],
    ) -> Result<(), ResponseError> {
        self.send_text(status, content_type, pages::render(template, placeholders))
    }

    pub fn send_bytes(
        &mut self,
        status: impl Into<u16>,
        content_type: &str,
        bytes: impl Into<Bytes>,
    ) -> Result<(), ResponseError> {
        self.send(Response::with_body(status, content_type, bytes))
    }

    fn load(&self, id: &str, as_text: bool) -> Result<Vec<u8>, ResponseError> {
        self.assets
            .load_bytes(id, as_text)
            .map_err(|source| ResponseError::Asset {
                id: id.to_string(),
                source,
            })
    }

    /// Sends an asset. The content type comes from the extension when known.
    pub fn send_asset(
        &mut self,
        status: impl Into<u16>,
        content_type: &str,
        id: &str,
    ) -> Result<(), ResponseError> {
        if self.is_sent() {
            return Err(ResponseError::AlreadySent);
        }
        let bytes = self.load(id, false)?;
        let content_type = mime::from_extension(id).unwrap_or(content_type);
        self.send_bytes(status, content_type, bytes)
    }

    /// Sends a text asset after placeholder substitution.
    pub fn send_asset_with_placeholders(
        &mut self,
        status: impl Into<u16>,
        content_type: &str,
        id: &str,
        placeholders: &[(&str, &str)],
    ) -> Result<(), ResponseError> {
        if self.is_sent() {
            return Err(ResponseError::AlreadySent);
        }
        let bytes = self.load(id, true)?;
        self.send_template(
            status,
            content_type,
            &String::from_utf8_lossy(&bytes),
            placeholders,
        )
    }

    pub fn send_html_page(
        &mut self,
        status: impl Into<u16>,
        id: &str,
        placeholders: &[(&str, &str)],
    ) -> Result<(), ResponseError> {
        self.send_asset_with_placeholders(status, mime::HTML, id, placeholders)
    }

    /// Answers a WebSocket upgrade request. Frames are not handled past the handshake.
    pub fn send_websocket_handshake(&mut self, request: &Request) -> Result<(), ResponseError> {
        let key = request.known_header(Header::SEC_WEBSOCKET_KEY).unwrap_or_default();
        let response = Response::new(StatusCode::SwitchingProtocols)
            .header("Upgrade", "websocket")
            .header("Connection", "Upgrade")
            .header("Access-Control-Allow-Origin", "*")
            .header("Sec-WebSocket-Accept", websocket_accept_key(key));
        self.send(response)
    }
}
