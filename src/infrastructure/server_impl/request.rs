use crate::application::mime;
use crate::domain::errors::RequestError;
use crate::domain::request::{Header, Method, Payload, Request, RequestLine};
use ahash::AHashMap;
use httparse::{ParserConfig, Status};
use memchr::memmem;
use regex_lite::Regex;
use std::borrow::Cow;
use std::iter::once;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

const MAX_HEADERS: usize = 64;
const READ_CHUNK: usize = 2048;

static FIELD_NAME: OnceLock<Regex> = OnceLock::new();

fn field_name_regex() -> &'static Regex {
    FIELD_NAME.get_or_init(|| Regex::new(r#"(?i)(?:^|[;\s])name="([^"]*)""#).unwrap())
}

/// Limits applied while a request is received.
#[derive(Debug, Clone, Copy)]
pub struct ReadLimits {
    pub max_head_bytes: usize,
    pub max_body_bytes: usize,
    pub idle_timeout: Option<Duration>,
}

impl Default for ReadLimits {
    fn default() -> Self {
        Self {
            max_head_bytes: 64 * 1024,
            max_body_bytes: 8 * 1024 * 1024,
            idle_timeout: None,
        }
    }
}

/// Request line and headers, plus the number of bytes they took.
#[derive(Debug)]
pub struct RequestHead {
    pub line: RequestLine,
    pub headers: AHashMap<String, String>,
    pub query: AHashMap<String, String>,
    pub len: usize,
}

#[derive(Debug)]
pub enum HeadStatus {
    Complete(RequestHead),
    Partial,
    Invalid(String),
}

/// A received request whose body has not been decoded yet.
#[derive(Debug)]
pub struct Incoming {
    pub request: Request,
    pub body: Vec<u8>,
}

/// Parses the request line and headers out of `buf`.
///
/// Method and path are lower-cased, header keys are lower-cased and values trimmed.
/// A multipart `content-type` is reduced to its media type, with the boundary moved to
/// its own `boundary` entry.
pub fn parse_head(buf: &[u8]) -> HeadStatus {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let len = match ParserConfig::default().parse_request(&mut req, buf) {
        Ok(Status::Complete(len)) => len,
        Ok(Status::Partial) => return HeadStatus::Partial,
        Err(err) => return HeadStatus::Invalid(err.to_string()),
    };

    let (Some(method), Some(target), Some(version)) = (req.method, req.path, req.version) else {
        return HeadStatus::Invalid("incomplete request line".to_string());
    };

    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path, parse_url_encoded(query)),
        None => (target, AHashMap::new()),
    };

    let mut header_map = req
        .headers
        .iter()
        .map(|h| {
            (
                h.name.trim().to_ascii_lowercase(),
                String::from_utf8_lossy(h.value).trim().to_string(),
            )
        })
        .collect::<AHashMap<_, _>>();
    split_multipart_boundary(&mut header_map);

    HeadStatus::Complete(RequestHead {
        line: RequestLine {
            method: Method::from(method),
            path: path.to_lowercase(),
            protocol: format!("HTTP/1.{version}"),
        },
        headers: header_map,
        query,
        len,
    })
}

fn split_multipart_boundary(headers: &mut AHashMap<String, String>) {
    let content_type_key = Header::CONTENT_TYPE.as_str();
    let Some(content_type) = headers.get(content_type_key).cloned() else {
        return;
    };
    if !content_type.to_ascii_lowercase().contains(mime::FORM_DATA) {
        return;
    }

    let mut params = content_type.split(';');
    let media = params.next().unwrap_or_default().trim().to_string();
    let boundary = params
        .map(str::trim)
        .find_map(|param| param.strip_prefix("boundary="))
        .map(|boundary| boundary.trim_matches('"').to_string());

    headers.insert(content_type_key.to_string(), media);
    if let Some(boundary) = boundary {
        headers.insert(Header::BOUNDARY.as_str().to_string(), boundary);
    }
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => spaced,
    }
}

/// `a=1&b=2` into a map. Pairs without exactly one `=`, or with an empty key, are dropped.
pub fn parse_url_encoded(raw: &str) -> AHashMap<String, String> {
    raw.split('&')
        .filter_map(|pair| {
            let mut parts = pair.split('=');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(key), Some(value), None) if !key.is_empty() => {
                    Some((decode_component(key), decode_component(value)))
                }
                _ => None,
            }
        })
        .collect()
}

pub fn parse_cookies(raw: Option<&str>) -> AHashMap<String, String> {
    raw.unwrap_or_default()
        .split(';')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let key = key.trim();
            (!key.is_empty()).then(|| (key.to_string(), value.trim().trim_matches('"').to_string()))
        })
        .collect()
}

fn strip_line_break_prefix(bytes: &[u8]) -> &[u8] {
    bytes
        .strip_prefix(b"\r\n")
        .or_else(|| bytes.strip_prefix(b"\n"))
        .unwrap_or(bytes)
}

fn strip_line_break_suffix(bytes: &[u8]) -> &[u8] {
    bytes
        .strip_suffix(b"\r\n")
        .or_else(|| bytes.strip_suffix(b"\n"))
        .unwrap_or(bytes)
}

/// One multipart section into `(field name, value)`. File parts are skipped.
fn parse_form_part(part: &[u8]) -> Option<(String, String)> {
    let part = strip_line_break_prefix(part);
    let (head, value) = match memmem::find(part, b"\r\n\r\n") {
        Some(idx) => (&part[..idx], &part[idx + 4..]),
        None => {
            let idx = memmem::find(part, b"\n\n")?;
            (&part[..idx], &part[idx + 2..])
        }
    };

    let head = String::from_utf8_lossy(head);
    let disposition = head.lines().find(|line| {
        line.split_once(':')
            .is_some_and(|(key, _)| unicase::eq(key.trim(), "content-disposition"))
    })?;
    if disposition.to_ascii_lowercase().contains("filename=") {
        tracing::debug!("skipping multipart file part");
        return None;
    }

    let name = field_name_regex().captures(disposition)?.get(1)?.as_str();
    // value tokens are joined with no separator, stray `--` tokens dropped
    let value = String::from_utf8_lossy(strip_line_break_suffix(value))
        .split_whitespace()
        .filter(|token| *token != "--")
        .collect::<String>();
    Some((name.to_string(), value))
}

/// Splits `body` on `--<boundary>` and collects the named fields.
pub fn parse_multipart(body: &[u8], boundary: &str) -> Payload {
    let delimiter = format!("--{boundary}");
    let positions: Vec<usize> = memmem::find_iter(body, delimiter.as_bytes()).collect();
    if positions.is_empty() {
        return Payload::Empty;
    }

    let ends = positions.iter().skip(1).copied().chain(once(body.len()));
    let mut fields = AHashMap::new();
    for (start, end) in positions.iter().copied().zip(ends) {
        let part = &body[start + delimiter.len()..end];
        if part.starts_with(b"--") {
            break;
        }
        if let Some((name, value)) = parse_form_part(part) {
            fields.insert(name, value);
        }
    }
    Payload::Form(fields)
}

/// Decodes the body according to the request's `content-type`.
///
/// Only malformed JSON is an error; every other problem degrades to missing fields.
pub fn decode_payload(
    headers: &AHashMap<String, String>,
    body: &[u8],
) -> Result<Payload, RequestError> {
    let Some(content_type) = headers.get(Header::CONTENT_TYPE.as_str()) else {
        return Ok(Payload::Empty);
    };
    let media = content_type.split(';').next().unwrap_or_default().trim();

    let payload = if unicase::eq(media, mime::TEXT) {
        Payload::Text(String::from_utf8_lossy(body).into_owned())
    } else if unicase::eq(media, mime::JSON) {
        if body.iter().all(u8::is_ascii_whitespace) {
            Payload::Empty
        } else {
            Payload::Json(serde_json::from_slice(body)?)
        }
    } else if unicase::eq(media, mime::FORM_URL_ENCODED) {
        let raw: Cow<'_, str> = String::from_utf8_lossy(body);
        Payload::Form(parse_url_encoded(raw.trim()))
    } else if unicase::eq(media, mime::FORM_DATA) {
        match headers.get(Header::BOUNDARY.as_str()) {
            Some(boundary) => parse_multipart(body, boundary),
            None => Payload::Empty,
        }
    } else {
        Payload::Empty
    };
    Ok(payload)
}

async fn read_chunk<R>(
    stream: &mut R,
    buf: &mut Vec<u8>,
    limits: &ReadLimits,
) -> Result<usize, RequestError>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK];
    let read = match limits.idle_timeout {
        Some(timeout) => tokio::time::timeout(timeout, stream.read(&mut chunk))
            .await
            .map_err(|_| RequestError::IdleTimeout(timeout))??,
        None => stream.read(&mut chunk).await?,
    };
    buf.extend_from_slice(&chunk[..read]);
    Ok(read)
}

/// Appends whatever `stream` can hand over without waiting. Stops on end of stream,
/// on the first read that would block, or once `buf` holds more than `cap` bytes.
async fn drain_ready<R>(stream: &mut R, buf: &mut Vec<u8>, cap: usize) -> Result<(), RequestError>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK];
    while buf.len() <= cap {
        match tokio::time::timeout(Duration::ZERO, stream.read(&mut chunk)).await {
            Ok(read) => {
                let read = read?;
                if read == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..read]);
            }
            Err(_) => break,
        }
    }
    Ok(())
}

/// Reads one request off `stream` into `request`.
///
/// A stream that closes before a full head arrived, or sends a malformed one, yields the
/// request untouched (incomplete). When `content-length` is present the body is read up
/// to that length, otherwise every byte already available on the stream is taken. A body
/// over `max_body_bytes` also leaves the request incomplete.
pub async fn read_request<R>(
    stream: &mut R,
    mut request: Request,
    limits: &ReadLimits,
) -> Result<Incoming, RequestError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(READ_CHUNK);
    let head = loop {
        if read_chunk(stream, &mut buf, limits).await? == 0 {
            if !buf.is_empty() {
                tracing::debug!(request_id = %request.id, "connection closed mid request");
            }
            return Ok(Incoming {
                request,
                body: Vec::new(),
            });
        }

        match parse_head(&buf) {
            HeadStatus::Complete(head) => break head,
            HeadStatus::Partial if buf.len() <= limits.max_head_bytes => continue,
            HeadStatus::Partial => {
                tracing::warn!(request_id = %request.id, bytes = buf.len(), "request head too large");
                return Ok(Incoming {
                    request,
                    body: Vec::new(),
                });
            }
            HeadStatus::Invalid(reason) => {
                tracing::debug!(request_id = %request.id, %reason, "malformed request head");
                return Ok(Incoming {
                    request,
                    body: Vec::new(),
                });
            }
        }
    };

    let mut body = buf.split_off(head.len);
    let content_length = head
        .headers
        .get(Header::CONTENT_LENGTH.as_str())
        .and_then(|value| value.parse::<usize>().ok());
    match content_length {
        Some(expected) if expected > limits.max_body_bytes => {
            tracing::warn!(request_id = %request.id, expected, "declared body too large");
            return Ok(Incoming {
                request,
                body: Vec::new(),
            });
        }
        Some(expected) => {
            while body.len() < expected {
                if read_chunk(stream, &mut body, limits).await? == 0 {
                    break;
                }
            }
            body.truncate(expected);
        }
        None => {
            drain_ready(stream, &mut body, limits.max_body_bytes).await?;
            if body.len() > limits.max_body_bytes {
                tracing::warn!(request_id = %request.id, bytes = body.len(), "request body too large");
                return Ok(Incoming {
                    request,
                    body: Vec::new(),
                });
            }
        }
    }

    request.cookies = parse_cookies(
        head.headers
            .get(Header::COOKIE.as_str())
            .map(String::as_str),
    );
    request.line = Some(head.line);
    request.headers = head.headers;
    request.query = head.query;

    Ok(Incoming { request, body })
}
