//! Content types for asset identifiers.

pub const JSON: &str = "application/json";
pub const HTML: &str = "text/html";
pub const TEXT: &str = "text/plain";
pub const JPEG: &str = "image/jpeg";
pub const MPEG: &str = "audio/mpeg";
pub const FORM_DATA: &str = "multipart/form-data";
pub const FORM_URL_ENCODED: &str = "application/x-www-form-urlencoded";

/// Detect the content type from the identifier's extension.
pub fn from_extension(id: &str) -> Option<&'static str> {
    let (_, ext) = id.rsplit_once('.')?;
    let content_type = match ext.to_ascii_lowercase().as_str() {
        "html" | "htm" => HTML,
        "css" => "text/css",
        "js" | "mjs" => "application/javascript",
        "json" => JSON,
        "txt" => TEXT,
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => JPEG,
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "webp" => "image/webp",
        "mp3" => MPEG,
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        _ => return None,
    };
    Some(content_type)
}
