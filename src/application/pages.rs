//! HTML pages served by the dispatcher itself: login, not found and server error.

use crate::application::assets::ByteProvider;
use crate::infrastructure::config::PagesConfig;
use std::borrow::Cow;

/// Placeholder replaced with the requested path on the not found page.
pub const PATH_TOKEN: &str = "path";
/// Placeholder replaced with the error detail on the server error page.
pub const ERROR_TOKEN: &str = "error";

const LOGIN: &str = "<!DOCTYPE html>\n<html><head><title>Login</title></head>\
<body><h1>401 Unauthorized</h1><p>Please sign in to continue.</p></body></html>\n";
const NOT_FOUND: &str = "<!DOCTYPE html>\n<html><head><title>Not Found</title></head>\
<body><h1>404 Not Found</h1><p>The page {path} does not exist.</p></body></html>\n";
const SERVER_ERROR: &str = "<!DOCTYPE html>\n<html><head><title>Server Error</title></head>\
<body><h1>500 Internal Server Error</h1><p>{error}</p></body></html>\n";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Page {
    Login,
    NotFound,
    ServerError,
}

impl Page {
    fn builtin(self) -> &'static str {
        match self {
            Page::Login => LOGIN,
            Page::NotFound => NOT_FOUND,
            Page::ServerError => SERVER_ERROR,
        }
    }

    fn asset_id(self, config: &PagesConfig) -> &str {
        match self {
            Page::Login => &config.login,
            Page::NotFound => &config.not_found,
            Page::ServerError => &config.server_error,
        }
    }

    /// Loads the page template from the assets, falling back to the built-in one.
    pub fn load(self, config: &PagesConfig, assets: &dyn ByteProvider) -> Cow<'static, str> {
        let id = self.asset_id(config);
        match assets.load_bytes(id, true) {
            Ok(bytes) => Cow::Owned(String::from_utf8_lossy(&bytes).into_owned()),
            Err(err) => {
                tracing::debug!(page = id, %err, "using built-in page");
                Cow::Borrowed(self.builtin())
            }
        }
    }
}

/// Replaces every `{token}` found in `placeholders`. Unknown tokens stay as they are and
/// substituted values are never scanned again.
pub fn render(template: &str, placeholders: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let value = after.find('}').and_then(|close| {
            let token = &after[..close];
            placeholders
                .iter()
                .find(|(key, _)| *key == token)
                .map(|(_, value)| (*value, close))
        });

        match value {
            Some((value, close)) => {
                out.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}
