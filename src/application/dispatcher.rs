use crate::application::assets::ByteProvider;
use crate::application::pages::{self, Page};
use crate::application::routes::RouteTable;
use crate::application::mime;
use crate::domain::request::{Header, Method, Request};
use crate::infrastructure::config::{PagesConfig, ServerConfig, StaticMount};
use crate::infrastructure::server_impl::response::{ResponseWriter, StatusCode};
use crate::AnyResult;
use std::io;
use std::sync::Arc;

/// Cookie holding the credential for browser routes.
pub const TOKEN_COOKIE: &str = "token";

/// Applies the server's routing policy to a parsed request.
///
/// In order: method whitelist (405), exact routes with authorization gating, static
/// mounts for GET, prefix routes, then a 404 shaped after the path's namespace.
#[derive(Debug)]
pub struct Dispatcher {
    routes: RouteTable,
    assets: Arc<dyn ByteProvider>,
    api_prefix: String,
    pages: PagesConfig,
    mounts: Vec<StaticMount>,
}

impl Dispatcher {
    pub fn new(routes: RouteTable, assets: Arc<dyn ByteProvider>, config: &ServerConfig) -> Self {
        Self {
            routes,
            assets,
            api_prefix: config.api_prefix(),
            pages: config.pages.clone(),
            mounts: config.static_mounts.clone(),
        }
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn is_api_path(&self, path: &str) -> bool {
        path.starts_with(&self.api_prefix)
    }

    fn send_page(
        &self,
        writer: &mut ResponseWriter,
        status: StatusCode,
        page: Page,
        placeholders: &[(&str, &str)],
    ) -> AnyResult<()> {
        let template = page.load(&self.pages, self.assets.as_ref());
        writer.send_template(status, mime::HTML, &template, placeholders)?;
        Ok(())
    }

    /// Routes `request` and lets the matched handler answer through `writer`.
    pub fn handle(&self, request: &mut Request, writer: &mut ResponseWriter) -> AnyResult<()> {
        let Some(method) = request.method().cloned() else {
            return Ok(());
        };
        let path = request.path().to_string();

        if !method.is_allowed() {
            writer.send_json_error(
                StatusCode::MethodNotAllowed,
                &format!("Method ({method}) Not Allowed!"),
            )?;
            return Ok(());
        }

        if let Some(route) = self.routes.resolve(&method, &path) {
            if !route.requires_auth() {
                return route.invoke(request, writer);
            }

            if self.is_api_path(&path) {
                match request.known_header(Header::AUTHORIZATION).map(str::to_string) {
                    Some(key) => {
                        request.set_api_key(key);
                        return route.invoke(request, writer);
                    }
                    None => {
                        writer.send_json_error(StatusCode::Unauthorized, "Error 401 UnAuthorized !")?;
                        return Ok(());
                    }
                }
            }

            return match request.cookie(TOKEN_COOKIE).map(str::to_string) {
                Some(token) => {
                    request.set_api_key(token);
                    route.invoke(request, writer)
                }
                None => self.send_page(writer, StatusCode::Unauthorized, Page::Login, &[]),
            };
        }

        if method == Method::Get {
            let mount = self
                .mounts
                .iter()
                .find_map(|mount| path.strip_prefix(&mount.url_prefix).map(|rest| (mount, rest)));
            if let Some((mount, rest)) = mount {
                let id = format!("{}{rest}", mount.asset_dir);
                writer.send_asset(StatusCode::Ok, &mount.content_type, &id)?;
                return Ok(());
            }
        }

        if let Some(route) = self.routes.resolve_prefix(&method, &path) {
            return route.invoke(request, writer);
        }

        if self.is_api_path(&path) {
            writer.send_json_error(StatusCode::NotFound, "Error 404 Not Found !")?;
            Ok(())
        } else {
            self.send_page(
                writer,
                StatusCode::NotFound,
                Page::NotFound,
                &[(pages::PATH_TOKEN, &path)],
            )
        }
    }

    /// Answers a request whose decoding or handler failed.
    ///
    /// A missing asset becomes a 404, anything else a 500 on API paths or the server
    /// error page elsewhere. Nothing is written when the handler already responded.
    pub fn handle_failure(&self, request: &Request, writer: &mut ResponseWriter, error: &eyre::Report) {
        if writer.is_sent() {
            tracing::warn!(
                request_id = %request.id,
                path = request.path(),
                error = %format!("{error:#}"),
                "handler failed after responding"
            );
            return;
        }

        let detail = format!("{error:#}");
        let missing_asset = error
            .chain()
            .filter_map(|cause| cause.downcast_ref::<io::Error>())
            .any(|err| err.kind() == io::ErrorKind::NotFound);

        let sent = if missing_asset {
            writer
                .send_json_error(StatusCode::NotFound, &format!("FileNotFound : {detail}"))
                .map_err(eyre::Report::from)
        } else if self.is_api_path(request.path()) {
            writer
                .send_json_error(
                    StatusCode::InternalServerError,
                    &format!("Internal Server Error : {detail}"),
                )
                .map_err(eyre::Report::from)
        } else {
            self.send_page(
                writer,
                StatusCode::InternalServerError,
                Page::ServerError,
                &[(pages::ERROR_TOKEN, &detail)],
            )
        };

        if let Err(err) = sent {
            tracing::error!(request_id = %request.id, %err, "failed to answer with an error response");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::assets::MemoryAssets;
    use crate::domain::request::{RequestId, RequestLine};
    use crate::domain::route::Route;
    use eyre::eyre;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request(method: &str, path: &str) -> Request {
        let mut request = Request::new(RequestId::from("test"), None);
        request.line = Some(RequestLine {
            method: Method::from(method),
            path: path.to_string(),
            protocol: "HTTP/1.1".to_string(),
        });
        request
    }

    fn assets() -> Arc<dyn ByteProvider> {
        Arc::new(
            MemoryAssets::new()
                .with("img/foo.jpg", vec![0xFFu8, 0xD8, 0xFF])
                .with("sound/beep.mp3", vec![0x49u8, 0x44, 0x33])
                .with("html/404.html", "<h1>missing {path}</h1>"),
        )
    }

    fn dispatcher(routes: Vec<Route>) -> Dispatcher {
        Dispatcher::new(RouteTable::new(routes), assets(), &ServerConfig::default())
    }

    fn dispatch(dispatcher: &Dispatcher, request: &mut Request) -> (u16, String) {
        let mut writer = ResponseWriter::new(assets());
        if let Err(err) = dispatcher.handle(request, &mut writer) {
            dispatcher.handle_failure(request, &mut writer, &err);
        }
        let status = writer.status().unwrap();
        let body = String::from_utf8_lossy(&writer.into_output().unwrap()).into_owned();
        (status, body)
    }

    fn api_key_echo(request: &Request, writer: &mut ResponseWriter) -> AnyResult<()> {
        writer.send_text(StatusCode::Ok, mime::TEXT, request.api_key().unwrap_or("none"))?;
        Ok(())
    }

    #[test]
    fn exact_route_invokes_only_its_handler() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let dispatcher = dispatcher(vec![
            Route::get("/api/v1/ping", move |_, writer| {
                counter.fetch_add(1, Ordering::SeqCst);
                writer.send_json(StatusCode::Ok, r#"{"pong":true}"#)?;
                Ok(())
            }),
            Route::get("/api/v1/", |_, _| Err(eyre!("prefix must not run"))).as_prefix(),
        ]);

        let (status, body) = dispatch(&dispatcher, &mut request("get", "/api/v1/ping"));
        assert_eq!(status, 200);
        assert!(body.ends_with(r#"{"pong":true}"#));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn prefix_route_catches_unregistered_paths() {
        let dispatcher = dispatcher(vec![Route::get("/files/", |request, writer| {
            writer.send_text(StatusCode::Ok, mime::TEXT, request.path())?;
            Ok(())
        })
        .as_prefix()]);

        let (status, body) = dispatch(&dispatcher, &mut request("get", "/files/a/b.txt"));
        assert_eq!(status, 200);
        assert!(body.ends_with("/files/a/b.txt"));
    }

    #[test]
    fn disallowed_methods_get_405_once() {
        let dispatcher = dispatcher(vec![Route::new(Method::Patch, "/api/v1/x", |_, _| {
            Err(eyre!("never dispatched"))
        })]);

        for method in ["patch", "head", "options", "brew"] {
            let (status, body) = dispatch(&dispatcher, &mut request(method, "/api/v1/x"));
            assert_eq!(status, 405);
            assert_eq!(body.matches("HTTP/1.1").count(), 1);
            assert!(body.contains(&format!("Method ({method}) Not Allowed!")));
        }
    }

    #[test]
    fn api_auth_requires_authorization_header() {
        let dispatcher = dispatcher(vec![Route::get("/api/v1/me", api_key_echo).with_auth()]);

        let (status, body) = dispatch(&dispatcher, &mut request("get", "/api/v1/me"));
        assert_eq!(status, 401);
        assert!(body.ends_with(r#"{"status":false,"error":"Error 401 UnAuthorized !"}"#));

        let mut authorized = request("get", "/api/v1/me");
        authorized
            .headers
            .insert("authorization".to_string(), "Bearer k1".to_string());
        let (status, body) = dispatch(&dispatcher, &mut authorized);
        assert_eq!(status, 200);
        assert!(body.ends_with("Bearer k1"));
        assert_eq!(authorized.api_key(), Some("Bearer k1"));
    }

    #[test]
    fn browser_auth_requires_token_cookie() {
        let dispatcher = dispatcher(vec![Route::get("/dashboard", api_key_echo).with_auth()]);

        let (status, body) = dispatch(&dispatcher, &mut request("get", "/dashboard"));
        assert_eq!(status, 401);
        assert!(body.contains("content-type: text/html"));
        assert!(body.contains("Please sign in"));

        let mut with_cookie = request("get", "/dashboard");
        with_cookie
            .cookies
            .insert(TOKEN_COOKIE.to_string(), "t0k3n".to_string());
        let (status, body) = dispatch(&dispatcher, &mut with_cookie);
        assert_eq!(status, 200);
        assert!(body.ends_with("t0k3n"));
    }

    #[test]
    fn static_mounts_serve_assets() {
        let dispatcher = dispatcher(vec![]);

        let (status, body) = dispatch(&dispatcher, &mut request("get", "/images/foo.jpg"));
        assert_eq!(status, 200);
        assert!(body.contains("content-type: image/jpeg\r\n"));

        let (status, body) = dispatch(&dispatcher, &mut request("get", "/sounds/beep.mp3"));
        assert_eq!(status, 200);
        assert!(body.contains("content-type: audio/mpeg\r\n"));

        let (status, body) = dispatch(&dispatcher, &mut request("get", "/images/none.jpg"));
        assert_eq!(status, 404);
        assert!(body.contains(r#""error":"FileNotFound : "#));
    }

    #[test]
    fn static_mounts_only_for_get() {
        let dispatcher = dispatcher(vec![]);
        let (status, body) = dispatch(&dispatcher, &mut request("post", "/images/foo.jpg"));
        assert_eq!(status, 404);
        assert!(body.contains("<h1>missing /images/foo.jpg</h1>"));
    }

    #[test]
    fn not_found_follows_namespace() {
        let dispatcher = dispatcher(vec![]);

        let (status, body) = dispatch(&dispatcher, &mut request("get", "/api/v1/missing"));
        assert_eq!(status, 404);
        assert!(body.ends_with(r#"{"status":false,"error":"Error 404 Not Found !"}"#));

        let (status, body) = dispatch(&dispatcher, &mut request("delete", "/nowhere"));
        assert_eq!(status, 404);
        assert!(body.ends_with("<h1>missing /nowhere</h1>"));
    }

    #[test]
    fn handler_errors_map_by_namespace() {
        let dispatcher = dispatcher(vec![
            Route::post("/api/v1/boom", |_, _| Err(eyre!("kaput"))),
            Route::post("/boom", |_, _| Err(eyre!("kaput"))),
        ]);

        let (status, body) = dispatch(&dispatcher, &mut request("post", "/api/v1/boom"));
        assert_eq!(status, 500);
        assert!(body.ends_with(r#"{"status":false,"error":"Internal Server Error : kaput"}"#));

        let (status, body) = dispatch(&dispatcher, &mut request("post", "/boom"));
        assert_eq!(status, 500);
        assert!(body.contains("content-type: text/html"));
        assert!(body.contains("<p>kaput</p>"));
    }

    #[test]
    fn failure_after_response_keeps_first_response() {
        let dispatcher = dispatcher(vec![Route::get("/api/v1/half", |_, writer| {
            writer.send_json(StatusCode::Ok, "{}")?;
            Err(eyre!("late failure"))
        })]);

        let (status, body) = dispatch(&dispatcher, &mut request("get", "/api/v1/half"));
        assert_eq!(status, 200);
        assert_eq!(body.matches("HTTP/1.1").count(), 1);
    }

    #[test]
    fn api_namespace_uses_configured_version() {
        let config = ServerConfig {
            api_version: 3,
            ..ServerConfig::default()
        };
        let dispatcher = Dispatcher::new(RouteTable::default(), assets(), &config);
        assert!(dispatcher.is_api_path("/api/v3/users"));
        assert!(!dispatcher.is_api_path("/api/v1/users"));
    }
}
