use embedserve::application::mime;
use embedserve::infrastructure::logging;
use embedserve::{AnyResult, AssetDir, Payload, Request, ResponseWriter, Route, Server, ServerConfig, StatusCode};
use listenfd::ListenFd;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Debug, Serialize)]
struct Status<'a> {
    status: bool,
    request_id: &'a str,
}

fn status_route(req: &Request, writer: &mut ResponseWriter) -> AnyResult<()> {
    writer.send_serialized(
        StatusCode::Ok,
        &Status {
            status: true,
            request_id: &req.id,
        },
    )?;
    Ok(())
}

fn echo_route(req: &Request, writer: &mut ResponseWriter) -> AnyResult<()> {
    let body = match &req.payload {
        Payload::Json(value) => value.clone(),
        Payload::Form(fields) => fields
            .iter()
            .map(|(key, value)| (key.clone(), serde_json::Value::String(value.clone())))
            .collect::<serde_json::Map<_, _>>()
            .into(),
        Payload::Text(text) => serde_json::Value::String(text.clone()),
        Payload::Empty => serde_json::Value::Null,
    };
    writer.send_serialized(StatusCode::Ok, &serde_json::json!({ "status": true, "echo": body }))?;
    Ok(())
}

fn home_route(req: &Request, writer: &mut ResponseWriter) -> AnyResult<()> {
    let peer = req.peer.map(|peer| peer.to_string()).unwrap_or_default();
    writer.send_template(
        StatusCode::Ok,
        mime::HTML,
        "<!DOCTYPE html>\n<html><body><h1>embedserve</h1><p>Hello {peer}</p></body></html>\n",
        &[("peer", &peer)],
    )?;
    Ok(())
}

fn socket_route(req: &Request, writer: &mut ResponseWriter) -> AnyResult<()> {
    writer.send_websocket_handshake(req)?;
    Ok(())
}

fn docs_route(req: &Request, writer: &mut ResponseWriter) -> AnyResult<()> {
    let id = req.path().trim_start_matches('/');
    writer.send_asset(StatusCode::Ok, mime::TEXT, id)?;
    Ok(())
}

fn routes() -> Vec<Route> {
    vec![
        Route::get("/", home_route).describe("landing page"),
        Route::get("/api/v1/status", status_route).describe("liveness probe"),
        Route::post("/api/v1/echo", echo_route)
            .with_auth()
            .describe("echoes the decoded payload"),
        Route::get("/ws", socket_route).describe("websocket handshake"),
        Route::get("/docs/", docs_route)
            .as_prefix()
            .describe("files under the docs asset folder"),
    ]
}

fn load_config() -> AnyResult<ServerConfig> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("EMBEDSERVE_CONFIG").ok())
        .map(PathBuf::from);

    match path {
        Some(path) => Ok(ServerConfig::load(&path)?),
        None => Ok(ServerConfig::default()),
    }
}

#[tokio::main]
async fn main() -> AnyResult<()> {
    logging::init(logging::DEFAULT_DIRECTIVE)?;
    run().await
}

async fn run() -> AnyResult<()> {
    let config = load_config()?;
    let assets = Arc::new(AssetDir::new(config.asset_root.clone()));

    let server = match ListenFd::from_env().take_tcp_listener(0)? {
        Some(listener) => Server::from_std(listener, &config, routes(), assets)?,
        None => Server::bind(&config, routes(), assets).await?,
    };

    let (handle, accept_loop) = server.spawn();
    tokio::signal::ctrl_c().await?;
    handle.stop();
    accept_loop.await?
}
