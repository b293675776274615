use embedserve::{
    AnyResult, MemoryAssets, Payload, Request, ResponseWriter, Route, Server, ServerConfig,
    ServerHandle, StatusCode,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0];

fn echo(req: &Request, writer: &mut ResponseWriter) -> AnyResult<()> {
    let name = match &req.payload {
        Payload::Form(fields) => fields.get("name").cloned().unwrap_or_default(),
        _ => String::new(),
    };
    writer.send_text(StatusCode::Ok, "text/plain", format!("hello {name}"))?;
    Ok(())
}

fn private(req: &Request, writer: &mut ResponseWriter) -> AnyResult<()> {
    let key = req.api_key().unwrap_or_default().to_string();
    writer.send_text(StatusCode::Ok, "text/plain", key)?;
    Ok(())
}

async fn start() -> (ServerHandle, JoinHandle<AnyResult<()>>) {
    start_with_idle_timeout(5_000).await
}

async fn start_with_idle_timeout(idle_timeout_ms: u64) -> (ServerHandle, JoinHandle<AnyResult<()>>) {
    let config = ServerConfig {
        bind_address: "127.0.0.1:0".to_string(),
        idle_timeout_ms: Some(idle_timeout_ms),
        ..ServerConfig::default()
    };
    let assets = Arc::new(MemoryAssets::new().with("img/foo.jpg", JPEG.to_vec()));
    let routes = vec![
        Route::post("/echo", echo),
        Route::post("/api/v1/echo", echo),
        Route::get("/api/v1/private", private).with_auth(),
        Route::get("/account", private).with_auth(),
    ];

    let server = Server::bind(&config, routes, assets)
        .await
        .expect("server should bind");
    server.spawn()
}

struct Reply {
    status: u16,
    head: String,
    body: Vec<u8>,
}

async fn roundtrip(handle: &ServerHandle, raw: &[u8]) -> Reply {
    let mut stream = TcpStream::connect(handle.local_addr()).await.unwrap();
    stream.write_all(raw).await.unwrap();

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();

    let split = buf
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .expect("response should carry a full head");
    let head = String::from_utf8(buf[..split].to_vec()).unwrap();
    let status = head
        .split(' ')
        .nth(1)
        .and_then(|code| code.parse().ok())
        .expect("status line should carry a code");

    Reply {
        status,
        head,
        body: buf[split + 4..].to_vec(),
    }
}

#[tokio::test]
async fn static_mount_serves_asset_bytes() {
    let (handle, accept_loop) = start().await;

    let reply = roundtrip(&handle, b"GET /images/foo.jpg HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert_eq!(reply.status, 200);
    assert!(reply.head.contains("content-type: image/jpeg"));
    assert!(reply.head.contains("content-length: 4"));
    assert_eq!(reply.body, JPEG);

    handle.stop();
    accept_loop.await.unwrap().unwrap();
}

#[tokio::test]
async fn unknown_api_path_is_json_not_found() {
    let (handle, accept_loop) = start().await;

    let reply = roundtrip(&handle, b"GET /api/v1/missing HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert_eq!(reply.status, 404);
    assert!(reply.head.contains("content-type: application/json"));
    assert_eq!(reply.body, br#"{"status":false,"error":"Error 404 Not Found !"}"#);

    let reply = roundtrip(&handle, b"GET /nowhere HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert_eq!(reply.status, 404);
    assert!(reply.head.contains("content-type: text/html"));
    assert!(String::from_utf8_lossy(&reply.body).contains("/nowhere"));

    handle.stop();
    accept_loop.await.unwrap().unwrap();
}

#[tokio::test]
async fn unsupported_method_is_rejected() {
    let (handle, accept_loop) = start().await;

    let reply = roundtrip(&handle, b"BREW /echo HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert_eq!(reply.status, 405);
    assert!(String::from_utf8_lossy(&reply.body).contains("Not Allowed"));

    handle.stop();
    accept_loop.await.unwrap().unwrap();
}

#[tokio::test]
async fn form_body_reaches_the_handler() {
    let (handle, accept_loop) = start().await;

    let reply = roundtrip(
        &handle,
        b"POST /echo HTTP/1.1\r\nHost: x\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: 13\r\n\r\nname=Jane+Doe",
    )
    .await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, b"hello Jane Doe");

    handle.stop();
    accept_loop.await.unwrap().unwrap();
}

#[tokio::test]
async fn protected_routes_require_credentials() {
    let (handle, accept_loop) = start().await;

    let reply = roundtrip(&handle, b"GET /api/v1/private HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert_eq!(reply.status, 401);
    assert_eq!(reply.body, br#"{"status":false,"error":"Error 401 UnAuthorized !"}"#);

    let reply = roundtrip(
        &handle,
        b"GET /api/v1/private HTTP/1.1\r\nHost: x\r\nAuthorization: k-123\r\n\r\n",
    )
    .await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, b"k-123");

    let reply = roundtrip(&handle, b"GET /account HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert_eq!(reply.status, 401);
    assert!(reply.head.contains("content-type: text/html"));

    let reply = roundtrip(
        &handle,
        b"GET /account HTTP/1.1\r\nHost: x\r\nCookie: theme=dark; token=t-9\r\n\r\n",
    )
    .await;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.body, b"t-9");

    handle.stop();
    accept_loop.await.unwrap().unwrap();
}

#[tokio::test]
async fn stop_interrupts_stalled_connections() {
    let (handle, accept_loop) = start().await;
    assert!(handle.is_running());

    // connected but never sends a request
    let _stalled = TcpStream::connect(handle.local_addr()).await.unwrap();
    for _ in 0..100 {
        if handle.live_workers() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(handle.live_workers(), 1);

    handle.stop();
    tokio::time::timeout(Duration::from_secs(5), accept_loop)
        .await
        .expect("accept loop should finish after stop")
        .unwrap()
        .unwrap();

    assert!(!handle.is_running());
    assert_eq!(handle.live_workers(), 0);
}

#[tokio::test]
async fn malformed_json_maps_to_server_error() {
    let (handle, accept_loop) = start().await;

    let reply = roundtrip(
        &handle,
        b"POST /api/v1/echo HTTP/1.1\r\nHost: x\r\nContent-Type: application/json\r\nContent-Length: 5\r\n\r\n{nope",
    )
    .await;
    assert_eq!(reply.status, 500);
    assert!(reply.head.contains("content-type: application/json"));
    let body = String::from_utf8_lossy(&reply.body);
    assert!(body.starts_with(r#"{"status":false,"error":"Internal Server Error : invalid json payload"#));

    let reply = roundtrip(
        &handle,
        b"POST /echo HTTP/1.1\r\nHost: x\r\nContent-Type: application/json\r\nContent-Length: 5\r\n\r\n{nope",
    )
    .await;
    assert_eq!(reply.status, 500);
    assert!(reply.head.contains("content-type: text/html"));
    assert!(String::from_utf8_lossy(&reply.body).contains("invalid json payload"));

    handle.stop();
    accept_loop.await.unwrap().unwrap();
}

#[tokio::test]
async fn served_worker_leaves_the_live_set() {
    let (handle, accept_loop) = start().await;

    let reply = roundtrip(&handle, b"GET /images/foo.jpg HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert_eq!(reply.status, 200);

    for _ in 0..100 {
        if handle.live_workers() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(handle.live_workers(), 0);
    assert!(handle.is_running());

    handle.stop();
    accept_loop.await.unwrap().unwrap();
}

#[tokio::test]
async fn idle_client_is_closed_without_response() {
    let (handle, accept_loop) = start_with_idle_timeout(50).await;

    let mut stream = TcpStream::connect(handle.local_addr()).await.unwrap();
    let mut buf = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut buf))
        .await
        .expect("server should close the idle connection")
        .unwrap();
    assert!(buf.is_empty());

    for _ in 0..100 {
        if handle.live_workers() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(handle.live_workers(), 0);

    handle.stop();
    accept_loop.await.unwrap().unwrap();
}
