use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use mesh_proxy::metrics::{OUTCOME_BACKEND_ERROR, OUTCOME_FORWARDED};
use mesh_proxy::{Forward, ProxyClient, ProxyHandler, ProxyMetrics};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Backend that echoes what it received in headers and body
async fn spawn_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| async move {
                    let method = req.method().to_string();
                    let path = req
                        .uri()
                        .path_and_query()
                        .map(|pq| pq.to_string())
                        .unwrap_or_default();
                    let traceparent = req
                        .headers()
                        .get("traceparent")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    let hop = req
                        .headers()
                        .get("x-mesh-hop")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    let custom = req
                        .headers()
                        .get("x-custom")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    let body = req.into_body().collect().await.unwrap().to_bytes();

                    let response = Response::builder()
                        .status(StatusCode::CREATED)
                        .header("x-seen-method", method)
                        .header("x-seen-path", path)
                        .header("x-seen-traceparent", traceparent)
                        .header("x-seen-hop", hop)
                        .header("x-seen-custom", custom)
                        .body(Full::new(Bytes::from(
                            [b"echo:".as_slice(), &body[..]].concat(),
                        )))
                        .unwrap();
                    Ok::<_, Infallible>(response)
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    addr
}

/// Front door serving one Forward handler
async fn spawn_front(forward: Forward) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let forward = forward.clone();
            tokio::spawn(async move {
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), forward)
                    .await;
            });
        }
    });

    addr
}

/// A port with nothing listening on it
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

#[tokio::test]
async fn forwards_to_linked_backend() {
    let backend = spawn_backend().await;
    let proxy = ProxyHandler::new("ledger");
    proxy.link(backend.port(), "127.0.0.1");

    let request = Request::builder()
        .method("POST")
        .uri("/ledger/accounts?page=2")
        .header("x-custom", "kept")
        .header(
            "traceparent",
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01",
        )
        .body(Full::new(Bytes::from_static(b"hello")))
        .unwrap();

    let response = proxy.forward(None).handle(request).await;

    assert_eq!(response.status(), StatusCode::CREATED);
    let headers = response.headers().clone();
    assert_eq!(headers["x-seen-method"], "POST");
    assert_eq!(headers["x-seen-path"], "/ledger/accounts?page=2");
    assert_eq!(headers["x-seen-custom"], "kept");
    assert_eq!(headers["x-seen-hop"], "ledger");
    let traceparent = headers["x-seen-traceparent"].to_str().unwrap();
    assert!(traceparent.starts_with("00-0af7651916cd43dd8448eb211c80319c-"));
    assert!(!traceparent.contains("b7ad6b7169203331"));

    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body, Bytes::from_static(b"echo:hello"));
}

#[tokio::test]
async fn path_override_replaces_inbound_path() {
    let backend = spawn_backend().await;
    let proxy = ProxyHandler::new("ledger");
    proxy.link(backend.port(), "127.0.0.1");

    let request = Request::builder()
        .uri("/ledger/accounts?page=2")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let response = proxy
        .forward(Some("/v2/accounts".to_string()))
        .handle(request)
        .await;

    assert_eq!(response.headers()["x-seen-path"], "/v2/accounts?page=2");
}

#[tokio::test]
async fn relinking_moves_traffic() {
    let first = spawn_backend().await;
    let port = closed_port().await;
    let proxy = ProxyHandler::new("ledger");
    let forward = proxy.forward(None);

    proxy.link(port, "127.0.0.1");
    let request = Request::builder().uri("/").body(Full::new(Bytes::new())).unwrap();
    assert_eq!(
        forward.handle(request).await.status(),
        StatusCode::SERVICE_UNAVAILABLE
    );

    // The same handler picks up the new link on its next call
    proxy.link(first.port(), "127.0.0.1");
    let request = Request::builder().uri("/").body(Full::new(Bytes::new())).unwrap();
    assert_eq!(forward.handle(request).await.status(), StatusCode::CREATED);

    proxy.unlink();
    let request = Request::builder().uri("/").body(Full::new(Bytes::new())).unwrap();
    assert_eq!(
        forward.handle(request).await.status(),
        StatusCode::SERVICE_UNAVAILABLE
    );
}

#[tokio::test]
async fn backend_failure_is_503() {
    let metrics = ProxyMetrics::new().unwrap();
    let proxy = ProxyHandler::with_client(
        "ledger",
        Arc::new(ProxyClient::default()),
        Some(metrics.clone()),
    );
    proxy.link(closed_port().await, "127.0.0.1");

    let request = Request::builder().uri("/").body(Full::new(Bytes::new())).unwrap();
    let response = proxy.forward(None).handle(request).await;

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body, Bytes::from_static(b"Service Unavailable: backend unreachable\n"));
    assert_eq!(metrics.outcome_count("ledger", OUTCOME_BACKEND_ERROR), 1);
    assert_eq!(metrics.outcome_count("ledger", OUTCOME_FORWARDED), 0);
}

#[tokio::test]
async fn streams_through_a_hyper_server() {
    let backend = spawn_backend().await;
    let proxy = ProxyHandler::new("ledger");
    proxy.link(backend.port(), "127.0.0.1");
    let front = spawn_front(proxy.forward(None)).await;

    let payload = "x".repeat(256 * 1024);
    let response = reqwest::Client::new()
        .put(format!("http://{}/upload", front))
        .body(payload.clone())
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 201);
    assert_eq!(response.headers()["x-seen-path"], "/upload");
    let body = response.text().await.unwrap();
    assert_eq!(body, format!("echo:{}", payload));
}

#[tokio::test]
async fn unlinked_front_door_answers_503() {
    let proxy = ProxyHandler::new("ledger");
    let front = spawn_front(proxy.forward(None)).await;

    let response = reqwest::get(format!("http://{}/anything", front))
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 503);
    assert_eq!(
        response.text().await.unwrap(),
        "Service Unavailable: no backend linked\n"
    );
}
