//! Local HTTP endpoints for probe tests.

use axum::{body::Body, routing::get, routing::post, Router};
use bytes::Bytes;
use futures::{stream, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;

/// Chunks served by `/down`: 256 x 64 KiB = 16 MiB.
pub const DOWN_CHUNKS: usize = 256;
const CHUNK: usize = 64 * 1024;

async fn down() -> Body {
    let chunk = Bytes::from(vec![0u8; CHUNK]);
    Body::from_stream(
        stream::iter(0..DOWN_CHUNKS).map(move |_| Ok::<_, std::io::Error>(chunk.clone())),
    )
}

/// Never ends: 1 KiB every 5 ms.
async fn slow() -> Body {
    Body::from_stream(stream::unfold((), |()| async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        Some((Ok::<_, std::io::Error>(Bytes::from_static(&[0u8; 1024])), ()))
    }))
}

async fn up(body: Body) -> &'static str {
    let mut data = body.into_data_stream();
    while let Some(Ok(_)) = data.next().await {}
    "ok"
}

/// Starts a server on an ephemeral port, returns its base URL.
pub async fn spawn_server() -> String {
    let app = Router::new()
        .route("/ping", get(|| async { "pong" }))
        .route("/down", get(down))
        .route("/slow", get(slow))
        .route("/up", post(up));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

/// Raw TCP sink for uploads. The first connection is dropped after 64 KiB,
/// which resets that stream; every other connection is drained and never
/// answered.
pub async fn spawn_dropping_upload_server() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let dropped = Arc::new(AtomicBool::new(false));
    tokio::spawn(async move {
        while let Ok((mut sock, _)) = listener.accept().await {
            let drop_this = !dropped.swap(true, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 16 * 1024];
                let mut seen = 0usize;
                while let Ok(n) = sock.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    seen += n;
                    if drop_this && seen >= 64 * 1024 {
                        break;
                    }
                }
            });
        }
    });
    format!("http://{addr}/up")
}

/// URL on a port nothing listens on.
pub async fn closed_port_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}/")
}
