use std::{convert::Infallible, time::Duration};

use axum::{
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Router,
};
use futures::stream;
use tokio::net::TcpListener;

use super::*;

#[test]
fn decoder_joins_multiline_data_and_skips_comments() {
    let mut decoder = SseDecoder::default();
    let payloads = decoder.feed(b": keep-alive\n\ndata: {\"a\":\ndata: 1}\nevent: ignored\n\n");
    assert_eq!(payloads, vec!["{\"a\":\n1}".to_string()]);
}

#[test]
fn decoder_handles_chunks_split_mid_line_and_crlf() {
    let mut decoder = SseDecoder::default();
    assert!(decoder.feed(b"data: {\"type\":").is_empty());
    assert!(decoder.feed(b"\"heartbeat\"}\r\n").is_empty());
    let payloads = decoder.feed(b"\r\ndata:second\n\n");
    assert_eq!(
        payloads,
        vec!["{\"type\":\"heartbeat\"}".to_string(), "second".to_string()]
    );
}

#[test]
fn decoder_ignores_blank_lines_without_data() {
    let mut decoder = SseDecoder::default();
    assert!(decoder.feed(b"\n\nid: 4\nretry: 100\n\n").is_empty());
}

async fn spawn_sse_server() -> String {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new().route(
        "/api/message/subscribe",
        get(|| async {
            let events = stream::iter(vec![
                Ok::<_, Infallible>(Event::default().data(r#"{"type":"connected"}"#)),
                Ok(Event::default().data(r#"{"type":"heartbeat"}"#)),
            ]);
            Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(30)))
        }),
    );
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn sse_connector_yields_payloads_then_ends() {
    let server_url = spawn_sse_server().await;
    let connector = SseConnector::new(Client::new(), server_url);

    let mut events = connector
        .open("/api/message/subscribe")
        .await
        .expect("open stream");

    let first = events.next().await.expect("first").expect("payload");
    let second = events.next().await.expect("second").expect("payload");
    assert_eq!(first, r#"{"type":"connected"}"#);
    assert_eq!(second, r#"{"type":"heartbeat"}"#);
    assert!(events.next().await.is_none());
}

#[tokio::test]
async fn sse_connector_rejects_missing_endpoint() {
    let server_url = spawn_sse_server().await;
    let connector = SseConnector::new(Client::new(), server_url);

    let result = connector.open("/api/message/subscribe/channel?channelId=c1").await;
    assert!(matches!(result, Err(ClientError::Server(_))));
}
