mod common;

use common::{event_frame, signed_event};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

#[tokio::test]
async fn author_bucket_exhaustion_rate_limits_further_events() {
    let server = common::spawn_with(|config| {
        config.author_bucket_capacity = 1.0;
        config.author_bucket_refill_per_sec = 0.001;
        config.source_bucket_capacity = 1_000.0;
    })
    .await;
    let (mut ws, _) = connect_async(server.ws_url()).await.expect("connect");

    let first = signed_event(1, "uses the only token", vec![], common::now_offset(0));
    ws.send(Message::Text(event_frame(&first))).await.unwrap();
    let ack = ws.next().await.unwrap().unwrap();
    let ack: serde_json::Value = serde_json::from_str(ack.to_text().unwrap()).unwrap();
    assert_eq!(ack[2], true);

    let second = signed_event(1, "bucket should be empty now", vec![], common::now_offset(1));
    ws.send(Message::Text(event_frame(&second))).await.unwrap();
    let notice = ws.next().await.unwrap().unwrap();
    let notice: serde_json::Value = serde_json::from_str(notice.to_text().unwrap()).unwrap();
    assert_eq!(notice[0], "NOTICE");
    assert!(notice[1].as_str().unwrap().starts_with("rate-limited:"));
}

#[tokio::test]
async fn per_source_connection_cap_blocks_excess_connections() {
    let server = common::spawn_with(|config| config.max_connections_per_source = 2).await;

    let _first = connect_async(server.ws_url()).await.expect("connect 1");
    let _second = connect_async(server.ws_url()).await.expect("connect 2");

    let (mut third, _) = connect_async(server.ws_url()).await.expect("connect 3");
    let reply = third.next().await.unwrap().unwrap();
    let frame: serde_json::Value = serde_json::from_str(reply.to_text().unwrap()).unwrap();
    assert_eq!(frame[0], "NOTICE");
    assert!(frame[1].as_str().unwrap().contains("too many connections"));
}
