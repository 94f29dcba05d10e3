mod common;

use common::{event_frame, new_keypair, signed_event_with_keypair};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

async fn recv_json(
    ws: &mut tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
) -> serde_json::Value {
    let msg = ws.next().await.unwrap().unwrap();
    serde_json::from_str(msg.to_text().unwrap()).unwrap()
}

#[tokio::test]
async fn deletion_event_tombstones_the_target_for_its_own_author() {
    let server = common::spawn().await;
    let (secp, keypair) = new_keypair();
    let (mut ws, _) = connect_async(server.ws_url()).await.expect("connect");

    let target = signed_event_with_keypair(&secp, &keypair, 1, "delete me later", vec![], common::now_offset(0));
    let target_id = target["id"].as_str().unwrap().to_owned();
    ws.send(Message::Text(event_frame(&target))).await.unwrap();
    assert_eq!(recv_json(&mut ws).await[2], true);

    let deletion = signed_event_with_keypair(
        &secp,
        &keypair,
        5,
        "",
        vec![vec!["e".to_owned(), target_id.clone()]],
        common::now_offset(1),
    );
    ws.send(Message::Text(event_frame(&deletion))).await.unwrap();
    assert_eq!(recv_json(&mut ws).await[2], true);

    let req = serde_json::json!(["REQ", "sub1", {"ids": [target_id]}]).to_string();
    ws.send(Message::Text(req)).await.unwrap();
    let eose = recv_json(&mut ws).await;
    assert_eq!(eose[0], "EOSE");
}

#[tokio::test]
async fn deletion_from_a_different_author_does_not_tombstone() {
    let server = common::spawn().await;
    let (secp_owner, keypair_owner) = new_keypair();
    let (secp_attacker, keypair_attacker) = new_keypair();
    let (mut ws, _) = connect_async(server.ws_url()).await.expect("connect");

    let target = signed_event_with_keypair(&secp_owner, &keypair_owner, 1, "mine", vec![], common::now_offset(0));
    let target_id = target["id"].as_str().unwrap().to_owned();
    ws.send(Message::Text(event_frame(&target))).await.unwrap();
    assert_eq!(recv_json(&mut ws).await[2], true);

    let bogus_deletion = signed_event_with_keypair(
        &secp_attacker,
        &keypair_attacker,
        5,
        "",
        vec![vec!["e".to_owned(), target_id.clone()]],
        common::now_offset(1),
    );
    ws.send(Message::Text(event_frame(&bogus_deletion))).await.unwrap();
    assert_eq!(recv_json(&mut ws).await[2], true);

    let req = serde_json::json!(["REQ", "sub2", {"ids": [target_id]}]).to_string();
    ws.send(Message::Text(req)).await.unwrap();
    let replayed = recv_json(&mut ws).await;
    assert_eq!(replayed[0], "EVENT");
    let eose = recv_json(&mut ws).await;
    assert_eq!(eose[0], "EOSE");
}

#[tokio::test]
async fn newer_replaceable_event_supersedes_the_older_one() {
    let server = common::spawn().await;
    let (secp, keypair) = new_keypair();
    let (mut ws, _) = connect_async(server.ws_url()).await.expect("connect");

    let first = signed_event_with_keypair(&secp, &keypair, 0, r#"{"name":"old"}"#, vec![], common::now_offset(0));
    ws.send(Message::Text(event_frame(&first))).await.unwrap();
    assert_eq!(recv_json(&mut ws).await[2], true);

    let second = signed_event_with_keypair(&secp, &keypair, 0, r#"{"name":"new"}"#, vec![], common::now_offset(10));
    ws.send(Message::Text(event_frame(&second))).await.unwrap();
    assert_eq!(recv_json(&mut ws).await[2], true);

    let pubkey = hex::encode(keypair.x_only_public_key().0.serialize());
    let req = serde_json::json!(["REQ", "sub1", {"authors": [pubkey], "kinds": [0]}]).to_string();
    ws.send(Message::Text(req)).await.unwrap();
    let replayed = recv_json(&mut ws).await;
    assert_eq!(replayed[2]["content"], r#"{"name":"new"}"#);
    let eose = recv_json(&mut ws).await;
    assert_eq!(eose[0], "EOSE");
}

#[tokio::test]
async fn older_replaceable_event_arriving_late_is_rejected_as_duplicate() {
    let server = common::spawn().await;
    let (secp, keypair) = new_keypair();
    let (mut ws, _) = connect_async(server.ws_url()).await.expect("connect");

    let newer = signed_event_with_keypair(&secp, &keypair, 0, r#"{"name":"current"}"#, vec![], common::now_offset(10));
    ws.send(Message::Text(event_frame(&newer))).await.unwrap();
    assert_eq!(recv_json(&mut ws).await[2], true);

    let older = signed_event_with_keypair(&secp, &keypair, 0, r#"{"name":"stale"}"#, vec![], common::now_offset(0));
    ws.send(Message::Text(event_frame(&older))).await.unwrap();
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply[2], false);
    assert!(reply[3].as_str().unwrap().starts_with("duplicate:"));
}

#[tokio::test]
async fn ephemeral_events_are_broadcast_but_not_replayed() {
    let server = common::spawn().await;
    let (secp, keypair) = new_keypair();

    let (mut subscriber, _) = connect_async(server.ws_url()).await.expect("connect subscriber");
    let req = serde_json::json!(["REQ", "sub1", {"kinds": [20000]}]).to_string();
    subscriber.send(Message::Text(req)).await.unwrap();
    let eose = recv_json(&mut subscriber).await;
    assert_eq!(eose[0], "EOSE");

    let (mut publisher, _) = connect_async(server.ws_url()).await.expect("connect publisher");
    let ephemeral = signed_event_with_keypair(&secp, &keypair, 20_000, "transient", vec![], common::now_offset(0));
    publisher.send(Message::Text(event_frame(&ephemeral))).await.unwrap();
    assert_eq!(recv_json(&mut publisher).await[2], true);

    let forwarded = recv_json(&mut subscriber).await;
    assert_eq!(forwarded[2]["content"], "transient");

    let (mut late_subscriber, _) = connect_async(server.ws_url()).await.expect("connect late subscriber");
    let req = serde_json::json!(["REQ", "sub2", {"kinds": [20000]}]).to_string();
    late_subscriber.send(Message::Text(req)).await.unwrap();
    let eose = recv_json(&mut late_subscriber).await;
    assert_eq!(eose[0], "EOSE");
    assert!(tokio::time::timeout(std::time::Duration::from_millis(200), late_subscriber.next())
        .await
        .is_err());
}
