//! Long-polling protocol flows against a live server.

mod common;

use std::time::Duration;

use bayeux_settings::TransportSettings;
use serde_json::{Value, json};

use common::{TestServer, connect_message, deliveries, transport};

#[tokio::test]
async fn publish_reaches_other_subscriber() {
    let server = TestServer::boot(transport(1_000)).await;
    let receiver = server.connected_client(&["/chat/room"]).await;
    let sender = server.handshake().await;

    let held = {
        let client = server.client.clone();
        let url = server.cometd_url();
        let body = connect_message(&receiver);
        tokio::spawn(async move {
            client
                .post(url)
                .json(&body)
                .send()
                .await
                .unwrap()
                .json::<Vec<Value>>()
                .await
                .unwrap()
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let replies = server
        .post(json!([{
            "channel": "/chat/room",
            "clientId": sender,
            "id": "7",
            "data": {"text": "hello"},
        }]))
        .await;
    let ack = replies.iter().find(|r| r["id"] == "7").unwrap();
    assert_eq!(ack["successful"], true);

    let replies = tokio::time::timeout(common::TIMEOUT, held).await.unwrap().unwrap();
    let delivered = deliveries(&replies);
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0]["data"]["text"], "hello");
    assert_eq!(replies.last().unwrap()["channel"], "/meta/connect");
}

#[tokio::test]
async fn wildcard_subscription_receives_children() {
    let server = TestServer::boot(transport(1_000)).await;
    let client_id = server.connected_client(&["/news/**"]).await;

    let _ = server.broker.publish_data("/news/sport/today", json!(1)).unwrap();
    let replies = server.connect(&client_id).await;
    let delivered = deliveries(&replies);
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0]["channel"], "/news/sport/today");
}

#[tokio::test]
async fn held_connect_times_out_empty() {
    let server = TestServer::boot(TransportSettings {
        timeout_ms: 300,
        ..TransportSettings::default()
    })
    .await;
    let client_id = server.connected_client(&[]).await;

    let start = std::time::Instant::now();
    let replies = server.connect(&client_id).await;
    assert!(start.elapsed() >= Duration::from_millis(250));
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0]["successful"], true);
    assert_eq!(replies[0]["advice"]["reconnect"], "retry");
}

#[tokio::test]
async fn second_connect_supersedes_the_first() {
    let server = TestServer::boot(TransportSettings {
        duplicate_meta_connect_status: 409,
        ..transport(1_000)
    })
    .await;
    let client_id = server.connected_client(&[]).await;

    let first = {
        let client = server.client.clone();
        let url = server.cometd_url();
        let body = connect_message(&client_id);
        tokio::spawn(async move { client.post(url).json(&body).send().await.unwrap().status() })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    let second = {
        let client = server.client.clone();
        let url = server.cometd_url();
        let body = connect_message(&client_id);
        tokio::spawn(async move { client.post(url).json(&body).send().await.unwrap().status() })
    };

    let status = tokio::time::timeout(common::TIMEOUT, first).await.unwrap().unwrap();
    assert_eq!(status.as_u16(), 409);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let session = server
        .broker
        .session(&bayeux_core::ClientId::from_raw(client_id))
        .unwrap();
    assert!(session.wake());
    let status = tokio::time::timeout(common::TIMEOUT, second).await.unwrap().unwrap();
    assert_eq!(status.as_u16(), 200);
}

#[tokio::test]
async fn unknown_client_is_told_to_handshake() {
    let server = TestServer::boot(transport(1_000)).await;
    let replies = server.post(connect_message("nobody")).await;
    assert_eq!(replies[0]["successful"], false);
    assert_eq!(replies[0]["error"], "402::Unknown client");
    assert_eq!(replies[0]["advice"]["reconnect"], "handshake");
}

#[tokio::test]
async fn malformed_body_gets_unsuccessful_reply() {
    let server = TestServer::boot(transport(1_000)).await;
    let resp = server
        .client
        .post(server.cometd_url())
        .header("content-type", "application/json")
        .body("[{\"channel\": ")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let replies: Vec<Value> = resp.json().await.unwrap();
    assert_eq!(replies[0]["channel"], "/meta/unsuccessful");
    assert_eq!(replies[0]["error"], "400::Bad request");
}

#[tokio::test]
async fn oversized_body_is_rejected() {
    let server = TestServer::boot(TransportSettings {
        max_message_size: 64,
        ..transport(1_000)
    })
    .await;
    let data = "x".repeat(256);
    let (status, _) = server
        .post_raw(&json!([{"channel": "/meta/handshake", "ext": {"pad": data}}]))
        .await;
    assert_eq!(status.as_u16(), 500);
}

#[tokio::test]
async fn disconnect_removes_session() {
    let server = TestServer::boot(transport(1_000)).await;
    let client_id = server.connected_client(&["/bye"]).await;
    assert_eq!(server.broker.sessions().len(), 1);

    let replies = server
        .post(json!([{"channel": "/meta/disconnect", "clientId": client_id}]))
        .await;
    assert_eq!(replies[0]["successful"], true);
    assert!(server.broker.sessions().is_empty());

    let replies = server.connect(&client_id).await;
    assert_eq!(replies[0]["error"], "402::Unknown client");
}

#[tokio::test]
async fn health_reports_sessions() {
    let server = TestServer::boot(transport(1_000)).await;
    let _ = server.handshake().await;
    let health: Value = server
        .client
        .get(format!("http://{}/health", server.addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["sessions"], 1);
}
