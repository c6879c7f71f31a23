//! Integration tests for the relay server over real sockets

use futures::{SinkExt, StreamExt};
use roomlink_relay::{ClientMessage, ErrorCode, RelayConfig, RelayServer, RoomId, ServerMessage};
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server() -> SocketAddr {
    let server = RelayServer::bind("127.0.0.1:0".parse().unwrap(), RelayConfig::default())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    addr
}

async fn client(addr: SocketAddr) -> Client {
    let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    ws
}

async fn send(ws: &mut Client, message: ClientMessage) {
    ws.send(Message::Text(message.to_json().unwrap())).await.unwrap();
}

async fn recv(ws: &mut Client) -> ServerMessage {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for relay")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return ServerMessage::from_json(&text).unwrap();
        }
    }
}

async fn create_room(ws: &mut Client) -> RoomId {
    send(ws, ClientMessage::CreateRoom).await;
    match recv(ws).await {
        ServerMessage::RoomCreated { room_id } => room_id,
        other => panic!("expected room-created, got {other:?}"),
    }
}

#[tokio::test]
async fn test_pairing_and_forwarding() {
    let addr = start_server().await;
    let mut sender = client(addr).await;
    let mut receiver = client(addr).await;

    let room_id = create_room(&mut sender).await;
    send(&mut sender, ClientMessage::JoinRoom { room_id: room_id.clone() }).await;
    send(&mut receiver, ClientMessage::JoinRoom { room_id }).await;
    assert_eq!(recv(&mut sender).await, ServerMessage::UserJoined);

    let sdp = json!({"type": "offer", "sdp": "v=0"});
    send(&mut sender, ClientMessage::Offer { sdp: sdp.clone() }).await;
    assert_eq!(recv(&mut receiver).await, ServerMessage::Offer { sdp });

    let answer = json!({"type": "answer", "sdp": "v=0"});
    send(&mut receiver, ClientMessage::Answer { sdp: answer.clone() }).await;
    assert_eq!(recv(&mut sender).await, ServerMessage::Answer { sdp: answer });
}

#[tokio::test]
async fn test_third_participant_rejected() {
    let addr = start_server().await;
    let mut a = client(addr).await;
    let mut b = client(addr).await;
    let mut c = client(addr).await;

    let room_id = create_room(&mut a).await;
    send(&mut a, ClientMessage::JoinRoom { room_id: room_id.clone() }).await;
    send(&mut b, ClientMessage::JoinRoom { room_id: room_id.clone() }).await;
    assert_eq!(recv(&mut a).await, ServerMessage::UserJoined);

    send(&mut c, ClientMessage::JoinRoom { room_id }).await;
    assert_eq!(recv(&mut c).await, ServerMessage::error(ErrorCode::RoomFull));
}

#[tokio::test]
async fn test_socket_close_leaves_room() {
    let addr = start_server().await;
    let mut a = client(addr).await;
    let mut b = client(addr).await;

    let room_id = create_room(&mut a).await;
    send(&mut a, ClientMessage::JoinRoom { room_id: room_id.clone() }).await;
    send(&mut b, ClientMessage::JoinRoom { room_id: room_id.clone() }).await;
    assert_eq!(recv(&mut a).await, ServerMessage::UserJoined);

    b.close(None).await.unwrap();
    assert_eq!(recv(&mut a).await, ServerMessage::UserLeft);

    a.close(None).await.unwrap();
    // Give the dispatcher a moment to process the disconnect
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut late = client(addr).await;
    send(&mut late, ClientMessage::JoinRoom { room_id }).await;
    assert_eq!(
        recv(&mut late).await,
        ServerMessage::error(ErrorCode::RoomNotFound)
    );
}

#[tokio::test]
async fn test_malformed_frame_gets_error() {
    let addr = start_server().await;
    let mut ws = client(addr).await;

    ws.send(Message::Text("{\"type\":\"warp\"}".to_string())).await.unwrap();
    assert_eq!(
        recv(&mut ws).await,
        ServerMessage::error(ErrorCode::InvalidMessage)
    );
}

#[tokio::test]
async fn test_http_create_room() {
    let addr = start_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            b"POST /api/create-room HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await
        .unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.to_ascii_lowercase().contains("access-control-allow-origin: *"));

    let body = response.split("\r\n\r\n").nth(1).unwrap();
    let value: serde_json::Value = serde_json::from_str(body).unwrap();
    let room_id = value["roomId"].as_str().unwrap();
    assert_eq!(room_id.len(), 24);

    // The HTTP-provisioned room is joinable over the socket
    let mut ws = client(addr).await;
    let mut peer = client(addr).await;
    send(&mut ws, ClientMessage::JoinRoom { room_id: RoomId::from(room_id) }).await;
    send(&mut peer, ClientMessage::JoinRoom { room_id: RoomId::from(room_id) }).await;
    assert_eq!(recv(&mut ws).await, ServerMessage::UserJoined);
}
