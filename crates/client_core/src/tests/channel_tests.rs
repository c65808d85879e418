use super::*;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message as AxumWsMessage, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use tokio::{net::TcpListener, sync::mpsc as tokio_mpsc, time::timeout};

#[derive(Clone)]
struct TestServerState {
    client_frames: tokio_mpsc::UnboundedSender<String>,
    pushes: broadcast::Sender<String>,
    kill: broadcast::Sender<()>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<TestServerState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

async fn serve_socket(mut socket: WebSocket, state: TestServerState) {
    let mut pushes = state.pushes.subscribe();
    let mut kill = state.kill.subscribe();
    loop {
        tokio::select! {
            frame = socket.recv() => match frame {
                Some(Ok(AxumWsMessage::Text(text))) => {
                    let _ = state.client_frames.send(text);
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => return,
            },
            push = pushes.recv() => {
                let Ok(text) = push else { return };
                if socket.send(AxumWsMessage::Text(text)).await.is_err() {
                    return;
                }
            }
            // server-side severing; the listener stays up so the client
            // can reconnect
            _ = kill.recv() => return,
        }
    }
}

struct TestServer {
    server_url: String,
    frames: tokio_mpsc::UnboundedReceiver<String>,
    pushes: broadcast::Sender<String>,
    kill: broadcast::Sender<()>,
}

async fn spawn_ws_server() -> TestServer {
    let (client_frames, frames) = tokio_mpsc::unbounded_channel();
    let (pushes, _) = broadcast::channel(16);
    let (kill, _) = broadcast::channel(1);
    let state = TestServerState {
        client_frames,
        pushes: pushes.clone(),
        kill: kill.clone(),
    };
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    TestServer {
        server_url: format!("http://{addr}"),
        frames,
        pushes,
        kill,
    }
}

async fn next_frame(frames: &mut tokio_mpsc::UnboundedReceiver<String>) -> serde_json::Value {
    let text = timeout(Duration::from_secs(2), frames.recv())
        .await
        .expect("timed out waiting for a client frame")
        .expect("server closed");
    serde_json::from_str(&text).unwrap()
}

async fn wait_until_connected(channel: &WebSocketEventChannel) {
    timeout(Duration::from_secs(2), async {
        while !channel.is_connected() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("channel never reported connected");
}

async fn wait_until_disconnected(channel: &WebSocketEventChannel) {
    timeout(Duration::from_secs(2), async {
        while channel.is_connected() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("channel never noticed the disconnect");
}

#[test]
fn channel_config_derives_its_endpoint_from_the_rest_base_url() {
    assert_eq!(
        ChannelConfig::from_server_url("http://127.0.0.1:3000")
            .unwrap()
            .endpoint,
        "ws://127.0.0.1:3000/ws"
    );
    assert_eq!(
        ChannelConfig::from_server_url("https://chat.example.com/")
            .unwrap()
            .endpoint,
        "wss://chat.example.com/ws"
    );
    assert!(ChannelConfig::from_server_url("ftp://nope").is_err());
}

#[tokio::test]
async fn registers_user_on_connect() {
    let mut server = spawn_ws_server().await;
    let config = ChannelConfig::from_server_url(&server.server_url).unwrap();
    let channel = WebSocketEventChannel::connect(config, UserId(42))
        .await
        .unwrap();

    let frame = next_frame(&mut server.frames).await;
    assert_eq!(frame["event"], "registerUser");
    assert_eq!(frame["data"]["userId"], 42);

    channel.close().await;
}

#[tokio::test]
async fn inbound_frames_become_typed_events() {
    let mut server = spawn_ws_server().await;
    let config = ChannelConfig::from_server_url(&server.server_url).unwrap();
    let channel = WebSocketEventChannel::connect(config, UserId(42))
        .await
        .unwrap();
    let mut events = channel.subscribe();
    // wait for registration so the subscriber is attached to a live pump
    next_frame(&mut server.frames).await;

    server
        .pushes
        .send(r#"{"event":"messageSaved","data":{"tempId":555,"messageId":9001}}"#.to_string())
        .unwrap();

    let event = timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        event,
        InboundEvent::MessageSaved {
            temp_id: 555,
            message_id: 9001
        }
    );

    channel.close().await;
}

#[tokio::test]
async fn unrecognized_frames_are_dropped_without_killing_the_pump() {
    let mut server = spawn_ws_server().await;
    let config = ChannelConfig::from_server_url(&server.server_url).unwrap();
    let channel = WebSocketEventChannel::connect(config, UserId(42))
        .await
        .unwrap();
    let mut events = channel.subscribe();
    next_frame(&mut server.frames).await;

    server
        .pushes
        .send(r#"{"event":"nonsense","data":{}}"#.to_string())
        .unwrap();
    server
        .pushes
        .send(r#"{"event":"unreadMessagesCount","data":{"unreadCount":4}}"#.to_string())
        .unwrap();

    let event = timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event, InboundEvent::UnreadMessagesCount { unread_count: 4 });

    channel.close().await;
}

#[tokio::test]
async fn send_emits_an_encoded_frame() {
    let mut server = spawn_ws_server().await;
    let config = ChannelConfig::from_server_url(&server.server_url).unwrap();
    let channel = WebSocketEventChannel::connect(config, UserId(42))
        .await
        .unwrap();
    next_frame(&mut server.frames).await;
    wait_until_connected(&channel).await;

    channel
        .send(OutboundEvent::MessageRead {
            sender_id: UserId(7),
            receiver_id: UserId(42),
            message_ids: vec![1, 2],
        })
        .await
        .unwrap();

    let frame = next_frame(&mut server.frames).await;
    assert_eq!(frame["event"], "messageRead");
    assert_eq!(frame["data"]["senderId"], 7);
    assert_eq!(frame["data"]["messageIds"], serde_json::json!([1, 2]));

    channel.close().await;
}

#[tokio::test]
async fn reconnect_reregisters_and_never_replays_outage_sends() {
    let mut server = spawn_ws_server().await;
    // long enough that the outage assertions below cannot race the
    // reconnect, short enough to keep the test quick
    let mut config = ChannelConfig::from_server_url(&server.server_url).unwrap();
    config.reconnect_delay = Duration::from_millis(250);
    let channel = WebSocketEventChannel::connect(config, UserId(42))
        .await
        .unwrap();

    let frame = next_frame(&mut server.frames).await;
    assert_eq!(frame["event"], "registerUser");
    wait_until_connected(&channel).await;

    // sever the connection from the server side
    server.kill.send(()).unwrap();
    wait_until_disconnected(&channel).await;

    // a send during the outage is refused, not queued for later
    let err = channel
        .send(OutboundEvent::MessageRead {
            sender_id: UserId(7),
            receiver_id: UserId(42),
            message_ids: vec![111],
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not connected"));

    // the fresh connection re-registers the user before anything else
    let frame = next_frame(&mut server.frames).await;
    assert_eq!(frame["event"], "registerUser");
    assert_eq!(frame["data"]["userId"], 42);
    wait_until_connected(&channel).await;

    // the refused event never surfaces; the next frame on the wire is
    // the one sent after the reconnect
    channel
        .send(OutboundEvent::MessageRead {
            sender_id: UserId(7),
            receiver_id: UserId(42),
            message_ids: vec![222],
        })
        .await
        .unwrap();
    let frame = next_frame(&mut server.frames).await;
    assert_eq!(frame["event"], "messageRead");
    assert_eq!(frame["data"]["messageIds"], serde_json::json!([222]));

    channel.close().await;
}

#[tokio::test]
async fn send_fails_once_closed() {
    let mut server = spawn_ws_server().await;
    let config = ChannelConfig::from_server_url(&server.server_url).unwrap();
    let channel = WebSocketEventChannel::connect(config, UserId(42))
        .await
        .unwrap();
    next_frame(&mut server.frames).await;
    channel.close().await;

    let err = channel
        .send(OutboundEvent::RegisterUser { user_id: UserId(42) })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not connected"));
}
