//! End-to-end streaming tests over a real listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use rc_agent::agent::Agent;
use rc_agent::audio::HeadlessAudio;
use rc_agent::capture::FrameFormat;
use rc_agent::config::Settings;
use rc_agent::http;
use rc_agent::platform::headless::{HeadlessPlatform, RecordedInput};
use rc_agent::protocol::decode_frame;

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_agent() -> (Arc<HeadlessPlatform>, Arc<Agent>, SocketAddr) {
    let platform = Arc::new(HeadlessPlatform::new());
    let settings = Settings {
        api_key: "stream-test-key".to_string(),
        allowlist: vec!["ha1".to_string()],
        ..Default::default()
    };
    let agent = Agent::new(
        "stream-agent".to_string(),
        settings,
        platform.clone(),
        Arc::new(HeadlessAudio::new()),
    );
    agent.start();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(http::serve(
        Arc::clone(&agent),
        listener,
        agent.shutdown_token(),
    ));

    (platform, agent, addr)
}

async fn connect_stream(agent: &Arc<Agent>, addr: SocketAddr) -> (uuid::Uuid, WsClient) {
    let (session, token) = agent
        .broker
        .start_session("ha1", Duration::from_secs(900))
        .unwrap();
    let url = format!(
        "ws://{addr}/ws/desktop?sess={}&token={}",
        session.id, token.token
    );
    let (socket, _) = connect_async(url).await.unwrap();
    (session.id, socket)
}

async fn next_message(socket: &mut WsClient) -> Message {
    tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .expect("timed out waiting for message")
        .expect("stream ended")
        .expect("socket error")
}

#[tokio::test(flavor = "multi_thread")]
async fn rejects_bad_credentials_before_upgrade() {
    let (_platform, agent, addr) = spawn_agent().await;

    let (session, token) = agent
        .broker
        .start_session("ha1", Duration::from_secs(900))
        .unwrap();

    // Wrong token.
    let url = format!("ws://{addr}/ws/desktop?sess={}&token=bogus", session.id);
    assert!(connect_async(url).await.is_err());

    // Unknown session id.
    let url = format!(
        "ws://{addr}/ws/desktop?sess={}&token={}",
        uuid::Uuid::new_v4(),
        token.token
    );
    assert!(connect_async(url).await.is_err());

    agent.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn create_connect_terminate() {
    let (_platform, agent, addr) = spawn_agent().await;
    let (session_id, mut socket) = connect_stream(&agent, addr).await;

    // First message is the hello text frame.
    let hello = next_message(&mut socket).await;
    let Message::Text(text) = hello else {
        panic!("expected text hello, got {hello:?}");
    };
    let hello: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(hello["type"], "hello");
    assert_eq!(hello["agentId"], "stream-agent");
    assert_eq!(hello["sessionId"], session_id.to_string());
    assert!(!hello["monitors"].as_array().unwrap().is_empty());

    // Then at least one binary frame with a decodable header.
    let frame = loop {
        match next_message(&mut socket).await {
            Message::Binary(bytes) => break bytes,
            Message::Text(_) | Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message: {other:?}"),
        }
    };
    let (header, payload) = decode_frame(&frame).unwrap();
    assert!(header.width > 0 && header.height > 0);
    assert_eq!(header.format, FrameFormat::Jpeg);
    assert!(!payload.is_empty());

    // Ending the session closes the stream with 1000 within a second.
    agent.broker.end_session(session_id);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    let close = loop {
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("close not received within 1s");
        match tokio::time::timeout(remaining, socket.next()).await {
            Ok(Some(Ok(Message::Close(frame)))) => break frame,
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(_))) | Ok(None) => panic!("stream ended without close frame"),
            Err(_) => panic!("close not received within 1s"),
        }
    };
    let close = close.expect("close frame carries a code");
    assert_eq!(close.code, CloseCode::Normal);

    assert_eq!(agent.broker.active_session_count(), 0);
    agent.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn oversize_message_closes_with_1009() {
    let (_platform, agent, addr) = spawn_agent().await;
    let (_session_id, mut socket) = connect_stream(&agent, addr).await;

    // Swallow the hello.
    let _ = next_message(&mut socket).await;

    let oversize = "x".repeat(65_537);
    socket.send(Message::Text(oversize)).await.unwrap();

    let close = loop {
        match next_message(&mut socket).await {
            Message::Close(frame) => break frame,
            _ => continue,
        }
    };
    let close = close.expect("close frame carries a code and reason");
    assert_eq!(close.code, CloseCode::Size);
    assert!(close.reason.contains("65537"), "reason: {}", close.reason);

    agent.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn input_messages_drive_the_dispatcher() {
    let (platform, agent, addr) = spawn_agent().await;
    let (_session_id, mut socket) = connect_stream(&agent, addr).await;
    let _ = next_message(&mut socket).await;
    platform.clear_injected();

    socket
        .send(Message::Text(
            json!({ "type": "pointer_move", "dx": 7, "dy": -7 }).to_string(),
        ))
        .await
        .unwrap();
    socket
        .send(Message::Text(
            json!({ "type": "key", "key_code": 65, "shift": true }).to_string(),
        ))
        .await
        .unwrap();
    // Malformed JSON and unknown types are ignored without closing.
    socket
        .send(Message::Text("{definitely not json".to_string()))
        .await
        .unwrap();
    socket
        .send(Message::Text(
            json!({ "type": "made_up", "x": 1 }).to_string(),
        ))
        .await
        .unwrap();
    socket
        .send(Message::Text(
            json!({ "type": "quality", "preset": "high" }).to_string(),
        ))
        .await
        .unwrap();

    // Wait until the input shows up on the platform.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let events = platform.injected_events();
        let keys = events
            .iter()
            .filter(|e| matches!(e, RecordedInput::Key { .. }))
            .count();
        if keys >= 2 {
            assert!(events.iter().any(|e| matches!(
                e,
                RecordedInput::Key { vk: 0x10, pressed: true }
            )));
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "input never reached the dispatcher: {events:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // The connection survived the garbage.
    socket
        .send(Message::Text(
            json!({ "type": "pointer_move", "dx": 1, "dy": 1 }).to_string(),
        ))
        .await
        .unwrap();

    agent.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn input_rate_is_capped_per_second() {
    let (platform, agent, addr) = spawn_agent().await;
    let (_session_id, mut socket) = connect_stream(&agent, addr).await;
    let _ = next_message(&mut socket).await;
    platform.clear_injected();

    let message = json!({ "type": "pointer_move", "dx": 1, "dy": 0 }).to_string();
    for _ in 0..1500 {
        socket.send(Message::Text(message.clone())).await.unwrap();
    }

    // Wait for the receive loop to drain, then count what got through.
    let mut last = usize::MAX;
    loop {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let current = platform.injected_events().len();
        if current == last {
            break;
        }
        last = current;
    }

    let moves = platform
        .injected_events()
        .iter()
        .filter(|e| matches!(e, RecordedInput::Pointer(_)))
        .count();
    assert!(moves > 0, "no input was dispatched at all");
    assert!(moves <= 1000, "rate limit exceeded: {moves} events dispatched");

    // Excess was dropped silently; the stream is still up.
    socket
        .send(Message::Text(
            json!({ "type": "monitor_select", "monitor_id": "DISPLAY1" }).to_string(),
        ))
        .await
        .unwrap();

    agent.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn session_transitions_are_pushed_as_state_frames() {
    let (platform, agent, addr) = spawn_agent().await;
    let (_session_id, mut socket) = connect_stream(&agent, addr).await;
    let _ = next_message(&mut socket).await;

    // Lock the workstation; the 500 ms poll picks it up and every stream
    // hears about it.
    platform.set_desktop_name("Winlogon");
    platform.set_user_present(true);

    let state = loop {
        match next_message(&mut socket).await {
            Message::Text(text) => {
                let value: Value = serde_json::from_str(&text).unwrap();
                if value["type"] == "state" {
                    break value;
                }
            }
            _ => continue,
        }
    };
    assert_eq!(state["state"], "locked");
    assert_eq!(state["consoleSession"], 1);

    agent.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn monitor_select_over_the_stream_warps_the_cursor() {
    let (platform, agent, addr) = spawn_agent().await;
    platform.set_displays(vec![
        rc_agent::platform::DisplayDevice {
            device_name: r"\\.\DISPLAY1".to_string(),
            friendly_name: "Main".to_string(),
            x: 0,
            y: 0,
            width: 1920,
            height: 1080,
            primary: true,
        },
        rc_agent::platform::DisplayDevice {
            device_name: r"\\.\DISPLAY2".to_string(),
            friendly_name: "Side".to_string(),
            x: 1920,
            y: 0,
            width: 1920,
            height: 1080,
            primary: false,
        },
    ]);

    let (_session_id, mut socket) = connect_stream(&agent, addr).await;
    let _ = next_message(&mut socket).await;

    socket
        .send(Message::Text(
            json!({ "type": "monitor_select", "monitor_id": "DISPLAY2" }).to_string(),
        ))
        .await
        .unwrap();

    // Selection warps the cursor to the center of the second monitor.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while platform.cursor_pos() != (2880, 540) {
        assert!(
            std::time::Instant::now() < deadline,
            "cursor never warped: {:?}",
            platform.cursor_pos()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // An absolute center move now lands on the second monitor (+/- 1 px).
    socket
        .send(Message::Text(
            json!({ "type": "pointer_move", "absolute": true, "x": 32767, "y": 32767 })
                .to_string(),
        ))
        .await
        .unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let (x, y) = platform.cursor_pos();
        if (x - 2880).abs() <= 1 && (y - 540).abs() <= 1 {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "absolute move landed at {:?}",
            (x, y)
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    agent.stop();
}
