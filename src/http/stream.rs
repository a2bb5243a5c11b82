//! Desktop streaming endpoint.
//!
//! `/ws/desktop?sess=<id>&token=<token>` upgrades to a full-duplex
//! channel: binary frames flow out (header + JPEG payload), JSON input
//! messages flow in. The token and session are validated before the
//! upgrade; afterwards three tasks share one cancellation source:
//!
//! - receive: ingest text messages (size cap, rate limit, dispatch)
//! - send: drain the frame channel under the 5 ms send mutex rule
//! - expiry: check session expiry every 10 s
//!
//! Whichever task exits first cancels the others; the handler awaits all
//! three, unregisters from the broker and the capture engine, and closes
//! the socket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agent::Agent;
use crate::broker::{DesktopSession, PURGE_INTERVAL};
use crate::input::{KeyboardEvent, PointerEvent};
use crate::protocol::{
    self, ClientMessage, HelloFrame, KeyAction, StateFrame, CLOSE_NORMAL, CLOSE_OVERSIZE,
    INPUT_RATE_LIMIT, MAX_TEXT_MESSAGE_BYTES,
};
use crate::session_state::SessionSnapshot;

use super::rate_limit::RateLimitWindow;

/// How long a frame send may wait for the connection's send mutex before
/// it is dropped as backpressure.
const SEND_LOCK_TIMEOUT: Duration = Duration::from_millis(5);

/// Protocol-level ceiling; the 64 KiB policy cap is enforced explicitly
/// so the close carries the byte count, this just bounds reassembly.
const TRANSPORT_MESSAGE_CEILING: usize = MAX_TEXT_MESSAGE_BYTES + 4096;

type SharedSink = Arc<tokio::sync::Mutex<SplitSink<WebSocket, Message>>>;

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    sess: String,
    token: String,
}

/// Upgrade handler. Auth happens before the upgrade: invalid tokens,
/// unknown sessions, and caller mismatches are rejected with 401.
pub async fn desktop_stream(
    ws: WebSocketUpgrade,
    Query(query): Query<StreamQuery>,
    State(agent): State<Arc<Agent>>,
) -> Response {
    let token = match agent.broker.validate_token(&query.token) {
        Ok(token) => token,
        Err(e) => {
            debug!("stream auth failed: {}", e);
            return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
        }
    };

    let session = Uuid::parse_str(&query.sess)
        .ok()
        .and_then(|id| agent.broker.get_session(id));
    let Some(session) = session else {
        return (StatusCode::UNAUTHORIZED, "unknown session").into_response();
    };
    if session.caller_id != token.caller_id {
        warn!(session_id = %session.id, "token caller does not match session");
        return (StatusCode::UNAUTHORIZED, "caller mismatch").into_response();
    }

    ws.max_message_size(TRANSPORT_MESSAGE_CEILING)
        .max_frame_size(TRANSPORT_MESSAGE_CEILING)
        .on_upgrade(move |socket| handle_stream(socket, agent, session))
}

async fn handle_stream(socket: WebSocket, agent: Arc<Agent>, session: DesktopSession) {
    let cancel = CancellationToken::new();
    if agent
        .broker
        .attach_stream(session.id, cancel.clone())
        .is_err()
    {
        // The session ended between validation and upgrade.
        return;
    }

    info!(session_id = %session.id, caller_id = %session.caller_id, "desktop stream connected");

    let (sink, stream) = socket.split();
    let sender: SharedSink = Arc::new(tokio::sync::Mutex::new(sink));
    let close_sent = Arc::new(AtomicBool::new(false));

    // Hello frame first, before any binary traffic.
    let monitors = agent.engine.list_monitors().unwrap_or_default();
    let hello = HelloFrame::new(
        agent.agent_id.clone(),
        session.id.to_string(),
        monitors,
    );
    let hello_ok = match serde_json::to_string(&hello) {
        Ok(text) => sender
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .is_ok(),
        Err(e) => {
            warn!("hello serialization failed: {}", e);
            false
        }
    };
    if !hello_ok {
        agent.broker.detach_stream(session.id);
        return;
    }

    let (subscriber_id, frames) = agent.engine.subscribe();

    // Session transitions (lock, logon, ...) are pushed as `state` text
    // frames through the send task.
    let (state_tx, state_rx) = tokio::sync::mpsc::unbounded_channel::<SessionSnapshot>();
    let state_listener = agent.session.on_change(move |snapshot| {
        let _ = state_tx.send(*snapshot);
    });

    let recv_task = tokio::spawn(recv_loop(
        stream,
        Arc::clone(&agent),
        cancel.clone(),
        Arc::clone(&sender),
        Arc::clone(&close_sent),
    ));
    let send_task = tokio::spawn(send_loop(
        Arc::clone(&frames),
        state_rx,
        cancel.clone(),
        Arc::clone(&sender),
        Arc::clone(&close_sent),
    ));
    let expiry_task = tokio::spawn(expiry_loop(
        Arc::clone(&agent),
        session.id,
        cancel.clone(),
    ));

    // Each loop cancels the others on exit; join failures are logged,
    // never propagated.
    let (recv, send, expiry) = tokio::join!(recv_task, send_task, expiry_task);
    for (name, result) in [("recv", recv), ("send", send), ("expiry", expiry)] {
        if let Err(e) = result {
            warn!(task = name, "stream task join failed: {}", e);
        }
    }

    agent.session.remove_listener(state_listener);
    agent.engine.unsubscribe(subscriber_id);
    agent.broker.detach_stream(session.id);
    send_close(&sender, &close_sent, CLOSE_NORMAL, "session ended".to_string()).await;

    info!(session_id = %session.id, "desktop stream closed");
}

/// Send the close frame exactly once per connection.
async fn send_close(sender: &SharedSink, close_sent: &AtomicBool, code: u16, reason: String) {
    if close_sent.swap(true, Ordering::SeqCst) {
        return;
    }
    let mut sink = sender.lock().await;
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn recv_loop(
    mut stream: SplitStream<WebSocket>,
    agent: Arc<Agent>,
    cancel: CancellationToken,
    sender: SharedSink,
    close_sent: Arc<AtomicBool>,
) {
    let mut limiter = RateLimitWindow::new(INPUT_RATE_LIMIT);

    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = stream.next() => message,
        };

        let message = match message {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                debug!("socket read failed: {}", e);
                break;
            }
            None => break,
        };

        match message {
            Message::Text(text) => {
                if text.len() > MAX_TEXT_MESSAGE_BYTES {
                    warn!(bytes = text.len(), "closing stream: message too big");
                    send_close(
                        &sender,
                        &close_sent,
                        CLOSE_OVERSIZE,
                        format!(
                            "message of {} bytes exceeds the {} byte limit",
                            text.len(),
                            MAX_TEXT_MESSAGE_BYTES
                        ),
                    )
                    .await;
                    break;
                }
                handle_text(&agent, &mut limiter, &text);
            }
            Message::Binary(bytes) => {
                debug!(len = bytes.len(), "ignoring binary message from client");
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    cancel.cancel();
}

/// Parse and dispatch one text message.
///
/// Malformed JSON logs a warning and is ignored; the connection stays up.
/// Input-type messages beyond the rate limit are dropped silently.
fn handle_text(agent: &Agent, limiter: &mut RateLimitWindow, text: &str) {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            warn!("malformed stream message: {}", e);
            return;
        }
    };

    if message.is_input() && !limiter.allow(Instant::now()) {
        return;
    }

    // Dispatch is synchronous and quick: clamping, coordinate math, and a
    // handful of synthetic-input emissions under the dispatcher lock.
    let result = match message {
        ClientMessage::PointerMove { dx, dy, absolute, x, y } => {
            let event = if absolute {
                PointerEvent::MoveAbsolute { x, y }
            } else {
                PointerEvent::MoveRelative { dx, dy }
            };
            agent.dispatcher.dispatch_pointer(event).err().map(|e| e.to_string())
        }
        ClientMessage::PointerButton { button, action } => agent
            .dispatcher
            .dispatch_pointer(PointerEvent::Button { button, action })
            .err()
            .map(|e| e.to_string()),
        ClientMessage::PointerWheel { delta_x, delta_y } => agent
            .dispatcher
            .dispatch_pointer(PointerEvent::Wheel { dx: delta_x, dy: delta_y })
            .err()
            .map(|e| e.to_string()),
        ClientMessage::Key { key_code, action, modifiers } => {
            let event = match action {
                KeyAction::Down => KeyboardEvent::KeyDown { vk: key_code, modifiers },
                KeyAction::Up => KeyboardEvent::KeyUp { vk: key_code, modifiers },
            };
            agent.dispatcher.dispatch_keyboard(event).err().map(|e| e.to_string())
        }
        ClientMessage::Text { text, modifiers } => agent
            .dispatcher
            .dispatch_keyboard(KeyboardEvent::Text { text, modifiers })
            .err()
            .map(|e| e.to_string()),
        ClientMessage::SpecialKey { combo } => agent
            .dispatcher
            .dispatch_special(combo)
            .err()
            .map(|e| e.to_string()),
        ClientMessage::MonitorSelect { monitor_id } => agent
            .engine
            .select_monitor(&monitor_id)
            .err()
            .map(|e| e.to_string()),
        ClientMessage::Quality {} => None,
        ClientMessage::Unknown => {
            debug!("ignoring unknown stream message type");
            None
        }
    };

    if let Some(error) = result {
        debug!("stream message dispatch failed: {}", error);
    }
}

async fn send_loop(
    frames: Arc<crate::capture::FrameChannel>,
    mut state_rx: tokio::sync::mpsc::UnboundedReceiver<SessionSnapshot>,
    cancel: CancellationToken,
    sender: SharedSink,
    close_sent: Arc<AtomicBool>,
) {
    enum Outgoing {
        Frame(Arc<crate::capture::RemoteFrame>),
        State(SessionSnapshot),
    }

    loop {
        let outgoing = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => Outgoing::Frame(frame),
                None => break,
            },
            snapshot = state_rx.recv() => match snapshot {
                Some(snapshot) => Outgoing::State(snapshot),
                None => break,
            },
        };

        match outgoing {
            Outgoing::Frame(frame) => {
                let encoded = protocol::encode_frame(&frame);

                // Sends serialize on the connection mutex; if the previous
                // send has not finished within 5 ms this frame is dropped.
                match tokio::time::timeout(SEND_LOCK_TIMEOUT, sender.lock()).await {
                    Ok(mut sink) => {
                        if close_sent.load(Ordering::SeqCst) {
                            break;
                        }
                        if sink.send(Message::Binary(encoded)).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => {
                        debug!(sequence = frame.sequence, "send mutex busy, frame dropped");
                    }
                }
            }
            Outgoing::State(snapshot) => {
                let Ok(text) = serde_json::to_string(&StateFrame::new(&snapshot)) else {
                    continue;
                };
                let mut sink = sender.lock().await;
                if close_sent.load(Ordering::SeqCst) {
                    break;
                }
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        }
    }

    // A cancellation here is a session end or expiry: close cleanly so
    // the peer sees 1000 rather than an aborted connection.
    if cancel.is_cancelled() {
        send_close(&sender, &close_sent, CLOSE_NORMAL, "session ended".to_string()).await;
    }
    cancel.cancel();
}

async fn expiry_loop(agent: Arc<Agent>, session_id: Uuid, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(PURGE_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let live = agent
                    .broker
                    .get_session(session_id)
                    .map(|session| !session.expired(Utc::now()))
                    .unwrap_or(false);
                if !live {
                    info!(session_id = %session_id, "session expired, closing stream");
                    break;
                }
            }
        }
    }

    cancel.cancel();
}
