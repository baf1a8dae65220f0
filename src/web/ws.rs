use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::MissedTickBehavior;

use crate::stats::StatisticsSnapshot;

use super::WebState;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

/// Messages pushed to dashboard sockets. Tagged so clients can dispatch on
/// `type` without sniffing payload fields.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WireMessage {
    Data {
        success: bool,
        data: Option<StatisticsSnapshot>,
        error: Option<String>,
    },
    Heartbeat {
        timestamp: DateTime<Utc>,
    },
}

impl WireMessage {
    pub fn data(snapshot: StatisticsSnapshot) -> Self {
        Self::Data {
            success: true,
            data: Some(snapshot),
            error: None,
        }
    }
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WebState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Per-session loop: forward published snapshots, send a heartbeat on a
/// fixed cadence, and drop sessions that stop answering heartbeats. The
/// subscription unsubscribes itself when this function returns.
async fn handle_socket(mut socket: WebSocket, state: WebState) {
    let mut sub = state.hub.subscribe();
    let session = sub.id;
    log_info!("websocket session {session} connected");

    let mut heartbeat = tokio::time::interval(state.heartbeat);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first interval tick fires immediately; the client just connected.
    heartbeat.tick().await;

    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            update = sub.rx.recv() => {
                let Some(snapshot) = update else {
                    break;
                };
                let message = WireMessage::data(snapshot);
                let Ok(text) = serde_json::to_string(&message) else {
                    continue;
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if awaiting_pong {
                    log_warn!("websocket session {session} missed a heartbeat, closing");
                    break;
                }
                let message = WireMessage::Heartbeat { timestamp: Utc::now() };
                let Ok(text) = serde_json::to_string(&message) else {
                    continue;
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Pong(_))) => awaiting_pong = false,
                    // Browser clients cannot send protocol pongs, so a
                    // tagged JSON `{"type":"pong"}` answers the heartbeat
                    // instead.
                    Some(Ok(Message::Text(text))) => {
                        if is_pong(&text) {
                            awaiting_pong = false;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        log_warn!("websocket session {session} errored: {err}");
                        break;
                    }
                }
            }
        }
    }

    log_info!("websocket session {session} disconnected");
}

fn is_pong(text: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|value| value.get("type").and_then(|t| t.as_str()).map(|t| t == "pong"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EmotionalState, StateDurations};

    fn snapshot() -> StatisticsSnapshot {
        StatisticsSnapshot {
            total_count: 7,
            hour_count: 2,
            today_count: 3,
            avg_duration_ms: 120.0,
            state: EmotionalState::Glad,
            state_since: Utc::now(),
            state_durations: StateDurations::default(),
            last_update: Utc::now(),
        }
    }

    #[test]
    fn data_messages_are_tagged() {
        let json = serde_json::to_value(WireMessage::data(snapshot())).unwrap();
        assert_eq!(json["type"], "data");
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["totalCount"], 7);
        assert_eq!(json["data"]["state"], "glad");
        assert!(json["error"].is_null());
    }

    #[test]
    fn only_tagged_pong_messages_answer_the_heartbeat() {
        assert!(is_pong(r#"{"type":"pong"}"#));
        assert!(is_pong(r#"{"type":"pong","timestamp":"2026-01-01T00:00:00Z"}"#));

        assert!(!is_pong("pong"));
        assert!(!is_pong(r#"{"message":"pong"}"#));
        assert!(!is_pong(r#"{"type":"ping"}"#));
        assert!(!is_pong("not json"));
    }

    #[test]
    fn heartbeat_messages_carry_a_timestamp() {
        let json = serde_json::to_value(WireMessage::Heartbeat {
            timestamp: Utc::now(),
        })
        .unwrap();
        assert_eq!(json["type"], "heartbeat");
        assert!(json["timestamp"].is_string());
    }
}
