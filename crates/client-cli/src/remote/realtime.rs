//! Realtime change feeds over the Phoenix channel websocket.
//!
//! One background task owns the socket. Every subscription is its own
//! channel topic; topics are re-joined after a reconnect. A subscription is
//! handed out only after the server acknowledged the join.

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared::{Collection, RawChange};
use std::collections::HashMap;
use std::time::Duration;
use tasklist_sync::{Filter, StoreError, Subscription};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::rest::filter_operand;

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

type JoinAck = oneshot::Sender<Result<(), StoreError>>;

/// Phoenix wire envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Envelope {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "ref", default)]
    reference: Option<String>,
}

enum Command {
    Join {
        topic: String,
        join: Value,
        events: mpsc::UnboundedSender<RawChange>,
        ack: JoinAck,
    },
    Leave {
        topic: String,
    },
}

struct Channel {
    join: Value,
    events: mpsc::UnboundedSender<RawChange>,
    /// Pending until the first join reply
    ack: Option<JoinAck>,
}

/// Result of a connection attempt
enum ConnectionResult {
    /// Socket dropped; reconnect
    Disconnected,
    /// Every handle is gone
    Shutdown,
}

#[derive(Clone)]
pub struct RealtimeClient {
    commands: mpsc::UnboundedSender<Command>,
    access_token: String,
}

impl RealtimeClient {
    /// Start the socket task. Must be called inside a tokio runtime.
    pub fn spawn(base_url: &str, anon_key: &str, access_token: String) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(socket_url(base_url, anon_key), rx));
        Self {
            commands,
            access_token,
        }
    }

    /// Join a channel for `collection` and wait for the server to accept it
    pub async fn subscribe(
        &self,
        id: u64,
        collection: Collection,
        filter: Option<&Filter>,
    ) -> Result<Subscription, StoreError> {
        let topic = format!("realtime:tasklists-{}", id);
        let (events, rx) = mpsc::unbounded_channel();
        let (ack, joined) = oneshot::channel();
        let join = join_payload(collection, filter, &self.access_token);
        self.commands
            .send(Command::Join {
                topic: topic.clone(),
                join,
                events,
                ack,
            })
            .map_err(|_| socket_closed())?;

        // Dropped on failure, which leaves the topic again
        let commands = self.commands.clone();
        let subscription = Subscription::new(id, collection, rx).on_release(move || {
            let _ = commands.send(Command::Leave { topic });
        });
        match tokio::time::timeout(JOIN_TIMEOUT, joined).await {
            Ok(Ok(result)) => result.map(|()| subscription),
            Ok(Err(_)) => Err(socket_closed()),
            Err(_) => Err(StoreError::Transport(format!(
                "no reply joining the {} channel within {:?}",
                collection, JOIN_TIMEOUT
            ))),
        }
    }
}

fn socket_closed() -> StoreError {
    StoreError::Transport("realtime socket is closed".to_string())
}

pub(crate) fn socket_url(base_url: &str, anon_key: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base.to_string()
    };
    format!("{}/realtime/v1/websocket?apikey={}&vsn=1.0.0", base, anon_key)
}

/// Row filter in realtime syntax, e.g. `list_id=eq.<uuid>`
pub(crate) fn filter_expr(filter: &Filter) -> String {
    format!("{}={}", filter.field(), filter_operand(filter))
}

pub(crate) fn join_payload(collection: Collection, filter: Option<&Filter>, access_token: &str) -> Value {
    let mut change = json!({
        "event": "*",
        "schema": "public",
        "table": collection.as_str(),
    });
    if let Some(filter) = filter {
        change["filter"] = Value::String(filter_expr(filter));
    }
    json!({
        "config": {
            "broadcast": { "self": false },
            "presence": { "key": "" },
            "postgres_changes": [change],
        },
        "access_token": access_token,
    })
}

/// Outcome of a `phx_reply` to a join
pub(crate) fn join_outcome(payload: &Value) -> Result<(), StoreError> {
    if payload.get("status").and_then(Value::as_str) == Some("ok") {
        return Ok(());
    }
    let reason = payload
        .pointer("/response/reason")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| payload.to_string());
    Err(StoreError::rejected(reason))
}

/// Extract the row change carried by a `postgres_changes` payload
pub(crate) fn parse_change(payload: &Value) -> Option<RawChange> {
    let data = payload.get("data")?;
    let record = |key: &str| data.get(key).cloned().unwrap_or(Value::Null);
    match data.get("type")?.as_str()? {
        "INSERT" => Some(RawChange::insert(record("record"))),
        "UPDATE" => Some(RawChange::update(record("record"))),
        "DELETE" => Some(RawChange::delete(record("old_record"))),
        _ => None,
    }
}

/// Socket task: reconnects with exponential backoff until every handle is dropped
async fn run(socket_url: String, mut commands: mpsc::UnboundedReceiver<Command>) {
    let mut channels: HashMap<String, Channel> = HashMap::new();
    let mut reconnect_delay = INITIAL_RECONNECT_DELAY;
    let mut attempt = 0;

    loop {
        attempt += 1;

        match run_connection(&socket_url, &mut channels, &mut commands).await {
            Ok(ConnectionResult::Shutdown) => {
                tracing::debug!("Realtime socket closed");
                break;
            }
            Ok(ConnectionResult::Disconnected) => {
                reconnect_delay = INITIAL_RECONNECT_DELAY;
                attempt = 0;
                tracing::warn!("Realtime connection lost. Reconnecting in {:?}...", reconnect_delay);
            }
            Err(e) => {
                tracing::error!(
                    "Realtime connection error: {}. Reconnecting in {:?}... (attempt {})",
                    e,
                    reconnect_delay,
                    attempt
                );
                reconnect_delay = std::cmp::min(reconnect_delay * 2, MAX_RECONNECT_DELAY);
            }
        }

        tokio::time::sleep(reconnect_delay).await;
    }
}

async fn run_connection(
    socket_url: &str,
    channels: &mut HashMap<String, Channel>,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> Result<ConnectionResult> {
    tracing::info!("Connecting to realtime...");
    let (ws_stream, _) = connect_async(socket_url).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let mut next_ref: u64 = 0;
    let mut frame = |topic: &str, event: &str, payload: Value| -> Result<Message> {
        next_ref += 1;
        let envelope = Envelope {
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
            reference: Some(next_ref.to_string()),
        };
        Ok(Message::Text(serde_json::to_string(&envelope)?))
    };

    for (topic, channel) in channels.iter() {
        ws_sender.send(frame(topic, "phx_join", channel.join.clone())?).await?;
    }
    if !channels.is_empty() {
        tracing::info!("Rejoined {} realtime channels", channels.len());
    }

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Join { topic, join, events, ack }) => {
                    let message = frame(&topic, "phx_join", join.clone())?;
                    channels.insert(topic, Channel { join, events, ack: Some(ack) });
                    ws_sender.send(message).await?;
                }
                Some(Command::Leave { topic }) => {
                    if channels.remove(&topic).is_some() {
                        ws_sender.send(frame(&topic, "phx_leave", json!({}))?).await?;
                    }
                }
                None => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    return Ok(ConnectionResult::Shutdown);
                }
            },
            _ = heartbeat.tick() => {
                ws_sender.send(frame("phoenix", "heartbeat", json!({}))?).await?;
            }
            message = ws_receiver.next() => match message {
                Some(Ok(Message::Text(text))) => handle_text(&text, channels),
                Some(Ok(Message::Ping(_))) => {
                    // tungstenite auto-responds to ping
                }
                Some(Ok(Message::Close(_))) | None => {
                    tracing::info!("Realtime server closed connection");
                    return Ok(ConnectionResult::Disconnected);
                }
                Some(Err(e)) => return Err(e.into()),
                _ => {}
            },
        }
    }
}

fn handle_text(text: &str, channels: &mut HashMap<String, Channel>) {
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!("Failed to parse realtime message: {}", e);
            return;
        }
    };

    match envelope.event.as_str() {
        "postgres_changes" => {
            let Some(change) = parse_change(&envelope.payload) else {
                tracing::warn!("Unrecognized change on {}", envelope.topic);
                return;
            };
            if let Some(channel) = channels.get(&envelope.topic) {
                if channel.events.send(change).is_err() {
                    channels.remove(&envelope.topic);
                }
            }
        }
        "phx_reply" => {
            let Some(channel) = channels.get_mut(&envelope.topic) else {
                return;
            };
            let outcome = join_outcome(&envelope.payload);
            let refused = outcome.is_err();
            if let Err(e) = &outcome {
                tracing::warn!("Channel {} refused: {}", envelope.topic, e);
            }
            if let Some(ack) = channel.ack.take() {
                let _ = ack.send(outcome);
            }
            // Dropping the sender closes the feed
            if refused {
                channels.remove(&envelope.topic);
            }
        }
        "phx_error" | "phx_close" => {
            tracing::warn!("Channel {} closed by server", envelope.topic);
            if let Some(ack) = channels.get_mut(&envelope.topic).and_then(|c| c.ack.take()) {
                let _ = ack.send(Err(StoreError::Transport(format!(
                    "channel {} closed before joining",
                    envelope.topic
                ))));
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::ChangeKind;
    use uuid::Uuid;

    #[test]
    fn test_socket_url() {
        assert_eq!(
            socket_url("https://abc.supabase.co/", "key"),
            "wss://abc.supabase.co/realtime/v1/websocket?apikey=key&vsn=1.0.0"
        );
        assert!(socket_url("http://localhost:54321", "key").starts_with("ws://localhost:54321/"));
    }

    #[test]
    fn test_join_payload() {
        let list_id = Uuid::new_v4();
        let filter = Filter::eq("list_id", list_id);
        let payload = join_payload(Collection::Todos, Some(&filter), "jwt");

        let change = &payload["config"]["postgres_changes"][0];
        assert_eq!(change["table"], "todos");
        assert_eq!(change["event"], "*");
        assert_eq!(change["filter"], format!("list_id=eq.{}", list_id));
        assert_eq!(payload["access_token"], "jwt");

        let payload = join_payload(Collection::TodoTags, None, "jwt");
        assert!(payload["config"]["postgres_changes"][0].get("filter").is_none());
    }

    #[test]
    fn test_parse_change() {
        let insert = json!({
            "data": { "type": "INSERT", "table": "todos", "record": { "id": 1 }, "old_record": null }
        });
        let change = parse_change(&insert).unwrap();
        assert_eq!(change.kind, ChangeKind::Insert);
        assert_eq!(change.record, json!({ "id": 1 }));

        let delete = json!({
            "data": { "type": "DELETE", "record": null, "old_record": { "id": 2 } }
        });
        let change = parse_change(&delete).unwrap();
        assert_eq!(change.kind, ChangeKind::Delete);
        assert_eq!(change.record, json!({ "id": 2 }));

        assert!(parse_change(&json!({ "data": { "type": "TRUNCATE" } })).is_none());
        assert!(parse_change(&json!({})).is_none());
    }

    #[test]
    fn test_handle_text_routes_by_topic() {
        let (events, mut rx) = mpsc::unbounded_channel();
        let mut channels = HashMap::new();
        channels.insert(
            "realtime:tasklists-1".to_string(),
            Channel {
                join: Value::Null,
                events,
                ack: None,
            },
        );

        let message = json!({
            "topic": "realtime:tasklists-1",
            "event": "postgres_changes",
            "payload": { "data": { "type": "UPDATE", "record": { "id": 3 } } },
            "ref": null
        });
        handle_text(&message.to_string(), &mut channels);
        assert_eq!(rx.try_recv().unwrap().kind, ChangeKind::Update);

        drop(rx);
        handle_text(&message.to_string(), &mut channels);
        assert!(channels.is_empty());
    }

    fn reply(topic: &str, payload: Value) -> String {
        json!({ "topic": topic, "event": "phx_reply", "payload": payload, "ref": "1" }).to_string()
    }

    #[test]
    fn test_join_outcome() {
        assert!(join_outcome(&json!({ "status": "ok", "response": {} })).is_ok());
        let err = join_outcome(&json!({
            "status": "error",
            "response": { "reason": "Unauthorized" }
        }))
        .unwrap_err();
        assert_eq!(err.to_string(), "Unauthorized");
    }

    #[test]
    fn test_join_reply_resolves_pending_ack() {
        let (events, _rx) = mpsc::unbounded_channel();
        let (ack, mut joined) = oneshot::channel();
        let mut channels = HashMap::new();
        channels.insert(
            "realtime:tasklists-1".to_string(),
            Channel {
                join: Value::Null,
                events,
                ack: Some(ack),
            },
        );

        handle_text(&reply("phoenix", json!({ "status": "ok" })), &mut channels);
        assert!(joined.try_recv().is_err());

        handle_text(
            &reply("realtime:tasklists-1", json!({ "status": "ok", "response": {} })),
            &mut channels,
        );
        assert!(joined.try_recv().unwrap().is_ok());
        assert!(channels["realtime:tasklists-1"].ack.is_none());
    }

    #[test]
    fn test_refused_join_closes_feed() {
        let (events, mut rx) = mpsc::unbounded_channel();
        let (ack, mut joined) = oneshot::channel();
        let mut channels = HashMap::new();
        channels.insert(
            "realtime:tasklists-2".to_string(),
            Channel {
                join: Value::Null,
                events,
                ack: Some(ack),
            },
        );

        handle_text(
            &reply(
                "realtime:tasklists-2",
                json!({ "status": "error", "response": { "reason": "Unauthorized" } }),
            ),
            &mut channels,
        );
        assert!(matches!(
            joined.try_recv().unwrap(),
            Err(StoreError::Rejected { .. })
        ));
        assert!(channels.is_empty());
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    fn detached_client() -> (RealtimeClient, mpsc::UnboundedReceiver<Command>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let client = RealtimeClient {
            commands,
            access_token: "jwt".to_string(),
        };
        (client, rx)
    }

    #[tokio::test]
    async fn test_subscribe_waits_for_join_ack() {
        let (client, mut commands) = detached_client();
        let socket = tokio::spawn(async move {
            let Some(Command::Join { topic, ack, .. }) = commands.recv().await else {
                panic!("expected a join");
            };
            assert_eq!(topic, "realtime:tasklists-7");
            ack.send(Ok(())).unwrap();
            commands
        });

        let subscription = client.subscribe(7, Collection::Todos, None).await.unwrap();
        assert_eq!(subscription.id(), 7);

        let mut commands = socket.await.unwrap();
        drop(subscription);
        assert!(matches!(
            commands.recv().await,
            Some(Command::Leave { topic }) if topic == "realtime:tasklists-7"
        ));
    }

    #[tokio::test]
    async fn test_subscribe_reports_refusal_and_dead_socket() {
        let (client, mut commands) = detached_client();
        tokio::spawn(async move {
            if let Some(Command::Join { ack, .. }) = commands.recv().await {
                let _ = ack.send(Err(StoreError::rejected("Unauthorized")));
            }
        });
        assert!(matches!(
            client.subscribe(1, Collection::Tags, None).await,
            Err(StoreError::Rejected { .. })
        ));

        let (client, commands) = detached_client();
        drop(commands);
        assert!(matches!(
            client.subscribe(2, Collection::Tags, None).await,
            Err(StoreError::Transport(_))
        ));
    }
}
