use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use bourracho_types::events::{GatewayCommand, GatewayReply};

use crate::dispatcher::{DeliveryError, Dispatcher};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Commands received over a socket are queued here; a connection flooding
/// commands is disconnected rather than buffered without bound.
const COMMAND_QUEUE: usize = 64;

/// A command refused by the engine, relayed back to the sending connection.
#[derive(Debug, Clone)]
pub struct Rejection {
    pub code: String,
    pub error: String,
}

/// Applies gateway commands on behalf of a connected user.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(
        &self,
        conversation_id: &str,
        user_id: &str,
        command: GatewayCommand,
    ) -> Result<(), Rejection>;
}

/// Handle a pre-authenticated WebSocket connection subscribed to one
/// conversation. Membership was checked at the HTTP upgrade layer.
pub async fn handle_connection(
    socket: WebSocket,
    dispatcher: Dispatcher,
    commands: Arc<dyn CommandHandler>,
    conversation_id: String,
    user_id: String,
) {
    let (mut sender, mut receiver) = socket.split();
    let send_timeout = dispatcher.config().send_timeout;

    // Subscribe before Ready so nothing published after Ready is missed.
    let mut subscription = dispatcher.subscribe(&conversation_id, &user_id);
    info!(
        "{} connected to {} (conn {})",
        user_id,
        conversation_id,
        subscription.conn_id()
    );

    let ready = GatewayReply::Ready {
        conversation_id: conversation_id.clone(),
        user_id: user_id.clone(),
    };
    let Ok(ready) = serde_json::to_string(&ready) else {
        return;
    };
    if sender.send(Message::Text(ready.into())).await.is_err() {
        return;
    }

    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<GatewayReply>();

    let parse_reply_tx = reply_tx.clone();
    let conn_id = subscription.conn_id();
    let metrics = dispatcher.metrics().cloned();

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward queued events + replies -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            let frame = tokio::select! {
                delivery = subscription.recv() => match delivery {
                    Some(delivery) => Message::Text(delivery.json.to_string().into()),
                    None => {
                        debug!("conn {} dropped by dispatcher", conn_id);
                        break;
                    }
                },
                reply = reply_rx.recv() => match reply.map(|r| serde_json::to_string(&r)) {
                    Some(Ok(text)) => Message::Text(text.into()),
                    Some(Err(e)) => {
                        warn!("Failed to serialize reply: {}", e);
                        continue;
                    }
                    None => break,
                },
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    Message::Ping(Default::default())
                }
            };

            match tokio::time::timeout(send_timeout, sender.send(frame)).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => break,
                Err(_) => {
                    warn!(
                        "conn {}: {}, dropping connection",
                        conn_id,
                        DeliveryError::Timeout
                    );
                    if let Some(metrics) = &metrics {
                        metrics.record_dropped(DeliveryError::Timeout);
                    }
                    break;
                }
            }
        }
        // Subscription drops here and leaves the dispatcher.
    });

    // Commands run on their own task so a disconnect never cancels one
    // that is already in flight.
    let (command_tx, mut command_rx) = mpsc::channel::<GatewayCommand>(COMMAND_QUEUE);
    let worker_conversation = conversation_id.clone();
    let worker_user = user_id.clone();
    tokio::spawn(async move {
        while let Some(command) = command_rx.recv().await {
            if let Err(rejection) = commands
                .handle(&worker_conversation, &worker_user, command)
                .await
            {
                let _ = reply_tx.send(GatewayReply::CommandRejected {
                    code: rejection.code,
                    error: rejection.error,
                });
            }
        }
    });

    // Read commands from client
    let recv_user = user_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => {
                        if command_tx.try_send(cmd).is_err() {
                            warn!("{} is flooding commands, closing", recv_user);
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(
                            "{} bad command: {} -- raw: {}",
                            recv_user,
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                        let _ = parse_reply_tx.send(GatewayReply::CommandRejected {
                            code: "bad_command".into(),
                            error: e.to_string(),
                        });
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    info!("{} disconnected from {}", user_id, conversation_id);
}
