use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex};

use futures::stream::{self, BoxStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::{accept_async, tungstenite, WebSocketStream};
use tungstenite::Message;

use arkctrl::schema::WsSubscription;

use crate::error::Result;
use crate::events::{broker::EventBroker, Channel, Event};
use crate::logwatch::LogStreamer;

/// Push-channel WebSocket endpoint. Every connected client receives
/// `job-progress`, `ark-chat` and `system-log-data` traffic; `ark-log-data`
/// is opt-in per log file via `start-ark-logs` / `stop-ark-logs` messages.
pub struct WebSocketServer {
    broker: Arc<EventBroker>,
    streamer: Arc<LogStreamer>,
}

impl WebSocketServer {
    pub async fn listen(
        bind: SocketAddr,
        broker: Arc<EventBroker>,
        streamer: Arc<LogStreamer>,
    ) -> Result<()> {
        let listener = TcpListener::bind(bind).await?;
        info!("WebSocket push server listening on {}", bind);

        let server = Arc::new(WebSocketServer { broker, streamer });
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("WebSocket server received SIGINT");
                        break;
                    }
                    accepted = listener.accept() => {
                        if let Ok((tcp, peer)) = accepted {
                            debug!("WebSocket connection request from {}", peer);
                            let server = Arc::clone(&server);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(tcp, peer).await {
                                    match e {
                                        tungstenite::Error::ConnectionClosed
                                        | tungstenite::Error::Protocol(_) => (),
                                        err => error!("WebSocket connection error: {}", err),
                                    }
                                }
                            });
                        }
                    }
                }
            }
        });
        Ok(())
    }

    async fn handle_connection(
        &self,
        tcp: TcpStream,
        peer: SocketAddr,
    ) -> tungstenite::Result<()> {
        let ws: WebSocketStream<TcpStream> = accept_async(tcp).await?;
        let (ws_tx, mut ws_rx) = ws.split();
        let ws_tx = Arc::new(Mutex::new(ws_tx));
        info!("WebSocket peer connected: {}", peer);

        // (server, logFileName) pairs this client asked to follow
        let log_subs: Arc<StdMutex<HashSet<(String, String)>>> =
            Arc::new(StdMutex::new(HashSet::new()));

        let forward_task = {
            let ws_tx = Arc::clone(&ws_tx);
            let log_subs = Arc::clone(&log_subs);
            let log_filter = move |key: &str| {
                log_subs
                    .lock()
                    .unwrap()
                    .iter()
                    .any(|(server, file)| LogStreamer::stream_key(server, file) == key)
            };

            let streams: Vec<BoxStream<'static, Event>> = vec![
                Box::pin(self.broker.subscribe(Channel::JobProgress, |_| true)),
                Box::pin(self.broker.subscribe(Channel::ArkChat, |_| true)),
                Box::pin(self.broker.subscribe(Channel::SystemLogData, |_| true)),
                Box::pin(self.broker.subscribe(Channel::ContainerLogData, |_| true)),
                Box::pin(self.broker.subscribe(Channel::ContainerEvent, |_| true)),
                Box::pin(self.broker.subscribe(Channel::ArkLogData, log_filter)),
            ];
            let mut merged = stream::select_all(streams);

            tokio::spawn(async move {
                while let Some(event) = merged.next().await {
                    send_message(Arc::clone(&ws_tx), Message::text(event.content)).await;
                }
                debug!("event forwarding task exiting");
            })
        };

        while let Some(incoming) = ws_rx.next().await {
            match incoming {
                Ok(Message::Text(text)) => {
                    self.handle_subscription(text.as_str(), &log_subs, &ws_tx)
                        .await;
                }
                Ok(Message::Close(_)) => {
                    info!("WebSocket peer {} closed the connection", peer);
                    break;
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                    // tungstenite answers pings on its own
                }
                Ok(_) => {
                    // binary and frame messages are not part of the protocol
                }
                Err(e) => {
                    debug!("WebSocket receive error from {}: {:?}", peer, e);
                    break;
                }
            }
        }

        forward_task.abort();
        let leftovers: Vec<(String, String)> = log_subs.lock().unwrap().drain().collect();
        for (server, file) in leftovers {
            self.streamer.unsubscribe(&server, &file).await;
        }
        info!("cleaned up WebSocket peer {}", peer);
        Ok(())
    }

    async fn handle_subscription(
        &self,
        text: &str,
        log_subs: &Arc<StdMutex<HashSet<(String, String)>>>,
        ws_tx: &Arc<Mutex<futures_util::stream::SplitSink<WebSocketStream<TcpStream>, Message>>>,
    ) {
        let subscription = match serde_json::from_str::<WsSubscription>(text) {
            Ok(subscription) => subscription,
            Err(_) => {
                warn!("unsupported WebSocket message: {}", text);
                return;
            }
        };

        match subscription {
            WsSubscription::StartArkLogs {
                server_name,
                log_file_name,
            } => match self.streamer.subscribe(&server_name, &log_file_name).await {
                Ok(()) => {
                    log_subs
                        .lock()
                        .unwrap()
                        .insert((server_name, log_file_name));
                }
                Err(e) => {
                    let reply = serde_json::json!({
                        "type": "error",
                        "message": e.to_string(),
                        "timestamp": chrono::Utc::now(),
                    });
                    send_message(Arc::clone(ws_tx), Message::text(reply.to_string())).await;
                }
            },
            WsSubscription::StopArkLogs {
                server_name,
                log_file_name,
            } => {
                if log_subs
                    .lock()
                    .unwrap()
                    .remove(&(server_name.clone(), log_file_name.clone()))
                {
                    self.streamer.unsubscribe(&server_name, &log_file_name).await;
                }
            }
        }
    }
}

async fn send_message(
    ws_tx: Arc<Mutex<futures_util::stream::SplitSink<WebSocketStream<TcpStream>, Message>>>,
    message: Message,
) {
    let mut tx = ws_tx.lock().await;
    if let Err(e) = tx.send(message).await {
        debug!("error sending WebSocket message: {:?}", e);
    } else {
        let _ = tx.flush().await;
    }
}
