use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use log::{debug, info};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use arkctrl::schema::PushMessage;

use crate::consts::{CHAT_EMPTY_LOG_EVERY, CHAT_POLL_INTERVAL};
use crate::events::{broker::EventBroker, Channel, Event};
use crate::rcon::{RconEndpoint, RconPool};

/// One cooperative polling task per running server, issuing `getchat` every
/// two seconds and forwarding ordered lines to the push channel. The RCON
/// protocol only returns messages since the previous poll on the same
/// connection, so no client-side dedup is needed.
pub struct ChatPoller {
    pool: Arc<RconPool>,
    broker: Arc<EventBroker>,
    tasks: Mutex<HashMap<String, CancellationToken>>,
}

impl ChatPoller {
    pub fn new(pool: Arc<RconPool>, broker: Arc<EventBroker>) -> ChatPoller {
        ChatPoller {
            pool,
            broker,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn start(&self, server_name: &str, endpoint: RconEndpoint) {
        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(server_name) {
            return;
        }

        let token = CancellationToken::new();
        tasks.insert(server_name.to_owned(), token.clone());

        let pool = Arc::clone(&self.pool);
        let broker = Arc::clone(&self.broker);
        let name = server_name.to_owned();
        tokio::spawn(async move {
            poll_loop(name, endpoint, pool, broker, token).await;
        });
    }

    /// Cooperative cancellation: the next scheduled poll aborts before
    /// issuing RCON.
    pub async fn stop(&self, server_name: &str) {
        if let Some(token) = self.tasks.lock().await.remove(server_name) {
            token.cancel();
            debug!("cancelled chat poller for '{}'", server_name);
        }
    }

    pub async fn shutdown(&self) {
        let mut tasks = self.tasks.lock().await;
        let count = tasks.len();
        for (_, token) in tasks.drain() {
            token.cancel();
        }
        if count > 0 {
            info!("cancelled {} chat pollers", count);
        }
    }

    pub async fn is_polling(&self, server_name: &str) -> bool {
        self.tasks.lock().await.contains_key(server_name)
    }
}

async fn poll_loop(
    server_name: String,
    endpoint: RconEndpoint,
    pool: Arc<RconPool>,
    broker: Arc<EventBroker>,
    token: CancellationToken,
) {
    let mut consecutive_empty: u64 = 0;

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("chat poller for '{}' exiting", server_name);
                return;
            }
            _ = tokio::time::sleep(CHAT_POLL_INTERVAL) => {}
        }

        match pool.send(&server_name, &endpoint, "getchat").await {
            Ok(response) => {
                let lines = chat_lines(&response);
                if lines.is_empty() {
                    consecutive_empty += 1;
                    // avoid flooding the log with 2-second heartbeats
                    if consecutive_empty % CHAT_EMPTY_LOG_EVERY == 0 {
                        debug!(
                            "'{}' getchat empty {} times in a row",
                            server_name, consecutive_empty
                        );
                    }
                    continue;
                }
                consecutive_empty = 0;
                for line in lines {
                    let timestamp = Utc::now();
                    let payload = PushMessage::ArkChat {
                        server: server_name.clone(),
                        timestamp,
                        line,
                    };
                    match serde_json::to_string(&payload) {
                        Ok(content) => broker.publish(Event {
                            channel: Channel::ArkChat,
                            key: server_name.clone(),
                            timestamp,
                            content,
                        }),
                        Err(e) => debug!("failed to serialize chat payload: {:?}", e),
                    }
                }
            }
            Err(e) => {
                // one batch may be lost across a reconnect, that is accepted
                debug!("chat poll on '{}' failed: {:?}", server_name, e);
            }
        }
    }
}

/// Splits a `getchat` response into chat lines, suppressing the "no content"
/// marker the server returns when nothing happened.
fn chat_lines(response: &str) -> Vec<String> {
    let trimmed = response.trim();
    if trimmed.is_empty() || trimmed == "Server received, But no response!!" {
        return Vec::new();
    }
    trimmed
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.is_empty())
        .map(str::to_owned)
        .collect()
}
