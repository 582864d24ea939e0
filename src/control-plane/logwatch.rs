use std::collections::HashMap;
use std::io::SeekFrom;
use std::sync::Arc;

use chrono::Utc;
use log::{debug, warn};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use arkctrl::schema::PushMessage;

use crate::db::Store;
use crate::error::{Error, Result};
use crate::events::{broker::EventBroker, Channel, Event};
use crate::layout::Layout;

struct Tail {
    token: CancellationToken,
    subscribers: usize,
}

/// Tails server log files on demand and publishes lines on the
/// `ark-log-data` channel. One tail per (server, file) regardless of how
/// many clients subscribed; the last unsubscribe cancels it.
pub struct LogStreamer {
    store: Arc<Store>,
    layout: Arc<Layout>,
    broker: Arc<EventBroker>,
    tails: Mutex<HashMap<String, Tail>>,
}

impl LogStreamer {
    pub fn new(store: Arc<Store>, layout: Arc<Layout>, broker: Arc<EventBroker>) -> LogStreamer {
        LogStreamer {
            store,
            layout,
            broker,
            tails: Mutex::new(HashMap::new()),
        }
    }

    pub fn stream_key(server_name: &str, log_file_name: &str) -> String {
        format!("{}/{}", server_name, log_file_name)
    }

    pub async fn subscribe(&self, server_name: &str, log_file_name: &str) -> Result<()> {
        if log_file_name.contains('/') || log_file_name.contains('\\') || log_file_name.contains("..")
        {
            return Err(Error::Validation(
                "logFileName: must be a bare file name".to_owned(),
            ));
        }
        let config = self
            .store
            .get_server_config(server_name)?
            .ok_or_else(|| Error::NotFound(format!("server '{}'", server_name)))?;

        let key = LogStreamer::stream_key(server_name, log_file_name);
        let mut tails = self.tails.lock().await;
        if let Some(tail) = tails.get_mut(&key) {
            tail.subscribers += 1;
            return Ok(());
        }

        let token = CancellationToken::new();
        tails.insert(
            key.clone(),
            Tail {
                token: token.clone(),
                subscribers: 1,
            },
        );

        let path = self.layout.logs_dir(&config).join(log_file_name);
        let broker = Arc::clone(&self.broker);
        let server = server_name.to_owned();
        let file_name = log_file_name.to_owned();
        tokio::spawn(async move {
            if let Err(e) = tail_loop(path, server, file_name, key, broker, token).await {
                debug!("log tail ended with error: {:?}", e);
            }
        });
        Ok(())
    }

    pub async fn unsubscribe(&self, server_name: &str, log_file_name: &str) {
        let key = LogStreamer::stream_key(server_name, log_file_name);
        let mut tails = self.tails.lock().await;
        if let Some(tail) = tails.get_mut(&key) {
            tail.subscribers -= 1;
            if tail.subscribers == 0 {
                tail.token.cancel();
                tails.remove(&key);
                debug!("stopped log tail {}", key);
            }
        }
    }

    pub async fn list_log_files(&self, server_name: &str) -> Result<Vec<String>> {
        let config = self
            .store
            .get_server_config(server_name)?
            .ok_or_else(|| Error::NotFound(format!("server '{}'", server_name)))?;
        let mut files = Vec::new();
        let mut entries = match tokio::fs::read_dir(self.layout.logs_dir(&config)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.path().is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    files.push(name.to_owned());
                }
            }
        }
        files.sort();
        Ok(files)
    }
}

async fn tail_loop(
    path: std::path::PathBuf,
    server_name: String,
    log_file_name: String,
    key: String,
    broker: Arc<EventBroker>,
    token: CancellationToken,
) -> Result<()> {
    // Wait for the file to exist, then start from its end so subscribers
    // only see new lines.
    let file = loop {
        if token.is_cancelled() {
            return Ok(());
        }
        match File::open(&path).await {
            Ok(file) => break file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
            Err(e) => {
                warn!("cannot open {}: {:?}", path.display(), e);
                return Err(e.into());
            }
        }
    };

    let mut reader = BufReader::new(file);
    reader.seek(SeekFrom::End(0)).await?;

    let mut line = String::new();
    loop {
        if token.is_cancelled() {
            return Ok(());
        }
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                tokio::select! {
                    _ = token.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(std::time::Duration::from_millis(250)) => {}
                }
            }
            Ok(_) => {
                let trimmed = line.trim_end();
                if trimmed.is_empty() {
                    continue;
                }
                let timestamp = Utc::now();
                let payload = PushMessage::ArkLogData {
                    server_name: server_name.clone(),
                    log_file_name: log_file_name.clone(),
                    line: trimmed.to_owned(),
                    timestamp,
                };
                if let Ok(content) = serde_json::to_string(&payload) {
                    broker.publish(Event {
                        channel: Channel::ArkLogData,
                        key: key.clone(),
                        timestamp,
                        content,
                    });
                }
            }
            Err(e) => {
                debug!("read error on {}: {:?}", path.display(), e);
                tokio::time::sleep(std::time::Duration::from_millis(250)).await;
            }
        }
    }
}
