use std::collections::HashMap;

use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};

use arkctrl::schema::RconPlayer;

use crate::consts::{RCON_COMMAND_TIMEOUT, RCON_CONNECT_TIMEOUT};
use crate::error::{Error, Result};

/// Connection coordinates for one server's RCON listener.
#[derive(Clone, Debug)]
pub struct RconEndpoint {
    pub addr: String,
    pub password: String,
}

struct Request {
    command: String,
    reply: oneshot::Sender<Result<String>>,
}

/// At most one live RCON connection per server. Each connection is an actor
/// with an inbound queue; commands are messages, so concurrent callers are
/// ordered by arrival and distinct servers proceed in parallel.
pub struct RconPool {
    workers: Mutex<HashMap<String, mpsc::Sender<Request>>>,
}

impl RconPool {
    const QUEUE_DEPTH: usize = 32;

    pub fn new() -> RconPool {
        RconPool {
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Sends a command, establishing the connection on first use.
    pub async fn send(
        &self,
        server_name: &str,
        endpoint: &RconEndpoint,
        command: &str,
    ) -> Result<String> {
        if command.is_empty() {
            return Err(Error::Validation("command: may not be empty".to_owned()));
        }

        let tx = self.worker_for(server_name, endpoint).await;
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(Request {
            command: command.to_owned(),
            reply: reply_tx,
        })
        .await
        .map_err(|_| Error::RconTransportError("connection actor is gone".to_owned()))?;

        reply_rx
            .await
            .map_err(|_| Error::RconTransportError("connection actor dropped reply".to_owned()))?
    }

    /// Closes a server's connection, e.g. when the supervisor reports the
    /// server stopping or the server is deleted.
    pub async fn evict(&self, server_name: &str) {
        if self.workers.lock().await.remove(server_name).is_some() {
            debug!("evicted RCON connection for '{}'", server_name);
        }
    }

    pub async fn shutdown(&self) {
        let count = {
            let mut workers = self.workers.lock().await;
            let count = workers.len();
            workers.clear();
            count
        };
        if count > 0 {
            info!("closed {} RCON connections", count);
        }
    }

    async fn worker_for(&self, server_name: &str, endpoint: &RconEndpoint) -> mpsc::Sender<Request> {
        let mut workers = self.workers.lock().await;
        if let Some(tx) = workers.get(server_name) {
            if !tx.is_closed() {
                return tx.clone();
            }
        }

        let (tx, rx) = mpsc::channel(RconPool::QUEUE_DEPTH);
        let name = server_name.to_owned();
        let endpoint = endpoint.clone();
        tokio::spawn(async move {
            worker_loop(name, endpoint, rx).await;
        });
        workers.insert(server_name.to_owned(), tx.clone());
        tx
    }
}

impl Default for RconPool {
    fn default() -> Self {
        RconPool::new()
    }
}

/// Single-connection actor: owns the socket, serializes commands, drops the
/// connection on any error so the next command reconnects.
async fn worker_loop(server_name: String, endpoint: RconEndpoint, mut rx: mpsc::Receiver<Request>) {
    let mut connection: Option<rcon::Connection<TcpStream>> = None;

    while let Some(request) = rx.recv().await {
        let result = execute(&endpoint, &mut connection, &request.command).await;
        if let Err(e) = &result {
            debug!("RCON command on '{}' failed: {:?}", server_name, e);
        }
        let _ = request.reply.send(result);
    }

    debug!("RCON actor for '{}' exiting", server_name);
}

async fn execute(
    endpoint: &RconEndpoint,
    connection: &mut Option<rcon::Connection<TcpStream>>,
    command: &str,
) -> Result<String> {
    if connection.is_none() {
        *connection = Some(connect(endpoint).await?);
    }
    let conn = connection.as_mut().expect("connection established above");

    match tokio::time::timeout(RCON_COMMAND_TIMEOUT, conn.cmd(command)).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => {
            *connection = None;
            Err(classify(e))
        }
        Err(_) => {
            *connection = None;
            Err(Error::RconTimeout)
        }
    }
}

async fn connect(endpoint: &RconEndpoint) -> Result<rcon::Connection<TcpStream>> {
    let connect_fut =
        rcon::Connection::<TcpStream>::builder().connect(&endpoint.addr, &endpoint.password);
    match tokio::time::timeout(RCON_CONNECT_TIMEOUT, connect_fut).await {
        Ok(Ok(connection)) => Ok(connection),
        Ok(Err(e)) => Err(classify(e)),
        Err(_) => Err(Error::RconTimeout),
    }
}

fn classify(e: rcon::Error) -> Error {
    match e {
        rcon::Error::Auth => Error::RconAuthFailed,
        rcon::Error::CommandTooLong => Error::RconProtocolError("command too long".to_owned()),
        rcon::Error::Io(io) => {
            if io.kind() == std::io::ErrorKind::ConnectionRefused {
                Error::RconConnectionRefused
            } else {
                Error::RconTransportError(io.to_string())
            }
        }
        other => {
            warn!("unexpected rcon error shape: {:?}", other);
            Error::RconProtocolError(format!("{:?}", other))
        }
    }
}

/// Parses a `ListPlayers` response: `0. PlayerName, SteamId` per line.
pub fn parse_player_list(data: &str) -> Vec<RconPlayer> {
    let mut players = Vec::new();

    for line in data.lines() {
        let line = line.trim();
        if line.is_empty() || line == "No Players Connected" {
            continue;
        }

        if let Some(dot) = line.find('.') {
            let (id_str, rest) = line.split_at(dot);
            if let Ok(id) = id_str.trim().parse::<i64>() {
                let rest = rest[1..].trim();
                if let Some((name, steam_id)) = rest.split_once(',') {
                    players.push(RconPlayer {
                        id,
                        name: name.trim().to_owned(),
                        steam_id: steam_id.trim().to_owned(),
                    });
                }
            }
        }
    }

    players
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_errors_are_classified() {
        assert!(matches!(classify(rcon::Error::Auth), Error::RconAuthFailed));
    }

    #[test]
    fn refused_connections_are_classified() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(
            classify(rcon::Error::Io(io)),
            Error::RconConnectionRefused
        ));
    }

    #[test]
    fn other_io_errors_are_transport_errors() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        assert!(matches!(
            classify(rcon::Error::Io(io)),
            Error::RconTransportError(_)
        ));
    }

    #[test]
    fn player_list_parses_numbered_lines() {
        let data = "0. Alice, 76561198000000001\n1. Bob, 76561198000000002\n";
        let players = parse_player_list(data);
        assert_eq!(players.len(), 2);
        assert_eq!(players[0].name, "Alice");
        assert_eq!(players[1].steam_id, "76561198000000002");
    }

    #[test]
    fn empty_player_list_parses_to_nothing() {
        assert!(parse_player_list("No Players Connected\n").is_empty());
        assert!(parse_player_list("").is_empty());
    }

    #[tokio::test]
    async fn empty_commands_are_rejected_before_hitting_the_wire() {
        let pool = RconPool::new();
        let endpoint = RconEndpoint {
            addr: "127.0.0.1:1".to_owned(),
            password: "pw".to_owned(),
        };
        let err = pool.send("S", &endpoint, "").await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
