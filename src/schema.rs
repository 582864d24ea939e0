use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

// *******************************************
// * Server lifecycle                        *
// *******************************************

/// Lifecycle state of a managed ASA server process.
#[derive(Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerPorts {
    pub port: u16,
    pub query_port: u16,
    pub rcon_port: u16,
}

/// Summary row returned by `GET /api/native-servers`.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSummary {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
    pub map: String,
    pub status: ServerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub ports: ServerPorts,
    pub disable_battle_eye: bool,
    pub mod_count: usize,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatusDetail {
    pub state: ServerState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<i64>,
}

// *******************************************
// * Jobs                                    *
// *******************************************

#[derive(Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum JobType {
    InstallSteamcmd,
    InstallAsaBinaries,
    CreateCluster,
    UpdateServer,
    UpdateAll,
    DeleteCluster,
    StartServer,
    StopServer,
    RestartServer,
}

impl JobType {
    /// Exclusive jobs hold the process-wide update lock for their whole run.
    pub fn is_exclusive(self) -> bool {
        matches!(
            self,
            JobType::InstallSteamcmd
                | JobType::InstallAsaBinaries
                | JobType::UpdateServer
                | JobType::UpdateAll
        )
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub progress: u8,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub data: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCreatedResponse {
    pub job_id: Uuid,
}

// *******************************************
// * Error envelope                          *
// *******************************************

/// Closed set of error kinds surfaced to API callers.
#[derive(Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, PartialEq, Serialize)]
pub enum ErrorKind {
    ValidationFailed,
    NotFound,
    Conflict,
    PreconditionFailed,
    IOFailed,
    ProcessFailed,
    SteamCmdFailed,
    RconConnectionRefused,
    RconAuthFailed,
    RconTimeout,
    RconProtocolError,
    Unauthorized,
    Forbidden,
    Internal,
}

impl ErrorKind {
    pub fn retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::IOFailed
                | ErrorKind::SteamCmdFailed
                | ErrorKind::RconConnectionRefused
                | ErrorKind::RconTimeout
        )
    }
}

/// Structured error shape recorded on jobs and returned in HTTP envelopes.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ErrorEnvelope {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

// *******************************************
// * WebSocket push payloads                 *
// *******************************************

/// Outbound WebSocket payloads. Every payload carries a `type` tag and an
/// ISO-8601 timestamp.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PushMessage {
    #[serde(rename_all = "camelCase")]
    JobProgress {
        job_id: Uuid,
        status: JobStatus,
        progress: u8,
        message: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    ArkChat {
        server: String,
        timestamp: DateTime<Utc>,
        line: String,
    },
    #[serde(rename_all = "camelCase")]
    ArkLogData {
        server_name: String,
        log_file_name: String,
        line: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    ContainerLogData {
        container: String,
        line: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    ContainerEvent {
        container: String,
        event: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename_all = "camelCase")]
    SystemLogData {
        line: String,
        timestamp: DateTime<Utc>,
    },
}

/// Inbound WebSocket subscription control messages.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WsSubscription {
    #[serde(rename_all = "camelCase")]
    StartArkLogs {
        server_name: String,
        log_file_name: String,
    },
    #[serde(rename_all = "camelCase")]
    StopArkLogs {
        server_name: String,
        log_file_name: String,
    },
}

// *******************************************
// * REST request/response bodies            *
// *******************************************

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RconCommandRequest {
    pub command: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RconCommandResponse {
    pub response: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RconPlayer {
    pub id: i64,
    pub name: String,
    pub steam_id: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopRequest {
    #[serde(default)]
    pub graceful: bool,
    #[serde(default = "default_grace_seconds")]
    pub grace_seconds: u64,
}

fn default_grace_seconds() -> u64 {
    30
}

impl Default for StopRequest {
    fn default() -> Self {
        StopRequest {
            graceful: true,
            grace_seconds: default_grace_seconds(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForegroundRequest {
    #[serde(default)]
    pub foreground: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockStatus {
    pub locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acquired_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRequest {
    pub reason: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFileContent {
    pub content: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFileWrite {
    pub content: String,
    pub file: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastRequest {
    pub message: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedModInput {
    pub mod_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mod_name: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerModInput {
    pub mod_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mod_name: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub exclude_shared_mods: bool,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSettingsInput {
    pub exclude_shared_mods: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemResources {
    pub cpu_total: f32,
    pub cpus: Vec<f32>,
    pub mem_total_bytes: u64,
    pub mem_used_bytes: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildInfo {
    pub version: String,
    pub timestamp: String,
}

// *******************************************
// * Authenticated user context              *
// *******************************************

/// Role gates: `viewer` < `operator` < `admin`.
#[derive(
    Clone, Copy, Debug, Deserialize, Display, EnumString, Eq, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    Viewer,
    Operator,
    Admin,
}
