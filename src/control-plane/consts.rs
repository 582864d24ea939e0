use std::time::Duration;

// Environment variables recognised by the control-plane process. This list is
// exhaustive; anything else in the environment is ignored.
pub const ENV_PORT: &str = "PORT";
pub const ENV_HOST: &str = "HOST";
pub const ENV_JWT_SECRET: &str = "JWT_SECRET";
pub const ENV_SERVER_MODE: &str = "SERVER_MODE";
pub const ENV_NATIVE_BASE_PATH: &str = "NATIVE_BASE_PATH";
pub const ENV_RCON_DEFAULT_PORT: &str = "RCON_DEFAULT_PORT";
pub const ENV_RATE_LIMIT_MAX: &str = "RATE_LIMIT_MAX";
pub const ENV_LOG_LEVEL: &str = "LOG_LEVEL";
pub const ENV_AUTO_INSTALL_STEAMCMD: &str = "AUTO_INSTALL_STEAMCMD";
pub const ENV_STEAMCMD_PATH: &str = "STEAMCMD_PATH";
pub const ENV_CORS_ORIGIN: &str = "CORS_ORIGIN";

/// Steam app id of the ASA dedicated server.
pub const ASA_APP_ID: &str = "2430930";

/// SteamCMD installer archive on the Steam CDN.
pub const STEAMCMD_DOWNLOAD_URL: &str =
    "https://steamcdn-a.akamaihd.net/client/installer/steamcmd.zip";

/// The one and only server executable. Scripts referencing anything else
/// (notably the legacy `ShooterGameServer.exe`) are stale and regenerated.
pub const ASA_SERVER_EXE: &str = "ArkAscendedServer.exe";

pub const DB_FILE_NAME: &str = "arkctrl.db";
pub const UPDATE_LOCK_SENTINEL: &str = "update.lock";
pub const CLUSTER_CONFIG_FILE: &str = "cluster.json";
pub const SERVER_CONFIG_FILE: &str = "server-config.json";
pub const START_SCRIPT_FILE: &str = "start.bat";

pub const RCON_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const RCON_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
pub const CHAT_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Only every Nth consecutive empty `getchat` response is logged.
pub const CHAT_EMPTY_LOG_EVERY: u64 = 200;

/// How long the supervisor waits for the ASA process to appear after
/// launching the start script.
pub const START_GRACE_PERIOD: Duration = Duration::from_secs(60);
/// Process exit detection latency bound.
pub const EXIT_POLL_INTERVAL: Duration = Duration::from_secs(3);

/// SteamCMD watchdog: abort if no progress output for this long.
pub const STEAMCMD_PROGRESS_WATCHDOG: Duration = Duration::from_secs(5 * 60);
/// SteamCMD watchdog: hard bound on a whole install/update run.
pub const STEAMCMD_TOTAL_TIMEOUT: Duration = Duration::from_secs(60 * 60);
/// Grace given to an in-flight SteamCMD sub-process after a job cancel.
pub const STEAMCMD_CANCEL_TIMEOUT: Duration = Duration::from_secs(30);

/// Fixed worker pool size for the job engine.
pub const JOB_WORKERS: usize = 4;
/// Terminal jobs older than this are purged.
pub const JOB_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const JOB_PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);
