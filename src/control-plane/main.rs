use std::io::Cursor;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use futures::future::BoxFuture;
use log::{error, info, warn};
use rocket::{catchers, fairing::Fairing, routes};
use strum_macros::{Display, EnumString};

use arkctrl::schema::{Job, JobType};

use crate::auth::{AuthnManager, AuthnProvider, AuthzManager};
use crate::chat::ChatPoller;
use crate::consts::*;
use crate::db::Store;
use crate::error::{Error, Result};
use crate::events::broker::EventBroker;
use crate::jobs::{JobContext, JobEngine};
use crate::layout::Layout;
use crate::lock::UpdateLock;
use crate::logsink::SystemLogSink;
use crate::logwatch::LogStreamer;
use crate::model::ClusterInput;
use crate::provision::Provisioner;
use crate::rcon::RconPool;
use crate::steamcmd::SteamCmd;
use crate::supervisor::ProcessSupervisor;
use crate::ws::WebSocketServer;

mod auth;
mod catchers;
mod chat;
mod consts;
mod db;
mod error;
mod events;
mod guards;
mod ini;
mod jobs;
mod layout;
mod lock;
mod logsink;
mod logwatch;
mod model;
mod provision;
mod rcon;
mod resolve;
mod routes;
mod steamcmd;
mod supervisor;
mod ws;

#[derive(Clone, Copy, Debug, Display, EnumString, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum ServerMode {
    Native,
    Docker,
    Hybrid,
}

#[rocket::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let log_level = std::env::var(ENV_LOG_LEVEL).unwrap_or_else(|_| "info".to_owned());
    let log_sink = SystemLogSink::init(&log_level);

    let port: u16 = env_or(ENV_PORT, 4000);
    let host = std::env::var(ENV_HOST).unwrap_or_else(|_| "0.0.0.0".to_owned());
    let base_path =
        PathBuf::from(std::env::var(ENV_NATIVE_BASE_PATH).unwrap_or_else(|_| "data".to_owned()));

    let mode = match std::env::var(ENV_SERVER_MODE) {
        Ok(raw) => match ServerMode::from_str(&raw) {
            Ok(mode) => mode,
            Err(_) => {
                error!("Invalid value '{}' for {}, using native", raw, ENV_SERVER_MODE);
                ServerMode::Native
            }
        },
        Err(_) => ServerMode::Native,
    };
    info!("server mode: {}", mode);
    // parsed so the recognised env var set stays exhaustive; enforcement is
    // the boundary's job
    let _rate_limit_max: u32 = env_or(ENV_RATE_LIMIT_MAX, 100);
    let _rcon_default_port: u16 = env_or(ENV_RCON_DEFAULT_PORT, 32330);

    info!("Init filesystem layout at {}", base_path.display());
    let layout = Arc::new(Layout::new(&base_path));
    if let Err(e) = layout.ensure_base() {
        error!("cannot create base directory {}: {:?}", base_path.display(), e);
        std::process::exit(1);
    }

    info!("Opening store");
    let store = match Store::open(layout.db_path()) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("cannot open persistence store: {:?}", e);
            std::process::exit(1);
        }
    };

    info!("Creating event broker");
    let event_broker = Arc::new(EventBroker::new());
    // from here on, info-and-above records also reach system-log-data
    log_sink.attach_broker(Arc::clone(&event_broker));

    let update_lock = Arc::new(UpdateLock::new(layout.update_lock_sentinel()));

    let steamcmd_path = std::env::var(ENV_STEAMCMD_PATH).ok().map(PathBuf::from);
    let steamcmd = Arc::new(SteamCmd::new(
        Arc::clone(&layout),
        Arc::clone(&update_lock),
        steamcmd_path,
    ));

    let rcon_pool = Arc::new(RconPool::new());
    let chat_poller = Arc::new(ChatPoller::new(
        Arc::clone(&rcon_pool),
        Arc::clone(&event_broker),
    ));

    info!("Init process supervisor");
    let process_supervisor = ProcessSupervisor::new(
        Arc::clone(&store),
        Arc::clone(&layout),
        Arc::clone(&rcon_pool),
        Arc::clone(&chat_poller),
    );

    let provisioner = Arc::new(Provisioner::new(
        Arc::clone(&store),
        Arc::clone(&layout),
        Arc::clone(&steamcmd),
        Arc::clone(&process_supervisor),
    ));

    info!("Init job engine");
    let handler_provisioner = Arc::clone(&provisioner);
    let handler_supervisor = Arc::clone(&process_supervisor);
    let job_engine = JobEngine::new(
        Arc::clone(&store),
        Arc::clone(&event_broker),
        Arc::clone(&update_lock),
        Arc::new(move |job, ctx| -> BoxFuture<'static, Result<serde_json::Value>> {
            let provisioner = Arc::clone(&handler_provisioner);
            let supervisor = Arc::clone(&handler_supervisor);
            Box::pin(async move { dispatch_job(job, ctx, provisioner, supervisor).await })
        }),
    );

    if env_or(ENV_AUTO_INSTALL_STEAMCMD, false) {
        let steamcmd = Arc::clone(&steamcmd);
        tokio::spawn(async move {
            match steamcmd.ensure_installed(false).await {
                Ok(exe) => info!("SteamCMD available at {}", exe.display()),
                Err(e) => warn!("automatic SteamCMD install failed: {:?}", e),
            }
        });
    }

    let authn = match std::env::var(ENV_JWT_SECRET) {
        Ok(secret) if !secret.is_empty() => AuthnManager::new(AuthnProvider::Jwt { secret }),
        _ => {
            warn!("{} not set, API authentication is disabled", ENV_JWT_SECRET);
            AuthnManager::new(AuthnProvider::None)
        }
    };

    let log_streamer = Arc::new(LogStreamer::new(
        Arc::clone(&store),
        Arc::clone(&layout),
        Arc::clone(&event_broker),
    ));

    let ws_bind = SocketAddr::new(
        host.parse().unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
        port + 1,
    );
    info!("Opening WebSocket push server at {}", ws_bind);
    WebSocketServer::listen(
        ws_bind,
        Arc::clone(&event_broker),
        Arc::clone(&log_streamer),
    )
    .await?;

    let cors_origins: Vec<String> = std::env::var(ENV_CORS_ORIGIN)
        .map(|raw| raw.split(',').map(|s| s.trim().to_owned()).collect())
        .unwrap_or_else(|_| vec!["*".to_owned()]);

    let figment = rocket::Config::figment()
        .merge(("port", port))
        .merge(("address", host));

    rocket::custom(figment)
        .attach(Cors::new(cors_origins))
        .manage(authn)
        .manage(AuthzManager)
        .manage(mode)
        .manage(store)
        .manage(Arc::clone(&layout))
        .manage(Arc::clone(&update_lock))
        .manage(Arc::clone(&rcon_pool))
        .manage(Arc::clone(&process_supervisor))
        .manage(Arc::clone(&job_engine))
        .manage(Arc::clone(&log_streamer))
        .mount("/", routes![routes::options::options])
        .mount(
            "/api",
            routes![
                routes::servers::list,
                routes::servers::status,
                routes::servers::start,
                routes::servers::stop,
                routes::servers::restart,
                routes::servers::start_bat,
                routes::servers::players,
                routes::servers::broadcast,
                routes::servers::logs,
                routes::provisioning::list_clusters,
                routes::provisioning::get_cluster,
                routes::provisioning::create_cluster,
                routes::provisioning::delete_cluster,
                routes::provisioning::put_cluster_mods,
                routes::provisioning::put_server_mods,
                routes::provisioning::list_shared_mods,
                routes::provisioning::upsert_shared_mod,
                routes::provisioning::delete_shared_mod,
                routes::provisioning::resolved_server_mods,
                routes::provisioning::upsert_store_server_mod,
                routes::provisioning::put_server_settings,
                routes::provisioning::install_steamcmd,
                routes::provisioning::install_asa_binaries,
                routes::provisioning::update_server,
                routes::provisioning::update_all,
                routes::rcon::command,
                routes::configs::get_config,
                routes::configs::put_config,
                routes::lock::status,
                routes::lock::acquire,
                routes::lock::release,
                routes::jobs::list,
                routes::jobs::get,
                routes::jobs::cancel,
                routes::system::resources,
                routes::buildinfo::get,
            ],
        )
        .register(
            "/api",
            catchers![
                catchers::not_found,
                catchers::unauthorized,
                catchers::forbidden,
                catchers::internal,
            ],
        )
        .launch()
        .await?;

    info!("Shutting down");
    chat_poller.shutdown().await;
    rcon_pool.shutdown().await;

    Ok(())
}

async fn dispatch_job(
    job: Job,
    ctx: Arc<JobContext>,
    provisioner: Arc<Provisioner>,
    supervisor: Arc<ProcessSupervisor>,
) -> Result<serde_json::Value> {
    let data = &job.data;
    match job.job_type {
        JobType::InstallSteamcmd => {
            provisioner
                .install_steamcmd(data_bool(data, "foreground"), &ctx)
                .await
        }
        JobType::InstallAsaBinaries => {
            provisioner
                .install_asa_binaries(data_bool(data, "foreground"), &ctx)
                .await
        }
        JobType::CreateCluster => {
            let input: ClusterInput = serde_json::from_value(data.clone())?;
            provisioner
                .create_cluster(input, data_bool(data, "foreground"), &ctx)
                .await
        }
        JobType::DeleteCluster => {
            provisioner
                .delete_cluster(&data_str(data, "clusterName")?, &ctx)
                .await
        }
        JobType::UpdateServer => {
            provisioner
                .update_server(
                    &data_str(data, "serverName")?,
                    data_bool(data, "foreground"),
                    &ctx,
                )
                .await
        }
        JobType::UpdateAll => {
            provisioner
                .update_all(data_bool(data, "foreground"), &ctx)
                .await
        }
        JobType::StartServer => {
            let name = data_str(data, "serverName")?;
            supervisor.start(&name).await?;
            Ok(serde_json::json!({ "server": name }))
        }
        JobType::StopServer => {
            let name = data_str(data, "serverName")?;
            supervisor
                .stop(&name, data_bool(data, "graceful"), data_u64(data, "graceSeconds", 30))
                .await?;
            Ok(serde_json::json!({ "server": name }))
        }
        JobType::RestartServer => {
            let name = data_str(data, "serverName")?;
            supervisor
                .restart(&name, data_bool(data, "graceful"), data_u64(data, "graceSeconds", 30))
                .await?;
            Ok(serde_json::json!({ "server": name }))
        }
    }
}

fn data_str(data: &serde_json::Value, key: &str) -> Result<String> {
    data.get(key)
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .ok_or_else(|| Error::Internal(format!("job data is missing '{}'", key)))
}

fn data_bool(data: &serde_json::Value, key: &str) -> bool {
    data.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}

fn data_u64(data: &serde_json::Value, key: &str, default: u64) -> u64 {
    data.get(key).and_then(|v| v.as_u64()).unwrap_or(default)
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or(default),
        Err(_) => default,
    }
}

struct Cors {
    origins: Vec<String>,
}

impl Cors {
    pub fn new(origins: Vec<String>) -> Cors {
        Cors { origins }
    }
}

#[rocket::async_trait]
impl Fairing for Cors {
    fn info(&self) -> rocket::fairing::Info {
        rocket::fairing::Info {
            name: "Add CORS headers to response",
            kind: rocket::fairing::Kind::Response,
        }
    }

    async fn on_response<'r>(&self, req: &'r rocket::Request<'_>, res: &mut rocket::Response<'r>) {
        let allow = if self.origins.iter().any(|o| o == "*") {
            Some("*".to_owned())
        } else {
            req.headers()
                .get_one("Origin")
                .filter(|origin| self.origins.iter().any(|o| o == origin))
                .map(str::to_owned)
        };

        if let Some(origin) = allow {
            res.set_header(rocket::http::Header::new(
                "Access-Control-Allow-Origin",
                origin,
            ));
        }
        res.set_header(rocket::http::Header::new(
            "Access-Control-Allow-Methods",
            "GET, OPTIONS, POST, PUT, DELETE",
        ));
        res.set_header(rocket::http::Header::new(
            "Access-Control-Allow-Headers",
            "*",
        ));

        if req.method() == rocket::http::Method::Options {
            res.set_header(rocket::http::ContentType::Plain);
            res.set_sized_body(0, Cursor::new(""))
        }
    }
}
