use std::sync::Arc;

use rocket::serde::json::Json;
use rocket::{get, post, State};

use arkctrl::schema::{
    BroadcastRequest, ConfigFileContent, JobCreatedResponse, JobType, RconPlayer, ServerStatusDetail,
    ServerSummary, StopRequest,
};

use crate::error::Result;
use crate::guards::{OperatorUser, ViewerUser};
use crate::jobs::JobEngine;
use crate::layout::Layout;
use crate::logwatch::LogStreamer;
use crate::rcon::{self, RconPool};
use crate::routes::ensure_native;
use crate::supervisor::ProcessSupervisor;
use crate::ServerMode;

#[get("/native-servers")]
pub async fn list(
    _user: ViewerUser,
    supervisor: &State<Arc<ProcessSupervisor>>,
) -> Result<Json<Vec<ServerSummary>>> {
    Ok(Json(supervisor.list().await?))
}

#[get("/native-servers/<name>")]
pub async fn status(
    _user: ViewerUser,
    name: &str,
    supervisor: &State<Arc<ProcessSupervisor>>,
) -> Result<Json<ServerStatusDetail>> {
    // 404 for servers that exist nowhere
    supervisor.effective_config(name).await?;
    Ok(Json(supervisor.status(name).await))
}

#[post("/native-servers/<name>/start")]
pub async fn start(
    _user: OperatorUser,
    name: &str,
    mode: &State<ServerMode>,
    supervisor: &State<Arc<ProcessSupervisor>>,
    engine: &State<Arc<JobEngine>>,
) -> Result<Json<JobCreatedResponse>> {
    ensure_native(mode)?;
    supervisor.effective_config(name).await?;
    let job_id = engine
        .submit(JobType::StartServer, serde_json::json!({ "serverName": name }))
        .await?;
    Ok(Json(JobCreatedResponse { job_id }))
}

#[post("/native-servers/<name>/stop", data = "<body>")]
pub async fn stop(
    _user: OperatorUser,
    name: &str,
    body: Option<Json<StopRequest>>,
    mode: &State<ServerMode>,
    supervisor: &State<Arc<ProcessSupervisor>>,
    engine: &State<Arc<JobEngine>>,
) -> Result<Json<JobCreatedResponse>> {
    ensure_native(mode)?;
    supervisor.effective_config(name).await?;
    let options = body.map(|b| b.into_inner()).unwrap_or_default();
    let job_id = engine
        .submit(
            JobType::StopServer,
            serde_json::json!({
                "serverName": name,
                "graceful": options.graceful,
                "graceSeconds": options.grace_seconds,
            }),
        )
        .await?;
    Ok(Json(JobCreatedResponse { job_id }))
}

#[post("/native-servers/<name>/restart", data = "<body>")]
pub async fn restart(
    _user: OperatorUser,
    name: &str,
    body: Option<Json<StopRequest>>,
    mode: &State<ServerMode>,
    supervisor: &State<Arc<ProcessSupervisor>>,
    engine: &State<Arc<JobEngine>>,
) -> Result<Json<JobCreatedResponse>> {
    ensure_native(mode)?;
    supervisor.effective_config(name).await?;
    let options = body.map(|b| b.into_inner()).unwrap_or_default();
    let job_id = engine
        .submit(
            JobType::RestartServer,
            serde_json::json!({
                "serverName": name,
                "graceful": options.graceful,
                "graceSeconds": options.grace_seconds,
            }),
        )
        .await?;
    Ok(Json(JobCreatedResponse { job_id }))
}

/// The script text as it would be generated from the current effective
/// configuration. This is what the next start will run.
#[get("/native-servers/<name>/start-bat")]
pub async fn start_bat(
    _user: ViewerUser,
    name: &str,
    supervisor: &State<Arc<ProcessSupervisor>>,
    layout: &State<Arc<Layout>>,
) -> Result<Json<ConfigFileContent>> {
    let (config, cluster) = supervisor.effective_config(name).await?;
    let mods = supervisor.resolved_mods(&config, cluster.as_ref())?;
    let content = layout.generate_start_script(&config, cluster.as_ref(), &mods);
    Ok(Json(ConfigFileContent { content }))
}

#[get("/native-servers/<name>/players")]
pub async fn players(
    _user: OperatorUser,
    name: &str,
    mode: &State<ServerMode>,
    supervisor: &State<Arc<ProcessSupervisor>>,
    pool: &State<Arc<RconPool>>,
) -> Result<Json<Vec<RconPlayer>>> {
    ensure_native(mode)?;
    let (config, _) = supervisor.effective_config(name).await?;
    let endpoint = ProcessSupervisor::rcon_endpoint(&config);
    let response = pool.send(name, &endpoint, "ListPlayers").await?;
    Ok(Json(rcon::parse_player_list(&response)))
}

#[post("/native-servers/<name>/broadcast", data = "<body>")]
pub async fn broadcast(
    _user: OperatorUser,
    name: &str,
    body: Json<BroadcastRequest>,
    mode: &State<ServerMode>,
    supervisor: &State<Arc<ProcessSupervisor>>,
    pool: &State<Arc<RconPool>>,
) -> Result<Json<ConfigFileContent>> {
    ensure_native(mode)?;
    let (config, _) = supervisor.effective_config(name).await?;
    let endpoint = ProcessSupervisor::rcon_endpoint(&config);
    let response = pool
        .send(name, &endpoint, &format!("ServerChat {}", body.message))
        .await?;
    Ok(Json(ConfigFileContent { content: response }))
}

#[get("/native-servers/<name>/logs")]
pub async fn logs(
    _user: ViewerUser,
    name: &str,
    streamer: &State<Arc<LogStreamer>>,
) -> Result<Json<Vec<String>>> {
    Ok(Json(streamer.list_log_files(name).await?))
}
