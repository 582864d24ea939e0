use std::sync::Arc;

use rocket::serde::json::Json;
use rocket::{post, State};

use arkctrl::schema::{RconCommandRequest, RconCommandResponse};

use crate::error::Result;
use crate::guards::OperatorUser;
use crate::rcon::RconPool;
use crate::routes::ensure_native;
use crate::supervisor::ProcessSupervisor;
use crate::ServerMode;

/// Synchronous RCON passthrough; not a job.
#[post("/rcon/<server>", data = "<body>")]
pub async fn command(
    _user: OperatorUser,
    server: &str,
    body: Json<RconCommandRequest>,
    mode: &State<ServerMode>,
    supervisor: &State<Arc<ProcessSupervisor>>,
    pool: &State<Arc<RconPool>>,
) -> Result<Json<RconCommandResponse>> {
    ensure_native(mode)?;
    let (config, _) = supervisor.effective_config(server).await?;
    let endpoint = ProcessSupervisor::rcon_endpoint(&config);
    let response = pool.send(server, &endpoint, &body.command).await?;
    Ok(Json(RconCommandResponse { response }))
}
