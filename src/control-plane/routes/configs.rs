use std::sync::Arc;

use rocket::serde::json::Json;
use rocket::{get, put, State};

use arkctrl::schema::{ConfigFileContent, ConfigFileWrite, ServerState};

use crate::error::{Error, Result};
use crate::guards::{OperatorUser, ViewerUser};
use crate::layout::Layout;
use crate::supervisor::ProcessSupervisor;

#[get("/configs/<server>?<file>")]
pub async fn get_config(
    _user: ViewerUser,
    server: &str,
    file: &str,
    supervisor: &State<Arc<ProcessSupervisor>>,
    layout: &State<Arc<Layout>>,
) -> Result<Json<ConfigFileContent>> {
    let (config, _) = supervisor.effective_config(server).await?;
    let content = layout.read_config_file(&config, file).await?;
    Ok(Json(ConfigFileContent { content }))
}

/// Writes a config file and regenerates the start script, so the next
/// launch picks the change up. Only stopped servers are mutable.
#[put("/configs/<server>", data = "<body>")]
pub async fn put_config(
    _user: OperatorUser,
    server: &str,
    body: Json<ConfigFileWrite>,
    supervisor: &State<Arc<ProcessSupervisor>>,
    layout: &State<Arc<Layout>>,
) -> Result<Json<ConfigFileContent>> {
    let (config, cluster) = supervisor.effective_config(server).await?;

    let state = supervisor.status(server).await.state;
    if !matches!(state, ServerState::Stopped | ServerState::Failed) {
        return Err(Error::Precondition(format!(
            "server '{}' must be stopped to edit configuration (currently {})",
            server, state
        )));
    }

    layout
        .write_config_file(&config, &body.file, &body.content)
        .await?;
    let mods = supervisor.resolved_mods(&config, cluster.as_ref())?;
    layout
        .write_start_script(&config, cluster.as_ref(), &mods)
        .await?;

    let content = layout.read_config_file(&config, &body.file).await?;
    Ok(Json(ConfigFileContent { content }))
}
