use std::sync::Arc;

use log::warn;
use rocket::serde::json::Json;
use rocket::{delete, get, post, put, State};

use arkctrl::schema::{
    ForegroundRequest, JobCreatedResponse, JobType, ServerModInput, ServerSettingsInput,
    SharedModInput,
};

use crate::db::{ServerMod, SharedMod, Store};
use crate::error::{Error, Result};
use crate::guards::{AdminUser, ViewerUser};
use crate::jobs::JobEngine;
use crate::layout::Layout;
use crate::model::{ClusterConfig, ClusterInput, ModManagement, ServerModOverride};
use crate::resolve;
use crate::supervisor::ProcessSupervisor;

#[get("/provisioning/clusters")]
pub async fn list_clusters(
    _user: ViewerUser,
    layout: &State<Arc<Layout>>,
) -> Result<Json<Vec<ClusterConfig>>> {
    Ok(Json(layout.list_disk_clusters().await?))
}

#[get("/provisioning/clusters/<name>")]
pub async fn get_cluster(
    _user: ViewerUser,
    name: &str,
    layout: &State<Arc<Layout>>,
) -> Result<Json<ClusterConfig>> {
    Ok(Json(layout.read_cluster_config(name).await?))
}

/// Kicks off a `create-cluster` job. Validation and port allocation run
/// synchronously so malformed input fails with 400 instead of a failed job.
#[post("/provisioning/clusters", data = "<body>")]
pub async fn create_cluster(
    _user: AdminUser,
    body: Json<ClusterInput>,
    store: &State<Arc<Store>>,
    layout: &State<Arc<Layout>>,
    engine: &State<Arc<JobEngine>>,
) -> Result<Json<JobCreatedResponse>> {
    let input = body.into_inner();

    let existing = store.list_server_configs()?;
    let known_maps = store.list_maps()?;
    resolve::validate_cluster_input(&input, &existing, &known_maps)?;
    resolve::allocate_ports(&input, &existing)?;
    for cluster in layout.list_disk_clusters().await? {
        if cluster.name == input.name {
            return Err(Error::Conflict(format!(
                "cluster '{}' already exists",
                input.name
            )));
        }
    }

    let job_id = engine
        .submit(JobType::CreateCluster, serde_json::to_value(&input)?)
        .await?;
    Ok(Json(JobCreatedResponse { job_id }))
}

#[delete("/provisioning/clusters/<name>")]
pub async fn delete_cluster(
    _user: AdminUser,
    name: &str,
    layout: &State<Arc<Layout>>,
    engine: &State<Arc<JobEngine>>,
) -> Result<Json<JobCreatedResponse>> {
    layout.read_cluster_config(name).await?;
    let job_id = engine
        .submit(JobType::DeleteCluster, serde_json::json!({ "clusterName": name }))
        .await?;
    Ok(Json(JobCreatedResponse { job_id }))
}

#[put("/provisioning/clusters/<name>/mods", data = "<body>")]
pub async fn put_cluster_mods(
    _user: AdminUser,
    name: &str,
    body: Json<ModManagement>,
    layout: &State<Arc<Layout>>,
    supervisor: &State<Arc<ProcessSupervisor>>,
) -> Result<Json<ClusterConfig>> {
    let mut cluster = layout.read_cluster_config(name).await?;
    let update = body.into_inner();

    // every referenced server must be a member
    for referenced in update
        .server_mods
        .keys()
        .chain(update.excluded_servers.iter())
    {
        if cluster.server(referenced).is_none() {
            return Err(Error::Validation(format!(
                "modManagement: '{}' is not a member of cluster '{}'",
                referenced, name
            )));
        }
    }
    for mod_id in update.shared_mods.iter().chain(
        update
            .server_mods
            .values()
            .flat_map(|o| o.additional_mods.iter()),
    ) {
        resolve::validate_mod_id("modManagement", mod_id)?;
    }

    cluster.mod_management = update;
    layout.write_cluster_config(&cluster).await?;
    regenerate_cluster_scripts(&cluster, layout, supervisor).await;
    Ok(Json(cluster))
}

#[put("/provisioning/clusters/<name>/servers/<server>/mods", data = "<body>")]
pub async fn put_server_mods(
    _user: AdminUser,
    name: &str,
    server: &str,
    body: Json<ServerModOverride>,
    layout: &State<Arc<Layout>>,
    supervisor: &State<Arc<ProcessSupervisor>>,
) -> Result<Json<ClusterConfig>> {
    let mut cluster = layout.read_cluster_config(name).await?;
    if cluster.server(server).is_none() {
        return Err(Error::NotFound(format!(
            "server '{}' in cluster '{}'",
            server, name
        )));
    }
    let update = body.into_inner();
    for mod_id in &update.additional_mods {
        resolve::validate_mod_id("additionalMods", mod_id)?;
    }

    cluster
        .mod_management
        .server_mods
        .insert(server.to_owned(), update);
    layout.write_cluster_config(&cluster).await?;
    regenerate_cluster_scripts(&cluster, layout, supervisor).await;
    Ok(Json(cluster))
}

// ***********************
// Host-wide shared mods
// ***********************

#[get("/provisioning/shared-mods")]
pub async fn list_shared_mods(
    _user: ViewerUser,
    store: &State<Arc<Store>>,
) -> Result<Json<Vec<SharedMod>>> {
    Ok(Json(store.list_shared_mods()?))
}

#[post("/provisioning/shared-mods", data = "<body>")]
pub async fn upsert_shared_mod(
    _user: AdminUser,
    body: Json<SharedModInput>,
    store: &State<Arc<Store>>,
) -> Result<Json<Vec<SharedMod>>> {
    let input = body.into_inner();
    if let Some(mod_id) = &input.mod_id {
        resolve::validate_mod_id("sharedMod.modId", mod_id)?;
    }
    store.upsert_shared_mod(input.mod_id.as_deref(), input.mod_name.as_deref(), input.enabled)?;
    Ok(Json(store.list_shared_mods()?))
}

#[delete("/provisioning/shared-mods/<mod_id>")]
pub async fn delete_shared_mod(
    _user: AdminUser,
    mod_id: &str,
    store: &State<Arc<Store>>,
) -> Result<Json<Vec<SharedMod>>> {
    store.delete_shared_mod(mod_id)?;
    Ok(Json(store.list_shared_mods()?))
}

/// Resolved (effective) mod list for one server.
#[get("/provisioning/servers/<name>/mods")]
pub async fn resolved_server_mods(
    _user: ViewerUser,
    name: &str,
    supervisor: &State<Arc<ProcessSupervisor>>,
) -> Result<Json<Vec<String>>> {
    let (config, cluster) = supervisor.effective_config(name).await?;
    Ok(Json(supervisor.resolved_mods(&config, cluster.as_ref())?))
}

/// Host-wide per-server mod rows, appended after the cluster-scoped ones
/// during resolution.
#[post("/provisioning/servers/<name>/mods", data = "<body>")]
pub async fn upsert_store_server_mod(
    _user: AdminUser,
    name: &str,
    body: Json<ServerModInput>,
    store: &State<Arc<Store>>,
    supervisor: &State<Arc<ProcessSupervisor>>,
) -> Result<Json<Vec<ServerMod>>> {
    supervisor.effective_config(name).await?;
    let input = body.into_inner();
    if let Some(mod_id) = &input.mod_id {
        resolve::validate_mod_id("serverMod.modId", mod_id)?;
    }
    store.upsert_server_mod(
        name,
        input.mod_id.as_deref(),
        input.mod_name.as_deref(),
        input.enabled,
        input.exclude_shared_mods,
    )?;
    Ok(Json(store.list_server_mods(name)?))
}

#[put("/provisioning/servers/<name>/settings", data = "<body>")]
pub async fn put_server_settings(
    _user: AdminUser,
    name: &str,
    body: Json<ServerSettingsInput>,
    store: &State<Arc<Store>>,
    supervisor: &State<Arc<ProcessSupervisor>>,
) -> Result<Json<ServerSettingsInput>> {
    supervisor.effective_config(name).await?;
    store.upsert_server_settings(name, body.exclude_shared_mods)?;
    let settings = store
        .get_server_settings(name)?
        .map(|s| ServerSettingsInput {
            exclude_shared_mods: s.exclude_shared_mods,
        })
        .unwrap_or(ServerSettingsInput {
            exclude_shared_mods: false,
        });
    Ok(Json(settings))
}

// ***********************
// Install and update jobs
// ***********************

#[post("/provisioning/install-steamcmd", data = "<body>")]
pub async fn install_steamcmd(
    _user: AdminUser,
    body: Option<Json<ForegroundRequest>>,
    engine: &State<Arc<JobEngine>>,
) -> Result<Json<JobCreatedResponse>> {
    let foreground = body.map(|b| b.foreground).unwrap_or(false);
    let job_id = engine
        .submit(
            JobType::InstallSteamcmd,
            serde_json::json!({ "foreground": foreground }),
        )
        .await?;
    Ok(Json(JobCreatedResponse { job_id }))
}

#[post("/provisioning/install-asa-binaries", data = "<body>")]
pub async fn install_asa_binaries(
    _user: AdminUser,
    body: Option<Json<ForegroundRequest>>,
    engine: &State<Arc<JobEngine>>,
) -> Result<Json<JobCreatedResponse>> {
    let foreground = body.map(|b| b.foreground).unwrap_or(false);
    let job_id = engine
        .submit(
            JobType::InstallAsaBinaries,
            serde_json::json!({ "foreground": foreground }),
        )
        .await?;
    Ok(Json(JobCreatedResponse { job_id }))
}

#[post("/provisioning/servers/<name>/update", data = "<body>")]
pub async fn update_server(
    _user: AdminUser,
    name: &str,
    body: Option<Json<ForegroundRequest>>,
    supervisor: &State<Arc<ProcessSupervisor>>,
    engine: &State<Arc<JobEngine>>,
) -> Result<Json<JobCreatedResponse>> {
    supervisor.effective_config(name).await?;
    let foreground = body.map(|b| b.foreground).unwrap_or(false);
    let job_id = engine
        .submit(
            JobType::UpdateServer,
            serde_json::json!({ "serverName": name, "foreground": foreground }),
        )
        .await?;
    Ok(Json(JobCreatedResponse { job_id }))
}

#[post("/provisioning/update-all", data = "<body>")]
pub async fn update_all(
    _user: AdminUser,
    body: Option<Json<ForegroundRequest>>,
    engine: &State<Arc<JobEngine>>,
) -> Result<Json<JobCreatedResponse>> {
    let foreground = body.map(|b| b.foreground).unwrap_or(false);
    let job_id = engine
        .submit(
            JobType::UpdateAll,
            serde_json::json!({ "foreground": foreground }),
        )
        .await?;
    Ok(Json(JobCreatedResponse { job_id }))
}

/// Mod changes invalidate every member's start script; regeneration keeps
/// the scripts in lockstep with configuration.
async fn regenerate_cluster_scripts(
    cluster: &ClusterConfig,
    layout: &State<Arc<Layout>>,
    supervisor: &State<Arc<ProcessSupervisor>>,
) {
    for server in &cluster.servers {
        match supervisor.resolved_mods(server, Some(cluster)) {
            Ok(mods) => {
                if let Err(e) = layout.write_start_script(server, Some(cluster), &mods).await {
                    warn!(
                        "failed to regenerate start script for '{}': {:?}",
                        server.name, e
                    );
                }
            }
            Err(e) => warn!("failed to resolve mods for '{}': {:?}", server.name, e),
        }
    }
}
