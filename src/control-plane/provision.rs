use std::sync::Arc;

use chrono::Utc;
use log::{info, warn};
use rand::Rng;

use crate::db::Store;
use crate::error::{Error, Result};
use crate::jobs::JobContext;
use crate::layout::Layout;
use crate::model::{ClusterConfig, ClusterInput, ServerConfig, ServerSpec};
use crate::resolve::{self, PortTriple};
use crate::steamcmd::SteamCmd;
use crate::supervisor::ProcessSupervisor;

/// Orchestrates cluster creation and deletion, and binary updates. Every
/// step is a checkpoint: on failure the name of the failed checkpoint lands
/// in the job result and the filesystem is left in a state a retry can
/// resume from (directory and config writes are overwrite-safe, `app_update`
/// is idempotent).
pub struct Provisioner {
    store: Arc<Store>,
    layout: Arc<Layout>,
    steamcmd: Arc<SteamCmd>,
    supervisor: Arc<ProcessSupervisor>,
}

impl Provisioner {
    pub fn new(
        store: Arc<Store>,
        layout: Arc<Layout>,
        steamcmd: Arc<SteamCmd>,
        supervisor: Arc<ProcessSupervisor>,
    ) -> Provisioner {
        Provisioner {
            store,
            layout,
            steamcmd,
            supervisor,
        }
    }

    pub async fn create_cluster(
        &self,
        input: ClusterInput,
        foreground: bool,
        ctx: &JobContext,
    ) -> Result<serde_json::Value> {
        let checkpoint = |name: &str, e: Error| -> Error {
            ctx.set_result(serde_json::json!({ "failedCheckpoint": name }));
            e
        };

        // validate
        ctx.progress(2, "validating input");
        let existing = self.store.list_server_configs()?;
        let known_maps = self.store.list_maps()?;
        resolve::validate_cluster_input(&input, &existing, &known_maps)
            .map_err(|e| checkpoint("validate", e))?;
        self.check_cluster_unique(&input)
            .await
            .map_err(|e| checkpoint("validate", e))?;

        // allocate ports
        ctx.progress(4, "allocating ports");
        let triples =
            resolve::allocate_ports(&input, &existing).map_err(|e| checkpoint("allocate-ports", e))?;

        let cluster = build_cluster(&input, &triples);

        // directory layout
        ctx.progress(6, "creating directory layout");
        for server in &cluster.servers {
            self.layout
                .create_server_dirs(server)
                .await
                .map_err(|e| checkpoint("layout", e))?;
        }

        // cluster.json, server-config.json, INI files
        ctx.progress(8, "writing configuration files");
        self.layout
            .write_cluster_config(&cluster)
            .await
            .map_err(|e| checkpoint("write-configs", e))?;
        for server in &cluster.servers {
            self.layout
                .write_server_config_file(server)
                .await
                .map_err(|e| checkpoint("write-configs", e))?;
            self.layout
                .write_ini_files(server, Some(&cluster))
                .await
                .map_err(|e| checkpoint("write-configs", e))?;
        }

        // SteamCMD
        ctx.progress(10, "ensuring SteamCMD");
        self.steamcmd
            .ensure_installed(foreground)
            .await
            .map_err(|e| checkpoint("steamcmd", e))?;

        // ASA binaries, strictly sequential across servers: concurrent
        // SteamCMD runs fight over file locks and Steam client state.
        let total = cluster.servers.len() as u64;
        for (i, server) in cluster.servers.iter().enumerate() {
            ctx.check_cancelled()?;
            let base = 10 + (i as u64 * 80 / total) as u8;
            let span = (80 / total).max(1) as u8;
            ctx.progress(
                base,
                format!("installing binaries for {} ({}/{})", server.name, i + 1, total),
            );
            // (i/N, inner%) folded onto the job's 10..90 band
            self.steamcmd
                .install_or_update_asa(
                    &self.layout.binaries_dir(server),
                    foreground,
                    &progress_forwarder(ctx, base, base.saturating_add(span)),
                    ctx.cancel_token(),
                )
                .await
                .map_err(|e| checkpoint("install-binaries", e))?;
        }

        // start scripts
        ctx.progress(92, "generating start scripts");
        for server in &cluster.servers {
            let mods = self.resolved_mods(server, &cluster)?;
            self.layout
                .write_start_script(server, Some(&cluster), &mods)
                .await
                .map_err(|e| checkpoint("start-scripts", e))?;
        }

        // persist
        ctx.progress(96, "persisting server configurations");
        for server in &cluster.servers {
            self.store
                .upsert_server_config(server)
                .map_err(|e| checkpoint("persist", e))?;
        }

        info!(
            "cluster '{}' provisioned with {} servers",
            cluster.name,
            cluster.servers.len()
        );
        Ok(serde_json::json!({
            "cluster": cluster.name,
            "servers": cluster.servers.iter().map(|s| s.name.clone()).collect::<Vec<_>>(),
        }))
    }

    /// Deletion reverses creation: stop members, drop store rows, then
    /// best-effort removal of the cluster tree.
    pub async fn delete_cluster(&self, cluster_name: &str, ctx: &JobContext) -> Result<serde_json::Value> {
        let cluster = self.layout.read_cluster_config(cluster_name).await?;

        ctx.progress(10, "stopping member servers");
        for server in &cluster.servers {
            ctx.check_cancelled()?;
            self.supervisor.stop(&server.name, true, 30).await?;
        }

        ctx.progress(60, "removing server configurations");
        for server in &cluster.servers {
            self.store.delete_server_config(&server.name)?;
        }

        ctx.progress(80, "removing cluster directory");
        let failed_paths = self.layout.remove_cluster_dir(cluster_name).await;
        if !failed_paths.is_empty() {
            warn!(
                "cluster '{}' deleted with {} paths left behind",
                cluster_name,
                failed_paths.len()
            );
        }

        Ok(serde_json::json!({
            "cluster": cluster_name,
            "unremovedPaths": failed_paths
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>(),
        }))
    }

    pub async fn update_server(
        &self,
        server_name: &str,
        foreground: bool,
        ctx: &JobContext,
    ) -> Result<serde_json::Value> {
        let (config, _cluster) = self.supervisor.effective_config(server_name).await?;
        self.steamcmd.ensure_installed(foreground).await?;

        ctx.progress(5, format!("updating binaries for {}", server_name));
        self.steamcmd
            .install_or_update_asa(
                &self.layout.binaries_dir(&config),
                foreground,
                &progress_forwarder(ctx, 5, 95),
                ctx.cancel_token(),
            )
            .await?;

        Ok(serde_json::json!({ "server": server_name }))
    }

    /// Sequential update across the whole fleet, cancellable between
    /// servers.
    pub async fn update_all(&self, foreground: bool, ctx: &JobContext) -> Result<serde_json::Value> {
        let configs = self.store.list_server_configs()?;
        if configs.is_empty() {
            return Ok(serde_json::json!({ "servers": [] }));
        }
        self.steamcmd.ensure_installed(foreground).await?;

        let total = configs.len() as u64;
        let mut updated = Vec::new();
        for (i, config) in configs.iter().enumerate() {
            ctx.check_cancelled()?;
            let base = (i as u64 * 100 / total) as u8;
            let span = (100 / total).max(1) as u8;
            ctx.progress(
                base,
                format!("updating {} ({}/{})", config.name, i + 1, total),
            );
            self.steamcmd
                .install_or_update_asa(
                    &self.layout.binaries_dir(config),
                    foreground,
                    &progress_forwarder(ctx, base, base.saturating_add(span)),
                    ctx.cancel_token(),
                )
                .await?;
            updated.push(config.name.clone());
        }

        Ok(serde_json::json!({ "servers": updated }))
    }

    pub async fn install_steamcmd(
        &self,
        foreground: bool,
        ctx: &JobContext,
    ) -> Result<serde_json::Value> {
        ctx.progress(10, "locating or downloading SteamCMD");
        let exe = self.steamcmd.ensure_installed(foreground).await?;
        Ok(serde_json::json!({ "steamcmd": exe.display().to_string() }))
    }

    /// Installs ASA binaries into the shared tree used by shared-install
    /// deployments.
    pub async fn install_asa_binaries(
        &self,
        foreground: bool,
        ctx: &JobContext,
    ) -> Result<serde_json::Value> {
        self.steamcmd.ensure_installed(foreground).await?;
        ctx.progress(5, "installing shared ASA binaries");
        let target = self.layout.shared_binaries_dir();
        self.steamcmd
            .install_or_update_asa(
                &target,
                foreground,
                &progress_forwarder(ctx, 5, 100),
                ctx.cancel_token(),
            )
            .await?;
        Ok(serde_json::json!({ "target": target.display().to_string() }))
    }

    fn resolved_mods(&self, server: &ServerConfig, cluster: &ClusterConfig) -> Result<Vec<String>> {
        let exclude_shared = self
            .store
            .get_server_settings(&server.name)?
            .map(|s| s.exclude_shared_mods)
            .unwrap_or(false);
        let shared = self.store.list_shared_mods()?;
        let server_mods = self.store.list_server_mods(&server.name)?;
        Ok(resolve::resolve_mods(
            Some(cluster),
            &server.name,
            exclude_shared,
            &shared,
            &server_mods,
        ))
    }

    /// Cluster name and clusterId must be unique per host.
    async fn check_cluster_unique(&self, input: &ClusterInput) -> Result<()> {
        for cluster in self.layout.list_disk_clusters().await? {
            if cluster.name == input.name {
                return Err(Error::Conflict(format!(
                    "cluster '{}' already exists",
                    input.name
                )));
            }
            if !input.cluster_settings.cluster_id.is_empty()
                && cluster.cluster_settings.cluster_id == input.cluster_settings.cluster_id
            {
                return Err(Error::Conflict(format!(
                    "clusterId '{}' is already used by cluster '{}'",
                    input.cluster_settings.cluster_id, cluster.name
                )));
            }
        }
        Ok(())
    }
}

fn progress_forwarder<'a>(
    ctx: &'a JobContext,
    base: u8,
    cap: u8,
) -> impl Fn(u8, String) + Send + Sync + 'a {
    move |inner, message| {
        let span = cap.saturating_sub(base) as u64;
        let overall = base + ((inner as u64 * span) / 100) as u8;
        ctx.progress(overall.min(cap), message);
    }
}

fn build_cluster(input: &ClusterInput, triples: &[PortTriple]) -> ClusterConfig {
    let mut cluster_settings = input.cluster_settings.clone();
    if cluster_settings.cluster_id.is_empty() {
        cluster_settings.cluster_id = input.name.clone();
    }
    if cluster_settings.cluster_name.is_empty() {
        cluster_settings.cluster_name = input.name.clone();
    }

    let servers = input
        .servers
        .iter()
        .zip(triples)
        .map(|(spec, ports)| build_server(spec, ports, &input.name))
        .collect();

    ClusterConfig {
        name: input.name.clone(),
        description: input.description.clone(),
        created_at: Utc::now(),
        global_settings: input.global_settings.clone(),
        cluster_settings,
        port_configuration: input.port_configuration(),
        servers,
        mod_management: input.mod_management.clone(),
    }
}

fn build_server(spec: &ServerSpec, ports: &PortTriple, cluster_name: &str) -> ServerConfig {
    ServerConfig {
        name: spec.name.clone(),
        cluster_name: Some(cluster_name.to_owned()),
        map: spec.map.clone(),
        port: ports.port,
        query_port: ports.query_port,
        rcon_port: ports.rcon_port,
        max_players: spec.max_players.unwrap_or(70),
        admin_password: spec
            .admin_password
            .clone()
            .unwrap_or_else(random_password),
        server_password: spec.server_password.clone().filter(|p| !p.is_empty()),
        rcon_password: spec.rcon_password.clone().unwrap_or_else(random_password),
        disable_battle_eye: spec.disable_battle_eye,
        game_user_settings: spec.game_user_settings.clone(),
        game_ini: spec.game_ini.clone(),
        launch_parameters: Default::default(),
        created_at: Utc::now(),
    }
}

/// 12-char alphanumeric, same shape as the default RCON credentials the
/// fleet tooling has always generated.
fn random_password() -> String {
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(12)
        .map(char::from)
        .collect()
}
