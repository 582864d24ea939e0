use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use log::{error, info, warn};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::process::Command;
use tokio::sync::RwLock;

use arkctrl::schema::{
    ServerPorts, ServerState, ServerStatusDetail, ServerSummary, SystemResources,
};

use crate::chat::ChatPoller;
use crate::consts::{EXIT_POLL_INTERVAL, START_GRACE_PERIOD};
use crate::db::Store;
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::model::{ClusterConfig, ServerConfig};
use crate::rcon::{RconEndpoint, RconPool};
use crate::resolve;

#[derive(Clone, Debug)]
struct Runtime {
    state: ServerState,
    pid: Option<u32>,
    started_at: Option<DateTime<Utc>>,
}

impl Default for Runtime {
    fn default() -> Self {
        Runtime {
            state: ServerState::Stopped,
            pid: None,
            started_at: None,
        }
    }
}

/// Starts, stops and watches native ASA server processes. The generated
/// start script is the sole launch path and is rewritten before every
/// start, so a stale script can never be executed.
pub struct ProcessSupervisor {
    store: Arc<Store>,
    layout: Arc<Layout>,
    rcon: Arc<RconPool>,
    chat: Arc<ChatPoller>,
    runtimes: Arc<RwLock<HashMap<String, Runtime>>>,
    sysinfo: Arc<StdMutex<System>>,
}

impl ProcessSupervisor {
    pub fn new(
        store: Arc<Store>,
        layout: Arc<Layout>,
        rcon: Arc<RconPool>,
        chat: Arc<ChatPoller>,
    ) -> Arc<ProcessSupervisor> {
        let supervisor = Arc::new(ProcessSupervisor {
            store,
            layout,
            rcon,
            chat,
            runtimes: Arc::new(RwLock::new(HashMap::new())),
            sysinfo: Arc::new(StdMutex::new(System::new())),
        });

        // Exit watcher: bounded detection latency for processes that die
        // outside of a stop() call.
        let watcher = Arc::clone(&supervisor);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(EXIT_POLL_INTERVAL).await;
                watcher.reap_exited().await;
            }
        });

        supervisor
    }

    // ***********************
    // Configuration discovery
    // ***********************

    /// Dual-source server lookup: the store is authoritative, disk cluster
    /// configs cover cold-start recovery of older deployments. On conflict
    /// the store wins with a warning.
    pub async fn effective_config(
        &self,
        server_name: &str,
    ) -> Result<(ServerConfig, Option<ClusterConfig>)> {
        let from_store = self.store.get_server_config(server_name)?;
        let disk_clusters = self.layout.list_disk_clusters().await?;
        let from_disk = disk_clusters
            .iter()
            .find(|c| c.server(server_name).is_some())
            .cloned();

        let config = match (&from_store, &from_disk) {
            (Some(store_config), Some(disk_cluster)) => {
                let disk_config = disk_cluster.server(server_name).cloned();
                if disk_config.as_ref() != Some(store_config) {
                    warn!(
                        "server '{}' differs between store and disk, using store",
                        server_name
                    );
                }
                store_config.clone()
            }
            (Some(store_config), None) => store_config.clone(),
            (None, Some(disk_cluster)) => {
                info!(
                    "server '{}' found only in cluster.json on disk, importing",
                    server_name
                );
                disk_cluster
                    .server(server_name)
                    .cloned()
                    .expect("membership checked above")
            }
            (None, None) => return Err(Error::NotFound(format!("server '{}'", server_name))),
        };

        let cluster = match &config.cluster_name {
            Some(cluster_name) => match self.layout.read_cluster_config(cluster_name).await {
                Ok(cluster) => Some(cluster),
                Err(Error::NotFound(_)) => None,
                Err(e) => return Err(e),
            },
            None => None,
        };

        Ok((config, cluster))
    }

    pub fn resolved_mods(
        &self,
        config: &ServerConfig,
        cluster: Option<&ClusterConfig>,
    ) -> Result<Vec<String>> {
        let exclude_shared = self
            .store
            .get_server_settings(&config.name)?
            .map(|s| s.exclude_shared_mods)
            .unwrap_or(false);
        let shared = self.store.list_shared_mods()?;
        let server_mods = self.store.list_server_mods(&config.name)?;
        Ok(resolve::resolve_mods(
            cluster,
            &config.name,
            exclude_shared,
            &shared,
            &server_mods,
        ))
    }

    pub fn rcon_endpoint(config: &ServerConfig) -> RconEndpoint {
        RconEndpoint {
            addr: format!("127.0.0.1:{}", config.rcon_port),
            password: config.rcon_password.clone(),
        }
    }

    // ***********************
    // Lifecycle
    // ***********************

    pub async fn start(&self, server_name: &str) -> Result<()> {
        {
            let runtimes = self.runtimes.read().await;
            if let Some(runtime) = runtimes.get(server_name) {
                match runtime.state {
                    ServerState::Stopped | ServerState::Failed => {}
                    state => {
                        return Err(Error::Precondition(format!(
                            "server '{}' is {}",
                            server_name, state
                        )))
                    }
                }
            }
        }

        let (config, cluster) = self.effective_config(server_name).await?;

        {
            let mut runtimes = self.runtimes.write().await;
            let runtime = runtimes.entry(server_name.to_owned()).or_default();
            runtime.state = ServerState::Starting;
            runtime.pid = None;
        }
        info!("server '{}' -> starting", server_name);

        match self.launch(&config, cluster.as_ref()).await {
            Ok(pid) => {
                {
                    let mut runtimes = self.runtimes.write().await;
                    let runtime = runtimes.entry(server_name.to_owned()).or_default();
                    runtime.state = ServerState::Running;
                    runtime.pid = Some(pid);
                    runtime.started_at = Some(Utc::now());
                }
                self.chat
                    .start(server_name, ProcessSupervisor::rcon_endpoint(&config))
                    .await;
                info!("server '{}' is running with pid {}", server_name, pid);
                Ok(())
            }
            Err(e) => {
                {
                    let mut runtimes = self.runtimes.write().await;
                    let runtime = runtimes.entry(server_name.to_owned()).or_default();
                    runtime.state = ServerState::Failed;
                    runtime.pid = None;
                }
                error!("failed to start server '{}': {:?}", server_name, e);
                Err(e)
            }
        }
    }

    async fn launch(&self, config: &ServerConfig, cluster: Option<&ClusterConfig>) -> Result<u32> {
        if !self.layout.server_exe_path(config).is_file() {
            return Err(Error::ProcessFailed(format!(
                "{} not found for server '{}', are the binaries installed?",
                crate::consts::ASA_SERVER_EXE,
                config.name
            )));
        }

        // Mandatory regeneration: config changes always reach the script.
        let mods = self.resolved_mods(config, cluster)?;
        self.layout.write_ini_files(config, cluster).await?;
        self.layout.write_start_script(config, cluster, &mods).await?;

        let script = self.layout.start_script_path(config);
        let mut cmd = if cfg!(windows) {
            let mut c = Command::new("cmd");
            c.arg("/C").arg(&script);
            c
        } else {
            let mut c = Command::new("sh");
            c.arg(&script);
            c
        };
        cmd.current_dir(self.layout.server_dir(config));
        cmd.stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::ProcessFailed(format!("failed to spawn start script: {}", e)))?;

        // The script detaches the real server process, so wait for the
        // executable to appear rather than watching the script shell.
        let deadline = tokio::time::Instant::now() + START_GRACE_PERIOD;
        loop {
            if let Some(pid) = self.find_server_process(config) {
                // the wrapper shell is done with its job either way
                let _ = child.try_wait();
                return Ok(pid);
            }
            if tokio::time::Instant::now() >= deadline {
                let _ = child.kill().await;
                return Err(Error::ProcessFailed(format!(
                    "server '{}' did not come up within {:?}",
                    config.name, START_GRACE_PERIOD
                )));
            }
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        }
    }

    /// Idempotent stop. Calling it on a server that is not running returns
    /// without error and leaves the state untouched.
    pub async fn stop(&self, server_name: &str, graceful: bool, grace_seconds: u64) -> Result<()> {
        let current = {
            let runtimes = self.runtimes.read().await;
            runtimes.get(server_name).cloned().unwrap_or_default()
        };

        match current.state {
            ServerState::Running | ServerState::Starting => {}
            ServerState::Stopping => return Ok(()),
            ServerState::Stopped | ServerState::Failed => return Ok(()),
        }

        {
            let mut runtimes = self.runtimes.write().await;
            if let Some(runtime) = runtimes.get_mut(server_name) {
                runtime.state = ServerState::Stopping;
            }
        }
        info!("server '{}' -> stopping", server_name);
        self.chat.stop(server_name).await;

        let config = self.store.get_server_config(server_name)?;

        if graceful {
            if let Some(config) = &config {
                let endpoint = ProcessSupervisor::rcon_endpoint(config);
                // SaveWorld before DoExit, ordered on the same connection
                for command in ["SaveWorld", "DoExit"] {
                    if let Err(e) = self.rcon.send(server_name, &endpoint, command).await {
                        warn!(
                            "graceful stop: '{}' on '{}' failed: {:?}",
                            command, server_name, e
                        );
                    }
                }
            }

            let deadline =
                tokio::time::Instant::now() + std::time::Duration::from_secs(grace_seconds);
            while tokio::time::Instant::now() < deadline {
                match current.pid {
                    Some(pid) if self.process_exists(pid) => {
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await
                    }
                    _ => break,
                }
            }
        }

        if let Some(pid) = current.pid {
            if self.process_exists(pid) {
                info!("terminating server '{}' (pid {})", server_name, pid);
                self.kill_process(pid);
            }
        }

        self.rcon.evict(server_name).await;
        {
            let mut runtimes = self.runtimes.write().await;
            let runtime = runtimes.entry(server_name.to_owned()).or_default();
            runtime.state = ServerState::Stopped;
            runtime.pid = None;
        }
        info!("server '{}' stopped", server_name);
        Ok(())
    }

    pub async fn restart(
        &self,
        server_name: &str,
        graceful: bool,
        grace_seconds: u64,
    ) -> Result<()> {
        self.stop(server_name, graceful, grace_seconds).await?;
        self.start(server_name).await
    }

    // ***********************
    // Introspection
    // ***********************

    pub async fn status(&self, server_name: &str) -> ServerStatusDetail {
        let runtimes = self.runtimes.read().await;
        let runtime = runtimes.get(server_name).cloned().unwrap_or_default();
        ServerStatusDetail {
            state: runtime.state,
            pid: runtime.pid,
            uptime_seconds: runtime
                .started_at
                .filter(|_| runtime.state == ServerState::Running)
                .map(|t| (Utc::now() - t).num_seconds()),
        }
    }

    /// Fleet listing over the union of store and disk configurations.
    pub async fn list(&self) -> Result<Vec<ServerSummary>> {
        let mut configs = self.store.list_server_configs()?;

        for cluster in self.layout.list_disk_clusters().await? {
            for server in &cluster.servers {
                if !configs.iter().any(|c| c.name == server.name) {
                    warn!(
                        "server '{}' only exists in cluster.json on disk, listing it anyway",
                        server.name
                    );
                    configs.push(server.clone());
                }
            }
        }

        let runtimes = self.runtimes.read().await;
        let mut summaries = Vec::with_capacity(configs.len());
        for config in configs {
            let runtime = runtimes.get(&config.name).cloned().unwrap_or_default();
            let cluster = match &config.cluster_name {
                Some(name) => self.layout.read_cluster_config(name).await.ok(),
                None => None,
            };
            let mods = self.resolved_mods(&config, cluster.as_ref())?;
            summaries.push(ServerSummary {
                name: config.name.clone(),
                cluster_name: config.cluster_name.clone(),
                map: config.map.clone(),
                status: runtime.state,
                pid: runtime.pid,
                ports: ServerPorts {
                    port: config.port,
                    query_port: config.query_port,
                    rcon_port: config.rcon_port,
                },
                disable_battle_eye: config.disable_battle_eye,
                mod_count: mods.len(),
            });
        }
        Ok(summaries)
    }

    pub fn system_resources(&self) -> SystemResources {
        let mut sys = self.sysinfo.lock().unwrap_or_else(|e| e.into_inner());
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        SystemResources {
            cpu_total: sys.global_cpu_usage(),
            cpus: sys.cpus().iter().map(|cpu| cpu.cpu_usage()).collect(),
            mem_total_bytes: sys.total_memory(),
            mem_used_bytes: sys.used_memory(),
        }
    }

    // ***********************
    // Process plumbing
    // ***********************

    async fn reap_exited(&self) {
        let running: Vec<(String, u32)> = {
            let runtimes = self.runtimes.read().await;
            runtimes
                .iter()
                .filter(|(_, r)| r.state == ServerState::Running)
                .filter_map(|(name, r)| r.pid.map(|pid| (name.clone(), pid)))
                .collect()
        };

        for (name, pid) in running {
            if !self.process_exists(pid) {
                warn!(
                    "server '{}' (pid {}) exited outside of a stop request",
                    name, pid
                );
                self.chat.stop(&name).await;
                self.rcon.evict(&name).await;
                {
                    let mut runtimes = self.runtimes.write().await;
                    if let Some(runtime) = runtimes.get_mut(&name) {
                        runtime.state = ServerState::Failed;
                        runtime.pid = None;
                    }
                }
            }
        }
    }

    fn find_server_process(&self, config: &ServerConfig) -> Option<u32> {
        let binaries = self.layout.binaries_dir(config);
        let binaries_str = binaries.to_string_lossy().to_string();
        let mut sys = self.sysinfo.lock().unwrap_or_else(|e| e.into_inner());
        sys.refresh_processes(ProcessesToUpdate::All, true);
        sys.processes().iter().find_map(|(pid, process)| {
            let exe = process.exe()?;
            let exe_str = exe.to_string_lossy();
            (exe_str.starts_with(binaries_str.as_str())
                && exe_str.ends_with(crate::consts::ASA_SERVER_EXE))
            .then(|| pid.as_u32())
        })
    }

    fn process_exists(&self, pid: u32) -> bool {
        let mut sys = self.sysinfo.lock().unwrap_or_else(|e| e.into_inner());
        sys.refresh_processes(ProcessesToUpdate::All, true);
        sys.process(Pid::from_u32(pid)).is_some()
    }

    fn kill_process(&self, pid: u32) {
        let sys = self.sysinfo.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(process) = sys.process(Pid::from_u32(pid)) {
            if !process.kill() {
                warn!("kill signal to pid {} was not delivered", pid);
            }
        }
    }

    #[cfg(test)]
    pub async fn force_state_for_tests(&self, server_name: &str, state: ServerState) {
        let mut runtimes = self.runtimes.write().await;
        let runtime = runtimes.entry(server_name.to_owned()).or_default();
        runtime.state = state;
    }
}
