use std::path::{Path, PathBuf};

use log::{info, warn};
use tokio::fs;

use crate::consts::*;
use crate::error::{Error, Result};
use crate::ini::IniDocument;
use crate::model::{settings_to_ini, ClusterConfig, ServerConfig};
use crate::resolve;

/// Owns the on-disk tree under the configured base directory:
///
/// ```text
/// baseDir/
///   steamcmd/
///   shared-binaries/
///   clusters/<clusterName>/{cluster.json, <serverName>/...}
///   servers/<individualName>/...
/// ```
pub struct Layout {
    base_dir: PathBuf,
}

impl Layout {
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Layout {
        Layout {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn steamcmd_dir(&self) -> PathBuf {
        self.base_dir.join("steamcmd")
    }

    pub fn shared_binaries_dir(&self) -> PathBuf {
        self.base_dir.join("shared-binaries")
    }

    pub fn clusters_dir(&self) -> PathBuf {
        self.base_dir.join("clusters")
    }

    pub fn cluster_dir(&self, cluster_name: &str) -> PathBuf {
        self.clusters_dir().join(cluster_name)
    }

    pub fn cluster_config_path(&self, cluster_name: &str) -> PathBuf {
        self.cluster_dir(cluster_name).join(CLUSTER_CONFIG_FILE)
    }

    pub fn individual_servers_dir(&self) -> PathBuf {
        self.base_dir.join("servers")
    }

    pub fn server_dir(&self, server: &ServerConfig) -> PathBuf {
        match &server.cluster_name {
            Some(cluster) => self.cluster_dir(cluster).join(&server.name),
            None => self.individual_servers_dir().join(&server.name),
        }
    }

    pub fn binaries_dir(&self, server: &ServerConfig) -> PathBuf {
        self.server_dir(server).join("binaries")
    }

    pub fn configs_dir(&self, server: &ServerConfig) -> PathBuf {
        self.server_dir(server).join("configs")
    }

    pub fn saves_dir(&self, server: &ServerConfig) -> PathBuf {
        self.server_dir(server).join("saves")
    }

    pub fn logs_dir(&self, server: &ServerConfig) -> PathBuf {
        self.server_dir(server).join("logs")
    }

    pub fn start_script_path(&self, server: &ServerConfig) -> PathBuf {
        self.server_dir(server).join(START_SCRIPT_FILE)
    }

    pub fn server_config_path(&self, server: &ServerConfig) -> PathBuf {
        self.server_dir(server).join(SERVER_CONFIG_FILE)
    }

    pub fn server_exe_path(&self, server: &ServerConfig) -> PathBuf {
        self.win64_dir(server).join(ASA_SERVER_EXE)
    }

    pub fn win64_dir(&self, server: &ServerConfig) -> PathBuf {
        self.binaries_dir(server)
            .join("ShooterGame")
            .join("Binaries")
            .join("Win64")
    }

    pub fn update_lock_sentinel(&self) -> PathBuf {
        self.base_dir.join(UPDATE_LOCK_SENTINEL)
    }

    pub fn db_path(&self) -> PathBuf {
        self.base_dir.join(DB_FILE_NAME)
    }

    /// Creates the root directories. Failure here is fatal at startup.
    pub fn ensure_base(&self) -> Result<()> {
        for dir in [
            self.base_dir.clone(),
            self.steamcmd_dir(),
            self.clusters_dir(),
            self.individual_servers_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Creates the per-server subtree. Overwrite-safe: re-running on a
    /// partially provisioned tree is a no-op for existing directories.
    pub async fn create_server_dirs(&self, server: &ServerConfig) -> Result<()> {
        for dir in [
            self.binaries_dir(server),
            self.configs_dir(server),
            self.saves_dir(server),
            self.logs_dir(server),
        ] {
            fs::create_dir_all(&dir).await?;
        }
        Ok(())
    }

    // ***********************
    // cluster.json / server-config.json
    // ***********************

    pub async fn write_cluster_config(&self, cluster: &ClusterConfig) -> Result<()> {
        fs::create_dir_all(self.cluster_dir(&cluster.name)).await?;
        let json = serde_json::to_string_pretty(cluster)?;
        fs::write(self.cluster_config_path(&cluster.name), json).await?;
        Ok(())
    }

    pub async fn read_cluster_config(&self, cluster_name: &str) -> Result<ClusterConfig> {
        let path = self.cluster_config_path(cluster_name);
        let content = fs::read_to_string(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(format!("cluster '{}'", cluster_name))
            } else {
                e.into()
            }
        })?;
        ClusterConfig::from_json(serde_json::from_str(&content)?)
    }

    /// Scans `clusters/*/cluster.json`. Unreadable entries are skipped with
    /// a warning so one corrupt file cannot hide the rest of the fleet.
    pub async fn list_disk_clusters(&self) -> Result<Vec<ClusterConfig>> {
        let mut clusters = Vec::new();
        let mut entries = match fs::read_dir(self.clusters_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(clusters),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                match self.read_cluster_config(name).await {
                    Ok(cluster) => clusters.push(cluster),
                    Err(Error::NotFound(_)) => {}
                    Err(e) => warn!("skipping unreadable cluster '{}': {:?}", name, e),
                }
            }
        }
        Ok(clusters)
    }

    pub async fn write_server_config_file(&self, server: &ServerConfig) -> Result<()> {
        fs::create_dir_all(self.server_dir(server)).await?;
        let json = serde_json::to_string_pretty(server)?;
        fs::write(self.server_config_path(server), json).await?;
        Ok(())
    }

    // ***********************
    // INI files
    // ***********************

    /// Writes `GameUserSettings.ini`, `Game.ini` and `Engine.ini` from the
    /// effective (cluster-merged) settings.
    pub async fn write_ini_files(
        &self,
        server: &ServerConfig,
        cluster: Option<&ClusterConfig>,
    ) -> Result<()> {
        let configs = self.configs_dir(server);
        fs::create_dir_all(&configs).await?;

        let gus = self.effective_game_user_settings(server, cluster);
        fs::write(configs.join("GameUserSettings.ini"), gus.stringify()).await?;

        let game_ini = effective_doc(server, cluster, |s| &s.game_ini, |c| {
            &c.global_settings.game_ini
        });
        fs::write(configs.join("Game.ini"), game_ini.stringify()).await?;

        let engine_path = configs.join("Engine.ini");
        if !engine_path.exists() {
            fs::write(engine_path, "").await?;
        }

        Ok(())
    }

    fn effective_game_user_settings(
        &self,
        server: &ServerConfig,
        cluster: Option<&ClusterConfig>,
    ) -> IniDocument {
        let mut doc = IniDocument::default();
        doc.set(
            "ServerSettings",
            "ServerAdminPassword",
            server.admin_password.as_str(),
        );
        if let Some(password) = &server.server_password {
            doc.set("ServerSettings", "ServerPassword", password.as_str());
        }
        doc.set("ServerSettings", "RCONEnabled", "True");
        doc.set("ServerSettings", "RCONPort", server.rcon_port.to_string());
        doc.set("SessionSettings", "SessionName", server.name.as_str());
        doc.set("SessionSettings", "Port", server.port.to_string());
        doc.set("SessionSettings", "QueryPort", server.query_port.to_string());
        doc.set(
            "/Script/Engine.GameSession",
            "MaxPlayers",
            server.max_players.to_string(),
        );

        let overrides = effective_doc(server, cluster, |s| &s.game_user_settings, |c| {
            &c.global_settings.game_user_settings
        });
        doc.merge(&overrides)
    }

    pub async fn read_config_file(&self, server: &ServerConfig, file: &str) -> Result<String> {
        let path = self.config_file_path(server, file)?;
        match fs::read_to_string(&path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("config file '{}'", file)))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn write_config_file(
        &self,
        server: &ServerConfig,
        file: &str,
        content: &str,
    ) -> Result<()> {
        let path = self.config_file_path(server, file)?;
        fs::create_dir_all(self.configs_dir(server)).await?;
        fs::write(path, content).await?;
        Ok(())
    }

    fn config_file_path(&self, server: &ServerConfig, file: &str) -> Result<PathBuf> {
        match file {
            "GameUserSettings.ini" | "Game.ini" | "Engine.ini" => {
                Ok(self.configs_dir(server).join(file))
            }
            other => Err(Error::Validation(format!(
                "file: '{}' is not an editable config file",
                other
            ))),
        }
    }

    // ***********************
    // Startup script
    // ***********************

    /// Renders the startup script. Deterministic: identical effective config
    /// yields byte-identical output. The script is the sole launch path and
    /// is regenerated on every start and on every config write.
    pub fn generate_start_script(
        &self,
        server: &ServerConfig,
        cluster: Option<&ClusterConfig>,
        mods: &[String],
    ) -> String {
        let mut compound = format!(
            "{}?listen?SessionName={}",
            server.map, server.name
        );
        if let Some(password) = &server.server_password {
            if !password.is_empty() {
                compound.push_str(&format!("?ServerPassword={}", password));
            }
        }
        compound.push_str(&format!(
            "?ServerAdminPassword={}?MaxPlayers={}",
            server.admin_password, server.max_players
        ));
        compound.push_str(&format!(
            "?Port={}?QueryPort={}?RCONEnabled=True?RCONPort={}",
            server.port, server.query_port, server.rcon_port
        ));
        for (key, value) in &server.launch_parameters {
            compound.push_str(&format!("?{}={}", key, value));
        }
        if let Some(cluster) = cluster {
            let cs = &cluster.cluster_settings;
            compound.push_str(&format!("?ClusterId={}", cs.cluster_id));
            if !cs.cluster_name.is_empty() {
                compound.push_str(&format!("?ClusterName={}", cs.cluster_name));
            }
            if !cs.cluster_password.is_empty() {
                compound.push_str(&format!("?ClusterPassword={}", cs.cluster_password));
            }
        }
        compound.push_str(&format!("?AltSaveDirectoryName={}", server.name));

        let mut flags = String::from("-server -log");
        if server.disable_battle_eye {
            flags.push_str(" -NoBattleEye");
        }
        if !mods.is_empty() {
            flags.push_str(&format!(" -mods={}", mods.join(",")));
        }

        let mut script = String::new();
        script.push_str("@echo off\r\n");
        script.push_str("rem Generated by arkctrl. Do not edit; this file is rewritten on every start and config change.\r\n");
        script.push_str(&format!(
            "cd /d \"{}\"\r\n\r\n",
            self.win64_dir(server).display()
        ));
        script.push_str(":wait_for_update_lock\r\n");
        script.push_str(&format!(
            "if exist \"{}\" (\r\n    echo Binaries are being updated, waiting...\r\n    timeout /t 30 /nobreak >nul\r\n    goto wait_for_update_lock\r\n)\r\n\r\n",
            self.update_lock_sentinel().display()
        ));
        script.push_str(&format!(
            "start \"{}\" \"{}\" \"{}\" {}\r\n",
            server.name, ASA_SERVER_EXE, compound, flags
        ));
        script
    }

    pub async fn write_start_script(
        &self,
        server: &ServerConfig,
        cluster: Option<&ClusterConfig>,
        mods: &[String],
    ) -> Result<()> {
        fs::create_dir_all(self.server_dir(server)).await?;
        let script = self.generate_start_script(server, cluster, mods);
        fs::write(self.start_script_path(server), script).await?;
        Ok(())
    }

    pub async fn read_start_script(&self, server: &ServerConfig) -> Result<String> {
        match fs::read_to_string(self.start_script_path(server)).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::NotFound(format!(
                "start script for '{}' (server not provisioned?)",
                server.name
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Best-effort recursive removal of a cluster tree. Returns the paths
    /// that could not be removed.
    pub async fn remove_cluster_dir(&self, cluster_name: &str) -> Vec<PathBuf> {
        let root = self.cluster_dir(cluster_name);
        match fs::remove_dir_all(&root).await {
            Ok(()) => {
                info!("removed cluster directory {}", root.display());
                Vec::new()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                warn!("failed to remove {}: {:?}", root.display(), e);
                vec![root]
            }
        }
    }
}

fn effective_doc<'a>(
    server: &'a ServerConfig,
    cluster: Option<&'a ClusterConfig>,
    server_map: impl Fn(&'a ServerConfig) -> &'a crate::model::SettingsMap,
    cluster_map: impl Fn(&'a ClusterConfig) -> &'a crate::model::SettingsMap,
) -> IniDocument {
    let merged = match cluster {
        Some(cluster) => resolve::merge_settings(cluster_map(cluster), server_map(server)),
        None => server_map(server).clone(),
    };
    settings_to_ini(&merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClusterSettings, GlobalSettings, ModManagement, PortConfiguration};
    use chrono::Utc;
    use uuid::Uuid;

    fn temp_layout() -> Layout {
        Layout::new(std::env::temp_dir().join(format!("arkctrl-layout-{}", Uuid::new_v4())))
    }

    fn server(name: &str, cluster: Option<&str>) -> ServerConfig {
        ServerConfig {
            name: name.to_owned(),
            cluster_name: cluster.map(str::to_owned),
            map: "TheIsland".to_owned(),
            port: 7777,
            query_port: 27015,
            rcon_port: 32330,
            max_players: 70,
            admin_password: "admin".to_owned(),
            server_password: None,
            rcon_password: "rcon".to_owned(),
            disable_battle_eye: false,
            game_user_settings: Default::default(),
            game_ini: Default::default(),
            launch_parameters: Default::default(),
            created_at: Utc::now(),
        }
    }

    fn cluster(name: &str) -> ClusterConfig {
        ClusterConfig {
            name: name.to_owned(),
            description: String::new(),
            created_at: Utc::now(),
            global_settings: GlobalSettings::default(),
            cluster_settings: ClusterSettings {
                cluster_id: name.to_owned(),
                ..Default::default()
            },
            port_configuration: PortConfiguration::default(),
            servers: vec![],
            mod_management: ModManagement::default(),
        }
    }

    #[test]
    fn start_script_is_deterministic() {
        let layout = temp_layout();
        let server = server("C1-Isle", Some("C1"));
        let cluster = cluster("C1");
        let mods = vec!["111".to_owned(), "222".to_owned()];

        let a = layout.generate_start_script(&server, Some(&cluster), &mods);
        let b = layout.generate_start_script(&server, Some(&cluster), &mods);
        assert_eq!(a, b);
    }

    #[test]
    fn start_script_launches_the_ascended_executable() {
        let layout = temp_layout();
        let script = layout.generate_start_script(&server("S", None), None, &[]);
        assert!(script.contains("ArkAscendedServer.exe"));
        assert!(!script.contains("ShooterGameServer.exe"));
        assert!(script.contains("-server -log"));
        assert!(script.contains("?AltSaveDirectoryName=S"));
    }

    #[test]
    fn start_script_flags_are_conditional() {
        let layout = temp_layout();
        let mut config = server("S", None);

        let script = layout.generate_start_script(&config, None, &[]);
        assert!(!script.contains("-mods="));
        assert!(!script.contains("-NoBattleEye"));

        config.disable_battle_eye = true;
        let script =
            layout.generate_start_script(&config, None, &["111".to_owned(), "222".to_owned()]);
        assert!(script.contains("-NoBattleEye"));
        assert!(script.contains("-mods=111,222"));
    }

    #[test]
    fn start_script_carries_cluster_identity() {
        let layout = temp_layout();
        let mut c = cluster("C1");
        c.cluster_settings.cluster_password = "pw".to_owned();
        let script = layout.generate_start_script(&server("C1-Isle", Some("C1")), Some(&c), &[]);
        assert!(script.contains("?ClusterId=C1"));
        assert!(script.contains("?ClusterPassword=pw"));
    }

    #[test]
    fn start_script_waits_on_the_lock_sentinel() {
        let layout = temp_layout();
        let script = layout.generate_start_script(&server("S", None), None, &[]);
        assert!(script.contains("update.lock"));
        assert!(script.contains("timeout /t 30"));
    }

    #[tokio::test]
    async fn cluster_config_round_trips_through_disk() {
        let layout = temp_layout();
        let mut c = cluster("C1");
        c.servers.push(server("C1-Isle", Some("C1")));
        layout.write_cluster_config(&c).await.unwrap();

        let read = layout.read_cluster_config("C1").await.unwrap();
        assert_eq!(read, c);

        let listed = layout.list_disk_clusters().await.unwrap();
        assert_eq!(listed.len(), 1);

        let _ = std::fs::remove_dir_all(layout.base_dir());
    }

    #[tokio::test]
    async fn ini_files_reflect_merged_settings() {
        let layout = temp_layout();
        let mut config = server("C1-Isle", Some("C1"));
        config
            .game_user_settings
            .entry("ServerSettings".to_owned())
            .or_default()
            .insert("TamingSpeedMultiplier".to_owned(), serde_json::json!(3));

        let mut c = cluster("C1");
        c.global_settings
            .game_user_settings
            .entry("ServerSettings".to_owned())
            .or_default()
            .insert("TamingSpeedMultiplier".to_owned(), serde_json::json!(1));
        c.global_settings
            .game_user_settings
            .entry("ServerSettings".to_owned())
            .or_default()
            .insert("XPMultiplier".to_owned(), serde_json::json!(2));

        layout.create_server_dirs(&config).await.unwrap();
        layout.write_ini_files(&config, Some(&c)).await.unwrap();

        let gus = layout
            .read_config_file(&config, "GameUserSettings.ini")
            .await
            .unwrap();
        let doc = IniDocument::parse(&gus);
        // server override wins whole, cluster-only key survives
        assert_eq!(doc.get("ServerSettings", "TamingSpeedMultiplier"), Some("3"));
        assert_eq!(doc.get("ServerSettings", "XPMultiplier"), Some("2"));
        assert_eq!(doc.get("ServerSettings", "RCONPort"), Some("32330"));
        assert_eq!(doc.get("SessionSettings", "SessionName"), Some("C1-Isle"));

        let _ = std::fs::remove_dir_all(layout.base_dir());
    }

    #[tokio::test]
    async fn unknown_config_file_is_rejected() {
        let layout = temp_layout();
        let config = server("S", None);
        let err = layout
            .read_config_file(&config, "../../etc/passwd")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
