use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ini::IniDocument;

/// Sectioned settings as they appear in `cluster.json` / `server-config.json`:
/// outer map keyed by INI section, inner map keyed by entry. Values may be
/// strings, numbers or booleans.
pub type SettingsMap = BTreeMap<String, BTreeMap<String, serde_json::Value>>;

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalSettings {
    pub game_user_settings: SettingsMap,
    pub game_ini: SettingsMap,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterSettings {
    pub cluster_id: String,
    pub cluster_name: String,
    pub cluster_password: String,
    pub cluster_owner: String,
    pub cluster_description: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PortConfiguration {
    pub base_port: u16,
    pub port_increment: u16,
    pub query_port_base: u16,
    pub query_port_increment: u16,
    pub rcon_port_base: u16,
    pub rcon_port_increment: u16,
}

impl Default for PortConfiguration {
    fn default() -> Self {
        PortConfiguration {
            base_port: 7777,
            port_increment: 1,
            query_port_base: 27015,
            query_port_increment: 1,
            rcon_port_base: 32330,
            rcon_port_increment: 1,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerModOverride {
    pub additional_mods: Vec<String>,
    pub exclude_shared_mods: bool,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModManagement {
    pub shared_mods: Vec<String>,
    pub server_mods: BTreeMap<String, ServerModOverride>,
    pub excluded_servers: Vec<String>,
}

/// Persisted per-server configuration, mirrored to `server-config.json`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
    pub map: String,
    pub port: u16,
    pub query_port: u16,
    pub rcon_port: u16,
    #[serde(default = "default_max_players")]
    pub max_players: u32,
    pub admin_password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_password: Option<String>,
    pub rcon_password: String,
    #[serde(default)]
    pub disable_battle_eye: bool,
    #[serde(default)]
    pub game_user_settings: SettingsMap,
    #[serde(default)]
    pub game_ini: SettingsMap,
    /// Extra `?key=value` launch parameters appended to the compound
    /// argument, in key order.
    #[serde(default)]
    pub launch_parameters: BTreeMap<String, String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_max_players() -> u32 {
    70
}

/// Persisted cluster configuration, mirrored to `cluster.json`.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub global_settings: GlobalSettings,
    #[serde(default)]
    pub cluster_settings: ClusterSettings,
    #[serde(default)]
    pub port_configuration: PortConfiguration,
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub mod_management: ModManagement,
}

impl ClusterConfig {
    /// Lenient loader. Accepts the historical shape where shared mods lived
    /// in a top-level `globalMods` array, upgrading it in-memory to
    /// `modManagement.sharedMods`.
    pub fn from_json(mut value: serde_json::Value) -> Result<ClusterConfig> {
        if let Some(obj) = value.as_object_mut() {
            if let Some(legacy) = obj.remove("globalMods") {
                let mod_management = obj
                    .entry("modManagement")
                    .or_insert_with(|| serde_json::json!({}));
                if let Some(mm) = mod_management.as_object_mut() {
                    if !mm.contains_key("sharedMods") {
                        mm.insert("sharedMods".to_owned(), legacy);
                    }
                }
            }
        }
        serde_json::from_value(value).map_err(Error::from)
    }

    pub fn server(&self, name: &str) -> Option<&ServerConfig> {
        self.servers.iter().find(|s| s.name == name)
    }
}

/// Creation input for `POST /api/provisioning/clusters`. Port configuration
/// arrives flattened at the top level.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterInput {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub base_port: u16,
    #[serde(default)]
    pub port_increment: u16,
    pub query_port_base: u16,
    #[serde(default)]
    pub query_port_increment: u16,
    pub rcon_port_base: u16,
    #[serde(default)]
    pub rcon_port_increment: u16,
    pub servers: Vec<ServerSpec>,
    #[serde(default)]
    pub mod_management: ModManagement,
    #[serde(default)]
    pub cluster_settings: ClusterSettings,
    #[serde(default)]
    pub global_settings: GlobalSettings,
}

impl ClusterInput {
    pub fn port_configuration(&self) -> PortConfiguration {
        PortConfiguration {
            base_port: self.base_port,
            port_increment: self.port_increment,
            query_port_base: self.query_port_base,
            query_port_increment: self.query_port_increment,
            rcon_port_base: self.rcon_port_base,
            rcon_port_increment: self.rcon_port_increment,
        }
    }
}

/// Per-server creation input. Anything optional falls back to allocation
/// (ports) or defaults (passwords, player cap).
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSpec {
    pub name: String,
    pub map: String,
    pub port: Option<u16>,
    pub query_port: Option<u16>,
    pub rcon_port: Option<u16>,
    pub max_players: Option<u32>,
    pub admin_password: Option<String>,
    pub server_password: Option<String>,
    pub rcon_password: Option<String>,
    pub disable_battle_eye: bool,
    pub game_user_settings: SettingsMap,
    pub game_ini: SettingsMap,
}

pub fn settings_to_ini(settings: &SettingsMap) -> IniDocument {
    let mut doc = IniDocument::default();
    for (section, entries) in settings {
        for (key, value) in entries {
            doc.set(section, key, ini_value_string(value));
        }
    }
    doc
}

/// INI rendering of a JSON scalar. Booleans use the capitalised form the
/// game expects.
pub fn ini_value_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Bool(true) => "True".to_owned(),
        serde_json::Value::Bool(false) => "False".to_owned(),
        serde_json::Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}
