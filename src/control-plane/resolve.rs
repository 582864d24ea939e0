use std::collections::BTreeSet;

use lazy_static::lazy_static;
use regex::Regex;

use crate::db::{ServerMod, SharedMod};
use crate::error::{Error, Result};
use crate::model::{ClusterConfig, ClusterInput, ServerConfig, SettingsMap};

lazy_static! {
    static ref NAME_RE: Regex = Regex::new(r"^[A-Za-z0-9._-]{1,64}$").unwrap();
    static ref MOD_ID_RE: Regex = Regex::new(r"^[0-9]+$").unwrap();
}

fn invalid(path: &str, reason: impl AsRef<str>) -> Error {
    Error::Validation(format!("{}: {}", path, reason.as_ref()))
}

pub fn validate_name(path: &str, name: &str) -> Result<()> {
    if NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(invalid(
            path,
            format!("'{}' must match [A-Za-z0-9._-]{{1,64}}", name),
        ))
    }
}

pub fn validate_mod_id(path: &str, mod_id: &str) -> Result<()> {
    if MOD_ID_RE.is_match(mod_id) {
        Ok(())
    } else {
        Err(invalid(
            path,
            format!("'{}' is not a decimal mod id", mod_id),
        ))
    }
}

/// Values that end up in the `?`-delimited compound launch argument cannot be
/// escaped, so anything containing a space is rejected outright.
pub fn validate_script_value(path: &str, value: &str) -> Result<()> {
    if value.contains(' ') {
        Err(invalid(path, "value may not contain spaces"))
    } else {
        Ok(())
    }
}

/// Full validation of a cluster-creation input against host state.
pub fn validate_cluster_input(
    input: &ClusterInput,
    existing: &[ServerConfig],
    known_maps: &[String],
) -> Result<()> {
    validate_name("cluster.name", &input.name)?;

    if input.servers.is_empty() {
        return Err(invalid("cluster.servers", "at least one server required"));
    }

    let mut seen = BTreeSet::new();
    for (i, server) in input.servers.iter().enumerate() {
        let path = format!("cluster.servers[{}]", i);
        validate_name(&format!("{}.name", path), &server.name)?;
        if !seen.insert(server.name.clone()) {
            return Err(invalid(
                &format!("{}.name", path),
                format!("duplicate server name '{}'", server.name),
            ));
        }
        if existing.iter().any(|e| e.name == server.name) {
            return Err(Error::Conflict(format!(
                "server '{}' already exists on this host",
                server.name
            )));
        }
        if !known_maps.iter().any(|m| m == &server.map) {
            return Err(invalid(
                &format!("{}.map", path),
                format!("unknown map '{}'", server.map),
            ));
        }
        for (field, value) in [
            ("adminPassword", server.admin_password.as_deref()),
            ("serverPassword", server.server_password.as_deref()),
            ("rconPassword", server.rcon_password.as_deref()),
        ] {
            if let Some(value) = value {
                validate_script_value(&format!("{}.{}", path, field), value)?;
            }
        }
    }

    for (field, value) in [
        ("clusterId", &input.cluster_settings.cluster_id),
        ("clusterName", &input.cluster_settings.cluster_name),
        ("clusterPassword", &input.cluster_settings.cluster_password),
    ] {
        validate_script_value(&format!("cluster.clusterSettings.{}", field), value)?;
    }

    // Invariant C-1: mod management may only reference member servers.
    for name in input.mod_management.server_mods.keys() {
        if !seen.contains(name) {
            return Err(invalid(
                "cluster.modManagement.serverMods",
                format!("'{}' is not a member server", name),
            ));
        }
    }
    for name in &input.mod_management.excluded_servers {
        if !seen.contains(name) {
            return Err(invalid(
                "cluster.modManagement.excludedServers",
                format!("'{}' is not a member server", name),
            ));
        }
    }
    for mod_id in &input.mod_management.shared_mods {
        validate_mod_id("cluster.modManagement.sharedMods", mod_id)?;
    }
    for (server, entry) in &input.mod_management.server_mods {
        for mod_id in &entry.additional_mods {
            validate_mod_id(
                &format!("cluster.modManagement.serverMods.{}", server),
                mod_id,
            )?;
        }
    }

    Ok(())
}

/// Computed `(port, queryPort, rconPort)` triple for one member server.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PortTriple {
    pub port: u16,
    pub query_port: u16,
    pub rcon_port: u16,
}

/// Allocate port triples for every member server: `base + i * increment` per
/// family, with explicit per-server values taking precedence. Asserts the
/// uniqueness invariant across the cluster and against already-provisioned
/// servers on the host.
pub fn allocate_ports(input: &ClusterInput, existing: &[ServerConfig]) -> Result<Vec<PortTriple>> {
    let ports = input.port_configuration();
    let mut triples = Vec::with_capacity(input.servers.len());

    for (i, server) in input.servers.iter().enumerate() {
        let step = |base: u16, increment: u16, family: &str| -> Result<u16> {
            let value = base as u32 + i as u32 * increment as u32;
            u16::try_from(value).map_err(|_| {
                invalid(
                    &format!("cluster.servers[{}].{}", i, family),
                    format!("computed port {} exceeds 65535", value),
                )
            })
        };
        triples.push(PortTriple {
            port: match server.port {
                Some(p) => p,
                None => step(ports.base_port, ports.port_increment, "port")?,
            },
            query_port: match server.query_port {
                Some(p) => p,
                None => step(ports.query_port_base, ports.query_port_increment, "queryPort")?,
            },
            rcon_port: match server.rcon_port {
                Some(p) => p,
                None => step(ports.rcon_port_base, ports.rcon_port_increment, "rconPort")?,
            },
        });
    }

    // Invariant S-1: the union of all port families has 3N distinct members.
    let mut all = BTreeSet::new();
    for (i, t) in triples.iter().enumerate() {
        for port in [t.port, t.query_port, t.rcon_port] {
            if !all.insert(port) {
                return Err(invalid(
                    &format!("cluster.servers[{}]", i),
                    format!("port {} is assigned more than once", port),
                ));
            }
        }
    }

    for server in existing {
        for port in [server.port, server.query_port, server.rcon_port] {
            if all.contains(&port) {
                return Err(Error::Conflict(format!(
                    "port {} already in use by server '{}'",
                    port, server.name
                )));
            }
        }
    }

    Ok(triples)
}

/// Effective mod list for a server: an insertion-ordered set assembled from
/// cluster shared mods, cluster per-server additions, then host-wide shared
/// and per-server mods from the store. `clusterName = None` (individual
/// servers) collapses to the store-only steps.
pub fn resolve_mods(
    cluster: Option<&ClusterConfig>,
    server_name: &str,
    exclude_shared: bool,
    store_shared: &[SharedMod],
    store_server_mods: &[ServerMod],
) -> Vec<String> {
    let mut mods: Vec<String> = Vec::new();
    let push = |id: &str, mods: &mut Vec<String>| {
        if !mods.iter().any(|m| m == id) {
            mods.push(id.to_owned());
        }
    };

    if let Some(cluster) = cluster {
        let mm = &cluster.mod_management;
        let excluded = mm.excluded_servers.iter().any(|s| s == server_name);
        let cluster_exclude_shared = mm
            .server_mods
            .get(server_name)
            .map(|o| o.exclude_shared_mods)
            .unwrap_or(false);

        if !excluded && !cluster_exclude_shared {
            for id in &mm.shared_mods {
                push(id, &mut mods);
            }
        }

        if let Some(overrides) = mm.server_mods.get(server_name) {
            for id in &overrides.additional_mods {
                push(id, &mut mods);
            }
        }
    }

    if !exclude_shared {
        for shared in store_shared.iter().filter(|m| m.enabled) {
            push(&shared.mod_id, &mut mods);
        }
    }

    for server_mod in store_server_mods.iter().filter(|m| m.enabled) {
        push(&server_mod.mod_id, &mut mods);
    }

    mods
}

/// Two-level deep merge of sectioned settings: section union, entry union,
/// server values override cluster globals whole.
pub fn merge_settings(cluster: &SettingsMap, server: &SettingsMap) -> SettingsMap {
    let mut merged = cluster.clone();
    for (section, entries) in server {
        let target = merged.entry(section.clone()).or_default();
        for (key, value) in entries {
            target.insert(key.clone(), value.clone());
        }
    }
    merged
}
