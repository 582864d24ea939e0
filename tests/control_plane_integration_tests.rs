use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serial_test::serial;
use tokio::process::{Child, Command};
use uuid::Uuid;

use arkctrl::util;

const PORT: u16 = 46721;

struct ControlPlaneFixture {
    process: Child,
    base_dir: PathBuf,
    client: reqwest::Client,
}

impl ControlPlaneFixture {
    pub async fn new() -> Self {
        ControlPlaneFixture::seeded(|_| {}).await
    }

    /// Spawns the control plane after letting the caller pre-populate the
    /// base directory, e.g. with disk-only clusters from an older
    /// deployment.
    pub async fn seeded(seed: impl FnOnce(&PathBuf)) -> Self {
        let base_dir = std::env::temp_dir().join(format!("arkctrl-it-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&base_dir).unwrap();
        seed(&base_dir);

        let process = Command::new(env!("CARGO_BIN_EXE_control-plane"))
            .env("PORT", PORT.to_string())
            .env("HOST", "127.0.0.1")
            .env("NATIVE_BASE_PATH", &base_dir)
            .env("SERVER_MODE", "native")
            .env("LOG_LEVEL", "warn")
            .env_remove("JWT_SECRET")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null()) // Comment out this line to show logs for debugging
            .kill_on_drop(true)
            .spawn()
            .unwrap();

        let client = reqwest::Client::new();
        let fixture = ControlPlaneFixture {
            process,
            base_dir,
            client,
        };
        fixture.wait_until_ready().await;
        fixture
    }

    async fn wait_until_ready(&self) {
        for _ in 0..80 {
            if let Ok(response) = self.client.get(self.url("/api/buildinfo")).send().await {
                if response.status().is_success() {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        panic!("control-plane did not become ready");
    }

    fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", PORT, path)
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        self.client.get(self.url(path)).send().await.unwrap()
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .unwrap()
    }
}

impl Drop for ControlPlaneFixture {
    fn drop(&mut self) {
        let _ = self.process.start_kill();
        // give the OS a moment to release the listen port for the next test
        std::thread::sleep(Duration::from_millis(200));
        let _ = std::fs::remove_dir_all(&self.base_dir);
    }
}

#[tokio::test]
#[serial]
async fn fresh_instance_lists_no_servers() {
    util::testing::logger_init();
    let f = ControlPlaneFixture::new().await;

    let response = f.get("/api/native-servers").await;
    assert_eq!(response.status(), 200);
    let servers: Vec<serde_json::Value> = response.json().await.unwrap();
    assert!(servers.is_empty());

    let response = f.get("/api/provisioning/clusters").await;
    assert_eq!(response.status(), 200);
    let clusters: Vec<serde_json::Value> = response.json().await.unwrap();
    assert!(clusters.is_empty());
}

#[tokio::test]
#[serial]
async fn null_shared_mod_id_is_rejected_without_insert() {
    util::testing::logger_init();
    let f = ControlPlaneFixture::new().await;

    let response = f
        .post(
            "/api/provisioning/shared-mods",
            serde_json::json!({ "modId": null }),
        )
        .await;
    assert_eq!(response.status(), 400);
    let envelope: serde_json::Value = response.json().await.unwrap();
    assert_eq!(envelope["success"], false);
    assert_eq!(envelope["code"], "ValidationFailed");

    let response = f.get("/api/provisioning/shared-mods").await;
    let mods: Vec<serde_json::Value> = response.json().await.unwrap();
    assert!(mods.is_empty());
}

#[tokio::test]
#[serial]
async fn shared_mods_round_trip() {
    util::testing::logger_init();
    let f = ControlPlaneFixture::new().await;

    let response = f
        .post(
            "/api/provisioning/shared-mods",
            serde_json::json!({ "modId": "111", "modName": "Structures Plus" }),
        )
        .await;
    assert_eq!(response.status(), 200);

    let response = f.get("/api/provisioning/shared-mods").await;
    let mods: Vec<serde_json::Value> = response.json().await.unwrap();
    assert_eq!(mods.len(), 1);
    assert_eq!(mods[0]["modId"], "111");
    assert_eq!(mods[0]["enabled"], true);
}

#[tokio::test]
#[serial]
async fn cluster_with_colliding_ports_is_rejected_before_any_job() {
    util::testing::logger_init();
    let f = ControlPlaneFixture::new().await;

    let body = serde_json::json!({
        "name": "C1",
        "basePort": 7777, "portIncrement": 1,
        "queryPortBase": 27015, "queryPortIncrement": 1,
        "rconPortBase": 32330, "rconPortIncrement": 1,
        "servers": [
            { "name": "C1-Isle", "map": "TheIsland", "port": 7777 },
            { "name": "C1-Rag", "map": "Ragnarok", "port": 7777 },
        ],
        "clusterSettings": { "clusterId": "C1", "clusterPassword": "" },
    });
    let response = f.post("/api/provisioning/clusters", body).await;
    assert_eq!(response.status(), 400);
    let envelope: serde_json::Value = response.json().await.unwrap();
    assert_eq!(envelope["code"], "ValidationFailed");

    // no filesystem changes
    assert!(!f.base_dir.join("clusters").join("C1").exists());
    // and no job was queued
    let jobs: Vec<serde_json::Value> = f.get("/api/jobs").await.json().await.unwrap();
    assert!(jobs.is_empty());
}

#[tokio::test]
#[serial]
async fn unknown_maps_are_rejected() {
    util::testing::logger_init();
    let f = ControlPlaneFixture::new().await;

    let body = serde_json::json!({
        "name": "C2",
        "basePort": 7877, "portIncrement": 1,
        "queryPortBase": 27115, "queryPortIncrement": 1,
        "rconPortBase": 32430, "rconPortIncrement": 1,
        "servers": [ { "name": "C2-Nope", "map": "NotAMap" } ],
    });
    let response = f.post("/api/provisioning/clusters", body).await;
    assert_eq!(response.status(), 400);
}

#[tokio::test]
#[serial]
async fn manual_update_lock_cycle() {
    util::testing::logger_init();
    let f = ControlPlaneFixture::new().await;

    let status: serde_json::Value = f.get("/api/lock-status").await.json().await.unwrap();
    assert_eq!(status["locked"], false);

    let response = f
        .post("/api/lock-status", serde_json::json!({ "reason": "maintenance" }))
        .await;
    assert_eq!(response.status(), 200);
    let status: serde_json::Value = response.json().await.unwrap();
    assert_eq!(status["locked"], true);
    assert_eq!(status["reason"], "maintenance");

    // the advisory sentinel the start scripts poll
    assert!(f.base_dir.join("update.lock").exists());

    // second manual acquisition contends
    let response = f
        .post("/api/lock-status", serde_json::json!({ "reason": "again" }))
        .await;
    assert_eq!(response.status(), 409);

    let response = f
        .client
        .delete(f.url("/api/lock-status"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let status: serde_json::Value = response.json().await.unwrap();
    assert_eq!(status["locked"], false);
    assert!(!f.base_dir.join("update.lock").exists());
}

#[tokio::test]
#[serial]
async fn operations_on_unknown_servers_return_404() {
    util::testing::logger_init();
    let f = ControlPlaneFixture::new().await;

    let response = f
        .post("/api/rcon/Ghost", serde_json::json!({ "command": "ListPlayers" }))
        .await;
    assert_eq!(response.status(), 404);

    let response = f.get("/api/configs/Ghost?file=Game.ini").await;
    assert_eq!(response.status(), 404);

    let response = f.post("/api/native-servers/Ghost/start", serde_json::json!({})).await;
    assert_eq!(response.status(), 404);

    let response = f.get("/api/native-servers/Ghost/start-bat").await;
    assert_eq!(response.status(), 404);
}

#[tokio::test]
#[serial]
async fn unknown_endpoints_return_the_error_envelope() {
    util::testing::logger_init();
    let f = ControlPlaneFixture::new().await;

    let response = f.get("/api/no-such-thing").await;
    assert_eq!(response.status(), 404);
    let envelope: serde_json::Value = response.json().await.unwrap();
    assert_eq!(envelope["success"], false);
}

fn seed_disk_cluster(base_dir: &PathBuf) {
    let server = |name: &str, map: &str, i: u16| {
        serde_json::json!({
            "name": name,
            "clusterName": "C9",
            "map": map,
            "port": 7777 + i,
            "queryPort": 27015 + i,
            "rconPort": 32330 + i,
            "maxPlayers": 70,
            "adminPassword": "admin",
            "rconPassword": "rcon",
            "disableBattleEye": false,
        })
    };
    let cluster = serde_json::json!({
        "name": "C9",
        "servers": [server("C9-Isle", "TheIsland", 0), server("C9-Rag", "Ragnarok", 1)],
        "clusterSettings": { "clusterId": "C9", "clusterPassword": "" },
        "modManagement": {
            "sharedMods": ["111"],
            "serverMods": { "C9-Rag": { "additionalMods": ["222"], "excludeSharedMods": false } },
            "excludedServers": ["C9-Isle"],
        },
    });
    let dir = base_dir.join("clusters").join("C9");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("cluster.json"),
        serde_json::to_string_pretty(&cluster).unwrap(),
    )
    .unwrap();
}

#[tokio::test]
#[serial]
async fn disk_only_clusters_are_discovered() {
    util::testing::logger_init();
    let f = ControlPlaneFixture::seeded(seed_disk_cluster).await;

    let servers: Vec<serde_json::Value> =
        f.get("/api/native-servers").await.json().await.unwrap();
    assert_eq!(servers.len(), 2);

    let isle = servers.iter().find(|s| s["name"] == "C9-Isle").unwrap();
    let rag = servers.iter().find(|s| s["name"] == "C9-Rag").unwrap();
    assert_eq!(isle["status"], "stopped");
    assert_eq!(isle["ports"]["rconPort"], 32330);
    // excluded from shared mods, nothing server-specific
    assert_eq!(isle["modCount"], 0);
    // shared "111" plus additional "222"
    assert_eq!(rag["modCount"], 2);
}

#[tokio::test]
#[serial]
async fn generated_scripts_reflect_resolved_mods() {
    util::testing::logger_init();
    let f = ControlPlaneFixture::seeded(seed_disk_cluster).await;

    let script: serde_json::Value = f
        .get("/api/native-servers/C9-Rag/start-bat")
        .await
        .json()
        .await
        .unwrap();
    let content = script["content"].as_str().unwrap();
    assert!(content.contains("ArkAscendedServer.exe"));
    assert!(content.contains("-mods=111,222"));
    assert!(content.contains("?ClusterId=C9"));
    assert!(content.contains("?AltSaveDirectoryName=C9-Rag"));

    let script: serde_json::Value = f
        .get("/api/native-servers/C9-Isle/start-bat")
        .await
        .json()
        .await
        .unwrap();
    let content = script["content"].as_str().unwrap();
    assert!(!content.contains("-mods="));

    // determinism: a second render is byte-identical
    let again: serde_json::Value = f
        .get("/api/native-servers/C9-Isle/start-bat")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(content, again["content"].as_str().unwrap());
}

#[tokio::test]
#[serial]
async fn job_listing_and_missing_job_lookup() {
    util::testing::logger_init();
    let f = ControlPlaneFixture::new().await;

    let jobs: Vec<serde_json::Value> = f.get("/api/jobs").await.json().await.unwrap();
    assert!(jobs.is_empty());

    let response = f
        .get(&format!("/api/jobs/{}", Uuid::new_v4()))
        .await;
    assert_eq!(response.status(), 404);
}
