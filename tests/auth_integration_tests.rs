use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use serial_test::serial;
use sha2::Sha256;
use tokio::process::{Child, Command};
use uuid::Uuid;

use arkctrl::util;

const PORT: u16 = 46731;
const SECRET: &str = "integration-test-secret";

fn forge_token(sub: &str, role: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let claims = URL_SAFE_NO_PAD.encode(
        serde_json::json!({ "sub": sub, "role": role })
            .to_string()
            .as_bytes(),
    );
    let mut mac = Hmac::<Sha256>::new_from_slice(SECRET.as_bytes()).unwrap();
    mac.update(header.as_bytes());
    mac.update(b".");
    mac.update(claims.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    format!("{}.{}.{}", header, claims, signature)
}

struct AuthFixture {
    process: Child,
    base_dir: PathBuf,
    client: reqwest::Client,
}

impl AuthFixture {
    pub async fn new() -> Self {
        let base_dir = std::env::temp_dir().join(format!("arkctrl-auth-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&base_dir).unwrap();

        let process = Command::new(env!("CARGO_BIN_EXE_control-plane"))
            .env("PORT", PORT.to_string())
            .env("HOST", "127.0.0.1")
            .env("NATIVE_BASE_PATH", &base_dir)
            .env("JWT_SECRET", SECRET)
            .env("LOG_LEVEL", "warn")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap();

        let fixture = AuthFixture {
            process,
            base_dir,
            client: reqwest::Client::new(),
        };
        fixture.wait_until_ready().await;
        fixture
    }

    async fn wait_until_ready(&self) {
        for _ in 0..80 {
            // buildinfo is unauthenticated metadata
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

    async fn get_as(&self, token: Option<&str>, path: &str) -> reqwest::Response {
        let mut request = self.client.get(self.url(path));
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        request.send().await.unwrap()
    }

    async fn post_as(
        &self,
        token: Option<&str>,
        path: &str,
        body: serde_json::Value,
    ) -> reqwest::Response {
        let mut request = self.client.post(self.url(path)).json(&body);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        request.send().await.unwrap()
    }
}

impl Drop for AuthFixture {
    fn drop(&mut self) {
        let _ = self.process.start_kill();
        // give the OS a moment to release the listen port for the next test
        std::thread::sleep(Duration::from_millis(200));
        let _ = std::fs::remove_dir_all(&self.base_dir);
    }
}

#[tokio::test]
#[serial]
async fn requests_without_a_token_are_rejected() {
    util::testing::logger_init();
    let f = AuthFixture::new().await;

    let response = f.get_as(None, "/api/native-servers").await;
    assert_eq!(response.status(), 401);
}

#[tokio::test]
#[serial]
async fn garbage_tokens_are_rejected() {
    util::testing::logger_init();
    let f = AuthFixture::new().await;

    let response = f.get_as(Some("not.a.jwt"), "/api/native-servers").await;
    assert_eq!(response.status(), 401);
}

#[tokio::test]
#[serial]
async fn viewers_can_read_but_not_mutate() {
    util::testing::logger_init();
    let f = AuthFixture::new().await;
    let token = forge_token("viewer-1", "viewer");

    let response = f.get_as(Some(&token), "/api/native-servers").await;
    assert_eq!(response.status(), 200);

    let response = f
        .post_as(
            Some(&token),
            "/api/provisioning/shared-mods",
            serde_json::json!({ "modId": "111" }),
        )
        .await;
    assert_eq!(response.status(), 403);
}

#[tokio::test]
#[serial]
async fn operators_cannot_touch_cluster_configuration() {
    util::testing::logger_init();
    let f = AuthFixture::new().await;
    let token = forge_token("ops-1", "operator");

    let response = f
        .post_as(
            Some(&token),
            "/api/provisioning/shared-mods",
            serde_json::json!({ "modId": "111" }),
        )
        .await;
    assert_eq!(response.status(), 403);

    // but lifecycle-level reads work
    let response = f.get_as(Some(&token), "/api/lock-status").await;
    assert_eq!(response.status(), 200);
}

#[tokio::test]
#[serial]
async fn admins_can_mutate() {
    util::testing::logger_init();
    let f = AuthFixture::new().await;
    let token = forge_token("root", "admin");

    let response = f
        .post_as(
            Some(&token),
            "/api/provisioning/shared-mods",
            serde_json::json!({ "modId": "111" }),
        )
        .await;
    assert_eq!(response.status(), 200);

    let mods: Vec<serde_json::Value> = f
        .get_as(Some(&token), "/api/provisioning/shared-mods")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(mods.len(), 1);
}
