use rocket::get;
use rocket::serde::json::Json;

use arkctrl::schema::BuildInfo;

#[get("/buildinfo")]
pub async fn get() -> Json<BuildInfo> {
    Json(BuildInfo {
        version: env!("CARGO_PKG_VERSION").to_owned(),
        timestamp: env!("VERGEN_BUILD_TIMESTAMP").to_owned(),
    })
}
