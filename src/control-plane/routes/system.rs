use std::sync::Arc;

use rocket::serde::json::Json;
use rocket::{get, State};

use arkctrl::schema::SystemResources;

use crate::guards::ViewerUser;
use crate::supervisor::ProcessSupervisor;

#[get("/system/resources")]
pub async fn resources(
    _user: ViewerUser,
    supervisor: &State<Arc<ProcessSupervisor>>,
) -> Json<SystemResources> {
    Json(supervisor.system_resources())
}
