use std::sync::Arc;

use rocket::serde::json::Json;
use rocket::{delete, get, post, State};

use arkctrl::schema::{LockRequest, LockStatus};

use crate::error::Result;
use crate::guards::{AdminUser, ViewerUser};
use crate::lock::UpdateLock;

#[get("/lock-status")]
pub async fn status(_user: ViewerUser, lock: &State<Arc<UpdateLock>>) -> Json<LockStatus> {
    Json(lock.status())
}

/// Manually hold the update lock, e.g. for out-of-band maintenance. Fails
/// with 409 while any exclusive job holds it.
#[post("/lock-status", data = "<body>")]
pub async fn acquire(
    _user: AdminUser,
    body: Json<LockRequest>,
    lock: &State<Arc<UpdateLock>>,
) -> Result<Json<LockStatus>> {
    lock.hold_manual(&body.reason)?;
    Ok(Json(lock.status()))
}

#[delete("/lock-status")]
pub async fn release(_user: AdminUser, lock: &State<Arc<UpdateLock>>) -> Result<Json<LockStatus>> {
    lock.release_manual()?;
    Ok(Json(lock.status()))
}
