use std::sync::Arc;

use rocket::serde::json::Json;
use rocket::{get, post, State};
use uuid::Uuid;

use arkctrl::schema::Job;

use crate::error::{Error, Result};
use crate::guards::{OperatorUser, ViewerUser};
use crate::jobs::JobEngine;

#[get("/jobs")]
pub async fn list(_user: ViewerUser, engine: &State<Arc<JobEngine>>) -> Result<Json<Vec<Job>>> {
    Ok(Json(engine.list()?))
}

#[get("/jobs/<id>")]
pub async fn get(
    _user: ViewerUser,
    id: Uuid,
    engine: &State<Arc<JobEngine>>,
) -> Result<Json<Job>> {
    engine
        .get(id)?
        .map(Json)
        .ok_or_else(|| Error::NotFound(format!("job {}", id)))
}

#[post("/jobs/<id>/cancel")]
pub async fn cancel(
    _user: OperatorUser,
    id: Uuid,
    engine: &State<Arc<JobEngine>>,
) -> Result<Json<Job>> {
    engine.cancel(id).await?;
    engine
        .get(id)?
        .map(Json)
        .ok_or_else(|| Error::NotFound(format!("job {}", id)))
}
