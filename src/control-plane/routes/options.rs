use rocket::options;

/// Preflight requests succeed for every route; the CORS fairing adds the
/// actual headers on the way out.
#[options("/<_..>")]
pub async fn options() {}
