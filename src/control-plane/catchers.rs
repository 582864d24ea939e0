use rocket::catch;
use rocket::serde::json::Json;

use arkctrl::schema::ErrorEnvelope;

#[catch(404)]
pub fn not_found() -> Json<ErrorEnvelope> {
    Json(ErrorEnvelope {
        success: false,
        message: "no such endpoint".to_owned(),
        code: Some("NotFound".to_owned()),
    })
}

#[catch(401)]
pub fn unauthorized() -> Json<ErrorEnvelope> {
    Json(ErrorEnvelope {
        success: false,
        message: "authentication required".to_owned(),
        code: Some("Unauthorized".to_owned()),
    })
}

#[catch(403)]
pub fn forbidden() -> Json<ErrorEnvelope> {
    Json(ErrorEnvelope {
        success: false,
        message: "insufficient role".to_owned(),
        code: Some("Forbidden".to_owned()),
    })
}

#[catch(500)]
pub fn internal() -> Json<ErrorEnvelope> {
    Json(ErrorEnvelope {
        success: false,
        message: "internal error".to_owned(),
        code: Some("Internal".to_owned()),
    })
}
