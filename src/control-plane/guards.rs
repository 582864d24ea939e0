use log::error;
use rocket::{
    http::Status,
    request::{FromRequest, Outcome},
};

use arkctrl::schema::Role;

use crate::auth::{AuthnManager, AuthnProvider, AuthzManager, UserIdentity};

#[derive(Debug)]
pub enum AuthError {
    Missing,
    Malformed,
    TokenInvalid,
    InternalError,
    Unauthorized,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for UserIdentity {
    type Error = AuthError;

    async fn from_request(
        request: &'r rocket::Request<'_>,
    ) -> rocket::request::Outcome<Self, Self::Error> {
        if let Some(authn) = request.rocket().state::<AuthnManager>() {
            if let AuthnProvider::None = authn.provider {
                Outcome::Success(UserIdentity::anonymous())
            } else if let Some(header) = request.headers().get_one("Authorization") {
                if let Some(token) = header.strip_prefix("Bearer ") {
                    match authn.verify(token) {
                        Ok(identity) => Outcome::Success(identity),
                        Err(_) => Outcome::Error((Status::Unauthorized, AuthError::TokenInvalid)),
                    }
                } else {
                    Outcome::Error((Status::Unauthorized, AuthError::Malformed))
                }
            } else {
                Outcome::Error((Status::Unauthorized, AuthError::Missing))
            }
        } else {
            error!("Failed to retrieve AuthnManager, this should never happen!");
            Outcome::Error((Status::InternalServerError, AuthError::InternalError))
        }
    }
}

macro_rules! role_guard {
    ($name:ident, $role:expr) => {
        pub struct $name(pub UserIdentity);

        #[rocket::async_trait]
        impl<'r> FromRequest<'r> for $name {
            type Error = AuthError;

            async fn from_request(
                request: &'r rocket::Request<'_>,
            ) -> rocket::request::Outcome<Self, Self::Error> {
                match request.guard::<UserIdentity>().await {
                    Outcome::Success(identity) => {
                        if let Some(authz) = request.rocket().state::<AuthzManager>() {
                            if authz.authorize(&identity, $role) {
                                Outcome::Success($name(identity))
                            } else {
                                Outcome::Error((Status::Forbidden, AuthError::Unauthorized))
                            }
                        } else {
                            error!("Failed to retrieve AuthzManager, this should never happen!");
                            Outcome::Error((Status::InternalServerError, AuthError::InternalError))
                        }
                    }
                    Outcome::Error(e) => Outcome::Error(e),
                    Outcome::Forward(f) => Outcome::Forward(f),
                }
            }
        }
    };
}

role_guard!(ViewerUser, Role::Viewer);
role_guard!(OperatorUser, Role::Operator);
role_guard!(AdminUser, Role::Admin);
