use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use arkctrl::schema::Role;

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Authenticated caller context injected into every request.
#[derive(Clone, Debug)]
pub struct UserIdentity {
    pub sub: String,
    pub role: Role,
}

impl UserIdentity {
    /// With authentication disabled every caller is a full admin.
    pub fn anonymous() -> UserIdentity {
        UserIdentity {
            sub: "anonymous".to_owned(),
            role: Role::Admin,
        }
    }
}

pub enum AuthnProvider {
    None,
    /// Bearer tokens are HS256 JWTs minted by the external identity service;
    /// this process only verifies them.
    Jwt { secret: String },
}

pub struct AuthnManager {
    pub provider: AuthnProvider,
}

#[derive(Deserialize)]
struct Claims {
    sub: Option<String>,
    role: Option<Role>,
    exp: Option<i64>,
}

#[derive(Deserialize)]
struct Header {
    alg: String,
}

impl AuthnManager {
    pub fn new(provider: AuthnProvider) -> AuthnManager {
        AuthnManager { provider }
    }

    pub fn verify(&self, token: &str) -> Result<UserIdentity> {
        match &self.provider {
            AuthnProvider::None => Ok(UserIdentity::anonymous()),
            AuthnProvider::Jwt { secret } => verify_hs256(token, secret),
        }
    }
}

fn verify_hs256(token: &str, secret: &str) -> Result<UserIdentity> {
    let mut parts = token.split('.');
    let (header_b64, claims_b64, signature_b64) = match (parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(c), Some(s)) if parts.next().is_none() => (h, c, s),
        _ => return Err(Error::Unauthorized("malformed token".to_owned())),
    };

    let header: Header = serde_json::from_slice(&decode_part(header_b64)?)
        .map_err(|_| Error::Unauthorized("malformed token header".to_owned()))?;
    if header.alg != "HS256" {
        return Err(Error::Unauthorized(format!(
            "unsupported token algorithm '{}'",
            header.alg
        )));
    }

    let signature = decode_part(signature_b64)?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| Error::Internal("invalid JWT secret".to_owned()))?;
    mac.update(header_b64.as_bytes());
    mac.update(b".");
    mac.update(claims_b64.as_bytes());
    mac.verify_slice(&signature)
        .map_err(|_| Error::Unauthorized("token signature mismatch".to_owned()))?;

    let claims: Claims = serde_json::from_slice(&decode_part(claims_b64)?)
        .map_err(|_| Error::Unauthorized("malformed token claims".to_owned()))?;

    if let Some(exp) = claims.exp {
        if exp < Utc::now().timestamp() {
            return Err(Error::Unauthorized("token expired".to_owned()));
        }
    }

    Ok(UserIdentity {
        sub: claims.sub.unwrap_or_else(|| "unknown".to_owned()),
        role: claims.role.unwrap_or(Role::Viewer),
    })
}

fn decode_part(part: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(part)
        .map_err(|_| Error::Unauthorized("malformed token encoding".to_owned()))
}

/// Role gate: viewer for reads, operator for lifecycle and RCON, admin for
/// cluster and user mutations.
pub struct AuthzManager;

impl AuthzManager {
    pub fn authorize(&self, identity: &UserIdentity, required: Role) -> bool {
        identity.role >= required
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forge(secret: &str, claims: serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let claims = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(header.as_bytes());
        mac.update(b".");
        mac.update(claims.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        format!("{}.{}.{}", header, claims, signature)
    }

    #[test]
    fn valid_tokens_verify_with_role() {
        let mgr = AuthnManager::new(AuthnProvider::Jwt {
            secret: "s3cret".to_owned(),
        });
        let token = forge("s3cret", serde_json::json!({"sub": "ops", "role": "operator"}));
        let identity = mgr.verify(&token).unwrap();
        assert_eq!(identity.sub, "ops");
        assert_eq!(identity.role, Role::Operator);
    }

    #[test]
    fn wrong_signature_is_rejected() {
        let mgr = AuthnManager::new(AuthnProvider::Jwt {
            secret: "s3cret".to_owned(),
        });
        let token = forge("different", serde_json::json!({"sub": "ops"}));
        assert!(matches!(mgr.verify(&token), Err(Error::Unauthorized(_))));
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let mgr = AuthnManager::new(AuthnProvider::Jwt {
            secret: "s3cret".to_owned(),
        });
        let token = forge(
            "s3cret",
            serde_json::json!({"sub": "ops", "exp": Utc::now().timestamp() - 60}),
        );
        assert!(matches!(mgr.verify(&token), Err(Error::Unauthorized(_))));
    }

    #[test]
    fn missing_role_defaults_to_viewer() {
        let mgr = AuthnManager::new(AuthnProvider::Jwt {
            secret: "s3cret".to_owned(),
        });
        let token = forge("s3cret", serde_json::json!({"sub": "someone"}));
        assert_eq!(mgr.verify(&token).unwrap().role, Role::Viewer);
    }

    #[test]
    fn provider_none_grants_admin() {
        let mgr = AuthnManager::new(AuthnProvider::None);
        let identity = mgr.verify("whatever").unwrap();
        assert_eq!(identity.role, Role::Admin);
    }

    #[test]
    fn authz_is_an_ordered_gate() {
        let authz = AuthzManager;
        let viewer = UserIdentity {
            sub: "v".to_owned(),
            role: Role::Viewer,
        };
        let admin = UserIdentity {
            sub: "a".to_owned(),
            role: Role::Admin,
        };
        assert!(authz.authorize(&viewer, Role::Viewer));
        assert!(!authz.authorize(&viewer, Role::Operator));
        assert!(authz.authorize(&admin, Role::Operator));
    }
}
