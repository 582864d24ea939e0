use crate::error::{Error, Result};
use crate::ServerMode;

pub mod buildinfo;
pub mod configs;
pub mod jobs;
pub mod lock;
pub mod options;
pub mod provisioning;
pub mod rcon;
pub mod servers;
pub mod system;

/// Lifecycle and RCON endpoints only make sense for natively hosted
/// servers; `docker` / `hybrid` deployments drive containers instead.
pub fn ensure_native(mode: &ServerMode) -> Result<()> {
    match mode {
        ServerMode::Native => Ok(()),
        other => Err(Error::Validation(format!(
            "operation requires SERVER_MODE=native, this instance runs '{}'",
            other
        ))),
    }
}
