use std::io::Cursor;

use rocket::{http::ContentType, http::Status, response::Responder};

use arkctrl::schema::{ErrorBody, ErrorEnvelope, ErrorKind};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
#[allow(dead_code)]
pub enum Error {
    // Input and state validation
    Validation(String),
    NotFound(String),
    Conflict(String),
    Precondition(String),

    // Process management
    ProcessFailed(String),

    // SteamCMD
    SteamCmdNotFound,
    DownloadFailed(String),
    AppUpdateFailed {
        exit_code: Option<i32>,
        last_lines: Vec<String>,
    },
    LockContended,

    // RCON
    RconConnectionRefused,
    RconAuthFailed,
    RconTimeout,
    RconProtocolError(String),
    RconTransportError(String),

    // Boundary
    Unauthorized(String),
    Forbidden(String),

    // Jobs
    Cancelled,

    // Generic wrappers around external error types
    Db(rusqlite::Error),
    Io(std::io::Error),
    Json(serde_json::error::Error),
    Reqwest(reqwest::Error),
    Zip(zip::result::ZipError),
    Internal(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::ValidationFailed,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Conflict(_) | Error::LockContended => ErrorKind::Conflict,
            Error::Precondition(_) => ErrorKind::PreconditionFailed,
            Error::ProcessFailed(_) => ErrorKind::ProcessFailed,
            Error::SteamCmdNotFound
            | Error::DownloadFailed(_)
            | Error::AppUpdateFailed { .. } => ErrorKind::SteamCmdFailed,
            Error::RconConnectionRefused => ErrorKind::RconConnectionRefused,
            Error::RconAuthFailed => ErrorKind::RconAuthFailed,
            Error::RconTimeout => ErrorKind::RconTimeout,
            Error::RconProtocolError(_) => ErrorKind::RconProtocolError,
            Error::RconTransportError(_) => ErrorKind::RconConnectionRefused,
            Error::Unauthorized(_) => ErrorKind::Unauthorized,
            Error::Forbidden(_) => ErrorKind::Forbidden,
            Error::Io(_) => ErrorKind::IOFailed,
            Error::Db(_) | Error::Json(_) | Error::Cancelled | Error::Internal(_) => {
                ErrorKind::Internal
            }
            Error::Reqwest(_) | Error::Zip(_) => ErrorKind::IOFailed,
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        let kind = self.kind();
        ErrorBody {
            kind,
            message: self.to_string(),
            retryable: kind.retryable(),
            cause: None,
        }
    }

    fn http_status(&self) -> Status {
        match self.kind() {
            ErrorKind::ValidationFailed => Status::BadRequest,
            ErrorKind::Unauthorized => Status::Unauthorized,
            ErrorKind::Forbidden => Status::Forbidden,
            ErrorKind::NotFound => Status::NotFound,
            ErrorKind::Conflict => Status::Conflict,
            ErrorKind::PreconditionFailed => Status::PreconditionFailed,
            ErrorKind::RconConnectionRefused | ErrorKind::RconTimeout => Status::ServiceUnavailable,
            _ => Status::InternalServerError,
        }
    }
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Validation(m)
            | Error::NotFound(m)
            | Error::Conflict(m)
            | Error::Precondition(m)
            | Error::ProcessFailed(m)
            | Error::DownloadFailed(m)
            | Error::Unauthorized(m)
            | Error::Forbidden(m)
            | Error::RconProtocolError(m)
            | Error::RconTransportError(m)
            | Error::Internal(m) => write!(f, "{}", m),
            Error::AppUpdateFailed {
                exit_code,
                last_lines,
            } => write!(
                f,
                "SteamCMD app_update failed with exit code {:?}: {}",
                exit_code,
                last_lines.join(" | ")
            ),
            other => write!(f, "{:?}", other),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Db(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::error::Error> for Error {
    fn from(e: serde_json::error::Error) -> Self {
        Error::Json(e)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Reqwest(e)
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(e: zip::result::ZipError) -> Self {
        Error::Zip(e)
    }
}

impl<'r> Responder<'r, 'static> for Error {
    fn respond_to(self, _request: &'r rocket::Request<'_>) -> rocket::response::Result<'static> {
        let status = self.http_status();
        let envelope = ErrorEnvelope {
            success: false,
            message: self.to_string(),
            code: Some(self.kind().to_string()),
        };
        let body = serde_json::to_string(&envelope)
            .unwrap_or_else(|_| r#"{"success":false,"message":"internal error"}"#.to_owned());
        rocket::Response::build()
            .status(status)
            .header(ContentType::JSON)
            .sized_body(body.len(), Cursor::new(body))
            .ok()
    }
}
