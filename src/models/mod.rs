mod auth_log;
mod blacklist;
mod connection_log;
mod delivery_attempt;
mod domain;
mod greylist;
mod message;
mod user;

pub use auth_log::*;
pub use blacklist::*;
pub use connection_log::*;
pub use delivery_attempt::*;
pub use domain::*;
pub use greylist::*;
pub use message::*;
pub use user::*;

use thiserror::Error;

/// Top-level error taxonomy. Variants map roughly onto the error classes
/// from the protocol design: ProtocolError and AuthError are represented at
/// the SMTP layer directly as response codes, the rest surface here.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Database(sqlx::Error),
    #[error("foreign key violation")]
    ForeignKeyViolation,
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
    #[error("email authentication error: {0}")]
    MailAuth(#[from] mail_auth::Error),
    #[error("mail send error: {0}")]
    MailSend(#[from] mail_send::Error),
    #[error("dns resolution error: {0}")]
    Dns(#[from] hickory_resolver::ResolveError),
    #[error("{0}")]
    NotFound(&'static str),
    #[error("conflict")]
    Conflict,
    #[error("invalid utf8")]
    FromUtf8(#[from] std::string::FromUtf8Error),
    #[error("too many requests, try again later")]
    TooManyRequests,
    #[error("rsa key error: {0}")]
    Rsa(#[from] rsa::Error),
    #[error("pkcs8 error: {0}")]
    Pkcs8(String),
}

impl From<sqlx::Error> for Error {
    fn from(sql: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &sql {
            if db_err.is_unique_violation() {
                return Error::Conflict;
            }
            if db_err.is_foreign_key_violation() {
                return Error::ForeignKeyViolation;
            }
        }
        if matches!(sql, sqlx::Error::RowNotFound) {
            return Error::NotFound("not found");
        }
        Error::Database(sql)
    }
}
