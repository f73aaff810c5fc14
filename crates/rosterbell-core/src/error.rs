//! Error type shared by all Rosterbell crates.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RosterbellError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Schedule error: {0}")]
    Schedule(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Mail error: {0}")]
    Mail(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RosterbellError>;
