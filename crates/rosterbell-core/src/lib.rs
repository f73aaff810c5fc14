//! # Rosterbell Core
//! Configuration, error type and the domain types shared by the scheduler and
//! the notification pipeline.

pub mod config;
pub mod error;
pub mod types;

pub use config::RosterbellConfig;
pub use error::{Result, RosterbellError};
pub use types::{FieldValue, NotificationKind, Payload, Recipient, Snapshot};
