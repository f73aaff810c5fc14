//! # Rosterbell Notify
//! Everything between "a task fired" and "a message left the building".
//!
//! ```text
//! DueSource ──▶ Dispatcher ──▶ JobQueue (SQLite) ──▶ WorkerPool ──▶ Mailer
//!                                                        │
//!                                                        └──▶ Broadcaster ──▶ Subscriptions
//! ```

pub mod broadcast;
pub mod delivery;
pub mod dispatch;
pub mod mailer;
pub mod pipeline;
pub mod queue;
pub mod records;
pub mod templates;

pub use broadcast::{
    BroadcastEvent, BroadcastHandle, Broadcaster, ChannelName, Subscriber, Subscription,
};
pub use delivery::{DeliveryOutcome, DeliveryWorker, DrainReport, WorkerPool};
pub use dispatch::{DispatchReport, Dispatcher};
pub use mailer::{LogMailer, MailError, Mailer, OutgoingMail, SendReceipt, SmtpMailer};
pub use pipeline::NotificationPipeline;
pub use queue::{JobQueue, NotificationJob};
pub use records::{DueNotice, DueSource, SqliteDueSource};
pub use templates::TemplateRegistry;
