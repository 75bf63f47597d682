//! Update dispatch framework for Telegram-style bots.
//!
//! Updates from one chat are handled one at a time and in arrival
//! order; different chats run concurrently on a fixed worker pool.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod limiter;
pub mod locale;
pub mod router;
pub mod storage;
pub mod transport;
pub mod update;

pub use config::Config;
pub use dispatch::{DispatchSettings, Dispatcher};
pub use error::{Error, Result, ValidationError};
pub use router::{Action, Context, Router};
pub use update::{ChatId, MessageId, Update, UserId};
