pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod storage;

pub use config::PushConfig;
pub use core::{PushService, RunSummary, TransferQueue};
pub use error::{Result, TransferError};
