// crates/core/src/lib.rs
pub mod cache;
pub mod error;
pub mod history;
pub mod paths;
pub mod repository;
pub mod scanner;
pub mod tail;
pub mod transcript;
pub mod types;

pub use cache::{IndexCache, IndexSnapshot};
pub use error::*;
pub use repository::{DeleteOutcome, RefreshOutcome, SessionRepository};
pub use types::*;
