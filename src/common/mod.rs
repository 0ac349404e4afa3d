// Types shared by the store, the write path and the live bindings
pub mod error;
pub mod models;

pub use error::{ChatError, ChatResult, StoreError, WriteStep};
pub use models::*;
