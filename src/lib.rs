pub mod commands;
pub mod config;
pub mod error;
pub mod j2534;
pub mod session;
pub mod state;

pub use error::{ErrorKind, PassThruError, Result};
pub use state::AppState;
