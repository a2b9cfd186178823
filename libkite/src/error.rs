//! Top-level error type for a kite run.
//!
//! Each concern owns its own error enum; [`KiteError`] groups the ones that
//! end a run. Hook failures never end a run and are reported per hook instead.

use thiserror::Error;

pub use crate::api::ApiError;
pub use crate::config::ConfigError;
pub use crate::dispatch::queue::TransportError;
pub use crate::store::PersistError;

#[derive(Error, Debug)]
pub enum KiteError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("platform api error: {0}")]
    Api(#[from] ApiError),
    #[error("queue transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("job cursor error: {0}")]
    Persist(#[from] PersistError),
}

pub type Result<T, E = KiteError> = std::result::Result<T, E>;
