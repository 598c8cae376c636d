//! Turning arbitrary photo bytes into display-safe JPEGs.

mod normalize;
mod orientation;
mod raw;
mod worker;

use thiserror::Error;

pub use normalize::{DEFAULT_QUALITY, fit_within_size, normalize};
pub use raw::{RAW_EXTENSIONS, is_raw_extension, raw_decoding_available};
pub use worker::{NormalizeRequest, NormalizeWorker};

#[derive(Debug, Error)]
pub enum NormalizeError {
    /// RAW input without the RAW capability compiled in.
    #[error("RAW photos aren't supported in this build (type: {extension}).")]
    Unsupported { extension: String },

    #[error("Image decode failed. {0}")]
    Decode(String),

    #[error("Image resize failed. {0}")]
    Resize(String),

    #[error("JPEG encode failed. {0}")]
    Encode(String),

    #[error("normalization cancelled")]
    Cancelled,
}

impl NormalizeError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, NormalizeError::Cancelled)
    }
}
