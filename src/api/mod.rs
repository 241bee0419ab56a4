mod error;
pub mod resize;

pub use error::ApiError;
