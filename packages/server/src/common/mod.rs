pub mod error;
pub mod hash;
pub mod urls;

pub use error::{error_chain, ApiError, ApiResult, ErrorBody};
pub use urls::{normalize_profile_url, Platform};
