pub mod api_key_auth;
pub mod request_id;

pub use api_key_auth::{api_key_auth_middleware, Principal};
pub use request_id::{request_id_middleware, RequestId};
