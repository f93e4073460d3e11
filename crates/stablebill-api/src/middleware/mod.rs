pub mod api_key_auth;

pub use api_key_auth::{api_key_auth, hash_api_key, AuthedAccount};
