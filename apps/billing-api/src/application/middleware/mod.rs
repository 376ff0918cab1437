pub mod auth;

pub use auth::{
    AuthenticatedUser, authenticate, bearer_token, resolve_session, session_auth, session_key,
};
