//! Authentication Module
//! Mission: Secure the web API with bcrypt logins and JWT tokens

pub mod api;
pub mod jwt;
pub mod middleware;
pub mod models;

pub use api::AuthState;
pub use jwt::JwtHandler;
pub use middleware::auth_middleware;
