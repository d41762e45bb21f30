//! HTTP middleware shared by the API routers.

pub mod logging;

pub use logging::request_logging;
