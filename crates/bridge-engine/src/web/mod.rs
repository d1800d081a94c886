//! Web control HTTP service (§6 "Web API"). Serves `/api/devices...` on `WEB_PORT`,
//! separate from the DLNA control URLs on `HTTP_PORT`.

pub mod routes;

pub use routes::{router, AppState};
