// tsrelay-api - HTTP surface for the MPEG-TS relay
//
// - http/proxy   - stream delivery and control endpoints under /proxy/ts
// - http/status  - channel diagnostics
// - http/health  - liveness probe

pub mod http;

pub use http::{create_router, AppError, AppResult, AppState};
