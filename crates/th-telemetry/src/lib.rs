//! Logging and request tracing for termhub services.
//!
//! - **Logging**: human-readable or JSON output via `tracing-subscriber`,
//!   selected by the `[logging]` config section
//! - **Request ids**: Axum middleware that tags every HTTP request with an
//!   `x-request-id` and runs it inside a span carrying that id

pub mod logging;
pub mod request_id;
