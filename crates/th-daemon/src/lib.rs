//! termhub server process: wires config, backend, registry and hub together
//! and runs the HTTP/websocket server next to the supervisor sweep.

pub mod daemon;
pub mod supervisor;

pub use daemon::Daemon;
pub use supervisor::{SweepReport, Supervisor};
