mod cancel;
mod container_service;
mod orchestrator;
pub mod resolver;
mod system_service;

pub use cancel::CancelToken;
pub use container_service::{ContainerService, PULL_ATTEMPTS};
pub use orchestrator::{AttachedService, DAEMON_POLL_INTERVAL, LOG_LOOKBACK, Orchestrator, select};
pub use resolver::{ServiceTable, resolve};
pub use system_service::SystemService;
