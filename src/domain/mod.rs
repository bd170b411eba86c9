mod container;
pub mod error;
pub mod service;
pub mod traits;

pub use container::{Container, ContainerState, LaunchOptions, scoped_name};
pub use error::{ConfigError, RuntimeError, UsageError};
pub use service::{
    Condition, HostBinding, HostFacts, Mount, OnlyIf, PortSpec, ServiceDefinition, Settings,
    VolumeSpec,
};
pub use traits::ContainerRuntime;
