pub mod config;
pub mod error;
pub mod stream;
pub mod trace;

pub use config::{
    Config, ConfigError, ConfigSeverity, EventBusConfig, PlannerConfig, RegistryConfig,
    SchedulerConfig, SessionConfig, VadConfig,
};
pub use error::{Error, Result};
pub use stream::{BoxFuture, BoxStream, ToolProgress, ToolProgressState, Usage};
pub use trace::TraceEvent;
