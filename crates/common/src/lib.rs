pub mod context;
pub mod logging;

pub use context::LogContext;
pub use logging::{
    init_logging,
    JsonLayer,
    LoggingConfig,
    StructuredLogEntry,
};
