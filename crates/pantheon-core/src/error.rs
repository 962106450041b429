use thiserror::Error;

/// Errors raised while configuring the engine process.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Tracing initialization failed: {0}")]
    TracingInit(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
