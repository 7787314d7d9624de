use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Communication error ({context}): {message}")]
    Communication { context: String, message: String },
    #[error("Statistics unavailable: {samples} sample(s) collected, need at least 2")]
    StatisticsUnavailable { samples: usize },
    #[error("Scan cancelled")]
    Cancelled,
    #[error("Equilibration at {setpoint} °C not stable after {attempts} attempt(s)")]
    EquilibrationExhausted { setpoint: f64, attempts: u32 },
    #[error("Scan worker thread panicked")]
    WorkerPanicked,
    #[error("IO error ({context}): {source}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl ScanError {
    pub fn communication(context: impl Into<String>, message: impl Into<String>) -> Self {
        ScanError::Communication {
            context: context.into(),
            message: message.into(),
        }
    }

    /// A deliberate stop rather than a failure
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ScanError::Cancelled)
    }
}

impl From<std::io::Error> for ScanError {
    fn from(source: std::io::Error) -> Self {
        ScanError::Io {
            source,
            context: "unspecified".to_string(),
        }
    }
}
