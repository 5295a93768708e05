use thiserror::Error;

/// Errors a forecasting cycle can raise.
///
/// Only [`ForecastError::Config`] is fatal; everything else is caught at the
/// scheduler boundary, logged, and retried implicitly on the next tick.
#[derive(Debug, Error)]
pub enum ForecastError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("time-series store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("store query failed: {0}")]
    QueryError(String),

    #[error("weather fetch failed: {0}")]
    WeatherFetch(String),

    #[error("insufficient data: {got} training rows, need at least {need}")]
    InsufficientData { got: usize, need: usize },

    #[error("model training failed: {0}")]
    Training(String),
}

impl ForecastError {
    /// Short kind tag used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            ForecastError::Config(_) => "config",
            ForecastError::StoreUnavailable(_) => "store_unavailable",
            ForecastError::QueryError(_) => "query",
            ForecastError::WeatherFetch(_) => "weather_fetch",
            ForecastError::InsufficientData { .. } => "insufficient_data",
            ForecastError::Training(_) => "training",
        }
    }

    /// Fatal errors abort the process at startup; per-cycle errors never do.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ForecastError::Config(_))
    }
}

impl From<reqwest::Error> for ForecastError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() || error.is_connect() {
            ForecastError::StoreUnavailable(error.to_string())
        } else {
            ForecastError::QueryError(error.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, ForecastError>;
