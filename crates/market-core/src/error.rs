use thiserror::Error;

#[derive(Error, Debug)]
pub enum MarketError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("No market session available: {0}")]
    NoMarketSession(String),

    #[error("No market buyers: {0}")]
    NoMarketBuyers(String),

    #[error("No market users: {0}")]
    NoMarketUsers(String),

    #[error("Strategy '{name}' not found. Available strategies: {available}")]
    StrategyNotFound { name: String, available: String },

    #[error("Strategy '{strategy}' failed for resource '{resource}': {message}")]
    StrategyExecution {
        strategy: String,
        resource: String,
        message: String,
    },

    #[error("Strategy '{0}' must be fitted before calling predict()")]
    NotFitted(String),

    #[error("Forecast error: {0}")]
    Forecast(String),

    #[error("Insufficient data for scoring: {0}")]
    ScoringInsufficientData(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("Internal server error: {0}")]
    InternalServer(String),

    #[error("Login failed: {0}")]
    Login(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Backup failure: {0}")]
    Backup(String),
}
