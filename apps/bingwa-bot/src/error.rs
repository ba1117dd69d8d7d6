use thiserror::Error;

/// Failures of a single PayHero call. No variant is retried automatically.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Network failure, provider-side 5xx or an undecodable reply.
    #[error("payment gateway unavailable: {0}")]
    Unavailable(String),

    /// Business-level decline such as an invalid phone or missing channel setup.
    #[error("payment rejected by gateway: {0}")]
    Rejected(String),

    /// No answer within the bounded wait.
    #[error("payment gateway timed out")]
    Timeout,
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Timeout
        } else {
            GatewayError::Unavailable(err.to_string())
        }
    }
}

#[derive(Error, Debug)]
pub enum BotError {
    /// Selection or text that does not fit the current step.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid phone number format")]
    InvalidPhoneFormat,

    #[error("unknown bundle: {0}")]
    UnknownBundle(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("user store unavailable: {0}")]
    StorageUnavailable(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("delivery failed: {0}")]
    Notify(#[from] anyhow::Error),
}

pub type BotResult<T> = Result<T, BotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_errors_convert_into_bot_error() {
        let err: BotError = GatewayError::Timeout.into();
        assert!(matches!(err, BotError::Gateway(GatewayError::Timeout)));
        assert_eq!(err.to_string(), "payment gateway timed out");
    }
}
