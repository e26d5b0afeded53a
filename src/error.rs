//! Domain error taxonomy for planning and execution.

/// Errors surfaced by the redemption engine.
///
/// Library functions return `anyhow::Result`; these variants are raised at the
/// points where a caller may want to react to the specific condition and can
/// be recovered with `err.downcast_ref::<RedeemError>()`.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RedeemError {
    #[error("Invalid code '{0}': expected 25 letters/digits after normalization")]
    InvalidCodeFormat(String),

    #[error("No supported platforms remain after normalization")]
    NoSupportedPlatforms,

    #[error("Source '{source_name}' unavailable: {reason}")]
    SourceUnavailable { source_name: String, reason: String },

    #[error("Unknown game: {0}")]
    UnknownGame(String),

    #[error("Invalid redeem mapping: {0}")]
    InvalidMapping(String),

    #[error("Run cancelled by caller")]
    Cancelled,
}

impl RedeemError {
    pub fn source_unavailable(source_name: &str, err: &anyhow::Error) -> Self {
        RedeemError::SourceUnavailable {
            source_name: source_name.to_string(),
            reason: format!("{:#}", err),
        }
    }
}
