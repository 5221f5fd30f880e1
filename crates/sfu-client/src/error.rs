use thiserror::Error;

#[derive(Debug, Error)]
pub enum SfuError {
    #[error("sfu circuit breaker is open, request rejected without attempting a call")]
    BreakerOpen,
    #[error("failed to connect to sfu at {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: tonic::transport::Error,
    },
    #[error("sfu rpc failed: {0}")]
    Rpc(#[from] tonic::Status),
}

impl SfuError {
    /// True for failures that should count against the circuit breaker.
    /// A rejected request (breaker already open) must not recount itself.
    pub fn counts_as_failure(&self) -> bool {
        !matches!(self, SfuError::BreakerOpen)
    }
}
