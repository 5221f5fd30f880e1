//! Client for the external SFU orchestration service.
//!
//! Collapsed from `dispatcher::application::sfu_grpc_client`, which dialed
//! whichever node address an etcd-backed registry handed back per room.
//! A single configured `sfu_address` replaces that lookup; the request/
//! response shape and the "connect lazily, map transport errors to
//! `Status::unavailable`" style are kept, the multi-node lookup is not.

mod circuit_breaker;
mod error;

pub use circuit_breaker::{BreakerState, CircuitBreaker, CircuitBreakerConfig};
pub use error::SfuError;

use std::pin::Pin;

use signaling_proto::health_client::HealthClient;
use signaling_proto::sfu_orchestration_client::SfuOrchestrationClient;
use signaling_proto::{
    CreateSessionRequest, CreateSessionResponse, DeleteSessionRequest, DeleteSessionResponse,
    HandleSignalRequest, HandleSignalResponse, HealthCheckRequest, HealthCheckResponse,
    ListenEventsRequest, SfuEvent,
};
use tokio_stream::Stream;
use tonic::transport::Channel;
use tonic::Request;

pub type SfuEventStream = Pin<Box<dyn Stream<Item = Result<SfuEvent, SfuError>> + Send>>;

/// Point-to-point and streaming client for one SFU address, with a circuit
/// breaker wrapping every RPC (closed/open/half-open states).
pub struct SfuClient {
    address: String,
    breaker: CircuitBreaker,
}

impl SfuClient {
    pub fn new(address: impl Into<String>, breaker_config: CircuitBreakerConfig) -> Self {
        Self {
            address: address.into(),
            breaker: CircuitBreaker::new(breaker_config),
        }
    }

    pub fn with_metrics(mut self, state_gauge: prometheus::IntGauge, failures_counter: prometheus::IntCounter) -> Self {
        self.breaker.with_metrics(state_gauge, failures_counter);
        self
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    async fn connect(&self) -> Result<SfuOrchestrationClient<Channel>, SfuError> {
        SfuOrchestrationClient::connect(self.address.clone())
            .await
            .map_err(|source| SfuError::Connect { address: self.address.clone(), source })
    }

    async fn connect_health(&self) -> Result<HealthClient<Channel>, SfuError> {
        HealthClient::connect(self.address.clone())
            .await
            .map_err(|source| SfuError::Connect { address: self.address.clone(), source })
    }

    pub async fn create_session(
        &self,
        request: CreateSessionRequest,
    ) -> Result<CreateSessionResponse, SfuError> {
        let guard = self.breaker.guard()?;
        let result = async {
            let mut client = self.connect().await?;
            let response = client.create_session(Request::new(request)).await?;
            Ok(response.into_inner())
        }
        .await;
        guard.record(&result);
        result
    }

    pub async fn handle_signal(
        &self,
        request: HandleSignalRequest,
    ) -> Result<HandleSignalResponse, SfuError> {
        let guard = self.breaker.guard()?;
        let result = async {
            let mut client = self.connect().await?;
            let response = client.handle_signal(Request::new(request)).await?;
            Ok(response.into_inner())
        }
        .await;
        guard.record(&result);
        result
    }

    pub async fn delete_session(
        &self,
        request: DeleteSessionRequest,
    ) -> Result<DeleteSessionResponse, SfuError> {
        let guard = self.breaker.guard()?;
        let result = async {
            let mut client = self.connect().await?;
            let response = client.delete_session(Request::new(request)).await?;
            Ok(response.into_inner())
        }
        .await;
        guard.record(&result);
        result
    }

    /// Opens the server-streaming event subscription. The breaker only
    /// guards the initial connect; once the stream is open, reconnect policy
    /// on drop is the caller's responsibility (the `sfu_adapter` in the
    /// signalling binary owns the bounded-backoff reconnect loop).
    pub async fn listen_events(
        &self,
        request: ListenEventsRequest,
    ) -> Result<SfuEventStream, SfuError> {
        let guard = self.breaker.guard()?;
        let result = async {
            let mut client = self.connect().await?;
            let stream = client.listen_events(Request::new(request)).await?.into_inner();
            Ok(stream)
        }
        .await;
        guard.record(&result);
        let stream = result?;
        Ok(Box::pin(tokio_stream::StreamExt::map(stream, |item| {
            item.map_err(SfuError::from)
        })))
    }

    pub async fn health_check(&self, service: &str) -> Result<HealthCheckResponse, SfuError> {
        let guard = self.breaker.guard()?;
        let result = async {
            let mut client = self.connect_health().await?;
            let response = client
                .check(Request::new(HealthCheckRequest { service: service.to_string() }))
                .await?;
            Ok(response.into_inner())
        }
        .await;
        guard.record(&result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_client_starts_with_closed_breaker() {
        let client = SfuClient::new("http://127.0.0.1:50051", CircuitBreakerConfig::default());
        assert_eq!(client.breaker_state(), BreakerState::Closed);
    }
}
