pub mod common {
    tonic::include_proto!("common");
}

pub mod ws {
    tonic::include_proto!("ws");
}

pub mod sfu {
    tonic::include_proto!("sfu");
}

pub use common::*;
pub use sfu::{
    CreateSessionRequest, CreateSessionResponse, DeleteSessionRequest, DeleteSessionResponse,
    HandleSignalRequest, HandleSignalResponse, HealthCheckRequest, HealthCheckResponse,
    ListenEventsRequest, SfuEvent, SignalPayload, TrackAdded, health_client, health_server,
    sfu_orchestration_client, sfu_orchestration_server,
};
pub use ws::*;
