//! # Flowcast Protocol
//!
//! **Wire-level types for the Flowcast event streaming broker.**
//!
//! Defines the closed event model (tagged types with per-type payload
//! shapes), structural validation and sanitization, canonical JSON
//! serialization, the broker error taxonomy with HTTP/WebSocket surface
//! mappings, and the client/server frame envelopes used by both transports.
//!
//! Internal representations stay strongly typed; conversion to the ad-hoc
//! JSON shapes of the wire happens here and only here.

pub mod error;
pub mod event;
pub mod filter;
pub mod frames;
pub mod validation;

pub use error::{BrokerError, ErrorBody};
pub use event::{
    CommandData, Dimensions, EventData, EventType, FaultData, ReasoningData, ScreenshotData,
    StatusData, StatusDetails, StreamEvent, VariableData, generate_event_id,
};
pub use filter::{FilterSpec, TimeRange};
pub use frames::{
    AckMetadata, ClientFrame, FilterUpdatePayload, FrameError, ReplayRequest, ReplaySummary,
    ServerFrame, UnsubscribePayload, sse_names, wrap_event_frame,
};
pub use validation::{EventCodec, ValidationOutcome};

/// Result type for protocol-level operations
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Protocol version advertised in `connection_ack` frames and error metadata
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");
