//! Pub/sub plumbing between the hub and whatever drives the conversation.
//!
//! Six channels carry `{ id, data }` envelopes: sampling and elicitation
//! requests flow to the driver, their results flow back, and tool-call
//! results and progress are announced. Backends implement [`PubSub`].

pub mod channel;
pub mod driver;
pub mod error;
pub mod memory;
pub mod message;
pub mod publisher;
pub mod pubsub;
#[cfg(feature = "redis")]
pub mod redis_bus;

pub use {
    channel::Channel,
    driver::{ConversationDriver, DriverBridge, SessionFilter},
    error::{Error, Result},
    memory::MemoryBus,
    message::{
        BusMessage, ElicitationRequest, ElicitationResult, Envelope, Inbound, ProgressEvent,
        SamplingRequest, SamplingResult, ToolCallResultEvent, WithToolCall,
    },
    publisher::BusPublisher,
    pubsub::{PubSub, RawMessage, RejectCounter, Subscription},
};

#[cfg(feature = "redis")]
pub use redis_bus::RedisBus;
