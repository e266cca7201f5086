//! Drishti job pipeline.
//!
//! Moves an image through fetch, inference, persistence and notification,
//! either inline for an HTTP request or from a queue with at-least-once
//! delivery.

pub mod consumer;
pub mod context;
pub mod gateway;
pub mod notifier;
pub mod object_store;
pub mod pipeline;
pub mod queue;

pub use consumer::{ConsumerSettings, ConsumerStats, QueueConsumer};
pub use context::ServiceContext;
pub use gateway::ArtifactGateway;
pub use notifier::{notifier_from_config, CallbackNotifier, CallbackPayload, HttpCallbackNotifier, NoopNotifier};
pub use object_store::{open_object_store, HttpObjectStore, LocalObjectStore, ObjectStore};
pub use pipeline::{JobFailure, JobPipeline, JobReport, JobState, PredictionJob, QueueMessage};
pub use queue::{InMemoryQueue, JobQueue, ReceivedMessage};
