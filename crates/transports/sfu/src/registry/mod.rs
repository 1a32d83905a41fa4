//! Producer and consumer registries

pub mod consumer;
pub mod producer;

pub use consumer::ConsumerRegistry;
pub use producer::{ProducerEntry, ProducerRegistry};
