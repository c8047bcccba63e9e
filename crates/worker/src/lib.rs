//! ChatRelay Worker
//!
//! Consumes chat requests from a broker queue, generates replies through an
//! inference service, and publishes correlated responses.

pub mod broker;
pub mod generation;
pub mod pool;
pub mod relay;
pub mod store;

pub use broker::{Acknowledger, AmqpAcker, AmqpPublisher, BrokerConnection, ResponsePublisher};
pub use generation::{HttpGenerator, TextGenerator};
pub use pool::{Inbound, MessageHandler, SlotState, WorkerPool};
pub use relay::{ChatWorker, Outcome, RelaySettings};
pub use store::{ExchangeRecord, MemoryStore, RecordStore};
