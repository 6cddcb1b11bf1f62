//! Outbound SMS dispatcher
//!
//! Moves queued outgoing messages from one or more message stores to HTTP
//! SMS gateways. See [`scheduler`] for how work is selected each pass.

pub mod batching;
pub mod chunk_sender;
pub mod delivery;
pub mod error;
pub mod mock;
pub mod notifier;
pub mod scheduler;
pub mod store;
pub mod url_builder;

pub use batching::{partition, BatchingEngine, Chunk, ChunkKey};
pub use chunk_sender::{ChunkOutcome, ChunkPolicy, ChunkSender};
pub use delivery::{is_accepted, DeliveryClient, HttpDeliveryClient, HttpDeliveryConfig};
pub use error::{ChunkError, DeliveryError, NotifyError, RoutingError, StoreError, StorePassError};
pub use notifier::{NoOpNotifier, Notifier, SmtpNotifier, SmtpNotifierConfig};
pub use scheduler::{
    PassOutcome, SchedulerConfig, StoreHandle, StorePassReport, StoreScheduler, StoreState,
};
pub use store::{MessageOrder, MessageQuery, MessageStore, StoreTransaction};
pub use url_builder::{build_send_url, encode_param, Routing};
