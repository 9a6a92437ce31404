pub mod backoff;
pub mod connection;
pub mod error;
pub mod events;
pub mod monitoring;
pub mod publish;
pub mod tier;

pub use backoff::ExponentialBackoff;
pub use connection::ConnectionState;
pub use error::{CoreError, Result};
pub use events::{ChangeEvent, ChangeKind, EntityPayload, FeedId, SequenceToken};
pub use monitoring::{CountingHook, MonitoringHook, NoopHook};
pub use publish::{Publication, PublishReport, PublishSink};
pub use tier::TierLevel;
