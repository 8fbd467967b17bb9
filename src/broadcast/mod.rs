pub mod coordinator;
pub mod registry;

pub use coordinator::UpdateCoordinator;
pub use registry::{SinkError, SinkId, SubscriberRegistry, SubscriberSink};
