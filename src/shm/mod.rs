pub mod queue;
pub mod region;

pub use queue::{QUEUE_MAGIC, QUEUE_VERSION, QueueHeader, SharedQueue};
pub use region::SharedRegion;
