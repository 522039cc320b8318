pub mod ids;
pub mod priority;
pub mod record;
pub mod entry;

pub use ids::{JobId, LeaseToken, WorkerId};
pub use priority::JobPriority;
pub use record::{JobPatch, JobRecord, JobStatus, JobView};
pub use entry::{ClaimedJob, DeadLetterEntry, QueueDepth, QueueEntry};
