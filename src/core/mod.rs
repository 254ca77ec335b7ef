pub mod cache;
pub mod conflict;
pub mod engine;
pub mod paths;
pub mod planner;
pub mod transfer;

pub use cache::{CacheSource, CachedEntry, EntryKind, PathCache};
pub use conflict::{
    ChannelPrompt, Collision, CollisionAction, CollisionDecision, CollisionKind, CollisionPrompt,
    CollisionResolver, PolicyPrompt, PromptRequest,
};
pub use engine::PushService;
pub use planner::{DirectoryPlanner, ExclusionFilter, GlobFilter, NoExclusions};
pub use transfer::{
    ChannelObserver, Direction, QueueEvent, QueueObserver, QueueProgress, RunState, RunSummary,
    TaskStatus, TracingObserver, TransferQueue, TransferRequest, TransferTask,
};
