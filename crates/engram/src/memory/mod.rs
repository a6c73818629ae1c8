//! Memory types and operations
//!
//! Per-session encoded memory: the append-only store, the reabsorption
//! policy that moves old records back into context, the similarity index
//! used for recall, and the manager that ties them together.

pub mod manager;
pub mod reabsorption;
pub mod similarity;
pub mod store;
pub mod tokens;
pub mod types;

pub use manager::{
    MemoryManager, RecalledMemory, Session, SessionHandle, SessionRegistry, TurnReport,
};
pub use reabsorption::{
    ControllerState, ReabsorptionController, ReabsorptionPolicy, ReinjectionBlock,
    SkippedRecord, TriggerReason,
};
pub use similarity::{ScoredRecord, SimilarityIndex};
pub use store::{MemoryStore, PutOutcome};
pub use tokens::count_tokens;
pub use types::{
    FilterReason, HistoryEntry, MemoryRecord, MetricsSnapshot, RecordId, RecordState,
    SessionMeta, SessionMetrics,
};
