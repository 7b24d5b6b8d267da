pub mod clock;
pub mod config;
pub mod domain;
pub mod engine;
pub mod errors;
pub mod events;
pub mod matching;
pub mod quota;

pub use clock::{Clock, ManualClock, SystemClock};
pub use domain::lead::{LeadId, LeadInput};
pub use domain::outcome::{
    AssignmentOutcome, AssignmentStatus, AttemptResult, CandidateAttempt, UnassignedReason,
};
pub use domain::quota::{PeriodKind, QuotaKey};
pub use domain::rule::{AssignmentRule, OrgId, RuleCaps, RuleDraft, RuleId, UserId, ZipPattern};
pub use engine::{AssignmentEngine, AssignmentError, EngineConfig, RuleStore, RuleStoreError};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use events::{EventEmitter, InMemoryEventEmitter, LeadEvent, LeadEventType, TracingEventEmitter};
pub use matching::{explain, find_candidates, MatchReport};
pub use quota::{
    InMemoryQuotaCounterStore, QuotaCounterStore, QuotaGate, QuotaStoreError, QuotaUsage,
    Reservation,
};
