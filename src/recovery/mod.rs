//! The recovery engine: classification, scheduling, pattern detection and
//! the orchestrator that drives quarantined jobs back to the primary queue.

pub mod backoff;
pub mod calendar;
pub mod classifier;
pub mod clock;
pub mod detector;
pub mod job;
pub mod log;
pub mod orchestrator;
pub mod pattern;
pub mod query;
pub mod stats;

pub use calendar::{BusinessCalendar, BusinessWindow, StaticCalendar};
pub use classifier::{ClassifiedError, ErrorType, FailureType, Priority};
pub use clock::{Clock, ManualClock, SystemClock};
pub use detector::PatternDetector;
pub use job::{DeadLetterJob, DeadLetterStatus, FailedJobDescriptor};
pub use log::{JobRecoveryLog, RecoveryLogStatus, RecoveryStrategy, RecoveryTrigger};
pub use orchestrator::{DispatchOutcome, Orchestrator, ScheduleOptions, SweepReport};
pub use pattern::{FailurePattern, PatternSeverity, PatternStatus, PatternType};
pub use query::{JobFilter, Page, PageRequest, PatternFilter};
pub use stats::{DeadLetterJobStats, PerformanceReport};
