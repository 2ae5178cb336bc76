//! `autopilot-cms`: the time-triggered CMS rows the engine sweeps over.
//!
//! Every type here is pure: trigger predicates (`is_due_*`) and transitions
//! take `now` explicitly and never touch storage.

pub mod content;
pub mod export;
pub mod lock;
pub mod retention;
pub mod schedule;
pub mod version;

pub use content::{ContentItem, PublishStatus};
pub use export::{AnalyticsExport, ExportFrequency, ScheduledExport};
pub use lock::ContentLock;
pub use retention::RetentionPolicy;
pub use schedule::{Frequency, RecurrenceRule, RecurringSchedule, ScheduleAdvance};
pub use version::ContentVersion;
