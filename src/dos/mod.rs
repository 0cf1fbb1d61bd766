//! Admission control: rules, rate tracking and the engine that combines them.

pub mod audit;
pub mod clock;
pub mod rule;
pub mod threshold;

mod evaluator;
mod registry;
mod tracker;
mod window;

pub use audit::{AuditReason, AuditRecord, Decision};
pub use clock::{Clock, ManualClock, SystemClock};
pub use evaluator::{DosEngine, EngineBuilder};
pub use registry::RuleRegistry;
pub use rule::{Action, Rule, RuleBuilder, RuleType};
pub use threshold::{parse_duration, parse_threshold, RateUnit, Threshold};
pub use tracker::{RateTracker, WindowSnapshot};
pub use window::{Admission, RateWindow, WindowKey, BUCKETS};
