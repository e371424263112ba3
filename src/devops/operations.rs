//! High-level epic operations.
//!
//! An epic moves through registered stages. Each stage is one worker run
//! coordinated by a task card; the router turns the run's declared signals
//! into the next stage or a human escalation.

pub mod agent_lifecycle;
pub mod epic;
pub mod escalation;
pub mod monitor;
pub mod orchestration;
pub mod patterns;
pub mod router;
pub mod task_card;

// Re-export for convenience
pub use agent_lifecycle::*;
pub use epic::*;
pub use escalation::*;
pub use monitor::*;
pub use orchestration::*;
pub use patterns::*;
pub use router::*;
pub use task_card::*;
