//! The two chained job handlers: Plan (C9) and Execute (C10).

pub mod execute;
pub mod plan;

pub use execute::ExecuteJobHandler;
pub use plan::PlanJobHandler;
