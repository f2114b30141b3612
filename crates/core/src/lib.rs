#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Shared models, wire schemas and plan validation for the job-step agent.

pub mod api;
pub mod model;
pub mod validation;

pub use model::{BuildPlan, CommandSpec, JobStepDocument, JobStepResult, Status};
pub use validation::{validate_plan, PlanError};
