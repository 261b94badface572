//! Workflow templates, instances and the step execution engine.

pub mod audit;
mod engine;
pub mod handler;
pub mod types;

pub use audit::AuditEntry;
pub use engine::{WorkflowEngine, WorkflowStats, WORKFLOW_SCOPE};
pub use handler::{StepContext, StepHandler, StubStepHandler};
pub use types::{
    ExecutionMode, StepStatus, TriggerEvent, WorkflowInstance, WorkflowStatus, WorkflowStep, WorkflowTemplate,
    WorkflowTrigger,
};
