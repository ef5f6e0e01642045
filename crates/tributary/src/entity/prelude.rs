//! Common re-exports for convenient entity usage.

pub use super::collector_state::{
    ActiveModel as CollectorStateActiveModel, Column as CollectorStateColumn,
    Entity as CollectorState, Model as CollectorStateModel,
};
pub use super::subtask_state::{
    ActiveModel as SubtaskStateActiveModel, Column as SubtaskStateColumn,
    Entity as SubtaskState, Model as SubtaskStateModel,
};
