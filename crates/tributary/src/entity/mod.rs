//! SeaORM entity definitions for the state tables.

pub mod collector_state;
pub mod prelude;
pub mod subtask_state;
