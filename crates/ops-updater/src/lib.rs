pub mod api;
pub mod auth;
pub mod executor;
pub mod models;

pub use api::{router, ApiState};
pub use auth::{get_or_create_secret, validate_secret};
pub use executor::{ExecutorConfig, UpdateExecutor};
pub use models::{
    Color, Diagnostics, HistoryEntry, OperationState, RollbackRequest, SidecarStatus, UpdateRequest, UpdateResult, UpdateResultStatus,
    UpdateRuntimeState,
};
