//! Shared types for the futarchy proposal lifecycle engine: the closed sum
//! types that gate exhaustive matching at finalize/scheduler dispatch, the
//! error taxonomy of the error-handling design, and the wire structs for
//! the persistence contract.

pub mod errors;
pub mod ids;
pub mod rows;
pub mod status;

pub use errors::EngineError;
pub use ids::{ModeratorId, ProposalId};
pub use status::{PriceSourceState, ProposalStatus, ScheduledTaskKind, VaultState};
