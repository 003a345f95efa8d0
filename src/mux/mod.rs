//! Send-side multiplexing.
//!
//! | Module | Description |
//! |--------|-------------|
//! | `pending` | Insertion-ordered table of in-flight operations |
//! | `multiplexer` | Id allocation, write-or-queue, housekeeping, correlation |

// ============================================================================
// Submodules
// ============================================================================

/// Multiplexer state machine.
pub mod multiplexer;

/// Pending operation table.
pub mod pending;

// ============================================================================
// Re-exports
// ============================================================================

pub use multiplexer::{Inbound, Multiplexer, ResultHandle};
pub use pending::{Deadline, OperationKind, OperationState, PendingOperation, PendingTable};
