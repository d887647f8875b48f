//! Session orchestration and failure recovery

mod recovery;
mod session;

pub use recovery::{RecoveryCoordinator, RollbackAction};
pub use session::Session;
