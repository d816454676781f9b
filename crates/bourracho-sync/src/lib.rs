pub mod analysis;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod locks;
pub mod mutators;
pub mod reconcile;

pub use engine::{Engine, EngineConfig};
pub use error::{SyncError, SyncResult};
