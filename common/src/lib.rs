// Palisade common library - main library exports

pub mod checksum;
pub mod commands;
pub mod lifecycle;
pub mod messages;
pub mod queries;
pub mod time;
pub mod types;

// Flattened re-exports
pub use self::lifecycle::{BlockState, LifecycleError};
pub use self::types::*;
