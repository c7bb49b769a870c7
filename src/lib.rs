pub mod engine;
pub mod metrics;
pub mod node;
pub mod utils;

// Re-export engine module
pub use engine::*;
pub use utils::error::{ErrorKind, TaskError};
