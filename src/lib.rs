pub mod core;
pub mod plugins;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use crate::core::config::UpdaterConfig;
pub use crate::core::coordinator::UpdateCoordinator;
pub use crate::core::error::UpdaterError;
pub use crate::core::events::UpdaterEvent;
pub use crate::core::model::CheckParams;
pub use crate::plugins::registry::Collaborators;
