//! Drift monitor daemon library - exposes modules for testing.

pub mod detector;
pub mod evidence;
pub mod orchestrator;
pub mod predictor;
pub mod shutdown;
pub mod status;
pub mod transport;
pub mod watcher;
pub mod window_source;

pub use orchestrator::{Collaborators, Orchestrator, OrchestratorStats};
pub use shutdown::{Shutdown, ShutdownHandle};
