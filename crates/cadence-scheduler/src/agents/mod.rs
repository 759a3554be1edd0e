//! Agent registry and per-agent state machine.

mod instance;
mod registry;

pub use instance::AgentInstance;
pub use registry::AgentRegistry;
