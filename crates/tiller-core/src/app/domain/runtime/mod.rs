mod actor;
mod agent_loop;
mod registry;
mod steering;


pub use actor::{ActorContext, ActorHandle, ActorProcessError, ProcessStatus, Teardown};
pub use agent_loop::AgentLoopError;
pub use registry::{RegistryError, SessionRegistry, restore_state};
pub use steering::{SteerCommand, SteeringChannel};
