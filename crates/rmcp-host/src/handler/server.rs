//! Server-side capability handling: the [`Registry`] of tools, resources and
//! prompts, and the [`Dispatcher`] that serves capability requests from it.

pub mod common;
pub mod dispatcher;
pub mod prompt;
pub mod registry;
pub mod resource;
pub mod tool;

pub use dispatcher::Dispatcher;
pub use prompt::{Arguments, PromptRoute};
pub use registry::{CapabilityProvider, RegistrationPolicy, Registry, RegistryError};
pub use resource::ResourceRoute;
pub use tool::{Parameters, ToolCallError, ToolRoute};
