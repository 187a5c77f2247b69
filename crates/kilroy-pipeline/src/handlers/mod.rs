//! Shape-specific node handlers beyond the basic start/exit/conditional.

pub mod llm;
pub mod manager;
pub mod parallel;
pub mod tool;
pub mod wait_human;

pub use llm::CodergenHandler;
pub use manager::ManagerLoopHandler;
pub use parallel::{FanInHandler, ParallelHandler};
pub use tool::ToolHandler;
pub use wait_human::WaitHumanHandler;
