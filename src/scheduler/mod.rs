pub mod assigner;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod task;

pub use assigner::{Assigner, ReapReport};
pub use queue::TaskQueue;
pub use registry::{Session, SessionRegistry, SessionStatus};
pub use task::{Task, TaskStatus};
