pub mod gateway;
pub mod resources;
pub mod service_registry;
pub mod task_scheduler;
pub mod tasks;

pub use gateway::GatewayCore;
pub use resources::AppResources;
pub use service_registry::AppServices;
pub use task_scheduler::{ScheduledTask, ScheduledTaskBuilder, TaskScheduler};
pub use tasks::{AppTasks, TaskType};
