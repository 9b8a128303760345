//! # 异步任务模块
//!
//! 视频、图片等长耗时任务的存储与计费对账

mod model;
mod reconciler;

pub use model::{NewTask, TaskStore, TaskUpdate};
pub use reconciler::{AsyncTaskReconciler, ReconcileOutcome, TIMEOUT_REASON, TaskSettlement};
