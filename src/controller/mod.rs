/// 发布控制器
///
/// - `PublishMachine`: 纯状态机，输入事件输出动作
/// - `PublishController`: 在 tokio 上执行动作并把结果送回状态机
///
/// 同一时刻最多一个发布会话处于发送中；失败后先轮换同批路由，
/// 路由耗尽或批次过期后按指数退避重新解析。

mod machine;
mod runner;

pub use machine::{ControllerState, Effect, Event, PublishMachine, RetryPolicy};
pub use runner::{ControllerConfig, ControllerHandle, PublishController};
