pub mod bridge;
pub mod dispatch;
pub mod sink;
pub mod telegram;
