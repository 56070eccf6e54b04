pub mod carbon;
pub mod dispatch;
pub mod notifier;
pub mod sweeper;
