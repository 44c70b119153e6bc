//! Ordered, cancellable build steps with guaranteed cleanup.
//!
//! A builder's `run` typically creates a [`StateBag`] from its
//! [`BuildContext`](crate::component::BuildContext), builds a fresh list of
//! steps and hands both to a [`Runner`]. Every step whose `run` returned gets
//! its `cleanup` called exactly once, in reverse order, whether the run
//! finished, halted, was cancelled or panicked.

mod poll;
mod retry;
mod runner;
mod state;
mod steps;

pub use poll::{poll_until, PollConfig};
pub use retry::{retry_async, retry_step, RetryConfig, RetryStats};
pub use runner::{new_runner, BasicRunner, DebugPause, DebugRunner, PauseLocation, Runner, UiDebugPause};
pub use state::{keys, StateBag};
pub use steps::{Connector, StepConnect, StepProvision};

use async_trait::async_trait;

/// What the runner should do after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    Continue,
    Halt,
}

/// One unit of build work.
///
/// Failing steps record the error with [`StateBag::set_error`] and return
/// [`StepAction::Halt`].
#[async_trait]
pub trait Step: Send {
    fn name(&self) -> &str;

    async fn run(&mut self, state: &mut StateBag) -> StepAction;

    async fn cleanup(&mut self, _state: &mut StateBag) {}
}
