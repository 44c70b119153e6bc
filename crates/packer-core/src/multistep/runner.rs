//! Running steps in order with reverse-order cleanup.

use super::{Step, StepAction, StateBag};
use crate::component::Ui;
use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Runs a sequence of steps against a state bag.
#[async_trait]
pub trait Runner: Send {
    async fn run(&mut self, state: &mut StateBag);
}

/// Runs every step in order until one halts or the run is cancelled.
pub struct BasicRunner {
    steps: Vec<Box<dyn Step>>,
}

impl BasicRunner {
    pub fn new(steps: Vec<Box<dyn Step>>) -> Self {
        Self { steps }
    }
}

#[async_trait]
impl Runner for BasicRunner {
    async fn run(&mut self, state: &mut StateBag) {
        run_steps(&mut self.steps, state, None).await;
    }
}

/// Where a [`DebugRunner`] pauses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseLocation {
    Before,
    Cleanup,
}

/// Called by a [`DebugRunner`] around every step. Returning `false` before a
/// step halts the run; cleanups always run.
#[async_trait]
pub trait DebugPause: Send + Sync {
    async fn pause(&self, location: PauseLocation, step: &str, state: &StateBag) -> bool;
}

/// Asks the user to press enter before every step.
pub struct UiDebugPause {
    ui: Arc<dyn Ui>,
}

impl UiDebugPause {
    pub fn new(ui: Arc<dyn Ui>) -> Self {
        Self { ui }
    }
}

#[async_trait]
impl DebugPause for UiDebugPause {
    async fn pause(&self, location: PauseLocation, step: &str, _state: &StateBag) -> bool {
        let message = match location {
            PauseLocation::Before => format!("Pausing before the next step: {step}"),
            PauseLocation::Cleanup => format!("Pausing before cleanup of step '{step}'"),
        };
        match self
            .ui
            .ask(&format!("{message}. Press enter to continue."))
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!("Debug pause failed: {}", e);
                false
            }
        }
    }
}

/// Like [`BasicRunner`], but pauses around every step.
pub struct DebugRunner {
    steps: Vec<Box<dyn Step>>,
    pause: Arc<dyn DebugPause>,
}

impl DebugRunner {
    pub fn new(steps: Vec<Box<dyn Step>>, pause: Arc<dyn DebugPause>) -> Self {
        Self { steps, pause }
    }
}

#[async_trait]
impl Runner for DebugRunner {
    async fn run(&mut self, state: &mut StateBag) {
        run_steps(&mut self.steps, state, Some(self.pause.as_ref())).await;
    }
}

/// A [`DebugRunner`] pausing on `ui` when `debug` is set, otherwise a
/// [`BasicRunner`].
pub fn new_runner(steps: Vec<Box<dyn Step>>, debug: bool, ui: Arc<dyn Ui>) -> Box<dyn Runner> {
    if debug {
        Box::new(DebugRunner::new(steps, Arc::new(UiDebugPause::new(ui))))
    } else {
        Box::new(BasicRunner::new(steps))
    }
}

type Panic = Box<dyn Any + Send + 'static>;

async fn run_steps(steps: &mut [Box<dyn Step>], state: &mut StateBag, pause: Option<&dyn DebugPause>) {
    let cancel = state.cancel_token();
    let mut executed = 0;
    let mut step_panic: Option<Panic> = None;

    for step in steps.iter_mut() {
        if cancel.as_ref().is_some_and(|token| token.is_cancelled()) {
            info!("Build cancelled before step {}", step.name());
            state.mark_cancelled();
            break;
        }

        if let Some(pause) = pause {
            if !pause.pause(PauseLocation::Before, step.name(), state).await {
                state.mark_halted();
                break;
            }
        }

        debug!("Running step {}", step.name());
        let action = AssertUnwindSafe(step.run(state)).catch_unwind().await;
        match action {
            Ok(action) => {
                // Registered as soon as run returns, halted or not.
                executed += 1;
                if action == StepAction::Halt {
                    debug!("Step {} halted the run", step.name());
                    state.mark_halted();
                    break;
                }
            }
            Err(panic) => {
                warn!("Step {} panicked", step.name());
                step_panic = Some(panic);
                break;
            }
        }
    }

    if cancel.as_ref().is_some_and(|token| token.is_cancelled()) {
        state.mark_cancelled();
    }

    let mut cleanup_panic: Option<Panic> = None;
    for step in steps[..executed].iter_mut().rev() {
        if let Some(pause) = pause {
            pause.pause(PauseLocation::Cleanup, step.name(), state).await;
        }
        debug!("Cleaning up step {}", step.name());
        if let Err(panic) = AssertUnwindSafe(step.cleanup(state)).catch_unwind().await {
            warn!("Cleanup of step {} panicked", step.name());
            cleanup_panic.get_or_insert(panic);
        }
    }

    if let Some(panic) = step_panic.or(cleanup_panic) {
        std::panic::resume_unwind(panic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationToken;
    use crate::component::RecordingUi;
    use crate::multistep::keys;
    use parking_lot::Mutex;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recorded {
        name: String,
        action: StepAction,
        panic_in_run: bool,
        log: Log,
    }

    #[async_trait]
    impl Step for Recorded {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run(&mut self, _state: &mut StateBag) -> StepAction {
            self.log.lock().push(format!("run {}", self.name));
            if self.panic_in_run {
                panic!("step {} exploded", self.name);
            }
            self.action
        }

        async fn cleanup(&mut self, _state: &mut StateBag) {
            self.log.lock().push(format!("cleanup {}", self.name));
        }
    }

    fn steps(n: usize, halt_at: Option<usize>, panic_at: Option<usize>, log: &Log) -> Vec<Box<dyn Step>> {
        (1..=n)
            .map(|k| {
                Box::new(Recorded {
                    name: k.to_string(),
                    action: if Some(k) == halt_at {
                        StepAction::Halt
                    } else {
                        StepAction::Continue
                    },
                    panic_in_run: Some(k) == panic_at,
                    log: log.clone(),
                }) as Box<dyn Step>
            })
            .collect()
    }

    fn cleanups(log: &Log) -> Vec<String> {
        log.lock()
            .iter()
            .filter_map(|line| line.strip_prefix("cleanup ").map(String::from))
            .collect()
    }

    #[tokio::test]
    async fn test_all_steps_cleanup_in_reverse() {
        let log = Log::default();
        let mut state = StateBag::new();
        BasicRunner::new(steps(3, None, None, &log)).run(&mut state).await;

        assert_eq!(
            log.lock().clone(),
            vec!["run 1", "run 2", "run 3", "cleanup 3", "cleanup 2", "cleanup 1"]
        );
        assert!(!state.is_halted());
        assert!(!state.is_cancelled());
    }

    #[tokio::test]
    async fn test_halt_cleans_up_exactly_the_executed_steps() {
        for n in 1..=6 {
            for k in 1..=n {
                let log = Log::default();
                let mut state = StateBag::new();
                BasicRunner::new(steps(n, Some(k), None, &log))
                    .run(&mut state)
                    .await;

                let expected: Vec<String> = (1..=k).rev().map(|i| i.to_string()).collect();
                assert_eq!(cleanups(&log), expected, "n={n} k={k}");
                assert!(state.is_halted());
                assert!(!log.lock().contains(&format!("run {}", k + 1)));
            }
        }
    }

    #[tokio::test]
    async fn test_panic_cleans_up_predecessors_then_resumes() {
        let log = Log::default();
        let mut state = StateBag::new();
        let mut runner = BasicRunner::new(steps(4, None, Some(3), &log));

        let result = AssertUnwindSafe(runner.run(&mut state)).catch_unwind().await;
        assert!(result.is_err());
        assert_eq!(cleanups(&log), vec!["2", "1"]);
    }

    #[tokio::test]
    async fn test_cancel_between_steps() {
        struct CancelStep(CancellationToken);

        #[async_trait]
        impl Step for CancelStep {
            fn name(&self) -> &str {
                "cancel"
            }

            async fn run(&mut self, _state: &mut StateBag) -> StepAction {
                self.0.cancel();
                StepAction::Continue
            }
        }

        let log = Log::default();
        let token = CancellationToken::new();
        let mut state = StateBag::new();
        state.put(keys::CANCEL, token.clone());

        let mut all = steps(1, None, None, &log);
        all.push(Box::new(CancelStep(token)));
        all.extend(steps(1, None, None, &log));

        BasicRunner::new(all).run(&mut state).await;
        assert!(state.is_cancelled());
        assert_eq!(log.lock().iter().filter(|l| l.starts_with("run")).count(), 1);
        assert_eq!(cleanups(&log), vec!["1"]);
    }

    struct ScriptedPause {
        allow: usize,
        seen: Mutex<Vec<(PauseLocation, String)>>,
    }

    #[async_trait]
    impl DebugPause for ScriptedPause {
        async fn pause(&self, location: PauseLocation, step: &str, _state: &StateBag) -> bool {
            let mut seen = self.seen.lock();
            seen.push((location, step.to_string()));
            seen.iter().filter(|(l, _)| *l == PauseLocation::Before).count() <= self.allow
        }
    }

    #[tokio::test]
    async fn test_debug_runner_pauses_and_can_halt() {
        let log = Log::default();
        let pause = Arc::new(ScriptedPause {
            allow: 2,
            seen: Mutex::new(Vec::new()),
        });
        let mut state = StateBag::new();
        DebugRunner::new(steps(3, None, None, &log), pause.clone())
            .run(&mut state)
            .await;

        assert!(state.is_halted());
        assert_eq!(cleanups(&log), vec!["2", "1"]);
        assert_eq!(
            pause.seen.lock().clone(),
            vec![
                (PauseLocation::Before, "1".to_string()),
                (PauseLocation::Before, "2".to_string()),
                (PauseLocation::Before, "3".to_string()),
                (PauseLocation::Cleanup, "2".to_string()),
                (PauseLocation::Cleanup, "1".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_ui_debug_pause_asks() {
        let ui = Arc::new(RecordingUi::with_answers([""]));
        let pause = UiDebugPause::new(ui.clone());
        let state = StateBag::new();
        assert!(pause.pause(PauseLocation::Before, "create", &state).await);
        // No answers left: the pause fails and halts.
        assert!(!pause.pause(PauseLocation::Before, "launch", &state).await);
    }
}
