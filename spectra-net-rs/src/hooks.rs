//! Training hooks.
//!
//! The trainer calls every registered hook once per optimization step, in
//! registration order. Each hook keeps its own tick counter, starting before
//! 0 (or at the restored step after a resume), that advances on every call;
//! the hook decides from the ticked value whether to act.
//!
//! Summary sink failures are logged and swallowed. Data and tensor errors
//! propagate and stop training.

use std::time::Instant;

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::data::BatchStream;
use crate::error::{SpectraError, SpectraResult};
use crate::network::RegressionNetwork;
use crate::summary::{SinkError, SummarySink};

/// Per-hook step counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HookClock {
    /// `None` until the first tick
    step: Option<u64>,
    last_fired: Option<u64>,
}

impl HookClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance by one and return the new step; the first tick is 0.
    pub fn tick(&mut self) -> u64 {
        let step = self.step.map_or(0, |s| s + 1);
        self.step = Some(step);
        step
    }

    /// Position the clock so that the next tick returns `completed_steps`.
    pub fn resume_at(&mut self, completed_steps: u64) {
        self.step = completed_steps.checked_sub(1);
    }

    pub fn mark_fired(&mut self, step: u64) {
        self.last_fired = Some(step);
    }

    pub fn step(&self) -> Option<u64> {
        self.step
    }

    pub fn last_fired(&self) -> Option<u64> {
        self.last_fired
    }
}

/// What a hook sees after an optimization step.
pub struct TrainingState<'a> {
    /// Completed optimization steps, including this one
    pub global_step: u64,
    /// Training loss of the step just taken
    pub loss: f32,
    pub learning_rate: f64,
    pub network: &'a RegressionNetwork,
}

/// Result of one validation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationOutcome {
    pub step: u64,
    /// Mean of the per-batch losses
    pub mean_loss: f32,
    pub batches: usize,
    pub samples: usize,
    /// Label rows of the last batch in the pass
    pub truth: Vec<Vec<f32>>,
    /// Prediction rows of the last batch in the pass
    pub prediction: Vec<Vec<f32>>,
}

/// Action a hook took on a tick.
#[derive(Debug, Clone, PartialEq)]
pub enum HookEvent {
    Progress { step: u64, loss: f32 },
    Validation(ValidationOutcome),
}

/// A unit of periodic work run after every optimization step.
pub trait Hook {
    fn name(&self) -> &str;

    /// Tick the hook's clock and act if it is due.
    ///
    /// Returns the action taken, or `None` when the hook did not fire.
    fn run(
        &mut self,
        state: &TrainingState<'_>,
        sink: &mut dyn SummarySink,
    ) -> SpectraResult<Option<HookEvent>>;

    /// Align the hook with a loop that has already completed
    /// `completed_steps` steps, e.g. after restoring a checkpoint.
    fn resume_at(&mut self, _completed_steps: u64) {}
}

fn best_effort(hook: &str, result: Result<(), SinkError>) {
    if let Err(e) = result {
        tracing::warn!("{hook}: summary write failed: {e}");
    }
}

fn check_period(name: &str, period: u64) -> SpectraResult<u64> {
    if period == 0 {
        return Err(SpectraError::configuration(format!(
            "{name} must be positive"
        )));
    }
    Ok(period)
}

/// Reports the training loss every `verb_step` ticks, tick 0 included.
pub struct TrainProgressHook {
    clock: HookClock,
    verb_step: u64,
    value_name: String,
    verbose: bool,
    write_summary: bool,
}

impl TrainProgressHook {
    pub fn new(verb_step: u64) -> SpectraResult<Self> {
        Ok(Self {
            clock: HookClock::new(),
            verb_step: check_period("verb_step", verb_step)?,
            value_name: "mean_squared_error".to_string(),
            verbose: true,
            write_summary: true,
        })
    }

    /// Name of the scalar pushed to the summary sink.
    pub fn with_value_name(mut self, name: impl Into<String>) -> Self {
        self.value_name = name.into();
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_summary(mut self, write_summary: bool) -> Self {
        self.write_summary = write_summary;
        self
    }

    pub fn clock(&self) -> &HookClock {
        &self.clock
    }
}

impl Hook for TrainProgressHook {
    fn name(&self) -> &str {
        "train_progress"
    }

    fn resume_at(&mut self, completed_steps: u64) {
        self.clock.resume_at(completed_steps);
    }

    fn run(
        &mut self,
        state: &TrainingState<'_>,
        sink: &mut dyn SummarySink,
    ) -> SpectraResult<Option<HookEvent>> {
        let step = self.clock.tick();
        if step % self.verb_step != 0 {
            return Ok(None);
        }
        self.clock.mark_fired(step);

        let loss = state.loss;
        if self.verbose {
            tracing::info!("Step {step}, loss: {loss:.3}");
        }
        if self.write_summary {
            best_effort(
                self.name(),
                sink.log_scalar(&self.value_name, f64::from(loss), step),
            );
        }

        Ok(Some(HookEvent::Progress { step, loss }))
    }
}

/// Runs a full validation pass every `eval_step` ticks, skipping tick 0.
pub struct ValidationHook {
    clock: HookClock,
    eval_step: u64,
    stream: Box<dyn BatchStream>,
    write_summary: bool,
    curve_num: usize,
    rng: StdRng,
    last_report: Instant,
}

impl ValidationHook {
    pub fn new(eval_step: u64, stream: Box<dyn BatchStream>) -> SpectraResult<Self> {
        Ok(Self {
            clock: HookClock::new(),
            eval_step: check_period("eval_step", eval_step)?,
            stream,
            write_summary: true,
            curve_num: 6,
            rng: StdRng::seed_from_u64(0),
            last_report: Instant::now(),
        })
    }

    pub fn with_summary(mut self, write_summary: bool) -> Self {
        self.write_summary = write_summary;
        self
    }

    /// Number of curve pairs drawn for the prediction plot.
    pub fn with_curve_num(mut self, curve_num: usize) -> Self {
        self.curve_num = curve_num;
        self
    }

    /// Seed for curve selection.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn clock(&self) -> &HookClock {
        &self.clock
    }

    /// Rewind the stream and drain it once.
    ///
    /// Returns `None` if the stream yields no batch at all.
    fn validate(
        &mut self,
        step: u64,
        network: &RegressionNetwork,
    ) -> SpectraResult<Option<ValidationOutcome>> {
        self.stream.reset()?;

        let mut losses = Vec::new();
        let mut samples = 0;
        let mut last = None;
        while let Some(batch) = self.stream.next_batch()? {
            let output = network.evaluate_batch(&batch)?;
            losses.push(output.loss);
            samples += batch.len();
            last = Some(output);
        }

        let Some(last) = last else {
            return Ok(None);
        };
        let mean_loss = losses.iter().sum::<f32>() / losses.len() as f32;

        Ok(Some(ValidationOutcome {
            step,
            mean_loss,
            batches: losses.len(),
            samples,
            truth: last.truth,
            prediction: last.prediction,
        }))
    }
}

impl Hook for ValidationHook {
    fn name(&self) -> &str {
        "validation"
    }

    fn resume_at(&mut self, completed_steps: u64) {
        self.clock.resume_at(completed_steps);
    }

    fn run(
        &mut self,
        state: &TrainingState<'_>,
        sink: &mut dyn SummarySink,
    ) -> SpectraResult<Option<HookEvent>> {
        let step = self.clock.tick();
        if step % self.eval_step != 0 || step == 0 {
            return Ok(None);
        }
        self.clock.mark_fired(step);

        let Some(outcome) = self.validate(step, state.network)? else {
            tracing::warn!("Eval @ Step {step}: validation stream produced no batches");
            return Ok(None);
        };

        tracing::info!(
            "Eval @ Step {step}, loss: {:.3}, duration {:.3}s",
            outcome.mean_loss,
            self.last_report.elapsed().as_secs_f64()
        );
        self.last_report = Instant::now();

        if self.write_summary {
            best_effort(
                "validation",
                sink.log_scalar("valid_mse", f64::from(outcome.mean_loss), step),
            );
            best_effort(
                "validation",
                sink.log_curves(
                    "pred_plot",
                    &outcome.truth,
                    &outcome.prediction,
                    step,
                    self.curve_num,
                    &mut self.rng,
                ),
            );
        }

        Ok(Some(HookEvent::Validation(outcome)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{InMemoryStream, Record};
    use crate::network::NetworkOptions;
    use crate::shape::ArchitectureSpec;
    use crate::summary::{CurvePlot, MemorySummary};
    use candle_core::Device;

    struct FailingSink;

    impl SummarySink for FailingSink {
        fn log_scalar(&mut self, _: &str, _: f64, _: u64) -> Result<(), SinkError> {
            Err(SinkError::Closed)
        }

        fn log_plot(&mut self, _: &CurvePlot) -> Result<(), SinkError> {
            Err(SinkError::Closed)
        }
    }

    fn network() -> RegressionNetwork {
        let spec = ArchitectureSpec::new(vec![4], vec![8], vec![2]).unwrap();
        RegressionNetwork::new(&spec, NetworkOptions::default(), &Device::Cpu).unwrap()
    }

    fn stream(rows: usize, batch_size: usize) -> Box<dyn BatchStream> {
        let records = (0..rows)
            .map(|i| Record {
                features: vec![i as f32, 1.0],
                labels: vec![0.5; 8],
            })
            .collect();
        Box::new(InMemoryStream::new(records, batch_size, &Device::Cpu).unwrap())
    }

    fn state(network: &RegressionNetwork) -> TrainingState<'_> {
        TrainingState {
            global_step: 0,
            loss: 0.25,
            learning_rate: 1e-3,
            network,
        }
    }

    fn fired_ticks(hook: &mut dyn Hook, ticks: u64, sink: &mut dyn SummarySink) -> Vec<u64> {
        let net = network();
        let mut fired = Vec::new();
        for tick in 0..ticks {
            if hook.run(&state(&net), sink).unwrap().is_some() {
                fired.push(tick);
            }
        }
        fired
    }

    #[test]
    fn test_clock_starts_at_zero() {
        let mut clock = HookClock::new();
        assert_eq!(clock.step(), None);
        assert_eq!(clock.tick(), 0);
        assert_eq!(clock.tick(), 1);
    }

    #[test]
    fn test_clock_resume_continues_from_completed_steps() {
        let mut clock = HookClock::new();
        clock.resume_at(7);
        assert_eq!(clock.step(), Some(6));
        assert_eq!(clock.tick(), 7);

        clock.resume_at(0);
        assert_eq!(clock.tick(), 0);
    }

    #[test]
    fn test_resumed_progress_hook_keeps_cadence() {
        let mut hook = TrainProgressHook::new(5).unwrap();
        hook.resume_at(7);
        let mut sink = MemorySummary::new();
        fired_ticks(&mut hook, 9, &mut sink);

        let steps: Vec<u64> = sink
            .scalars("mean_squared_error")
            .iter()
            .map(|(s, _)| *s)
            .collect();
        assert_eq!(steps, vec![10, 15]);
    }

    #[test]
    fn test_progress_fires_every_verb_step_from_zero() {
        let mut hook = TrainProgressHook::new(5).unwrap();
        let mut sink = MemorySummary::new();
        let fired = fired_ticks(&mut hook, 12, &mut sink);
        assert_eq!(fired, vec![0, 5, 10]);
        assert_eq!(hook.clock().last_fired(), Some(10));

        let steps: Vec<u64> = sink
            .scalars("mean_squared_error")
            .iter()
            .map(|(s, _)| *s)
            .collect();
        assert_eq!(steps, vec![0, 5, 10]);
    }

    #[test]
    fn test_progress_without_summary_logs_nothing() {
        let mut hook = TrainProgressHook::new(1).unwrap().with_summary(false);
        let mut sink = MemorySummary::new();
        fired_ticks(&mut hook, 3, &mut sink);
        assert!(sink.events.is_empty());
    }

    #[test]
    fn test_validation_skips_tick_zero() {
        let mut hook = ValidationHook::new(10, stream(5, 2)).unwrap();
        let mut sink = MemorySummary::new();
        let fired = fired_ticks(&mut hook, 31, &mut sink);
        assert_eq!(fired, vec![10, 20, 30]);

        let steps: Vec<u64> = sink.scalars("valid_mse").iter().map(|(s, _)| *s).collect();
        assert_eq!(steps, vec![10, 20, 30]);
        assert_eq!(sink.plots().len(), 3);
    }

    #[test]
    fn test_validation_drains_whole_stream_each_time() {
        let net = network();
        let mut hook = ValidationHook::new(1, stream(5, 2)).unwrap().with_curve_num(6);
        let mut sink = MemorySummary::new();

        assert!(hook.run(&state(&net), &mut sink).unwrap().is_none());
        for _ in 0..2 {
            match hook.run(&state(&net), &mut sink).unwrap() {
                Some(HookEvent::Validation(outcome)) => {
                    assert_eq!(outcome.batches, 3);
                    assert_eq!(outcome.samples, 5);
                    // last batch holds the single leftover row
                    assert_eq!(outcome.truth.len(), 1);
                    assert_eq!(outcome.prediction.len(), 1);
                }
                other => panic!("expected validation, got {other:?}"),
            }
        }
        // curve count clamped to the final batch's rows
        assert!(sink.plots().iter().all(|p| p.curves.len() == 1));
    }

    #[test]
    fn test_sink_failure_does_not_abort() {
        let net = network();
        let mut sink = FailingSink;

        let mut progress = TrainProgressHook::new(1).unwrap();
        assert!(progress.run(&state(&net), &mut sink).unwrap().is_some());

        let mut validation = ValidationHook::new(1, stream(3, 3)).unwrap();
        validation.run(&state(&net), &mut sink).unwrap();
        assert!(validation.run(&state(&net), &mut sink).unwrap().is_some());
    }

    #[test]
    fn test_empty_validation_stream_is_skipped() {
        let net = network();
        let mut hook = ValidationHook::new(1, stream(0, 2)).unwrap();
        let mut sink = MemorySummary::new();
        hook.run(&state(&net), &mut sink).unwrap();
        assert!(hook.run(&state(&net), &mut sink).unwrap().is_none());
        assert!(sink.events.is_empty());
    }

    #[test]
    fn test_zero_period_rejected() {
        assert!(TrainProgressHook::new(0).is_err());
        assert!(ValidationHook::new(0, stream(1, 1)).is_err());
    }
}
