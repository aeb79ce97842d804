//! Training loop.
//!
//! [`Trainer`] owns the network, optimizer, training stream, hooks and
//! summary sink. Each step draws one batch, applies the decayed learning
//! rate, takes one optimizer update and then runs every hook in
//! registration order. The training stream repeats: when a pass is
//! exhausted it is reset and reshuffled.

use std::path::{Path, PathBuf};

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::config::PipelineConfig;
use crate::data::{Batch, BatchStream, DataReader};
use crate::error::{SpectraError, SpectraResult};
use crate::hooks::{Hook, HookEvent, TrainProgressHook, TrainingState, ValidationHook};
use crate::meta::ModelMeta;
use crate::network::RegressionNetwork;
use crate::optimizer::{OptimizerKind, TrainOptimizer};
use crate::scheduler::ExponentialDecay;
use crate::summary::{JsonlSummaryWriter, NullSummary, SummarySink};

/// Weights file inside a model directory.
pub const WEIGHTS_FILE_NAME: &str = "model.safetensors";
/// Loop state file inside a model directory.
pub const STATE_FILE_NAME: &str = "training_state.json";
/// Summary event log inside a model directory.
pub const SUMMARY_FILE_NAME: &str = "summary.jsonl";
/// Copy of the run configuration inside a model directory.
pub const CONFIG_FILE_NAME: &str = "config.yaml";

/// Loop state persisted next to the weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    /// Completed optimization steps
    pub step: u64,
    pub learning_rate: f64,
    pub loss: Option<f32>,
}

/// Summary of a finished `run_training` call.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingReport {
    /// Steps taken by this call
    pub steps: u64,
    pub final_loss: Option<f32>,
    /// Training loss of every step, in order
    pub loss_history: Vec<f32>,
    /// `(hook step, mean loss)` of every validation pass
    pub validation_losses: Vec<(u64, f32)>,
    /// Last checkpoint written, if checkpointing is enabled
    pub checkpoint: Option<PathBuf>,
}

struct Checkpointing {
    model_dir: PathBuf,
    save_step: u64,
}

/// Drives training of a [`RegressionNetwork`].
pub struct Trainer {
    network: RegressionNetwork,
    optimizer: TrainOptimizer,
    schedule: ExponentialDecay,
    train_stream: Box<dyn BatchStream>,
    hooks: Vec<Box<dyn Hook>>,
    sink: Box<dyn SummarySink>,
    checkpointing: Option<Checkpointing>,
    global_step: u64,
    last_loss: Option<f32>,
}

impl Trainer {
    /// Create a trainer with no hooks, no checkpointing and a discarding sink.
    pub fn new(
        network: RegressionNetwork,
        optimizer: OptimizerKind,
        schedule: ExponentialDecay,
        train_stream: Box<dyn BatchStream>,
    ) -> SpectraResult<Self> {
        let optimizer = TrainOptimizer::new(optimizer, network.var_map(), schedule.rate(0))?;
        Ok(Self {
            network,
            optimizer,
            schedule,
            train_stream,
            hooks: Vec::new(),
            sink: Box::new(NullSummary),
            checkpointing: None,
            global_step: 0,
            last_loss: None,
        })
    }

    /// Build the full training setup described by `config`: network, data
    /// streams, progress and validation hooks, summary writer and
    /// checkpointing into the model directory.
    pub fn from_config(config: &PipelineConfig, device: &Device) -> SpectraResult<Self> {
        config.validate()?;
        let spec = config.model.architecture()?;
        let network = RegressionNetwork::new(&spec, config.network_options(), device)?;

        let reader = DataReader::new(&config.data, network.output_size())?;
        let (train_stream, valid_stream) = reader.streams(device, config.seed)?;

        let training = &config.training;
        let model_dir = config.model_dir();
        let sink: Box<dyn SummarySink> = if training.write_summary {
            Box::new(JsonlSummaryWriter::open(model_dir.join(SUMMARY_FILE_NAME))?)
        } else {
            Box::new(NullSummary)
        };

        let mut trainer = Self::new(
            network,
            training.optimizer,
            training.schedule()?,
            Box::new(train_stream),
        )?
        .with_sink(sink)
        .with_checkpointing(&model_dir, training.save_step)?;

        trainer.register_hook(Box::new(
            TrainProgressHook::new(training.verb_step)?
                .with_verbose(training.verbose)
                .with_summary(training.write_summary),
        ));
        trainer.register_hook(Box::new(
            ValidationHook::new(training.eval_step, Box::new(valid_stream))?
                .with_summary(training.write_summary)
                .with_curve_num(training.curve_num)
                .with_seed(config.seed),
        ));

        config.to_file(model_dir.join(CONFIG_FILE_NAME))?;
        tracing::info!(
            "Training {} ({} parameters) into {}",
            config.model_name,
            trainer.network.parameter_count(),
            model_dir.display()
        );
        Ok(trainer)
    }

    pub fn with_sink(mut self, sink: Box<dyn SummarySink>) -> Self {
        self.sink = sink;
        self
    }

    /// Save into `model_dir` every `save_step` steps and at the end of each
    /// `run_training` call. Writes the metadata record immediately.
    pub fn with_checkpointing(
        mut self,
        model_dir: impl AsRef<Path>,
        save_step: u64,
    ) -> SpectraResult<Self> {
        if save_step == 0 {
            return Err(SpectraError::configuration("save_step must be positive"));
        }
        let model_dir = model_dir.as_ref().to_path_buf();
        ModelMeta::from_spec(self.network.spec(), self.network.options().variant)
            .write(&model_dir, Some(self.network.input_size()))?;
        self.checkpointing = Some(Checkpointing {
            model_dir,
            save_step,
        });
        Ok(self)
    }

    /// Append a hook; hooks run in registration order.
    ///
    /// A hook added after a resume starts ticking from the restored step.
    pub fn register_hook(&mut self, mut hook: Box<dyn Hook>) {
        if self.global_step > 0 {
            hook.resume_at(self.global_step);
        }
        self.hooks.push(hook);
    }

    /// Next training batch, rewinding the stream when a pass ends.
    fn next_train_batch(&mut self) -> SpectraResult<Batch> {
        if let Some(batch) = self.train_stream.next_batch()? {
            return Ok(batch);
        }
        tracing::debug!("Training stream exhausted at step {}, rewinding", self.global_step);
        self.train_stream.reset()?;
        self.train_stream
            .next_batch()?
            .ok_or_else(|| SpectraError::data("training stream is empty"))
    }

    /// Take one optimization step and return its loss.
    pub fn train_step(&mut self) -> SpectraResult<f32> {
        let batch = self.next_train_batch()?;
        self.schedule.apply(self.global_step, &mut self.optimizer);

        let loss = self.network.loss(&batch)?;
        let loss_value = loss.to_scalar::<f32>()?;
        if !loss_value.is_finite() {
            return Err(SpectraError::data(format!(
                "loss became {loss_value} at step {}",
                self.global_step
            )));
        }
        self.optimizer.step(&loss)?;

        self.global_step += 1;
        self.last_loss = Some(loss_value);
        Ok(loss_value)
    }

    /// Run exactly `total_steps` optimization steps, calling every hook after
    /// each one.
    pub fn run_training(&mut self, total_steps: u64) -> SpectraResult<TrainingReport> {
        let mut report = TrainingReport {
            steps: 0,
            final_loss: None,
            loss_history: Vec::new(),
            validation_losses: Vec::new(),
            checkpoint: None,
        };

        for _ in 0..total_steps {
            let loss = self.train_step()?;
            report.steps += 1;
            report.loss_history.push(loss);

            let state = TrainingState {
                global_step: self.global_step,
                loss,
                learning_rate: self.optimizer.learning_rate(),
                network: &self.network,
            };
            for hook in &mut self.hooks {
                if let Some(HookEvent::Validation(outcome)) = hook.run(&state, self.sink.as_mut())? {
                    report.validation_losses.push((outcome.step, outcome.mean_loss));
                }
            }

            if let Some(ckpt) = &self.checkpointing {
                if self.global_step % ckpt.save_step == 0 {
                    report.checkpoint = Some(self.save_checkpoint()?);
                }
            }
        }

        if self.checkpointing.is_some() {
            report.checkpoint = Some(self.save_checkpoint()?);
        }
        if let Err(e) = self.sink.flush() {
            tracing::warn!("summary flush failed: {e}");
        }

        report.final_loss = self.last_loss;
        tracing::info!(
            "Finished {} steps (global step {}), final loss: {:?}",
            report.steps,
            self.global_step,
            report.final_loss
        );
        Ok(report)
    }

    /// Write weights, loop state and metadata into the model directory.
    ///
    /// Returns the weights path.
    pub fn save_checkpoint(&self) -> SpectraResult<PathBuf> {
        let ckpt = self
            .checkpointing
            .as_ref()
            .ok_or_else(|| SpectraError::checkpoint("checkpointing is not enabled"))?;
        let dir = &ckpt.model_dir;
        std::fs::create_dir_all(dir).map_err(|e| SpectraError::io(dir, e))?;

        let weights = dir.join(WEIGHTS_FILE_NAME);
        self.network.save(&weights)?;

        let state = CheckpointState {
            step: self.global_step,
            learning_rate: self.optimizer.learning_rate(),
            loss: self.last_loss,
        };
        let state_path = dir.join(STATE_FILE_NAME);
        std::fs::write(&state_path, serde_json::to_string_pretty(&state)?)
            .map_err(|e| SpectraError::io(&state_path, e))?;

        ModelMeta::from_spec(self.network.spec(), self.network.options().variant)
            .write(dir, Some(self.network.input_size()))?;

        tracing::info!("Saved checkpoint to: {}", dir.display());
        Ok(weights)
    }

    /// Restore weights and the step counter from a model directory, and move
    /// every registered hook's clock on to the restored step.
    pub fn resume(&mut self, model_dir: impl AsRef<Path>) -> SpectraResult<CheckpointState> {
        let dir = model_dir.as_ref();
        let state = read_checkpoint_state(dir)?;
        self.network.restore(&dir.join(WEIGHTS_FILE_NAME))?;
        self.global_step = state.step;
        self.last_loss = state.loss;
        self.optimizer.set_learning_rate(self.schedule.rate(state.step));
        for hook in &mut self.hooks {
            hook.resume_at(state.step);
        }

        tracing::info!(
            "Resumed from: {} (step={})",
            dir.display(),
            state.step
        );
        Ok(state)
    }

    pub fn network(&self) -> &RegressionNetwork {
        &self.network
    }

    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    pub fn into_network(self) -> RegressionNetwork {
        self.network
    }
}

/// Read `training_state.json` from a model directory.
pub fn read_checkpoint_state(model_dir: &Path) -> SpectraResult<CheckpointState> {
    let path = model_dir.join(STATE_FILE_NAME);
    let json = std::fs::read_to_string(&path)
        .map_err(|e| SpectraError::checkpoint(format!("cannot read {}: {e}", path.display())))?;
    serde_json::from_str(&json)
        .map_err(|e| SpectraError::checkpoint(format!("cannot parse {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{InMemoryStream, Record};
    use crate::hooks::HookClock;
    use crate::network::NetworkOptions;
    use crate::shape::ArchitectureSpec;
    use crate::summary::MemorySummary;
    use std::sync::{Arc, Mutex};

    fn records(n: usize) -> Vec<Record> {
        (0..n)
            .map(|i| {
                let x = i as f32 / n as f32;
                Record {
                    features: vec![x, 1.0 - x],
                    labels: (0..8).map(|j| x * j as f32 / 8.0).collect(),
                }
            })
            .collect()
    }

    fn trainer(rows: usize, batch_size: usize) -> Trainer {
        let device = Device::Cpu;
        let spec = ArchitectureSpec::new(vec![4], vec![8], vec![2]).unwrap();
        let network = RegressionNetwork::new(&spec, NetworkOptions::default(), &device).unwrap();
        let stream = InMemoryStream::new(records(rows), batch_size, &device).unwrap();
        Trainer::new(
            network,
            OptimizerKind::Adam,
            ExponentialDecay::new(1e-2, 100, 0.5).unwrap(),
            Box::new(stream),
        )
        .unwrap()
    }

    /// Records the order in which hooks ran.
    struct OrderHook {
        id: usize,
        clock: HookClock,
        log: Arc<Mutex<Vec<(usize, u64, u64)>>>,
    }

    impl Hook for OrderHook {
        fn name(&self) -> &str {
            "order"
        }

        fn run(
            &mut self,
            state: &TrainingState<'_>,
            _sink: &mut dyn SummarySink,
        ) -> SpectraResult<Option<HookEvent>> {
            let tick = self.clock.tick();
            self.log.lock().unwrap().push((self.id, tick, state.global_step));
            Ok(None)
        }

        fn resume_at(&mut self, completed_steps: u64) {
            self.clock.resume_at(completed_steps);
        }
    }

    #[test]
    fn test_runs_exact_step_count() {
        let mut trainer = trainer(10, 4);
        let report = trainer.run_training(7).unwrap();
        assert_eq!(report.steps, 7);
        assert_eq!(report.loss_history.len(), 7);
        assert_eq!(trainer.global_step(), 7);
        assert_eq!(report.final_loss, report.loss_history.last().copied());
        assert!(report.checkpoint.is_none());
    }

    #[test]
    fn test_zero_steps_reserves_nothing() {
        let mut trainer = trainer(4, 2);
        let report = trainer.run_training(0).unwrap();
        assert_eq!(report.steps, 0);
        assert_eq!(report.loss_history.capacity(), 0);
        assert_eq!(report.final_loss, None);
    }

    #[test]
    fn test_hooks_run_in_registration_order() {
        let mut trainer = trainer(6, 3);
        let log = Arc::new(Mutex::new(Vec::new()));
        for id in 0..2 {
            trainer.register_hook(Box::new(OrderHook {
                id,
                clock: HookClock::new(),
                log: Arc::clone(&log),
            }));
        }
        trainer.run_training(3).unwrap();

        let log = log.lock().unwrap();
        assert_eq!(
            *log,
            vec![(0, 0, 1), (1, 0, 1), (0, 1, 2), (1, 1, 2), (0, 2, 3), (1, 2, 3)]
        );
    }

    #[test]
    fn test_learning_rate_follows_schedule() {
        let mut trainer = trainer(4, 2);
        trainer.run_training(100).unwrap();
        // rate for the 100th update is set from 99 completed steps
        let expected = 1e-2 * 0.5f64.powf(99.0 / 100.0);
        assert!((trainer.learning_rate() - expected).abs() < 1e-12);
    }

    #[test]
    fn test_empty_training_stream_is_data_error() {
        let mut trainer = trainer(0, 2);
        assert!(matches!(trainer.run_training(1), Err(SpectraError::Data(_))));
    }

    #[test]
    fn test_validation_losses_reported() {
        let mut trainer = trainer(8, 4).with_sink(Box::new(MemorySummary::new()));
        let valid = InMemoryStream::new(records(5), 2, &Device::Cpu).unwrap();
        trainer.register_hook(Box::new(ValidationHook::new(3, Box::new(valid)).unwrap()));

        let report = trainer.run_training(10).unwrap();
        let steps: Vec<u64> = report.validation_losses.iter().map(|(s, _)| *s).collect();
        assert_eq!(steps, vec![3, 6, 9]);
    }

    #[test]
    fn test_checkpoint_and_resume() {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().join("run");

        let mut first = trainer(8, 4).with_checkpointing(&model_dir, 5).unwrap();
        assert!(model_dir.join(crate::meta::META_FILE_NAME).exists());
        let report = first.run_training(6).unwrap();
        assert_eq!(report.checkpoint, Some(model_dir.join(WEIGHTS_FILE_NAME)));

        let state = read_checkpoint_state(&model_dir).unwrap();
        assert_eq!(state.step, 6);
        assert_eq!(state.loss, report.final_loss);

        let mut second = trainer(8, 4);
        second.resume(&model_dir).unwrap();
        assert_eq!(second.global_step(), 6);

        let x = candle_core::Tensor::new(&[[0.1f32, 0.9]], &Device::Cpu).unwrap();
        let a = first.network().forward(&x).unwrap().to_vec2::<f32>().unwrap();
        let b = second.network().forward(&x).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_resume_continues_hook_steps() {
        use crate::summary::{JsonlSummaryWriter, SummaryEvent};

        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().join("run");
        let summary = model_dir.join(SUMMARY_FILE_NAME);

        let with_hooks = |trainer: &mut Trainer| {
            let valid = InMemoryStream::new(records(4), 2, &Device::Cpu).unwrap();
            trainer.register_hook(Box::new(TrainProgressHook::new(5).unwrap()));
            trainer.register_hook(Box::new(ValidationHook::new(5, Box::new(valid)).unwrap()));
        };

        let mut first = trainer(8, 4)
            .with_sink(Box::new(JsonlSummaryWriter::open(&summary).unwrap()))
            .with_checkpointing(&model_dir, 100)
            .unwrap();
        with_hooks(&mut first);
        first.run_training(7).unwrap();
        drop(first);

        let mut second = trainer(8, 4)
            .with_sink(Box::new(JsonlSummaryWriter::open(&summary).unwrap()))
            .with_checkpointing(&model_dir, 100)
            .unwrap();
        with_hooks(&mut second);
        second.resume(&model_dir).unwrap();
        let report = second.run_training(7).unwrap();
        assert_eq!(report.validation_losses.iter().map(|(s, _)| *s).collect::<Vec<_>>(), vec![10]);

        let events = JsonlSummaryWriter::read_events(&summary).unwrap();
        let steps = |wanted: &str| -> Vec<u64> {
            events
                .iter()
                .filter_map(|e| match e {
                    SummaryEvent::Scalar { name, step, .. } if name == wanted => Some(*step),
                    _ => None,
                })
                .collect()
        };
        assert_eq!(steps("mean_squared_error"), vec![0, 5, 10]);
        assert_eq!(steps("valid_mse"), vec![5, 10]);
    }

    #[test]
    fn test_hook_registered_after_resume_starts_at_restored_step() {
        let dir = tempfile::tempdir().unwrap();
        let model_dir = dir.path().join("run");
        trainer(8, 4)
            .with_checkpointing(&model_dir, 100)
            .unwrap()
            .run_training(4)
            .unwrap();

        let mut resumed = trainer(8, 4);
        resumed.resume(&model_dir).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        resumed.register_hook(Box::new(OrderHook {
            id: 0,
            clock: HookClock::new(),
            log: Arc::clone(&log),
        }));
        resumed.run_training(2).unwrap();
        assert_eq!(*log.lock().unwrap(), vec![(0, 4, 5), (0, 5, 6)]);
    }

    #[test]
    fn test_save_without_checkpointing_fails() {
        let trainer = trainer(4, 2);
        assert!(matches!(
            trainer.save_checkpoint(),
            Err(SpectraError::Checkpoint(_))
        ));
    }
}
