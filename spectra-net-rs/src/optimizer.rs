//! Optimizer construction (Adam, SGD).

use candle_core::Tensor;
use candle_nn::{Optimizer, ParamsAdamW, VarMap};
use serde::{Deserialize, Serialize};

use crate::error::SpectraResult;

/// Update rule applied by the training loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    /// Adam without weight decay
    #[default]
    Adam,
    /// Plain stochastic gradient descent
    Sgd,
}

/// Optimizer bound to every variable of a network.
pub enum TrainOptimizer {
    Adam(candle_nn::AdamW),
    Sgd(candle_nn::SGD),
}

impl TrainOptimizer {
    /// Build an optimizer over all variables in `var_map`.
    pub fn new(kind: OptimizerKind, var_map: &VarMap, learning_rate: f64) -> SpectraResult<Self> {
        let vars = var_map.all_vars();
        let optimizer = match kind {
            OptimizerKind::Adam => Self::Adam(candle_nn::AdamW::new(
                vars,
                ParamsAdamW {
                    lr: learning_rate,
                    weight_decay: 0.0,
                    ..Default::default()
                },
            )?),
            OptimizerKind::Sgd => Self::Sgd(candle_nn::SGD::new(vars, learning_rate)?),
        };
        Ok(optimizer)
    }

    /// Backpropagate `loss` and apply one update.
    pub fn step(&mut self, loss: &Tensor) -> SpectraResult<()> {
        match self {
            Self::Adam(opt) => opt.backward_step(loss)?,
            Self::Sgd(opt) => opt.backward_step(loss)?,
        }
        Ok(())
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            Self::Adam(opt) => opt.learning_rate(),
            Self::Sgd(opt) => opt.learning_rate(),
        }
    }

    /// Set learning rate (used by the decay schedule).
    pub fn set_learning_rate(&mut self, lr: f64) {
        match self {
            Self::Adam(opt) => opt.set_learning_rate(lr),
            Self::Sgd(opt) => opt.set_learning_rate(lr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{Init, VarBuilder};

    #[test]
    fn test_build_and_set_rate() {
        let var_map = VarMap::new();
        for kind in [OptimizerKind::Adam, OptimizerKind::Sgd] {
            let mut opt = TrainOptimizer::new(kind, &var_map, 1e-3).unwrap();
            assert_eq!(opt.learning_rate(), 1e-3);
            opt.set_learning_rate(5e-4);
            assert_eq!(opt.learning_rate(), 5e-4);
        }
    }

    #[test]
    fn test_sgd_step_moves_parameter() {
        let device = Device::Cpu;
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &device);
        let w = vb.get_with_hints(1, "w", Init::Const(1.0)).unwrap();

        let mut opt = TrainOptimizer::new(OptimizerKind::Sgd, &var_map, 0.5).unwrap();
        // d(w^2)/dw = 2 at w = 1, so w becomes 1 - 0.5 * 2 = 0
        let loss = w.sqr().unwrap().sum_all().unwrap();
        opt.step(&loss).unwrap();

        let updated = var_map.all_vars()[0].as_tensor().to_vec1::<f32>().unwrap();
        assert!(updated[0].abs() < 1e-6);
    }

    #[test]
    fn test_kind_serde_names() {
        let kind: OptimizerKind = serde_json::from_str("\"sgd\"").unwrap();
        assert_eq!(kind, OptimizerKind::Sgd);
        assert_eq!(serde_json::to_string(&OptimizerKind::Adam).unwrap(), "\"adam\"");
    }
}
