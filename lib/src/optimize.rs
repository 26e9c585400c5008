use crate::{
    backbone::Backbone,
    errors::OptimizationError,
    loss::{LossComposer, LossValue, References},
    optim::{Evaluation, Objective, Optimizer},
    session::{ProgressUpdate, TransferProgress},
    Error,
};
use burn::tensor::{
    backend::{AutodiffBackend, Backend},
    ElementConversion, Tensor,
};
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::atomic::{AtomicBool, Ordering},
};

/// Progress is reported, and convergence checked, every this many steps
pub const PROGRESS_INTERVAL: u32 = 50;

/// Optional early stop: if the total loss improves by less than `tolerance`
/// between consecutive checkpoints `patience` times in a row, the loop ends
/// before the step budget is exhausted.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Convergence {
    pub tolerance: f64,
    pub patience: u32,
}

pub(crate) struct LoopParams {
    pub(crate) steps: u32,
    pub(crate) composer: LossComposer,
    pub(crate) convergence: Option<Convergence>,
}

/// The style transfer objective for the working image at a given step
struct StyleObjective<'a, B: AutodiffBackend> {
    backbone: &'a Backbone<B>,
    references: &'a References<B>,
    composer: LossComposer,
    step: u32,
}

impl<'a, B: AutodiffBackend> Objective<B::InnerBackend> for StyleObjective<'a, B> {
    fn evaluate(
        &self,
        point: Tensor<B::InnerBackend, 4>,
    ) -> Result<Evaluation<B::InnerBackend>, Error> {
        // the backbone only ever sees pixels in [0, 1]
        let point = point.clamp(0.0, 1.0);

        let input = Tensor::<B, 4>::from_inner(point.clone()).require_grad();
        let acts = self.backbone.extract(input.clone());
        let terms = self
            .composer
            .compose(&acts, self.references, self.backbone.layers().content());

        let loss = terms.value();
        if !loss.is_finite() {
            return Err(OptimizationError::NonFiniteLoss { step: self.step }.into());
        }

        let grads = terms.total().backward();
        let gradient = input
            .grad(&grads)
            .ok_or(OptimizationError::MissingGradient)?;

        let magnitude = gradient.clone().abs().sum().into_scalar().elem::<f64>();
        if !magnitude.is_finite() {
            return Err(OptimizationError::NonFiniteGradient { step: self.step }.into());
        }

        Ok(Evaluation {
            point,
            gradient,
            loss,
        })
    }
}

struct LoopState<B: Backend> {
    image: Tensor<B, 4>,
    step: u32,
    last_checkpoint: Option<f64>,
    stalled: u32,
}

impl<B: Backend> LoopState<B> {
    fn new(content: Tensor<B, 4>) -> Self {
        Self {
            image: content,
            step: 0,
            last_checkpoint: None,
            stalled: 0,
        }
    }

    /// Records a checkpoint loss, returning true once the loop has stalled
    /// for long enough
    fn checkpoint(&mut self, total: f64, convergence: Option<Convergence>) -> bool {
        let previous = self.last_checkpoint.replace(total);

        let convergence = match convergence {
            Some(c) => c,
            None => return false,
        };

        match previous {
            Some(prev) if prev - total < convergence.tolerance => self.stalled += 1,
            Some(_) => self.stalled = 0,
            None => {}
        }

        self.stalled >= convergence.patience
    }
}

fn report(progress: &mut dyn TransferProgress, info: ProgressUpdate) {
    let step = info.step;
    if catch_unwind(AssertUnwindSafe(|| progress.update(info))).is_err() {
        tracing::warn!(step, "progress observer panicked, ignoring");
    }
}

/// Runs the optimization loop to completion and returns the final working
/// image, clamped to `[0, 1]`.
///
/// The loop always runs the full step budget unless a convergence criterion
/// is given, or `cancel` is raised, which is checked between steps.
pub(crate) fn optimize<B: AutodiffBackend>(
    backbone: &Backbone<B>,
    references: &References<B>,
    content: Tensor<B::InnerBackend, 4>,
    params: &LoopParams,
    optimizer: &mut dyn Optimizer<B::InnerBackend>,
    mut progress: Option<&mut (dyn TransferProgress + '_)>,
    cancel: Option<&AtomicBool>,
) -> Result<Tensor<B::InnerBackend, 4>, Error> {
    let mut state = LoopState::new(content);

    while state.step < params.steps {
        if cancel.map_or(false, |flag| flag.load(Ordering::Relaxed)) {
            return Err(Error::Cancelled { step: state.step });
        }

        let objective = StyleObjective {
            backbone,
            references,
            composer: params.composer,
            step: state.step,
        };

        let image = state.image.clamp(0.0, 1.0);
        let outcome = optimizer.step(image, &objective)?;

        state.image = outcome.point;
        state.step += 1;

        if state.step % PROGRESS_INTERVAL == 0 {
            let loss: LossValue = outcome.loss;

            tracing::debug!(
                step = state.step,
                total_steps = params.steps,
                content_loss = loss.content,
                style_loss = loss.style,
                "checkpoint"
            );

            if let Some(progress) = progress.as_deref_mut() {
                report(
                    progress,
                    ProgressUpdate {
                        step: state.step,
                        total_steps: params.steps,
                        percent: f64::from(state.step) / f64::from(params.steps) * 100.0,
                        loss,
                    },
                );
            }

            if state.checkpoint(loss.total(), params.convergence) {
                tracing::info!(
                    step = state.step,
                    total_steps = params.steps,
                    loss = loss.total(),
                    "loss stopped improving, ending early"
                );
                break;
            }
        }
    }

    Ok(state.image.clamp(0.0, 1.0))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        backbone::{Architecture, LayerSet, Stage},
        optim::{Adam, AdamConfig, Lbfgs, LbfgsConfig, StepOutcome},
    };
    use burn::{
        backend::{Autodiff, NdArray},
        tensor::TensorData,
    };

    type B = Autodiff<NdArray>;
    type I = NdArray;

    fn backbone() -> Backbone<B> {
        let arch = Architecture::new(vec![
            Stage::Conv {
                in_channels: 3,
                out_channels: 4,
            },
            Stage::Relu,
            Stage::MaxPool,
            Stage::Conv {
                in_channels: 4,
                out_channels: 4,
            },
            Stage::Relu,
        ]);

        Backbone::new(arch, LayerSet::new(vec![0, 3], 3), &Default::default()).unwrap()
    }

    fn image(seed: usize) -> Tensor<B, 4> {
        let values: Vec<f32> = (0..3 * 8 * 8)
            .map(|i| ((i * 31 + seed * 17) % 97) as f32 / 96.0)
            .collect();
        Tensor::from_data(TensorData::new(values, [1, 3, 8, 8]), &Default::default())
    }

    fn params(steps: u32) -> LoopParams {
        LoopParams {
            steps,
            composer: LossComposer::new(1.0, 1000.0),
            convergence: None,
        }
    }

    fn bounds(t: &Tensor<I, 4>) -> (f32, f32) {
        (
            t.clone().min().into_scalar(),
            t.clone().max().into_scalar(),
        )
    }

    /// Wraps Adam, recording every point it is handed, every point the
    /// objective evaluates and every loss. With `overshoot` the result is
    /// pushed out of `[0, 1]` on purpose.
    struct Recording {
        inner: Adam<I>,
        overshoot: bool,
        seen: Vec<(f32, f32)>,
        losses: Vec<f64>,
    }

    impl Recording {
        fn new(learning_rate: f64, overshoot: bool) -> Self {
            Self {
                inner: Adam::new(AdamConfig {
                    learning_rate,
                    ..Default::default()
                }),
                overshoot,
                seen: Vec::new(),
                losses: Vec::new(),
            }
        }
    }

    struct Spy<'a> {
        inner: &'a dyn Objective<I>,
        evaluated: std::cell::RefCell<Vec<(f32, f32)>>,
    }

    impl<'a> Objective<I> for Spy<'a> {
        fn evaluate(&self, point: Tensor<I, 4>) -> Result<Evaluation<I>, Error> {
            let eval = self.inner.evaluate(point)?;
            self.evaluated.borrow_mut().push(bounds(&eval.point));
            Ok(eval)
        }
    }

    impl Optimizer<I> for Recording {
        fn step(
            &mut self,
            point: Tensor<I, 4>,
            objective: &dyn Objective<I>,
        ) -> Result<StepOutcome<I>, Error> {
            self.seen.push(bounds(&point));

            let spy = Spy {
                inner: objective,
                evaluated: Default::default(),
            };
            let outcome = self.inner.step(point, &spy)?;
            self.seen.extend(spy.evaluated.into_inner());
            self.losses.push(outcome.loss.total());

            let point = if self.overshoot {
                outcome.point.mul_scalar(3.0).sub_scalar(1.0)
            } else {
                outcome.point
            };

            Ok(StepOutcome {
                point,
                loss: outcome.loss,
            })
        }
    }

    #[test]
    fn backbone_only_sees_clamped_pixels() {
        let backbone = backbone();
        let refs = References::new(&backbone, image(1), image(2));
        let mut opt = Recording::new(0.02, true);

        let out = optimize(
            &backbone,
            &refs,
            image(1).inner(),
            &params(5),
            &mut opt,
            None,
            None,
        )
        .unwrap();

        assert_eq!(opt.seen.len(), 10);
        for (min, max) in opt.seen {
            assert!(min >= 0.0 && max <= 1.0);
        }

        let (min, max) = bounds(&out);
        assert!(min >= 0.0 && max <= 1.0);
    }

    #[test]
    fn zero_steps_returns_clamped_content() {
        let backbone = backbone();
        let refs = References::new(&backbone, image(1), image(2));
        let content = image(1).inner().mul_scalar(2.0).sub_scalar(0.5);
        let mut opt = Adam::new(AdamConfig::default());

        let out = optimize(
            &backbone,
            &refs,
            content.clone(),
            &params(0),
            &mut opt,
            None,
            None,
        )
        .unwrap();

        let expected = content.clamp(0.0, 1.0).into_data().to_vec::<f32>().unwrap();
        assert_eq!(out.into_data().to_vec::<f32>().unwrap(), expected);
    }

    #[test]
    fn style_loss_trends_down() {
        let backbone = backbone();
        let refs = References::new(&backbone, image(1), image(2));
        let mut opt = Recording::new(0.01, false);

        let params = LoopParams {
            steps: 100,
            composer: LossComposer::new(0.0, 1000.0),
            convergence: None,
        };
        optimize(
            &backbone,
            &refs,
            image(1).inner(),
            &params,
            &mut opt,
            None,
            None,
        )
        .unwrap();

        let mean = |s: &[f64]| s.iter().sum::<f64>() / s.len() as f64;
        let early = mean(&opt.losses[..10]);
        let late = mean(&opt.losses[90..]);
        assert!(late < early, "late {} >= early {}", late, early);
    }

    #[test]
    fn stalls_after_patience_checkpoints() {
        let mut state = LoopState::<I>::new(image(1).inner());
        let conv = Some(Convergence {
            tolerance: 0.5,
            patience: 2,
        });

        assert!(!state.checkpoint(10.0, conv));
        assert!(!state.checkpoint(9.8, conv));
        // a real improvement resets the count
        assert!(!state.checkpoint(5.0, conv));
        assert!(!state.checkpoint(4.9, conv));
        assert!(state.checkpoint(4.8, conv));
    }

    #[test]
    fn never_stalls_without_a_criterion() {
        let mut state = LoopState::<I>::new(image(1).inner());

        for _ in 0..10 {
            assert!(!state.checkpoint(1.0, None));
        }
    }

    #[test]
    fn raised_flag_cancels_before_the_first_step() {
        let backbone = backbone();
        let refs = References::new(&backbone, image(1), image(2));
        let mut opt = Adam::new(AdamConfig::default());
        let flag = AtomicBool::new(true);

        let err = optimize(
            &backbone,
            &refs,
            image(1).inner(),
            &params(10),
            &mut opt,
            None,
            Some(&flag),
        )
        .unwrap_err();

        assert!(matches!(err, Error::Cancelled { step: 0 }));
    }

    #[test]
    fn zero_style_weight_pulls_a_distant_start_toward_the_content() {
        let backbone = backbone();
        let refs = References::new(&backbone, image(1), image(2));
        let params = LoopParams {
            steps: 60,
            composer: LossComposer::new(1.0, 0.0),
            convergence: None,
        };

        let content_loss = |point: Tensor<I, 4>| {
            let objective = StyleObjective {
                backbone: &backbone,
                references: &refs,
                composer: params.composer,
                step: 0,
            };
            objective.evaluate(point).unwrap().loss.content
        };

        // start far away from the content so there is something to recover
        let start = image(3).inner();
        let before = content_loss(start.clone());
        assert!(before > 0.0);

        let mut opt = Lbfgs::new(LbfgsConfig::default());
        let out = optimize(&backbone, &refs, start, &params, &mut opt, None, None).unwrap();

        let after = content_loss(out);
        assert!(after < before, "after {} >= before {}", after, before);
    }
}
