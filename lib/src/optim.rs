//! Optimizer strategies for the working image.
//!
//! An optimizer only sees an [`Objective`] it can evaluate at any point, so
//! the loss composition and the feature backbone stay out of its business and
//! strategies can be swapped freely.

use crate::{loss::LossValue, Error};
use burn::tensor::{backend::Backend, ElementConversion, Tensor};
use std::{collections::VecDeque, str::FromStr};

/// The objective value and its gradient at a point
pub struct Evaluation<B: Backend> {
    /// The point that was actually evaluated, which may differ from the
    /// requested one if the objective projects it into its domain
    pub point: Tensor<B, 4>,
    pub gradient: Tensor<B, 4>,
    pub loss: LossValue,
}

pub trait Objective<B: Backend> {
    fn evaluate(&self, point: Tensor<B, 4>) -> Result<Evaluation<B>, Error>;
}

/// The result of a single optimizer step
pub struct StepOutcome<B: Backend> {
    /// The updated point
    pub point: Tensor<B, 4>,
    /// The loss at the point the step started from
    pub loss: LossValue,
}

pub trait Optimizer<B: Backend> {
    /// Performs one update starting from `point`
    fn step(
        &mut self,
        point: Tensor<B, 4>,
        objective: &dyn Objective<B>,
    ) -> Result<StepOutcome<B>, Error>;
}

/// Selects which optimizer a session uses
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum OptimizerKind {
    Lbfgs(LbfgsConfig),
    Adam(AdamConfig),
}

impl Default for OptimizerKind {
    fn default() -> Self {
        Self::Lbfgs(LbfgsConfig::default())
    }
}

impl OptimizerKind {
    pub(crate) fn build<B: Backend>(self) -> Box<dyn Optimizer<B>> {
        match self {
            Self::Lbfgs(config) => Box::new(Lbfgs::new(config)),
            Self::Adam(config) => Box::new(Adam::new(config)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Lbfgs(_) => "lbfgs",
            Self::Adam(_) => "adam",
        }
    }
}

impl FromStr for OptimizerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lbfgs" => Ok(Self::Lbfgs(LbfgsConfig::default())),
            "adam" => Ok(Self::Adam(AdamConfig::default())),
            other => Err(format!("optimizer `{}` not one of: 'lbfgs', 'adam'", other)),
        }
    }
}

fn dot<B: Backend>(a: &Tensor<B, 4>, b: &Tensor<B, 4>) -> f64 {
    (a.clone() * b.clone()).sum().into_scalar().elem::<f64>()
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct LbfgsConfig {
    pub learning_rate: f64,
    /// Number of curvature pairs kept for the inverse Hessian estimate
    pub history_size: usize,
}

impl Default for LbfgsConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1.0,
            history_size: 100,
        }
    }
}

struct CurvaturePair<B: Backend> {
    s: Tensor<B, 4>,
    y: Tensor<B, 4>,
    rho: f64,
}

struct PreviousStep<B: Backend> {
    gradient: Tensor<B, 4>,
    direction: Tensor<B, 4>,
    step_size: f64,
}

/// Limited-memory BFGS without a line search.
///
/// Every step evaluates the objective exactly once and moves along the
/// quasi-Newton direction with a fixed step size, except for the very first
/// step, which is shrunk by the L1 norm of the gradient since there is no
/// curvature information yet.
pub struct Lbfgs<B: Backend> {
    config: LbfgsConfig,
    history: VecDeque<CurvaturePair<B>>,
    previous: Option<PreviousStep<B>>,
    hessian_diag: f64,
}

impl<B: Backend> Lbfgs<B> {
    pub fn new(config: LbfgsConfig) -> Self {
        Self {
            config,
            history: VecDeque::with_capacity(config.history_size),
            previous: None,
            hessian_diag: 1.0,
        }
    }

    fn update_history(&mut self, gradient: &Tensor<B, 4>) {
        let prev = match self.previous.take() {
            Some(prev) => prev,
            None => return,
        };

        let y = gradient.clone() - prev.gradient;
        let s = prev.direction.mul_scalar(prev.step_size);
        let ys = dot(&y, &s);

        // Skip pairs that would break positive definiteness
        if ys.is_nan() || ys <= 1e-10 {
            return;
        }

        if self.history.len() == self.config.history_size {
            self.history.pop_front();
        }

        self.hessian_diag = ys / dot(&y, &y);
        self.history.push_back(CurvaturePair { s, y, rho: 1.0 / ys });
    }

    /// Two-loop recursion for `-H * gradient`
    fn direction(&self, gradient: &Tensor<B, 4>) -> Tensor<B, 4> {
        let mut q = gradient.clone().neg();
        let mut alphas = Vec::with_capacity(self.history.len());

        for pair in self.history.iter().rev() {
            let alpha = pair.rho * dot(&pair.s, &q);
            q = q - pair.y.clone().mul_scalar(alpha);
            alphas.push(alpha);
        }

        let mut r = q.mul_scalar(self.hessian_diag);

        for (pair, alpha) in self.history.iter().zip(alphas.iter().rev()) {
            let beta = pair.rho * dot(&pair.y, &r);
            r = r + pair.s.clone().mul_scalar(alpha - beta);
        }

        r
    }
}

impl<B: Backend> Optimizer<B> for Lbfgs<B> {
    fn step(
        &mut self,
        point: Tensor<B, 4>,
        objective: &dyn Objective<B>,
    ) -> Result<StepOutcome<B>, Error> {
        let eval = objective.evaluate(point)?;

        let first = self.previous.is_none() && self.history.is_empty();
        self.update_history(&eval.gradient);

        let direction = self.direction(&eval.gradient);
        let step_size = if first {
            let l1 = eval.gradient.clone().abs().sum().into_scalar().elem::<f64>();
            (1.0 / l1).min(1.0) * self.config.learning_rate
        } else {
            self.config.learning_rate
        };

        let next = eval.point + direction.clone().mul_scalar(step_size);

        self.previous = Some(PreviousStep {
            gradient: eval.gradient,
            direction,
            step_size,
        });

        Ok(StepOutcome {
            point: next,
            loss: eval.loss,
        })
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct AdamConfig {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.02,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

/// First-order adaptive moment estimation, one evaluation per step
pub struct Adam<B: Backend> {
    config: AdamConfig,
    moments: Option<(Tensor<B, 4>, Tensor<B, 4>)>,
    t: i32,
}

impl<B: Backend> Adam<B> {
    pub fn new(config: AdamConfig) -> Self {
        Self {
            config,
            moments: None,
            t: 0,
        }
    }
}

impl<B: Backend> Optimizer<B> for Adam<B> {
    fn step(
        &mut self,
        point: Tensor<B, 4>,
        objective: &dyn Objective<B>,
    ) -> Result<StepOutcome<B>, Error> {
        let eval = objective.evaluate(point)?;
        let c = self.config;
        let g = eval.gradient;

        let (m, v) = match self.moments.take() {
            Some((m, v)) => (m, v),
            None => (g.zeros_like(), g.zeros_like()),
        };

        let m = m.mul_scalar(c.beta1) + g.clone().mul_scalar(1.0 - c.beta1);
        let v = v.mul_scalar(c.beta2) + g.powf_scalar(2.0).mul_scalar(1.0 - c.beta2);
        self.t += 1;

        let m_hat = m.clone().div_scalar(1.0 - c.beta1.powi(self.t));
        let v_hat = v.clone().div_scalar(1.0 - c.beta2.powi(self.t));

        let update = m_hat
            .div(v_hat.sqrt().add_scalar(c.epsilon))
            .mul_scalar(c.learning_rate);

        self.moments = Some((m, v));

        Ok(StepOutcome {
            point: eval.point - update,
            loss: eval.loss,
        })
    }
}
