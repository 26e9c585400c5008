use crate::{
    backbone::{Activations, Backbone},
    gram::gram_matrix,
};
use burn::tensor::{backend::Backend, ElementConversion, Tensor};

/// The targets a working image is compared against, computed once per
/// transfer and only read afterwards.
pub struct References<B: Backend> {
    content: Tensor<B, 4>,
    style: Vec<(usize, Tensor<B, 2>)>,
}

impl<B: Backend> References<B> {
    /// Extracts the content activation from `content` and the style Gram
    /// matrices from `style`.
    pub fn new(backbone: &Backbone<B>, content: Tensor<B, 4>, style: Tensor<B, 4>) -> Self {
        let layers = backbone.layers();

        let content = backbone.extract(content)[layers.content()]
            .clone()
            .detach();

        let style_acts = backbone.extract(style);
        let style = layers
            .style()
            .iter()
            .map(|layer| (*layer, gram_matrix(style_acts[*layer].clone()).detach()))
            .collect();

        Self { content, style }
    }

    pub fn content(&self) -> &Tensor<B, 4> {
        &self.content
    }

    /// The reference Gram matrix for each style layer, keyed by stage index
    pub fn style(&self) -> &[(usize, Tensor<B, 2>)] {
        &self.style
    }
}

/// The weighted loss components of a single evaluation, still attached to the
/// autodiff graph
pub struct LossTerms<B: Backend> {
    pub content: Tensor<B, 1>,
    pub style: Tensor<B, 1>,
}

impl<B: Backend> LossTerms<B> {
    pub fn total(&self) -> Tensor<B, 1> {
        self.content.clone() + self.style.clone()
    }

    /// Reads the components back to the host
    pub fn value(&self) -> LossValue {
        LossValue {
            content: self.content.clone().into_scalar().elem::<f64>(),
            style: self.style.clone().into_scalar().elem::<f64>(),
        }
    }
}

/// Host-side copy of the weighted loss components
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct LossValue {
    pub content: f64,
    pub style: f64,
}

impl LossValue {
    pub fn total(&self) -> f64 {
        self.content + self.style
    }

    pub fn is_finite(&self) -> bool {
        self.content.is_finite() && self.style.is_finite()
    }
}

/// Combines the content and style distances into a single objective.
///
/// Gram differences are orders of magnitude smaller than raw activation
/// differences, so a style weight around `1e6` against a content weight of
/// `1` puts both gradients on a comparable footing.
#[derive(Copy, Clone, Debug)]
pub struct LossComposer {
    pub content_weight: f64,
    pub style_weight: f64,
}

impl LossComposer {
    pub fn new(content_weight: f64, style_weight: f64) -> Self {
        Self {
            content_weight,
            style_weight,
        }
    }

    pub fn compose<B: Backend>(
        &self,
        current: &Activations<B>,
        references: &References<B>,
        content_layer: usize,
    ) -> LossTerms<B> {
        let content = mse(current[content_layer].clone(), references.content().clone())
            .mul_scalar(self.content_weight);

        let device = references.content().device();
        let style = references
            .style()
            .iter()
            .fold(Tensor::<B, 1>::zeros([1], &device), |acc, (layer, target)| {
                acc + mse(gram_matrix(current[*layer].clone()), target.clone())
            })
            .mul_scalar(self.style_weight);

        LossTerms { content, style }
    }
}

fn mse<B: Backend, const D: usize>(a: Tensor<B, D>, b: Tensor<B, D>) -> Tensor<B, 1> {
    (a - b).powf_scalar(2.0).mean()
}
