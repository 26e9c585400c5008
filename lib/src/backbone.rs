//! Frozen VGG feature backbone.
//!
//! The stage indexing mirrors torchvision's `vgg16().features` and
//! `vgg19().features` sequentials, so a layer identifier such as `21` refers
//! to the same convolution (`conv4_2` on VGG19) as it does in a torchvision
//! state dict, and pretrained weights can be loaded without translation
//! tables beyond the conv ordinal.

use crate::Error;
use burn::{
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        PaddingConfig2d,
    },
    record::{FullPrecisionSettings, Recorder},
    tensor::{activation::relu, backend::Backend, Tensor},
};
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};
use std::{collections::BTreeMap, ops::Index, path::Path, str::FromStr};

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

const BLOCK_CHANNELS: [usize; 5] = [64, 128, 256, 512, 512];

/// The pretrained convolutional stacks that can serve as a backbone
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Variant {
    /// 13 convolutions in 5 blocks
    Vgg16,
    /// 16 convolutions in 5 blocks
    Vgg19,
}

impl Variant {
    fn block_depths(self) -> [usize; 5] {
        match self {
            Self::Vgg16 => [2, 2, 3, 3, 3],
            Self::Vgg19 => [2, 2, 4, 4, 4],
        }
    }

    /// The stage plan of this variant's feature extractor
    pub fn architecture(self) -> Architecture {
        let mut stages = Vec::new();
        let mut in_channels = 3;

        for (depth, out_channels) in self.block_depths().iter().zip(BLOCK_CHANNELS.iter()) {
            for _ in 0..*depth {
                stages.push(Stage::Conv {
                    in_channels,
                    out_channels: *out_channels,
                });
                stages.push(Stage::Relu);
                in_channels = *out_channels;
            }
            stages.push(Stage::MaxPool);
        }

        Architecture::new(stages)
    }

    /// The style and content layers used for this variant
    ///
    /// Style is read from the first convolution of every block, content from
    /// `conv4_2`.
    pub fn layer_set(self) -> LayerSet {
        match self {
            Self::Vgg19 => LayerSet::new(vec![0, 5, 10, 19, 28], 21),
            Self::Vgg16 => LayerSet::new(vec![0, 5, 10, 17, 24], 19),
        }
    }
}

impl FromStr for Variant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vgg16" => Ok(Self::Vgg16),
            "vgg19" => Ok(Self::Vgg19),
            other => Err(format!("backbone `{}` not one of: 'vgg16', 'vgg19'", other)),
        }
    }
}

/// A single stage of a sequential feature extractor
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Stage {
    /// 3x3 convolution with a padding of 1
    Conv {
        in_channels: usize,
        out_channels: usize,
    },
    Relu,
    /// 2x2 max pooling with a stride of 2
    MaxPool,
}

/// An ordered list of stages, indexed the same way as the layer identifiers
/// in a `LayerSet`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Architecture {
    stages: Vec<Stage>,
}

impl Architecture {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Stage indices of every convolution, in order
    fn conv_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.stages
            .iter()
            .enumerate()
            .filter(|(_, stage)| matches!(stage, Stage::Conv { .. }))
            .map(|(index, _)| index)
    }

    /// The conventional name of a stage, eg. `conv4_2` or `pool3`
    pub fn layer_name(&self, index: usize) -> String {
        let mut block = 1;
        let mut conv = 0;
        let mut relu = 0;

        for (i, stage) in self.stages.iter().enumerate() {
            let name = match stage {
                Stage::Conv { .. } => {
                    conv += 1;
                    format!("conv{}_{}", block, conv)
                }
                Stage::Relu => {
                    relu += 1;
                    format!("relu{}_{}", block, relu)
                }
                Stage::MaxPool => {
                    let name = format!("pool{}", block);
                    block += 1;
                    conv = 0;
                    relu = 0;
                    name
                }
            };

            if i == index {
                return name;
            }
        }

        format!("stage{}", index)
    }
}

/// The fixed mapping of backbone stages to their semantic roles
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayerSet {
    style: Vec<usize>,
    content: usize,
}

impl LayerSet {
    pub fn new(style: Vec<usize>, content: usize) -> Self {
        Self { style, content }
    }

    /// Layers whose Gram matrices describe style, shallow to deep
    pub fn style(&self) -> &[usize] {
        &self.style
    }

    pub fn content(&self) -> usize {
        self.content
    }

    pub fn contains(&self, layer: usize) -> bool {
        self.content == layer || self.style.contains(&layer)
    }

    fn deepest(&self) -> usize {
        self.style
            .iter()
            .copied()
            .chain(std::iter::once(self.content))
            .max()
            .unwrap_or(self.content)
    }
}

#[derive(Module, Debug)]
struct Features<B: Backend> {
    convs: Vec<Conv2d<B>>,
}

impl<B: Backend> Features<B> {
    fn new(architecture: &Architecture, device: &B::Device) -> Self {
        let convs = architecture
            .stages()
            .iter()
            .filter_map(|stage| match stage {
                Stage::Conv {
                    in_channels,
                    out_channels,
                } => Some(
                    Conv2dConfig::new([*in_channels, *out_channels], [3, 3])
                        .with_padding(PaddingConfig2d::Explicit(1, 1))
                        .init(device),
                ),
                _ => None,
            })
            .collect();

        Self { convs }
    }
}

/// Intermediate activations captured during a single forward pass, keyed by
/// stage index
pub struct Activations<B: Backend> {
    maps: BTreeMap<usize, Tensor<B, 4>>,
}

impl<B: Backend> Activations<B> {
    pub fn get(&self, layer: usize) -> Option<&Tensor<B, 4>> {
        self.maps.get(&layer)
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    pub fn layers(&self) -> impl Iterator<Item = usize> + '_ {
        self.maps.keys().copied()
    }
}

impl<B: Backend> Index<usize> for Activations<B> {
    type Output = Tensor<B, 4>;

    fn index(&self, layer: usize) -> &Self::Output {
        &self.maps[&layer]
    }
}

/// A pretrained, frozen convolutional network used purely for feature
/// extraction.
///
/// The parameters are never updated after construction, so a single backbone
/// can be shared by reference between any number of concurrent transfers.
#[derive(Debug)]
pub struct Backbone<B: Backend> {
    features: Features<B>,
    pool: MaxPool2d,
    architecture: Architecture,
    layers: LayerSet,
    device: B::Device,
}

impl<B: Backend> Backbone<B> {
    /// Creates a backbone with randomly initialized weights.
    ///
    /// Mostly useful for small custom architectures, as a random VGG is a
    /// poor judge of style.
    pub fn new(
        architecture: Architecture,
        layers: LayerSet,
        device: &B::Device,
    ) -> Result<Self, Error> {
        let features = Features::new(&architecture, device).no_grad();
        Self::assemble(features, architecture, layers, device)
    }

    /// Loads pretrained weights for `variant` from a torchvision state dict,
    /// eg. `vgg19-dcbb9e9d.pth`, placing them on `device`.
    pub fn load<P: AsRef<Path>>(
        variant: Variant,
        weights: P,
        device: &B::Device,
    ) -> Result<Self, Error> {
        let path = weights.as_ref();
        let unavailable = |reason: String| Error::BackboneUnavailable {
            path: path.to_path_buf(),
            reason,
        };

        if !path.is_file() {
            return Err(unavailable("no such file".to_owned()));
        }

        let architecture = variant.architecture();

        let mut args = LoadArgs::new(path.to_path_buf());
        for (ordinal, index) in architecture.conv_indices().enumerate() {
            args = args.with_key_remap(
                &format!(r"^features\.{}\.(.+)$", index),
                &format!("convs.{}.$1", ordinal),
            );
        }

        let record = PyTorchFileRecorder::<FullPrecisionSettings>::default()
            .load(args, device)
            .map_err(|err| unavailable(format!("{:?}", err)))?;

        let features = Features::new(&architecture, device)
            .load_record(record)
            .no_grad();

        tracing::debug!(
            ?variant,
            path = %path.display(),
            convolutions = features.convs.len(),
            "loaded backbone weights"
        );

        Self::assemble(features, architecture, variant.layer_set(), device)
    }

    fn assemble(
        features: Features<B>,
        architecture: Architecture,
        layers: LayerSet,
        device: &B::Device,
    ) -> Result<Self, Error> {
        let stages = architecture.stages();
        let last = stages.len().saturating_sub(1);
        for layer in layers.style().iter().chain(std::iter::once(&layers.content())) {
            if *layer > last || stages.is_empty() {
                return Err(Error::invalid_range(
                    "layer",
                    *layer as f64,
                    0.0,
                    last as f64,
                ));
            }

            // A captured conv already consumes the ReLU behind it
            if let (Stage::Conv { .. }, Some(Stage::Relu)) = (stages[*layer], stages.get(layer + 1))
            {
                if layers.contains(layer + 1) {
                    return Err(Error::InvalidLayerSet {
                        layer: layer + 1,
                        reason: "it is the ReLU of a captured convolution",
                    });
                }
            }
        }

        Ok(Self {
            features,
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            architecture,
            layers,
            device: device.clone(),
        })
    }

    /// The device the parameters live on, and on which inputs are created
    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn architecture(&self) -> &Architecture {
        &self.architecture
    }

    /// The shortest image side that still leaves at least one pixel at the
    /// deepest captured layer
    pub fn min_input_side(&self) -> u32 {
        let pools = self.architecture.stages()[..=self.layers.deepest()]
            .iter()
            .filter(|stage| matches!(stage, Stage::MaxPool))
            .count();

        1 << pools
    }

    pub fn layers(&self) -> &LayerSet {
        &self.layers
    }

    /// Runs `image` (shape `[1, 3, H, W]`, values in `[0, 1]`) through the
    /// stages and captures every activation named in the layer set.
    ///
    /// Evaluation stops after the deepest requested stage. A captured
    /// convolution is recorded after the ReLU that directly follows it, which
    /// is what torchvision's in-place ReLU exposes at the same index.
    pub fn extract(&self, image: Tensor<B, 4>) -> Activations<B> {
        let stages = self.architecture.stages();
        let deepest = self.layers.deepest();

        let mut maps = BTreeMap::new();
        let mut x = normalize(image);
        let mut conv = 0;
        let mut index = 0;

        while index <= deepest {
            let layer = index;

            x = match stages[index] {
                Stage::Conv { .. } => {
                    let out = self.features.convs[conv].forward(x);
                    conv += 1;
                    out
                }
                Stage::Relu => relu(x),
                Stage::MaxPool => self.pool.forward(x),
            };

            if self.layers.contains(layer) {
                if let Some(Stage::Relu) = stages.get(index + 1) {
                    x = relu(x);
                    index += 1;
                }

                maps.insert(layer, x.clone());
            }

            index += 1;
        }

        Activations { maps }
    }
}

fn normalize<B: Backend>(image: Tensor<B, 4>) -> Tensor<B, 4> {
    let device = image.device();
    let mean = Tensor::<B, 1>::from_floats(IMAGENET_MEAN, &device).reshape([1, 3, 1, 1]);
    let std = Tensor::<B, 1>::from_floats(IMAGENET_STD, &device).reshape([1, 3, 1, 1]);

    (image - mean) / std
}

#[cfg(test)]
mod test {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray;

    #[test]
    fn vgg19_plan_matches_torchvision_indexing() {
        let arch = Variant::Vgg19.architecture();

        assert_eq!(arch.stages().len(), 37);
        assert_eq!(arch.conv_indices().count(), 16);
        assert_eq!(arch.layer_name(0), "conv1_1");
        assert_eq!(arch.layer_name(5), "conv2_1");
        assert_eq!(arch.layer_name(10), "conv3_1");
        assert_eq!(arch.layer_name(19), "conv4_1");
        assert_eq!(arch.layer_name(21), "conv4_2");
        assert_eq!(arch.layer_name(28), "conv5_1");
        assert_eq!(arch.layer_name(4), "pool1");
    }

    #[test]
    fn vgg16_plan_matches_torchvision_indexing() {
        let arch = Variant::Vgg16.architecture();

        assert_eq!(arch.stages().len(), 31);
        assert_eq!(arch.conv_indices().count(), 13);
        assert_eq!(arch.layer_name(17), "conv4_1");
        assert_eq!(arch.layer_name(19), "conv4_2");
        assert_eq!(arch.layer_name(24), "conv5_1");
    }

    #[test]
    fn layer_sets_only_name_convolutions() {
        for variant in [Variant::Vgg16, Variant::Vgg19] {
            let arch = variant.architecture();
            let layers = variant.layer_set();

            assert_eq!(layers.style().len(), 5);
            for layer in layers.style().iter().chain(Some(&layers.content())) {
                assert!(matches!(arch.stages()[*layer], Stage::Conv { .. }));
            }
        }
    }

    #[test]
    fn parses_variant_names() {
        assert_eq!("vgg16".parse::<Variant>().unwrap(), Variant::Vgg16);
        assert_eq!("vgg19".parse::<Variant>().unwrap(), Variant::Vgg19);
        assert!("resnet".parse::<Variant>().is_err());
    }

    fn tiny() -> Backbone<B> {
        let arch = Architecture::new(vec![
            Stage::Conv {
                in_channels: 3,
                out_channels: 4,
            },
            Stage::Relu,
            Stage::MaxPool,
            Stage::Conv {
                in_channels: 4,
                out_channels: 6,
            },
            Stage::Relu,
            Stage::Conv {
                in_channels: 6,
                out_channels: 6,
            },
            Stage::Relu,
        ]);

        Backbone::new(arch, LayerSet::new(vec![0, 3], 3), &Default::default()).unwrap()
    }

    #[test]
    fn extracts_every_requested_layer() {
        let backbone = tiny();
        let image = Tensor::<B, 4>::ones([1, 3, 8, 6], &Default::default()).mul_scalar(0.5);

        let acts = backbone.extract(image);

        assert_eq!(acts.len(), 2);
        assert_eq!(acts.layers().collect::<Vec<_>>(), vec![0, 3]);
        assert_eq!(acts[0].dims(), [1, 4, 8, 6]);
        assert_eq!(acts[3].dims(), [1, 6, 4, 3]);
    }

    #[test]
    fn captured_convolutions_are_rectified() {
        let backbone = tiny();
        let image = Tensor::<B, 4>::ones([1, 3, 4, 4], &Default::default());

        let acts = backbone.extract(image);
        let min: f32 = acts[0].clone().min().into_scalar();

        assert!(min >= 0.0);
    }

    #[test]
    fn rejects_layers_outside_the_architecture() {
        let arch = Architecture::new(vec![Stage::Conv {
            in_channels: 3,
            out_channels: 2,
        }]);

        let err = Backbone::<B>::new(arch, LayerSet::new(vec![0], 4), &Default::default())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRange(_)));
    }

    #[test]
    fn rejects_the_relu_of_a_captured_convolution() {
        let arch = Architecture::new(vec![
            Stage::Conv {
                in_channels: 3,
                out_channels: 2,
            },
            Stage::Relu,
        ]);

        let err = Backbone::<B>::new(arch, LayerSet::new(vec![0, 1], 0), &Default::default())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidLayerSet { layer: 1, .. }));
    }

    #[test]
    fn min_input_side_counts_pools_up_to_the_deepest_layer() {
        // one pool in front of stage 3
        assert_eq!(tiny().min_input_side(), 2);

        let arch = Architecture::new(vec![
            Stage::Conv {
                in_channels: 3,
                out_channels: 2,
            },
            Stage::MaxPool,
            Stage::MaxPool,
            Stage::MaxPool,
        ]);
        let backbone = Backbone::<B>::new(arch, LayerSet::new(vec![0], 2), &Default::default())
            .unwrap();
        assert_eq!(backbone.min_input_side(), 4);
    }

    #[test]
    fn missing_weights_are_unavailable() {
        let err = Backbone::<B>::load(
            Variant::Vgg19,
            "definitely/not/here/vgg19.pth",
            &Default::default(),
        )
        .unwrap_err();

        assert!(matches!(err, Error::BackboneUnavailable { .. }));
    }
}
