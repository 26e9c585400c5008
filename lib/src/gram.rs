use burn::tensor::{backend::Backend, Tensor};

/// Computes the normalized Gram matrix of an activation map.
///
/// The map (`[1, C, H, W]`) is flattened to `[C, H*W]` and multiplied with
/// its own transpose, then divided by `C*H*W`. The resulting `[C, C]` matrix
/// holds channel co-activation statistics that no longer depend on where in
/// the image the features occurred.
pub fn gram_matrix<B: Backend>(activation: Tensor<B, 4>) -> Tensor<B, 2> {
    let [batch, channels, height, width] = activation.dims();
    let features = activation.reshape([batch * channels, height * width]);

    features
        .clone()
        .matmul(features.transpose())
        .div_scalar((batch * channels * height * width) as f32)
}
