//! RRDBNet graph construction. The layer layout and checkpoint key names
//! follow the BasicSR state dict: `conv_first`, `body.N.rdbM.convK`,
//! `conv_body`, `conv_up1`/`conv_up2`, `conv_hr`, `conv_last`.

use std::sync::Arc;

use log::info;
use sr_onnx_graph::onnx::ModelProto;
use sr_onnx_graph::operators::{Add, Concat, Constant, Conv, LeakyRelu, Mul, Resize};
use sr_onnx_graph::tensor::{DType, InputTensor, Shape, Tensor, TensorData};
use sr_onnx_graph::weights::WeightManager;

use crate::Error;

/// Opset the exported graph targets.
pub const OPSET_VERSION: i64 = 14;

const LRELU_ALPHA: f32 = 0.2;
const RESIDUAL_SCALE: f32 = 0.2;

#[derive(Debug, Clone, Copy)]
pub struct RrdbNetConfig {
    pub num_in_ch: usize,
    pub num_out_ch: usize,
    pub num_feat: usize,
    pub num_block: usize,
    pub num_grow_ch: usize,
    pub scale: usize,
}

/// The x4plus release configuration.
impl Default for RrdbNetConfig {
    fn default() -> Self {
        Self {
            num_in_ch: 3,
            num_out_ch: 3,
            num_feat: 64,
            num_block: 23,
            num_grow_ch: 32,
            scale: 4,
        }
    }
}

/// Infers the trunk depth from the highest `body.N.` index in the
/// checkpoint. Returns `None` when no body keys are present.
pub fn survey_block_count(weights: &impl WeightManager) -> Option<usize> {
    let mut max_index: Option<usize> = None;
    for name in weights.tensor_names() {
        let Some(rest) = name.strip_prefix("body.") else {
            continue;
        };
        let Some((index, _)) = rest.split_once('.') else {
            continue;
        };
        if let Ok(index) = index.parse::<usize>() {
            max_index = Some(max_index.map_or(index, |m| m.max(index)));
        }
    }
    max_index.map(|m| m + 1)
}

fn checkpoint_error(scope: &impl WeightManager, err: sr_onnx_graph::Error) -> Error {
    match scope.get_prefix() {
        Some(prefix) => Error::CheckpointFormat(format!("{prefix}: {err}")),
        None => Error::CheckpointFormat(err.to_string()),
    }
}

/// A 3x3 stride-1 convolution whose weight and bias live under `scope`.
/// The node is named after the checkpoint prefix.
fn conv(scope: &impl WeightManager, input: Arc<dyn Tensor>) -> Result<Arc<dyn Tensor>, Error> {
    let weight = scope
        .get_tensor("weight")
        .map_err(|e| checkpoint_error(scope, e))?;
    let bias = scope
        .get_tensor("bias")
        .map_err(|e| checkpoint_error(scope, e))?;
    let node = Conv::new(
        scope.get_prefix().map(str::to_string),
        input,
        weight,
        Some(bias),
    )
    .map_err(|e| checkpoint_error(scope, e))?;
    Ok(node)
}

fn lrelu(input: Arc<dyn Tensor>) -> Arc<dyn Tensor> {
    LeakyRelu::new(None, input, LRELU_ALPHA)
}

fn cat(inputs: Vec<Arc<dyn Tensor>>) -> Result<Arc<dyn Tensor>, Error> {
    Ok(Concat::new(None, inputs, 1)?)
}

/// `branch * 0.2 + identity`, the residual scaling both block levels use.
fn scaled_residual(
    branch: Arc<dyn Tensor>,
    identity: Arc<dyn Tensor>,
) -> Result<Arc<dyn Tensor>, Error> {
    let scale = Constant::new(None, TensorData::scalar_f32(RESIDUAL_SCALE))?;
    let scaled = Mul::new(None, branch, scale)?;
    Ok(Add::new(None, scaled, identity)?)
}

/// Five densely connected convolutions, each seeing the concatenation of
/// the block input and every preceding layer's output.
fn residual_dense_block(
    scope: &impl WeightManager,
    input: Arc<dyn Tensor>,
) -> Result<Arc<dyn Tensor>, Error> {
    let x = input;
    let x1 = lrelu(conv(&scope.prefix("conv1"), x.clone())?);
    let x2 = lrelu(conv(&scope.prefix("conv2"), cat(vec![x.clone(), x1.clone()])?)?);
    let x3 = lrelu(conv(
        &scope.prefix("conv3"),
        cat(vec![x.clone(), x1.clone(), x2.clone()])?,
    )?);
    let x4 = lrelu(conv(
        &scope.prefix("conv4"),
        cat(vec![x.clone(), x1.clone(), x2.clone(), x3.clone()])?,
    )?);
    let x5 = conv(&scope.prefix("conv5"), cat(vec![x.clone(), x1, x2, x3, x4])?)?;
    scaled_residual(x5, x)
}

fn rrdb(scope: &impl WeightManager, input: Arc<dyn Tensor>) -> Result<Arc<dyn Tensor>, Error> {
    let mut out = input.clone();
    for rdb in ["rdb1", "rdb2", "rdb3"] {
        out = residual_dense_block(&scope.prefix(rdb), out)?;
    }
    scaled_residual(out, input)
}

/// Builds the full network as an ONNX model with a fixed
/// `[1, num_in_ch, tile_size, tile_size]` float input named `input` and a
/// 4x upscaled output named `output`. Weights are embedded as
/// initializers under their checkpoint names.
pub fn build_rrdbnet(
    weights: &impl WeightManager,
    config: &RrdbNetConfig,
    tile_size: usize,
) -> Result<ModelProto, Error> {
    if config.scale != 4 {
        return Err(Error::Unsupported(format!(
            "scale {} (only the x4 RRDBNet layout is supported)",
            config.scale
        )));
    }

    let first_scope = weights.prefix("conv_first");
    let first_weight = first_scope
        .get_tensor("weight")
        .map_err(|e| checkpoint_error(&first_scope, e))?;
    let expected = vec![config.num_feat, config.num_in_ch, 3, 3];
    let actual = first_weight.shape().resolve().map_err(Error::Graph)?;
    if actual != expected {
        return Err(Error::CheckpointFormat(format!(
            "conv_first.weight has shape {actual:?}, expected {expected:?}"
        )));
    }

    let input = InputTensor::new(
        "input",
        DType::F32,
        Shape::fixed(&[1, config.num_in_ch, tile_size, tile_size]),
    );

    let first = conv(&first_scope, input.clone())?;
    let mut trunk = first.clone();
    for block in 0..config.num_block {
        trunk = rrdb(&weights.prefix(&format!("body.{block}")), trunk)?;
    }
    let trunk = conv(&weights.prefix("conv_body"), trunk)?;
    let mut feat: Arc<dyn Tensor> = Add::new(None, first, trunk)?;

    for up in ["conv_up1", "conv_up2"] {
        let upsampled = Resize::nearest(None, feat, 2)?;
        feat = lrelu(conv(&weights.prefix(up), upsampled)?);
    }
    let hr = lrelu(conv(&weights.prefix("conv_hr"), feat)?);
    let out = conv(&weights.prefix("conv_last"), hr)?;

    let model = sr_onnx_graph::build_proto("rrdbnet", &[input], &[("output", out)], OPSET_VERSION)?;
    if let Some(graph) = &model.graph {
        info!(
            "built RRDBNet graph: {} blocks, {} nodes, {} initializers",
            config.num_block,
            graph.node.len(),
            graph.initializer.len()
        );
    }
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sr_onnx_graph::weights::StaticWeightManager;
    use std::collections::HashMap;

    fn static_weights(entries: &[(&str, Vec<usize>)]) -> StaticWeightManager {
        let mut map = HashMap::new();
        for (name, dims) in entries {
            map.insert(
                name.to_string(),
                TensorData::fill(Shape::fixed(dims), 0.01f32).unwrap(),
            );
        }
        StaticWeightManager::new(map)
    }

    #[test]
    fn block_count_comes_from_highest_body_index() {
        let weights = static_weights(&[
            ("conv_first.weight", vec![4, 3, 3, 3]),
            ("body.0.rdb1.conv1.weight", vec![2, 4, 3, 3]),
            ("body.5.rdb3.conv5.weight", vec![4, 12, 3, 3]),
            ("body.2.rdb2.conv1.bias", vec![2]),
        ]);
        assert_eq!(survey_block_count(&weights), Some(6));
    }

    #[test]
    fn no_body_keys_means_no_count() {
        let weights = static_weights(&[("conv_first.weight", vec![4, 3, 3, 3])]);
        assert_eq!(survey_block_count(&weights), None);
    }

    #[test]
    fn wrong_conv_first_shape_is_a_checkpoint_error() {
        let weights = static_weights(&[
            ("conv_first.weight", vec![4, 3, 3, 3]),
            ("conv_first.bias", vec![4]),
        ]);
        let config = RrdbNetConfig {
            num_feat: 8,
            num_block: 1,
            num_grow_ch: 4,
            ..Default::default()
        };
        let result = build_rrdbnet(&weights, &config, 8);
        assert!(matches!(result, Err(Error::CheckpointFormat(_))));
    }

    #[test]
    fn non_x4_scale_is_rejected() {
        let weights = static_weights(&[("conv_first.weight", vec![4, 3, 3, 3])]);
        let config = RrdbNetConfig {
            scale: 2,
            ..Default::default()
        };
        assert!(matches!(
            build_rrdbnet(&weights, &config, 8),
            Err(Error::Unsupported(_))
        ));
    }
}
