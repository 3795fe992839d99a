//! A sequential evaluator for the exported graphs. Covers exactly the
//! operator vocabulary the builder emits; anything else fails verification
//! rather than silently passing.

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};
use sr_onnx_graph::onnx::tensor_proto::DataType;
use sr_onnx_graph::onnx::{GraphProto, NodeProto, TensorProto};

use crate::Error;

fn unsupported(node: &NodeProto, detail: &str) -> Error {
    Error::VerificationFailure(format!(
        "cannot evaluate {} node '{}': {}",
        node.op_type, node.name, detail
    ))
}

fn attr_ints<'a>(node: &'a NodeProto, name: &str) -> Option<&'a [i64]> {
    node.attribute
        .iter()
        .find(|a| a.name == name)
        .map(|a| a.ints.as_slice())
}

fn attr_float(node: &NodeProto, name: &str) -> Option<f32> {
    node.attribute.iter().find(|a| a.name == name).map(|a| a.f)
}

fn attr_int(node: &NodeProto, name: &str) -> Option<i64> {
    node.attribute.iter().find(|a| a.name == name).map(|a| a.i)
}

fn attr_string<'a>(node: &'a NodeProto, name: &str) -> Option<&'a [u8]> {
    node.attribute
        .iter()
        .find(|a| a.name == name)
        .map(|a| a.s.as_slice())
}

fn attr_tensor<'a>(node: &'a NodeProto, name: &str) -> Option<&'a TensorProto> {
    node.attribute
        .iter()
        .find(|a| a.name == name)
        .and_then(|a| a.t.as_ref())
}

pub fn tensor_from_proto(proto: &TensorProto, device: &Device) -> Result<Tensor, Error> {
    let dims: Vec<usize> = proto.dims.iter().map(|d| *d as usize).collect();
    let tensor = match DataType::try_from(proto.data_type) {
        Ok(DataType::Float) => {
            if proto.raw_data.is_empty() && !proto.float_data.is_empty() {
                Tensor::from_vec(proto.float_data.clone(), dims, device)?
            } else {
                Tensor::from_raw_buffer(&proto.raw_data, DType::F32, &dims, device)?
            }
        }
        Ok(DataType::Float16) => {
            Tensor::from_raw_buffer(&proto.raw_data, DType::F16, &dims, device)?
        }
        Ok(DataType::Int64) => {
            if proto.raw_data.is_empty() && !proto.int64_data.is_empty() {
                Tensor::from_vec(proto.int64_data.clone(), dims, device)?
            } else {
                Tensor::from_raw_buffer(&proto.raw_data, DType::I64, &dims, device)?
            }
        }
        _ => {
            return Err(Error::VerificationFailure(format!(
                "initializer '{}' has unsupported element type {}",
                proto.name, proto.data_type
            )));
        }
    };
    Ok(tensor)
}

fn lookup<'a>(env: &'a HashMap<String, Tensor>, name: &str) -> Result<&'a Tensor, Error> {
    env.get(name).ok_or_else(|| {
        Error::VerificationFailure(format!("value '{name}' referenced before it is computed"))
    })
}

fn eval_conv(node: &NodeProto, env: &HashMap<String, Tensor>) -> Result<Tensor, Error> {
    let input = lookup(env, &node.input[0])?;
    let weight = lookup(env, &node.input[1])?;
    let pads = attr_ints(node, "pads").unwrap_or(&[]);
    let padding = pads.first().copied().unwrap_or(0) as usize;
    if pads.iter().any(|p| *p as usize != padding) {
        return Err(unsupported(node, "asymmetric padding"));
    }
    let stride = attr_ints(node, "strides")
        .and_then(|s| s.first().copied())
        .unwrap_or(1) as usize;
    let dilation = attr_ints(node, "dilations")
        .and_then(|d| d.first().copied())
        .unwrap_or(1) as usize;
    let groups = attr_int(node, "group").unwrap_or(1) as usize;
    let mut out = input.conv2d(weight, padding, stride, dilation, groups)?;
    if let Some(bias_name) = node.input.get(2).filter(|n| !n.is_empty()) {
        let bias = lookup(env, bias_name)?;
        let channels = bias.dim(0)?;
        out = out.broadcast_add(&bias.reshape((1, channels, 1, 1))?)?;
    }
    Ok(out)
}

fn eval_leaky_relu(node: &NodeProto, env: &HashMap<String, Tensor>) -> Result<Tensor, Error> {
    let input = lookup(env, &node.input[0])?;
    let alpha = attr_float(node, "alpha").unwrap_or(0.01) as f64;
    let positive = input.maximum(0f64)?;
    let negative = input.minimum(0f64)?.affine(alpha, 0.0)?;
    Ok(positive.add(&negative)?)
}

fn eval_resize(node: &NodeProto, env: &HashMap<String, Tensor>) -> Result<Tensor, Error> {
    if attr_string(node, "mode") != Some(b"nearest") {
        return Err(unsupported(node, "only nearest mode is evaluated"));
    }
    let input = lookup(env, &node.input[0])?;
    // Inputs run x, roi (empty placeholder), scales.
    let scales_name = node.input[1..]
        .iter()
        .rev()
        .find(|n| !n.is_empty())
        .ok_or_else(|| unsupported(node, "missing scales input"))?;
    // Half-precision graphs carry half-precision scales; widen to read.
    let scales = lookup(env, scales_name)?
        .to_dtype(DType::F32)?
        .to_vec1::<f32>()?;
    if scales.len() != 4 || scales[0] != 1.0 || scales[1] != 1.0 {
        return Err(unsupported(node, "only spatial scaling is evaluated"));
    }
    let (_, _, height, width) = input.dims4()?;
    let out_height = (height as f32 * scales[2]).floor() as usize;
    let out_width = (width as f32 * scales[3]).floor() as usize;
    Ok(input.upsample_nearest2d(out_height, out_width)?)
}

fn eval_concat(node: &NodeProto, env: &HashMap<String, Tensor>) -> Result<Tensor, Error> {
    let inputs: Vec<&Tensor> = node
        .input
        .iter()
        .map(|name| lookup(env, name))
        .collect::<Result<_, _>>()?;
    let rank = inputs
        .first()
        .ok_or_else(|| unsupported(node, "no inputs"))?
        .rank();
    let axis = attr_int(node, "axis").unwrap_or(0);
    let axis = if axis < 0 { rank as i64 + axis } else { axis } as usize;
    Ok(Tensor::cat(&inputs, axis)?)
}

/// Runs every node in declaration order and returns the graph outputs.
/// The graph must be topologically sorted, which `check_model` enforces
/// before execution.
pub fn run_graph(
    graph: &GraphProto,
    inputs: HashMap<String, Tensor>,
) -> Result<Vec<Tensor>, Error> {
    let device = Device::Cpu;
    let mut env = inputs;
    for initializer in &graph.initializer {
        env.insert(
            initializer.name.clone(),
            tensor_from_proto(initializer, &device)?,
        );
    }

    for node in &graph.node {
        let value = match node.op_type.as_str() {
            "Conv" => eval_conv(node, &env)?,
            "LeakyRelu" => eval_leaky_relu(node, &env)?,
            "Resize" => eval_resize(node, &env)?,
            "Add" => lookup(&env, &node.input[0])?.broadcast_add(lookup(&env, &node.input[1])?)?,
            "Mul" => lookup(&env, &node.input[0])?.broadcast_mul(lookup(&env, &node.input[1])?)?,
            "Concat" => eval_concat(node, &env)?,
            "Constant" => {
                let proto = attr_tensor(node, "value")
                    .ok_or_else(|| unsupported(node, "missing value attribute"))?;
                tensor_from_proto(proto, &device)?
            }
            other => return Err(unsupported(node, &format!("unknown op_type {other}"))),
        };
        let output_name = node
            .output
            .first()
            .ok_or_else(|| unsupported(node, "node declares no output"))?;
        env.insert(output_name.clone(), value);
    }

    graph
        .output
        .iter()
        .map(|output| {
            env.get(&output.name).cloned().ok_or_else(|| {
                Error::VerificationFailure(format!(
                    "graph output '{}' was never computed",
                    output.name
                ))
            })
        })
        .collect()
}
