//! Post-export sanity checks: structural validation of the encoded model
//! and a test run against synthetic input that must produce the expected
//! upscaled shape.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use log::info;
use prost::Message;
use sr_onnx_graph::onnx::tensor_proto::DataType;
use sr_onnx_graph::onnx::{ModelProto, ValueInfoProto};

use crate::runtime::run_graph;
use crate::Error;

#[derive(Debug)]
pub struct VerifyReport {
    pub nodes: usize,
    pub output_dims: Vec<usize>,
}

fn fail(detail: String) -> Error {
    Error::VerificationFailure(detail)
}

fn payload_width(data_type: i32) -> Option<usize> {
    match DataType::try_from(data_type) {
        Ok(DataType::Float) => Some(4),
        Ok(DataType::Float16) => Some(2),
        Ok(DataType::Int64) => Some(8),
        _ => None,
    }
}

/// Structural validation: opset imports present, initializer payloads match
/// their declared shapes, value names unique, and every node input produced
/// before it is consumed.
pub fn check_model(model: &ModelProto) -> Result<(), Error> {
    let graph = model.graph.as_ref().ok_or(Error::EmptyModel)?;
    if model.opset_import.is_empty() {
        return Err(fail("model declares no opset imports".to_string()));
    }

    let mut known: HashSet<&str> = HashSet::new();
    for input in &graph.input {
        known.insert(&input.name);
    }
    for initializer in &graph.initializer {
        if let Some(width) = payload_width(initializer.data_type) {
            let bytes = if !initializer.raw_data.is_empty() {
                initializer.raw_data.len()
            } else {
                initializer.float_data.len() * 4 + initializer.int64_data.len() * 8
            };
            let elements = initializer.dims.iter().product::<i64>().max(0) as usize;
            if bytes != elements * width {
                return Err(fail(format!(
                    "initializer '{}' carries {} bytes for {} declared elements",
                    initializer.name, bytes, elements
                )));
            }
        }
        known.insert(&initializer.name);
    }

    for node in &graph.node {
        for input in &node.input {
            if !input.is_empty() && !known.contains(input.as_str()) {
                return Err(fail(format!(
                    "{} node consumes '{}' before it is produced",
                    node.op_type, input
                )));
            }
        }
        for output in &node.output {
            if !known.insert(output) {
                return Err(fail(format!("value name '{output}' is produced twice")));
            }
        }
    }
    for output in &graph.output {
        if !known.contains(output.name.as_str()) {
            return Err(fail(format!(
                "graph output '{}' is never produced",
                output.name
            )));
        }
    }
    Ok(())
}

fn declared_tensor(value_info: &ValueInfoProto) -> Result<(Vec<Option<usize>>, i32), Error> {
    let Some(sr_onnx_graph::onnx::type_proto::Value::TensorType(tensor_type)) =
        value_info.r#type.as_ref().and_then(|t| t.value.as_ref())
    else {
        return Err(fail(format!(
            "declaration '{}' is not a tensor type",
            value_info.name
        )));
    };
    let dims = tensor_type
        .shape
        .as_ref()
        .map(|shape| {
            shape
                .dim
                .iter()
                .map(|dim| match &dim.value {
                    Some(sr_onnx_graph::onnx::tensor_shape_proto::dimension::Value::DimValue(
                        v,
                    )) => Some(*v as usize),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();
    Ok((dims, tensor_type.elem_type))
}

fn element_dtype(elem_type: i32, name: &str) -> Result<DType, Error> {
    match DataType::try_from(elem_type) {
        Ok(DataType::Float) => Ok(DType::F32),
        Ok(DataType::Float16) => Ok(DType::F16),
        _ => Err(fail(format!(
            "'{name}' declares element type {elem_type}, which the evaluator cannot feed"
        ))),
    }
}

/// Decodes the model at `path`, checks it structurally, runs it on a random
/// `(1, 3, tile_size, tile_size)` input (symbolic axes fall back to those
/// defaults) and confirms the output shape is upscaled by `scale` with the
/// declared element type.
pub fn verify_model(path: &Path, tile_size: usize, scale: usize) -> Result<VerifyReport, Error> {
    if !path.is_file() {
        return Err(Error::InputNotFound(path.to_path_buf()));
    }
    let bytes = fs::read(path)?;
    let model = ModelProto::decode(bytes.as_slice())?;
    check_model(&model)?;
    let graph = model.graph.as_ref().ok_or(Error::EmptyModel)?;

    let input_decl = graph
        .input
        .first()
        .ok_or_else(|| fail("graph declares no inputs".to_string()))?;
    let (declared_dims, input_elem) = declared_tensor(input_decl)?;
    if declared_dims.len() != 4 {
        return Err(fail(format!(
            "input '{}' has rank {}, expected 4",
            input_decl.name,
            declared_dims.len()
        )));
    }
    let defaults = [1, 3, tile_size, tile_size];
    let input_dims: Vec<usize> = declared_dims
        .iter()
        .zip(defaults)
        .map(|(dim, default)| dim.unwrap_or(default))
        .collect();

    let input_dtype = element_dtype(input_elem, &input_decl.name)?;
    let input = Tensor::rand(0f32, 1f32, input_dims.clone(), &Device::Cpu)?
        .to_dtype(input_dtype)?;

    let mut inputs = HashMap::new();
    inputs.insert(input_decl.name.clone(), input);
    let outputs = run_graph(graph, inputs)?;
    let output = outputs
        .first()
        .ok_or_else(|| fail("graph produced no outputs".to_string()))?;

    let output_decl = graph
        .output
        .first()
        .ok_or_else(|| fail("graph declares no outputs".to_string()))?;
    let (declared_out, output_elem) = declared_tensor(output_decl)?;
    let out_channels = declared_out
        .get(1)
        .copied()
        .flatten()
        .unwrap_or(input_dims[1]);
    let expected = vec![
        input_dims[0],
        out_channels,
        input_dims[2] * scale,
        input_dims[3] * scale,
    ];
    if output.dims() != expected.as_slice() {
        return Err(fail(format!(
            "output shape {:?} does not match expected {:?}",
            output.dims(),
            expected
        )));
    }
    let output_dtype = element_dtype(output_elem, &output_decl.name)?;
    if output.dtype() != output_dtype {
        return Err(fail(format!(
            "output dtype {:?} does not match declared {:?}",
            output.dtype(),
            output_dtype
        )));
    }

    info!(
        "verified {}: {} nodes, output {:?}",
        path.display(),
        graph.node.len(),
        expected
    );
    Ok(VerifyReport {
        nodes: graph.node.len(),
        output_dims: expected,
    })
}
