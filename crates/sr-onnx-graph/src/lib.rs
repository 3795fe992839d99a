//! A small ONNX graph builder. Graphs are assembled from `Arc`-linked
//! operator structs and serialized to a `ModelProto` with every weight
//! embedded as an initializer.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub mod node;
pub mod onnx;
pub mod operators;
pub mod tensor;
pub mod weights;

use node::Node;
use tensor::{DType, InputTensor, Tensor};
use weights::EmbeddedOutputManager;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Input shape mismatch: expected {0}, got {1}")]
    ShapeMismatch(String, String),
    #[error("Data type mismatch: expected {0}, got {1}")]
    DTypeMismatch(DType, DType),
    #[error("Unsupported data type {0}")]
    UnsupportedDType(String),
    #[error("Tensor name conflict: {0}")]
    NameConflict(String),
    #[error("No tensor named {0}")]
    NoSuchTensor(String),
    #[error("Cannot resolve symbolic dimension to a concrete value")]
    UnresolvedDimension,
    #[error("Invalid operator input: {0}")]
    InvalidInput(String),
    #[error("Payload of {elements} elements does not match shape {shape}")]
    PayloadShapeMismatch { elements: usize, shape: String },
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

/// Nodes in dependency order, each after everything it consumes. The walk
/// is a depth-first post-order from the outputs, so the result is stable
/// across runs.
fn collect_nodes<'a>(outputs: &[&'a dyn Tensor]) -> Vec<&'a dyn Node> {
    enum Visit<'a> {
        Enter(&'a dyn Node),
        Exit(&'a dyn Node),
    }

    let mut order = vec![];
    let mut visited: HashSet<&dyn Node> = HashSet::new();
    let mut stack: Vec<Visit> = outputs
        .iter()
        .rev()
        .filter_map(|tensor| tensor.producer().map(Visit::Enter))
        .collect();
    while let Some(visit) = stack.pop() {
        match visit {
            Visit::Enter(node) => {
                if !visited.insert(node) {
                    continue;
                }
                stack.push(Visit::Exit(node));
                for input in node.get_input_tensors().into_iter().rev() {
                    if let Some(producer) = input.producer() {
                        stack.push(Visit::Enter(producer));
                    }
                }
            }
            Visit::Exit(node) => order.push(node),
        }
    }
    order
}

/// Serialize the graph reachable from `outputs` into a complete model.
///
/// Tensor names come from the tensors themselves where declared (graph
/// inputs, weights) and are generated otherwise; `outputs` pins the names
/// of the graph outputs. Duplicate declared names are an error.
pub fn build_proto(
    name: &str,
    inputs: &[Arc<InputTensor>],
    outputs: &[(&str, Arc<dyn Tensor>)],
    opset_version: i64,
) -> Result<onnx::ModelProto, Error> {
    let output_refs: Vec<&dyn Tensor> = outputs.iter().map(|(_, t)| t.as_ref()).collect();
    let nodes = collect_nodes(&output_refs);

    let mut tensor_names: HashMap<&dyn Tensor, String> = HashMap::new();
    let mut used_names: HashSet<String> = HashSet::new();

    // Output names take priority over anything declared or generated.
    for ((name, _), tensor) in outputs.iter().zip(output_refs.iter()) {
        if !used_names.insert(name.to_string()) {
            return Err(Error::NameConflict(name.to_string()));
        }
        tensor_names.insert(*tensor, name.to_string());
    }
    for input in inputs {
        let tensor: &dyn Tensor = input.as_ref();
        if tensor_names.contains_key(&tensor) {
            continue;
        }
        let name = input
            .get_name()
            .unwrap_or_default()
            .to_string();
        if !used_names.insert(name.clone()) {
            return Err(Error::NameConflict(name));
        }
        tensor_names.insert(tensor, name);
    }

    let mut weight_tensors: Vec<&dyn Tensor> = vec![];
    let mut next_id = 0usize;
    for node in &nodes {
        let mut node_tensors = node.get_input_tensors();
        node_tensors.extend(node.get_output_tensors());
        for tensor in node_tensors {
            if tensor_names.contains_key(&tensor) {
                continue;
            }
            let name = match tensor.get_name() {
                Some(declared) => {
                    if !used_names.insert(declared.to_string()) {
                        return Err(Error::NameConflict(declared.to_string()));
                    }
                    declared.to_string()
                }
                None => loop {
                    let candidate = format!("tensor_{next_id}");
                    next_id += 1;
                    if used_names.insert(candidate.clone()) {
                        break candidate;
                    }
                },
            };
            tensor_names.insert(tensor, name);
            if tensor.producer().is_none() && !tensor.is_graph_input() {
                weight_tensors.push(tensor);
            }
        }
    }

    let mut weight_output = EmbeddedOutputManager::new();
    let mut initializers = vec![];
    for tensor in weight_tensors {
        tensor.gather_weights(&mut weight_output)?;
        if let Some(proto) =
            tensor.get_initializer(tensor_names[&tensor].clone(), &mut weight_output)?
        {
            initializers.push(proto);
        }
    }

    let graph = onnx::GraphProto {
        name: name.to_string(),
        node: nodes
            .iter()
            .map(|node| {
                node.to_node_proto(node.get_name().map(|n| n.to_string()), &tensor_names)
            })
            .collect(),
        initializer: initializers,
        input: inputs
            .iter()
            .map(|input| {
                let tensor: &dyn Tensor = input.as_ref();
                input.to_value_info_proto(tensor_names[&tensor].clone())
            })
            .collect(),
        output: outputs
            .iter()
            .map(|(name, tensor)| tensor.to_value_info_proto(name.to_string()))
            .collect(),
        ..Default::default()
    };

    Ok(onnx::ModelProto {
        ir_version: onnx::Version::IrVersion as i64,
        opset_import: vec![onnx::OperatorSetIdProto {
            domain: String::new(),
            version: opset_version,
        }],
        producer_name: "realesrgan-export".to_string(),
        producer_version: env!("CARGO_PKG_VERSION").to_string(),
        graph: Some(graph),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::{Add, Conv, LeakyRelu};
    use crate::tensor::{Shape, TensorData};
    use crate::weights::{StaticWeightManager, WeightManager};
    use std::collections::HashMap;

    fn weight_manager() -> StaticWeightManager {
        let mut tensors = HashMap::new();
        tensors.insert(
            "conv.weight".to_string(),
            TensorData::fill(Shape::fixed(&[4, 3, 3, 3]), 0.1f32).unwrap(),
        );
        tensors.insert(
            "conv.bias".to_string(),
            TensorData::fill(Shape::fixed(&[4]), 0.0f32).unwrap(),
        );
        StaticWeightManager::new(tensors)
    }

    #[test]
    fn builds_model_with_embedded_weights() {
        let weights = weight_manager().prefix("conv");
        let input = InputTensor::new("input", DType::F32, Shape::fixed(&[1, 3, 8, 8]));
        let conv = Conv::new(
            Some("conv".to_string()),
            input.clone(),
            weights.get_tensor("weight").unwrap(),
            Some(weights.get_tensor("bias").unwrap()),
        )
        .unwrap();
        let activated: Arc<dyn Tensor> = LeakyRelu::new(None, conv, 0.2);

        let model =
            build_proto("test", &[input], &[("output", activated)], 14).unwrap();
        assert_eq!(model.ir_version, onnx::Version::IrVersion as i64);
        assert_eq!(model.opset_import[0].version, 14);

        let graph = model.graph.unwrap();
        assert_eq!(graph.node.len(), 2);
        assert_eq!(graph.node[0].op_type, "Conv");
        assert_eq!(graph.node[1].op_type, "LeakyRelu");
        assert_eq!(graph.node[1].output, vec!["output".to_string()]);
        assert_eq!(graph.input[0].name, "input");
        assert_eq!(graph.output[0].name, "output");

        let names: Vec<&str> = graph.initializer.iter().map(|i| i.name.as_str()).collect();
        assert!(names.contains(&"conv.weight"));
        assert!(names.contains(&"conv.bias"));
        // Conv inputs reference the initializers by name.
        assert_eq!(graph.node[0].input[1], "conv.weight");
    }

    #[test]
    fn node_order_places_producers_first() {
        let input = InputTensor::new("input", DType::F32, Shape::fixed(&[1, 2, 4, 4]));
        let a = LeakyRelu::new(None, input.clone(), 0.2);
        let b = LeakyRelu::new(None, a.clone(), 0.2);
        let sum: Arc<dyn Tensor> = Add::new(None, a, b).unwrap();

        let model = build_proto("order", &[input], &[("output", sum)], 14).unwrap();
        let graph = model.graph.unwrap();
        let ops: Vec<&str> = graph.node.iter().map(|n| n.op_type.as_str()).collect();
        assert_eq!(ops, vec!["LeakyRelu", "LeakyRelu", "Add"]);
        // Every node input is produced by an earlier node, an initializer,
        // or the graph input.
        let mut known: HashSet<String> = graph.input.iter().map(|i| i.name.clone()).collect();
        for node in &graph.node {
            for input in &node.input {
                assert!(known.contains(input), "dangling input {input}");
            }
            known.extend(node.output.iter().cloned());
        }
    }

    #[test]
    fn duplicate_output_name_is_rejected() {
        let input = InputTensor::new("x", DType::F32, Shape::fixed(&[1, 2, 4, 4]));
        let a: Arc<dyn Tensor> = LeakyRelu::new(None, input.clone(), 0.2);
        let b: Arc<dyn Tensor> = LeakyRelu::new(None, input.clone(), 0.2);
        let result = build_proto("dup", &[input], &[("y", a), ("y", b)], 14);
        assert!(matches!(result, Err(Error::NameConflict(_))));
    }
}
