use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use crate::onnx;
use crate::onnx::attribute_proto::AttributeType;
use crate::onnx::AttributeProto;
use crate::tensor::{DType, Shape, Tensor};

/// An operator in the graph under construction. Implementations hold their
/// input tensors by `Arc` and report them here for traversal and naming.
pub trait Node {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor>;

    fn get_output_tensors(&self) -> Vec<&dyn Tensor>;

    fn get_name(&self) -> Option<&str> {
        None
    }

    fn get_onnx_type(&self) -> &str;

    fn get_onnx_attributes(&self) -> Vec<AttributeProto> {
        vec![]
    }

    fn to_node_proto(
        &self,
        name: Option<String>,
        tensor_names: &HashMap<&dyn Tensor, String>,
    ) -> onnx::NodeProto {
        onnx::NodeProto {
            name: name.unwrap_or_default(),
            input: self
                .get_input_tensors()
                .iter()
                .map(|tensor| tensor_names[tensor].clone())
                .collect(),
            output: self
                .get_output_tensors()
                .iter()
                .map(|tensor| tensor_names[tensor].clone())
                .collect(),
            op_type: self.get_onnx_type().to_string(),
            attribute: self.get_onnx_attributes(),
            ..Default::default()
        }
    }
}

impl PartialEq for &dyn Node {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::addr_eq(*self, *other)
    }
}

impl Eq for &dyn Node {}

impl Hash for &dyn Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let a: *const _ = *self;
        let address: *const u8 = a.cast();
        state.write_usize(address.addr());
    }
}

/// Nodes with exactly one output double as tensors, so operator results can
/// feed straight into downstream constructors.
pub trait SingleOutputNode: Node {
    fn get_output_shape(&self) -> &Shape;

    fn get_output_dtype(&self) -> DType;
}

impl<T: SingleOutputNode> Tensor for T {
    fn dtype(&self) -> DType {
        self.get_output_dtype()
    }

    fn shape(&self) -> &Shape {
        self.get_output_shape()
    }

    fn producer(&self) -> Option<&dyn Node> {
        Some(self)
    }
}

pub(crate) fn attr_float(name: &str, f: f32) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        r#type: AttributeType::Float as i32,
        f,
        ..Default::default()
    }
}

pub(crate) fn attr_int(name: &str, i: i64) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        r#type: AttributeType::Int as i32,
        i,
        ..Default::default()
    }
}

pub(crate) fn attr_ints(name: &str, ints: &[i64]) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        r#type: AttributeType::Ints as i32,
        ints: ints.to_vec(),
        ..Default::default()
    }
}

pub(crate) fn attr_string(name: &str, s: &str) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        r#type: AttributeType::String as i32,
        s: s.as_bytes().to_vec(),
        ..Default::default()
    }
}

pub(crate) fn attr_tensor(name: &str, t: onnx::TensorProto) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        r#type: AttributeType::Tensor as i32,
        t: Some(t),
        ..Default::default()
    }
}
