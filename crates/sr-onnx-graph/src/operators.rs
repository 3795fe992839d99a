use std::collections::HashMap;
use std::sync::Arc;

use crate::node::{attr_float, attr_int, attr_ints, attr_string, attr_tensor, Node, SingleOutputNode};
use crate::onnx;
use crate::tensor::{DType, Dimension, Shape, Tensor, TensorData};
use crate::Error;

fn validate_elementwise_inputs(inputs: &[&dyn Tensor]) -> Result<(), Error> {
    for input in inputs {
        if input.dtype() != inputs[0].dtype() {
            return Err(Error::DTypeMismatch(inputs[0].dtype(), input.dtype()));
        }
        if input.shape() != inputs[0].shape() {
            return Err(Error::ShapeMismatch(
                inputs[0].shape().to_string(),
                input.shape().to_string(),
            ));
        }
    }
    Ok(())
}

/// 2D convolution with stride 1 and "same" padding derived from the kernel
/// extent, the only form the RRDBNet architecture uses. Spatial dimensions
/// pass through unchanged, so symbolic axes survive the node.
pub struct Conv {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    weight: Arc<dyn Tensor>,
    bias: Option<Arc<dyn Tensor>>,
    kernel_shape: [i64; 2],
    pads: [i64; 4],
    output_shape: Shape,
}

impl Conv {
    pub fn new(
        name: Option<String>,
        input: Arc<dyn Tensor>,
        weight: Arc<dyn Tensor>,
        bias: Option<Arc<dyn Tensor>>,
    ) -> Result<Arc<Self>, Error> {
        if input.dtype() != weight.dtype() {
            return Err(Error::DTypeMismatch(input.dtype(), weight.dtype()));
        }
        if input.rank() != 4 || weight.rank() != 4 {
            return Err(Error::InvalidInput(format!(
                "Conv expects NCHW input and OIHW weight, got ranks {} and {}",
                input.rank(),
                weight.rank()
            )));
        }
        let weight_dims = weight.shape().resolve()?;
        let in_channels = input.shape()[1].resolve()?;
        if weight_dims[1] != in_channels {
            return Err(Error::ShapeMismatch(
                format!("weight input channels {}", weight_dims[1]),
                format!("input channels {}", in_channels),
            ));
        }
        if weight_dims[2] % 2 == 0 || weight_dims[3] % 2 == 0 {
            return Err(Error::InvalidInput(format!(
                "Conv same-padding requires odd kernel extents, got {}x{}",
                weight_dims[2], weight_dims[3]
            )));
        }
        if let Some(bias) = &bias {
            if bias.rank() != 1 || bias.shape()[0].resolve()? != weight_dims[0] {
                return Err(Error::ShapeMismatch(
                    format!("bias of {} elements", weight_dims[0]),
                    bias.shape().to_string(),
                ));
            }
        }
        let pad_h = (weight_dims[2] / 2) as i64;
        let pad_w = (weight_dims[3] / 2) as i64;
        let output_shape = Shape::new(vec![
            input.shape()[0].clone(),
            Dimension::fixed(weight_dims[0]),
            input.shape()[2].clone(),
            input.shape()[3].clone(),
        ]);
        Ok(Arc::new(Self {
            name,
            kernel_shape: [weight_dims[2] as i64, weight_dims[3] as i64],
            pads: [pad_h, pad_w, pad_h, pad_w],
            output_shape,
            input,
            weight,
            bias,
        }))
    }
}

impl Node for Conv {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        let mut inputs = vec![self.input.as_ref(), self.weight.as_ref()];
        if let Some(bias) = &self.bias {
            inputs.push(bias.as_ref());
        }
        inputs
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Conv"
    }

    fn get_onnx_attributes(&self) -> Vec<onnx::AttributeProto> {
        vec![
            attr_ints("dilations", &[1, 1]),
            attr_int("group", 1),
            attr_ints("kernel_shape", &self.kernel_shape),
            attr_ints("pads", &self.pads),
            attr_ints("strides", &[1, 1]),
        ]
    }
}

impl SingleOutputNode for Conv {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct LeakyRelu {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    alpha: f32,
}

impl LeakyRelu {
    pub fn new(name: Option<String>, input: Arc<dyn Tensor>, alpha: f32) -> Arc<Self> {
        Arc::new(Self { name, input, alpha })
    }
}

impl Node for LeakyRelu {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "LeakyRelu"
    }

    fn get_onnx_attributes(&self) -> Vec<onnx::AttributeProto> {
        vec![attr_float("alpha", self.alpha)]
    }
}

impl SingleOutputNode for LeakyRelu {
    fn get_output_shape(&self) -> &Shape {
        self.input.shape()
    }

    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

/// Nearest-neighbor spatial upsampling by an integer factor. The per-axis
/// scales ride along as a float Constant operand, the way torch exports
/// `interpolate(scale_factor=...)`.
pub struct Resize {
    name: Option<String>,
    input: Arc<dyn Tensor>,
    scales: Arc<Constant>,
    output_shape: Shape,
}

impl Resize {
    pub fn nearest(
        name: Option<String>,
        input: Arc<dyn Tensor>,
        factor: usize,
    ) -> Result<Arc<Self>, Error> {
        if input.rank() != 4 {
            return Err(Error::InvalidInput(format!(
                "Resize expects an NCHW input, got rank {}",
                input.rank()
            )));
        }
        let scales = Constant::new(
            name.as_ref().map(|n| format!("{n}.scales")),
            TensorData::new(
                vec![1.0f32, 1.0, factor as f32, factor as f32].into(),
                Shape::fixed(&[4]),
            )?,
        )?;
        let scale_dim = |dim: &Arc<Dimension>| Dimension::new(dim.value.map(|v| v * factor), None);
        let output_shape = Shape::new(vec![
            input.shape()[0].clone(),
            input.shape()[1].clone(),
            scale_dim(&input.shape()[2]),
            scale_dim(&input.shape()[3]),
        ]);
        Ok(Arc::new(Self {
            name,
            input,
            scales,
            output_shape,
        }))
    }
}

impl Node for Resize {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.input.as_ref(), self.scales.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Resize"
    }

    fn get_onnx_attributes(&self) -> Vec<onnx::AttributeProto> {
        vec![
            attr_string("coordinate_transformation_mode", "asymmetric"),
            attr_string("mode", "nearest"),
            attr_string("nearest_mode", "floor"),
        ]
    }

    // The optional roi operand is skipped with an empty-name placeholder, so
    // the node proto is built by hand instead of from get_input_tensors.
    fn to_node_proto(
        &self,
        name: Option<String>,
        tensor_names: &HashMap<&dyn Tensor, String>,
    ) -> onnx::NodeProto {
        onnx::NodeProto {
            name: name.unwrap_or_default(),
            input: vec![
                tensor_names[&self.input.as_ref()].clone(),
                String::new(),
                tensor_names[&(self.scales.as_ref() as &dyn Tensor)].clone(),
            ],
            output: vec![tensor_names[&(self as &dyn Tensor)].clone()],
            op_type: self.get_onnx_type().to_string(),
            attribute: self.get_onnx_attributes(),
            ..Default::default()
        }
    }
}

impl SingleOutputNode for Resize {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        self.input.dtype()
    }
}

pub struct Add {
    name: Option<String>,
    a: Arc<dyn Tensor>,
    b: Arc<dyn Tensor>,
}

impl Add {
    pub fn new(
        name: Option<String>,
        a: Arc<dyn Tensor>,
        b: Arc<dyn Tensor>,
    ) -> Result<Arc<Self>, Error> {
        validate_elementwise_inputs(&[a.as_ref(), b.as_ref()])?;
        Ok(Arc::new(Self { name, a, b }))
    }
}

impl Node for Add {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.a.as_ref(), self.b.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Add"
    }
}

impl SingleOutputNode for Add {
    fn get_output_shape(&self) -> &Shape {
        self.a.shape()
    }

    fn get_output_dtype(&self) -> DType {
        self.a.dtype()
    }
}

/// Elementwise multiply. The right operand may be a single-element tensor,
/// which broadcasts; RRDBNet uses this for its 0.2 residual scaling.
pub struct Mul {
    name: Option<String>,
    a: Arc<dyn Tensor>,
    b: Arc<dyn Tensor>,
}

impl Mul {
    pub fn new(
        name: Option<String>,
        a: Arc<dyn Tensor>,
        b: Arc<dyn Tensor>,
    ) -> Result<Arc<Self>, Error> {
        let scalar_rhs = b.shape().num_elements().map(|n| n == 1).unwrap_or(false);
        if scalar_rhs {
            if a.dtype() != b.dtype() {
                return Err(Error::DTypeMismatch(a.dtype(), b.dtype()));
            }
        } else {
            validate_elementwise_inputs(&[a.as_ref(), b.as_ref()])?;
        }
        Ok(Arc::new(Self { name, a, b }))
    }
}

impl Node for Mul {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self.a.as_ref(), self.b.as_ref()]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Mul"
    }
}

impl SingleOutputNode for Mul {
    fn get_output_shape(&self) -> &Shape {
        self.a.shape()
    }

    fn get_output_dtype(&self) -> DType {
        self.a.dtype()
    }
}

pub struct Concat {
    name: Option<String>,
    inputs: Vec<Arc<dyn Tensor>>,
    axis: i64,
    output_shape: Shape,
}

impl Concat {
    pub fn new(
        name: Option<String>,
        inputs: Vec<Arc<dyn Tensor>>,
        axis: i64,
    ) -> Result<Arc<Self>, Error> {
        let first = inputs
            .first()
            .ok_or_else(|| Error::InvalidInput("Concat requires at least one input".to_string()))?
            .clone();
        let rank = first.rank();
        let u_axis = if axis < 0 {
            (rank as i64 + axis) as usize
        } else {
            axis as usize
        };
        if u_axis >= rank {
            return Err(Error::InvalidInput(format!(
                "Concat axis {axis} out of range for rank {rank}"
            )));
        }
        for input in &inputs {
            if input.dtype() != first.dtype() {
                return Err(Error::DTypeMismatch(first.dtype(), input.dtype()));
            }
            if input.rank() != rank {
                return Err(Error::ShapeMismatch(
                    first.shape().to_string(),
                    input.shape().to_string(),
                ));
            }
        }
        let mut output_dims = vec![];
        for i in 0..rank {
            if i == u_axis {
                let mut total = 0;
                for input in &inputs {
                    total += input.shape()[i].resolve()?;
                }
                output_dims.push(Dimension::fixed(total));
            } else {
                for input in &inputs {
                    if input.shape()[i].as_ref() != first.shape()[i].as_ref() {
                        return Err(Error::ShapeMismatch(
                            first.shape().to_string(),
                            input.shape().to_string(),
                        ));
                    }
                }
                output_dims.push(first.shape()[i].clone());
            }
        }
        Ok(Arc::new(Self {
            name,
            inputs,
            axis,
            output_shape: Shape::new(output_dims),
        }))
    }
}

impl Node for Concat {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        self.inputs.iter().map(|x| x.as_ref()).collect()
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Concat"
    }

    fn get_onnx_attributes(&self) -> Vec<onnx::AttributeProto> {
        vec![attr_int("axis", self.axis)]
    }
}

impl SingleOutputNode for Concat {
    fn get_output_shape(&self) -> &Shape {
        &self.output_shape
    }

    fn get_output_dtype(&self) -> DType {
        self.inputs[0].dtype()
    }
}

/// A constant-folded operand carried in the node's `value` tensor attribute
/// rather than as a named initializer.
pub struct Constant {
    name: Option<String>,
    data: TensorData,
    proto: onnx::TensorProto,
}

impl Constant {
    pub fn new(name: Option<String>, data: TensorData) -> Result<Arc<Self>, Error> {
        let proto = data.to_tensor_proto(None)?;
        Ok(Arc::new(Self { name, data, proto }))
    }
}

impl Node for Constant {
    fn get_input_tensors(&self) -> Vec<&dyn Tensor> {
        vec![]
    }

    fn get_output_tensors(&self) -> Vec<&dyn Tensor> {
        vec![self]
    }

    fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn get_onnx_type(&self) -> &str {
        "Constant"
    }

    fn get_onnx_attributes(&self) -> Vec<onnx::AttributeProto> {
        vec![attr_tensor("value", self.proto.clone())]
    }
}

impl SingleOutputNode for Constant {
    fn get_output_shape(&self) -> &Shape {
        self.data.shape()
    }

    fn get_output_dtype(&self) -> DType {
        self.data.dtype()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::InputTensor;

    fn weight(name: &str, dims: &[usize]) -> Arc<dyn Tensor> {
        InputTensor::new(name, DType::F32, Shape::fixed(dims))
    }

    #[test]
    fn conv_preserves_spatial_dims_and_sets_channels() {
        let input = InputTensor::new("x", DType::F32, Shape::fixed(&[1, 3, 16, 16]));
        let conv = Conv::new(
            None,
            input,
            weight("w", &[8, 3, 3, 3]),
            Some(weight("b", &[8])),
        )
        .unwrap();
        assert_eq!(conv.shape().resolve().unwrap(), vec![1, 8, 16, 16]);
    }

    #[test]
    fn conv_carries_symbolic_spatial_dims() {
        let input = InputTensor::new(
            "x",
            DType::F32,
            Shape::new(vec![
                Dimension::fixed(1),
                Dimension::fixed(3),
                Dimension::new(None, Some("height".to_string())),
                Dimension::new(None, Some("width".to_string())),
            ]),
        );
        let conv = Conv::new(None, input, weight("w", &[8, 3, 3, 3]), None).unwrap();
        assert_eq!(conv.shape()[2].name.as_deref(), Some("height"));
        assert!(conv.shape()[2].value.is_none());
    }

    #[test]
    fn conv_rejects_channel_mismatch() {
        let input = InputTensor::new("x", DType::F32, Shape::fixed(&[1, 4, 16, 16]));
        let result = Conv::new(None, input, weight("w", &[8, 3, 3, 3]), None);
        assert!(matches!(result, Err(Error::ShapeMismatch(..))));
    }

    #[test]
    fn resize_doubles_spatial_dims() {
        let input = InputTensor::new("x", DType::F32, Shape::fixed(&[1, 8, 16, 16]));
        let resize = Resize::nearest(None, input, 2).unwrap();
        assert_eq!(resize.shape().resolve().unwrap(), vec![1, 8, 32, 32]);
    }

    #[test]
    fn concat_sums_channel_dim() {
        let a = InputTensor::new("a", DType::F32, Shape::fixed(&[1, 8, 16, 16]));
        let b = InputTensor::new("b", DType::F32, Shape::fixed(&[1, 4, 16, 16]));
        let concat = Concat::new(None, vec![a, b], 1).unwrap();
        assert_eq!(concat.shape().resolve().unwrap(), vec![1, 12, 16, 16]);
    }

    #[test]
    fn mul_accepts_scalar_rhs() {
        let a = InputTensor::new("a", DType::F32, Shape::fixed(&[1, 8, 16, 16]));
        let scale = Constant::new(None, TensorData::scalar_f32(0.2)).unwrap();
        let mul = Mul::new(None, a, scale).unwrap();
        assert_eq!(mul.shape().resolve().unwrap(), vec![1, 8, 16, 16]);
    }

    #[test]
    fn add_rejects_shape_mismatch() {
        let a = InputTensor::new("a", DType::F32, Shape::fixed(&[1, 8, 16, 16]));
        let b = InputTensor::new("b", DType::F32, Shape::fixed(&[1, 4, 16, 16]));
        assert!(matches!(Add::new(None, a, b), Err(Error::ShapeMismatch(..))));
    }
}
