use core::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::node::Node;
use crate::onnx;
use crate::onnx::{TensorProto, ValueInfoProto};
use crate::weights::WeightOutputManager;
use crate::Error;

/// One axis of a tensor shape: either a concrete extent, a named symbolic
/// dimension, or fully unknown (both `None`).
#[derive(Clone, Debug)]
pub struct Dimension {
    pub value: Option<usize>,
    pub name: Option<String>,
}

impl Dimension {
    pub fn new(value: Option<usize>, name: Option<String>) -> Arc<Self> {
        Arc::new(Dimension { value, name })
    }

    pub fn fixed(value: usize) -> Arc<Self> {
        Arc::new(Dimension {
            value: Some(value),
            name: None,
        })
    }

    pub fn resolve(&self) -> Result<usize, Error> {
        self.value.ok_or(Error::UnresolvedDimension)
    }
}

impl From<&Dimension> for onnx::tensor_shape_proto::Dimension {
    fn from(value: &Dimension) -> Self {
        Self {
            value: match value.value {
                Some(value) => Some(onnx::tensor_shape_proto::dimension::Value::DimValue(
                    value as i64,
                )),
                None => value
                    .name
                    .clone()
                    .map(onnx::tensor_shape_proto::dimension::Value::DimParam),
            },
            denotation: String::new(),
        }
    }
}

impl PartialEq for &Dimension {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(*self, *other)
            || if let (Some(a), Some(b)) = (self.value, other.value) {
                a == b
            } else {
                false
            }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(value) = self.value {
            write!(f, "{}", value)
        } else if let Some(name) = &self.name {
            write!(f, "{}", name)
        } else {
            write!(f, "?")
        }
    }
}

/// An ordered list of dimensions. Dimensions are shared via `Arc` so that
/// shape-preserving operators can carry symbolic axes through the graph
/// without resolving them.
#[derive(Clone, Debug)]
pub struct Shape {
    pub dims: Vec<Arc<Dimension>>,
}

impl Shape {
    pub fn new(dims: Vec<Arc<Dimension>>) -> Self {
        Self { dims }
    }

    pub fn fixed(dims: &[usize]) -> Self {
        Self {
            dims: dims.iter().map(|d| Dimension::fixed(*d)).collect(),
        }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn resolve(&self) -> Result<Vec<usize>, Error> {
        self.dims.iter().map(|dim| dim.resolve()).collect()
    }

    pub fn num_elements(&self) -> Result<usize, Error> {
        let mut count = 1;
        for dim in &self.dims {
            count *= dim.resolve()?;
        }
        Ok(count)
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            self.dims
                .iter()
                .map(|x| x.to_string())
                .collect::<Vec<_>>()
                .join("x")
        )
    }
}

impl PartialEq for Shape {
    fn eq(&self, other: &Self) -> bool {
        self.dims.len() == other.dims.len()
            && self
                .dims
                .iter()
                .zip(other.dims.iter())
                .all(|(a, b)| a.as_ref() == b.as_ref())
    }
}

impl core::ops::Index<usize> for Shape {
    type Output = Arc<Dimension>;

    fn index(&self, index: usize) -> &Self::Output {
        &self.dims[index]
    }
}

impl From<&candle_core::Shape> for Shape {
    fn from(value: &candle_core::Shape) -> Self {
        Shape::fixed(value.dims())
    }
}

/// Element types this builder can emit. Everything else in the ONNX type
/// enumeration is out of vocabulary for the graphs we construct.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DType {
    F32,
    F16,
    I64,
}

impl DType {
    pub fn from_candle(dtype: candle_core::DType) -> Result<Self, Error> {
        match dtype {
            candle_core::DType::F32 => Ok(DType::F32),
            candle_core::DType::F16 => Ok(DType::F16),
            candle_core::DType::I64 => Ok(DType::I64),
            other => Err(Error::UnsupportedDType(format!("{other:?}"))),
        }
    }

    pub fn size_of(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 => 2,
            DType::I64 => 8,
        }
    }
}

impl From<DType> for onnx::tensor_proto::DataType {
    fn from(value: DType) -> Self {
        match value {
            DType::F32 => onnx::tensor_proto::DataType::Float,
            DType::F16 => onnx::tensor_proto::DataType::Float16,
            DType::I64 => onnx::tensor_proto::DataType::Int64,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A value flowing through the graph under construction: a graph input, a
/// named weight, or the output of an operator node.
pub trait Tensor {
    fn dtype(&self) -> DType;

    fn shape(&self) -> &Shape;

    fn rank(&self) -> usize {
        self.shape().rank()
    }

    fn get_name(&self) -> Option<&str> {
        None
    }

    /// The node that computes this tensor, if any. Weights and graph inputs
    /// have no producer.
    fn producer(&self) -> Option<&dyn Node> {
        None
    }

    fn is_graph_input(&self) -> bool {
        false
    }

    fn gather_weights<'a>(
        &'a self,
        _manager: &mut dyn WeightOutputManager<'a>,
    ) -> Result<(), Error> {
        Ok(())
    }

    fn get_initializer<'a>(
        &'a self,
        _name: String,
        _manager: &mut dyn WeightOutputManager<'a>,
    ) -> Result<Option<TensorProto>, Error> {
        Ok(None)
    }

    fn to_value_info_proto(&self, name: String) -> ValueInfoProto {
        ValueInfoProto {
            name,
            r#type: Some(onnx::TypeProto {
                value: Some(onnx::type_proto::Value::TensorType(
                    onnx::type_proto::Tensor {
                        elem_type: onnx::tensor_proto::DataType::from(self.dtype()) as i32,
                        shape: Some(onnx::TensorShapeProto {
                            dim: self.shape().dims.iter().map(|d| d.as_ref().into()).collect(),
                        }),
                    },
                )),
                denotation: String::new(),
            }),
            ..Default::default()
        }
    }
}

impl PartialEq for &dyn Tensor {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::addr_eq(*self, *other)
    }
}

impl Eq for &dyn Tensor {}

impl Hash for &dyn Tensor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let a: *const _ = *self;
        let address: *const u8 = a.cast();
        state.write_usize(address.addr());
    }
}

/// A declared graph input.
pub struct InputTensor {
    name: String,
    data_type: DType,
    shape: Shape,
}

impl InputTensor {
    pub fn new(name: impl Into<String>, data_type: DType, shape: Shape) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            data_type,
            shape,
        })
    }
}

impl Tensor for InputTensor {
    fn dtype(&self) -> DType {
        self.data_type
    }

    fn shape(&self) -> &Shape {
        &self.shape
    }

    fn get_name(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn is_graph_input(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone)]
pub enum TensorDataValue {
    F32(Vec<f32>),
    F16(Vec<half::f16>),
    I64(Vec<i64>),
}

impl TensorDataValue {
    pub fn len(&self) -> usize {
        match self {
            TensorDataValue::F32(v) => v.len(),
            TensorDataValue::F16(v) => v.len(),
            TensorDataValue::I64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DType {
        match self {
            TensorDataValue::F32(_) => DType::F32,
            TensorDataValue::F16(_) => DType::F16,
            TensorDataValue::I64(_) => DType::I64,
        }
    }

    pub fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            TensorDataValue::F32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorDataValue::F16(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            TensorDataValue::I64(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
        }
    }
}

impl From<Vec<f32>> for TensorDataValue {
    fn from(value: Vec<f32>) -> Self {
        TensorDataValue::F32(value)
    }
}

impl From<Vec<half::f16>> for TensorDataValue {
    fn from(value: Vec<half::f16>) -> Self {
        TensorDataValue::F16(value)
    }
}

impl From<Vec<i64>> for TensorDataValue {
    fn from(value: Vec<i64>) -> Self {
        TensorDataValue::I64(value)
    }
}

/// An owned, fully materialized tensor payload plus its shape. Used for
/// embedded constants and for weight data on its way into an initializer.
#[derive(Debug, Clone)]
pub struct TensorData {
    value: TensorDataValue,
    shape: Shape,
}

impl TensorData {
    pub fn new(value: TensorDataValue, shape: Shape) -> Result<Self, Error> {
        if shape.num_elements()? != value.len() {
            return Err(Error::PayloadShapeMismatch {
                elements: value.len(),
                shape: shape.to_string(),
            });
        }
        Ok(Self { value, shape })
    }

    pub fn fill<T>(shape: Shape, value: T) -> Result<Self, Error>
    where
        T: Copy,
        TensorDataValue: From<Vec<T>>,
    {
        let num_elements = shape.num_elements()?;
        Self::new(TensorDataValue::from(vec![value; num_elements]), shape)
    }

    pub fn scalar_f32(value: f32) -> Self {
        Self {
            value: TensorDataValue::F32(vec![value]),
            shape: Shape::fixed(&[1]),
        }
    }

    pub fn dtype(&self) -> DType {
        self.value.dtype()
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn value(&self) -> &TensorDataValue {
        &self.value
    }

    pub fn to_tensor_proto(&self, name: Option<String>) -> Result<TensorProto, Error> {
        Ok(TensorProto {
            name: name.unwrap_or_default(),
            data_type: onnx::tensor_proto::DataType::from(self.value.dtype()) as i32,
            dims: self.shape.resolve()?.iter().map(|x| *x as i64).collect(),
            raw_data: self.value.to_le_bytes(),
            ..Default::default()
        })
    }

    pub fn from_candle_tensor(tensor: &candle_core::Tensor) -> Result<Self, Error> {
        let shape = Shape::from(tensor.shape());
        let flat = tensor.flatten_all()?;
        let value = match tensor.dtype() {
            candle_core::DType::F32 => TensorDataValue::F32(flat.to_vec1()?),
            candle_core::DType::F16 => TensorDataValue::F16(flat.to_vec1()?),
            candle_core::DType::I64 => TensorDataValue::I64(flat.to_vec1()?),
            other => return Err(Error::UnsupportedDType(format!("{other:?}"))),
        };
        Ok(Self { value, shape })
    }
}
