use std::collections::HashMap;
use std::sync::Arc;

use crate::onnx::TensorProto;
use crate::tensor::{DType, Shape, Tensor, TensorData};
use crate::Error;

/// Sink for weight payloads while a graph is being serialized. Tensors
/// deposit their data in `gather_weights` and collect it back as an
/// initializer in `get_initializer`, so payload loading stays decoupled
/// from proto assembly.
pub trait WeightOutputManager<'a> {
    fn write_tensor_data(&mut self, tensor: &'a dyn Tensor, data: TensorData);

    fn take_tensor_data(&mut self, tensor: &'a dyn Tensor) -> Option<TensorData>;
}

/// Embeds every weight directly in the model as an initializer payload.
#[derive(Default)]
pub struct EmbeddedOutputManager<'a> {
    data: HashMap<&'a dyn Tensor, TensorData>,
}

impl<'a> EmbeddedOutputManager<'a> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<'a> WeightOutputManager<'a> for EmbeddedOutputManager<'a> {
    fn write_tensor_data(&mut self, tensor: &'a dyn Tensor, data: TensorData) {
        self.data.insert(tensor, data);
    }

    fn take_tensor_data(&mut self, tensor: &'a dyn Tensor) -> Option<TensorData> {
        self.data.remove(&tensor)
    }
}

/// Read access to a named weight collection. Managers are cheap to clone
/// into a sub-scope with `prefix`, which mirrors how checkpoint keys nest
/// (`body.0.rdb1.conv1.weight` and so on).
pub trait WeightManager {
    fn prefix(&self, prefix: &str) -> Self
    where
        Self: Sized;

    fn get_prefix(&self) -> Option<&str>;

    /// All tensor names in the collection, unscoped.
    fn tensor_names(&self) -> Vec<String>;

    fn get_tensor(&self, name: &str) -> Result<Arc<dyn Tensor>, Error>;
}

fn scoped_name(prefix: Option<&str>, name: &str) -> String {
    match prefix {
        Some(prefix) => format!("{prefix}.{name}"),
        None => name.to_string(),
    }
}

/// Weights backed by a torch pickle checkpoint. Tensor payloads stay on
/// disk until serialization asks for them.
pub struct PthWeightManager {
    tensors: Arc<candle_core::pickle::PthTensors>,
    prefix: Option<String>,
}

impl PthWeightManager {
    pub fn new(tensors: candle_core::pickle::PthTensors) -> Self {
        Self {
            tensors: Arc::new(tensors),
            prefix: None,
        }
    }
}

impl WeightManager for PthWeightManager {
    fn prefix(&self, prefix: &str) -> Self {
        Self {
            tensors: self.tensors.clone(),
            prefix: Some(scoped_name(self.prefix.as_deref(), prefix)),
        }
    }

    fn get_prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    fn tensor_names(&self) -> Vec<String> {
        self.tensors.tensor_infos().keys().cloned().collect()
    }

    fn get_tensor(&self, name: &str) -> Result<Arc<dyn Tensor>, Error> {
        let full_name = scoped_name(self.prefix.as_deref(), name);
        let info = self
            .tensors
            .tensor_infos()
            .get(&full_name)
            .ok_or_else(|| Error::NoSuchTensor(full_name.clone()))?;
        Ok(Arc::new(PthTensor {
            dtype: DType::from_candle(info.dtype)?,
            shape: Shape::from(info.layout.shape()),
            tensors: self.tensors.clone(),
            name: full_name,
        }))
    }
}

pub struct PthTensor {
    tensors: Arc<candle_core::pickle::PthTensors>,
    name: String,
    dtype: DType,
    shape: Shape,
}

impl Tensor for PthTensor {
    fn dtype(&self) -> DType {
        self.dtype
    }

    fn shape(&self) -> &Shape {
        &self.shape
    }

    fn get_name(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn gather_weights<'a>(
        &'a self,
        manager: &mut dyn WeightOutputManager<'a>,
    ) -> Result<(), Error> {
        let tensor = self
            .tensors
            .get(&self.name)?
            .ok_or_else(|| Error::NoSuchTensor(self.name.clone()))?;
        manager.write_tensor_data(self, TensorData::from_candle_tensor(&tensor)?);
        Ok(())
    }

    fn get_initializer<'a>(
        &'a self,
        name: String,
        manager: &mut dyn WeightOutputManager<'a>,
    ) -> Result<Option<TensorProto>, Error> {
        let data = manager
            .take_tensor_data(self)
            .ok_or_else(|| Error::NoSuchTensor(self.name.clone()))?;
        Ok(Some(data.to_tensor_proto(Some(name))?))
    }
}

/// Weights held in memory, keyed by name. Used where no checkpoint file is
/// in play, such as graph construction in tests.
#[derive(Clone)]
pub struct StaticWeightManager {
    tensors: Arc<HashMap<String, TensorData>>,
    prefix: Option<String>,
}

impl StaticWeightManager {
    pub fn new(tensors: HashMap<String, TensorData>) -> Self {
        Self {
            tensors: Arc::new(tensors),
            prefix: None,
        }
    }
}

impl WeightManager for StaticWeightManager {
    fn prefix(&self, prefix: &str) -> Self {
        Self {
            tensors: self.tensors.clone(),
            prefix: Some(scoped_name(self.prefix.as_deref(), prefix)),
        }
    }

    fn get_prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    fn tensor_names(&self) -> Vec<String> {
        self.tensors.keys().cloned().collect()
    }

    fn get_tensor(&self, name: &str) -> Result<Arc<dyn Tensor>, Error> {
        let full_name = scoped_name(self.prefix.as_deref(), name);
        let data = self
            .tensors
            .get(&full_name)
            .ok_or_else(|| Error::NoSuchTensor(full_name.clone()))?
            .clone();
        Ok(Arc::new(StaticTensor {
            name: full_name,
            data,
        }))
    }
}

pub struct StaticTensor {
    name: String,
    data: TensorData,
}

impl Tensor for StaticTensor {
    fn dtype(&self) -> DType {
        self.data.dtype()
    }

    fn shape(&self) -> &Shape {
        self.data.shape()
    }

    fn get_name(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn get_initializer<'a>(
        &'a self,
        name: String,
        _manager: &mut dyn WeightOutputManager<'a>,
    ) -> Result<Option<TensorProto>, Error> {
        Ok(Some(self.data.to_tensor_proto(Some(name))?))
    }
}
