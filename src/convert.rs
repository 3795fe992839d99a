use std::fs;
use std::path::Path;

use log::info;
use prost::Message;
use sr_onnx_graph::onnx::{self, ModelProto};
use sr_onnx_graph::weights::WeightManager;

use crate::fp16::{convert_model_to_fp16, Fp16Report};
use crate::rrdbnet::{build_rrdbnet, RrdbNetConfig};
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Fp32,
    Fp16,
}

#[derive(Debug, Clone, Copy)]
pub struct ExportConfig {
    pub tile_size: usize,
    pub dynamic_shape: bool,
    pub precision: Precision,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            tile_size: 256,
            dynamic_shape: false,
            precision: Precision::Fp32,
        }
    }
}

#[derive(Debug)]
pub struct ExportReport {
    pub bytes_written: usize,
    pub fp16: Option<Fp16Report>,
}

const DYNAMIC_AXES: [(usize, &str); 3] = [(0, "batch"), (2, "height"), (3, "width")];

/// Renames the batch and spatial axes of the input and output declarations
/// to symbolic parameters, leaving the channel axis fixed.
fn apply_dynamic_axes(model: &mut ModelProto) -> Result<(), Error> {
    let graph = model.graph.as_mut().ok_or(Error::EmptyModel)?;
    for value_info in graph.input.iter_mut().chain(graph.output.iter_mut()) {
        let Some(onnx::type_proto::Value::TensorType(tensor_type)) = value_info
            .r#type
            .as_mut()
            .and_then(|t| t.value.as_mut())
        else {
            continue;
        };
        let Some(shape) = tensor_type.shape.as_mut() else {
            continue;
        };
        for (index, name) in DYNAMIC_AXES {
            if let Some(dim) = shape.dim.get_mut(index) {
                dim.value = Some(onnx::tensor_shape_proto::dimension::Value::DimParam(
                    name.to_string(),
                ));
            }
        }
    }
    Ok(())
}

/// Builds the RRDBNet graph from `weights`, applies the configured shape
/// and precision treatment, and writes the encoded model to `dest`.
pub fn export_model(
    weights: &impl WeightManager,
    arch: &RrdbNetConfig,
    config: &ExportConfig,
    dest: &Path,
) -> Result<ExportReport, Error> {
    let mut model = build_rrdbnet(weights, arch, config.tile_size)?;
    if config.dynamic_shape {
        apply_dynamic_axes(&mut model)?;
    }
    let fp16 = match config.precision {
        Precision::Fp16 => Some(convert_model_to_fp16(&mut model)?),
        Precision::Fp32 => None,
    };
    let bytes = model.encode_to_vec();
    fs::write(dest, &bytes).map_err(|source| Error::Serialization {
        path: dest.to_path_buf(),
        source,
    })?;
    info!("wrote {} ({} bytes)", dest.display(), bytes.len());
    Ok(ExportReport {
        bytes_written: bytes.len(),
        fp16,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sr_onnx_graph::onnx::tensor_proto::DataType;
    use sr_onnx_graph::onnx::tensor_shape_proto::dimension;
    use sr_onnx_graph::onnx::{
        GraphProto, TensorShapeProto, TypeProto, ValueInfoProto,
    };

    fn nchw_value_info(name: &str, dims: &[i64]) -> ValueInfoProto {
        ValueInfoProto {
            name: name.to_string(),
            r#type: Some(TypeProto {
                value: Some(onnx::type_proto::Value::TensorType(
                    onnx::type_proto::Tensor {
                        elem_type: DataType::Float as i32,
                        shape: Some(TensorShapeProto {
                            dim: dims
                                .iter()
                                .map(|d| onnx::tensor_shape_proto::Dimension {
                                    value: Some(dimension::Value::DimValue(*d)),
                                    denotation: String::new(),
                                })
                                .collect(),
                        }),
                    },
                )),
                denotation: String::new(),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn dynamic_axes_rename_batch_and_spatial_dims() {
        let mut model = ModelProto {
            graph: Some(GraphProto {
                input: vec![nchw_value_info("input", &[1, 3, 256, 256])],
                output: vec![nchw_value_info("output", &[1, 3, 1024, 1024])],
                ..Default::default()
            }),
            ..Default::default()
        };
        apply_dynamic_axes(&mut model).unwrap();

        let graph = model.graph.unwrap();
        for value_info in graph.input.iter().chain(graph.output.iter()) {
            let Some(onnx::type_proto::Value::TensorType(tensor_type)) =
                value_info.r#type.as_ref().and_then(|t| t.value.as_ref())
            else {
                panic!("missing tensor type");
            };
            let dims = &tensor_type.shape.as_ref().unwrap().dim;
            assert_eq!(
                dims[0].value,
                Some(dimension::Value::DimParam("batch".to_string()))
            );
            assert_eq!(dims[1].value, Some(dimension::Value::DimValue(3)));
            assert_eq!(
                dims[2].value,
                Some(dimension::Value::DimParam("height".to_string()))
            );
            assert_eq!(
                dims[3].value,
                Some(dimension::Value::DimParam("width".to_string()))
            );
        }
    }
}
