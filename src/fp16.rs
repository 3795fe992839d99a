//! Float32 to float16 model rewriting. Three passes over the graph, in no
//! particular order: initializer payloads, input/output declarations, and
//! tensors embedded in node attributes. Anything that is not float32 passes
//! through untouched, so running the rewrite twice is a no-op.

use std::fs;
use std::path::Path;

use half::f16;
use log::info;
use prost::Message;
use sr_onnx_graph::onnx::tensor_proto::DataType;
use sr_onnx_graph::onnx::{self, ModelProto, TensorProto, ValueInfoProto};

use crate::Error;

/// Byte-level codec failure: the payload length is not a whole number of
/// elements.
#[derive(Debug, thiserror::Error)]
#[error("payload of {len} bytes is not a multiple of {width}")]
pub struct CodecError {
    pub len: usize,
    pub width: usize,
}

/// Reencodes a little-endian float32 payload as little-endian float16,
/// rounding to nearest even. Overflow saturates to the infinities and
/// magnitudes below the subnormal range flush to zero.
pub fn encode_fp16(bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    if bytes.len() % 4 != 0 {
        return Err(CodecError {
            len: bytes.len(),
            width: 4,
        });
    }
    let mut out = Vec::with_capacity(bytes.len() / 2);
    for chunk in bytes.chunks_exact(4) {
        let value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        out.extend_from_slice(&f16::from_f32(value).to_le_bytes());
    }
    Ok(out)
}

/// Widens a little-endian float16 payload back to float32. Exact for every
/// representable half value.
pub fn decode_fp16(bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
    if bytes.len() % 2 != 0 {
        return Err(CodecError {
            len: bytes.len(),
            width: 2,
        });
    }
    let mut out = Vec::with_capacity(bytes.len() * 2);
    for chunk in bytes.chunks_exact(2) {
        let value = f16::from_le_bytes([chunk[0], chunk[1]]).to_f32();
        out.extend_from_slice(&value.to_le_bytes());
    }
    Ok(out)
}

/// What the rewrite touched.
#[derive(Debug, Default, Clone, Copy)]
pub struct Fp16Report {
    pub initializers: usize,
    pub interfaces: usize,
    pub constants: usize,
}

fn convert_tensor(tensor: &mut TensorProto, converted: &mut usize) -> Result<(), Error> {
    if tensor.data_type != DataType::Float as i32 {
        return Ok(());
    }
    // Payloads arrive either packed in raw_data or as the typed float_data
    // list; both are drained and the result always lands in raw_data.
    let payload: Vec<u8> = if !tensor.raw_data.is_empty() {
        std::mem::take(&mut tensor.raw_data)
    } else {
        tensor
            .float_data
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect()
    };
    let elements = tensor.dims.iter().product::<i64>().max(0) as usize;
    if payload.len() != elements * 4 {
        return Err(Error::MalformedPayload {
            tensor: tensor.name.clone(),
            detail: format!(
                "{} bytes for {} declared elements",
                payload.len(),
                elements
            ),
        });
    }
    let half_payload = encode_fp16(&payload).map_err(|e| Error::MalformedPayload {
        tensor: tensor.name.clone(),
        detail: e.to_string(),
    })?;
    tensor.float_data.clear();
    tensor.raw_data = half_payload;
    tensor.data_type = DataType::Float16 as i32;
    *converted += 1;
    Ok(())
}

fn retag_value_info(value_info: &mut ValueInfoProto) -> usize {
    if let Some(onnx::type_proto::Value::TensorType(tensor_type)) = value_info
        .r#type
        .as_mut()
        .and_then(|t| t.value.as_mut())
    {
        if tensor_type.elem_type == DataType::Float as i32 {
            tensor_type.elem_type = DataType::Float16 as i32;
            return 1;
        }
    }
    0
}

/// Rewrites every float32 tensor in the model to float16. On error the
/// model is left exactly as it was: the passes run on a copy of the graph
/// that only replaces the original once all of them succeed.
pub fn convert_model_to_fp16(model: &mut ModelProto) -> Result<Fp16Report, Error> {
    let graph = model.graph.as_ref().ok_or(Error::EmptyModel)?;
    let mut converted = graph.clone();
    let mut report = Fp16Report::default();

    for initializer in &mut converted.initializer {
        convert_tensor(initializer, &mut report.initializers)?;
    }
    for value_info in converted
        .input
        .iter_mut()
        .chain(converted.output.iter_mut())
        .chain(converted.value_info.iter_mut())
    {
        report.interfaces += retag_value_info(value_info);
    }
    for node in &mut converted.node {
        for attribute in &mut node.attribute {
            if let Some(tensor) = &mut attribute.t {
                convert_tensor(tensor, &mut report.constants)?;
            }
            for tensor in &mut attribute.tensors {
                convert_tensor(tensor, &mut report.constants)?;
            }
        }
    }

    model.graph = Some(converted);
    Ok(report)
}

/// Reads a model file, rewrites it to float16, and writes the result.
pub fn quantize_file(input: &Path, output: &Path) -> Result<Fp16Report, Error> {
    if !input.is_file() {
        return Err(Error::InputNotFound(input.to_path_buf()));
    }
    let bytes = fs::read(input)?;
    let mut model = ModelProto::decode(bytes.as_slice())?;
    let report = convert_model_to_fp16(&mut model)?;
    let out_bytes = model.encode_to_vec();
    fs::write(output, &out_bytes).map_err(|source| Error::Serialization {
        path: output.to_path_buf(),
        source,
    })?;
    info!(
        "quantized {} ({} bytes) -> {} ({} bytes): {} initializers, {} interfaces, {} constants",
        input.display(),
        bytes.len(),
        output.display(),
        out_bytes.len(),
        report.initializers,
        report.interfaces,
        report.constants
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sr_onnx_graph::onnx::{AttributeProto, GraphProto, TypeProto};

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn f16_values(bytes: &[u8]) -> Vec<f16> {
        bytes
            .chunks_exact(2)
            .map(|c| f16::from_le_bytes([c[0], c[1]]))
            .collect()
    }

    #[test]
    fn encodes_reference_values() {
        let encoded = encode_fp16(&f32_bytes(&[0.0, 1.0, -1.0, 3.14159])).unwrap();
        let values = f16_values(&encoded);
        assert_eq!(values[0], f16::from_f32(0.0));
        assert_eq!(values[1], f16::from_f32(1.0));
        assert_eq!(values[2], f16::from_f32(-1.0));
        assert_eq!(values[3], f16::from_f32(3.14159));
        assert!((values[3].to_f32() - 3.14159).abs() < 1e-3);
    }

    #[test]
    fn overflow_saturates_and_underflow_flushes() {
        let encoded = encode_fp16(&f32_bytes(&[1e30, -1e30, 1e-10])).unwrap();
        let values = f16_values(&encoded);
        assert_eq!(values[0], f16::INFINITY);
        assert_eq!(values[1], f16::NEG_INFINITY);
        assert_eq!(values[2].to_f32(), 0.0);
    }

    #[test]
    fn decode_is_exact_for_half_values() {
        let original = f32_bytes(&[0.5, -2.25, 1024.0]);
        let decoded = decode_fp16(&encode_fp16(&original).unwrap()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn ragged_payloads_are_rejected() {
        assert!(encode_fp16(&[0u8; 6]).is_err());
        assert!(decode_fp16(&[0u8; 3]).is_err());
    }

    fn float_value_info(name: &str) -> ValueInfoProto {
        ValueInfoProto {
            name: name.to_string(),
            r#type: Some(TypeProto {
                value: Some(onnx::type_proto::Value::TensorType(
                    onnx::type_proto::Tensor {
                        elem_type: DataType::Float as i32,
                        shape: None,
                    },
                )),
                denotation: String::new(),
            }),
            ..Default::default()
        }
    }

    fn test_model() -> ModelProto {
        let weight = TensorProto {
            name: "w".to_string(),
            data_type: DataType::Float as i32,
            dims: vec![2, 2],
            raw_data: f32_bytes(&[1.0, 2.0, 3.0, 4.0]),
            ..Default::default()
        };
        let typed_weight = TensorProto {
            name: "b".to_string(),
            data_type: DataType::Float as i32,
            dims: vec![2],
            float_data: vec![0.5, -0.5],
            ..Default::default()
        };
        let indices = TensorProto {
            name: "idx".to_string(),
            data_type: DataType::Int64 as i32,
            dims: vec![2],
            raw_data: vec![0; 16],
            ..Default::default()
        };
        let constant = onnx::NodeProto {
            op_type: "Constant".to_string(),
            output: vec!["c".to_string()],
            attribute: vec![AttributeProto {
                name: "value".to_string(),
                r#type: onnx::attribute_proto::AttributeType::Tensor as i32,
                t: Some(TensorProto {
                    data_type: DataType::Float as i32,
                    dims: vec![1],
                    raw_data: f32_bytes(&[0.2]),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        };
        ModelProto {
            graph: Some(GraphProto {
                initializer: vec![weight, typed_weight, indices],
                input: vec![float_value_info("input")],
                output: vec![float_value_info("output")],
                node: vec![constant],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn converts_initializers_interfaces_and_constants() {
        let mut model = test_model();
        let report = convert_model_to_fp16(&mut model).unwrap();
        assert_eq!(report.initializers, 2);
        assert_eq!(report.interfaces, 2);
        assert_eq!(report.constants, 1);

        let graph = model.graph.as_ref().unwrap();
        let weight = &graph.initializer[0];
        assert_eq!(weight.data_type, DataType::Float16 as i32);
        assert_eq!(weight.raw_data.len(), 8);
        assert_eq!(
            f16_values(&weight.raw_data),
            vec![
                f16::from_f32(1.0),
                f16::from_f32(2.0),
                f16::from_f32(3.0),
                f16::from_f32(4.0)
            ]
        );
        let typed = &graph.initializer[1];
        assert_eq!(typed.data_type, DataType::Float16 as i32);
        assert!(typed.float_data.is_empty());
        assert_eq!(typed.raw_data.len(), 4);
        // Non-float payloads keep their type and bytes.
        let indices = &graph.initializer[2];
        assert_eq!(indices.data_type, DataType::Int64 as i32);
        assert_eq!(indices.raw_data.len(), 16);
    }

    #[test]
    fn second_run_changes_nothing() {
        let mut model = test_model();
        convert_model_to_fp16(&mut model).unwrap();
        let first = model.encode_to_vec();
        let report = convert_model_to_fp16(&mut model).unwrap();
        assert_eq!(report.initializers, 0);
        assert_eq!(report.interfaces, 0);
        assert_eq!(report.constants, 0);
        assert_eq!(model.encode_to_vec(), first);
    }

    #[test]
    fn structure_is_preserved() {
        let mut model = test_model();
        let before = model.graph.clone().unwrap();
        convert_model_to_fp16(&mut model).unwrap();
        let after = model.graph.unwrap();
        assert_eq!(before.node.len(), after.node.len());
        assert_eq!(before.initializer.len(), after.initializer.len());
        for (a, b) in before.node.iter().zip(after.node.iter()) {
            assert_eq!(a.op_type, b.op_type);
            assert_eq!(a.input, b.input);
            assert_eq!(a.output, b.output);
        }
        for (a, b) in before.initializer.iter().zip(after.initializer.iter()) {
            assert_eq!(a.dims, b.dims);
            assert_eq!(a.name, b.name);
        }
    }

    #[test]
    fn malformed_payload_leaves_model_untouched() {
        let mut model = test_model();
        if let Some(graph) = &mut model.graph {
            // 4 bytes but 2x2 declared elements.
            graph.initializer[0].raw_data.truncate(4);
        }
        let before = model.encode_to_vec();
        let result = convert_model_to_fp16(&mut model);
        assert!(matches!(result, Err(Error::MalformedPayload { .. })));
        assert_eq!(model.encode_to_vec(), before);
    }
}
