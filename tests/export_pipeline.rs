//! End-to-end export pipeline tests over a reduced RRDBNet built from
//! synthetic weights.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use prost::Message;
use realesrgan_export::convert::{export_model, ExportConfig, Precision};
use realesrgan_export::fp16::quantize_file;
use realesrgan_export::rrdbnet::RrdbNetConfig;
use realesrgan_export::verify::verify_model;
use sr_onnx_graph::onnx::tensor_proto::DataType;
use sr_onnx_graph::onnx::tensor_shape_proto::dimension;
use sr_onnx_graph::onnx::{ModelProto, ValueInfoProto};
use sr_onnx_graph::tensor::{Shape, TensorData};
use sr_onnx_graph::weights::StaticWeightManager;

const FEAT: usize = 8;
const GROW: usize = 4;
const BLOCKS: usize = 1;
const TILE: usize = 16;

fn conv_entry(map: &mut HashMap<String, TensorData>, prefix: &str, out_ch: usize, in_ch: usize) {
    map.insert(
        format!("{prefix}.weight"),
        TensorData::fill(Shape::fixed(&[out_ch, in_ch, 3, 3]), 0.01f32).unwrap(),
    );
    map.insert(
        format!("{prefix}.bias"),
        TensorData::fill(Shape::fixed(&[out_ch]), 0.0f32).unwrap(),
    );
}

fn synthetic_weights() -> StaticWeightManager {
    let mut map = HashMap::new();
    conv_entry(&mut map, "conv_first", FEAT, 3);
    for block in 0..BLOCKS {
        for rdb in ["rdb1", "rdb2", "rdb3"] {
            for k in 0..5usize {
                let (out_ch, in_ch) = if k == 4 {
                    (FEAT, FEAT + 4 * GROW)
                } else {
                    (GROW, FEAT + k * GROW)
                };
                conv_entry(
                    &mut map,
                    &format!("body.{block}.{rdb}.conv{}", k + 1),
                    out_ch,
                    in_ch,
                );
            }
        }
    }
    for name in ["conv_body", "conv_up1", "conv_up2", "conv_hr"] {
        conv_entry(&mut map, name, FEAT, FEAT);
    }
    conv_entry(&mut map, "conv_last", 3, FEAT);
    StaticWeightManager::new(map)
}

fn arch() -> RrdbNetConfig {
    RrdbNetConfig {
        num_feat: FEAT,
        num_block: BLOCKS,
        num_grow_ch: GROW,
        ..Default::default()
    }
}

fn export(dir: &Path, name: &str, config: &ExportConfig) -> ModelProto {
    let path = dir.join(name);
    export_model(&synthetic_weights(), &arch(), config, &path).unwrap();
    ModelProto::decode(fs::read(&path).unwrap().as_slice()).unwrap()
}

fn declared_dims(value_info: &ValueInfoProto) -> Vec<dimension::Value> {
    let Some(sr_onnx_graph::onnx::type_proto::Value::TensorType(tensor_type)) =
        value_info.r#type.as_ref().and_then(|t| t.value.as_ref())
    else {
        panic!("{} is not a tensor declaration", value_info.name);
    };
    tensor_type
        .shape
        .as_ref()
        .unwrap()
        .dim
        .iter()
        .map(|d| d.value.clone().unwrap())
        .collect()
}

fn fixed_dims(value_info: &ValueInfoProto) -> Vec<i64> {
    declared_dims(value_info)
        .into_iter()
        .map(|v| match v {
            dimension::Value::DimValue(v) => v,
            dimension::Value::DimParam(name) => panic!("unexpected symbolic dim {name}"),
        })
        .collect()
}

#[test]
fn fp32_export_declares_a_4x_output_and_executes() {
    let dir = tempfile::tempdir().unwrap();
    let config = ExportConfig {
        tile_size: TILE,
        ..Default::default()
    };
    let model = export(dir.path(), "net.onnx", &config);

    let graph = model.graph.as_ref().unwrap();
    assert_eq!(fixed_dims(&graph.input[0]), vec![1, 3, 16, 16]);
    assert_eq!(fixed_dims(&graph.output[0]), vec![1, 3, 64, 64]);
    assert!(graph
        .initializer
        .iter()
        .all(|i| i.data_type == DataType::Float as i32));

    verify_model(&dir.path().join("net.onnx"), TILE, 4).unwrap();
}

#[test]
fn full_tile_declarations_match_the_x4_contract() {
    let dir = tempfile::tempdir().unwrap();
    let config = ExportConfig {
        tile_size: 256,
        ..Default::default()
    };
    let model = export(dir.path(), "net.onnx", &config);
    let graph = model.graph.as_ref().unwrap();
    assert_eq!(fixed_dims(&graph.input[0]), vec![1, 3, 256, 256]);
    assert_eq!(fixed_dims(&graph.output[0]), vec![1, 3, 1024, 1024]);
}

#[test]
fn fp16_export_retags_everything_and_preserves_structure() {
    let dir = tempfile::tempdir().unwrap();
    let fp32 = export(
        dir.path(),
        "net.onnx",
        &ExportConfig {
            tile_size: TILE,
            ..Default::default()
        },
    );
    let fp16 = export(
        dir.path(),
        "net_fp16.onnx",
        &ExportConfig {
            tile_size: TILE,
            precision: Precision::Fp16,
            ..Default::default()
        },
    );

    let g32 = fp32.graph.as_ref().unwrap();
    let g16 = fp16.graph.as_ref().unwrap();

    for initializer in &g16.initializer {
        assert_eq!(
            initializer.data_type,
            DataType::Float16 as i32,
            "initializer {} not converted",
            initializer.name
        );
    }
    for (narrow, wide) in g16.initializer.iter().zip(g32.initializer.iter()) {
        assert_eq!(narrow.name, wide.name);
        assert_eq!(narrow.dims, wide.dims);
        assert_eq!(narrow.raw_data.len() * 2, wide.raw_data.len());
    }

    // Same nodes, same wiring; only element types change.
    assert_eq!(g16.node.len(), g32.node.len());
    for (a, b) in g16.node.iter().zip(g32.node.iter()) {
        assert_eq!(a.op_type, b.op_type);
        assert_eq!(a.input, b.input);
        assert_eq!(a.output, b.output);
    }

    for value_info in g16.input.iter().chain(g16.output.iter()) {
        let Some(sr_onnx_graph::onnx::type_proto::Value::TensorType(tensor_type)) =
            value_info.r#type.as_ref().and_then(|t| t.value.as_ref())
        else {
            panic!("missing tensor type");
        };
        assert_eq!(tensor_type.elem_type, DataType::Float16 as i32);
    }

    verify_model(&dir.path().join("net_fp16.onnx"), TILE, 4).unwrap();
}

#[test]
fn quantizing_twice_is_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("net.onnx");
    export_model(
        &synthetic_weights(),
        &arch(),
        &ExportConfig {
            tile_size: TILE,
            ..Default::default()
        },
        &source,
    )
    .unwrap();

    let first = dir.path().join("net_fp16.onnx");
    let second = dir.path().join("net_fp16_again.onnx");
    quantize_file(&source, &first).unwrap();
    quantize_file(&first, &second).unwrap();
    assert_eq!(fs::read(&first).unwrap(), fs::read(&second).unwrap());
}

#[test]
fn dynamic_export_renames_batch_and_spatial_axes() {
    let dir = tempfile::tempdir().unwrap();
    let config = ExportConfig {
        tile_size: TILE,
        dynamic_shape: true,
        ..Default::default()
    };
    let model = export(dir.path(), "net.onnx", &config);
    let graph = model.graph.as_ref().unwrap();

    for value_info in graph.input.iter().chain(graph.output.iter()) {
        let dims = declared_dims(value_info);
        assert_eq!(dims[0], dimension::Value::DimParam("batch".to_string()));
        assert!(matches!(dims[1], dimension::Value::DimValue(3)));
        assert_eq!(dims[2], dimension::Value::DimParam("height".to_string()));
        assert_eq!(dims[3], dimension::Value::DimParam("width".to_string()));
    }

    // Symbolic axes fall back to the provided tile size when executing.
    verify_model(&dir.path().join("net.onnx"), TILE, 4).unwrap();
}
