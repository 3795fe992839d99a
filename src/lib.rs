//! Real-ESRGAN checkpoint export: reads RRDBNet weights from a torch
//! checkpoint, emits the network as an ONNX model, and optionally rewrites
//! the model to half precision and sanity-checks it by running the graph.

use std::path::PathBuf;

pub mod checkpoint;
pub mod convert;
pub mod fp16;
pub mod rrdbnet;
pub mod runtime;
pub mod verify;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Input file not found: {0}")]
    InputNotFound(PathBuf),
    #[error("Unrecognized checkpoint layout: {0}")]
    CheckpointFormat(String),
    #[error("Malformed tensor payload in {tensor}: {detail}")]
    MalformedPayload { tensor: String, detail: String },
    #[error("Failed to write {path}: {source}")]
    Serialization {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Model verification failed: {0}")]
    VerificationFailure(String),
    #[error("Model contains no graph")]
    EmptyModel,
    #[error("Unsupported configuration: {0}")]
    Unsupported(String),
    #[error("Failed to decode model: {0}")]
    ModelDecode(#[from] prost::DecodeError),
    #[error(transparent)]
    Graph(#[from] sr_onnx_graph::Error),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
