use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use log::{error, warn};

use realesrgan_export::convert::{export_model, ExportConfig, Precision};
use realesrgan_export::rrdbnet::{survey_block_count, RrdbNetConfig};
use realesrgan_export::verify::verify_model;
use realesrgan_export::{checkpoint, fp16, Error};

#[derive(Parser)]
#[command(name = "realesrgan-export", version, about = "Export Real-ESRGAN checkpoints to ONNX")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Convert a Real-ESRGAN .pth checkpoint to an ONNX model.
    Convert {
        /// Path to the torch checkpoint.
        #[arg(long)]
        input: PathBuf,
        /// Destination model path.
        #[arg(long)]
        output: PathBuf,
        /// Spatial extent of the declared input tile.
        #[arg(long, default_value_t = 256)]
        tile_size: usize,
        /// RRDB trunk depth. Surveyed from the checkpoint when omitted.
        #[arg(long)]
        blocks: Option<usize>,
        /// Upscale factor.
        #[arg(long, default_value_t = 4)]
        scale: usize,
        /// Declare batch/height/width as symbolic axes instead of fixed.
        #[arg(long)]
        dynamic: bool,
        /// Rewrite the exported model to float16.
        #[arg(long)]
        fp16: bool,
        /// Run the exported model on synthetic input afterwards.
        #[arg(long)]
        verify: bool,
    },
    /// Rewrite an existing ONNX model from float32 to float16.
    Quantize {
        /// Path to the float32 model.
        #[arg(long)]
        input: PathBuf,
        /// Destination path. Defaults to the input name with an _fp16 suffix.
        #[arg(long)]
        output: Option<PathBuf>,
        /// Tile size assumed when the model has symbolic spatial axes.
        #[arg(long, default_value_t = 256)]
        tile_size: usize,
        /// Upscale factor the verification run expects.
        #[arg(long, default_value_t = 4)]
        scale: usize,
        /// Skip the post-quantization test run.
        #[arg(long)]
        no_verify: bool,
    },
}

fn default_fp16_output(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("model");
    match input.extension().and_then(|e| e.to_str()) {
        Some(ext) => input.with_file_name(format!("{stem}_fp16.{ext}")),
        None => input.with_file_name(format!("{stem}_fp16")),
    }
}

/// Verification is advisory: a failed run is logged but the exported file
/// is kept and the process still succeeds.
fn verify_advisory(path: &Path, tile_size: usize, scale: usize) {
    if let Err(err) = verify_model(path, tile_size, scale) {
        warn!("verification failed for {}: {err}", path.display());
    }
}

fn run(cli: Cli) -> Result<(), Error> {
    match cli.command {
        Command::Convert {
            input,
            output,
            tile_size,
            blocks,
            scale,
            dynamic,
            fp16,
            verify,
        } => {
            let weights = checkpoint::open_checkpoint(&input)?;
            let mut arch = RrdbNetConfig {
                scale,
                ..Default::default()
            };
            if let Some(blocks) = blocks.or_else(|| survey_block_count(&weights)) {
                arch.num_block = blocks;
            }
            let config = ExportConfig {
                tile_size,
                dynamic_shape: dynamic,
                precision: if fp16 { Precision::Fp16 } else { Precision::Fp32 },
            };
            export_model(&weights, &arch, &config, &output)?;
            if verify {
                verify_advisory(&output, tile_size, scale);
            }
            Ok(())
        }
        Command::Quantize {
            input,
            output,
            tile_size,
            scale,
            no_verify,
        } => {
            let output = output.unwrap_or_else(|| default_fp16_output(&input));
            fp16::quantize_file(&input, &output)?;
            if !no_verify {
                verify_advisory(&output, tile_size, scale);
            }
            Ok(())
        }
    }
}

fn main() -> ExitCode {
    env_logger::init();
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fp16_suffix_goes_before_the_extension() {
        assert_eq!(
            default_fp16_output(Path::new("/models/net.onnx")),
            PathBuf::from("/models/net_fp16.onnx")
        );
        assert_eq!(
            default_fp16_output(Path::new("net")),
            PathBuf::from("net_fp16")
        );
    }
}
