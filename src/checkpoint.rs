use std::path::Path;

use candle_core::pickle::PthTensors;
use log::info;
use sr_onnx_graph::weights::PthWeightManager;

use crate::Error;

/// State-dict scopes tried in order. Real-ESRGAN releases keep the EMA
/// weights under `params_ema` and training weights under `params`; some
/// repacked checkpoints store the state dict at the top level.
pub const PARAM_SCOPES: [&str; 2] = ["params_ema", "params"];

/// Picks the first scope the checkpoint actually carries, or `None` for a
/// bare state dict.
pub fn select_param_scope(has_scope: impl Fn(&str) -> bool) -> Option<&'static str> {
    PARAM_SCOPES.iter().copied().find(|scope| has_scope(scope))
}

fn scope_has_tensors(path: &Path, scope: &str) -> bool {
    match PthTensors::new(path, Some(scope)) {
        Ok(tensors) => !tensors.tensor_infos().is_empty(),
        Err(_) => false,
    }
}

/// Opens a torch checkpoint and returns a weight manager over its state
/// dict, resolving the scope per [`PARAM_SCOPES`].
pub fn open_checkpoint(path: &Path) -> Result<PthWeightManager, Error> {
    if !path.is_file() {
        return Err(Error::InputNotFound(path.to_path_buf()));
    }
    let scope = select_param_scope(|scope| scope_has_tensors(path, scope));
    let tensors = PthTensors::new(path, scope)?;
    if tensors.tensor_infos().is_empty() {
        return Err(Error::CheckpointFormat(
            "checkpoint contains no tensors".to_string(),
        ));
    }
    match scope {
        Some(scope) => info!(
            "loaded {} tensors from checkpoint scope '{}'",
            tensors.tensor_infos().len(),
            scope
        ),
        None => info!(
            "loaded {} tensors from top-level state dict",
            tensors.tensor_infos().len()
        ),
    }
    Ok(PthWeightManager::new(tensors))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_scope_wins_when_both_present() {
        let scope = select_param_scope(|s| s == "params_ema" || s == "params");
        assert_eq!(scope, Some("params_ema"));
    }

    #[test]
    fn falls_back_to_params() {
        let scope = select_param_scope(|s| s == "params");
        assert_eq!(scope, Some("params"));
    }

    #[test]
    fn bare_state_dict_uses_no_scope() {
        assert_eq!(select_param_scope(|_| false), None);
    }

    #[test]
    fn missing_file_is_reported() {
        let result = open_checkpoint(Path::new("/nonexistent/model.pth"));
        assert!(matches!(result, Err(Error::InputNotFound(_))));
    }
}
