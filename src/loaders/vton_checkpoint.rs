//! Checkpoint records for the two UNet branches.
//!
//! A checkpoint is one safetensors file holding both state dicts, the
//! garment branch under `unet_garm.` and the try-on branch under
//! `unet_vton.`, with the epoch and global step recorded in the metadata
//! header. Loading merges by parameter name: names the model has but the
//! file lacks are tolerated (the pretrained value stays), names the file
//! has but the model lacks mean an incompatible architecture and fail hard.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;
use log::info;
use safetensors::tensor::{Dtype as SafeDtype, TensorView};
use safetensors::SafeTensors;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

pub const GARM_PREFIX: &str = "unet_garm.";
pub const VTON_PREFIX: &str = "unet_vton.";

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint contains {} parameter(s) unknown to the model, e.g. `{}`; \
             the checkpoint was written for an incompatible architecture",
            .keys.len(), .keys[0])]
    UnexpectedKeys { keys: Vec<String> },
}

/// Outcome of a state-dict merge.
#[derive(Debug)]
pub struct LoadReport {
    /// Model parameters absent from the file; they keep their prior value.
    pub missing: usize,
    /// Parameters overwritten from the file.
    pub loaded: usize,
    /// Global step recorded in the file, when present.
    pub global_step: Option<usize>,
}

/// Merge a state dict from `path` into `varmap`.
///
/// The file may be a full checkpoint record (keys under `prefix`) or a bare
/// single-network state dict; a prefixed record is detected by the presence
/// of at least one key with the prefix.
pub fn load_state_dict(path: &Path, varmap: &VarMap, prefix: &str) -> Result<LoadReport> {
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read checkpoint {}", path.display()))?;

    let global_step = read_global_step(&bytes);

    // Tensors land on CPU first; `Var::set` moves them onto the parameter's
    // device.
    let tensors = candle_core::safetensors::load_buffer(&bytes, &Device::Cpu)
        .with_context(|| format!("failed to parse checkpoint {}", path.display()))?;

    let prefixed = tensors.keys().any(|k| k.starts_with(prefix));
    let state_dict: HashMap<String, Tensor> = tensors
        .into_iter()
        .filter_map(|(key, tensor)| {
            if prefixed {
                key.strip_prefix(prefix).map(|k| (k.to_string(), tensor))
            } else {
                Some((key, tensor))
            }
        })
        .collect();

    let params = varmap.data().lock().unwrap();

    let mut unexpected: Vec<String> = state_dict
        .keys()
        .filter(|k| !params.contains_key(*k))
        .cloned()
        .collect();
    if !unexpected.is_empty() {
        unexpected.sort();
        return Err(CheckpointError::UnexpectedKeys { keys: unexpected }.into());
    }

    let mut loaded = 0;
    for (name, tensor) in &state_dict {
        let var = &params[name];
        var.set(&tensor.to_dtype(var.dtype())?)
            .with_context(|| format!("failed to assign checkpoint tensor `{name}`"))?;
        loaded += 1;
    }
    let missing = params.len() - loaded;

    info!(
        "loaded {loaded} tensors from {} (missing: {missing}, global_step: {global_step:?})",
        path.display()
    );
    Ok(LoadReport { missing, loaded, global_step })
}

fn read_global_step(bytes: &[u8]) -> Option<usize> {
    let (_, header) = SafeTensors::read_metadata(bytes).ok()?;
    header
        .metadata()
        .as_ref()?
        .get("global_step")
        .and_then(|s| s.parse().ok())
}

/// Serialize both branches plus the training position into one record.
///
/// Once written the file is self-contained: it can be loaded back with no
/// knowledge of the training configuration, as long as the networks are
/// architecturally compatible.
pub fn save_checkpoint(
    path: &Path,
    epoch: usize,
    global_step: usize,
    unet_garm: &VarMap,
    unet_vton: &VarMap,
) -> Result<()> {
    let mut buffers: Vec<(String, Vec<usize>, Vec<u8>)> = Vec::new();
    collect_state_dict(&mut buffers, GARM_PREFIX, unet_garm)?;
    collect_state_dict(&mut buffers, VTON_PREFIX, unet_vton)?;

    let mut views = HashMap::new();
    for (name, dims, data) in &buffers {
        views.insert(
            name.clone(),
            TensorView::new(SafeDtype::F32, dims.clone(), data)?,
        );
    }

    let mut metadata = HashMap::new();
    metadata.insert("epoch".to_string(), epoch.to_string());
    metadata.insert("global_step".to_string(), global_step.to_string());

    let data = safetensors::serialize(&views, &Some(metadata))?;
    fs::write(path, data)
        .with_context(|| format!("failed to write checkpoint {}", path.display()))?;
    Ok(())
}

fn collect_state_dict(
    out: &mut Vec<(String, Vec<usize>, Vec<u8>)>,
    prefix: &str,
    varmap: &VarMap,
) -> Result<()> {
    let params = varmap.data().lock().unwrap();
    // Stable name order across saves.
    let mut names: Vec<&String> = params.keys().collect();
    names.sort();

    for name in names {
        let tensor = params[name].as_tensor().to_dtype(DType::F32)?;
        let dims = tensor.dims().to_vec();
        let values = tensor.flatten_all()?.to_vec1::<f32>()?;
        out.push((
            format!("{prefix}{name}"),
            dims,
            bytemuck::cast_slice(&values).to_vec(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::Init;

    fn make_varmap(names: &[(&str, &[usize])], seed_offset: f64) -> VarMap {
        let varmap = VarMap::new();
        for (name, shape) in names {
            varmap
                .get(
                    *shape,
                    name,
                    Init::Const(seed_offset),
                    DType::F32,
                    &Device::Cpu,
                )
                .unwrap();
        }
        varmap
    }

    fn state_of(varmap: &VarMap) -> HashMap<String, Vec<f32>> {
        varmap
            .data()
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| {
                (
                    k.clone(),
                    v.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap(),
                )
            })
            .collect()
    }

    const SHAPES: &[(&str, &[usize])] = &[
        ("conv_in.weight", &[2, 2]),
        ("conv_in.bias", &[2]),
        ("conv_out.weight", &[3]),
    ];

    #[test]
    fn test_checkpoint_roundtrip_is_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint-global_step-5.safetensors");

        let garm = make_varmap(SHAPES, 1.0);
        let vton = make_varmap(SHAPES, 2.0);
        save_checkpoint(&path, 0, 5, &garm, &vton).unwrap();

        let garm2 = make_varmap(SHAPES, 0.0);
        let vton2 = make_varmap(SHAPES, 0.0);
        let report = load_state_dict(&path, &garm2, GARM_PREFIX).unwrap();
        assert_eq!(report.missing, 0);
        assert_eq!(report.loaded, SHAPES.len());
        assert_eq!(report.global_step, Some(5));
        load_state_dict(&path, &vton2, VTON_PREFIX).unwrap();

        assert_eq!(state_of(&garm), state_of(&garm2));
        assert_eq!(state_of(&vton), state_of(&vton2));

        // Re-saving without training writes an identical state dict.
        let path2 = dir.path().join("resaved.safetensors");
        save_checkpoint(&path2, 0, 5, &garm2, &vton2).unwrap();
        let first = fs::read(&path).unwrap();
        let second = fs::read(&path2).unwrap();
        let first = SafeTensors::deserialize(&first).unwrap();
        let second = SafeTensors::deserialize(&second).unwrap();
        let mut names = first.names();
        names.sort();
        let mut names2 = second.names();
        names2.sort();
        assert_eq!(names, names2);
        for name in names {
            assert_eq!(
                first.tensor(name).unwrap().data(),
                second.tensor(name).unwrap().data(),
                "{name}"
            );
        }
    }

    #[test]
    fn test_unexpected_key_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.safetensors");

        let bigger = make_varmap(
            &[("conv_in.weight", &[2, 2]), ("extra_block.weight", &[2])],
            1.0,
        );
        save_checkpoint(&path, 0, 1, &bigger, &bigger).unwrap();

        let model = make_varmap(&[("conv_in.weight", &[2, 2])], 0.0);
        let err = load_state_dict(&path, &model, GARM_PREFIX).unwrap_err();
        assert!(err.to_string().contains("incompatible"), "{err}");
    }

    #[test]
    fn test_strict_subset_keeps_unmatched_params() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subset.safetensors");

        let subset = make_varmap(&[("conv_in.weight", &[2, 2])], 7.0);
        save_checkpoint(&path, 0, 1, &subset, &subset).unwrap();

        let model = make_varmap(SHAPES, 3.0);
        let report = load_state_dict(&path, &model, GARM_PREFIX).unwrap();
        assert_eq!(report.loaded, 1);
        assert_eq!(report.missing, SHAPES.len() - 1);

        let state = state_of(&model);
        assert_eq!(state["conv_in.weight"], vec![7.0; 4]);
        // Parameters absent from the checkpoint keep their pre-load values.
        assert_eq!(state["conv_in.bias"], vec![3.0; 2]);
        assert_eq!(state["conv_out.weight"], vec![3.0; 3]);
    }

    #[test]
    fn test_bare_state_dict_without_prefix_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bare.safetensors");

        // A bare mapping: tensor names with no branch prefix and no
        // metadata.
        let value = vec![4.0f32; 4];
        let bytes: Vec<u8> = bytemuck::cast_slice(&value).to_vec();
        let mut views = HashMap::new();
        views.insert(
            "conv_in.weight".to_string(),
            TensorView::new(SafeDtype::F32, vec![2, 2], &bytes).unwrap(),
        );
        fs::write(&path, safetensors::serialize(&views, &None).unwrap()).unwrap();

        let model = make_varmap(&[("conv_in.weight", &[2, 2])], 0.0);
        let report = load_state_dict(&path, &model, GARM_PREFIX).unwrap();
        assert_eq!(report.loaded, 1);
        assert_eq!(report.global_step, None);
        assert_eq!(state_of(&model)["conv_in.weight"], vec![4.0; 4]);
    }
}
