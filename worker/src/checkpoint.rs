//! Checkpoint persistence.
//!
//! One safetensors file holds the flat parameter vector and the persistent
//! control variables, so a restarted session restores the model and the
//! coordination state (step, cursor, validation state) together.

use std::{fs, io, path::Path};

use comms::msg::ControlSnapshot;
use safetensors::{
    tensor::{Dtype, TensorView},
    SafeTensors,
};

use crate::error::{Result, TrainerErr};

/// The periodic checkpoint written after each validation.
pub const CHECKPOINT: &str = "model.ckpt";

/// The final model written by the chief on normal completion.
pub const FINAL_CHECKPOINT: &str = "final.ckpt";

/// A restored checkpoint.
pub struct Checkpoint {
    pub params: Vec<f32>,
    pub state: ControlSnapshot,
}

fn corrupt<E: ToString>(e: E) -> TrainerErr {
    TrainerErr::Checkpoint(e.to_string())
}

/// Writes a checkpoint atomically enough for restart purposes.
///
/// # Arguments
/// * `path` - The checkpoint file location.
/// * `params` - The flat parameter vector.
/// * `state` - The persistent control variables.
pub fn save(path: &Path, params: &[f32], state: &ControlSnapshot) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let ints = [
        ("global_step", state.global_step),
        ("position", state.position),
        ("validated_step", state.validated_step),
    ];
    let floats = [
        ("validation_loss", state.validation_loss),
        ("learning_rate_fact", state.learning_rate_fact),
    ];

    let int_bytes: Vec<[u8; 8]> = ints.iter().map(|(_, v)| v.to_le_bytes()).collect();
    let float_bytes: Vec<[u8; 4]> = floats.iter().map(|(_, v)| v.to_le_bytes()).collect();

    let mut tensors = vec![(
        "params",
        TensorView::new(Dtype::F32, vec![params.len()], bytemuck::cast_slice(params))
            .map_err(corrupt)?,
    )];
    for (&(name, _), bytes) in ints.iter().zip(&int_bytes) {
        tensors.push((name, TensorView::new(Dtype::I64, vec![1], bytes).map_err(corrupt)?));
    }
    for (&(name, _), bytes) in floats.iter().zip(&float_bytes) {
        tensors.push((name, TensorView::new(Dtype::F32, vec![1], bytes).map_err(corrupt)?));
    }

    let encoded = safetensors::serialize(tensors, &None).map_err(corrupt)?;
    fs::write(path, encoded)?;

    Ok(())
}

/// Restores a checkpoint if one exists.
///
/// # Returns
/// `None` when no checkpoint has been written yet.
pub fn restore(path: &Path) -> Result<Option<Checkpoint>> {
    let buffer = match fs::read(path) {
        Ok(buffer) => buffer,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let tensors = SafeTensors::deserialize(&buffer).map_err(corrupt)?;

    let int = |name: &str| -> Result<i64> {
        let view = tensors.tensor(name).map_err(corrupt)?;
        let bytes: [u8; 8] = view
            .data()
            .try_into()
            .map_err(|_| corrupt(format!("{name} is not a scalar")))?;
        Ok(i64::from_le_bytes(bytes))
    };
    let float = |name: &str| -> Result<f32> {
        let view = tensors.tensor(name).map_err(corrupt)?;
        let bytes: [u8; 4] = view
            .data()
            .try_into()
            .map_err(|_| corrupt(format!("{name} is not a scalar")))?;
        Ok(f32::from_le_bytes(bytes))
    };

    let params_view = tensors.tensor("params").map_err(corrupt)?;
    if params_view.data().len() % 4 != 0 {
        return Err(corrupt("the parameter tensor is truncated"));
    }
    let params: Vec<f32> = params_view
        .data()
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes(chunk.try_into().unwrap()))
        .collect();

    Ok(Some(Checkpoint {
        params,
        state: ControlSnapshot {
            global_step: int("global_step")?,
            position: int("position")?,
            validated_step: int("validated_step")?,
            validation_loss: float("validation_loss")?,
            learning_rate_fact: float("learning_rate_fact")?,
        },
    }))
}
