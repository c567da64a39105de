//! Checkpointing and serialization.
//!
//! Two formats, matching the two restart paths:
//!
//! - **Stream**: a length-prefixed little-endian encoding of one matrix after
//!   another, written to any `io::Write`. Each matrix is framed as
//!   `height: u64 | width: u64 | elements as f64`, elements in local
//!   row-major order. A cumulative byte counter is threaded through every
//!   call so a driver can report aggregate checkpoint I/O across layers.
//! - **Shared directory**: one `safetensors` artifact per layer, named by
//!   layer index, holding named entries (`weights`, `weights_gradient`).
//!
//! Both serialize the *local partition*; a restart must use the same grid
//! configuration. Loading validates shapes against the layer's configuration
//! and fails with [`LayerError::CheckpointShape`] on mismatch — restoring a
//! checkpoint into a differently shaped network is a driver bug, not
//! something to paper over.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;

use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;

use crate::mat::{DistMat, MatElem};
use crate::nn::layer::LayerError;

type Result<T> = std::result::Result<T, LayerError>;

/// Serializes one matrix to the stream and adds the bytes written to
/// `bytes`.
pub fn write_matrix<T: MatElem>(
    writer: &mut dyn Write,
    mat: &DistMat<T>,
    bytes: &mut u64,
) -> std::io::Result<()> {
    writer.write_all(&(mat.height() as u64).to_le_bytes())?;
    writer.write_all(&(mat.width() as u64).to_le_bytes())?;
    for &v in mat.local() {
        writer.write_all(&v.to_f64().unwrap_or(0.0).to_le_bytes())?;
    }
    *bytes += 16 + 8 * mat.local().len() as u64;
    Ok(())
}

/// Reads a matrix frame written by [`write_matrix`] into `mat`, which must
/// already be allocated to the expected shape.
pub fn read_matrix_into<T: MatElem>(
    reader: &mut dyn Read,
    mat: &mut DistMat<T>,
    bytes: &mut u64,
) -> Result<()> {
    let mut header = [0u8; 16];
    reader.read_exact(&mut header)?;
    let height = u64::from_le_bytes(header[0..8].try_into().unwrap()) as usize;
    let width = u64::from_le_bytes(header[8..16].try_into().unwrap()) as usize;
    if (height, width) != (mat.height(), mat.width()) {
        return Err(LayerError::CheckpointShape {
            expected: (mat.height(), mat.width()),
            got: (height, width),
        });
    }
    let mut payload = vec![0u8; mat.local().len() * 8];
    reader.read_exact(&mut payload)?;
    for (dst, chunk) in mat.local_mut().iter_mut().zip(payload.chunks_exact(8)) {
        let v = f64::from_le_bytes(chunk.try_into().unwrap());
        *dst = T::from_f64(v).unwrap_or_else(T::zero);
    }
    *bytes += 16 + payload.len() as u64;
    Ok(())
}

fn shared_path(dir: &Path, index: usize) -> std::path::PathBuf {
    dir.join(format!("layer_{index:04}.safetensors"))
}

/// Writes one layer's named matrices into the shared checkpoint directory as
/// a single safetensors artifact.
pub fn save_shared<T: MatElem>(
    dir: &Path,
    index: usize,
    entries: &[(&str, &DistMat<T>)],
    bytes: &mut u64,
) -> Result<()> {
    // safetensors views borrow their byte buffers, so encode first.
    let encoded: Vec<(String, Vec<usize>, Vec<u8>)> = entries
        .iter()
        .map(|(name, mat)| {
            let mut buf = Vec::with_capacity(mat.local().len() * 8);
            for &v in mat.local() {
                buf.extend_from_slice(&v.to_f64().unwrap_or(0.0).to_le_bytes());
            }
            (
                (*name).to_string(),
                vec![mat.height(), mat.local_width()],
                buf,
            )
        })
        .collect();

    let mut views = HashMap::new();
    for (name, shape, buf) in &encoded {
        let view = TensorView::new(Dtype::F64, shape.clone(), buf)
            .map_err(|e| LayerError::Checkpoint(format!("{e:?}")))?;
        views.insert(name.clone(), view);
    }

    let data = safetensors::serialize(views, &None)
        .map_err(|e| LayerError::Checkpoint(format!("{e:?}")))?;
    std::fs::write(shared_path(dir, index), &data)?;
    *bytes += data.len() as u64;
    Ok(())
}

/// Restores one layer's named matrices from the shared checkpoint directory.
pub fn load_shared<T: MatElem>(
    dir: &Path,
    index: usize,
    entries: &mut [(&str, &mut DistMat<T>)],
    bytes: &mut u64,
) -> Result<()> {
    let path = shared_path(dir, index);
    let content = std::fs::read(&path)?;
    *bytes += content.len() as u64;
    let tensors = SafeTensors::deserialize(&content)
        .map_err(|e| LayerError::Checkpoint(format!("{e:?}")))?;

    for (name, mat) in entries.iter_mut() {
        let view = tensors
            .tensor(name)
            .map_err(|e| LayerError::Checkpoint(format!("{e:?}")))?;
        let expected = [mat.height(), mat.local_width()];
        if view.shape() != expected {
            return Err(LayerError::CheckpointShape {
                expected: (mat.height(), mat.width()),
                got: (
                    view.shape().first().copied().unwrap_or(0),
                    view.shape().get(1).copied().unwrap_or(0),
                ),
            });
        }
        let data = view.data();
        for (dst, chunk) in mat.local_mut().iter_mut().zip(data.chunks_exact(8)) {
            let v = f64::from_le_bytes(chunk.try_into().unwrap());
            *dst = T::from_f64(v).unwrap_or_else(T::zero);
        }
    }
    Ok(())
}
