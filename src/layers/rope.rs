use serde::{Deserialize, Serialize};

use crate::device::Device;

/// Rotary positional embedding over even/odd feature pairs.
///
/// Each row is rotated by `angle = pos / 10000^(2i/dim)` where `pos` is the
/// row index. The transform carries no trainable parameters and gradients are
/// not propagated through the angles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rotary {
    pub dim: usize,
}

impl Rotary {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    pub fn apply(&self, device: &Device, buf: &mut [f32], rows: usize) {
        device.rotary(buf, rows, self.dim);
    }
}
