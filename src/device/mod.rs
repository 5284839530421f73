//! Compute backend selection and dispatch.
//!
//! A [`Device`] is either the CPU reference path or an OpenCL GPU wrapped
//! around the same primitive set. The first time any GPU call fails, the
//! device falls back to the CPU for the rest of the session and the failed
//! call is retried there, so callers never see backend errors.

pub mod cpu;
#[cfg(feature = "gpu")]
pub mod gpu;

#[cfg(feature = "gpu")]
use std::cell::Cell;

pub struct Device {
    #[cfg(feature = "gpu")]
    gpu: Option<gpu::GpuContext>,
    #[cfg(feature = "gpu")]
    disabled: Cell<bool>,
}

impl Device {
    /// A CPU-only device.
    pub fn cpu() -> Self {
        Self {
            #[cfg(feature = "gpu")]
            gpu: None,
            #[cfg(feature = "gpu")]
            disabled: Cell::new(false),
        }
    }

    /// Tries to attach a GPU, optionally one whose vendor or name matches
    /// `preferred_vendor`. Falls back to the CPU when none is usable.
    #[cfg(feature = "gpu")]
    pub fn new(preferred_vendor: Option<&str>) -> Self {
        match gpu::GpuContext::new(preferred_vendor) {
            Ok(ctx) => Self {
                gpu: Some(ctx),
                disabled: Cell::new(false),
            },
            Err(e) => {
                println!("[gpu] unavailable ({}), running on CPU", e);
                Self::cpu()
            }
        }
    }

    #[cfg(not(feature = "gpu"))]
    pub fn new(_preferred_vendor: Option<&str>) -> Self {
        Self::cpu()
    }

    pub fn is_gpu(&self) -> bool {
        #[cfg(feature = "gpu")]
        {
            self.gpu.is_some() && !self.disabled.get()
        }
        #[cfg(not(feature = "gpu"))]
        {
            false
        }
    }

    #[cfg(feature = "gpu")]
    fn active_gpu(&self) -> Option<&gpu::GpuContext> {
        if self.disabled.get() {
            None
        } else {
            self.gpu.as_ref()
        }
    }

    #[cfg(feature = "gpu")]
    fn disable_gpu(&self, e: gpu::program::ProgramError) {
        println!("[gpu] kernel failed ({}), falling back to CPU for this session", e);
        self.disabled.set(true);
    }

    pub fn matmul(&self, a: &[f32], b: &[f32], m: usize, n: usize, p: usize) -> Vec<f32> {
        #[cfg(feature = "gpu")]
        if let Some(ctx) = self.active_gpu() {
            match ctx.matmul(a, b, m, n, p) {
                Ok(out) => return out,
                Err(e) => self.disable_gpu(e),
            }
        }
        cpu::matmul(a, b, m, n, p)
    }

    pub fn row_softmax(&self, x: &[f32], rows: usize, cols: usize) -> Vec<f32> {
        #[cfg(feature = "gpu")]
        if let Some(ctx) = self.active_gpu() {
            match ctx.row_softmax(x, rows, cols) {
                Ok(out) => return out,
                Err(e) => self.disable_gpu(e),
            }
        }
        cpu::row_softmax(x, rows, cols)
    }

    pub fn row_softmax_backward(&self, a: &[f32], da: &[f32], rows: usize, cols: usize) -> Vec<f32> {
        #[cfg(feature = "gpu")]
        if let Some(ctx) = self.active_gpu() {
            match ctx.row_softmax_backward(a, da, rows, cols) {
                Ok(out) => return out,
                Err(e) => self.disable_gpu(e),
            }
        }
        cpu::row_softmax_backward(a, da, rows, cols)
    }

    pub fn transpose(&self, x: &[f32], rows: usize, cols: usize) -> Vec<f32> {
        #[cfg(feature = "gpu")]
        if let Some(ctx) = self.active_gpu() {
            match ctx.transpose(x, rows, cols) {
                Ok(out) => return out,
                Err(e) => self.disable_gpu(e),
            }
        }
        cpu::transpose(x, rows, cols)
    }

    pub fn scale_in_place(&self, x: &mut [f32], s: f32, rows: usize, cols: usize) {
        #[cfg(feature = "gpu")]
        if let Some(ctx) = self.active_gpu() {
            match ctx.scale_in_place(x, s, rows, cols) {
                Ok(()) => return,
                Err(e) => self.disable_gpu(e),
            }
        }
        let _ = (rows, cols);
        cpu::scale_in_place(x, s);
    }

    pub fn embedding_gather(&self, ids: &[usize], table: &[f32], dim: usize) -> Vec<f32> {
        #[cfg(feature = "gpu")]
        if let Some(ctx) = self.active_gpu() {
            match ctx.embedding_gather(ids, table, dim) {
                Ok(out) => return out,
                Err(e) => self.disable_gpu(e),
            }
        }
        cpu::embedding_gather(ids, table, dim)
    }

    pub fn rotary(&self, buf: &mut [f32], rows: usize, dim: usize) {
        #[cfg(feature = "gpu")]
        if let Some(ctx) = self.active_gpu() {
            match ctx.rotary(buf, rows, dim) {
                Ok(()) => return,
                Err(e) => self.disable_gpu(e),
            }
        }
        cpu::rotary(buf, rows, dim);
    }

    pub fn layer_norm_forward(
        &self,
        x: &[f32],
        rows: usize,
        cols: usize,
        eps: f32,
    ) -> (Vec<f32>, Vec<f32>, Vec<f32>) {
        #[cfg(feature = "gpu")]
        if let Some(ctx) = self.active_gpu() {
            match ctx.layer_norm_forward(x, rows, cols, eps) {
                Ok(out) => return out,
                Err(e) => self.disable_gpu(e),
            }
        }
        cpu::layer_norm_forward(x, rows, cols, eps)
    }

    pub fn layer_norm_backward(
        &self,
        x: &[f32],
        dy: &[f32],
        mean: &[f32],
        inv_std: &[f32],
        rows: usize,
        cols: usize,
    ) -> Vec<f32> {
        #[cfg(feature = "gpu")]
        if let Some(ctx) = self.active_gpu() {
            match ctx.layer_norm_backward(x, dy, mean, inv_std, rows, cols) {
                Ok(out) => return out,
                Err(e) => self.disable_gpu(e),
            }
        }
        cpu::layer_norm_backward(x, dy, mean, inv_std, rows, cols)
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::cpu()
    }
}
