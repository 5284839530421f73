//! Accelerated primitives dispatched to OpenCL kernels.
//!
//! Every call here is synchronous: inputs are uploaded, kernel arguments
//! bound in their declared order, the kernel enqueued over a grid sized to
//! the output, and results read back before returning. Any error bubbles up
//! to the [`Device`](super::Device) facade, which disables this path for the
//! rest of the session.

mod kernels;
pub mod program;

use program::{Device, Program, ProgramError};

pub struct GpuContext {
    program: Program,
}

impl GpuContext {
    pub fn new(preferred_vendor: Option<&str>) -> Result<Self, ProgramError> {
        let device = Device::select(preferred_vendor)?;
        println!("[gpu] using {} {}", device.vendor(), device.name());
        let program = Program::from_opencl(&device, kernels::KERNELS)?;
        Ok(Self { program })
    }

    pub fn matmul(
        &self,
        a: &[f32],
        b: &[f32],
        m: usize,
        n: usize,
        p: usize,
    ) -> Result<Vec<f32>, ProgramError> {
        let a_buf = self.program.create_buffer_from_slice(a)?;
        let b_buf = self.program.create_buffer_from_slice(b)?;
        let out_buf = self.program.create_buffer::<f32>(m * p)?;
        self.program
            .create_kernel("mat_mul", m * p)
            .arg(m as u32)
            .arg(n as u32)
            .arg(p as u32)
            .arg(&a_buf)
            .arg(&b_buf)
            .arg(&out_buf)
            .run()?;
        self.program.finish()?;
        let mut out = vec![0.; m * p];
        out_buf.read_into(&mut out)?;
        Ok(out)
    }

    pub fn row_softmax(&self, x: &[f32], rows: usize, cols: usize) -> Result<Vec<f32>, ProgramError> {
        let in_buf = self.program.create_buffer_from_slice(x)?;
        let out_buf = self.program.create_buffer::<f32>(rows * cols)?;
        self.program
            .create_kernel("row_softmax", rows)
            .arg(rows as u32)
            .arg(cols as u32)
            .arg(&in_buf)
            .arg(&out_buf)
            .run()?;
        self.program.finish()?;
        let mut out = vec![0.; rows * cols];
        out_buf.read_into(&mut out)?;
        Ok(out)
    }

    pub fn row_softmax_backward(
        &self,
        a: &[f32],
        da: &[f32],
        rows: usize,
        cols: usize,
    ) -> Result<Vec<f32>, ProgramError> {
        let a_buf = self.program.create_buffer_from_slice(a)?;
        let da_buf = self.program.create_buffer_from_slice(da)?;
        let out_buf = self.program.create_buffer::<f32>(rows * cols)?;
        self.program
            .create_kernel("row_softmax_backward", rows)
            .arg(rows as u32)
            .arg(cols as u32)
            .arg(&a_buf)
            .arg(&da_buf)
            .arg(&out_buf)
            .run()?;
        self.program.finish()?;
        let mut out = vec![0.; rows * cols];
        out_buf.read_into(&mut out)?;
        Ok(out)
    }

    pub fn transpose(&self, x: &[f32], rows: usize, cols: usize) -> Result<Vec<f32>, ProgramError> {
        let in_buf = self.program.create_buffer_from_slice(x)?;
        let out_buf = self.program.create_buffer::<f32>(rows * cols)?;
        self.program
            .create_kernel("transpose", rows * cols)
            .arg(rows as u32)
            .arg(cols as u32)
            .arg(&in_buf)
            .arg(&out_buf)
            .run()?;
        self.program.finish()?;
        let mut out = vec![0.; rows * cols];
        out_buf.read_into(&mut out)?;
        Ok(out)
    }

    pub fn scale_in_place(
        &self,
        x: &mut [f32],
        s: f32,
        rows: usize,
        cols: usize,
    ) -> Result<(), ProgramError> {
        let buf = self.program.create_buffer_from_slice(x)?;
        self.program
            .create_kernel("scale_in_place", rows * cols)
            .arg(&buf)
            .arg(s)
            .arg(rows as u32)
            .arg(cols as u32)
            .run()?;
        self.program.finish()?;
        buf.read_into(x)?;
        Ok(())
    }

    pub fn embedding_gather(
        &self,
        ids: &[usize],
        table: &[f32],
        dim: usize,
    ) -> Result<Vec<f32>, ProgramError> {
        let ids_i32: Vec<i32> = ids.iter().map(|t| *t as i32).collect();
        let ids_buf = self.program.create_buffer_from_slice(&ids_i32)?;
        let table_buf = self.program.create_buffer_from_slice(table)?;
        let out_buf = self.program.create_buffer::<f32>(ids.len() * dim)?;
        self.program
            .create_kernel("embedding_gather", ids.len())
            .arg(&ids_buf)
            .arg(&table_buf)
            .arg(&out_buf)
            .arg(dim as u32)
            .run()?;
        self.program.finish()?;
        let mut out = vec![0.; ids.len() * dim];
        out_buf.read_into(&mut out)?;
        Ok(out)
    }

    pub fn rotary(&self, buf: &mut [f32], rows: usize, dim: usize) -> Result<(), ProgramError> {
        let gpu_buf = self.program.create_buffer_from_slice(buf)?;
        self.program
            .create_kernel("rotary", rows)
            .arg(&gpu_buf)
            .arg(rows as u32)
            .arg(dim as u32)
            .run()?;
        self.program.finish()?;
        gpu_buf.read_into(buf)?;
        Ok(())
    }

    #[allow(clippy::type_complexity)]
    pub fn layer_norm_forward(
        &self,
        x: &[f32],
        rows: usize,
        cols: usize,
        eps: f32,
    ) -> Result<(Vec<f32>, Vec<f32>, Vec<f32>), ProgramError> {
        let x_buf = self.program.create_buffer_from_slice(x)?;
        let y_buf = self.program.create_buffer::<f32>(rows * cols)?;
        let mean_buf = self.program.create_buffer::<f32>(rows)?;
        let invstd_buf = self.program.create_buffer::<f32>(rows)?;
        self.program
            .create_kernel("layer_norm_forward", rows)
            .arg(&x_buf)
            .arg(&y_buf)
            .arg(&mean_buf)
            .arg(&invstd_buf)
            .arg(rows as u32)
            .arg(cols as u32)
            .arg(eps)
            .run()?;
        self.program.finish()?;
        let mut y = vec![0.; rows * cols];
        let mut mean = vec![0.; rows];
        let mut inv_std = vec![0.; rows];
        y_buf.read_into(&mut y)?;
        mean_buf.read_into(&mut mean)?;
        invstd_buf.read_into(&mut inv_std)?;
        Ok((y, mean, inv_std))
    }

    pub fn layer_norm_backward(
        &self,
        x: &[f32],
        dy: &[f32],
        mean: &[f32],
        inv_std: &[f32],
        rows: usize,
        cols: usize,
    ) -> Result<Vec<f32>, ProgramError> {
        let x_buf = self.program.create_buffer_from_slice(x)?;
        let dy_buf = self.program.create_buffer_from_slice(dy)?;
        let mean_buf = self.program.create_buffer_from_slice(mean)?;
        let invstd_buf = self.program.create_buffer_from_slice(inv_std)?;
        let dx_buf = self.program.create_buffer::<f32>(rows * cols)?;
        self.program
            .create_kernel("layer_norm_backward", rows)
            .arg(&x_buf)
            .arg(&dy_buf)
            .arg(&mean_buf)
            .arg(&invstd_buf)
            .arg(&dx_buf)
            .arg(rows as u32)
            .arg(cols as u32)
            .run()?;
        self.program.finish()?;
        let mut dx = vec![0.; rows * cols];
        dx_buf.read_into(&mut dx)?;
        Ok(dx)
    }
}
