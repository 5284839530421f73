//! CPU/GPU parity checks. These need a working OpenCL runtime, so they are
//! ignored by default; run with `cargo test --features gpu -- --ignored`.
#![cfg(feature = "gpu")]

use attogpt::device::cpu;
use attogpt::device::gpu::GpuContext;

fn assert_close(a: &[f32], b: &[f32]) {
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(b.iter()) {
        let scale = x.abs().max(y.abs()).max(1.);
        assert!(
            (x - y).abs() / scale < 1e-3,
            "mismatch: cpu {} vs gpu {}",
            x,
            y
        );
    }
}

fn inputs(n: usize, phase: f32) -> Vec<f32> {
    (0..n).map(|i| (i as f32 * phase).sin() * 2.).collect()
}

#[test]
#[ignore]
fn matmul_matches_cpu() {
    let gpu = GpuContext::new(None).unwrap();
    let a = inputs(6 * 5, 0.37);
    let b = inputs(5 * 4, 0.91);
    let gpu_out = gpu.matmul(&a, &b, 6, 5, 4).unwrap();
    assert_close(&cpu::matmul(&a, &b, 6, 5, 4), &gpu_out);
}

#[test]
#[ignore]
fn row_softmax_matches_cpu() {
    let gpu = GpuContext::new(None).unwrap();
    let x = inputs(4 * 9, 0.53);
    let gpu_out = gpu.row_softmax(&x, 4, 9).unwrap();
    assert_close(&cpu::row_softmax(&x, 4, 9), &gpu_out);
}

#[test]
#[ignore]
fn layer_norm_matches_cpu() {
    let gpu = GpuContext::new(None).unwrap();
    let x = inputs(3 * 8, 0.71);
    let dy = inputs(3 * 8, 1.13);

    let (y_c, mean_c, inv_c) = cpu::layer_norm_forward(&x, 3, 8, 1e-5);
    let (y_g, mean_g, inv_g) = gpu.layer_norm_forward(&x, 3, 8, 1e-5).unwrap();
    assert_close(&y_c, &y_g);
    assert_close(&mean_c, &mean_g);
    assert_close(&inv_c, &inv_g);

    let dx_c = cpu::layer_norm_backward(&x, &dy, &mean_c, &inv_c, 3, 8);
    let dx_g = gpu.layer_norm_backward(&x, &dy, &mean_g, &inv_g, 3, 8).unwrap();
    assert_close(&dx_c, &dx_g);
}
