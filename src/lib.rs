//! **attogpt** is a pure Rust implementation of a minimal decoder-only
//! transformer language-model, trainable on both **CPUs** and **GPUs**.
//!
//! Everything numerical is implemented from scratch: the tensor math, the
//! layers, and the backward pass of every layer, derived by hand rather
//! than traced through an autodiff graph. The same layer code
//! drives two execution backends: a rayon-parallel CPU reference path and an
//! OpenCL kernel set (enable the `gpu` feature). If a GPU is requested but
//! unavailable, or any kernel fails mid-run, the engine transparently falls
//! back to the CPU path for the rest of the session; callers never see
//! backend errors.
//!
//! ## Usage
//!
//! Put training text into `dataset.txt` and run:
//!
//! ```example
//! cargo run --release
//! ```
//!
//! (Add `--features gpu` and optionally a vendor substring argument, e.g.
//! `cargo run --release --features gpu -- NVIDIA`, to train on a GPU.)
//!
//! Tokenization is out of scope: the binary trains byte-level for
//! simplicity, but the library accepts any `usize` token-id sequences along
//! with a vocabulary size. Trained weights round-trip bit-for-bit through
//! the binary checkpoint format in [`checkpoint`].
//!
//! Correctness of the hand-derived gradients is checked in the test suite
//! with the finite-difference method.

pub mod checkpoint;
pub mod config;
pub mod device;
pub mod layers;
pub mod loss;
pub mod model;
pub mod optimizer;
pub mod tensor;
pub mod trainer;
