use serde::{Deserialize, Serialize};

/// Model hyperparameters plus the device preference used at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub vocab_size: usize,
    pub d_model: usize,
    pub num_heads: usize,
    pub num_layers: usize,
    pub context_size: usize,
    pub learning_rate: f32,
    /// Case-insensitive substring matched against GPU vendor/name strings.
    pub device_preference: Option<String>,
}
