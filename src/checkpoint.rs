//! Binary weight persistence.
//!
//! The canonical format opens with the magic `DARA-GPT` followed by a version
//! tag; each version gets its own reader and loads are refused for unknown
//! tags rather than silently migrated. An older `MODBIN` container is still
//! readable: it predates learnable norm parameters and the head bias, so
//! those keep their freshly initialized values after a legacy load.
//!
//! Everything is little-endian. A save/load round trip reproduces every
//! weight bit-for-bit.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use thiserror::Error;

use crate::config::Config;
use crate::layers::{FeedForward, LayerNorm, Linear, MultiHeadAttention, TransformerBlock};
use crate::model::GptModel;
use crate::tensor::{Tensor, TensorError};

const MAGIC: &[u8; 8] = b"DARA-GPT";
const LEGACY_MAGIC: &[u8; 6] = b"MODBIN";
const VERSION: i32 = 1;

/// Learning rate assumed for legacy containers, which carry none.
const LEGACY_LEARNING_RATE: f32 = 0.01;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a recognized checkpoint file (bad magic)")]
    BadMagic,
    #[error("unsupported checkpoint version: {0}")]
    UnsupportedVersion(i32),
    #[error("malformed checkpoint: {0}")]
    Tensor(#[from] TensorError),
}

pub fn save<W: Write>(model: &GptModel, w: &mut W) -> Result<(), CheckpointError> {
    w.write_all(MAGIC)?;
    write_i32(w, VERSION)?;

    let cfg = &model.config;
    write_i32(w, cfg.vocab_size as i32)?;
    write_i32(w, cfg.d_model as i32)?;
    write_i32(w, cfg.num_heads as i32)?;
    write_i32(w, cfg.num_layers as i32)?;
    write_i32(w, cfg.context_size as i32)?;
    write_f32(w, cfg.learning_rate)?;

    write_matrix(w, &model.embedding)?;
    write_matrix(w, &model.head.weight)?;
    write_vector(w, &model.head.bias)?;

    write_i32(w, model.blocks.len() as i32)?;
    for block in &model.blocks {
        write_matrix(w, &block.attn.wq)?;
        write_matrix(w, &block.attn.wk)?;
        write_matrix(w, &block.attn.wv)?;
        write_matrix(w, &block.attn.wo)?;
        write_matrix(w, &block.ffn.w1)?;
        write_matrix(w, &block.ffn.w2)?;
        write_vector(w, &block.norm1.gamma)?;
        write_vector(w, &block.norm1.beta)?;
        write_vector(w, &block.norm2.gamma)?;
        write_vector(w, &block.norm2.beta)?;
    }
    Ok(())
}

pub fn load<R: Read>(r: &mut R) -> Result<GptModel, CheckpointError> {
    let mut first = [0u8; 1];
    r.read_exact(&mut first)?;

    // The upstream writer emits the legacy magic as a length-prefixed
    // string, so a real legacy file opens with 0x06 before "MODBIN". Bare
    // "MODBIN" is accepted as well.
    if first[0] == LEGACY_MAGIC.len() as u8 {
        let mut magic = [0u8; 6];
        r.read_exact(&mut magic)?;
        if &magic == LEGACY_MAGIC {
            return load_legacy(r);
        }
        return Err(CheckpointError::BadMagic);
    }

    let mut head = [0u8; 6];
    head[0] = first[0];
    r.read_exact(&mut head[1..])?;
    if &head == LEGACY_MAGIC {
        return load_legacy(r);
    }
    let mut tail = [0u8; 2];
    r.read_exact(&mut tail)?;
    let mut magic = [0u8; 8];
    magic[..6].copy_from_slice(&head);
    magic[6..].copy_from_slice(&tail);
    if &magic != MAGIC {
        return Err(CheckpointError::BadMagic);
    }
    match read_i32(r)? {
        1 => load_v1(r),
        v => Err(CheckpointError::UnsupportedVersion(v)),
    }
}

pub fn save_file<P: AsRef<Path>>(model: &GptModel, path: P) -> Result<(), CheckpointError> {
    let mut w = BufWriter::new(File::create(path)?);
    save(model, &mut w)?;
    w.flush()?;
    Ok(())
}

pub fn load_file<P: AsRef<Path>>(path: P) -> Result<GptModel, CheckpointError> {
    load(&mut BufReader::new(File::open(path)?))
}

fn load_v1<R: Read>(r: &mut R) -> Result<GptModel, CheckpointError> {
    let vocab_size = read_i32(r)? as usize;
    let d_model = read_i32(r)? as usize;
    let num_heads = read_i32(r)? as usize;
    let num_layers = read_i32(r)? as usize;
    let context_size = read_i32(r)? as usize;
    let learning_rate = read_f32(r)?;

    let embedding = read_matrix(r)?;
    embedding.expect_shape(&[vocab_size, d_model])?;
    let head_weight = read_matrix(r)?;
    let head_bias = read_vector(r)?;
    let head = Linear::from_weights(head_weight, head_bias)?;

    let layer_count = read_i32(r)? as usize;
    let mut blocks = Vec::with_capacity(layer_count);
    for _ in 0..layer_count {
        let wq = read_matrix(r)?;
        let wk = read_matrix(r)?;
        let wv = read_matrix(r)?;
        let wo = read_matrix(r)?;
        let attn = MultiHeadAttention::from_weights(num_heads, wq, wk, wv, wo)?;
        let ffn = FeedForward::from_weights(read_matrix(r)?, read_matrix(r)?)?;
        let norm1 = LayerNorm::from_weights(read_vector(r)?, read_vector(r)?)?;
        let norm2 = LayerNorm::from_weights(read_vector(r)?, read_vector(r)?)?;
        blocks.push(TransformerBlock {
            attn,
            ffn,
            norm1,
            norm2,
        });
    }

    Ok(GptModel {
        config: Config {
            vocab_size,
            d_model,
            num_heads,
            num_layers,
            context_size,
            learning_rate,
            device_preference: None,
        },
        embedding,
        blocks,
        head,
    })
}

/// Legacy container: header, raw embedding floats, per-block projection
/// matrices and a bias-less `[d_model × vocab]` head.
fn load_legacy<R: Read>(r: &mut R) -> Result<GptModel, CheckpointError> {
    let vocab_size = read_i32(r)? as usize;
    let d_model = read_i32(r)? as usize;
    let num_heads = read_i32(r)? as usize;
    let context_size = read_i32(r)? as usize;

    let emb_vocab = read_i32(r)? as usize;
    let emb_dim = read_i32(r)? as usize;
    let embedding = Tensor::raw(&[emb_vocab, emb_dim], read_floats(r, emb_vocab * emb_dim)?)?;
    embedding.expect_shape(&[vocab_size, d_model])?;

    let block_count = read_i32(r)? as usize;
    let mut blocks = Vec::with_capacity(block_count);
    for _ in 0..block_count {
        let wq = read_matrix(r)?;
        let wk = read_matrix(r)?;
        let wv = read_matrix(r)?;
        let wo = read_matrix(r)?;
        let attn = MultiHeadAttention::from_weights(num_heads, wq, wk, wv, wo)?;
        let ffn = FeedForward::from_weights(read_matrix(r)?, read_matrix(r)?)?;
        blocks.push(TransformerBlock {
            attn,
            ffn,
            norm1: LayerNorm::new(d_model),
            norm2: LayerNorm::new(d_model),
        });
    }

    // Stored as [d_model × vocab] in x·W orientation.
    let head_matrix = read_matrix(r)?;
    head_matrix.expect_shape(&[d_model, vocab_size])?;
    let mut weight = vec![0.; d_model * vocab_size];
    for i in 0..d_model {
        for j in 0..vocab_size {
            weight[j * d_model + i] = head_matrix.blob()[i * vocab_size + j];
        }
    }
    let head = Linear::from_weights(
        Tensor::raw(&[vocab_size, d_model], weight)?,
        Tensor::zeros(&[vocab_size]),
    )?;

    Ok(GptModel {
        config: Config {
            vocab_size,
            d_model,
            num_heads,
            num_layers: block_count,
            context_size,
            learning_rate: LEGACY_LEARNING_RATE,
            device_preference: None,
        },
        embedding,
        blocks,
        head,
    })
}

fn write_i32<W: Write>(w: &mut W, v: i32) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_f32<W: Write>(w: &mut W, v: f32) -> std::io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_matrix<W: Write>(w: &mut W, t: &Tensor) -> std::io::Result<()> {
    write_i32(w, t.shape()[0] as i32)?;
    write_i32(w, t.shape()[1] as i32)?;
    for v in t.blob() {
        write_f32(w, *v)?;
    }
    Ok(())
}

fn write_vector<W: Write>(w: &mut W, t: &Tensor) -> std::io::Result<()> {
    write_i32(w, t.size() as i32)?;
    for v in t.blob() {
        write_f32(w, *v)?;
    }
    Ok(())
}

fn read_i32<R: Read>(r: &mut R) -> std::io::Result<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

fn read_f32<R: Read>(r: &mut R) -> std::io::Result<f32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(f32::from_le_bytes(buf))
}

fn read_floats<R: Read>(r: &mut R, len: usize) -> std::io::Result<Vec<f32>> {
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        out.push(read_f32(r)?);
    }
    Ok(out)
}

fn read_matrix<R: Read>(r: &mut R) -> Result<Tensor, CheckpointError> {
    let rows = read_i32(r)? as usize;
    let cols = read_i32(r)? as usize;
    Ok(Tensor::raw(&[rows, cols], read_floats(r, rows * cols)?)?)
}

fn read_vector<R: Read>(r: &mut R) -> Result<Tensor, CheckpointError> {
    let len = read_i32(r)? as usize;
    Ok(Tensor::raw(&[len], read_floats(r, len)?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn sample_model(seed: u64) -> GptModel {
        GptModel::new(
            &mut StdRng::seed_from_u64(seed),
            Config {
                vocab_size: 11,
                d_model: 8,
                num_heads: 2,
                num_layers: 2,
                context_size: 16,
                learning_rate: 0.02,
                device_preference: None,
            },
        )
    }

    #[test]
    fn round_trip_is_bit_exact() {
        let model = sample_model(77);
        let mut buf = Vec::new();
        save(&model, &mut buf).unwrap();
        let loaded = load(&mut buf.as_slice()).unwrap();

        assert_eq!(loaded.config, model.config);
        assert_eq!(loaded.embedding, model.embedding);
        assert_eq!(loaded.head.weight, model.head.weight);
        assert_eq!(loaded.head.bias, model.head.bias);
        for (a, b) in loaded.blocks.iter().zip(model.blocks.iter()) {
            assert_eq!(a.attn.wq, b.attn.wq);
            assert_eq!(a.attn.wo, b.attn.wo);
            assert_eq!(a.ffn.w1, b.ffn.w1);
            assert_eq!(a.norm1.gamma, b.norm1.gamma);
            assert_eq!(a.norm2.beta, b.norm2.beta);
        }
    }

    #[test]
    fn bad_magic_is_fatal() {
        let err = load(&mut &b"NOT-A-MODEL-FILE"[..]).unwrap_err();
        assert!(matches!(err, CheckpointError::BadMagic));
    }

    #[test]
    fn unknown_version_is_refused() {
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&99i32.to_le_bytes());
        let err = load(&mut buf.as_slice()).unwrap_err();
        assert!(matches!(err, CheckpointError::UnsupportedVersion(99)));
    }

    // Hand-rolls a legacy file from the model's weights. The upstream
    // writer length-prefixes the magic string; both spellings must load.
    fn legacy_bytes(model: &GptModel, length_prefixed: bool) -> Vec<u8> {
        let cfg = &model.config;
        let mut buf = Vec::new();
        if length_prefixed {
            buf.push(LEGACY_MAGIC.len() as u8);
        }
        buf.extend_from_slice(LEGACY_MAGIC);
        for v in [
            cfg.vocab_size,
            cfg.d_model,
            cfg.num_heads,
            cfg.context_size,
            cfg.vocab_size,
            cfg.d_model,
        ] {
            buf.extend_from_slice(&(v as i32).to_le_bytes());
        }
        for v in model.embedding.blob() {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        buf.extend_from_slice(&(model.blocks.len() as i32).to_le_bytes());
        let mat = |buf: &mut Vec<u8>, t: &Tensor| {
            buf.extend_from_slice(&(t.shape()[0] as i32).to_le_bytes());
            buf.extend_from_slice(&(t.shape()[1] as i32).to_le_bytes());
            for v in t.blob() {
                buf.extend_from_slice(&v.to_le_bytes());
            }
        };
        for block in &model.blocks {
            mat(&mut buf, &block.attn.wq);
            mat(&mut buf, &block.attn.wk);
            mat(&mut buf, &block.attn.wv);
            mat(&mut buf, &block.attn.wo);
            mat(&mut buf, &block.ffn.w1);
            mat(&mut buf, &block.ffn.w2);
        }
        // Legacy head is [d_model × vocab] in x·W orientation.
        let mut legacy_head = vec![0.; cfg.d_model * cfg.vocab_size];
        for o in 0..cfg.vocab_size {
            for i in 0..cfg.d_model {
                legacy_head[i * cfg.vocab_size + o] = model.head.weight.blob()[o * cfg.d_model + i];
            }
        }
        mat(
            &mut buf,
            &Tensor::raw(&[cfg.d_model, cfg.vocab_size], legacy_head).unwrap(),
        );
        buf
    }

    #[test]
    fn legacy_container_loads_with_fresh_norms() {
        let model = sample_model(5);
        let cfg = &model.config;
        let buf = legacy_bytes(&model, false);

        let loaded = load(&mut buf.as_slice()).unwrap();
        assert_eq!(loaded.embedding, model.embedding);
        assert_eq!(loaded.blocks[0].attn.wq, model.blocks[0].attn.wq);
        assert_eq!(loaded.head.weight, model.head.weight);
        // What the legacy format cannot carry stays initialized.
        assert_eq!(loaded.blocks[0].norm1.gamma, Tensor::ones(&[cfg.d_model]));
        assert_eq!(loaded.head.bias, Tensor::zeros(&[cfg.vocab_size]));
        assert_eq!(loaded.config.learning_rate, LEGACY_LEARNING_RATE);
    }

    #[test]
    fn length_prefixed_legacy_magic_loads() {
        let model = sample_model(5);
        let buf = legacy_bytes(&model, true);
        let loaded = load(&mut buf.as_slice()).unwrap();
        assert_eq!(loaded.embedding, model.embedding);
        assert_eq!(loaded.blocks[0].ffn.w2, model.blocks[0].ffn.w2);
    }
}
