//! Min-max linear quantization of embeddings to 8- or 16-bit codes.
//!
//! Quantized embeddings carry their own reconstruction metadata
//! (`scale`, `zero_point`, `bits`, `dimension`) and an FNV-1a checksum
//! for transport spot-checks. The checksum is not a security measure.

use crate::vector;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const FNV_OFFSET_BASIS: u32 = 0x811C_9DC5;
const FNV_PRIME: u32 = 0x0100_0193;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum QuantizeError {
    #[error("invalid quantization params: {0}")]
    InvalidParams(String),
    #[error("embedding contains non-finite value at index {0}")]
    NonFiniteInput(usize),
}

/// Code width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QuantBits {
    Eight,
    Sixteen,
}

impl QuantBits {
    /// Largest representable code (`2^bits - 1`).
    pub fn max_code(self) -> u32 {
        match self {
            QuantBits::Eight => u8::MAX as u32,
            QuantBits::Sixteen => u16::MAX as u32,
        }
    }

    /// Code used for constant-valued input.
    pub fn midpoint(self) -> u32 {
        self.max_code() / 2
    }

    pub fn as_u8(self) -> u8 {
        match self {
            QuantBits::Eight => 8,
            QuantBits::Sixteen => 16,
        }
    }
}

impl TryFrom<u8> for QuantBits {
    type Error = QuantizeError;

    fn try_from(bits: u8) -> Result<Self, Self::Error> {
        match bits {
            8 => Ok(QuantBits::Eight),
            16 => Ok(QuantBits::Sixteen),
            other => Err(QuantizeError::InvalidParams(format!(
                "unsupported bit width {other}; expected 8 or 16"
            ))),
        }
    }
}

impl From<QuantBits> for u8 {
    fn from(bits: QuantBits) -> u8 {
        bits.as_u8()
    }
}

/// Reconstruction metadata: `x' = code * scale + zero_point`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantParams {
    pub scale: f32,
    pub zero_point: f32,
    pub bits: QuantBits,
    pub dimension: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantizedBuffer {
    U8(Vec<u8>),
    U16(Vec<u16>),
}

impl QuantizedBuffer {
    pub fn len(&self) -> usize {
        match self {
            QuantizedBuffer::U8(b) => b.len(),
            QuantizedBuffer::U16(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bits(&self) -> QuantBits {
        match self {
            QuantizedBuffer::U8(_) => QuantBits::Eight,
            QuantizedBuffer::U16(_) => QuantBits::Sixteen,
        }
    }

    /// Codes widened to `u32`.
    pub fn codes(&self) -> Vec<u32> {
        match self {
            QuantizedBuffer::U8(b) => b.iter().map(|&c| c as u32).collect(),
            QuantizedBuffer::U16(b) => b.iter().map(|&c| c as u32).collect(),
        }
    }

    /// Raw bytes, little-endian for 16-bit codes.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            QuantizedBuffer::U8(b) => b.clone(),
            QuantizedBuffer::U16(b) => b.iter().flat_map(|c| c.to_le_bytes()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizedEmbedding {
    pub buffer: QuantizedBuffer,
    pub params: QuantParams,
}

impl QuantizedEmbedding {
    pub fn dequantize(&self) -> Result<Vec<f32>, QuantizeError> {
        dequantize(&self.buffer, &self.params)
    }

    /// FNV-1a over the little-endian code bytes.
    pub fn checksum(&self) -> u32 {
        fnv1a_32(&self.buffer.to_le_bytes())
    }
}

/// 32-bit FNV-1a hash.
pub fn fnv1a_32(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, &b| {
        (hash ^ b as u32).wrapping_mul(FNV_PRIME)
    })
}

/// Quantize an embedding with min-max linear scaling.
///
/// Constant-valued input fills the buffer with the midpoint code and uses
/// `scale = 1`, with the zero point shifted so the constant reconstructs
/// exactly.
pub fn quantize(values: &[f32], bits: QuantBits) -> Result<QuantizedEmbedding, QuantizeError> {
    if let Some(idx) = values.iter().position(|v| !v.is_finite()) {
        return Err(QuantizeError::NonFiniteInput(idx));
    }

    let max_code = bits.max_code();
    let (min, max) = values
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));

    let (codes, scale, zero_point): (Vec<u32>, f32, f32) = if values.is_empty() {
        (Vec::new(), 1.0, 0.0)
    } else if max == min {
        let mid = bits.midpoint();
        (vec![mid; values.len()], 1.0, min - mid as f32)
    } else {
        // f64 so a range spanning most of f32 does not overflow.
        let range = max as f64 - min as f64;
        let scale = (range / max_code as f64) as f32;
        if !scale.is_finite() || scale <= 0.0 {
            return Err(QuantizeError::InvalidParams(format!(
                "range {range} gives unusable scale {scale}"
            )));
        }
        let step = scale as f64;
        let codes = values
            .iter()
            .map(|&v| {
                ((v as f64 - min as f64) / step)
                    .round()
                    .clamp(0.0, max_code as f64) as u32
            })
            .collect();
        (codes, scale, min)
    };

    let buffer = match bits {
        QuantBits::Eight => QuantizedBuffer::U8(codes.into_iter().map(|c| c as u8).collect()),
        QuantBits::Sixteen => QuantizedBuffer::U16(codes.into_iter().map(|c| c as u16).collect()),
    };

    Ok(QuantizedEmbedding {
        buffer,
        params: QuantParams {
            scale,
            zero_point,
            bits,
            dimension: values.len(),
        },
    })
}

/// Reconstruct an embedding from codes and params.
pub fn dequantize(
    buffer: &QuantizedBuffer,
    params: &QuantParams,
) -> Result<Vec<f32>, QuantizeError> {
    if buffer.len() != params.dimension {
        return Err(QuantizeError::InvalidParams(format!(
            "buffer length {} does not match dimension {}",
            buffer.len(),
            params.dimension
        )));
    }
    if buffer.bits() != params.bits {
        return Err(QuantizeError::InvalidParams(format!(
            "{}-bit buffer with {}-bit params",
            buffer.bits().as_u8(),
            params.bits.as_u8()
        )));
    }
    if !params.scale.is_finite() || params.scale <= 0.0 {
        return Err(QuantizeError::InvalidParams(format!("scale {}", params.scale)));
    }
    if !params.zero_point.is_finite() {
        return Err(QuantizeError::InvalidParams(format!(
            "zero point {}",
            params.zero_point
        )));
    }

    Ok(buffer
        .codes()
        .into_iter()
        .map(|c| (c as f64 * params.scale as f64 + params.zero_point as f64) as f32)
        .collect())
}

/// Root-mean-square reconstruction error. Diagnostic only.
pub fn estimate_error(values: &[f32], bits: QuantBits) -> Result<f32, QuantizeError> {
    if values.is_empty() {
        return Ok(0.0);
    }
    let restored = quantize(values, bits)?.dequantize()?;
    let mse = values
        .iter()
        .zip(restored.iter())
        .map(|(a, b)| (a - b).powi(2))
        .sum::<f32>()
        / values.len() as f32;
    Ok(mse.sqrt())
}

/// Cosine similarity between the original and round-tripped embedding,
/// as a percentage in [0, 100]. Diagnostic only.
pub fn accuracy_percent(values: &[f32], bits: QuantBits) -> Result<f32, QuantizeError> {
    let restored = quantize(values, bits)?.dequantize()?;
    let cos = vector::cosine_similarity(values, &restored, false)
        .map_err(|e| QuantizeError::InvalidParams(e.to_string()))?;
    Ok((cos.max(0.0) * 100.0).min(100.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::cosine_similarity;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_embedding(seed: u64, dim: usize) -> Vec<f32> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..dim).map(|_| rng.gen_range(-1.0f32..=1.0)).collect()
    }

    #[test]
    fn test_five_point_roundtrip_8bit() {
        let x = [-1.0, -0.5, 0.0, 0.5, 1.0];
        let q = quantize(&x, QuantBits::Eight).unwrap();
        let codes = q.buffer.codes();
        assert_eq!(codes[0], 0);
        assert_eq!(codes[4], 255);
        assert_ne!(codes[1], codes[2]);
        assert_ne!(codes[2], codes[3]);

        let restored = q.dequantize().unwrap();
        assert!(cosine_similarity(&x, &restored, true).unwrap() > 0.99);
    }

    #[test]
    fn test_random_512_accuracy_8bit() {
        for seed in 0..5 {
            let x = random_embedding(seed, 512);
            let restored = quantize(&x, QuantBits::Eight).unwrap().dequantize().unwrap();
            let sim = cosine_similarity(&x, &restored, false).unwrap();
            assert!(sim > 0.99, "seed {seed}: {sim}");
        }
    }

    #[test]
    fn test_random_512_accuracy_16bit() {
        for seed in 0..5 {
            let x = random_embedding(seed, 512);
            let restored = quantize(&x, QuantBits::Sixteen).unwrap().dequantize().unwrap();
            let sim = cosine_similarity(&x, &restored, false).unwrap();
            assert!(sim > 0.999, "seed {seed}: {sim}");
        }
    }

    #[test]
    fn test_error_shrinks_with_bits() {
        let x = random_embedding(42, 512);
        let e8 = estimate_error(&x, QuantBits::Eight).unwrap();
        let e16 = estimate_error(&x, QuantBits::Sixteen).unwrap();
        assert!(e16 < e8);
        // Bounded by half a quantization step.
        assert!(e8 <= 2.0 / 255.0 / 2.0 + 1e-6);
    }

    #[test]
    fn test_constant_vector_roundtrips() {
        let x = vec![0.25f32; 16];
        for bits in [QuantBits::Eight, QuantBits::Sixteen] {
            let q = quantize(&x, bits).unwrap();
            assert_eq!(q.params.scale, 1.0);
            assert!(q.buffer.codes().iter().all(|&c| c == bits.midpoint()));
            let restored = q.dequantize().unwrap();
            for v in restored {
                assert!((v - 0.25).abs() <= q.params.scale);
            }
        }
    }

    #[test]
    fn test_wide_finite_range_stays_finite() {
        let values = [-3.0e38f32, 0.0, 3.0e38];
        for bits in [QuantBits::Eight, QuantBits::Sixteen] {
            let q = quantize(&values, bits).unwrap();
            assert!(q.params.scale.is_finite() && q.params.scale > 0.0);
            let restored = q.dequantize().unwrap();
            assert!(restored.iter().all(|v| v.is_finite()));
            assert!((restored[0] - values[0]).abs() / 3.0e38 < 1e-6);
            assert!((restored[2] - values[2]).abs() / 3.0e38 < 1e-6);
            assert!(restored[1].abs() <= q.params.scale);
        }
    }

    #[test]
    fn test_subnormal_range_rejected() {
        let tiny = f32::from_bits(1);
        let err = quantize(&[0.0, tiny], QuantBits::Sixteen).unwrap_err();
        assert!(matches!(err, QuantizeError::InvalidParams(_)));
    }

    #[test]
    fn test_empty_vector() {
        let q = quantize(&[], QuantBits::Eight).unwrap();
        assert_eq!(q.params.dimension, 0);
        assert!(q.dequantize().unwrap().is_empty());
    }

    #[test]
    fn test_non_finite_input_rejected() {
        assert_eq!(
            quantize(&[0.0, f32::NAN], QuantBits::Eight),
            Err(QuantizeError::NonFiniteInput(1))
        );
    }

    #[test]
    fn test_dequantize_rejects_length_mismatch() {
        let mut q = quantize(&[0.1, 0.2, 0.3], QuantBits::Eight).unwrap();
        q.params.dimension = 4;
        assert!(matches!(q.dequantize(), Err(QuantizeError::InvalidParams(_))));
    }

    #[test]
    fn test_dequantize_rejects_bad_scale_and_width() {
        let q = quantize(&[0.1, 0.2, 0.3], QuantBits::Eight).unwrap();
        let mut bad_scale = q.params;
        bad_scale.scale = 0.0;
        assert!(dequantize(&q.buffer, &bad_scale).is_err());

        let mut bad_width = q.params;
        bad_width.bits = QuantBits::Sixteen;
        assert!(dequantize(&q.buffer, &bad_width).is_err());
    }

    #[test]
    fn test_bits_serde() {
        assert_eq!(serde_json::to_string(&QuantBits::Sixteen).unwrap(), "16");
        assert_eq!(serde_json::from_str::<QuantBits>("8").unwrap(), QuantBits::Eight);
        assert!(serde_json::from_str::<QuantBits>("12").is_err());
    }

    #[test]
    fn test_fnv1a_known_vectors() {
        assert_eq!(fnv1a_32(b""), 0x811C_9DC5);
        assert_eq!(fnv1a_32(b"a"), 0xE40C_292C);
    }

    #[test]
    fn test_checksum_detects_tamper() {
        let mut q = quantize(&random_embedding(3, 64), QuantBits::Eight).unwrap();
        let before = q.checksum();
        if let QuantizedBuffer::U8(ref mut codes) = q.buffer {
            codes[10] ^= 0x01;
        }
        assert_ne!(before, q.checksum());
    }

    #[test]
    fn test_accuracy_percent_range() {
        let x = random_embedding(9, 512);
        let acc = accuracy_percent(&x, QuantBits::Eight).unwrap();
        assert!(acc > 99.0 && acc <= 100.0);
    }
}
