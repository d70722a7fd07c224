use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};

/// Largest magnitude any non-dropped component of a unit quaternion can take.
pub const QUAT_COMPONENT_LIMIT: f32 = std::f32::consts::FRAC_1_SQRT_2;

/// Encoded size of a smallest-three quaternion: axis byte + 3×u16.
pub const COMPRESSED_QUAT_BYTES: usize = 7;

/// Range used for the 2-byte scale field.
pub const SCALE_MIN: f32 = 0.0;
pub const SCALE_MAX: f32 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3 { x: 0.0, y: 0.0, z: 0.0 };

    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    /// Replaces non-finite components with zero.
    pub fn sanitized(self) -> Self {
        let fix = |v: f32| if v.is_finite() { v } else { 0.0 };
        Self::new(fix(self.x), fix(self.y), fix(self.z))
    }

    pub fn distance_squared(&self, other: &Vec3) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        dx * dx + dy * dy + dz * dz
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quat {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Default for Quat {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Quat {
    pub const IDENTITY: Quat = Quat { x: 0.0, y: 0.0, z: 0.0, w: 1.0 };

    pub fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self { x, y, z, w }
    }

    pub fn length_squared(&self) -> f32 {
        self.x * self.x + self.y * self.y + self.z * self.z + self.w * self.w
    }

    pub fn dot(&self, other: &Quat) -> f32 {
        self.x * other.x + self.y * other.y + self.z * other.z + self.w * other.w
    }

    /// Normalized copy; non-finite or degenerate input becomes the identity.
    pub fn sanitized(self) -> Self {
        let finite = self.x.is_finite() && self.y.is_finite() && self.z.is_finite() && self.w.is_finite();
        let len_sq = self.length_squared();
        if !finite || !len_sq.is_finite() || len_sq <= f32::EPSILON {
            return Self::IDENTITY;
        }
        let inv = len_sq.sqrt().recip();
        Self::new(self.x * inv, self.y * inv, self.z * inv, self.w * inv)
    }

    fn components(&self) -> [f32; 4] {
        [self.x, self.y, self.z, self.w]
    }

    fn from_components(c: [f32; 4]) -> Self {
        Self::new(c[0], c[1], c[2], c[3])
    }
}

/// Maps `value` onto 65536 evenly spaced steps across `[min, max]`.
pub fn quantize(value: f32, min: f32, max: f32) -> u16 {
    quantize_bits(value, min, max, 16) as u16
}

pub fn dequantize(code: u16, min: f32, max: f32) -> f32 {
    dequantize_bits(code as u32, min, max, 16)
}

/// Largest code representable in `bits` bits.
pub fn max_code(bits: u32) -> u32 {
    match bits {
        0 => 0,
        b if b >= 32 => u32::MAX,
        _ => (1u32 << bits) - 1,
    }
}

/// Generalized quantizer for the variable-width muscle channels.
pub fn quantize_bits(value: f32, min: f32, max: f32, bits: u32) -> u32 {
    let steps = max_code(bits) as f64;
    if steps == 0.0 || !(max > min) {
        return 0;
    }
    let clamped = value.clamp(min, max) as f64;
    let normalized = (clamped - min as f64) / (max as f64 - min as f64);
    // NaN falls through the clamp and saturates to 0 here.
    (normalized * steps).round().clamp(0.0, steps) as u32
}

pub fn dequantize_bits(code: u32, min: f32, max: f32, bits: u32) -> f32 {
    let steps = max_code(bits) as f64;
    if steps == 0.0 {
        return min;
    }
    let code = (code as f64).min(steps);
    (min as f64 + code / steps * (max as f64 - min as f64)) as f32
}

pub fn quantize_scale(scale: f32) -> u16 {
    let scale = if scale.is_finite() { scale } else { 1.0 };
    quantize(scale, SCALE_MIN, SCALE_MAX)
}

pub fn dequantize_scale(code: u16) -> f32 {
    dequantize(code, SCALE_MIN, SCALE_MAX)
}

/// Smallest-three quaternion: index of the dropped largest component plus the
/// remaining three quantized over `[-1/√2, 1/√2]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressedQuat {
    pub axis: u8,
    pub values: [u16; 3],
}

impl CompressedQuat {
    pub fn compress(rotation: Quat) -> Self {
        let mut c = rotation.sanitized().components();

        let mut axis = 0;
        for i in 1..4 {
            if c[i].abs() > c[axis].abs() {
                axis = i;
            }
        }

        // The decoder always rebuilds the dropped component as non-negative.
        if c[axis] < 0.0 {
            for v in c.iter_mut() {
                *v = -*v;
            }
        }

        let mut values = [0u16; 3];
        let mut slot = 0;
        for (i, v) in c.iter().enumerate() {
            if i == axis {
                continue;
            }
            values[slot] = quantize(*v, -QUAT_COMPONENT_LIMIT, QUAT_COMPONENT_LIMIT);
            slot += 1;
        }

        Self { axis: axis as u8, values }
    }

    /// Rebuilds the quaternion. With a tolerance, rejects input whose
    /// reconstructed length² differs from 1 by more than that amount.
    pub fn decompress(&self, tolerance: Option<f32>) -> Result<Quat> {
        let axis = self.axis as usize;
        if axis > 3 {
            return Err(RelayError::InvalidQuaternionAxis(self.axis));
        }

        let mut c = [0.0f32; 4];
        let mut sum_sq = 0.0f32;
        let mut slot = 0;
        for (i, out) in c.iter_mut().enumerate() {
            if i == axis {
                continue;
            }
            let v = dequantize(self.values[slot], -QUAT_COMPONENT_LIMIT, QUAT_COMPONENT_LIMIT);
            *out = v;
            sum_sq += v * v;
            slot += 1;
        }
        c[axis] = (1.0 - sum_sq).max(0.0).sqrt();

        let length_sq = sum_sq + c[axis] * c[axis];
        if let Some(tolerance) = tolerance {
            if (length_sq - 1.0).abs() > tolerance {
                return Err(RelayError::NonUnitQuaternion { length_sq, tolerance });
            }
        }

        Ok(Quat::from_components(c).sanitized())
    }

    pub fn write_to(&self, out: &mut [u8]) {
        out[0] = self.axis;
        for (i, v) in self.values.iter().enumerate() {
            out[1 + i * 2..3 + i * 2].copy_from_slice(&v.to_le_bytes());
        }
    }

    pub fn read_from(data: &[u8]) -> Result<Self> {
        if data.len() < COMPRESSED_QUAT_BYTES {
            return Err(RelayError::BitRange {
                offset: 0,
                width: (COMPRESSED_QUAT_BYTES * 8) as u32,
                available: data.len() * 8,
            });
        }
        let word = |i: usize| u16::from_le_bytes([data[1 + i * 2], data[2 + i * 2]]);
        Ok(Self {
            axis: data[0],
            values: [word(0), word(1), word(2)],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn test_quantize_endpoints() {
        assert_eq!(quantize(-1.0, -1.0, 1.0), 0);
        assert_eq!(quantize(1.0, -1.0, 1.0), u16::MAX);
        assert_eq!(quantize(5.0, -1.0, 1.0), u16::MAX);
        assert_eq!(quantize(-5.0, -1.0, 1.0), 0);
        assert_eq!(quantize(f32::NAN, -1.0, 1.0), 0);
        assert_eq!(dequantize(0, -1.0, 1.0), -1.0);
        assert_eq!(dequantize(u16::MAX, -1.0, 1.0), 1.0);
    }

    #[test]
    fn test_degenerate_bounds() {
        assert_eq!(quantize_bits(0.5, f32::NAN, 1.0, 8), 0);
        assert_eq!(quantize_bits(0.5, 0.0, f32::NAN, 8), 0);
        assert_eq!(quantize_bits(0.5, 1.0, 1.0, 8), 0);
        assert_eq!(quantize_bits(0.5, 2.0, -2.0, 8), 0);
    }

    #[test]
    fn test_scale_round_trip() {
        let step = (SCALE_MAX - SCALE_MIN) / 65535.0;
        let restored = dequantize_scale(quantize_scale(1.0));
        assert!((restored - 1.0).abs() <= step);
        assert!((dequantize_scale(quantize_scale(f32::INFINITY)) - 1.0).abs() <= step);
    }

    #[test]
    fn test_sanitize_non_finite() {
        let p = Vec3::new(f32::NAN, 2.0, f32::NEG_INFINITY).sanitized();
        assert_eq!(p, Vec3::new(0.0, 2.0, 0.0));

        let q = Quat::new(f32::NAN, 0.0, 0.0, 1.0).sanitized();
        assert_eq!(q, Quat::IDENTITY);
        assert_eq!(Quat::new(0.0, 0.0, 0.0, 0.0).sanitized(), Quat::IDENTITY);
    }

    #[test]
    fn test_identity_quaternion() {
        let compressed = CompressedQuat::compress(Quat::IDENTITY);
        assert_eq!(compressed.axis, 3);
        let restored = compressed.decompress(Some(0.02)).unwrap();
        assert!(restored.dot(&Quat::IDENTITY) > 0.999);
    }

    #[test]
    fn test_negative_dropped_component_flips_sign() {
        let q = Quat::new(0.1, 0.2, 0.1, -0.9).sanitized();
        let restored = CompressedQuat::compress(q).decompress(Some(0.02)).unwrap();
        assert!(restored.w >= 0.0);
        assert!(restored.dot(&q) < -0.999);
    }

    #[test]
    fn test_random_quaternion_bound() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..10_000 {
            let q = Quat::new(
                rng.gen_range(-1.0f32..1.0),
                rng.gen_range(-1.0f32..1.0),
                rng.gen_range(-1.0f32..1.0),
                rng.gen_range(-1.0f32..1.0),
            )
            .sanitized();

            let restored = CompressedQuat::compress(q).decompress(Some(0.02)).unwrap();
            // q and -q encode the same rotation.
            assert!(restored.dot(&q).abs() > 0.999);
            assert!((restored.length_squared() - 1.0).abs() < 0.02);
        }
    }

    #[test]
    fn test_strict_reader_rejects_bad_input() {
        let bogus = CompressedQuat { axis: 3, values: [u16::MAX; 3] };
        assert!(matches!(
            bogus.decompress(Some(0.02)),
            Err(RelayError::NonUnitQuaternion { .. })
        ));
        assert!(bogus.decompress(None).is_ok());

        let bad_axis = CompressedQuat { axis: 4, values: [0; 3] };
        assert!(matches!(
            bad_axis.decompress(None),
            Err(RelayError::InvalidQuaternionAxis(4))
        ));
    }

    #[test]
    fn test_compressed_bytes() {
        let compressed = CompressedQuat::compress(Quat::new(0.5, -0.5, 0.5, 0.5));
        let mut buf = [0u8; COMPRESSED_QUAT_BYTES];
        compressed.write_to(&mut buf);
        assert_eq!(CompressedQuat::read_from(&buf).unwrap(), compressed);
        assert!(CompressedQuat::read_from(&buf[..6]).is_err());
    }

    proptest! {
        #[test]
        fn quantize_within_one_step(v in -3.0f32..=3.0) {
            let (min, max) = (-3.0f32, 3.0f32);
            let step = (max - min) / 65535.0;
            let restored = dequantize(quantize(v, min, max), min, max);
            prop_assert!((restored - v).abs() <= step);
        }

        #[test]
        fn quantize_bits_within_one_step(v in -1.5f32..=1.5, bits in 1u32..=18) {
            let step = 3.0 / max_code(bits) as f32;
            let restored = dequantize_bits(quantize_bits(v, -1.5, 1.5, bits), -1.5, 1.5, bits);
            prop_assert!((restored - v).abs() <= step + 1e-6);
        }
    }
}
