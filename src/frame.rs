use crate::bits::{BitReader, BitWriter};
use crate::error::{RelayError, Result};
use crate::muscles::{Quality, MUSCLES, MUSCLE_COUNT};
use crate::quantize::{
    dequantize_bits, dequantize_scale, quantize_bits, quantize_scale, CompressedQuat, Quat, Vec3,
    COMPRESSED_QUAT_BYTES,
};
use bytes::{BufMut, Bytes, BytesMut};

pub const POSITION_BYTES: usize = 12;
pub const SCALE_BYTES: usize = 2;
/// Scale and quaternion together follow the channel block.
pub const TAIL_BYTES: usize = SCALE_BYTES + COMPRESSED_QUAT_BYTES;

/// Byte layout of a frame at a given quality:
/// `[position 12][channels N][scale 2][quaternion 7]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    pub quality: Quality,
    pub muscle_bytes: usize,
}

impl FrameLayout {
    pub fn of(quality: Quality) -> Self {
        Self {
            quality,
            muscle_bytes: quality.layout().muscle_bytes,
        }
    }

    pub fn muscle_offset(&self) -> usize {
        POSITION_BYTES
    }

    pub fn scale_offset(&self) -> usize {
        POSITION_BYTES + self.muscle_bytes
    }

    pub fn rotation_offset(&self) -> usize {
        self.scale_offset() + SCALE_BYTES
    }

    pub fn len(&self) -> usize {
        POSITION_BYTES + self.muscle_bytes + TAIL_BYTES
    }

    pub fn check(&self, data: &[u8]) -> Result<()> {
        if data.len() < self.len() {
            return Err(RelayError::FrameTooShort {
                quality: self.quality,
                expected: self.len(),
                actual: data.len(),
            });
        }
        Ok(())
    }
}

pub fn frame_len(quality: Quality) -> usize {
    FrameLayout::of(quality).len()
}

/// A fully decoded pose.
#[derive(Debug, Clone, PartialEq)]
pub struct PoseFrame {
    pub position: Vec3,
    pub muscles: [f32; MUSCLE_COUNT],
    pub scale: f32,
    pub rotation: Quat,
}

impl Default for PoseFrame {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            muscles: [0.0; MUSCLE_COUNT],
            scale: 1.0,
            rotation: Quat::IDENTITY,
        }
    }
}

impl PoseFrame {
    pub fn new(position: Vec3, muscles: [f32; MUSCLE_COUNT], scale: f32, rotation: Quat) -> Self {
        Self {
            position,
            muscles,
            scale,
            rotation,
        }
    }

    pub fn encode(&self, quality: Quality) -> Result<Bytes> {
        let mut out = BytesMut::with_capacity(frame_len(quality));
        self.encode_into(quality, &mut out)?;
        Ok(out.freeze())
    }

    /// Appends the encoded frame to `out`.
    pub fn encode_into(&self, quality: Quality, out: &mut BytesMut) -> Result<()> {
        let layout = FrameLayout::of(quality);
        let start = out.len();
        out.resize(start + layout.len(), 0);
        let frame = &mut out[start..];

        write_position(frame, self.position)?;

        let widths = &quality.layout().widths;
        let block = &mut frame[layout.muscle_offset()..layout.scale_offset()];
        let mut writer = BitWriter::zeroed(block);
        for (slot, muscle) in MUSCLES.iter().enumerate() {
            let width = widths[slot] as u32;
            let value = if self.muscles[slot].is_finite() { self.muscles[slot] } else { 0.0 };
            writer.write(width, quantize_bits(value, muscle.min(), muscle.max(), width))?;
        }

        let scale_offset = layout.scale_offset();
        frame[scale_offset..scale_offset + SCALE_BYTES]
            .copy_from_slice(&quantize_scale(self.scale).to_le_bytes());

        write_rotation(frame, quality, self.rotation)?;
        Ok(())
    }

    /// `tolerance` enables the strict unit-length check on the quaternion.
    pub fn decode(data: &[u8], quality: Quality, tolerance: Option<f32>) -> Result<Self> {
        let layout = FrameLayout::of(quality);
        layout.check(data)?;

        let position = read_position(data)?;

        let widths = &quality.layout().widths;
        let mut reader = BitReader::new(&data[layout.muscle_offset()..layout.scale_offset()]);
        let mut muscles = [0.0f32; MUSCLE_COUNT];
        for (slot, muscle) in MUSCLES.iter().enumerate() {
            let width = widths[slot] as u32;
            muscles[slot] = if width == 0 {
                0.0
            } else {
                dequantize_bits(reader.read(width)?, muscle.min(), muscle.max(), width)
            };
        }

        let scale_offset = layout.scale_offset();
        let scale = dequantize_scale(u16::from_le_bytes([data[scale_offset], data[scale_offset + 1]]));

        let rotation = read_rotation(data, quality, tolerance)?;

        Ok(Self {
            position,
            muscles,
            scale,
            rotation,
        })
    }
}

pub fn read_position(data: &[u8]) -> Result<Vec3> {
    if data.len() < POSITION_BYTES {
        return Err(RelayError::PositionTooShort {
            expected: POSITION_BYTES,
            actual: data.len(),
        });
    }
    let f = |i: usize| f32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
    Ok(Vec3::new(f(0), f(4), f(8)).sanitized())
}

pub fn write_position(data: &mut [u8], position: Vec3) -> Result<()> {
    if data.len() < POSITION_BYTES {
        return Err(RelayError::PositionTooShort {
            expected: POSITION_BYTES,
            actual: data.len(),
        });
    }
    let position = position.sanitized();
    data[0..4].copy_from_slice(&position.x.to_le_bytes());
    data[4..8].copy_from_slice(&position.y.to_le_bytes());
    data[8..12].copy_from_slice(&position.z.to_le_bytes());
    Ok(())
}

pub fn read_rotation(data: &[u8], quality: Quality, tolerance: Option<f32>) -> Result<Quat> {
    let layout = FrameLayout::of(quality);
    layout.check(data)?;
    let offset = layout.rotation_offset();
    CompressedQuat::read_from(&data[offset..offset + COMPRESSED_QUAT_BYTES])?.decompress(tolerance)
}

pub fn write_rotation(data: &mut [u8], quality: Quality, rotation: Quat) -> Result<()> {
    let layout = FrameLayout::of(quality);
    layout.check(data)?;
    let offset = layout.rotation_offset();
    CompressedQuat::compress(rotation).write_to(&mut data[offset..offset + COMPRESSED_QUAT_BYTES]);
    Ok(())
}

/// Checks length and quaternion without decoding the channel block, and
/// returns the position. Used on the inbound path.
pub fn inspect(data: &[u8], quality: Quality, tolerance: f32) -> Result<Vec3> {
    read_rotation(data, quality, Some(tolerance))?;
    read_position(data)
}

/// Writes a frame into `out` if it is the exact length for `quality`.
pub fn put_frame(out: &mut BytesMut, frame: &[u8], quality: Quality) -> Result<()> {
    let expected = frame_len(quality);
    if frame.len() != expected {
        return Err(RelayError::FrameTooShort {
            quality,
            expected,
            actual: frame.len(),
        });
    }
    out.put_slice(frame);
    Ok(())
}
