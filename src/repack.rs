//! Derives the lower-quality frames from a `High` frame by rescaling each
//! channel's integer code directly. Channel values are never turned back into
//! floats on this path.

use crate::bits::{read_bits, write_bits};
use crate::error::Result;
use crate::frame::{FrameLayout, POSITION_BYTES};
use crate::muscles::{Quality, QualityLayout, MUSCLE_COUNT};
use crate::quantize::max_code;
use bytes::{Bytes, BytesMut};

/// Converts a code between bit widths: `round(code × max_dst / max_src)`,
/// with `max_src >> 1` as the rounding bias.
pub fn rescale(code: u32, src_width: u8, dst_width: u8) -> u32 {
    if src_width == dst_width {
        return code;
    }
    if src_width == 0 || dst_width == 0 {
        return 0;
    }
    let max_src = max_code(src_width as u32) as u64;
    let max_dst = max_code(dst_width as u32) as u64;
    let code = (code as u64).min(max_src);
    ((code * max_dst + (max_src >> 1)) / max_src) as u32
}

/// One frame per quality, indexed by `Quality::index()`. Each slot also
/// records the quality its bytes are actually encoded at.
#[derive(Debug, Clone, PartialEq)]
pub struct QualityFrames {
    frames: [Bytes; 4],
    encoded: [Quality; 4],
}

impl QualityFrames {
    /// Every quality served by the same `quality` frame. The fallback when
    /// repacking fails.
    pub fn uniform(source: Bytes, quality: Quality) -> Self {
        Self {
            frames: [source.clone(), source.clone(), source.clone(), source],
            encoded: [quality; 4],
        }
    }

    pub fn get(&self, quality: Quality) -> &Bytes {
        &self.frames[quality.index()]
    }

    /// Quality of the bytes served for a `requested` slot. Differs from
    /// `requested` only for uniform frames.
    pub fn encoded_quality(&self, requested: Quality) -> Quality {
        self.encoded[requested.index()]
    }

    /// The frame for `requested` together with the tag it must be sent under.
    pub fn serve(&self, requested: Quality) -> (Quality, Bytes) {
        let slot = requested.index();
        (self.encoded[slot], self.frames[slot].clone())
    }

    pub fn is_uniform(&self) -> bool {
        self.encoded.iter().all(|q| *q == self.encoded[0])
    }
}

impl Default for QualityFrames {
    fn default() -> Self {
        Self::uniform(Bytes::new(), Quality::High)
    }
}

fn new_target(quality: Quality) -> BytesMut {
    let len = FrameLayout::of(quality).len();
    let mut buf = BytesMut::with_capacity(len);
    buf.resize(len, 0);
    buf
}

fn copy_fixed_regions(source: &[u8], src: &FrameLayout, target: &mut [u8], dst: &FrameLayout) {
    target[..POSITION_BYTES].copy_from_slice(&source[..POSITION_BYTES]);
    target[dst.scale_offset()..dst.len()].copy_from_slice(&source[src.scale_offset()..src.len()]);
}

fn repack_targets(source: &[u8], targets: &mut [(BytesMut, &'static QualityLayout)]) -> Result<()> {
    let src_layout = FrameLayout::of(Quality::High);
    src_layout.check(source)?;

    let high = Quality::High.layout();
    let src_block = &source[POSITION_BYTES..src_layout.scale_offset()];

    for (buf, layout) in targets.iter_mut() {
        let dst_layout = FrameLayout::of(layout.quality);
        copy_fixed_regions(source, &src_layout, buf, &dst_layout);
        // The bit writer ORs into the block.
        buf[POSITION_BYTES..dst_layout.scale_offset()].fill(0);
    }

    for slot in 0..MUSCLE_COUNT {
        let src_width = high.widths[slot];
        if src_width == 0 {
            continue;
        }
        let code = read_bits(src_block, high.offsets[slot], src_width as u32)?;

        for (buf, layout) in targets.iter_mut() {
            let dst_width = layout.widths[slot];
            if dst_width == 0 {
                continue;
            }
            let block = &mut buf[POSITION_BYTES..POSITION_BYTES + layout.muscle_bytes];
            write_bits(block, layout.offsets[slot], dst_width as u32, rescale(code, src_width, dst_width))?;
        }
    }

    Ok(())
}

/// Repacks a `High` frame into one target quality.
pub fn repack(source: &[u8], target: Quality) -> Result<Bytes> {
    if target == Quality::High {
        let layout = FrameLayout::of(Quality::High);
        layout.check(source)?;
        return Ok(Bytes::copy_from_slice(&source[..layout.len()]));
    }
    let mut targets = [(new_target(target), target.layout())];
    repack_targets(source, &mut targets)?;
    let [(buf, _)] = targets;
    Ok(buf.freeze())
}

/// Builds all four quality frames from a `High` frame in one pass over the
/// channel block.
pub fn repack_all(source: &Bytes) -> Result<QualityFrames> {
    let high_len = FrameLayout::of(Quality::High).len();
    let mut targets = Quality::DERIVED.map(|q| (new_target(q), q.layout()));
    repack_targets(source, &mut targets)?;

    let [(medium, _), (low, _), (very_low, _)] = targets;
    Ok(QualityFrames {
        frames: [
            very_low.freeze(),
            low.freeze(),
            medium.freeze(),
            source.slice(..high_len),
        ],
        encoded: Quality::ALL,
    })
}
