use crate::frame::frame_len;
use crate::muscles::Quality;
use crate::pool::Pool;
use crate::protocol::POSE_HEADER_BYTES;
use crate::stats::{default_stripe_count, StripedStats};
use bytes::BytesMut;

pub const DEFAULT_WRITER_POOL: usize = 1024;
/// Each pooled writer owns one slab. Packets are split off its front and
/// share the allocation until they are dropped.
pub const WRITER_SLAB_BYTES: usize = 64 * 1024;

/// Process-wide services shared by the scheduler and its workers. Created once
/// at startup and handed out as `Arc<RelayContext>`.
pub struct RelayContext {
    pub stats: StripedStats,
    pub writers: Pool<BytesMut>,
}

impl RelayContext {
    pub fn new(stats_stripes: usize, writer_pool_capacity: usize) -> Self {
        Self {
            stats: StripedStats::new(stats_stripes),
            writers: Pool::new(
                writer_pool_capacity,
                || BytesMut::with_capacity(WRITER_SLAB_BYTES),
                refill_writer,
            ),
        }
    }
}

/// Largest single write into a pooled writer.
pub fn max_envelope_bytes() -> usize {
    POSE_HEADER_BYTES + frame_len(Quality::High)
}

/// Once the slab tail cannot hold another envelope, `reserve` takes the slab
/// back if every packet split from it has been dropped, and allocates a fresh
/// one otherwise.
fn refill_writer(buf: &mut BytesMut) {
    buf.clear();
    if buf.capacity() < max_envelope_bytes() {
        buf.reserve(WRITER_SLAB_BYTES);
    }
}

impl Default for RelayContext {
    fn default() -> Self {
        Self::new(default_stripe_count(), DEFAULT_WRITER_POOL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn test_writer_sized_for_high_envelope() {
        let context = RelayContext::new(2, 8);
        let writer = context.writers.get();
        assert!(writer.capacity() >= max_envelope_bytes());
        assert!(writer.is_empty());
        assert_eq!(context.stats.stripe_count(), 2);
    }

    #[test]
    fn test_split_packets_share_the_slab() {
        let context = RelayContext::new(1, 1);
        let mut packets = Vec::new();
        for _ in 0..4 {
            let mut writer = context.writers.get();
            writer.put_slice(&[7u8; 100]);
            packets.push(writer.split().freeze());
        }
        assert_eq!(context.writers.stats().created, 1);

        let writer = context.writers.take();
        assert!(writer.capacity() >= WRITER_SLAB_BYTES - 400);
        assert!(writer.capacity() < WRITER_SLAB_BYTES);
        assert!(packets.iter().all(|p| p.len() == 100));
    }

    #[test]
    fn test_exhausted_slab_is_reclaimed() {
        let context = RelayContext::new(1, 1);
        {
            let mut writer = context.writers.get();
            writer.put_bytes(0, WRITER_SLAB_BYTES - 10);
            drop(writer.split().freeze());
        }
        let writer = context.writers.take();
        assert!(writer.capacity() >= max_envelope_bytes());
        assert_eq!(context.writers.stats().created, 1);
    }
}
