//! Per-message-type traffic counters striped across threads.
//!
//! Each thread sticks to one stripe, chosen from a hash of its thread id
//! and cached thread-locally. Sums are eventually consistent across stripes
//! while writers are active. Each single counter resets atomically.

use crate::error::{RelayError, Result};
use ahash::RandomState;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::collections::BTreeMap;
use std::hash::{BuildHasher, Hash, Hasher};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};

pub const MESSAGE_TYPE_SLOTS: usize = 256;

const MIN_STRIPES: usize = 4;
const MAX_STRIPES: usize = 64;

const BROTLI_BUFFER: usize = 4096;
const BROTLI_QUALITY: u32 = 5;
const BROTLI_WINDOW: u32 = 22;

thread_local! {
    static THREAD_HASH: Cell<Option<u64>> = const { Cell::new(None) };
}

fn thread_hash() -> u64 {
    THREAD_HASH.with(|cached| match cached.get() {
        Some(hash) => hash,
        None => {
            let hasher = RandomState::with_seeds(0x9e37_79b9, 0x7f4a_7c15, 0xf39c_c060, 0x5ced_c834);
            let mut state = hasher.build_hasher();
            std::thread::current().id().hash(&mut state);
            let hash = state.finish();
            cached.set(Some(hash));
            hash
        }
    })
}

/// A small multiple of the core count, clamped.
pub fn default_stripe_count() -> usize {
    let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
    (cores * 2).clamp(MIN_STRIPES, MAX_STRIPES)
}

#[repr(align(64))]
struct Stripe {
    inbound_count: [AtomicU64; MESSAGE_TYPE_SLOTS],
    inbound_bytes: [AtomicU64; MESSAGE_TYPE_SLOTS],
    outbound_count: [AtomicU64; MESSAGE_TYPE_SLOTS],
    outbound_bytes: [AtomicU64; MESSAGE_TYPE_SLOTS],
}

impl Stripe {
    fn new() -> Self {
        Self {
            inbound_count: std::array::from_fn(|_| AtomicU64::new(0)),
            inbound_bytes: std::array::from_fn(|_| AtomicU64::new(0)),
            outbound_count: std::array::from_fn(|_| AtomicU64::new(0)),
            outbound_bytes: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficCounter {
    pub count: u64,
    pub bytes: u64,
}

impl TrafficCounter {
    fn is_zero(&self) -> bool {
        self.count == 0 && self.bytes == 0
    }
}

pub struct StripedStats {
    stripes: Box<[Stripe]>,
}

impl StripedStats {
    pub fn new(stripes: usize) -> Self {
        let stripes = stripes.clamp(1, MAX_STRIPES);
        Self {
            stripes: (0..stripes).map(|_| Stripe::new()).collect(),
        }
    }

    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }

    fn local(&self) -> &Stripe {
        &self.stripes[(thread_hash() % self.stripes.len() as u64) as usize]
    }

    pub fn record_inbound(&self, message_type: u8, bytes: usize) {
        let stripe = self.local();
        stripe.inbound_count[message_type as usize].fetch_add(1, Ordering::Relaxed);
        stripe.inbound_bytes[message_type as usize].fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_outbound(&self, message_type: u8, bytes: usize) {
        let stripe = self.local();
        stripe.outbound_count[message_type as usize].fetch_add(1, Ordering::Relaxed);
        stripe.outbound_bytes[message_type as usize].fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn collect(&self, read: impl Fn(&AtomicU64) -> u64) -> StatsSnapshot {
        let mut snapshot = StatsSnapshot::default();
        for slot in 0..MESSAGE_TYPE_SLOTS {
            let mut inbound = TrafficCounter::default();
            let mut outbound = TrafficCounter::default();
            for stripe in self.stripes.iter() {
                inbound.count += read(&stripe.inbound_count[slot]);
                inbound.bytes += read(&stripe.inbound_bytes[slot]);
                outbound.count += read(&stripe.outbound_count[slot]);
                outbound.bytes += read(&stripe.outbound_bytes[slot]);
            }
            if !inbound.is_zero() {
                snapshot.inbound.insert(slot as u8, inbound);
            }
            if !outbound.is_zero() {
                snapshot.outbound.insert(slot as u8, outbound);
            }
        }
        snapshot
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.collect(|counter| counter.load(Ordering::Acquire))
    }

    /// Reads and zeroes every counter. No concurrent increment is lost: it
    /// lands either in this snapshot or in the next one.
    pub fn snapshot_and_reset(&self) -> StatsSnapshot {
        self.collect(|counter| counter.swap(0, Ordering::AcqRel))
    }
}

impl Default for StripedStats {
    fn default() -> Self {
        Self::new(default_stripe_count())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub inbound: BTreeMap<u8, TrafficCounter>,
    pub outbound: BTreeMap<u8, TrafficCounter>,
}

impl StatsSnapshot {
    pub fn total_inbound(&self) -> TrafficCounter {
        sum(&self.inbound)
    }

    pub fn total_outbound(&self) -> TrafficCounter {
        sum(&self.outbound)
    }

    /// `[varint n]{[u8 type][varint count][varint bytes]}×n`, inbound then
    /// outbound, optionally Brotli-compressed.
    pub fn export(&self, compress: bool) -> Result<Bytes> {
        let mut raw = BytesMut::with_capacity(16 + (self.inbound.len() + self.outbound.len()) * 12);
        write_section(&mut raw, &self.inbound);
        write_section(&mut raw, &self.outbound);

        if !compress {
            return Ok(raw.freeze());
        }

        let mut writer = brotli::CompressorWriter::new(Vec::new(), BROTLI_BUFFER, BROTLI_QUALITY, BROTLI_WINDOW);
        writer.write_all(&raw)?;
        writer.flush()?;
        Ok(Bytes::from(writer.into_inner()))
    }

    pub fn decode(data: &[u8], compressed: bool) -> Result<Self> {
        let decompressed;
        let mut raw: &[u8] = if compressed {
            let mut out = Vec::new();
            brotli::Decompressor::new(data, BROTLI_BUFFER).read_to_end(&mut out)?;
            decompressed = out;
            &decompressed
        } else {
            data
        };

        let inbound = read_section(&mut raw)?;
        let outbound = read_section(&mut raw)?;
        if raw.has_remaining() {
            return Err(RelayError::StatsDecode(format!("{} trailing bytes", raw.remaining())));
        }
        Ok(Self { inbound, outbound })
    }
}

fn sum(section: &BTreeMap<u8, TrafficCounter>) -> TrafficCounter {
    section.values().fold(TrafficCounter::default(), |acc, c| TrafficCounter {
        count: acc.count + c.count,
        bytes: acc.bytes + c.bytes,
    })
}

fn write_section(out: &mut BytesMut, section: &BTreeMap<u8, TrafficCounter>) {
    write_varint(out, section.len() as u64);
    for (index, counter) in section {
        out.put_u8(*index);
        write_varint(out, counter.count);
        write_varint(out, counter.bytes);
    }
}

fn read_section(data: &mut &[u8]) -> Result<BTreeMap<u8, TrafficCounter>> {
    let entries = read_varint(data)?;
    if entries > MESSAGE_TYPE_SLOTS as u64 {
        return Err(RelayError::StatsDecode(format!("{} entries exceeds type space", entries)));
    }

    let mut section = BTreeMap::new();
    for _ in 0..entries {
        if !data.has_remaining() {
            return Err(RelayError::StatsDecode("truncated entry".to_string()));
        }
        let index = data.get_u8();
        let count = read_varint(data)?;
        let bytes = read_varint(data)?;
        section.insert(index, TrafficCounter { count, bytes });
    }
    Ok(section)
}

/// LEB128, low 7 bits first.
pub fn write_varint(out: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        out.put_u8((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    out.put_u8(value as u8);
}

pub fn read_varint(data: &mut &[u8]) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        if !data.has_remaining() {
            return Err(RelayError::StatsDecode("truncated varint".to_string()));
        }
        let byte = data.get_u8();
        if shift == 63 && byte > 1 {
            return Err(RelayError::StatsDecode("varint overflows u64".to_string()));
        }
        value |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 63 {
            return Err(RelayError::StatsDecode("varint overflows u64".to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_varint_encoding() {
        let mut out = BytesMut::new();
        write_varint(&mut out, 0);
        write_varint(&mut out, 127);
        write_varint(&mut out, 300);
        write_varint(&mut out, u64::MAX);
        assert_eq!(&out[..4], &[0x00, 0x7F, 0xAC, 0x02]);

        let mut data: &[u8] = &out;
        assert_eq!(read_varint(&mut data).unwrap(), 0);
        assert_eq!(read_varint(&mut data).unwrap(), 127);
        assert_eq!(read_varint(&mut data).unwrap(), 300);
        assert_eq!(read_varint(&mut data).unwrap(), u64::MAX);
        assert!(read_varint(&mut data).is_err());

        let mut overlong: &[u8] = &[0xFF; 11];
        assert!(read_varint(&mut overlong).is_err());
    }

    #[test]
    fn test_record_and_snapshot() {
        let stats = StripedStats::new(4);
        stats.record_inbound(0, 100);
        stats.record_inbound(0, 50);
        stats.record_outbound(2, 3);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.inbound[&0], TrafficCounter { count: 2, bytes: 150 });
        assert_eq!(snapshot.outbound[&2], TrafficCounter { count: 1, bytes: 3 });
        assert!(!snapshot.inbound.contains_key(&2));

        // Plain snapshots leave counters intact.
        assert_eq!(stats.snapshot(), snapshot);
    }

    #[test]
    fn test_snapshot_and_reset() {
        let stats = StripedStats::new(2);
        stats.record_outbound(7, 10);
        let first = stats.snapshot_and_reset();
        assert_eq!(first.total_outbound().count, 1);
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn test_export_layout() {
        let stats = StripedStats::new(1);
        stats.record_inbound(1, 300);
        stats.record_outbound(0, 5);
        stats.record_outbound(4, 1);

        let raw = stats.snapshot().export(false).unwrap();
        assert_eq!(
            &raw[..],
            &[1, 1, 1, 0xAC, 0x02, 2, 0, 1, 5, 4, 1, 1]
        );
    }

    #[test]
    fn test_export_decode_compressed() {
        let stats = StripedStats::new(3);
        for index in 0..=255u8 {
            stats.record_inbound(index, index as usize * 11);
            stats.record_outbound(index, 1 << 20);
        }
        let snapshot = stats.snapshot();

        let plain = snapshot.export(false).unwrap();
        let compressed = snapshot.export(true).unwrap();
        assert!(compressed.len() < plain.len());

        assert_eq!(StatsSnapshot::decode(&compressed, true).unwrap(), snapshot);
        assert_eq!(StatsSnapshot::decode(&plain, false).unwrap(), snapshot);
        assert!(StatsSnapshot::decode(&plain[..plain.len() - 1], false).is_err());
    }

    #[test]
    fn test_concurrent_increments_not_lost() {
        let stats = Arc::new(StripedStats::new(8));
        let mut collected = TrafficCounter::default();

        thread::scope(|s| {
            for _ in 0..8 {
                let stats = Arc::clone(&stats);
                s.spawn(move || {
                    for _ in 0..10_000 {
                        stats.record_outbound(0, 2);
                    }
                });
            }
            for _ in 0..10 {
                let taken = stats.snapshot_and_reset().total_outbound();
                collected.count += taken.count;
                collected.bytes += taken.bytes;
            }
        });

        let rest = stats.snapshot_and_reset().total_outbound();
        assert_eq!(collected.count + rest.count, 80_000);
        assert_eq!(collected.bytes + rest.bytes, 160_000);
    }

    #[test]
    fn test_stripe_count_bounds() {
        assert!((MIN_STRIPES..=MAX_STRIPES).contains(&default_stripe_count()));
        assert_eq!(StripedStats::new(0).stripe_count(), 1);
        assert_eq!(StripedStats::new(1000).stripe_count(), MAX_STRIPES);
    }
}
