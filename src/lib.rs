pub mod quantize;
pub mod bits;
pub mod muscles;
pub mod frame;
pub mod repack;
pub mod bitset;
pub mod participant;
pub mod interest;
pub mod scheduler;
pub mod stats;
pub mod pool;
pub mod context;
pub mod protocol;
pub mod transport;
pub mod error;
pub mod debug;

pub use quantize::{
    Vec3, Quat, CompressedQuat,
    quantize, dequantize, quantize_bits, dequantize_bits,
};

pub use bits::{
    BitReader, BitWriter, read_bits, write_bits,
};

pub use muscles::{
    Quality, QualityLayout, MuscleGroup, MUSCLE_COUNT, MUSCLES,
};

pub use frame::{
    PoseFrame, FrameLayout, frame_len,
};

pub use repack::{
    QualityFrames, repack, repack_all,
};

pub use bitset::AtomicBitSet;

pub use participant::{
    Participant, ParticipantRegistry, PoseState,
};

pub use interest::{
    InterestConfig, Backpressure,
};

pub use scheduler::{
    Scheduler, SchedulerConfig, SchedulerHandle, SchedulerStats, TickReport,
};

pub use stats::{
    StripedStats, StatsSnapshot, TrafficCounter,
};

pub use pool::{
    Pool, Pooled, PoolStats,
};

pub use context::RelayContext;

pub use protocol::{
    ParticipantId, MessageType, PoseEnvelope,
};

pub use transport::{
    Peer, DeliveryMethod, MemoryPeer, SentPacket,
};

pub use error::{
    RelayError, Result,
};

pub use debug::{
    init_debug_mode, is_trace_enabled, set_trace_enabled,
    format_bytes, frame_summary,
};
