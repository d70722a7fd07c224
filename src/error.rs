use crate::muscles::Quality;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Frame too short for {quality:?}: expected {expected} bytes, got {actual}")]
    FrameTooShort {
        quality: Quality,
        expected: usize,
        actual: usize,
    },

    #[error("Position block too short: expected {expected} bytes, got {actual}")]
    PositionTooShort { expected: usize, actual: usize },

    #[error("Unknown quality tag: {0}")]
    UnknownQuality(u8),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),

    #[error("Bit range out of bounds: offset {offset} width {width} exceeds {available} bits")]
    BitRange {
        offset: usize,
        width: u32,
        available: usize,
    },

    #[error("Invalid bit width: {0} (must be 1..=32)")]
    InvalidBitWidth(u32),

    #[error("Quaternion axis index out of range: {0}")]
    InvalidQuaternionAxis(u8),

    #[error("Quaternion not unit length: length² {length_sq} outside tolerance {tolerance}")]
    NonUnitQuaternion { length_sq: f32, tolerance: f32 },

    #[error("Envelope too short: {0} bytes")]
    EnvelopeTooShort(usize),

    #[error("Stats decode error: {0}")]
    StatsDecode(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Worker failed: {0}")]
    WorkerFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RelayError>;
