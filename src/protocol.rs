use crate::error::{RelayError, Result};
use crate::frame::frame_len;
use crate::muscles::Quality;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

pub type ParticipantId = u16;

/// One-byte message index. Also the key space of the traffic statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    PoseUpdate = 0,
    ParticipantJoined = 1,
    ParticipantLeft = 2,
    StatsRequest = 3,
    StatsReport = 4,
}

impl MessageType {
    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn from_index(index: u8) -> Result<Self> {
        match index {
            0 => Ok(MessageType::PoseUpdate),
            1 => Ok(MessageType::ParticipantJoined),
            2 => Ok(MessageType::ParticipantLeft),
            3 => Ok(MessageType::StatsRequest),
            4 => Ok(MessageType::StatsReport),
            other => Err(RelayError::UnknownMessageType(other)),
        }
    }
}

/// `[type u8][sender u16][interval ms u8][quality u8]`
pub const POSE_HEADER_BYTES: usize = 5;
/// `[type u8][participant u16]`
pub const PARTICIPANT_NOTICE_BYTES: usize = 3;

pub fn write_pose_envelope(
    out: &mut BytesMut,
    sender: ParticipantId,
    interval_ms: u8,
    quality: Quality,
    frame: &[u8],
) {
    out.reserve(POSE_HEADER_BYTES + frame.len());
    out.put_u8(MessageType::PoseUpdate.index());
    out.put_u16_le(sender);
    out.put_u8(interval_ms);
    out.put_u8(quality.tag());
    out.put_slice(frame);
}

pub fn write_participant_notice(out: &mut BytesMut, kind: MessageType, participant: ParticipantId) {
    out.reserve(PARTICIPANT_NOTICE_BYTES);
    out.put_u8(kind.index());
    out.put_u16_le(participant);
}

/// A pose update as seen by the receiving client.
#[derive(Debug, Clone, PartialEq)]
pub struct PoseEnvelope {
    pub sender: ParticipantId,
    pub interval_ms: u8,
    pub quality: Quality,
    pub frame: Bytes,
}

impl PoseEnvelope {
    pub fn decode(mut data: Bytes) -> Result<Self> {
        if data.len() < POSE_HEADER_BYTES {
            return Err(RelayError::EnvelopeTooShort(data.len()));
        }

        let msg_type = MessageType::from_index(data.get_u8())?;
        if msg_type != MessageType::PoseUpdate {
            return Err(RelayError::UnknownMessageType(msg_type.index()));
        }

        let sender = data.get_u16_le();
        let interval_ms = data.get_u8();
        let quality = Quality::from_tag(data.get_u8())?;

        let expected = frame_len(quality);
        if data.len() < expected {
            return Err(RelayError::FrameTooShort {
                quality,
                expected,
                actual: data.len(),
            });
        }

        Ok(Self {
            sender,
            interval_ms,
            quality,
            frame: data.split_to(expected),
        })
    }
}

/// Decodes a join/leave notice.
pub fn read_participant_notice(mut data: &[u8]) -> Result<(MessageType, ParticipantId)> {
    if data.len() < PARTICIPANT_NOTICE_BYTES {
        return Err(RelayError::EnvelopeTooShort(data.len()));
    }
    let kind = MessageType::from_index(data.get_u8())?;
    match kind {
        MessageType::ParticipantJoined | MessageType::ParticipantLeft => Ok((kind, data.get_u16_le())),
        other => Err(RelayError::UnknownMessageType(other.index())),
    }
}

pub fn peek_message_type(data: &[u8]) -> Result<MessageType> {
    match data.first() {
        Some(&index) => MessageType::from_index(index),
        None => Err(RelayError::EnvelopeTooShort(0)),
    }
}
