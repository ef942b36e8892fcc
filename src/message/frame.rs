//! Session frames.
//!
//! See the [message module] documentation since this is a private module anyways.
//!
//! [message module]: crate::message

use std::convert::{TryFrom, TryInto};

use anyhow::{anyhow, Context};
use bytes::Bytes;
use derive_more::Display;

use crate::{
    channel::{PartyId, Role, TaskContext},
    message::{
        traits::{decode_sequence, encode_sequence},
        DecodeError,
        FromBytes,
        LengthValueBuffer,
        ToBytes,
    },
};

pub(crate) mod ranges {
    use std::ops::Range;

    use crate::message::range;

    /// Byte range corresponding to the frame kind
    pub const KIND: usize = 0;
    /// Byte range corresponding to the role of a hello frame
    pub const HELLO_ROLE: usize = KIND + 1;
    /// Byte range corresponding to the party index of a hello frame
    pub const HELLO_INDEX: Range<usize> = range(HELLO_ROLE + 1, 4);
    /// Byte range corresponding to the status of a hello-ack frame
    pub const HELLO_ACK_STATUS: usize = KIND + 1;
    /// Byte range corresponding to the sequence number of data and ack frames
    pub const SEQ: Range<usize> = range(KIND + 1, 8);
    /// Byte range corresponding to the status of an ack frame
    pub const ACK_STATUS: usize = SEQ.end;
}

#[derive(Copy, Debug, Clone, Display, Eq, PartialEq)]
/// The answer of a peer to a hello or a data frame.
pub enum AckStatus {
    #[display(fmt = "accepted")]
    Accepted,
    #[display(fmt = "task context mismatch")]
    ContextMismatch,
    #[display(fmt = "unexpected party")]
    UnexpectedParty,
}

impl TryFrom<u8> for AckStatus {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => AckStatus::Accepted,
            1 => AckStatus::ContextMismatch,
            2 => AckStatus::UnexpectedParty,
            _ => return Err(anyhow!("invalid ack status {}", value)),
        })
    }
}

impl From<AckStatus> for u8 {
    fn from(status: AckStatus) -> Self {
        match status {
            AckStatus::Accepted => 0,
            AckStatus::ContextMismatch => 1,
            AckStatus::UnexpectedParty => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
/// A single frame on the transport of a session.
///
/// ```no_rust
/// hello:     | kind=1 | role | index (4) | task_id (LV) | job_id (LV) | request_id (LV) |
/// hello-ack: | kind=2 | status |
/// data:      | kind=3 | seq (8) | tag (LV) | payload (rest of the frame) |
/// ack:       | kind=4 | seq (8) | status |
/// ```
///
/// Each frame is carried in one length-delimited transport frame, so the payload of a data frame
/// needs no length field of its own.
pub enum Frame {
    /// Opens a session on behalf of `party` for the run identified by `context`.
    Hello {
        party: PartyId,
        context: TaskContext,
    },
    /// Answers a [`Frame::Hello`].
    HelloAck(AckStatus),
    /// Carries a tagged payload.
    Data { seq: u64, tag: String, payload: Bytes },
    /// Answers the [`Frame::Data`] with the same sequence number.
    Ack { seq: u64, status: AckStatus },
}

impl Frame {
    fn kind(&self) -> u8 {
        match self {
            Frame::Hello { .. } => 1,
            Frame::HelloAck(_) => 2,
            Frame::Data { .. } => 3,
            Frame::Ack { .. } => 4,
        }
    }
}

impl ToBytes for Frame {
    fn buffer_length(&self) -> usize {
        1 + match self {
            Frame::Hello { context, .. } => {
                1 + 4
                    + context.task_id.buffer_length()
                    + context.job_id.buffer_length()
                    + context.request_id.buffer_length()
            }
            Frame::HelloAck(_) => 1,
            Frame::Data { tag, payload, .. } => 8 + tag.buffer_length() + payload.len(),
            Frame::Ack { .. } => 8 + 1,
        }
    }

    fn to_bytes<T: AsMut<[u8]>>(&self, buffer: &mut T) {
        let buffer = buffer.as_mut();
        buffer[ranges::KIND] = self.kind();
        match self {
            Frame::Hello { party, context } => {
                buffer[ranges::HELLO_ROLE] = party.role.into();
                buffer[ranges::HELLO_INDEX].copy_from_slice(&party.index.to_be_bytes());
                let _ = encode_sequence(
                    &[
                        context.task_id.clone(),
                        context.job_id.clone(),
                        context.request_id.clone(),
                    ],
                    &mut buffer[ranges::HELLO_INDEX.end..],
                );
            }
            Frame::HelloAck(status) => buffer[ranges::HELLO_ACK_STATUS] = (*status).into(),
            Frame::Data { seq, tag, payload } => {
                buffer[ranges::SEQ].copy_from_slice(&seq.to_be_bytes());
                let offset =
                    ranges::SEQ.end + encode_sequence(Some(tag), &mut buffer[ranges::SEQ.end..]);
                buffer[offset..offset + payload.len()].copy_from_slice(payload);
            }
            Frame::Ack { seq, status } => {
                buffer[ranges::SEQ].copy_from_slice(&seq.to_be_bytes());
                buffer[ranges::ACK_STATUS] = (*status).into();
            }
        }
    }
}

impl FromBytes for Frame {
    fn from_bytes<T: AsRef<[u8]>>(buffer: &T) -> Result<Self, DecodeError> {
        let buffer = buffer.as_ref();
        let kind = *buffer.get(ranges::KIND).ok_or_else(|| anyhow!("empty frame"))?;
        let frame = match kind {
            1 => {
                let role = buffer
                    .get(ranges::HELLO_ROLE)
                    .ok_or_else(|| anyhow!("truncated hello frame"))?;
                let index = buffer
                    .get(ranges::HELLO_INDEX)
                    .ok_or_else(|| anyhow!("truncated hello frame"))?;
                let party = PartyId::new(
                    Role::try_from(*role)?,
                    // safe unwrap: the slice is exactly 4 bytes long
                    u32::from_be_bytes(index.try_into().unwrap()),
                );
                let fields: Vec<String> = decode_sequence(&buffer[ranges::HELLO_INDEX.end..])
                    .context("invalid task context")?;
                match <[String; 3]>::try_from(fields) {
                    Ok([task_id, job_id, request_id]) => Frame::Hello {
                        party,
                        context: TaskContext {
                            task_id,
                            job_id,
                            request_id,
                        },
                    },
                    Err(fields) => {
                        return Err(anyhow!(
                            "invalid task context: expected 3 fields, got {}",
                            fields.len()
                        ))
                    }
                }
            }
            2 => {
                let status = buffer
                    .get(ranges::HELLO_ACK_STATUS)
                    .ok_or_else(|| anyhow!("truncated hello-ack frame"))?;
                Frame::HelloAck(AckStatus::try_from(*status)?)
            }
            3 => {
                let seq = buffer
                    .get(ranges::SEQ)
                    .ok_or_else(|| anyhow!("truncated data frame"))?;
                let tag_field = LengthValueBuffer::new(&buffer[ranges::SEQ.end..])
                    .context("invalid data tag")?;
                let tag_length = tag_field.length() as usize;
                let tag = String::from_bytes(&tag_field.bytes())?;
                let payload = &buffer[ranges::SEQ.end + tag_length..];
                Frame::Data {
                    // safe unwrap: the slice is exactly 8 bytes long
                    seq: u64::from_be_bytes(seq.try_into().unwrap()),
                    tag,
                    payload: Bytes::copy_from_slice(payload),
                }
            }
            4 => {
                let seq = buffer
                    .get(ranges::SEQ)
                    .ok_or_else(|| anyhow!("truncated ack frame"))?;
                let status = buffer
                    .get(ranges::ACK_STATUS)
                    .ok_or_else(|| anyhow!("truncated ack frame"))?;
                Frame::Ack {
                    // safe unwrap: the slice is exactly 8 bytes long
                    seq: u64::from_be_bytes(seq.try_into().unwrap()),
                    status: AckStatus::try_from(*status)?,
                }
            }
            _ => return Err(anyhow!("invalid frame kind {}", kind)),
        };
        Ok(frame)
    }
}
