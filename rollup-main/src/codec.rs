//! Wire encoding of forwarded aggregates.
//!
//! A payload is a sequence of `(partition_id, record)` pairs, each encoded
//! with bincode back to back. Every pair is self-delimiting, so a reader
//! decodes until the input runs out; reaching the end is the normal way a
//! payload terminates.
//!
//! On the socket each payload travels as one frame: a big-endian `u32`
//! length followed by the payload bytes. The receiver answers every frame
//! with a single [`FRAME_ACK`] byte once the payload has been merged.

use crate::aggregation::{AggregationRecord, AggregationStore};
use crate::error::{Result, RollupError};
use bincode::Options;
use bytes::{BufMut, Bytes, BytesMut};
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Acknowledgement byte sent after a frame has been applied.
pub const FRAME_ACK: u8 = 0x06;

/// Frames larger than this are rejected before allocation.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Encodes every record of one partition's store.
pub fn encode_partition(partition_id: usize, store: &AggregationStore) -> Result<Bytes> {
    encode_pairs(store.iter().map(|(_, record)| (partition_id, record)))
}

pub fn encode_pairs<'a, I>(pairs: I) -> Result<Bytes>
where
    I: IntoIterator<Item = (usize, &'a AggregationRecord)>,
{
    let mut writer = BytesMut::new().writer();
    for (partition_id, record) in pairs {
        bincode::serialize_into(&mut writer, &(partition_id as u64, record))?;
    }
    Ok(writer.into_inner().freeze())
}

/// Streaming decoder over an in-memory payload.
///
/// Input that ends exactly between two pairs terminates the iteration;
/// input that ends inside a pair is a [`RollupError::Codec`] error. Every
/// pair is decoded with a size limit equal to the bytes still unread, so a
/// length prefix larger than the payload fails before anything is allocated.
pub struct PayloadReader<'a> {
    input: &'a [u8],
    done: bool,
}

impl<'a> PayloadReader<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, done: false }
    }

    fn decode_pair(&mut self) -> bincode::Result<(u64, AggregationRecord)> {
        // Same layout as `bincode::serialize_into`, bounded by the input.
        bincode::DefaultOptions::new()
            .with_fixint_encoding()
            .allow_trailing_bytes()
            .with_limit(self.input.len() as u64)
            .deserialize_from(&mut self.input)
    }
}

impl Iterator for PayloadReader<'_> {
    type Item = Result<(usize, AggregationRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.input.is_empty() {
            self.done = true;
            return None;
        }
        match self.decode_pair() {
            Ok((partition_id, record)) => Some(Ok((partition_id as usize, record))),
            Err(e) => {
                self.done = true;
                Some(Err(RollupError::Codec(e)))
            }
        }
    }
}

/// Decodes a whole payload.
pub fn decode_payload(payload: &[u8]) -> Result<Vec<(usize, AggregationRecord)>> {
    PayloadReader::new(payload).collect()
}

pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .ok_or_else(|| {
            RollupError::Io(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("payload of {} bytes exceeds frame limit", payload.len()),
            ))
        })?;
    writer.write_u32(len).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame; `None` when the peer closed the stream between frames.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(RollupError::Io(std::io::Error::new(
            ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit", len),
        )));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}
