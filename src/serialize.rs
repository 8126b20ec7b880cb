use std::fs::File;
use std::io::Read;
use std::path::Path;

use flate2::read::GzDecoder;

use nom::{
    number::complete::{le_u32, le_u64},
    IResult,
};
use num_enum::TryFromPrimitive;

use crate::state::{BlockID, FuncID, NodeID, SmID, Timestamp, TraceError};

/// Fixed size of one logged device event, little-endian throughout.
pub const RECORD_SIZE: usize = 32;

// Make sure this is up to date with the device-side tracing header.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, TryFromPrimitive)]
#[repr(u32)]
pub enum EventKind {
    RunBegin = 0,
    NodeStart = 1,
    NodeEnd = 2,
    BlockStart = 3,
    BlockProgress = 4,
    BlockExit = 5,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Record {
    pub kind: EventKind,
    pub func_id: FuncID,
    pub num_invocations: u32,
    pub node_id: NodeID,
    pub block_id: BlockID,
    pub sm_id: SmID,
    pub cycle_count: Timestamp,
}

fn parse_fields(input: &[u8]) -> IResult<&[u8], (u32, u32, u32, u32, u32, u32, u64)> {
    let (input, kind) = le_u32(input)?;
    let (input, func_id) = le_u32(input)?;
    let (input, num_invocations) = le_u32(input)?;
    let (input, node_id) = le_u32(input)?;
    let (input, block_id) = le_u32(input)?;
    let (input, sm_id) = le_u32(input)?;
    let (input, cycle_count) = le_u64(input)?;
    Ok((
        input,
        (
            kind,
            func_id,
            num_invocations,
            node_id,
            block_id,
            sm_id,
            cycle_count,
        ),
    ))
}

fn decode_record(window: &[u8], index: usize) -> Result<Record, TraceError> {
    let (rest, (kind, func_id, num_invocations, node_id, block_id, sm_id, cycle_count)) =
        parse_fields(window).map_err(|_| TraceError::MalformedLog(window.len()))?;
    debug_assert!(rest.is_empty());
    let kind =
        EventKind::try_from(kind).map_err(|_| TraceError::UnknownEventKind { index, kind })?;
    Ok(Record {
        kind,
        func_id: FuncID(func_id),
        num_invocations,
        node_id: NodeID(node_id),
        block_id: BlockID(block_id),
        sm_id: SmID(sm_id),
        cycle_count: Timestamp(cycle_count),
    })
}

/// Lazy decoder over a raw log buffer. Pure slice transform; build a fresh
/// one to restart from the beginning.
pub struct Records<'a> {
    buf: &'a [u8],
    index: usize,
}

pub fn records(buf: &[u8]) -> Result<Records<'_>, TraceError> {
    if buf.len() % RECORD_SIZE != 0 {
        return Err(TraceError::MalformedLog(buf.len()));
    }
    Ok(Records { buf, index: 0 })
}

impl<'a> Iterator for Records<'a> {
    type Item = Result<Record, TraceError>;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.index * RECORD_SIZE;
        if offset >= self.buf.len() {
            return None;
        }
        let record = decode_record(&self.buf[offset..offset + RECORD_SIZE], self.index);
        self.index += 1;
        Some(record)
    }
}

/// Read a device log and decode every event. Logs rotated through gzip are
/// recognized by their magic bytes and decompressed transparently.
pub fn deserialize<P: AsRef<Path>>(path: P) -> Result<Vec<Record>, TraceError> {
    let mut raw = Vec::new();
    File::open(path)?.read_to_end(&mut raw)?;
    let bytes = if raw.starts_with(&[0x1f, 0x8b]) {
        let mut decoded = Vec::new();
        GzDecoder::new(&raw[..]).read_to_end(&mut decoded)?;
        decoded
    } else {
        raw
    };
    records(&bytes)?.collect()
}
