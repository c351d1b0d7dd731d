//! Primary-component membership messages.
//!
//! During primary-component formation every member broadcasts its view of
//! the group: per known member, the last delivered sequence, the last
//! primary view it belonged to, and a reserved total-order sequence. Peers
//! compare these state messages to agree on which members form the next
//! primary component. The wire format is packed little-endian and versioned;
//! only version 0 exists.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;
use uuid::Uuid;

/// Wire protocol version of the message format.
pub const PC_PROTO_VERSION: u8 = 0;

/// "No last delivered sequence" sentinel carried by fresh instances.
pub const NO_LAST_SEQ: u32 = u32::MAX;

/// "No reserved total-order sequence" sentinel.
pub const NO_TO_SEQ: u64 = u64::MAX;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PcCodecError {
    #[error("buffer truncated: need {need} bytes at offset {offset}, have {have}")]
    Truncated {
        need: usize,
        offset: usize,
        have: usize,
    },
    #[error("buffer too small to encode: need {need}, have {have}")]
    Overflow { need: usize, have: usize },
    #[error("unsupported message version {0}")]
    UnsupportedVersion(u8),
    #[error("invalid message type {0}")]
    InvalidKind(u8),
}

fn read_u32(buf: &[u8], offset: usize) -> Result<(u32, usize), PcCodecError> {
    let end = offset.checked_add(4).ok_or(PcCodecError::Truncated {
        need: 4,
        offset,
        have: buf.len(),
    })?;
    let bytes = buf.get(offset..end).ok_or(PcCodecError::Truncated {
        need: 4,
        offset,
        have: buf.len(),
    })?;
    let mut raw = [0u8; 4];
    raw.copy_from_slice(bytes);
    Ok((u32::from_le_bytes(raw), end))
}

fn read_u64(buf: &[u8], offset: usize) -> Result<(u64, usize), PcCodecError> {
    let end = offset.checked_add(8).ok_or(PcCodecError::Truncated {
        need: 8,
        offset,
        have: buf.len(),
    })?;
    let bytes = buf.get(offset..end).ok_or(PcCodecError::Truncated {
        need: 8,
        offset,
        have: buf.len(),
    })?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Ok((u64::from_le_bytes(raw), end))
}

fn read_uuid(buf: &[u8], offset: usize) -> Result<(Uuid, usize), PcCodecError> {
    let end = offset.checked_add(16).ok_or(PcCodecError::Truncated {
        need: 16,
        offset,
        have: buf.len(),
    })?;
    let bytes = buf.get(offset..end).ok_or(PcCodecError::Truncated {
        need: 16,
        offset,
        have: buf.len(),
    })?;
    let mut raw = [0u8; 16];
    raw.copy_from_slice(bytes);
    Ok((Uuid::from_bytes(raw), end))
}

fn write_bytes(buf: &mut [u8], offset: usize, bytes: &[u8]) -> Result<usize, PcCodecError> {
    let end = offset + bytes.len();
    if end > buf.len() {
        return Err(PcCodecError::Overflow {
            need: end,
            have: buf.len(),
        });
    }
    buf[offset..end].copy_from_slice(bytes);
    Ok(end)
}

/// Group member identity, as assigned by the group communication layer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemberId(Uuid);

impl MemberId {
    pub const WIRE_SIZE: usize = 16;

    pub fn new(uuid: Uuid) -> Self {
        MemberId(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Debug for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Cluster view identifier: the view's representative UUID plus a view
/// sequence, opaque to this layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ViewId {
    pub uuid: Uuid,
    pub seq: u32,
}

impl ViewId {
    pub const WIRE_SIZE: usize = 16 + 4;

    pub fn new(uuid: Uuid, seq: u32) -> Self {
        ViewId { uuid, seq }
    }

    fn read(buf: &[u8], offset: usize) -> Result<(ViewId, usize), PcCodecError> {
        let (uuid, offset) = read_uuid(buf, offset)?;
        let (seq, offset) = read_u32(buf, offset)?;
        Ok((ViewId { uuid, seq }, offset))
    }

    fn write(&self, buf: &mut [u8], offset: usize) -> Result<usize, PcCodecError> {
        let offset = write_bytes(buf, offset, self.uuid.as_bytes())?;
        write_bytes(buf, offset, &self.seq.to_le_bytes())
    }
}

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.uuid, self.seq)
    }
}

/// Per-member primary-component state record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PcInst {
    /// Last delivered sequence, [`NO_LAST_SEQ`] when unknown.
    pub last_seq: u32,
    /// Last primary view this member belonged to.
    pub last_prim: ViewId,
    /// Reserved total-order sequence, [`NO_TO_SEQ`] when unknown.
    pub to_seq: u64,
}

impl PcInst {
    pub const WIRE_SIZE: usize = 4 + ViewId::WIRE_SIZE + 8;

    pub fn new(last_seq: u32, last_prim: ViewId, to_seq: u64) -> Self {
        PcInst {
            last_seq,
            last_prim,
            to_seq,
        }
    }

    fn read(buf: &[u8], offset: usize) -> Result<(PcInst, usize), PcCodecError> {
        let (last_seq, offset) = read_u32(buf, offset)?;
        let (last_prim, offset) = ViewId::read(buf, offset)?;
        let (to_seq, offset) = read_u64(buf, offset)?;
        Ok((
            PcInst {
                last_seq,
                last_prim,
                to_seq,
            },
            offset,
        ))
    }

    fn write(&self, buf: &mut [u8], offset: usize) -> Result<usize, PcCodecError> {
        let offset = write_bytes(buf, offset, &self.last_seq.to_le_bytes())?;
        let offset = self.last_prim.write(buf, offset)?;
        write_bytes(buf, offset, &self.to_seq.to_le_bytes())
    }
}

impl Default for PcInst {
    fn default() -> Self {
        PcInst {
            last_seq: NO_LAST_SEQ,
            last_prim: ViewId::default(),
            to_seq: NO_TO_SEQ,
        }
    }
}

/// Map from member to its state record, ordered by member id on the wire.
pub type PcInstMap = BTreeMap<MemberId, PcInst>;

fn inst_map_wire_size(map: &PcInstMap) -> usize {
    4 + map.len() * (MemberId::WIRE_SIZE + PcInst::WIRE_SIZE)
}

fn read_inst_map(buf: &[u8], offset: usize) -> Result<(PcInstMap, usize), PcCodecError> {
    let (count, mut offset) = read_u32(buf, offset)?;
    let mut map = PcInstMap::new();
    for _ in 0..count {
        let (uuid, next) = read_uuid(buf, offset)?;
        let (inst, next) = PcInst::read(buf, next)?;
        map.insert(MemberId::new(uuid), inst);
        offset = next;
    }
    Ok((map, offset))
}

fn write_inst_map(map: &PcInstMap, buf: &mut [u8], offset: usize) -> Result<usize, PcCodecError> {
    let count = map.len() as u32;
    let mut offset = write_bytes(buf, offset, &count.to_le_bytes())?;
    for (member, inst) in map {
        offset = write_bytes(buf, offset, member.as_uuid().as_bytes())?;
        offset = inst.write(buf, offset)?;
    }
    Ok(offset)
}

/// Message types. `State` and `Install` carry an instance map, `User` does
/// not. The wire also reserves value 0 ("none"), which is never valid in a
/// serialised message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PcMessageKind {
    State = 1,
    Install = 2,
    User = 3,
}

impl PcMessageKind {
    fn from_wire(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(PcMessageKind::State),
            2 => Some(PcMessageKind::Install),
            3 => Some(PcMessageKind::User),
            _ => None,
        }
    }
}

/// A primary-component negotiation message.
///
/// Wire layout (little-endian, packed): one 32-bit header word holding
/// `version` in byte 0 and the type in byte 1 (bytes 2-3 zero), then the
/// 32-bit `seq`, then, for `State` and `Install` messages, the serialised
/// instance map.
#[derive(Clone, Debug)]
pub struct PcMessage {
    version: u8,
    kind: PcMessageKind,
    seq: u32,
    inst: Option<PcInstMap>,
}

impl PcMessage {
    /// A state-exchange message with an empty instance map.
    pub fn state(seq: u32) -> Self {
        PcMessage {
            version: PC_PROTO_VERSION,
            kind: PcMessageKind::State,
            seq,
            inst: Some(PcInstMap::new()),
        }
    }

    /// An install message with an empty instance map.
    pub fn install(seq: u32) -> Self {
        PcMessage {
            version: PC_PROTO_VERSION,
            kind: PcMessageKind::Install,
            seq,
            inst: Some(PcInstMap::new()),
        }
    }

    /// A user message. User messages carry no instance map and always have
    /// `seq = 0`; the sequencing of user payloads happens a layer above.
    pub fn user() -> Self {
        PcMessage {
            version: PC_PROTO_VERSION,
            kind: PcMessageKind::User,
            seq: 0,
            inst: None,
        }
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn kind(&self) -> PcMessageKind {
        self.kind
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn has_inst_map(&self) -> bool {
        self.inst.is_some()
    }

    pub fn inst_map(&self) -> Option<&PcInstMap> {
        self.inst.as_ref()
    }

    pub fn inst_map_mut(&mut self) -> Option<&mut PcInstMap> {
        self.inst.as_mut()
    }

    /// Serialised size in bytes.
    pub fn size(&self) -> usize {
        4 + 4 + self.inst.as_ref().map_or(0, inst_map_wire_size)
    }

    /// Decode from `buf` starting at `offset`; returns the offset one past
    /// the message. Any instance map held from a previous decode is
    /// released first, so decoding into the same message twice yields
    /// identical state.
    pub fn read(&mut self, buf: &[u8], offset: usize) -> Result<usize, PcCodecError> {
        self.inst = None;
        let (header, offset) = read_u32(buf, offset)?;
        let version = (header & 0xff) as u8;
        let raw_kind = ((header >> 8) & 0xff) as u8;
        if version != PC_PROTO_VERSION {
            return Err(PcCodecError::UnsupportedVersion(version));
        }
        let kind =
            PcMessageKind::from_wire(raw_kind).ok_or(PcCodecError::InvalidKind(raw_kind))?;
        let (seq, offset) = read_u32(buf, offset)?;

        self.version = version;
        self.kind = kind;
        self.seq = seq;

        match kind {
            PcMessageKind::State | PcMessageKind::Install => {
                let (map, offset) = read_inst_map(buf, offset)?;
                self.inst = Some(map);
                Ok(offset)
            }
            PcMessageKind::User => Ok(offset),
        }
    }

    /// Encode into `buf` starting at `offset`; returns the offset one past
    /// the message. A buffer with less than [`PcMessage::size`] bytes of
    /// room fails without writing anything.
    pub fn write(&self, buf: &mut [u8], offset: usize) -> Result<usize, PcCodecError> {
        let need = offset + self.size();
        if need > buf.len() {
            return Err(PcCodecError::Overflow {
                need,
                have: buf.len(),
            });
        }
        let header = ((self.kind as u32) << 8) | u32::from(self.version);
        let next = write_bytes(buf, offset, &header.to_le_bytes())?;
        let next = write_bytes(buf, next, &self.seq.to_le_bytes())?;
        match &self.inst {
            Some(map) => write_inst_map(map, buf, next),
            None => Ok(next),
        }
    }
}

impl PartialEq for PcMessage {
    /// Messages are equal iff version, type, seq and instance maps match.
    /// Comparing a map-carrying message against a map-less one of the same
    /// version/type/seq cannot happen in a correct program and panics.
    fn eq(&self, other: &Self) -> bool {
        if self.version != other.version || self.kind != other.kind || self.seq != other.seq {
            return false;
        }
        assert!(
            self.inst.is_some() == other.inst.is_some(),
            "pc message instance map presence mismatch"
        );
        match (&self.inst, &other.inst) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

impl Eq for PcMessage {}
