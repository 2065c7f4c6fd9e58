use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

use bitflags::bitflags;
use thiserror::Error;

use crate::device_registry::DeviceKey;
use crate::identity::NodeId;
use crate::uuid_registry::{NodeHash, UuidRegistry};

pub const MAGIC: u16 = 0x4D49;
pub const VERSION: u8 = 0x01;
pub const HEADER_LEN: usize = 20;
pub const MAX_HOPS: u8 = 8;

const CONTEXT_EXT_TYPE: u8 = 0x01;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PacketFlags: u8 {
        const SYSEX       = 0b0000_0001;
        const RELIABLE    = 0b0000_0010;
        const FRAGMENT    = 0b0000_0100;
        const HAS_CONTEXT = 0b0000_1000;
        const ACK         = 0b0001_0000;
        const NACK        = 0b0010_0000;
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet shorter than the {HEADER_LEN}-byte header")]
    TooShort,
    #[error("bad magic number")]
    BadMagic,
    #[error("unsupported protocol version")]
    UnsupportedVersion,
    #[error("context extension truncated")]
    TruncatedContext,
    #[error("context extension length field does not match device count")]
    ContextLengthMismatch,
    #[error("context device count exceeds maximum hops")]
    ContextDeviceCountMismatch,
    #[error("fragment flag is set but fragmentation is not supported")]
    FragmentUnsupported,
    #[error("destination buffer too small to hold encoded packet")]
    BufferTooSmall,
}

/// Forwarding metadata carried by packets that may cross more than one hop:
/// a hop counter bounding chain length and a visited-device set catching
/// short cycles a counter alone would only notice after the fact.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ForwardingContext {
    pub hop_count: u8,
    pub visited: BTreeSet<(NodeHash, u16)>,
}

impl ForwardingContext {
    pub fn fresh(first_hop: DeviceKey, first_hop_hash: NodeHash) -> Self {
        let mut visited = BTreeSet::new();
        visited.insert((first_hop_hash, first_hop.device_id));
        Self { hop_count: 1, visited }
    }

    pub fn contains(&self, hash: NodeHash, device_id: u16) -> bool {
        self.visited.contains(&(hash, device_id))
    }

    pub fn extend(&self, hash: NodeHash, device_id: u16) -> Self {
        let mut visited = self.visited.clone();
        visited.insert((hash, device_id));
        Self { hop_count: self.hop_count + 1, visited }
    }

    fn encoded_len(&self) -> usize {
        4 + 6 * self.visited.len()
    }

    fn encode(&self, out: &mut Vec<u8>) {
        let len = self.encoded_len() as u8;
        out.push(CONTEXT_EXT_TYPE);
        out.push(len);
        out.push(self.hop_count);
        out.push(self.visited.len() as u8);
        for (hash, device_id) in &self.visited {
            out.extend_from_slice(&hash.to_be_bytes());
            out.extend_from_slice(&device_id.to_be_bytes());
        }
    }

    fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < 2 {
            return Err(PacketError::TruncatedContext);
        }
        let ext_type = bytes[0];
        let ext_len = bytes[1] as usize;
        if ext_type != CONTEXT_EXT_TYPE {
            return Err(PacketError::TruncatedContext);
        }
        if bytes.len() < 2 + ext_len || ext_len < 2 {
            return Err(PacketError::TruncatedContext);
        }
        let hop_count = bytes[2];
        let device_count = bytes[3] as usize;
        if 4 + 6 * device_count != ext_len {
            return Err(PacketError::ContextLengthMismatch);
        }
        if device_count > MAX_HOPS as usize {
            return Err(PacketError::ContextDeviceCountMismatch);
        }
        let mut visited = BTreeSet::new();
        let mut cursor = 4;
        for _ in 0..device_count {
            let hash = u32::from_be_bytes(bytes[cursor..cursor + 4].try_into().unwrap());
            let device_id = u16::from_be_bytes(bytes[cursor + 4..cursor + 6].try_into().unwrap());
            visited.insert((hash, device_id));
            cursor += 6;
        }
        Ok(Self { hop_count, visited })
    }
}

/// On-wire record carrying a MIDI payload (or nothing, for heartbeats and
/// ack/nack) between two nodes, identified by their 32-bit compressed
/// node hashes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub flags: PacketFlags,
    pub source_hash: NodeHash,
    pub dest_hash: NodeHash,
    pub sequence: u16,
    pub timestamp_us: u32,
    pub device_id: u16,
    pub payload: Vec<u8>,
    pub context: Option<ForwardingContext>,
    /// Populated only when a [`UuidRegistry`] resolved the hash on decode.
    pub source_node: Option<NodeId>,
}

impl Packet {
    fn base(source_hash: NodeHash, dest_hash: NodeHash, sequence: u16, device_id: u16) -> Self {
        Self {
            flags: PacketFlags::empty(),
            source_hash,
            dest_hash,
            sequence,
            timestamp_us: current_micros(),
            device_id,
            payload: Vec::new(),
            context: None,
            source_node: None,
        }
    }

    pub fn data(source_hash: NodeHash, dest_hash: NodeHash, sequence: u16, device_id: u16, payload: Vec<u8>) -> Self {
        let mut packet = Self::base(source_hash, dest_hash, sequence, device_id);
        packet.set_payload(payload);
        packet
    }

    pub fn heartbeat(source_hash: NodeHash, dest_hash: NodeHash, sequence: u16) -> Self {
        Self::base(source_hash, dest_hash, sequence, 0)
    }

    pub fn ack(source_hash: NodeHash, dest_hash: NodeHash, acked_sequence: u16) -> Self {
        let mut packet = Self::base(source_hash, dest_hash, acked_sequence, 0);
        packet.flags.insert(PacketFlags::ACK);
        packet
    }

    pub fn nack(source_hash: NodeHash, dest_hash: NodeHash, nacked_sequence: u16) -> Self {
        let mut packet = Self::base(source_hash, dest_hash, nacked_sequence, 0);
        packet.flags.insert(PacketFlags::NACK);
        packet
    }

    pub fn is_ack(&self) -> bool {
        self.flags.contains(PacketFlags::ACK)
    }

    pub fn is_nack(&self) -> bool {
        self.flags.contains(PacketFlags::NACK)
    }

    /// Replaces the payload, auto-flagging SysEx (and therefore reliable
    /// delivery) whenever the first byte is a SysEx status byte.
    pub fn set_payload(&mut self, payload: Vec<u8>) {
        if payload.first() == Some(&0xF0) {
            self.flags.insert(PacketFlags::SYSEX | PacketFlags::RELIABLE);
        }
        self.payload = payload;
    }

    pub fn set_context(&mut self, context: ForwardingContext) {
        self.flags.insert(PacketFlags::HAS_CONTEXT);
        self.context = Some(context);
    }

    pub fn update_timestamp(&mut self) {
        self.timestamp_us = current_micros();
    }

    pub fn is_reliable(&self) -> bool {
        self.flags.contains(PacketFlags::RELIABLE)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        self.encode_into_vec(&mut out);
        out
    }

    fn encode_into_vec(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&MAGIC.to_be_bytes());
        out.push(VERSION);
        out.push(self.flags.bits());
        out.extend_from_slice(&self.source_hash.to_be_bytes());
        out.extend_from_slice(&self.dest_hash.to_be_bytes());
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&self.timestamp_us.to_be_bytes());
        out.extend_from_slice(&self.device_id.to_be_bytes());
        out.extend_from_slice(&self.payload);
        if let Some(ctx) = &self.context {
            ctx.encode(out);
        }
    }

    /// Zero-copy encode into a caller-supplied buffer; fails without writing
    /// when the buffer is too small.
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<usize, PacketError> {
        let mut scratch = Vec::with_capacity(HEADER_LEN + self.payload.len());
        self.encode_into_vec(&mut scratch);
        if buf.len() < scratch.len() {
            return Err(PacketError::BufferTooSmall);
        }
        buf[..scratch.len()].copy_from_slice(&scratch);
        Ok(scratch.len())
    }

    /// Decode without resolving node hashes to full [`NodeId`]s.
    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        Self::decode_with_registry(bytes, None)
    }

    /// Decode, additionally resolving `source_hash` to a [`NodeId`] via the
    /// registry when known. A packet whose source hash is unknown is still
    /// returned with `source_node = None`; only context extraction strictly
    /// needs the registry, and even that degrades gracefully.
    pub fn decode_with_registry(bytes: &[u8], registry: Option<&UuidRegistry>) -> Result<Self, PacketError> {
        if bytes.len() < HEADER_LEN {
            return Err(PacketError::TooShort);
        }
        let magic = u16::from_be_bytes(bytes[0..2].try_into().unwrap());
        if magic != MAGIC {
            return Err(PacketError::BadMagic);
        }
        let version = bytes[2];
        if version != VERSION {
            return Err(PacketError::UnsupportedVersion);
        }
        let flags = PacketFlags::from_bits_truncate(bytes[3]);
        if flags.contains(PacketFlags::FRAGMENT) {
            return Err(PacketError::FragmentUnsupported);
        }
        let source_hash = u32::from_be_bytes(bytes[4..8].try_into().unwrap());
        let dest_hash = u32::from_be_bytes(bytes[8..12].try_into().unwrap());
        let sequence = u16::from_be_bytes(bytes[12..14].try_into().unwrap());
        let timestamp_us = u32::from_be_bytes(bytes[14..18].try_into().unwrap());
        let device_id = u16::from_be_bytes(bytes[18..20].try_into().unwrap());

        let rest = &bytes[HEADER_LEN..];
        let (payload, context) = if flags.contains(PacketFlags::HAS_CONTEXT) {
            split_payload_and_context(rest)?
        } else {
            (rest.to_vec(), None)
        };

        let source_node = registry.and_then(|r| r.lookup_by_hash(source_hash));

        Ok(Self {
            flags,
            source_hash,
            dest_hash,
            sequence,
            timestamp_us,
            device_id,
            payload,
            context,
            source_node,
        })
    }
}

/// Locates the context extension by scanning from the end: the extension's
/// own length byte tells us exactly how many trailing bytes it occupies.
fn split_payload_and_context(rest: &[u8]) -> Result<(Vec<u8>, Option<ForwardingContext>), PacketError> {
    if rest.len() < 2 {
        return Err(PacketError::TruncatedContext);
    }
    // The extension is always appended last, so try every plausible split
    // point from the end: ext_len is 2 header bytes + a body whose size must
    // exactly match ext_len to be accepted. Scanning from the conservative
    // minimum keeps this O(1) in practice since ext_len is stored explicitly.
    for split in (0..=rest.len() - 2).rev() {
        let candidate = &rest[split..];
        let ext_type = candidate[0];
        let ext_len = candidate[1] as usize;
        if ext_type == CONTEXT_EXT_TYPE && candidate.len() >= 2 + ext_len {
            if let Ok(ctx) = ForwardingContext::decode(candidate) {
                return Ok((rest[..split].to_vec(), Some(ctx)));
            }
        }
    }
    Err(PacketError::TruncatedContext)
}

fn current_micros() -> u32 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    now.as_micros() as u32
}
