//! The unit exchanged between servers: a batch of shards belonging to one session.

use bytes::{Buf, BufMut, Bytes};
use sha2::{Digest, Sha256};
use shardline_codec::{
    EncodeSize, Error as CodecError, FixedSize, RangeCfg, Read, ReadExt, Write,
};
use shardline_coding::{Config as CodingConfig, Encoded, MAX_TOTAL_SHARDS};
use std::{collections::HashSet, fmt};
use uuid::Uuid;

/// SHA-256 digest of an original (unpadded) payload.
pub type Commitment = [u8; 32];

/// Computes the [Commitment] of a payload.
pub fn commit(payload: &[u8]) -> Commitment {
    Sha256::digest(payload).into()
}

/// Identifier shared by every shard of one logical transaction.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId([u8; 16]);

impl SessionId {
    /// Generates a new random identifier.
    pub fn random() -> Self {
        Self(Uuid::new_v4().into_bytes())
    }

    /// Returns the raw bytes of the identifier.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl From<[u8; 16]> for SessionId {
    fn from(value: [u8; 16]) -> Self {
        Self(value)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Uuid::from_bytes(self.0).hyphenated().fmt(f)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Whether shards carry a request (dispatched on reconstruction) or the response to one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Request,
    Response,
}

impl Direction {
    fn to_u8(self) -> u8 {
        match self {
            Self::Request => 0,
            Self::Response => 1,
        }
    }
}

/// Key under which a session's aggregator is registered.
///
/// A request and its response share a session id but never an aggregator.
pub type Key = (SessionId, Direction);

/// Coding parameters shared by every envelope of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Parameters {
    pub total_shards: u16,
    pub data_shards: u16,
    pub parity_shards: u16,
    pub shard_length: usize,
}

impl Parameters {
    /// Parameters describing the output of an encoding.
    pub fn from_encoded(encoded: &Encoded) -> Self {
        Self {
            total_shards: encoded.config.total_shards(),
            data_shards: encoded.config.data_shards,
            parity_shards: encoded.config.parity_shards,
            shard_length: encoded.shard_length,
        }
    }

    /// The coding configuration these parameters describe.
    pub fn coding(&self) -> CodingConfig {
        CodingConfig {
            data_shards: self.data_shards,
            parity_shards: self.parity_shards,
        }
    }
}

/// Fields common to every envelope of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub session: SessionId,
    pub direction: Direction,
    pub request_type: u16,
    pub parameters: Parameters,
    pub commitment: Commitment,
}

impl Header {
    /// Returns the registry key of the session.
    pub fn key(&self) -> Key {
        (self.session, self.direction)
    }

    /// Splits an encoding into one envelope per server, where server `i` receives the shards in
    /// [CodingConfig::slice]`(i, shards_per_server)`.
    ///
    /// When the total is not a multiple of `shards_per_server`, the last envelope carries the
    /// remainder.
    pub fn split(&self, encoded: &Encoded, shards_per_server: u16) -> Vec<ShardEnvelope> {
        let total = encoded.shards.len();
        let per_server = shards_per_server.max(1);
        let servers = total.div_ceil(usize::from(per_server));
        (0..servers)
            .map(|server| {
                let range = CodingConfig::slice(server as u16, per_server);
                let range = range.start..range.end.min(total);
                let indices: Vec<u16> = range.clone().map(|i| i as u16).collect();
                let payloads = encoded.shards[range]
                    .iter()
                    .map(|shard| Bytes::copy_from_slice(shard))
                    .collect();
                ShardEnvelope {
                    header: *self,
                    relay: false,
                    indices,
                    payloads,
                }
            })
            .collect()
    }
}

/// A batch of shards of one session, as posted between servers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardEnvelope {
    pub header: Header,

    /// Whether the receiver must re-broadcast this envelope to its peers.
    pub relay: bool,

    /// Slots occupied by `payloads`, in the same order.
    pub indices: Vec<u16>,

    /// Shard contents, each exactly `shard_length` bytes.
    pub payloads: Vec<Bytes>,
}

impl ShardEnvelope {
    /// Returns the registry key of the session.
    pub fn key(&self) -> Key {
        self.header.key()
    }

    /// Iterates over `(slot, payload)` pairs.
    pub fn shards(&self) -> impl Iterator<Item = (usize, &Bytes)> {
        self.indices
            .iter()
            .map(|&i| usize::from(i))
            .zip(self.payloads.iter())
    }

    /// Returns a copy with the relay flag set to `relay`.
    pub fn with_relay(&self, relay: bool) -> Self {
        Self {
            relay,
            ..self.clone()
        }
    }
}

/// Limits applied when decoding envelopes from untrusted peers.
#[derive(Clone, Copy, Debug)]
pub struct CodecConfig {
    /// The maximum number of shards (data plus parity) a session may declare.
    pub max_shards: usize,

    /// The maximum length of a single shard, in bytes.
    pub max_shard_length: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            max_shards: MAX_TOTAL_SHARDS,
            max_shard_length: 4 * 1024 * 1024,
        }
    }
}

impl Write for ShardEnvelope {
    fn write(&self, buf: &mut impl BufMut) {
        self.header.session.0.write(buf);
        self.header.direction.to_u8().write(buf);
        self.header.request_type.write(buf);
        self.relay.write(buf);
        let parameters = &self.header.parameters;
        parameters.total_shards.write(buf);
        parameters.data_shards.write(buf);
        parameters.parity_shards.write(buf);
        parameters.shard_length.write(buf);
        self.header.commitment.write(buf);
        self.indices.write(buf);
        self.payloads.write(buf);
    }
}

impl EncodeSize for ShardEnvelope {
    fn encode_size(&self) -> usize {
        <[u8; 16]>::SIZE
            + u8::SIZE
            + u16::SIZE
            + bool::SIZE
            + 3 * u16::SIZE
            + self.header.parameters.shard_length.encode_size()
            + Commitment::SIZE
            + self.indices.encode_size()
            + self.payloads.encode_size()
    }
}

impl Read for ShardEnvelope {
    type Cfg = CodecConfig;

    fn read_cfg(buf: &mut impl Buf, cfg: &Self::Cfg) -> Result<Self, CodecError> {
        let session = SessionId(<[u8; 16]>::read(buf)?);
        let direction = match u8::read(buf)? {
            0 => Direction::Request,
            1 => Direction::Response,
            _ => return Err(CodecError::Invalid("ShardEnvelope", "unknown direction")),
        };
        let request_type = u16::read(buf)?;
        let relay = bool::read(buf)?;

        // Coding parameters
        let total_shards = u16::read(buf)?;
        let data_shards = u16::read(buf)?;
        let parity_shards = u16::read(buf)?;
        if data_shards == 0 {
            return Err(CodecError::Invalid("ShardEnvelope", "no data shards"));
        }
        if u32::from(data_shards) + u32::from(parity_shards) != u32::from(total_shards) {
            return Err(CodecError::Invalid(
                "ShardEnvelope",
                "total shards does not match data and parity",
            ));
        }
        let total = usize::from(total_shards);
        if total > cfg.max_shards.min(MAX_TOTAL_SHARDS) {
            return Err(CodecError::InvalidLength(total));
        }
        let shard_length = usize::read_cfg(buf, &RangeCfg::new(1..=cfg.max_shard_length))?;
        let commitment = Commitment::read(buf)?;

        // Shards
        let indices = Vec::<u16>::read_cfg(buf, &(RangeCfg::new(1..=total), ()))?;
        let mut seen = HashSet::with_capacity(indices.len());
        for &index in &indices {
            if usize::from(index) >= total {
                return Err(CodecError::Invalid("ShardEnvelope", "index out of range"));
            }
            if !seen.insert(index) {
                return Err(CodecError::Invalid("ShardEnvelope", "duplicate index"));
            }
        }
        let payloads = Vec::<Bytes>::read_cfg(
            buf,
            &(RangeCfg::exact(indices.len()), RangeCfg::exact(shard_length)),
        )?;

        Ok(Self {
            header: Header {
                session,
                direction,
                request_type,
                parameters: Parameters {
                    total_shards,
                    data_shards,
                    parity_shards,
                    shard_length,
                },
                commitment,
            },
            relay,
            indices,
            payloads,
        })
    }
}
