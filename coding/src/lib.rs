//! Encode data to enable recovery from a subset of fragments.
//!
//! # Overview
//!
//! A payload is padded, split into `data_shards` equal rows, and extended with `parity_shards`
//! rows of Reed-Solomon parity computed over GF(2^8) by [reed_solomon_erasure]. Any `data_shards`
//! of the `data_shards + parity_shards` rows are enough to recover the payload.
//!
//! A configuration without parity (one or two servers) is a plain split: every data row must be
//! delivered.
//!
//! # Padding
//!
//! The encoder always appends [PADDING_MARKER] followed by as many zero bytes as needed to make
//! the length a multiple of `data_shards`. To strip, the decoder counts back over the trailing
//! zero run and removes one more byte for the marker (`padding = 1; while zero { padding += 1 }`).
//! Payloads ending in zero bytes therefore round-trip unchanged.
//!
//! # Example
//!
//! ```
//! use shardline_coding::{decode, encode, Config};
//!
//! // Three servers with one shard each: two data shards and one parity shard.
//! let config = Config::for_servers(3, 1).unwrap();
//! assert_eq!((config.data_shards, config.parity_shards), (2, 1));
//!
//! let encoded = encode(&config, b"HelloWorld").unwrap();
//! assert_eq!(encoded.shards.len(), 3);
//!
//! // Lose shard 1.
//! let mut shards = encoded.shards.clone();
//! shards[1] = vec![0; encoded.shard_length];
//! let present = [true, false, true];
//!
//! let payload = decode(&config, encoded.shard_length, &mut shards, &present).unwrap();
//! assert_eq!(payload, b"HelloWorld");
//! ```

use reed_solomon_erasure::galois_8::ReedSolomon;
use std::ops::Range;
use thiserror::Error;

/// Maximum number of shards (data plus parity) a single encoding may produce.
///
/// Bounded by the size of GF(2^8).
pub const MAX_TOTAL_SHARDS: usize = 256;

/// Byte written immediately after the payload, before the zero padding.
pub const PADDING_MARKER: u8 = 0x80;

/// Errors that can occur when encoding or decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("payload is empty")]
    EmptyPayload,
    #[error("at least one server is required")]
    NoServers,
    #[error("at least one shard per server is required")]
    NoShardsPerServer,
    #[error("at least one data shard is required")]
    NoDataShards,
    #[error("too many shards: {0} > 256")]
    TooManyShards(usize),
    #[error("invalid shard count: expected {expected}, found {found}")]
    InvalidShardCount { expected: usize, found: usize },
    #[error("invalid shard length: expected {expected}, found {found}")]
    InvalidShardLength { expected: usize, found: usize },
    #[error("not enough shards: {present} < {required}")]
    NotEnoughShards { present: usize, required: usize },
    #[error("invalid padding")]
    InvalidPadding,
    #[error("reed-solomon: {0}")]
    ReedSolomon(String),
}

impl From<reed_solomon_erasure::Error> for Error {
    fn from(err: reed_solomon_erasure::Error) -> Self {
        match err {
            reed_solomon_erasure::Error::TooFewDataShards => Error::NoDataShards,
            other => Error::ReedSolomon(other.to_string()),
        }
    }
}

/// Coding parameters shared by every shard of an encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Config {
    /// Number of shards holding (padded) payload bytes.
    pub data_shards: u16,

    /// Number of shards holding parity.
    pub parity_shards: u16,
}

impl Config {
    /// Creates a configuration, checking that it can be encoded.
    pub fn new(data_shards: u16, parity_shards: u16) -> Result<Self, Error> {
        if data_shards == 0 {
            return Err(Error::NoDataShards);
        }
        let total = usize::from(data_shards) + usize::from(parity_shards);
        if total > MAX_TOTAL_SHARDS {
            return Err(Error::TooManyShards(total));
        }
        Ok(Self {
            data_shards,
            parity_shards,
        })
    }

    /// Derives the configuration for a set of `servers` that each own `shards_per_server`
    /// contiguous shard indices.
    ///
    /// The encoding tolerates the loss of `(servers - 1) / 2` servers: that many servers' worth
    /// of shards are parity, the rest are data.
    pub fn for_servers(servers: u16, shards_per_server: u16) -> Result<Self, Error> {
        if servers == 0 {
            return Err(Error::NoServers);
        }
        if shards_per_server == 0 {
            return Err(Error::NoShardsPerServer);
        }
        let total = usize::from(servers) * usize::from(shards_per_server);
        if total > MAX_TOTAL_SHARDS {
            return Err(Error::TooManyShards(total));
        }
        let tolerated = (servers - 1) / 2;
        Self::new(
            (servers - tolerated) * shards_per_server,
            tolerated * shards_per_server,
        )
    }

    /// Returns the total number of shards produced by this configuration.
    pub fn total_shards(&self) -> u16 {
        self.data_shards + self.parity_shards
    }

    /// Returns the shard indices owned by `server` when each server owns `shards_per_server`.
    pub fn slice(server: u16, shards_per_server: u16) -> Range<usize> {
        let start = usize::from(server) * usize::from(shards_per_server);
        start..start + usize::from(shards_per_server)
    }

    /// Returns the length of each shard for a payload of `len` bytes.
    pub fn shard_length(&self, len: usize) -> usize {
        let data = usize::from(self.data_shards);
        (len + 1).div_ceil(data)
    }
}

/// The output of [encode].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    /// Parameters used to produce the shards.
    pub config: Config,

    /// Length of every shard, in bytes.
    pub shard_length: usize,

    /// All shards: `data_shards` data rows followed by `parity_shards` parity rows.
    pub shards: Vec<Vec<u8>>,
}

/// Appends the marker and zero padding so that the length is a multiple of `data_shards`.
pub fn pad(payload: &[u8], data_shards: usize) -> Vec<u8> {
    assert!(data_shards > 0, "pad: data_shards must be non-zero");
    let padded_len = (payload.len() + 1).div_ceil(data_shards) * data_shards;
    let mut padded = Vec::with_capacity(padded_len);
    padded.extend_from_slice(payload);
    padded.push(PADDING_MARKER);
    padded.resize(padded_len, 0);
    padded
}

/// Removes the padding written by [pad].
pub fn strip_padding(data: &mut Vec<u8>) -> Result<(), Error> {
    let len = data.len();
    let mut padding = 1;
    while padding <= len && data[len - padding] == 0 {
        padding += 1;
    }
    if padding > len || data[len - padding] != PADDING_MARKER {
        return Err(Error::InvalidPadding);
    }
    data.truncate(len - padding);
    Ok(())
}

/// Returns the parity coder for `config`, or `None` when there is no parity to compute.
fn coder(config: &Config) -> Result<Option<ReedSolomon>, Error> {
    if config.parity_shards == 0 {
        return Ok(None);
    }
    let rs = ReedSolomon::new(
        usize::from(config.data_shards),
        usize::from(config.parity_shards),
    )?;
    Ok(Some(rs))
}

/// Pads `payload` and encodes it into `config.total_shards()` shards.
pub fn encode(config: &Config, payload: &[u8]) -> Result<Encoded, Error> {
    if payload.is_empty() {
        return Err(Error::EmptyPayload);
    }
    let data_shards = usize::from(config.data_shards);
    let rs = coder(config)?;

    let padded = pad(payload, data_shards);
    let shard_length = padded.len() / data_shards;
    let mut shards: Vec<Vec<u8>> = padded.chunks(shard_length).map(<[u8]>::to_vec).collect();
    if let Some(rs) = rs {
        shards.resize(rs.total_shard_count(), vec![0u8; shard_length]);
        rs.encode(&mut shards)?;
    }

    Ok(Encoded {
        config: *config,
        shard_length,
        shards,
    })
}

/// Recovers the payload from the rows of `shards` marked in `present`.
///
/// Missing data rows are rebuilt in place. Rows not marked present are ignored, whatever
/// their contents. Fewer than `data_shards` present rows yields [Error::NotEnoughShards].
pub fn decode(
    config: &Config,
    shard_length: usize,
    shards: &mut [Vec<u8>],
    present: &[bool],
) -> Result<Vec<u8>, Error> {
    let data_shards = usize::from(config.data_shards);
    let total = usize::from(config.total_shards());
    for found in [shards.len(), present.len()] {
        if found != total {
            return Err(Error::InvalidShardCount {
                expected: total,
                found,
            });
        }
    }
    for (row, _) in shards.iter().zip(present).filter(|(_, &p)| p) {
        if row.len() != shard_length {
            return Err(Error::InvalidShardLength {
                expected: shard_length,
                found: row.len(),
            });
        }
    }
    let available = present.iter().filter(|&&p| p).count();
    if available < data_shards {
        return Err(Error::NotEnoughShards {
            present: available,
            required: data_shards,
        });
    }

    // Without parity, every data row is present here.
    if let Some(rs) = coder(config)? {
        if present[..data_shards].iter().any(|&p| !p) {
            let mut rows: Vec<Option<Vec<u8>>> = shards
                .iter_mut()
                .zip(present)
                .map(|(row, &p)| p.then(|| std::mem::take(row)))
                .collect();
            rs.reconstruct_data(&mut rows)?;
            for (row, rebuilt) in shards.iter_mut().zip(rows) {
                if let Some(rebuilt) = rebuilt {
                    *row = rebuilt;
                }
            }
        }
    }

    let mut payload = Vec::with_capacity(data_shards * shard_length);
    for row in shards.iter().take(data_shards) {
        payload.extend_from_slice(row);
    }
    strip_padding(&mut payload)?;
    Ok(payload)
}
