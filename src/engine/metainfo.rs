//! BitTorrent v1 metainfo construction and piece hashing.
//!
//! Builds a single-file, trackerless (DHT-only) `.torrent` metainfo dict
//! from a file on disk at a fixed piece length, and computes its v1
//! infohash. The dict shape mirrors the standard BEP-3 `info` dictionary;
//! field naming follows the inherited torrent-parsing model, adapted for
//! building rather than only parsing.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::io::Read;
use std::path::Path;

use crate::error::{LbsdError, Result};

pub const PIECE_LENGTH: i64 = 256 * 1024;

#[derive(Debug, Serialize, Deserialize)]
pub struct Info {
    pub name: String,
    pub length: i64,
    #[serde(rename = "piece length")]
    pub piece_length: i64,
    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,
    #[serde(default)]
    pub private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Metainfo {
    #[serde(default)]
    pub announce: Option<String>,
    pub info: Info,
    #[serde(default)]
    #[serde(rename = "creation date")]
    pub creation_date: Option<u64>,
}

pub type BtInfoHash = [u8; 20];

/// Reads `path` in fixed-size chunks, SHA-1 hashing each piece, and returns
/// the built metainfo plus its computed v1 infohash. Trackerless: `announce`
/// is left unset so the torrent is DHT-only, per the engine's contract.
pub fn build_from_file(path: &Path) -> Result<(Metainfo, BtInfoHash)> {
    let metadata = std::fs::metadata(path)?;
    let length = metadata.len() as i64;

    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| LbsdError::Validation("file path has no valid file name".to_string()))?
        .to_string();

    let mut file = std::fs::File::open(path)?;
    let mut pieces = Vec::new();
    let mut buf = vec![0u8; PIECE_LENGTH as usize];

    loop {
        let n = read_up_to(&mut file, &mut buf)?;
        if n == 0 {
            break;
        }
        let digest = Sha1::digest(&buf[..n]);
        pieces.extend_from_slice(&digest);
        if n < buf.len() {
            break;
        }
    }

    let info = Info {
        name,
        length,
        piece_length: PIECE_LENGTH,
        pieces,
        private: None,
    };

    let info_bytes = serde_bencode::to_bytes(&info)
        .map_err(|e| LbsdError::Engine(format!("bencoding info dict: {e}")))?;
    let infohash: BtInfoHash = Sha1::digest(&info_bytes).into();

    let metainfo = Metainfo {
        announce: None,
        info,
        creation_date: Some(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        ),
    };

    Ok((metainfo, infohash))
}

fn read_up_to(file: &mut std::fs::File, buf: &mut [u8]) -> Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = file.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

pub fn infohash_hex(hash: &BtInfoHash) -> String {
    hex::encode(hash)
}
