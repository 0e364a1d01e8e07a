//! Magnet URI parsing (BEP 9)
//!
//! Supports the `xt=urn:btih:` exact topic in hex and base32 forms plus the
//! common `dn`, `tr` and `x.pe` parameters.

use std::net::SocketAddr;

use url::Url;

use crate::error::{EngineError, ProtocolErrorKind, Result};
use crate::types::InfoHash;

/// A parsed magnet link.
#[derive(Debug, Clone)]
pub struct MagnetUri {
    /// Torrent identity
    pub info_hash: InfoHash,
    /// Display name, if present
    pub name: Option<String>,
    /// Tracker URLs in the order given; each `tr` becomes its own tier
    pub trackers: Vec<String>,
    /// Fixed peer addresses (`x.pe`)
    pub peers: Vec<SocketAddr>,
}

fn invalid(message: impl Into<String>) -> EngineError {
    EngineError::protocol(ProtocolErrorKind::InvalidMagnet, message)
}

impl MagnetUri {
    /// Parse a `magnet:` URI.
    pub fn parse(uri: &str) -> Result<Self> {
        let url = Url::parse(uri).map_err(|e| invalid(e.to_string()))?;
        if url.scheme() != "magnet" {
            return Err(invalid(format!("not a magnet URI: scheme {:?}", url.scheme())));
        }

        let mut info_hash = None;
        let mut name = None;
        let mut trackers = Vec::new();
        let mut peers = Vec::new();

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => {
                    let topic = value
                        .strip_prefix("urn:btih:")
                        .ok_or_else(|| invalid(format!("unsupported exact topic {:?}", value)))?;
                    info_hash = Some(decode_btih(topic)?);
                }
                "dn" => name = Some(value.into_owned()),
                "tr" => trackers.push(value.into_owned()),
                "x.pe" => {
                    if let Ok(addr) = value.parse::<SocketAddr>() {
                        peers.push(addr);
                    } else {
                        tracing::debug!("ignoring unparsable x.pe peer {:?}", value);
                    }
                }
                _ => {}
            }
        }

        let info_hash = info_hash.ok_or_else(|| invalid("missing xt=urn:btih: parameter"))?;

        Ok(Self {
            info_hash,
            name,
            trackers,
            peers,
        })
    }

    /// Display name, falling back to the hex info-hash.
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            self.info_hash
                .iter()
                .map(|b| format!("{:02x}", b))
                .collect()
        })
    }

    /// Tracker tiers in announce-list form: one tracker per tier, as magnet
    /// links carry no tier grouping.
    pub fn tracker_tiers(&self) -> Vec<Vec<String>> {
        self.trackers.iter().map(|t| vec![t.clone()]).collect()
    }
}

/// Decode a btih topic: 40 hex chars or 32 base32 chars.
fn decode_btih(topic: &str) -> Result<InfoHash> {
    match topic.len() {
        40 => {
            let mut hash = [0u8; 20];
            for (i, byte) in hash.iter_mut().enumerate() {
                let pair = &topic[i * 2..i * 2 + 2];
                *byte = u8::from_str_radix(pair, 16)
                    .map_err(|_| invalid(format!("invalid hex info-hash {:?}", topic)))?;
            }
            Ok(hash)
        }
        32 => decode_base32(topic),
        n => Err(invalid(format!("info-hash has invalid length {}", n))),
    }
}

/// RFC 4648 base32 without padding, as used by older magnet links.
fn decode_base32(s: &str) -> Result<InfoHash> {
    let mut hash = [0u8; 20];
    let mut acc: u64 = 0;
    let mut bits = 0;
    let mut out = 0;

    for c in s.bytes() {
        let value = match c {
            b'A'..=b'Z' => c - b'A',
            b'a'..=b'z' => c - b'a',
            b'2'..=b'7' => c - b'2' + 26,
            _ => return Err(invalid(format!("invalid base32 character {:?}", c as char))),
        };
        acc = (acc << 5) | value as u64;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            hash[out] = (acc >> bits) as u8;
            out += 1;
        }
    }

    if out != 20 {
        return Err(invalid("base32 info-hash does not decode to 20 bytes"));
    }
    Ok(hash)
}
