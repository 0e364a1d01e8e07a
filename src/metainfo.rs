//! Torrent metainfo decoding
//!
//! Parses `.torrent` files (BEP 3) into [`Metainfo`], computing the
//! info-hash from the raw bytes of the info dictionary. Announce tiers
//! follow BEP 12 and webseed URLs follow BEP 19.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use sha1::{Digest, Sha1};

use crate::bencode::{self, BencodeValue};
use crate::error::{EngineError, ProtocolErrorKind, Result};
use crate::types::InfoHash;

/// SHA-1 piece hash (20 bytes).
pub type Sha1Hash = [u8; 20];

/// Parsed torrent metainfo.
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// SHA-1 of the bencoded info dictionary
    pub info_hash: InfoHash,
    /// The info dictionary
    pub info: Arc<Info>,
    /// Primary announce URL
    pub announce: Option<String>,
    /// Announce tiers (BEP 12)
    pub announce_list: Vec<Vec<String>>,
    /// Webseed URLs (BEP 19)
    pub url_list: Vec<String>,
    /// Creation timestamp, Unix epoch
    pub creation_date: Option<i64>,
    /// Free-form comment
    pub comment: Option<String>,
    /// Creating client
    pub created_by: Option<String>,
}

/// The info dictionary: the piece geometry and file layout of a torrent.
#[derive(Debug, Clone)]
pub struct Info {
    /// Suggested name for the file or directory
    pub name: String,
    /// Bytes per piece (the last piece may be shorter)
    pub piece_length: u64,
    /// SHA-1 hash per piece
    pub pieces: Vec<Sha1Hash>,
    /// Files mapped onto the linear byte space, in order
    pub files: Vec<FileInfo>,
    /// Total length of all files
    pub total_size: u64,
    /// Single-file torrents store data directly under `name`
    pub is_single_file: bool,
    /// Private flag (BEP 27)
    pub private: bool,
}

/// A single file within the torrent's byte space.
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Path relative to the torrent directory (or the file name itself for
    /// single-file torrents)
    pub path: PathBuf,
    /// File size in bytes
    pub length: u64,
    /// Offset of the file's first byte in the torrent's byte space
    pub offset: u64,
}

fn malformed(message: impl Into<String>) -> EngineError {
    EngineError::protocol(ProtocolErrorKind::MalformedMetainfo, message)
}

impl Metainfo {
    /// Parse a `.torrent` file.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let root = bencode::decode(data).map_err(|e| malformed(e.to_string()))?;
        if root.as_dict().is_none() {
            return Err(malformed("root is not a dictionary"));
        }

        let info_bytes = bencode::raw_info_slice(data).map_err(|e| malformed(e.to_string()))?;
        let mut hasher = Sha1::new();
        hasher.update(info_bytes);
        let info_hash: InfoHash = hasher.finalize().into();

        let info = Info::parse(root.get("info").ok_or_else(|| malformed("missing 'info'"))?)?;

        let announce = root
            .get("announce")
            .and_then(|v| v.as_str())
            .map(String::from);

        let announce_list = parse_announce_list(root.get("announce-list"));
        let url_list = parse_url_list(root.get("url-list"));

        let creation_date = root.get("creation date").and_then(|v| v.as_int());
        let comment = root
            .get("comment")
            .and_then(|v| v.as_str())
            .map(String::from);
        let created_by = root
            .get("created by")
            .and_then(|v| v.as_str())
            .map(String::from);

        Ok(Self {
            info_hash,
            info: Arc::new(info),
            announce,
            announce_list,
            url_list,
            creation_date,
            comment,
            created_by,
        })
    }

    /// Tracker tiers (BEP 12). Falls back to a single tier holding the
    /// `announce` URL when no announce-list is present.
    pub fn tracker_tiers(&self) -> Vec<Vec<String>> {
        if !self.announce_list.is_empty() {
            return self.announce_list.clone();
        }
        match &self.announce {
            Some(url) => vec![vec![url.clone()]],
            None => Vec::new(),
        }
    }

    /// True when the torrent carries webseed URLs.
    pub fn has_webseeds(&self) -> bool {
        !self.url_list.is_empty()
    }

    /// Info-hash as a lowercase hex string.
    pub fn info_hash_hex(&self) -> String {
        self.info_hash.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl Info {
    fn parse(value: &BencodeValue) -> Result<Self> {
        if value.as_dict().is_none() {
            return Err(malformed("'info' is not a dictionary"));
        }

        let name = value
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| malformed("missing 'name'"))?
            .to_string();

        let piece_length = value
            .get("piece length")
            .and_then(|v| v.as_uint())
            .ok_or_else(|| malformed("missing 'piece length'"))?;
        if piece_length == 0 {
            return Err(malformed("'piece length' must be positive"));
        }

        let pieces_bytes = value
            .get("pieces")
            .and_then(|v| v.as_bytes())
            .ok_or_else(|| malformed("missing 'pieces'"))?;
        if pieces_bytes.len() % 20 != 0 {
            return Err(malformed(format!(
                "'pieces' length {} is not a multiple of 20",
                pieces_bytes.len()
            )));
        }
        let pieces: Vec<Sha1Hash> = pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let private = value
            .get("private")
            .and_then(|v| v.as_int())
            .map(|v| v == 1)
            .unwrap_or(false);

        let (files, total_size, is_single_file) = match value.get("files") {
            Some(files_value) => {
                let (files, total) = parse_files(files_value)?;
                (files, total, false)
            }
            None => {
                let length = value
                    .get("length")
                    .and_then(|v| v.as_uint())
                    .ok_or_else(|| malformed("missing 'length' for single-file torrent"))?;
                validate_relative_path(Path::new(&name))?;
                let file = FileInfo {
                    path: PathBuf::from(&name),
                    length,
                    offset: 0,
                };
                (vec![file], length, true)
            }
        };

        // The piece table must cover the byte space exactly:
        // piece_length * (N - 1) < total <= piece_length * N
        let expected_pieces = total_size.div_ceil(piece_length);
        if pieces.len() as u64 != expected_pieces || (total_size == 0 && !pieces.is_empty()) {
            return Err(malformed(format!(
                "piece count mismatch: have {}, expected {} for {} bytes at {} per piece",
                pieces.len(),
                expected_pieces,
                total_size,
                piece_length
            )));
        }

        Ok(Self {
            name,
            piece_length,
            pieces,
            files,
            total_size,
            is_single_file,
            private,
        })
    }

    /// Number of pieces.
    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    /// Byte range `[start, end)` of a piece in the torrent's byte space.
    pub fn piece_range(&self, index: usize) -> Option<(u64, u64)> {
        if index >= self.pieces.len() {
            return None;
        }
        let start = index as u64 * self.piece_length;
        let end = (start + self.piece_length).min(self.total_size);
        Some((start, end))
    }

    /// Length of a piece; the last piece may be shorter than
    /// `piece_length`.
    pub fn piece_length_at(&self, index: usize) -> Option<u64> {
        self.piece_range(index).map(|(start, end)| end - start)
    }

    /// Hash of a piece.
    pub fn piece_hash(&self, index: usize) -> Option<&Sha1Hash> {
        self.pieces.get(index)
    }

    /// Files overlapping a piece, as `(file_index, offset_in_file, length)`
    /// in byte-space order.
    pub fn files_for_piece(&self, index: usize) -> Vec<(usize, u64, u64)> {
        let Some((piece_start, piece_end)) = self.piece_range(index) else {
            return Vec::new();
        };

        let mut spans = Vec::new();
        for (file_idx, file) in self.files.iter().enumerate() {
            let file_start = file.offset;
            let file_end = file.offset + file.length;
            if file_start >= piece_end || file_end <= piece_start {
                continue;
            }
            let overlap_start = piece_start.max(file_start);
            let overlap_end = piece_end.min(file_end);
            spans.push((file_idx, overlap_start - file_start, overlap_end - overlap_start));
        }
        spans
    }
}

/// Reject path components that would escape the destination directory.
fn validate_relative_path(path: &Path) -> Result<()> {
    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(malformed("file path contains parent directory reference"))
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(malformed("file path is absolute"))
            }
            _ => {}
        }
    }
    Ok(())
}

fn parse_files(value: &BencodeValue) -> Result<(Vec<FileInfo>, u64)> {
    let list = value
        .as_list()
        .ok_or_else(|| malformed("'files' is not a list"))?;

    let mut files = Vec::new();
    let mut offset = 0u64;

    for entry in list {
        let length = entry
            .get("length")
            .and_then(|v| v.as_uint())
            .ok_or_else(|| malformed("file entry missing 'length'"))?;

        let path_list = entry
            .get("path")
            .and_then(|v| v.as_list())
            .ok_or_else(|| malformed("file entry missing 'path'"))?;

        let mut path = PathBuf::new();
        for component in path_list {
            let s = component
                .as_str()
                .ok_or_else(|| malformed("path component is not a string"))?;
            path.push(s);
        }
        if path.as_os_str().is_empty() {
            return Err(malformed("empty file path"));
        }
        validate_relative_path(&path)?;

        files.push(FileInfo {
            path,
            length,
            offset,
        });
        offset += length;
    }

    Ok((files, offset))
}

fn parse_announce_list(value: Option<&BencodeValue>) -> Vec<Vec<String>> {
    let Some(tiers) = value.and_then(|v| v.as_list()) else {
        return Vec::new();
    };

    tiers
        .iter()
        .filter_map(|tier| {
            tier.as_list().map(|urls| {
                urls.iter()
                    .filter_map(|url| url.as_str().map(String::from))
                    .collect::<Vec<_>>()
            })
        })
        .filter(|tier| !tier.is_empty())
        .collect()
}

/// `url-list` may be a single string or a list of strings (BEP 19).
fn parse_url_list(value: Option<&BencodeValue>) -> Vec<String> {
    let Some(value) = value else {
        return Vec::new();
    };

    let keep = |s: &str| s.starts_with("http://") || s.starts_with("https://");
    match value {
        BencodeValue::Bytes(_) => value
            .as_str()
            .filter(|s| keep(s))
            .map(|s| vec![s.to_string()])
            .unwrap_or_default(),
        BencodeValue::List(list) => list
            .iter()
            .filter_map(|item| item.as_str())
            .filter(|s| keep(s))
            .map(String::from)
            .collect(),
        _ => Vec::new(),
    }
}
