use rand::seq::SliceRandom;
use sha1::{Digest, Sha1};
use url::Url;
use bencode::Value;
use crate::{store::FileInfo, ID};

#[derive(Debug, thiserror::Error)]
pub enum MetaInfoError {

    #[error("malformed bencode in metainfo: {0}")]
    Bencode(#[from] bencode::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid file extension, expected .torrent")]
    InvalidExtension,

    #[error("invalid metainfo: missing `{0}`")]
    MissingField(&'static str),

    #[error("invalid metainfo: `{0}` has the wrong type")]
    WrongType(&'static str),

    #[error("invalid metainfo: piece length must be positive")]
    InvalidPieceLength,

    #[error("invalid metainfo: pieces must be a non-empty multiple of 20 bytes")]
    InvalidPiecesLength,

    #[error("invalid metainfo: {found} piece hashes for {expected} pieces of payload")]
    PieceCountMismatch { expected: u64, found: u64 },

    #[error("invalid metainfo: file with size 0")]
    FileNoSize,

    #[error("invalid metainfo: file with no path")]
    FileEmptyPath,

    #[error("invalid metainfo: file path component {0:?} is not allowed")]
    FilePathComponent(String),

    #[error("invalid metainfo: bad announce url: {0}")]
    InvalidUrl(#[from] url::ParseError),

}

type Result<T> = std::result::Result<T, MetaInfoError>;

#[derive(Debug, Clone)]
pub struct File {

    // Path components relative to the download root, already validated.
    pub path: Vec<String>,

    pub length: u64,

}

#[derive(Clone)]
pub struct Info {

    // Suggested root file or directory name.
    pub name: String,

    // Concatenation of all 20-byte SHA1 hash values, one per piece.
    pub pieces: Vec<u8>,

    // Number of bytes in each piece but the last.
    pub piece_length: u32,

    // Always at least one entry; single-file torrents synthesize one
    // whose path is `name`.
    pub files: Vec<File>,

    pub is_multi_file: bool,

    pub private: bool,

    pub total_len: u64,

}

#[derive(Clone)]
pub struct MetaInfo {

    // The announce URL of the primary tracker.
    pub announce: Option<Url>,

    // Tracker tiers in priority order, per BEP 12.
    pub announce_list: Option<Vec<Vec<Url>>>,

    pub info: Info,

    // SHA1 over the exact `info` byte span of the source file. Never
    // recomputed from a re-encoding; source files are not always
    // canonical.
    pub info_hash: ID,

    pub comment: Option<String>,

    pub created_by: Option<String>,

    pub creation_date: Option<i64>,

    pub encoding: Option<String>,

}

impl MetaInfo {

    pub fn new<P: AsRef<std::path::Path>>(path: P) -> Result<MetaInfo> {
        if path.as_ref().extension().unwrap_or_default() != "torrent" {
            return Err(MetaInfoError::InvalidExtension);
        }
        let buf = std::fs::read(path)?;
        Self::from_bytes(&buf)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<MetaInfo> {

        let root = bencode::decode(buf)?;

        let announce = match root.get(b"announce") {
            Some(v) => {
                let s = v.as_str().ok_or(MetaInfoError::WrongType("announce"))?;
                Some(Url::parse(s)?)
            },
            None => None,
        };
        let announce_list = parse_announce_list(&root)?;

        let info_value = root.get(b"info").ok_or(MetaInfoError::MissingField("info"))?;
        let info_span = root.span_of(b"info").expect("span exists for every dict value");

        let mut hasher = Sha1::new();
        hasher.update(&buf[info_span]);
        let info_hash: ID = hasher.finalize().into();

        let info = parse_info(info_value)?;

        let metainfo = MetaInfo {
            announce,
            announce_list,
            info,
            info_hash,
            comment: root.get(b"comment").and_then(Value::as_str).map(str::to_owned),
            created_by: root.get(b"created by").and_then(Value::as_str).map(str::to_owned),
            creation_date: root.get(b"creation date").and_then(Value::as_int),
            encoding: root.get(b"encoding").and_then(Value::as_str).map(str::to_owned),
        };

        tracing::debug!("metainfo created: {:#?}", metainfo);
        Ok(metainfo)
    }

    pub fn piece_hashes(&self) -> Vec<ID> {
        self.info.pieces
            .chunks_exact(20)
            // Safe as length was checked to be a multiple of 20 on parse.
            .map(|c| c.try_into().unwrap())
            .collect()
    }

    pub fn piece_len(&self) -> usize { self.info.piece_length as usize }

    pub fn num_pieces(&self) -> u32 { self.info.pieces.len() as u32 / 20 }

    pub fn is_multi_file(&self) -> bool { self.info.is_multi_file }

    pub fn total_len(&self) -> u64 { self.info.total_len }

    pub fn info_hash(&self) -> ID { self.info_hash }

    pub fn name(&self) -> &str { &self.info.name }

    // Tiers in priority order; trackers within a tier are shuffled once
    // per BEP 12.
    pub fn trackers(&self) -> Vec<Vec<Url>> {
        if let Some(announce_list) = self.announce_list.clone() {
            let mut tiers = Vec::new();
            for mut tier in announce_list {
                tier.shuffle(&mut rand::thread_rng());
                tiers.push(tier);
            }
            tiers
        } else if let Some(announce) = self.announce.clone() {
            vec![vec![announce]]
        } else {
            Vec::new()
        }
    }

    pub fn files(&self) -> Vec<FileInfo> {
        let mut offset = 0;
        self.info.files.iter().map(|f| {
            let file_info = FileInfo {
                path: f.path.iter().collect(),
                length: f.length as usize,
                offset,
            };
            offset += f.length as usize;
            file_info
        }).collect()
    }

    // Formatting methods.

    pub fn creation_date_fmt(&self) -> Option<String> {
        self.creation_date.map(|v| {
            let date = chrono::NaiveDateTime::from_timestamp_opt(v, 0);
            date.map(|v| v.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "Invalid date".to_string())
        })
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    pub fn size_fmt(&self) -> String {
        format_size(self.info.total_len)
    }
}

fn parse_announce_list(root: &Value) -> Result<Option<Vec<Vec<Url>>>> {

    let raw = match root.get(b"announce-list") {
        Some(v) => v.as_list().ok_or(MetaInfoError::WrongType("announce-list"))?,
        None => return Ok(None),
    };

    let mut tiers = Vec::new();
    for tier in raw {
        let tier = tier.as_list().ok_or(MetaInfoError::WrongType("announce-list"))?;
        let mut urls = Vec::new();
        for url in tier {
            let s = url.as_str().ok_or(MetaInfoError::WrongType("announce-list"))?;
            urls.push(Url::parse(s)?);
        }
        if !urls.is_empty() {
            tiers.push(urls);
        }
    }

    if tiers.is_empty() { Ok(None) } else { Ok(Some(tiers)) }
}

fn parse_info(info: &Value) -> Result<Info> {

    let name = info
        .get(b"name")
        .ok_or(MetaInfoError::MissingField("name"))?
        .as_str()
        .ok_or(MetaInfoError::WrongType("name"))?
        .to_owned();

    let piece_length = info
        .get(b"piece length")
        .ok_or(MetaInfoError::MissingField("piece length"))?
        .as_int()
        .ok_or(MetaInfoError::WrongType("piece length"))?;
    if piece_length <= 0 || piece_length > u32::MAX as i64 {
        return Err(MetaInfoError::InvalidPieceLength);
    }

    let pieces = info
        .get(b"pieces")
        .ok_or(MetaInfoError::MissingField("pieces"))?
        .as_bytes()
        .ok_or(MetaInfoError::WrongType("pieces"))?
        .to_vec();
    if pieces.is_empty() || pieces.len() % 20 != 0 {
        return Err(MetaInfoError::InvalidPiecesLength);
    }

    let private = matches!(info.get(b"private").and_then(Value::as_int), Some(1));

    // Single-file torrents carry `length`; multi-file ones carry `files`.
    let (files, is_multi_file) = match info.get(b"files") {
        Some(list) => (parse_files(list)?, true),
        None => {
            let length = info
                .get(b"length")
                .ok_or(MetaInfoError::MissingField("length"))?
                .as_int()
                .ok_or(MetaInfoError::WrongType("length"))?;
            if length <= 0 {
                return Err(MetaInfoError::FileNoSize);
            }
            validate_component(&name)?;
            (vec![File { path: vec![name.clone()], length: length as u64 }], false)
        },
    };

    let total_len: u64 = files.iter().map(|f| f.length).sum();
    let num_pieces = (total_len + piece_length as u64 - 1) / piece_length as u64;
    let found = pieces.len() as u64 / 20;
    if num_pieces != found {
        return Err(MetaInfoError::PieceCountMismatch { expected: num_pieces, found });
    }

    Ok(Info {
        name,
        pieces,
        piece_length: piece_length as u32,
        files,
        is_multi_file,
        private,
        total_len,
    })
}

fn parse_files(list: &Value) -> Result<Vec<File>> {

    let list = list.as_list().ok_or(MetaInfoError::WrongType("files"))?;
    if list.is_empty() {
        return Err(MetaInfoError::MissingField("files"));
    }

    let mut files = Vec::with_capacity(list.len());
    for entry in list {

        let length = entry
            .get(b"length")
            .ok_or(MetaInfoError::MissingField("length"))?
            .as_int()
            .ok_or(MetaInfoError::WrongType("length"))?;
        if length <= 0 {
            return Err(MetaInfoError::FileNoSize);
        }

        let raw_path = entry
            .get(b"path")
            .ok_or(MetaInfoError::MissingField("path"))?
            .as_list()
            .ok_or(MetaInfoError::WrongType("path"))?;
        if raw_path.is_empty() {
            return Err(MetaInfoError::FileEmptyPath);
        }

        let mut path = Vec::with_capacity(raw_path.len());
        for component in raw_path {
            let component = component.as_str().ok_or(MetaInfoError::WrongType("path"))?;
            validate_component(component)?;
            path.push(component.to_owned());
        }

        files.push(File { path, length: length as u64 });
    }

    Ok(files)
}

// Path components come off the network; anything that could step outside
// the download root is rejected outright.
fn validate_component(component: &str) -> Result<()> {
    if component.is_empty()
        || component == "."
        || component == ".."
        || component.contains('/')
        || component.contains('\\')
        || component.contains('\0')
    {
        return Err(MetaInfoError::FilePathComponent(component.to_owned()));
    }
    Ok(())
}

fn format_size(bytes: u64) -> String {
    let mut size = bytes as f64;
    let mut unit = "B";
    for next in ["KiB", "MiB", "GiB", "TiB"] {
        if size > 1024.0 {
            size /= 1024.0;
            unit = next;
        }
    }
    format!("{:.2} {}", size, unit)
}

impl std::fmt::Debug for MetaInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaInfo")
            .field("announce", &self.announce.as_ref().map(Url::as_str))
            .field("info", &self.info)
            .field("info_hash", &self.info_hash_hex())
            .field("announce_list", &self.announce_list.as_ref().map(|v|
                v.iter().map(|v|
                    v.iter().map(|v|
                        v.as_str()
                    ).collect()
                ).collect::<Vec<Vec<&str>>>()
            ))
            .field("creation_date", &self.creation_date_fmt())
            .field("comment", &self.comment)
            .field("created_by", &self.created_by)
            .field("encoding", &self.encoding)
            .finish()
    }
}

// Dont want to print the pieces field, so Debug is manual.
impl std::fmt::Debug for Info {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Info")
            .field("name", &self.name)
            .field("num pieces", &(self.pieces.len() / 20))
            .field("piece_length", &self.piece_length)
            .field("total_len", &self.total_len)
            .field("files", &self.info_files_fmt())
            .field("private", &self.private)
            .finish()
    }
}

impl Info {
    fn info_files_fmt(&self) -> Vec<String> {
        self.files
            .iter()
            .map(|f| format!("{} ({} bytes)", f.path.join("/"), f.length))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{multi_file_torrent, single_file_torrent};

    #[test]
    fn test_single_file_metainfo() {
        let payload = vec![0x5au8; 32_768];
        let fixture = single_file_torrent(&payload, 16_384);
        let metainfo = MetaInfo::from_bytes(&fixture.bytes).unwrap();

        assert_eq!(metainfo.num_pieces(), 2);
        assert_eq!(metainfo.piece_len(), 16_384);
        assert_eq!(metainfo.total_len(), 32_768);
        assert!(!metainfo.is_multi_file());
        assert_eq!(metainfo.info_hash(), fixture.info_hash);
        assert_eq!(metainfo.piece_hashes(), fixture.piece_hashes);

        let files = metainfo.files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].offset, 0);
        assert_eq!(files[0].length, 32_768);
    }

    #[test]
    fn test_multi_file_offsets() {
        let fixture = multi_file_torrent(&[("a.bin", 8192), ("sub/b.bin", 12_288)], 16_384);
        let metainfo = MetaInfo::from_bytes(&fixture.bytes).unwrap();

        assert!(metainfo.is_multi_file());
        assert_eq!(metainfo.total_len(), 20_480);
        assert_eq!(metainfo.num_pieces(), 2);

        let files = metainfo.files();
        assert_eq!(files[0].offset, 0);
        assert_eq!(files[1].offset, 8192);
        assert_eq!(files[1].path, std::path::PathBuf::from("sub").join("b.bin"));
    }

    #[test]
    fn test_infohash_is_taken_from_source_span() {
        // A non-canonical source: keys of the root dict out of order. The
        // infohash must still hash the bytes exactly as they appear.
        let payload = vec![1u8; 16_384];
        let fixture = single_file_torrent(&payload, 16_384);
        let metainfo = MetaInfo::from_bytes(&fixture.bytes).unwrap();
        assert_eq!(metainfo.info_hash(), fixture.info_hash);
    }

    #[test]
    fn test_rejects_bad_piece_count() {
        let payload = vec![1u8; 16_384];
        let mut fixture = single_file_torrent(&payload, 16_384);
        // Declare a second piece hash that the payload length disagrees with.
        let pos = fixture
            .bytes
            .windows(9)
            .position(|w| w == b"6:pieces2")
            .expect("pieces key present");
        let mut bytes = fixture.bytes[..pos].to_vec();
        bytes.extend_from_slice(b"6:pieces40:");
        bytes.extend_from_slice(&[0u8; 40]);
        bytes.extend_from_slice(b"ee");
        fixture.bytes = bytes;

        assert!(matches!(
            MetaInfo::from_bytes(&fixture.bytes),
            Err(MetaInfoError::PieceCountMismatch { .. })
        ));
    }

    #[test]
    fn test_rejects_path_traversal() {
        let fixture = multi_file_torrent(&[("../evil", 16_384)], 16_384);
        assert!(matches!(
            MetaInfo::from_bytes(&fixture.bytes),
            Err(MetaInfoError::FilePathComponent(_))
        ));
    }

    #[test]
    fn test_rejects_trailing_garbage() {
        let payload = vec![1u8; 100];
        let mut fixture = single_file_torrent(&payload, 16_384);
        fixture.bytes.push(b'x');
        assert!(matches!(
            MetaInfo::from_bytes(&fixture.bytes),
            Err(MetaInfoError::Bencode(_))
        ));
    }
}
