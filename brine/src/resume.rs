use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
};
use bencode::{DictEntry, Value};
use crate::{
    tracker::{encode_compact, parse_compact},
    ID,
};

#[derive(thiserror::Error, Debug)]
pub enum ResumeError {

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed resume file: {0}")]
    Bencode(#[from] bencode::Error),

    #[error("malformed resume file: missing `{0}`")]
    MissingField(&'static str),

}

type Result<T> = std::result::Result<T, ResumeError>;

// State carried across runs, one file per infohash. The bitmap only
// seeds the startup disk check; hashes stay authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResumeData {

    // Raw own-bitmap bytes, MSB first like the wire bitfield.
    pub bitfield: Vec<u8>,

    pub uploaded: u64,

    pub downloaded: u64,

    // Last known peers, stored compact.
    pub peers: Vec<SocketAddr>,

}

impl ResumeData {

    pub fn file_path(output_dir: &Path, info_hash: ID) -> PathBuf {
        output_dir.join(format!("{}.resume", hex::encode(info_hash)))
    }

    pub fn load(path: &Path) -> Result<ResumeData> {
        let buf = std::fs::read(path)?;
        Self::from_bytes(&buf)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_bytes())?;
        Ok(())
    }

    pub fn from_bytes(buf: &[u8]) -> Result<ResumeData> {
        let root = bencode::decode(buf)?;

        let bitfield = root
            .get(b"bitfield")
            .and_then(Value::as_bytes)
            .ok_or(ResumeError::MissingField("bitfield"))?
            .to_vec();
        let uploaded = root
            .get(b"uploaded")
            .and_then(Value::as_int)
            .ok_or(ResumeError::MissingField("uploaded"))?;
        let downloaded = root
            .get(b"downloaded")
            .and_then(Value::as_int)
            .ok_or(ResumeError::MissingField("downloaded"))?;
        let peers = root
            .get(b"peers")
            .and_then(Value::as_bytes)
            .map(|b| parse_compact(b).map_err(|_| ResumeError::MissingField("peers")))
            .transpose()?
            .unwrap_or_default()
            .into_iter()
            .map(|p| p.address)
            .collect();

        Ok(ResumeData {
            bitfield,
            uploaded: uploaded.max(0) as u64,
            downloaded: downloaded.max(0) as u64,
            peers,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let entry = |key: &[u8], value: Value| DictEntry {
            key: key.to_vec(),
            value,
            span: 0..0,
        };
        bencode::encode(&Value::Dict(vec![
            entry(b"bitfield", Value::Bytes(self.bitfield.clone())),
            entry(b"downloaded", Value::Int(self.downloaded as i64)),
            entry(b"peers", Value::Bytes(encode_compact(&self.peers))),
            entry(b"uploaded", Value::Int(self.uploaded as i64)),
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let data = ResumeData {
            bitfield: vec![0b1010_0000, 0b0100_0000],
            uploaded: 123_456,
            downloaded: 9_876_543,
            peers: vec![
                "10.0.0.1:6881".parse().unwrap(),
                "192.168.1.2:51413".parse().unwrap(),
            ],
        };
        let decoded = ResumeData::from_bytes(&data.to_bytes()).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_file_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let data = ResumeData {
            bitfield: vec![0xff],
            uploaded: 1,
            downloaded: 2,
            peers: vec!["10.0.0.1:6881".parse()?],
        };
        let path = ResumeData::file_path(dir.path(), [0xab; 20]);
        data.save(&path)?;
        assert_eq!(ResumeData::load(&path)?, data);
        Ok(())
    }

    #[test]
    fn test_missing_field() {
        assert!(matches!(
            ResumeData::from_bytes(b"de"),
            Err(ResumeError::MissingField(_))
        ));
    }
}
