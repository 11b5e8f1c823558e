// Fixture torrents assembled in memory so tests carry their own data.

use sha1::{Digest, Sha1};
use bencode::{DictEntry, Value};
use crate::ID;

pub struct TorrentFixture {

    // The bencoded metainfo file.
    pub bytes: Vec<u8>,

    pub info_hash: ID,

    pub piece_hashes: Vec<ID>,

    // The full payload laid out end to end in file order.
    pub payload: Vec<u8>,

}

pub const FIXTURE_ANNOUNCE: &str = "http://tracker.example/announce";

// Deterministic payload that is not all zeros and has no 16 KiB period.
pub fn fixture_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub fn single_file_torrent(payload: &[u8], piece_length: usize) -> TorrentFixture {
    build(
        "test.bin",
        &[(vec![], payload.len())],
        payload,
        piece_length,
        false,
    )
}

// Paths use '/' between components; lengths are per file and the payload
// is generated to match.
pub fn multi_file_torrent(files: &[(&str, usize)], piece_length: usize) -> TorrentFixture {
    let total: usize = files.iter().map(|(_, len)| len).sum();
    let payload = fixture_payload(total);
    let entries: Vec<(Vec<String>, usize)> = files
        .iter()
        .map(|(path, len)| (path.split('/').map(str::to_owned).collect(), *len))
        .collect();
    build("testdir", &entries, &payload, piece_length, true)
}

fn build(
    name: &str,
    files: &[(Vec<String>, usize)],
    payload: &[u8],
    piece_length: usize,
    multi: bool,
) -> TorrentFixture {

    let piece_hashes: Vec<ID> = payload
        .chunks(piece_length)
        .map(|chunk| {
            let mut hasher = Sha1::new();
            hasher.update(chunk);
            hasher.finalize().into()
        })
        .collect();
    let pieces: Vec<u8> = piece_hashes.iter().flat_map(|h| h.iter().copied()).collect();

    let mut info_entries = vec![];
    if multi {
        let file_list: Vec<Value> = files
            .iter()
            .map(|(path, len)| {
                let path_list: Vec<Value> = path
                    .iter()
                    .map(|c| Value::Bytes(c.clone().into_bytes()))
                    .collect();
                Value::Dict(vec![
                    entry(b"length", Value::Int(*len as i64)),
                    entry(b"path", Value::List(path_list)),
                ])
            })
            .collect();
        info_entries.push(entry(b"files", Value::List(file_list)));
    } else {
        info_entries.push(entry(b"length", Value::Int(payload.len() as i64)));
    }
    info_entries.push(entry(b"name", Value::Bytes(name.as_bytes().to_vec())));
    info_entries.push(entry(b"piece length", Value::Int(piece_length as i64)));
    info_entries.push(entry(b"pieces", Value::Bytes(pieces)));

    let info = Value::Dict(info_entries);
    let mut hasher = Sha1::new();
    hasher.update(bencode::encode(&info));
    let info_hash: ID = hasher.finalize().into();

    let root = Value::Dict(vec![
        entry(b"announce", Value::Bytes(FIXTURE_ANNOUNCE.as_bytes().to_vec())),
        entry(b"info", info),
    ]);

    TorrentFixture {
        bytes: bencode::encode(&root),
        info_hash,
        piece_hashes,
        payload: payload.to_vec(),
    }
}

fn entry(key: &[u8], value: Value) -> DictEntry {
    DictEntry { key: key.to_vec(), value, span: 0..0 }
}
