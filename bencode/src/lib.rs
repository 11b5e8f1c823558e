mod value;
mod decode;
mod encode;
mod error;

pub use value::{DictEntry, Value};
pub use decode::decode;
pub use encode::encode;
pub use error::{Error, Result};

#[cfg(test)]
mod tests {
    use super::*;
    use sha1::{Digest, Sha1};

    // A minimal single-file torrent, assembled by hand so the test carries
    // its own fixture.
    fn torrent_bytes() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce31:http://tracker.example/announce4:info");
        buf.extend_from_slice(b"d6:lengthi32768e4:name8:test.bin12:piece lengthi16384e6:pieces40:");
        buf.extend_from_slice(&[0xab; 40]);
        buf.extend_from_slice(b"ee");
        buf
    }

    #[test]
    fn info_span_hashes_source_bytes() {
        let buf = torrent_bytes();
        let root = decode(&buf).unwrap();
        let dict = root.as_dict().unwrap();

        let span = dict.iter().find(|e| e.key == b"info").unwrap().span.clone();
        assert_eq!(&buf[span.start..span.start + 1], b"d");
        assert_eq!(&buf[span.end - 1..span.end], b"e");

        // The fixture is canonical, so hashing the span must agree with
        // hashing a re-encoding.
        let mut hasher = Sha1::new();
        hasher.update(&buf[span]);
        let from_span: [u8; 20] = hasher.finalize().into();

        let info = root.get(b"info").unwrap();
        let mut hasher = Sha1::new();
        hasher.update(encode(info));
        let from_reencode: [u8; 20] = hasher.finalize().into();

        assert_eq!(hex::encode(from_span), hex::encode(from_reencode));
    }

    #[test]
    fn non_canonical_source_survives_reencode() {
        // Keys out of order: decode preserves them, encode sorts them.
        let buf = b"d1:bi2e1:ai1ee".to_vec();
        let root = decode(&buf).unwrap();
        let encoded = encode(&root);
        assert_eq!(encoded, b"d1:ai1e1:bi2ee");
        // Structurally equal after the round trip.
        let again = decode(&encoded).unwrap();
        assert_eq!(again.as_dict().unwrap().len(), 2);
        assert_eq!(again.get(b"a").and_then(Value::as_int), Some(1));
        assert_eq!(again.get(b"b").and_then(Value::as_int), Some(2));
    }
}
