use crate::value::Value;

// Canonical encoding: minimal integers, dictionary keys sorted
// lexicographically by raw bytes whatever order they were decoded in.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    write_value(value, &mut buf);
    buf
}

fn write_value(value: &Value, buf: &mut Vec<u8>) {
    match value {

        Value::Int(i) => {
            buf.push(b'i');
            buf.extend_from_slice(i.to_string().as_bytes());
            buf.push(b'e');
        },

        Value::Bytes(b) => {
            buf.extend_from_slice(b.len().to_string().as_bytes());
            buf.push(b':');
            buf.extend_from_slice(b);
        },

        Value::List(items) => {
            buf.push(b'l');
            for item in items {
                write_value(item, buf);
            }
            buf.push(b'e');
        },

        Value::Dict(entries) => {
            let mut sorted: Vec<_> = entries.iter().collect();
            sorted.sort_by(|a, b| a.key.cmp(&b.key));
            buf.push(b'd');
            for entry in sorted {
                buf.extend_from_slice(entry.key.len().to_string().as_bytes());
                buf.push(b':');
                buf.extend_from_slice(&entry.key);
                write_value(&entry.value, buf);
            }
            buf.push(b'e');
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::decode;

    #[test]
    fn test_encode_scalars() {
        assert_eq!(encode(&Value::Int(42)), b"i42e");
        assert_eq!(encode(&Value::Int(-7)), b"i-7e");
        assert_eq!(encode(&Value::Int(0)), b"i0e");
        assert_eq!(encode(&Value::Bytes(b"spam".to_vec())), b"4:spam");
    }

    #[test]
    fn test_canonical_round_trip() {
        // Canonical input encodes back to the identical bytes.
        let cases: &[&[u8]] = &[
            b"i42e",
            b"4:spam",
            b"l4:spami3ee",
            b"d3:cow3:moo4:spami7ee",
            b"d4:infod6:lengthi100e4:name1:aee",
            b"le",
            b"de",
        ];
        for case in cases {
            let v = decode(case).unwrap();
            assert_eq!(&encode(&v), case, "case {:?}", String::from_utf8_lossy(case));
        }
    }

    #[test]
    fn test_keys_sorted_by_raw_bytes() {
        let v = decode(b"d1:zi1e1:ai2e2:aai3ee").unwrap();
        assert_eq!(encode(&v), b"d1:ai2e2:aai3e1:zi1ee".to_vec());
    }
}
