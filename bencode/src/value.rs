use std::ops::Range;

// The four bencode types. Strings are raw bytes, never text; `pieces` and
// compact peer lists are not valid UTF-8.
#[derive(Clone, PartialEq, Eq)]
pub enum Value {

    Int(i64),

    Bytes(Vec<u8>),

    List(Vec<Value>),

    // Entries in source order. Canonical ordering is applied on encode.
    Dict(Vec<DictEntry>),

}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DictEntry {

    pub key: Vec<u8>,

    pub value: Value,

    // Byte range the value occupied in the source buffer. This is how the
    // exact `info` slice is recovered for infohash computation.
    pub span: Range<usize>,

}

impl Value {

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&[DictEntry]> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    // Dictionary lookup by raw key bytes.
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict()?
            .iter()
            .find(|e| e.key == key)
            .map(|e| &e.value)
    }

    // Source byte range of a dictionary value.
    pub fn span_of(&self, key: &[u8]) -> Option<Range<usize>> {
        self.as_dict()?
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.span.clone())
    }
}

// Pieces and peer strings make the derived Debug unreadable, so byte
// strings print lossy and truncated.
impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{}", i),
            Value::Bytes(b) if b.len() > 64 => {
                write!(f, "<{} bytes>", b.len())
            },
            Value::Bytes(b) => write!(f, "{:?}", String::from_utf8_lossy(b)),
            Value::List(l) => f.debug_list().entries(l).finish(),
            Value::Dict(d) => {
                let mut map = f.debug_map();
                for e in d {
                    map.entry(&String::from_utf8_lossy(&e.key), &e.value);
                }
                map.finish()
            },
        }
    }
}
