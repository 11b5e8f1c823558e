pub type Result<T> = std::result::Result<T, Error>;

// Everything that can go wrong while reading a bencoded buffer.
// Encoding is infallible.
#[derive(Debug, thiserror::Error)]
pub enum Error {

    #[error("unexpected end of input")]
    Truncated,

    #[error("unexpected byte {found:?} at offset {offset}")]
    UnexpectedByte {
        found: char,
        offset: usize,
    },

    #[error("non-digit in string length at offset {0}")]
    NonDigitLength(usize),

    #[error("negative string length at offset {0}")]
    NegativeLength(usize),

    #[error("integer overflow at offset {0}")]
    IntegerOverflow(usize),

    #[error("empty integer at offset {0}")]
    EmptyInteger(usize),

    #[error("duplicate dictionary key {0:?}")]
    DuplicateKey(String),

    #[error("dictionary key at offset {0} is not a byte string")]
    NonStringKey(usize),

    #[error("trailing bytes after top-level value")]
    TrailingBytes,

}
