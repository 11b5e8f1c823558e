use crate::error::{Error, Result};
use crate::value::{DictEntry, Value};

// Decodes a complete bencoded buffer. The whole buffer must be consumed;
// trailing bytes are an error at the top level only.
pub fn decode(buf: &[u8]) -> Result<Value> {
    let mut decoder = Decoder { buf, pos: 0 };
    let value = decoder.value()?;
    if decoder.pos != buf.len() {
        return Err(Error::TrailingBytes);
    }
    Ok(value)
}

struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {

    fn peek(&self) -> Result<u8> {
        self.buf.get(self.pos).copied().ok_or(Error::Truncated)
    }

    fn bump(&mut self) -> Result<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Ok(b)
    }

    fn value(&mut self) -> Result<Value> {
        match self.peek()? {
            b'i' => self.integer(),
            b'0'..=b'9' => self.bytes().map(Value::Bytes),
            b'l' => self.list(),
            b'd' => self.dict(),
            found => Err(Error::UnexpectedByte {
                found: found as char,
                offset: self.pos,
            }),
        }
    }

    // i<digits>e, with an optional leading minus. Leading zeros are
    // tolerated on decode; the encoder emits the minimal form.
    fn integer(&mut self) -> Result<Value> {
        let start = self.pos;
        self.bump()?; // 'i'

        let negative = if self.peek()? == b'-' {
            self.pos += 1;
            true
        } else {
            false
        };

        let mut digits = 0usize;
        let mut n: i64 = 0;
        loop {
            match self.bump()? {
                b'e' => break,
                d @ b'0'..=b'9' => {
                    digits += 1;
                    n = n
                        .checked_mul(10)
                        .and_then(|n| n.checked_add((d - b'0') as i64))
                        .ok_or(Error::IntegerOverflow(start))?;
                },
                found => return Err(Error::UnexpectedByte {
                    found: found as char,
                    offset: self.pos - 1,
                }),
            }
        }

        if digits == 0 {
            return Err(Error::EmptyInteger(start));
        }
        Ok(Value::Int(if negative { -n } else { n }))
    }

    // <decimal length>:<bytes>
    fn bytes(&mut self) -> Result<Vec<u8>> {
        let start = self.pos;
        let mut len: usize = 0;
        loop {
            match self.bump()? {
                b':' => break,
                d @ b'0'..=b'9' => {
                    len = len
                        .checked_mul(10)
                        .and_then(|l| l.checked_add((d - b'0') as usize))
                        .ok_or(Error::IntegerOverflow(start))?;
                },
                b'-' => return Err(Error::NegativeLength(start)),
                _ => return Err(Error::NonDigitLength(self.pos - 1)),
            }
        }

        // Bounds check before any allocation; a bogus length must not be
        // able to reserve gigabytes.
        if self.buf.len() - self.pos < len {
            return Err(Error::Truncated);
        }
        let bytes = self.buf[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(bytes)
    }

    fn list(&mut self) -> Result<Value> {
        self.bump()?; // 'l'
        let mut items = Vec::new();
        loop {
            if self.peek()? == b'e' {
                self.pos += 1;
                return Ok(Value::List(items));
            }
            items.push(self.value()?);
        }
    }

    fn dict(&mut self) -> Result<Value> {
        self.bump()?; // 'd'
        let mut entries: Vec<DictEntry> = Vec::new();
        loop {
            match self.peek()? {
                b'e' => {
                    self.pos += 1;
                    return Ok(Value::Dict(entries));
                },
                b'0'..=b'9' => {},
                _ => return Err(Error::NonStringKey(self.pos)),
            }

            let key = self.bytes()?;
            if entries.iter().any(|e| e.key == key) {
                return Err(Error::DuplicateKey(
                    String::from_utf8_lossy(&key).into_owned(),
                ));
            }

            let value_start = self.pos;
            let value = self.value()?;
            entries.push(DictEntry {
                key,
                value,
                span: value_start..self.pos,
            });
        }
    }
}
