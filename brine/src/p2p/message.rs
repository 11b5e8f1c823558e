use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use crate::{block, Bitfield};
use super::PeerError;

// Hard upper bound on a single frame payload; anything larger is not a
// legitimate message under a 16 KiB block size.
pub const DEFAULT_MAX_FRAME_LEN: usize = 0x100000;

#[cfg_attr(test, derive(Debug, Clone, PartialEq, Eq))]
pub enum Message {

    // Advises the peer not to close the connection even though no other
    // message has been sent in a while.
    KeepAlive,

    // A choke message tells a peer that no further requests will be satisfied.
    Choke,

    // Conversely unchoke signifies that requests from the peer will be served.
    Unchoke,

    // Notifies a peer that the client is interested in making requests for blocks.
    Interested,

    // Notifies a peer the client is no longer interested in requesting blocks.
    NotInterested,

    // Tells a peer that the client has a piece, referenced by the piece index.
    Have { idx: u32 },

    // Short form method of communicating what pieces a client has, only
    // legal directly after the handshake.
    Bitfield(Bitfield),

    // A request for a block: piece index, offset of the block within the
    // piece, and length.
    Request(block::BlockInfo),

    // A block payload, referencing piece index and block offset.
    Block(block::Block),

    // Cancels an earlier request for a block.
    Cancel(block::BlockInfo),

}

// Length-prefixed framing: a four byte big-endian payload length, then a
// one byte type and the payload. Length zero frames are keep-alives.
pub struct MessageCodec {
    pub max_frame_len: usize,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self { max_frame_len: DEFAULT_MAX_FRAME_LEN }
    }
}

impl Encoder<Message> for MessageCodec {

    type Error = PeerError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match msg {

            // [0, 0, 0, 0]
            Message::KeepAlive => dst.put_u32(0),

            // [0, 0, 0, 1, 0]
            Message::Choke => {
                dst.put_u32(1);
                dst.put_u8(0);
            },

            // [0, 0, 0, 1, 1]
            Message::Unchoke => {
                dst.put_u32(1);
                dst.put_u8(1);
            },

            // [0, 0, 0, 1, 2]
            Message::Interested => {
                dst.put_u32(1);
                dst.put_u8(2);
            },

            // [0, 0, 0, 1, 3]
            Message::NotInterested => {
                dst.put_u32(1);
                dst.put_u8(3);
            },

            // have: <len=0005><id=4><piece index>
            Message::Have { idx } => {
                dst.put_u32(5);
                dst.put_u8(4);
                dst.put_u32(idx);
            },

            // bitfield: <len=0001+X><id=5><bitfield>
            Message::Bitfield(bitfield) => {
                let raw = bitfield.as_raw_slice();
                dst.put_u32(1 + raw.len() as u32);
                dst.put_u8(5);
                dst.extend_from_slice(raw);
            },

            // request: <len=0013><id=6><index><begin><length>
            Message::Request(block) => {
                dst.put_u32(13);
                dst.put_u8(6);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.put_u32(block.len as u32);
            },

            // piece: <len=0009+X><id=7><index><begin><block>
            Message::Block(block) => {
                let data = block.data.as_ref();
                dst.put_u32(9 + data.len() as u32);
                dst.put_u8(7);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.extend_from_slice(data);
            },

            // cancel: <len=0013><id=8><index><begin><length>
            Message::Cancel(block) => {
                dst.put_u32(13);
                dst.put_u8(8);
                dst.put_u32(block.piece_idx as u32);
                dst.put_u32(block.offset as u32);
                dst.put_u32(block.len as u32);
            },
        }

        Ok(())
    }
}

impl Decoder for MessageCodec {

    type Item = Message;
    type Error = PeerError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {

        // Can't read message length.
        if src.remaining() < 4 { return Ok(None); }

        let mut peeker = std::io::Cursor::new(&src);
        let msg_len: usize = peeker.get_u32() as usize;

        // Reject before buffering: a hostile length prefix must not make
        // us wait for a gigabyte that never comes.
        if msg_len > self.max_frame_len {
            return Err(PeerError::ProtocolViolation(
                format!("frame of {} bytes exceeds limit of {}", msg_len, self.max_frame_len),
            ));
        }

        if src.remaining() >= 4 + msg_len {
            src.advance(4);
            if msg_len == 0 { return Ok(Some(Message::KeepAlive)); }
        } else {
            // Haven't received all of message.
            return Ok(None);
        }

        let id = src.get_u8();
        let payload_len = msg_len - 1;

        // Each id has a known payload shape; checked before any reads so
        // a short frame fails the session instead of panicking the
        // decoder mid-buffer.
        let well_formed = match id {
            0..=3 => payload_len == 0,
            4 => payload_len == 4,
            // Length is checked against the piece count in the session.
            5 => true,
            6 | 8 => payload_len == 12,
            // 8 byte header, then the block bytes.
            7 => payload_len >= 8,
            // Unknown ids are rejected below.
            _ => true,
        };
        if !well_formed {
            return Err(PeerError::ProtocolViolation(format!(
                "message id {} with payload of {} bytes", id, payload_len,
            )));
        }

        let msg = match id {
            0 => Message::Choke,
            1 => Message::Unchoke,
            2 => Message::Interested,
            3 => Message::NotInterested,
            4 => Message::Have { idx: src.get_u32() },
            5 => {
                let mut bitfield = vec![0; payload_len];
                src.copy_to_slice(&mut bitfield);
                Message::Bitfield(Bitfield::from_vec(bitfield))
            },
            6 => {
                let piece_idx = src.get_u32() as usize;
                let offset = src.get_u32() as usize;
                let len = src.get_u32() as usize;
                Message::Request(block::BlockInfo { piece_idx, offset, len })
            },
            7 => {
                let piece_idx = src.get_u32() as usize;
                let offset = src.get_u32() as usize;
                let mut data = vec![0; payload_len - 8];
                src.copy_to_slice(&mut data);
                Message::Block(block::Block { piece_idx, offset, data: block::BlockData::Owned(data) })
            },
            8 => {
                let piece_idx = src.get_u32() as usize;
                let offset = src.get_u32() as usize;
                let len = src.get_u32() as usize;
                Message::Cancel(block::BlockInfo { piece_idx, offset, len })
            },
            id => {
                return Err(PeerError::ProtocolViolation(
                    format!("invalid message id: {}", id),
                ));
            }
        };

        Ok(Some(msg))
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Message::KeepAlive => write!(f, "keep alive"),
            Message::Choke => write!(f, "choke"),
            Message::Unchoke => write!(f, "unchoke"),
            Message::Interested => write!(f, "interested"),
            Message::NotInterested => write!(f, "not interested"),
            Message::Have { idx } => write!(f, "have piece idx: {}", idx),
            Message::Bitfield(bf) => write!(f, "bitfield with {} pieces", bf.count_ones()),
            Message::Request(block) => write!(f, "request for block {{ piece idx: {}, offset: {}, length: {} }}",
                block.piece_idx,
                block.offset,
                block.len,
            ),
            Message::Block(block) => write!(f, "block data {{ piece idx: {}, offset: {}, length: {} }}",
                block.piece_idx,
                block.offset,
                block.data.len(),
            ),
            Message::Cancel(block) => write!(f, "cancel for block {{ piece idx: {}, offset: {}, length: {} }}",
                block.piece_idx,
                block.offset,
                block.len,
            ),
        }
    }
}
