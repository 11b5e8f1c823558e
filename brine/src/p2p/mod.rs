use std::{net::SocketAddr, sync::Arc};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::Instrument;
use crate::{
    block::{Block, BlockInfo},
    torrent::TorrentContext,
    ID,
};

mod session;
pub mod message;
mod handshake;
pub mod state;

pub use session::PeerSession;
use state::SessionState;

type Result<T> = std::result::Result<T, PeerError>;
type PeerRx = mpsc::UnboundedReceiver<PeerCommand>;
pub type PeerTx = mpsc::UnboundedSender<PeerCommand>;

#[derive(thiserror::Error, Debug)]
pub enum PeerError {

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    // The remote broke the wire protocol; the session is dropped.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("handshake provided incorrect info-hash")]
    InfoHashMismatch,

    #[error("no handshake received")]
    NoHandshake,

    #[error("connect timeout")]
    ConnectTimeout,

    #[error("request timed out")]
    RequestTimeout,

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("peer idle for too long")]
    IdleTimeout,

    #[error("channel error: {0}")]
    Channel(String),

    #[error("session cancelled")]
    Cancelled,

}

impl<T> From<mpsc::error::SendError<T>> for PeerError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        PeerError::Channel(e.to_string())
    }
}

// Commands that can be sent to a peer session.
pub enum PeerCommand {

    // A piece was verified and written; announce it with a have and drop
    // any in-flight requests for it.
    PieceWritten(usize),

    // Block read from disk for an uploading reply.
    BlockRead(Block),

    // Another session got this block first; cancel ours if duplicated.
    BlockReceived(BlockInfo),

    Shutdown,

}

#[derive(Debug)]
pub struct PeerHandle {

    // Sends commands to the session.
    pub peer_tx: PeerTx,

    // Handle to the session task; taken on join.
    pub session_handle: Option<JoinHandle<()>>,

    // Last state reported by the session.
    pub state: SessionState,

    // Peer id learned from the handshake.
    pub id: Option<ID>,

}

impl PeerHandle {
    pub fn start_session(
        address: SocketAddr,
        ctx: Arc<TorrentContext>,
        socket: Option<tokio::net::TcpStream>,
    ) -> Self {

        let (mut session, peer_tx) = PeerSession::new(address, ctx.clone());
        let session_handle = tokio::spawn(async move {
            let result = session.start_session(socket).await;
            match &result {
                Err(PeerError::Cancelled) => tracing::debug!("session cancelled"),
                Err(e) => tracing::warn!("session error: {}", e),
                Ok(()) => {},
            }
            session.disconnect(result.err()).await;
        }.instrument(tracing::info_span!("peer", addr = %address)));

        PeerHandle {
            peer_tx,
            session_handle: Some(session_handle),
            state: SessionState::default(),
            id: None,
        }
    }
}
