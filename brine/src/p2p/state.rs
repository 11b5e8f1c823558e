use crate::stats::ThroughputStats;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Handshaking,
    // Where peers tell each other what pieces they have.
    Introducing,
    Connected,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionState {

    pub conn_state: ConnState,

    // Whether we are answering the peer's requests.
    pub choked: bool,

    // Whether we are interested in the peer's pieces.
    pub interested: bool,

    // Whether the peer is answering our requests.
    pub peer_choking: bool,

    // Whether the peer is interested in our pieces.
    pub peer_interested: bool,

    pub throughput: ThroughputStats,

    // Round trip of the most recent block request, cleared every tick.
    pub request_rtt: Option<std::time::Duration>,

    pub num_pieces: usize,

    pub changed: bool,

}

impl Default for SessionState {
    fn default() -> SessionState {
        SessionState {
            conn_state: ConnState::Disconnected,
            choked: true,
            interested: false,
            peer_choking: true,
            peer_interested: false,
            throughput: ThroughputStats::default(),
            request_rtt: None,
            changed: false,
            num_pieces: 0,
        }
    }
}

impl SessionState {

    pub fn tick(&mut self) {
        self.throughput.reset();
        self.request_rtt = None;
    }

    #[inline(always)]
    pub fn update(&mut self, f: impl FnOnce(&mut SessionState)) {
        f(self);
        self.changed = true;
    }
}
