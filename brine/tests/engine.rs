// End to end: a torrent with two pieces downloads from two fake peers
// that each hold one piece. The remote side is hand-rolled bytes on a
// TcpStream, so the wire layout is checked independently of the client's
// own codecs.

use std::time::Duration;
use sha1::{Digest, Sha1};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
    time,
};
use bencode::{DictEntry, Value};
use brine::{MetaInfo, Torrent, TorrentCommand, TorrentConfig, TorrentEvent, TrackerPeer};

const PIECE_LEN: usize = 16_384;
const PROTOCOL: &[u8] = b"BitTorrent protocol";

fn fixture_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

// A minimal single-file metainfo; the announce points at a closed local
// port so tracker traffic fails fast and the test peers are injected.
fn fixture_metainfo(payload: &[u8]) -> Vec<u8> {
    let entry = |key: &[u8], value: Value| DictEntry {
        key: key.to_vec(),
        value,
        span: 0..0,
    };

    let pieces: Vec<u8> = payload
        .chunks(PIECE_LEN)
        .flat_map(|chunk| {
            let mut hasher = Sha1::new();
            hasher.update(chunk);
            let hash: [u8; 20] = hasher.finalize().into();
            hash
        })
        .collect();

    let info = Value::Dict(vec![
        entry(b"length", Value::Int(payload.len() as i64)),
        entry(b"name", Value::Bytes(b"roundtrip.bin".to_vec())),
        entry(b"piece length", Value::Int(PIECE_LEN as i64)),
        entry(b"pieces", Value::Bytes(pieces)),
    ]);
    bencode::encode(&Value::Dict(vec![
        entry(b"announce", Value::Bytes(b"http://127.0.0.1:1/announce".to_vec())),
        entry(b"info", info),
    ]))
}

// Serves exactly the pieces marked in `have` and reports every have
// message the client sends back.
async fn run_seed(
    listener: TcpListener,
    info_hash: [u8; 20],
    payload: Vec<u8>,
    have: Vec<bool>,
    have_tx: mpsc::UnboundedSender<u32>,
) {
    let (mut stream, _) = listener.accept().await.unwrap();

    // Handshake, byte-exact: 19, protocol string, reserved, hash, id.
    let mut handshake = [0u8; 68];
    stream.read_exact(&mut handshake).await.unwrap();
    assert_eq!(handshake[0], 19);
    assert_eq!(&handshake[1..20], PROTOCOL);
    assert_eq!(&handshake[20..28], &[0u8; 8]);
    assert_eq!(&handshake[28..48], &info_hash);

    let mut reply = Vec::with_capacity(68);
    reply.push(19);
    reply.extend_from_slice(PROTOCOL);
    reply.extend_from_slice(&[0u8; 8]);
    reply.extend_from_slice(&info_hash);
    reply.extend_from_slice(b"-SD0001-000000000000");
    stream.write_all(&reply).await.unwrap();

    // Bitfield, MSB first with zero padding.
    let mut bits = vec![0u8; (have.len() + 7) / 8];
    for (i, owned) in have.iter().enumerate() {
        if *owned {
            bits[i / 8] |= 0x80 >> (i % 8);
        }
    }
    let mut frame = Vec::new();
    frame.extend_from_slice(&((1 + bits.len()) as u32).to_be_bytes());
    frame.push(5);
    frame.extend_from_slice(&bits);
    stream.write_all(&frame).await.unwrap();

    loop {
        let mut len_buf = [0u8; 4];
        if stream.read_exact(&mut len_buf).await.is_err() {
            return;
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 {
            // keep-alive
            continue;
        }
        let mut body = vec![0u8; len];
        if stream.read_exact(&mut body).await.is_err() {
            return;
        }

        match body[0] {

            // interested: reciprocate with unchoke.
            2 => {
                stream.write_all(&[0, 0, 0, 1, 1]).await.unwrap();
            },

            // have
            4 => {
                let idx = u32::from_be_bytes(body[1..5].try_into().unwrap());
                have_tx.send(idx).ok();
            },

            // request: answer with the matching piece message.
            6 => {
                let piece = u32::from_be_bytes(body[1..5].try_into().unwrap()) as usize;
                let offset = u32::from_be_bytes(body[5..9].try_into().unwrap()) as usize;
                let blen = u32::from_be_bytes(body[9..13].try_into().unwrap()) as usize;
                assert!(have[piece], "client requested a piece this seed never advertised");

                let start = piece * PIECE_LEN + offset;
                let mut out = Vec::new();
                out.extend_from_slice(&((9 + blen) as u32).to_be_bytes());
                out.push(7);
                out.extend_from_slice(&(piece as u32).to_be_bytes());
                out.extend_from_slice(&(offset as u32).to_be_bytes());
                out.extend_from_slice(&payload[start..start + blen]);
                stream.write_all(&out).await.unwrap();
            },

            // choke/unchoke/not-interested/cancel are irrelevant here.
            _ => {},
        }
    }
}

#[tokio::test]
async fn test_single_file_round_trip_two_peers() {

    let payload = fixture_payload(2 * PIECE_LEN);
    let metainfo = MetaInfo::from_bytes(&fixture_metainfo(&payload)).unwrap();
    let info_hash = metainfo.info_hash();
    assert_eq!(metainfo.num_pieces(), 2);

    // Seed A holds piece 0, seed B piece 1.
    let (have_tx_a, mut have_rx_a) = mpsc::unbounded_channel();
    let (have_tx_b, mut have_rx_b) = mpsc::unbounded_channel();
    let listener_a = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let listener_b = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr_a = listener_a.local_addr().unwrap();
    let addr_b = listener_b.local_addr().unwrap();
    tokio::spawn(run_seed(listener_a, info_hash, payload.clone(), vec![true, false], have_tx_a));
    tokio::spawn(run_seed(listener_b, info_hash, payload.clone(), vec![false, true], have_tx_b));

    let dir = tempfile::tempdir().unwrap();
    let config = TorrentConfig {
        output_dir: dir.path().to_path_buf(),
        listen_address: "127.0.0.1:0".parse().unwrap(),
        min_max_peers: (1, 10),
        resume: false,
        ..Default::default()
    };

    let mut torrent = Torrent::new(metainfo, config).unwrap();
    let mut events = torrent.events().unwrap();
    let cancel = torrent.cancellation_token();
    let command_tx = torrent.command_tx();
    let torrent_task = tokio::spawn(async move { torrent.start().await });

    // Hand the engine its peers as if a tracker had returned them.
    command_tx.send(TorrentCommand::Peers {
        peers: vec![
            TrackerPeer { address: addr_a, id: None },
            TrackerPeer { address: addr_b, id: None },
        ],
    }).unwrap();

    // The engine must verify both pieces and report completion.
    let completed = time::timeout(Duration::from_secs(30), async {
        loop {
            match events.recv().await {
                Some(TorrentEvent::DownloadComplete) => break true,
                Some(TorrentEvent::PieceFailed { .. }) => break false,
                Some(_) => continue,
                None => break false,
            }
        }
    })
    .await
    .expect("download did not finish in time");
    assert!(completed, "a piece failed verification");

    // Exactly one have per verified piece reaches every peer.
    let mut seen_a = vec![];
    let mut seen_b = vec![];
    for _ in 0..2 {
        seen_a.push(time::timeout(Duration::from_secs(5), have_rx_a.recv()).await.unwrap().unwrap());
        seen_b.push(time::timeout(Duration::from_secs(5), have_rx_b.recv()).await.unwrap().unwrap());
    }
    seen_a.sort_unstable();
    seen_b.sort_unstable();
    assert_eq!(seen_a, vec![0, 1]);
    assert_eq!(seen_b, vec![0, 1]);
    assert!(time::timeout(Duration::from_millis(300), have_rx_a.recv()).await.is_err());

    cancel.cancel();
    time::timeout(Duration::from_secs(10), torrent_task)
        .await
        .expect("shutdown hung")
        .unwrap()
        .unwrap();

    // The payload round-tripped to disk byte for byte.
    let on_disk = std::fs::read(dir.path().join("roundtrip.bin")).unwrap();
    assert_eq!(on_disk, payload);
}
