use std::time::{Duration, Instant};
use tokio::time;
use url::Url;
use bencode::Value;
use super::{
    parse_compact, AnnounceParams, Result, TrackerError, TrackerIdentity, TrackerPeer,
    DEFAULT_MIN_ANNOUNCE_INTERVAL,
};
use crate::ID;

const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpTracker {

    client: reqwest::Client,

    url: Url,

    identity: TrackerIdentity,

    // A string the tracker asked us to echo on later announces.
    tracker_id: Option<String>,

    last_announce: Option<Instant>,

    interval: Option<Duration>,

    min_interval: Option<Duration>,

}

#[derive(Debug, Default)]
pub struct AnnounceResponse {

    pub interval: Option<u64>,

    pub min_interval: Option<u64>,

    pub tracker_id: Option<String>,

    // Seeders and leechers as reported by the tracker.
    pub complete: Option<u64>,

    pub incomplete: Option<u64>,

    pub peers: Vec<TrackerPeer>,

}

impl HttpTracker {

    pub fn new(url: Url, identity: TrackerIdentity) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            identity,
            tracker_id: None,
            last_announce: None,
            interval: None,
            min_interval: None,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub async fn announce(&mut self, params: AnnounceParams) -> Result<AnnounceResponse> {

        // info_hash and peer_id are percent-encoded raw bytes, not hex.
        let mut url = format!(
            "{}?info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            self.url.as_str(),
            urlencoding::encode_binary(&params.info_hash),
            urlencoding::encode_binary(&self.identity.peer_id),
            self.identity.port.unwrap_or(params.port),
            params.uploaded,
            params.downloaded,
            params.left,
        );
        if let Some(ip) = self.identity.source_ip {
            url.push_str(&format!("&ip={}", ip));
        }
        if let Some(event) = params.event {
            url.push_str(&format!("&event={}", event));
        }
        if let Some(num_want) = params.num_want {
            url.push_str(&format!("&numwant={}", num_want));
        }
        if let Some(tracker_id) = &self.tracker_id {
            url.push_str(&format!("&trackerid={}", tracker_id));
        }
        tracing::debug!("announce url: {}", url);

        let mut request = self.client.get(url);
        // The identity layer may rewrite the request however it likes;
        // whatever comes back is sent verbatim.
        if let Some(wrap) = &self.identity.wrap {
            request = wrap(request);
        }

        let raw = time::timeout(ANNOUNCE_TIMEOUT, async {
            request.send().await?.bytes().await
        })
        .await??;

        let resp = parse_response(&raw)?;
        tracing::debug!(
            "announce ok: {:?} seeders, {:?} leechers, {} peers",
            resp.complete,
            resp.incomplete,
            resp.peers.len(),
        );

        if let Some(interval) = resp.interval {
            self.interval = Some(Duration::from_secs(interval));
        }
        if let Some(min_interval) = resp.min_interval {
            self.min_interval = Some(Duration::from_secs(min_interval));
        }
        if let Some(tracker_id) = &resp.tracker_id {
            self.tracker_id = Some(tracker_id.clone());
        }

        self.last_announce = Some(Instant::now());
        Ok(resp)
    }

    // Whether the min interval allows an announce right now.
    pub fn can_announce(&self, time: Instant) -> bool {
        if let Some(last_announce) = self.last_announce {
            time.duration_since(last_announce)
                >= self.min_interval.unwrap_or(Duration::from_secs(DEFAULT_MIN_ANNOUNCE_INTERVAL))
        } else {
            true
        }
    }

    // Whether the regular interval has elapsed.
    pub fn should_announce(&self, time: Instant) -> bool {
        if let Some(last_announce) = self.last_announce {
            time.duration_since(last_announce)
                >= self.interval.unwrap_or(Duration::from_secs(DEFAULT_MIN_ANNOUNCE_INTERVAL))
        } else {
            true
        }
    }
}

fn parse_response(buf: &[u8]) -> Result<AnnounceResponse> {

    let root = bencode::decode(buf)?;

    // If present, no other key matters.
    if let Some(reason) = root.get(b"failure reason").and_then(Value::as_str) {
        return Err(TrackerError::Failure(reason.to_owned()));
    }
    if let Some(warning) = root.get(b"warning message").and_then(Value::as_str) {
        tracing::warn!("tracker warning: {}", warning);
    }

    let peers = match root.get(b"peers") {
        // Compact form: 6-byte records.
        Some(Value::Bytes(bytes)) => parse_compact(bytes)?,
        // Dictionary form: a list of dicts with ip, port, peer id.
        Some(list @ Value::List(_)) => parse_peer_dicts(list)?,
        None => Vec::new(),
        Some(_) => return Err(TrackerError::InvalidResponse("peers has the wrong type")),
    };

    Ok(AnnounceResponse {
        interval: root.get(b"interval").and_then(Value::as_int).map(|i| i.max(0) as u64),
        min_interval: root.get(b"min interval").and_then(Value::as_int).map(|i| i.max(0) as u64),
        tracker_id: root.get(b"tracker id").and_then(Value::as_str).map(str::to_owned),
        complete: root.get(b"complete").and_then(Value::as_int).map(|i| i.max(0) as u64),
        incomplete: root.get(b"incomplete").and_then(Value::as_int).map(|i| i.max(0) as u64),
        peers,
    })
}

fn parse_peer_dicts(list: &Value) -> Result<Vec<TrackerPeer>> {

    let list = list.as_list().expect("caller matched a list");
    let mut peers = Vec::with_capacity(list.len());

    for peer in list {
        let Some(ip) = peer.get(b"ip").and_then(Value::as_str) else {
            continue;
        };
        let Some(port) = peer.get(b"port").and_then(Value::as_int) else {
            continue;
        };
        // Hostnames and v6 addresses are skipped, not fatal.
        let Ok(ip) = ip.parse::<std::net::Ipv4Addr>() else {
            continue;
        };
        if port <= 0 || port > u16::MAX as i64 {
            continue;
        }

        let id: Option<ID> = peer
            .get(b"peer id")
            .and_then(Value::as_bytes)
            .and_then(|b| b.try_into().ok());

        peers.push(TrackerPeer {
            address: std::net::SocketAddr::new(ip.into(), port as u16),
            id,
        });
    }

    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bencode::DictEntry;

    fn entry(key: &[u8], value: Value) -> DictEntry {
        DictEntry { key: key.to_vec(), value, span: 0..0 }
    }

    #[test]
    fn test_parse_compact_response() {
        // Two 6-byte records: 10.0.0.1:6881 and 10.0.0.2:6881.
        let mut body = b"d5:peers12:".to_vec();
        body.extend_from_slice(&[0x0a, 0, 0, 1, 0x1a, 0xe1, 0x0a, 0, 0, 2, 0x1a, 0xe1]);
        body.extend_from_slice(b"e");

        let resp = parse_response(&body).unwrap();
        assert_eq!(resp.peers.len(), 2);
        assert_eq!(resp.peers[0].address, "10.0.0.1:6881".parse().unwrap());
        assert_eq!(resp.peers[1].address, "10.0.0.2:6881".parse().unwrap());
        assert!(resp.peers.iter().all(|p| p.id.is_none()));
    }

    #[test]
    fn test_parse_full_response() {
        let body = bencode::encode(&Value::Dict(vec![
            entry(b"complete", Value::Int(9)),
            entry(b"incomplete", Value::Int(1)),
            entry(b"interval", Value::Int(1800)),
            entry(b"min interval", Value::Int(900)),
            entry(b"peers", Value::Bytes(vec![97, 117, 154, 184, 0x13, 0x88])),
        ]));

        let resp = parse_response(&body).unwrap();
        assert_eq!(resp.interval, Some(1800));
        assert_eq!(resp.min_interval, Some(900));
        assert_eq!(resp.complete, Some(9));
        assert_eq!(resp.incomplete, Some(1));
        assert_eq!(resp.peers[0].address, "97.117.154.184:5000".parse().unwrap());
    }

    #[test]
    fn test_parse_dict_form_response() {
        let peer = |ip: &str, port: i64, id: Option<&[u8; 20]>| {
            let mut entries = vec![
                entry(b"ip", Value::Bytes(ip.as_bytes().to_vec())),
                entry(b"port", Value::Int(port)),
            ];
            if let Some(id) = id {
                entries.push(entry(b"peer id", Value::Bytes(id.to_vec())));
            }
            Value::Dict(entries)
        };
        let body = bencode::encode(&Value::Dict(vec![
            entry(b"peers", Value::List(vec![
                peer("10.0.0.1", 6881, Some(b"-XX0001-abcdefghijkl")),
                peer("not-an-ip", 6881, None),
                peer("10.0.0.2", 6882, None),
            ])),
        ]));

        let resp = parse_response(&body).unwrap();
        assert_eq!(resp.peers.len(), 2);
        assert_eq!(resp.peers[0].id, Some(*b"-XX0001-abcdefghijkl"));
        assert_eq!(resp.peers[1].address, "10.0.0.2:6882".parse().unwrap());
    }

    #[test]
    fn test_failure_reason_surfaces() {
        let body = bencode::encode(&Value::Dict(vec![
            entry(b"failure reason", Value::Bytes(b"unregistered torrent".to_vec())),
        ]));
        match parse_response(&body) {
            Err(TrackerError::Failure(reason)) => assert_eq!(reason, "unregistered torrent"),
            other => panic!("expected failure, got {:?}", other.map(|r| r.peers)),
        }
    }
}
