use std::net::{IpAddr, SocketAddr};

use serde::Deserialize;

use crate::{Error, PeerEntry, PeerId, Result, Sha1};

#[derive(Debug, Clone)]
pub struct AnnounceParams {
    pub torrent_id: Sha1,
    pub peer_id: PeerId,
    pub port: u16,
    pub ip: Option<IpAddr>,
}

#[derive(Debug)]
pub struct Announce {
    /// Seconds until the next announce.
    pub interval: u64,
    pub peers: Vec<PeerEntry>,
}

#[derive(Debug, Deserialize)]
struct TrackerResponse {
    #[serde(default)]
    interval: Option<u64>,
    #[serde(default)]
    peers: Vec<(String, String)>,
    #[serde(default)]
    failure_reason: Option<String>,
}

const DEFAULT_INTERVAL: u64 = 30;

#[derive(Debug, Clone)]
pub struct TrackerClient {
    url: String,
    client: reqwest::Client,
}

impl TrackerClient {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(Error::Tracker(format!("unsupported tracker url: {url}")));
        }
        Ok(Self {
            url,
            client: reqwest::Client::new(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn announce(&self, params: &AnnounceParams) -> Result<Announce> {
        let mut query = vec![
            ("peer_id", params.peer_id.to_string()),
            ("port", params.port.to_string()),
            ("torrent_id", params.torrent_id.to_hex()),
        ];
        if let Some(ip) = params.ip {
            query.push(("ip", ip.to_string()));
        }

        let response = self
            .client
            .get(&self.url)
            .query(&query)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| Error::Tracker(err.to_string()))?
            .json::<TrackerResponse>()
            .await
            .map_err(|err| Error::Tracker(err.to_string()))?;

        parse_response(response)
    }
}

fn parse_response(response: TrackerResponse) -> Result<Announce> {
    if let Some(reason) = response.failure_reason {
        return Err(Error::Tracker(format!("tracker failure: {reason}")));
    }

    let mut peers = Vec::with_capacity(response.peers.len());
    for (addr, id) in response.peers {
        match addr.parse::<SocketAddr>() {
            Ok(addr) => peers.push(PeerEntry::new(addr, id)),
            Err(err) => tracing::warn!("ignoring peer {id} with invalid address {addr:?}: {err}"),
        }
    }

    Ok(Announce {
        interval: response.interval.unwrap_or(DEFAULT_INTERVAL),
        peers,
    })
}
