//! The UDP announce transport (BEP 15).
//!
//! Two-step exchange over one socket: a 16-byte connect request (the magic
//! protocol id, action 0 and a random transaction id) buys a connection id,
//! then a 98-byte announce (action 1) returns the interval, swarm counts and
//! a compact peer list. Responses whose transaction id does not match the
//! request are rejected and the socket keeps listening until the attempt
//! times out.
//!
//! Retry policy: 3 attempts with timeouts of 15 s, 30 s and 60 s.
use std::net::SocketAddr;
use std::time::Duration;

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::debug;

use super::{AnnounceData, AnnounceParams};
use crate::protocol::{decode_compact_peers, CompactError};

/// The magic protocol id opening every connect request.
pub const PROTOCOL_ID: u64 = 0x0417_2710_1980;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

const CONNECT_REQUEST_LEN: usize = 16;
const ANNOUNCE_REQUEST_LEN: usize = 98;
const MAX_RESPONSE_LEN: usize = 4096;

/// Per-attempt timeouts: 15 s, then 30 s, then 60 s. Three attempts total.
pub const ATTEMPT_TIMEOUTS: [Duration; 3] = [
    Duration::from_secs(15),
    Duration::from_secs(30),
    Duration::from_secs(60),
];

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("`{url}` is not a valid udp tracker URL")]
    BadUrl { url: String },

    #[error("could not resolve `{host}`")]
    Unresolvable { host: String },

    #[error("socket error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("tracker did not answer within {attempts} attempt(s)")]
    Timeout { attempts: usize },

    #[error("tracker answered action {action} to a {expected} request")]
    UnexpectedAction { action: u32, expected: u32 },

    #[error("response is {len} bytes, too short for its action")]
    TooShort { len: usize },

    #[error("tracker error: {message}")]
    Tracker { message: String },

    #[error("tracker sent a malformed peer list: {source}")]
    BadPeerList {
        #[from]
        source: CompactError,
    },
}

/// The UDP announce client. Stateless: each announce binds an ephemeral
/// socket and performs the full connect + announce exchange.
#[derive(Debug, Default)]
pub struct Client {}

impl Client {
    #[must_use]
    pub fn new() -> Self {
        Self {}
    }

    /// Announces to a `udp://host:port[/...]` URL.
    ///
    /// # Errors
    ///
    /// Will return an [`Error`] on resolution failure, exhausted retries, a
    /// tracker-reported error or a malformed response.
    pub async fn announce(&self, url: &str, params: &AnnounceParams) -> Result<AnnounceData, Error> {
        let address = resolve(url).await?;

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(address).await?;

        for (attempt, attempt_timeout) in ATTEMPT_TIMEOUTS.iter().enumerate() {
            debug!(%url, attempt, "udp announce attempt");

            match timeout(*attempt_timeout, exchange(&socket, params)).await {
                Ok(result) => return result,
                Err(_elapsed) if attempt + 1 < ATTEMPT_TIMEOUTS.len() => (),
                Err(_elapsed) => {
                    return Err(Error::Timeout {
                        attempts: ATTEMPT_TIMEOUTS.len(),
                    })
                }
            }
        }

        unreachable!("the loop either returns or errors on the last attempt")
    }
}

/// One connect + announce exchange. Runs under the caller's timeout.
async fn exchange(socket: &UdpSocket, params: &AnnounceParams) -> Result<AnnounceData, Error> {
    let (connect_transaction, announce_transaction, key) = {
        let mut rng = rand::thread_rng();
        (rng.gen::<u32>(), rng.gen::<u32>(), rng.gen::<u32>())
    };

    // Step 1: connect.
    socket.send(&encode_connect_request(connect_transaction)).await?;
    let connection_id = receive_matching(socket, connect_transaction, parse_connect_response).await?;

    // Step 2: announce.
    socket
        .send(&encode_announce_request(connection_id, announce_transaction, key, params))
        .await?;

    receive_matching(socket, announce_transaction, parse_announce_response).await
}

/// Receives datagrams until one carries the expected transaction id, then
/// parses it. Mismatched transactions are dropped silently.
async fn receive_matching<T>(
    socket: &UdpSocket,
    transaction: u32,
    parse: impl Fn(&[u8]) -> Result<T, Error>,
) -> Result<T, Error> {
    let mut buffer = [0u8; MAX_RESPONSE_LEN];

    loop {
        let len = socket.recv(&mut buffer).await?;
        let response = &buffer[..len];

        if len < 8 {
            continue;
        }

        let got = u32::from_be_bytes([response[4], response[5], response[6], response[7]]);
        if got != transaction {
            debug!(got, expected = transaction, "dropping mismatched transaction");
            continue;
        }

        return parse(response);
    }
}

fn encode_connect_request(transaction: u32) -> [u8; CONNECT_REQUEST_LEN] {
    let mut packet = [0u8; CONNECT_REQUEST_LEN];

    packet[0..8].copy_from_slice(&PROTOCOL_ID.to_be_bytes());
    packet[8..12].copy_from_slice(&ACTION_CONNECT.to_be_bytes());
    packet[12..16].copy_from_slice(&transaction.to_be_bytes());

    packet
}

fn parse_connect_response(response: &[u8]) -> Result<u64, Error> {
    if response.len() < 16 {
        return Err(Error::TooShort { len: response.len() });
    }

    let action = u32::from_be_bytes([response[0], response[1], response[2], response[3]]);
    if action == ACTION_ERROR {
        return Err(parse_error_response(response));
    }
    if action != ACTION_CONNECT {
        return Err(Error::UnexpectedAction {
            action,
            expected: ACTION_CONNECT,
        });
    }

    let mut connection_id = [0u8; 8];
    connection_id.copy_from_slice(&response[8..16]);
    Ok(u64::from_be_bytes(connection_id))
}

fn encode_announce_request(
    connection_id: u64,
    transaction: u32,
    key: u32,
    params: &AnnounceParams,
) -> [u8; ANNOUNCE_REQUEST_LEN] {
    let mut packet = [0u8; ANNOUNCE_REQUEST_LEN];

    packet[0..8].copy_from_slice(&connection_id.to_be_bytes());
    packet[8..12].copy_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
    packet[12..16].copy_from_slice(&transaction.to_be_bytes());
    packet[16..36].copy_from_slice(&params.info_hash.bytes());
    packet[36..56].copy_from_slice(&params.peer_id.bytes());
    packet[56..64].copy_from_slice(&params.downloaded.to_be_bytes());
    packet[64..72].copy_from_slice(&params.left.to_be_bytes());
    packet[72..80].copy_from_slice(&params.uploaded.to_be_bytes());
    #[allow(clippy::cast_sign_loss)]
    packet[80..84].copy_from_slice(&(params.event.to_i32() as u32).to_be_bytes());
    // ip address: 0 tells the tracker to use the packet source.
    packet[84..88].copy_from_slice(&0u32.to_be_bytes());
    packet[88..92].copy_from_slice(&key.to_be_bytes());
    // num_want: -1 for the tracker's default.
    packet[92..96].copy_from_slice(&(-1i32).to_be_bytes());
    packet[96..98].copy_from_slice(&params.port.to_be_bytes());

    packet
}

fn parse_announce_response(response: &[u8]) -> Result<AnnounceData, Error> {
    if response.len() < 20 {
        return Err(Error::TooShort { len: response.len() });
    }

    let action = u32::from_be_bytes([response[0], response[1], response[2], response[3]]);
    if action == ACTION_ERROR {
        return Err(parse_error_response(response));
    }
    if action != ACTION_ANNOUNCE {
        return Err(Error::UnexpectedAction {
            action,
            expected: ACTION_ANNOUNCE,
        });
    }

    let interval = u32::from_be_bytes([response[8], response[9], response[10], response[11]]);
    let peers = decode_compact_peers(&response[20..])?;

    Ok(AnnounceData::new(
        Some(Duration::from_secs(u64::from(interval))),
        peers,
    ))
}

fn parse_error_response(response: &[u8]) -> Error {
    Error::Tracker {
        message: String::from_utf8_lossy(&response[8..]).into_owned(),
    }
}

async fn resolve(url: &str) -> Result<SocketAddr, Error> {
    let parsed = url::Url::parse(url).map_err(|_| Error::BadUrl { url: url.to_owned() })?;

    if parsed.scheme() != "udp" {
        return Err(Error::BadUrl { url: url.to_owned() });
    }

    let host = parsed.host_str().ok_or_else(|| Error::BadUrl { url: url.to_owned() })?;
    let port = parsed.port().ok_or_else(|| Error::BadUrl { url: url.to_owned() })?;

    tokio::net::lookup_host((host, port))
        .await
        .ok()
        .and_then(|mut addresses| addresses.next())
        .ok_or_else(|| Error::Unresolvable {
            host: format!("{host}:{port}"),
        })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use harbor_primitives::announce_event::AnnounceEvent;
    use harbor_primitives::info_hash::InfoHash;
    use harbor_primitives::peer;

    use super::{
        encode_announce_request, encode_connect_request, parse_announce_response, parse_connect_response, Error,
        ACTION_ANNOUNCE, ACTION_CONNECT, PROTOCOL_ID,
    };
    use crate::trackers::AnnounceParams;

    fn sample_params() -> AnnounceParams {
        AnnounceParams {
            info_hash: InfoHash([0xAB; 20]),
            peer_id: peer::Id(*b"-HB0100-000000000001"),
            port: 6881,
            uploaded: 1,
            downloaded: 2,
            left: 3,
            event: AnnounceEvent::Started,
        }
    }

    #[test]
    fn a_connect_request_should_open_with_the_magic_protocol_id() {
        let packet = encode_connect_request(0xDEAD_BEEF);

        assert_eq!(packet.len(), 16);
        assert_eq!(&packet[0..8], &PROTOCOL_ID.to_be_bytes());
        assert_eq!(&packet[8..12], &[0, 0, 0, 0]);
        assert_eq!(&packet[12..16], &[0xDE, 0xAD, 0xBE, 0xEF]);
    }

    #[test]
    fn an_announce_request_should_be_exactly_98_bytes() {
        let packet = encode_announce_request(0x1122_3344_5566_7788, 7, 9, &sample_params());

        assert_eq!(packet.len(), 98);
        assert_eq!(&packet[0..8], &0x1122_3344_5566_7788u64.to_be_bytes());
        assert_eq!(&packet[8..12], &ACTION_ANNOUNCE.to_be_bytes());
        assert_eq!(&packet[16..36], &[0xAB; 20]);
        assert_eq!(&packet[36..56], b"-HB0100-000000000001");
        // downloaded/left/uploaded as 64-bit big-endian.
        assert_eq!(&packet[56..64], &2u64.to_be_bytes());
        assert_eq!(&packet[64..72], &3u64.to_be_bytes());
        assert_eq!(&packet[72..80], &1u64.to_be_bytes());
        // event code: started = 2.
        assert_eq!(&packet[80..84], &2u32.to_be_bytes());
        // num_want: -1.
        assert_eq!(&packet[92..96], &[0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(&packet[96..98], &6881u16.to_be_bytes());
    }

    #[test]
    fn a_connect_response_should_yield_the_connection_id() {
        let mut response = Vec::new();
        response.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
        response.extend_from_slice(&7u32.to_be_bytes());
        response.extend_from_slice(&0xCAFE_F00D_0000_0001u64.to_be_bytes());

        assert_eq!(parse_connect_response(&response).unwrap(), 0xCAFE_F00D_0000_0001);
    }

    #[test]
    fn short_responses_should_be_rejected() {
        assert!(matches!(
            parse_connect_response(&[0u8; 10]),
            Err(Error::TooShort { len: 10 })
        ));
        assert!(matches!(
            parse_announce_response(&[0u8; 19]),
            Err(Error::TooShort { len: 19 })
        ));
    }

    #[test]
    fn an_announce_response_should_yield_interval_and_peers() {
        let mut response = Vec::new();
        response.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
        response.extend_from_slice(&7u32.to_be_bytes());
        response.extend_from_slice(&1800u32.to_be_bytes()); // interval
        response.extend_from_slice(&5u32.to_be_bytes()); // leechers
        response.extend_from_slice(&3u32.to_be_bytes()); // seeders
        response.extend_from_slice(&[0x0A, 0x00, 0x00, 0x01, 0x1A, 0xE1]);

        let data = parse_announce_response(&response).unwrap();

        assert_eq!(data.interval, Some(Duration::from_secs(1800)));
        assert_eq!(data.peers.len(), 1);
        assert_eq!(data.peers[0].port(), 6881);
    }

    #[test]
    fn a_tracker_error_should_surface_its_message() {
        let mut response = Vec::new();
        response.extend_from_slice(&3u32.to_be_bytes());
        response.extend_from_slice(&7u32.to_be_bytes());
        response.extend_from_slice(b"access denied");

        assert!(matches!(
            parse_connect_response(&response),
            Err(Error::Tracker { message }) if message == "access denied"
        ));
    }

    #[tokio::test]
    async fn it_should_complete_a_full_exchange_against_a_fake_tracker() {
        use tokio::net::UdpSocket;

        // A fake tracker answering one connect and one announce.
        let tracker = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let tracker_address = tracker.local_addr().unwrap();

        let fake = tokio::spawn(async move {
            let mut buffer = [0u8; 1024];

            // Connect.
            let (len, from) = tracker.recv_from(&mut buffer).await.unwrap();
            assert_eq!(len, 16);
            assert_eq!(&buffer[0..8], &PROTOCOL_ID.to_be_bytes());
            let transaction = &buffer[12..16].to_vec();

            let mut response = Vec::new();
            response.extend_from_slice(&0u32.to_be_bytes());
            response.extend_from_slice(transaction);
            response.extend_from_slice(&42u64.to_be_bytes());
            tracker.send_to(&response, from).await.unwrap();

            // Announce.
            let (len, from) = tracker.recv_from(&mut buffer).await.unwrap();
            assert_eq!(len, 98);
            assert_eq!(&buffer[0..8], &42u64.to_be_bytes());
            let transaction = buffer[12..16].to_vec();

            let mut response = Vec::new();
            response.extend_from_slice(&1u32.to_be_bytes());
            response.extend_from_slice(&transaction);
            response.extend_from_slice(&900u32.to_be_bytes());
            response.extend_from_slice(&0u32.to_be_bytes());
            response.extend_from_slice(&1u32.to_be_bytes());
            response.extend_from_slice(&[127, 0, 0, 1, 0x1A, 0xE1]);
            tracker.send_to(&response, from).await.unwrap();
        });

        let client = super::Client::new();
        let data = client
            .announce(&format!("udp://{tracker_address}"), &sample_params())
            .await
            .unwrap();

        assert_eq!(data.interval, Some(Duration::from_secs(900)));
        assert_eq!(data.peers.len(), 1);

        fake.await.unwrap();
    }
}
