//! The KRPC message codec (BEP 5): bencoded dictionaries over UDP.
//!
//! Every message carries a transaction id `t` (we generate 2-byte tags,
//! remote nodes may use any length) and a type `y`: `q` for queries, `r`
//! for responses, `e` for errors. Query arguments and response data are
//! nested dictionaries; nodes travel in 26-byte compact records and peers
//! in 6-byte compact records.
use std::net::SocketAddr;

use harbor_bencode::{decode, encode, Dict, Value};
use thiserror::Error;

use super::routing::{NodeEntry, NodeId};
use crate::protocol::{decode_compact_nodes, decode_compact_peers, encode_compact_nodes, encode_compact_peers};

/// KRPC error codes used by this node.
pub const ERROR_GENERIC: i64 = 201;
pub const ERROR_PROTOCOL: i64 = 203;
pub const ERROR_BAD_TOKEN: i64 = 203;
pub const ERROR_UNKNOWN_METHOD: i64 = 204;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("not valid bencode: {source}")]
    Bencode {
        #[from]
        source: harbor_bencode::Error,
    },

    #[error("message is missing field `{field}`")]
    MissingField { field: &'static str },

    #[error("message has an unknown `y` value")]
    UnknownType,

    #[error("query names an unknown method: {method}")]
    UnknownMethod { method: String },
}

/// A query as sent or served by this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Ping {
        id: NodeId,
    },
    FindNode {
        id: NodeId,
        target: NodeId,
    },
    GetPeers {
        id: NodeId,
        info_hash: [u8; 20],
    },
    AnnouncePeer {
        id: NodeId,
        info_hash: [u8; 20],
        port: u16,
        token: Vec<u8>,
        implied_port: bool,
    },
}

impl Query {
    #[must_use]
    pub fn method(&self) -> &'static str {
        match self {
            Self::Ping { .. } => "ping",
            Self::FindNode { .. } => "find_node",
            Self::GetPeers { .. } => "get_peers",
            Self::AnnouncePeer { .. } => "announce_peer",
        }
    }

    #[must_use]
    pub fn sender_id(&self) -> NodeId {
        match self {
            Self::Ping { id }
            | Self::FindNode { id, .. }
            | Self::GetPeers { id, .. }
            | Self::AnnouncePeer { id, .. } => *id,
        }
    }
}

/// The `r` dictionary of a response. One container covers all four methods:
/// absent fields stay empty.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResponseData {
    pub id: Option<NodeId>,
    pub nodes: Vec<NodeEntry>,
    pub peers: Vec<SocketAddr>,
    pub token: Option<Vec<u8>>,
}

/// A decoded KRPC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Query { transaction: Vec<u8>, query: Query },
    Response { transaction: Vec<u8>, data: ResponseData },
    Error { transaction: Vec<u8>, code: i64, message: String },
}

impl Message {
    #[must_use]
    pub fn transaction(&self) -> &[u8] {
        match self {
            Self::Query { transaction, .. }
            | Self::Response { transaction, .. }
            | Self::Error { transaction, .. } => transaction,
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut root = Dict::new();

        match self {
            Self::Query { transaction, query } => {
                root.insert(b"t".to_vec(), Value::Bytes(transaction.clone()));
                root.insert(b"y".to_vec(), Value::bytes(b"q"));
                root.insert(b"q".to_vec(), Value::bytes(query.method().as_bytes()));
                root.insert(b"a".to_vec(), Value::Dict(encode_arguments(query)));
            }
            Self::Response { transaction, data } => {
                root.insert(b"t".to_vec(), Value::Bytes(transaction.clone()));
                root.insert(b"y".to_vec(), Value::bytes(b"r"));
                root.insert(b"r".to_vec(), Value::Dict(encode_response_data(data)));
            }
            Self::Error {
                transaction,
                code,
                message,
            } => {
                root.insert(b"t".to_vec(), Value::Bytes(transaction.clone()));
                root.insert(b"y".to_vec(), Value::bytes(b"e"));
                root.insert(
                    b"e".to_vec(),
                    Value::List(vec![Value::Int(*code), Value::bytes(message.as_bytes())]),
                );
            }
        }

        encode(&Value::Dict(root))
    }

    /// Decodes a datagram.
    ///
    /// # Errors
    ///
    /// Will return an [`Error`] on malformed bencode, a missing `t`/`y`, or
    /// an unknown query method.
    pub fn parse(bytes: &[u8]) -> Result<Self, Error> {
        let document = decode(bytes)?;
        let root = document.as_dict().ok_or(Error::MissingField { field: "t" })?;

        let transaction = root
            .get(&b"t"[..])
            .and_then(Value::as_bytes)
            .ok_or(Error::MissingField { field: "t" })?
            .to_vec();

        let message_type = root
            .get(&b"y"[..])
            .and_then(Value::as_bytes)
            .ok_or(Error::MissingField { field: "y" })?;

        match message_type {
            b"q" => {
                let method = root
                    .get(&b"q"[..])
                    .and_then(Value::as_str)
                    .ok_or(Error::MissingField { field: "q" })?;
                let arguments = root
                    .get(&b"a"[..])
                    .and_then(Value::as_dict)
                    .ok_or(Error::MissingField { field: "a" })?;

                Ok(Self::Query {
                    transaction,
                    query: parse_query(method, arguments)?,
                })
            }
            b"r" => {
                let data = root
                    .get(&b"r"[..])
                    .and_then(Value::as_dict)
                    .ok_or(Error::MissingField { field: "r" })?;

                Ok(Self::Response {
                    transaction,
                    data: parse_response_data(data),
                })
            }
            b"e" => {
                let detail = root.get(&b"e"[..]).and_then(Value::as_list).unwrap_or(&[]);

                Ok(Self::Error {
                    transaction,
                    code: detail.first().and_then(Value::as_int).unwrap_or(ERROR_GENERIC),
                    message: detail
                        .get(1)
                        .and_then(Value::as_str)
                        .unwrap_or("unspecified")
                        .to_owned(),
                })
            }
            _ => Err(Error::UnknownType),
        }
    }
}

fn encode_arguments(query: &Query) -> Dict {
    let mut arguments = Dict::new();

    match query {
        Query::Ping { id } => {
            arguments.insert(b"id".to_vec(), Value::bytes(id.0));
        }
        Query::FindNode { id, target } => {
            arguments.insert(b"id".to_vec(), Value::bytes(id.0));
            arguments.insert(b"target".to_vec(), Value::bytes(target.0));
        }
        Query::GetPeers { id, info_hash } => {
            arguments.insert(b"id".to_vec(), Value::bytes(id.0));
            arguments.insert(b"info_hash".to_vec(), Value::bytes(info_hash));
        }
        Query::AnnouncePeer {
            id,
            info_hash,
            port,
            token,
            implied_port,
        } => {
            arguments.insert(b"id".to_vec(), Value::bytes(id.0));
            arguments.insert(b"implied_port".to_vec(), Value::Int(i64::from(*implied_port)));
            arguments.insert(b"info_hash".to_vec(), Value::bytes(info_hash));
            arguments.insert(b"port".to_vec(), Value::Int(i64::from(*port)));
            arguments.insert(b"token".to_vec(), Value::Bytes(token.clone()));
        }
    }

    arguments
}

fn parse_query(method: &str, arguments: &Dict) -> Result<Query, Error> {
    let id = read_id(arguments, b"id")?;

    match method {
        "ping" => Ok(Query::Ping { id }),
        "find_node" => Ok(Query::FindNode {
            id,
            target: read_id(arguments, b"target")?,
        }),
        "get_peers" => Ok(Query::GetPeers {
            id,
            info_hash: read_id(arguments, b"info_hash")?.0,
        }),
        "announce_peer" => {
            let implied_port = arguments
                .get(&b"implied_port"[..])
                .and_then(Value::as_int)
                .is_some_and(|flag| flag != 0);

            let port = arguments
                .get(&b"port"[..])
                .and_then(Value::as_int)
                .and_then(|port| u16::try_from(port).ok())
                .ok_or(Error::MissingField { field: "port" })?;

            let token = arguments
                .get(&b"token"[..])
                .and_then(Value::as_bytes)
                .ok_or(Error::MissingField { field: "token" })?
                .to_vec();

            Ok(Query::AnnouncePeer {
                id,
                info_hash: read_id(arguments, b"info_hash")?.0,
                port,
                token,
                implied_port,
            })
        }
        other => Err(Error::UnknownMethod {
            method: other.to_owned(),
        }),
    }
}

fn encode_response_data(data: &ResponseData) -> Dict {
    let mut encoded = Dict::new();

    if let Some(id) = data.id {
        encoded.insert(b"id".to_vec(), Value::bytes(id.0));
    }

    if !data.nodes.is_empty() {
        let records: Vec<([u8; 20], SocketAddr)> = data.nodes.iter().map(|node| (node.id.0, node.address)).collect();
        encoded.insert(b"nodes".to_vec(), Value::Bytes(encode_compact_nodes(&records)));
    }

    if !data.peers.is_empty() {
        let values = data
            .peers
            .iter()
            .map(|peer| Value::Bytes(encode_compact_peers(std::slice::from_ref(peer))))
            .collect();
        encoded.insert(b"values".to_vec(), Value::List(values));
    }

    if let Some(token) = &data.token {
        encoded.insert(b"token".to_vec(), Value::Bytes(token.clone()));
    }

    encoded
}

fn parse_response_data(data: &Dict) -> ResponseData {
    let id = data
        .get(&b"id"[..])
        .and_then(Value::as_bytes)
        .and_then(|bytes| <[u8; 20]>::try_from(bytes).ok())
        .map(NodeId);

    let nodes = data
        .get(&b"nodes"[..])
        .and_then(Value::as_bytes)
        .and_then(|bytes| decode_compact_nodes(bytes).ok())
        .unwrap_or_default()
        .into_iter()
        .map(|(id, address)| NodeEntry {
            id: NodeId(id),
            address,
        })
        .collect();

    // `values` is a list of compact peer strings, each usually one record.
    let peers = data
        .get(&b"values"[..])
        .and_then(Value::as_list)
        .map(|entries| {
            entries
                .iter()
                .filter_map(Value::as_bytes)
                .filter_map(|bytes| decode_compact_peers(bytes).ok())
                .flatten()
                .collect()
        })
        .unwrap_or_default();

    let token = data.get(&b"token"[..]).and_then(Value::as_bytes).map(<[u8]>::to_vec);

    ResponseData { id, nodes, peers, token }
}

fn read_id(arguments: &Dict, field: &'static [u8]) -> Result<NodeId, Error> {
    arguments
        .get(field)
        .and_then(Value::as_bytes)
        .and_then(|bytes| <[u8; 20]>::try_from(bytes).ok())
        .map(NodeId)
        .ok_or(Error::MissingField {
            field: std::str::from_utf8(field).unwrap_or("id"),
        })
}
