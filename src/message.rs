//! Packet Registry
//!
//! Maps numeric packet ids to typed packet records and back. All packets
//! serialize to RLP list bodies; the id travels separately as the RLP uint
//! prefix of the frame data.
//!
//! ## Packet ids
//!
//! | Id   | Packet          | Capability |
//! |------|-----------------|------------|
//! | 0x00 | Hello           | p2p        |
//! | 0x01 | Disconnect      | p2p        |
//! | 0x02 | Ping            | p2p        |
//! | 0x03 | Pong            | p2p        |
//! | 0x10 | Status          | eth        |
//! | 0x11 | NewBlockHashes  | eth        |
//! | 0x12 | Transactions    | eth        |
//! | 0x13 | GetBlockHeaders | eth        |
//! | 0x14 | BlockHeaders    | eth        |
//! | 0x15 | GetBlockBodies  | eth        |
//! | 0x16 | BlockBodies     | eth        |
//! | 0x17 | NewBlock        | eth        |
//!
//! The `eth` ids assume the single-subprotocol offset 0x10 negotiated by the
//! `Hello` capability list.

use crate::peer::PeerId;
use crate::rlp::{self, Item, RlpError};
use thiserror::Error;

/// Base-protocol version advertised in `Hello`.
pub const P2P_PROTOCOL_VERSION: u64 = 5;

/// `eth` subprotocol version spoken by the registry.
pub const ETH_PROTOCOL_VERSION: u64 = 63;

/// Offset of the first `eth` packet id after the base protocol.
pub const ETH_ID_OFFSET: u8 = 0x10;

/// Errors from packet decoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("unknown packet id {0:#04x}")]
    UnknownId(u8),

    #[error("invalid packet body: {0}")]
    Rlp(#[from] RlpError),

    #[error("unknown disconnect reason {0:#04x}")]
    UnknownReason(u8),
}

/// What the session should do after a packet is handled.
#[derive(Debug, PartialEq)]
pub enum PacketAction {
    /// Nothing beyond subscriber fan-out.
    Ok,
    /// Mark the session active (only `Hello` produces this).
    Activate,
    /// The remote ended the session.
    PeerDisconnected,
    /// We must end the session with the given reason.
    Disconnect(DisconnectReason),
    /// Reply with a packet.
    Send(Box<Message>),
}

// ============================================================================
// Disconnect reasons
// ============================================================================

/// Canonical DevP2P disconnect reasons.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum DisconnectReason {
    DisconnectRequested = 0x00,
    TcpSubsystemError = 0x01,
    BreachOfProtocol = 0x02,
    UselessPeer = 0x03,
    TooManyPeers = 0x04,
    AlreadyConnected = 0x05,
    IncompatibleP2pVersion = 0x06,
    NullNodeIdentity = 0x07,
    ClientQuitting = 0x08,
    UnexpectedIdentity = 0x09,
    ConnectedToSelf = 0x0a,
    PingTimeout = 0x0b,
    SubprotocolReason = 0x10,
}

impl DisconnectReason {
    /// The wire code.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Look up a reason by wire code.
    pub fn from_code(code: u8) -> Result<Self, MessageError> {
        Ok(match code {
            0x00 => Self::DisconnectRequested,
            0x01 => Self::TcpSubsystemError,
            0x02 => Self::BreachOfProtocol,
            0x03 => Self::UselessPeer,
            0x04 => Self::TooManyPeers,
            0x05 => Self::AlreadyConnected,
            0x06 => Self::IncompatibleP2pVersion,
            0x07 => Self::NullNodeIdentity,
            0x08 => Self::ClientQuitting,
            0x09 => Self::UnexpectedIdentity,
            0x0a => Self::ConnectedToSelf,
            0x0b => Self::PingTimeout,
            0x10 => Self::SubprotocolReason,
            other => return Err(MessageError::UnknownReason(other)),
        })
    }

    /// Human-readable reason text.
    pub fn message(self) -> &'static str {
        match self {
            Self::DisconnectRequested => "disconnect requested",
            Self::TcpSubsystemError => "TCP subsystem error",
            Self::BreachOfProtocol => "breach of protocol",
            Self::UselessPeer => "useless peer",
            Self::TooManyPeers => "too many peers",
            Self::AlreadyConnected => "already connected",
            Self::IncompatibleP2pVersion => "incompatible P2P protocol version",
            Self::NullNodeIdentity => "null node identity received",
            Self::ClientQuitting => "client quitting",
            Self::UnexpectedIdentity => "unexpected identity",
            Self::ConnectedToSelf => "connected to self",
            Self::PingTimeout => "ping timeout",
            Self::SubprotocolReason => "subprotocol reason",
        }
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({:#04x})", self.message(), self.code())
    }
}

// ============================================================================
// Record types
// ============================================================================

/// A named, versioned subprotocol advertised in `Hello`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Capability {
    pub name: String,
    pub version: u64,
}

impl Capability {
    pub fn new(name: impl Into<String>, version: u64) -> Self {
        Self { name: name.into(), version }
    }

    /// The `eth/63` capability.
    pub fn eth() -> Self {
        Self::new("eth", ETH_PROTOCOL_VERSION)
    }
}

/// `Hello`: the first packet on a fresh frame stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hello {
    pub protocol_version: u64,
    pub client_id: String,
    pub capabilities: Vec<Capability>,
    pub listen_port: u16,
    pub node_id: PeerId,
}

impl Hello {
    /// Whether the remote shares an `eth` capability with us.
    pub fn supports_eth(&self) -> bool {
        self.capabilities.iter().any(|c| c.name == "eth")
    }
}

/// `Status`: chain state summary, also used as the liveness probe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Status {
    pub version: u64,
    pub network_id: u64,
    pub total_difficulty: u128,
    pub head_hash: [u8; 32],
    pub genesis_hash: [u8; 32],
}

/// Hash-and-number block announcement entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewBlockHash {
    pub hash: [u8; 32],
    pub number: u64,
}

/// Block selector in `GetBlockHeaders`: by hash or by number.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockId {
    Hash([u8; 32]),
    Number(u64),
}

/// `GetBlockHeaders` query parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetBlockHeaders {
    pub block: BlockId,
    pub max_headers: u64,
    pub skip: u64,
    pub reverse: bool,
}

/// An Ethereum block header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub parent_hash: [u8; 32],
    pub ommers_hash: [u8; 32],
    pub beneficiary: [u8; 20],
    pub state_root: [u8; 32],
    pub transactions_root: [u8; 32],
    pub receipts_root: [u8; 32],
    pub logs_bloom: [u8; 256],
    pub difficulty: u128,
    pub number: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub timestamp: u64,
    pub extra_data: Vec<u8>,
    pub mix_hash: [u8; 32],
    pub nonce: [u8; 8],
}

/// A legacy (pre-typed-envelope) Ethereum transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub nonce: u64,
    pub gas_price: u128,
    pub gas_limit: u64,
    /// `None` for contract creation.
    pub to: Option<[u8; 20]>,
    pub value: u128,
    pub data: Vec<u8>,
    pub v: u64,
    pub r: [u8; 32],
    pub s: [u8; 32],
}

/// Transactions and ommers of one block.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct BlockBody {
    pub transactions: Vec<Transaction>,
    pub ommers: Vec<BlockHeader>,
}

/// `NewBlock`: a full block propagation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewBlock {
    pub header: BlockHeader,
    pub body: BlockBody,
    pub total_difficulty: u128,
}

// ============================================================================
// The message enum
// ============================================================================

/// One decoded packet.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Hello(Hello),
    Disconnect(DisconnectReason),
    Ping,
    Pong,
    Status(Status),
    NewBlockHashes(Vec<NewBlockHash>),
    Transactions(Vec<Transaction>),
    GetBlockHeaders(GetBlockHeaders),
    BlockHeaders(Vec<BlockHeader>),
    GetBlockBodies(Vec<[u8; 32]>),
    BlockBodies(Vec<BlockBody>),
    NewBlock(Box<NewBlock>),
}

impl Message {
    /// The wire packet id.
    pub fn id(&self) -> u8 {
        match self {
            Message::Hello(_) => 0x00,
            Message::Disconnect(_) => 0x01,
            Message::Ping => 0x02,
            Message::Pong => 0x03,
            Message::Status(_) => ETH_ID_OFFSET,
            Message::NewBlockHashes(_) => ETH_ID_OFFSET + 0x01,
            Message::Transactions(_) => ETH_ID_OFFSET + 0x02,
            Message::GetBlockHeaders(_) => ETH_ID_OFFSET + 0x03,
            Message::BlockHeaders(_) => ETH_ID_OFFSET + 0x04,
            Message::GetBlockBodies(_) => ETH_ID_OFFSET + 0x05,
            Message::BlockBodies(_) => ETH_ID_OFFSET + 0x06,
            Message::NewBlock(_) => ETH_ID_OFFSET + 0x07,
        }
    }

    /// A short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Message::Hello(_) => "Hello",
            Message::Disconnect(_) => "Disconnect",
            Message::Ping => "Ping",
            Message::Pong => "Pong",
            Message::Status(_) => "Status",
            Message::NewBlockHashes(_) => "NewBlockHashes",
            Message::Transactions(_) => "Transactions",
            Message::GetBlockHeaders(_) => "GetBlockHeaders",
            Message::BlockHeaders(_) => "BlockHeaders",
            Message::GetBlockBodies(_) => "GetBlockBodies",
            Message::BlockBodies(_) => "BlockBodies",
            Message::NewBlock(_) => "NewBlock",
        }
    }

    /// Serialize the packet body (without the id prefix).
    pub fn encode_body(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Message::Hello(hello) => rlp::encode_list(&mut out, |p| {
                rlp::encode_uint(p, hello.protocol_version as u128);
                rlp::encode_str(p, &hello.client_id);
                rlp::encode_list(p, |caps| {
                    for cap in &hello.capabilities {
                        rlp::encode_list(caps, |c| {
                            rlp::encode_str(c, &cap.name);
                            rlp::encode_uint(c, cap.version as u128);
                        });
                    }
                });
                rlp::encode_uint(p, hello.listen_port as u128);
                rlp::encode_bytes(p, hello.node_id.as_bytes());
            }),
            Message::Disconnect(reason) => rlp::encode_list(&mut out, |p| {
                rlp::encode_uint(p, reason.code() as u128);
            }),
            Message::Ping | Message::Pong => rlp::encode_list(&mut out, |_| {}),
            Message::Status(status) => rlp::encode_list(&mut out, |p| {
                rlp::encode_uint(p, status.version as u128);
                rlp::encode_uint(p, status.network_id as u128);
                rlp::encode_uint(p, status.total_difficulty);
                rlp::encode_bytes(p, &status.head_hash);
                rlp::encode_bytes(p, &status.genesis_hash);
            }),
            Message::NewBlockHashes(entries) => rlp::encode_list(&mut out, |p| {
                for entry in entries {
                    rlp::encode_list(p, |e| {
                        rlp::encode_bytes(e, &entry.hash);
                        rlp::encode_uint(e, entry.number as u128);
                    });
                }
            }),
            Message::Transactions(txs) => rlp::encode_list(&mut out, |p| {
                for tx in txs {
                    encode_transaction(p, tx);
                }
            }),
            Message::GetBlockHeaders(query) => rlp::encode_list(&mut out, |p| {
                match query.block {
                    BlockId::Hash(hash) => rlp::encode_bytes(p, &hash),
                    BlockId::Number(number) => rlp::encode_uint(p, number as u128),
                }
                rlp::encode_uint(p, query.max_headers as u128);
                rlp::encode_uint(p, query.skip as u128);
                rlp::encode_uint(p, query.reverse as u128);
            }),
            Message::BlockHeaders(headers) => rlp::encode_list(&mut out, |p| {
                for header in headers {
                    encode_header(p, header);
                }
            }),
            Message::GetBlockBodies(hashes) => rlp::encode_list(&mut out, |p| {
                for hash in hashes {
                    rlp::encode_bytes(p, hash);
                }
            }),
            Message::BlockBodies(bodies) => rlp::encode_list(&mut out, |p| {
                for body in bodies {
                    encode_body_record(p, body);
                }
            }),
            Message::NewBlock(new_block) => rlp::encode_list(&mut out, |p| {
                rlp::encode_list(p, |b| {
                    encode_header(b, &new_block.header);
                    rlp::encode_list(b, |txs| {
                        for tx in &new_block.body.transactions {
                            encode_transaction(txs, tx);
                        }
                    });
                    rlp::encode_list(b, |ommers| {
                        for ommer in &new_block.body.ommers {
                            encode_header(ommers, ommer);
                        }
                    });
                });
                rlp::encode_uint(p, new_block.total_difficulty);
            }),
        }
        out
    }

    /// Deserialize a packet from its id and body.
    pub fn decode(id: u8, body: &[u8]) -> Result<Self, MessageError> {
        match id {
            0x00 => decode_hello(body),
            0x01 => decode_disconnect(body),
            0x02 => Ok(Message::Ping),
            0x03 => Ok(Message::Pong),
            0x10 => decode_status(body),
            0x11 => decode_new_block_hashes(body),
            0x12 => {
                let mut txs = Vec::new();
                for item in body_list(body)? {
                    txs.push(decode_transaction(item?)?);
                }
                Ok(Message::Transactions(txs))
            }
            0x13 => decode_get_block_headers(body),
            0x14 => {
                let mut headers = Vec::new();
                for item in body_list(body)? {
                    headers.push(decode_header(item?)?);
                }
                Ok(Message::BlockHeaders(headers))
            }
            0x15 => {
                let mut hashes = Vec::new();
                for item in body_list(body)? {
                    hashes.push(item?.fixed::<32>()?);
                }
                Ok(Message::GetBlockBodies(hashes))
            }
            0x16 => {
                let mut bodies = Vec::new();
                for item in body_list(body)? {
                    bodies.push(decode_body_record(item?)?);
                }
                Ok(Message::BlockBodies(bodies))
            }
            0x17 => decode_new_block(body),
            other => Err(MessageError::UnknownId(other)),
        }
    }

    /// The state-machine action this packet triggers.
    pub fn handle(&self) -> PacketAction {
        match self {
            Message::Hello(_) => PacketAction::Activate,
            Message::Disconnect(_) => PacketAction::PeerDisconnected,
            Message::Ping => PacketAction::Send(Box::new(Message::Pong)),
            _ => PacketAction::Ok,
        }
    }
}

// ============================================================================
// Field codecs
// ============================================================================

/// Open the outer list of a packet body, tolerating trailing padding.
fn body_list(body: &[u8]) -> Result<rlp::ListIter<'_>, RlpError> {
    let (item, _trailing) = rlp::split_first(body)?;
    item.list()
}

/// Encode a 256-bit value as a minimal-length RLP uint.
fn encode_u256(out: &mut Vec<u8>, value: &[u8; 32]) {
    let first = value.iter().position(|&b| b != 0).unwrap_or(32);
    rlp::encode_bytes(out, &value[first..]);
}

/// Decode a minimal-length RLP uint into a left-padded 256-bit value.
fn decode_u256(item: Item<'_>) -> Result<[u8; 32], RlpError> {
    let bytes = item.bytes()?;
    if bytes.first() == Some(&0) {
        return Err(RlpError::NonCanonical);
    }
    if bytes.len() > 32 {
        return Err(RlpError::IntegerOverflow);
    }
    let mut out = [0u8; 32];
    out[32 - bytes.len()..].copy_from_slice(bytes);
    Ok(out)
}

fn decode_hello(body: &[u8]) -> Result<Message, MessageError> {
    let mut fields = body_list(body)?;
    let protocol_version = fields.next_item()?.u64()?;
    let client_id = fields.next_item()?.string()?.to_string();

    let mut capabilities = Vec::new();
    for cap in fields.next_item()?.list()? {
        let mut cap = cap?.list()?;
        let name = cap.next_item()?.string()?.to_string();
        let version = cap.next_item()?.u64()?;
        capabilities.push(Capability { name, version });
    }

    let listen_port = fields.next_item()?.u16()?;
    let node_id = PeerId::from_bytes(fields.next_item()?.fixed::<64>()?);
    // Additional list elements are ignored (EIP-8 forward compatibility).

    Ok(Message::Hello(Hello { protocol_version, client_id, capabilities, listen_port, node_id }))
}

fn decode_disconnect(body: &[u8]) -> Result<Message, MessageError> {
    // An empty body and a bare reason byte both occur in the wild; the
    // canonical form is a one-element list.
    if body.is_empty() {
        return Ok(Message::Disconnect(DisconnectReason::DisconnectRequested));
    }
    let (item, _trailing) = rlp::split_first(body)?;
    let code = match item {
        Item::List(_) => {
            let mut fields = item.list()?;
            fields.next_item()?.u8()?
        }
        Item::Bytes(_) => item.u8()?,
    };
    Ok(Message::Disconnect(DisconnectReason::from_code(code)?))
}

fn decode_status(body: &[u8]) -> Result<Message, MessageError> {
    let mut fields = body_list(body)?;
    let status = Status {
        version: fields.next_item()?.u64()?,
        network_id: fields.next_item()?.u64()?,
        total_difficulty: fields.next_item()?.uint()?,
        head_hash: fields.next_item()?.fixed::<32>()?,
        genesis_hash: fields.next_item()?.fixed::<32>()?,
    };
    Ok(Message::Status(status))
}

fn decode_new_block_hashes(body: &[u8]) -> Result<Message, MessageError> {
    let mut entries = Vec::new();
    for entry in body_list(body)? {
        let mut entry = entry?.list()?;
        entries.push(NewBlockHash {
            hash: entry.next_item()?.fixed::<32>()?,
            number: entry.next_item()?.u64()?,
        });
    }
    Ok(Message::NewBlockHashes(entries))
}

fn decode_get_block_headers(body: &[u8]) -> Result<Message, MessageError> {
    let mut fields = body_list(body)?;
    let block_item = fields.next_item()?;
    let block = match block_item.bytes()? {
        hash if hash.len() == 32 => BlockId::Hash(block_item.fixed::<32>()?),
        _ => BlockId::Number(block_item.u64()?),
    };
    Ok(Message::GetBlockHeaders(GetBlockHeaders {
        block,
        max_headers: fields.next_item()?.u64()?,
        skip: fields.next_item()?.u64()?,
        reverse: fields.next_item()?.u64()? != 0,
    }))
}

fn encode_header(out: &mut Vec<u8>, header: &BlockHeader) {
    rlp::encode_list(out, |p| {
        rlp::encode_bytes(p, &header.parent_hash);
        rlp::encode_bytes(p, &header.ommers_hash);
        rlp::encode_bytes(p, &header.beneficiary);
        rlp::encode_bytes(p, &header.state_root);
        rlp::encode_bytes(p, &header.transactions_root);
        rlp::encode_bytes(p, &header.receipts_root);
        rlp::encode_bytes(p, &header.logs_bloom);
        rlp::encode_uint(p, header.difficulty);
        rlp::encode_uint(p, header.number as u128);
        rlp::encode_uint(p, header.gas_limit as u128);
        rlp::encode_uint(p, header.gas_used as u128);
        rlp::encode_uint(p, header.timestamp as u128);
        rlp::encode_bytes(p, &header.extra_data);
        rlp::encode_bytes(p, &header.mix_hash);
        rlp::encode_bytes(p, &header.nonce);
    });
}

fn decode_header(item: Item<'_>) -> Result<BlockHeader, MessageError> {
    let mut fields = item.list()?;
    Ok(BlockHeader {
        parent_hash: fields.next_item()?.fixed::<32>()?,
        ommers_hash: fields.next_item()?.fixed::<32>()?,
        beneficiary: fields.next_item()?.fixed::<20>()?,
        state_root: fields.next_item()?.fixed::<32>()?,
        transactions_root: fields.next_item()?.fixed::<32>()?,
        receipts_root: fields.next_item()?.fixed::<32>()?,
        logs_bloom: fields.next_item()?.fixed::<256>()?,
        difficulty: fields.next_item()?.uint()?,
        number: fields.next_item()?.u64()?,
        gas_limit: fields.next_item()?.u64()?,
        gas_used: fields.next_item()?.u64()?,
        timestamp: fields.next_item()?.u64()?,
        extra_data: fields.next_item()?.bytes()?.to_vec(),
        mix_hash: fields.next_item()?.fixed::<32>()?,
        nonce: fields.next_item()?.fixed::<8>()?,
    })
}

fn encode_transaction(out: &mut Vec<u8>, tx: &Transaction) {
    rlp::encode_list(out, |p| {
        rlp::encode_uint(p, tx.nonce as u128);
        rlp::encode_uint(p, tx.gas_price);
        rlp::encode_uint(p, tx.gas_limit as u128);
        match &tx.to {
            Some(to) => rlp::encode_bytes(p, to),
            None => rlp::encode_bytes(p, &[]),
        }
        rlp::encode_uint(p, tx.value);
        rlp::encode_bytes(p, &tx.data);
        rlp::encode_uint(p, tx.v as u128);
        encode_u256(p, &tx.r);
        encode_u256(p, &tx.s);
    });
}

fn decode_transaction(item: Item<'_>) -> Result<Transaction, MessageError> {
    let mut fields = item.list()?;
    let nonce = fields.next_item()?.u64()?;
    let gas_price = fields.next_item()?.uint()?;
    let gas_limit = fields.next_item()?.u64()?;
    let to_item = fields.next_item()?;
    let to = match to_item.bytes()? {
        [] => None,
        _ => Some(to_item.fixed::<20>()?),
    };
    Ok(Transaction {
        nonce,
        gas_price,
        gas_limit,
        to,
        value: fields.next_item()?.uint()?,
        data: fields.next_item()?.bytes()?.to_vec(),
        v: fields.next_item()?.u64()?,
        r: decode_u256(fields.next_item()?)?,
        s: decode_u256(fields.next_item()?)?,
    })
}

fn encode_body_record(out: &mut Vec<u8>, body: &BlockBody) {
    rlp::encode_list(out, |p| {
        rlp::encode_list(p, |txs| {
            for tx in &body.transactions {
                encode_transaction(txs, tx);
            }
        });
        rlp::encode_list(p, |ommers| {
            for ommer in &body.ommers {
                encode_header(ommers, ommer);
            }
        });
    });
}

fn decode_body_record(item: Item<'_>) -> Result<BlockBody, MessageError> {
    let mut fields = item.list()?;
    let mut transactions = Vec::new();
    for tx in fields.next_item()?.list()? {
        transactions.push(decode_transaction(tx?)?);
    }
    let mut ommers = Vec::new();
    for ommer in fields.next_item()?.list()? {
        ommers.push(decode_header(ommer?)?);
    }
    Ok(BlockBody { transactions, ommers })
}

fn decode_new_block(body: &[u8]) -> Result<Message, MessageError> {
    let mut fields = body_list(body)?;
    let mut block = fields.next_item()?.list()?;
    let header = decode_header(block.next_item()?)?;

    let mut transactions = Vec::new();
    for tx in block.next_item()?.list()? {
        transactions.push(decode_transaction(tx?)?);
    }
    let mut ommers = Vec::new();
    for ommer in block.next_item()?.list()? {
        ommers.push(decode_header(ommer?)?);
    }

    let total_difficulty = fields.next_item()?.uint()?;
    Ok(Message::NewBlock(Box::new(NewBlock {
        header,
        body: BlockBody { transactions, ommers },
        total_difficulty,
    })))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keypair_generate;

    fn roundtrip(message: Message) {
        let body = message.encode_body();
        let decoded = Message::decode(message.id(), &body).unwrap();
        assert_eq!(decoded, message);
    }

    fn sample_header(number: u64) -> BlockHeader {
        BlockHeader {
            parent_hash: [0x11; 32],
            ommers_hash: [0x22; 32],
            beneficiary: [0x33; 20],
            state_root: [0x44; 32],
            transactions_root: [0x55; 32],
            receipts_root: [0x66; 32],
            logs_bloom: [0x00; 256],
            difficulty: 17_179_869_184,
            number,
            gas_limit: 8_000_000,
            gas_used: 21_000,
            timestamp: 1_438_269_988,
            extra_data: b"rlpx-session".to_vec(),
            mix_hash: [0x77; 32],
            nonce: [0x88; 8],
        }
    }

    fn sample_transaction() -> Transaction {
        Transaction {
            nonce: 9,
            gas_price: 20_000_000_000,
            gas_limit: 21_000,
            to: Some([0xab; 20]),
            value: 1_000_000_000_000_000_000,
            data: vec![],
            v: 37,
            r: {
                let mut r = [0u8; 32];
                r[0] = 0x18;
                r
            },
            s: {
                let mut s = [0u8; 32];
                s[31] = 0x01;
                s
            },
        }
    }

    #[test]
    fn test_hello_roundtrip() {
        let (_, public) = keypair_generate();
        roundtrip(Message::Hello(Hello {
            protocol_version: P2P_PROTOCOL_VERSION,
            client_id: "rlpx-session/0.1.0".into(),
            capabilities: vec![Capability::eth(), Capability::new("snap", 1)],
            listen_port: 30303,
            node_id: PeerId::from_public_key(&public),
        }));
    }

    #[test]
    fn test_hello_ignores_extra_fields() {
        let (_, public) = keypair_generate();
        let hello = Hello {
            protocol_version: 5,
            client_id: "test".into(),
            capabilities: vec![Capability::eth()],
            listen_port: 0,
            node_id: PeerId::from_public_key(&public),
        };
        // Re-encode with a trailing element appended inside the list.
        let mut body = Vec::new();
        rlp::encode_list(&mut body, |p| {
            rlp::encode_uint(p, hello.protocol_version as u128);
            rlp::encode_str(p, &hello.client_id);
            rlp::encode_list(p, |caps| {
                rlp::encode_list(caps, |c| {
                    rlp::encode_str(c, "eth");
                    rlp::encode_uint(c, ETH_PROTOCOL_VERSION as u128);
                });
            });
            rlp::encode_uint(p, 0);
            rlp::encode_bytes(p, hello.node_id.as_bytes());
            rlp::encode_str(p, "from-the-future");
        });
        assert_eq!(Message::decode(0x00, &body).unwrap(), Message::Hello(hello));
    }

    #[test]
    fn test_base_packets_roundtrip() {
        roundtrip(Message::Disconnect(DisconnectReason::UselessPeer));
        roundtrip(Message::Ping);
        roundtrip(Message::Pong);
    }

    #[test]
    fn test_disconnect_tolerates_bare_reason() {
        // A bare RLP uint instead of the canonical one-element list.
        let body = vec![0x03];
        assert_eq!(
            Message::decode(0x01, &body).unwrap(),
            Message::Disconnect(DisconnectReason::UselessPeer)
        );
        // Empty body means an unceremonious disconnect.
        assert_eq!(
            Message::decode(0x01, &[]).unwrap(),
            Message::Disconnect(DisconnectReason::DisconnectRequested)
        );
    }

    #[test]
    fn test_disconnect_rejects_unknown_reason() {
        let message = Message::decode(0x01, &[0xc1, 0x0d]);
        assert_eq!(message, Err(MessageError::UnknownReason(0x0d)));
    }

    #[test]
    fn test_status_roundtrip() {
        roundtrip(Message::Status(Status {
            version: ETH_PROTOCOL_VERSION,
            network_id: 1,
            total_difficulty: 17_179_869_184,
            head_hash: [0xaa; 32],
            genesis_hash: [0xbb; 32],
        }));
    }

    #[test]
    fn test_eth_packets_roundtrip() {
        roundtrip(Message::NewBlockHashes(vec![
            NewBlockHash { hash: [1; 32], number: 100 },
            NewBlockHash { hash: [2; 32], number: 101 },
        ]));
        roundtrip(Message::Transactions(vec![sample_transaction()]));
        roundtrip(Message::GetBlockHeaders(GetBlockHeaders {
            block: BlockId::Number(4242),
            max_headers: 128,
            skip: 0,
            reverse: true,
        }));
        roundtrip(Message::GetBlockHeaders(GetBlockHeaders {
            block: BlockId::Hash([0xcc; 32]),
            max_headers: 1,
            skip: 3,
            reverse: false,
        }));
        roundtrip(Message::BlockHeaders(vec![sample_header(1), sample_header(2)]));
        roundtrip(Message::GetBlockBodies(vec![[0xdd; 32], [0xee; 32]]));
        roundtrip(Message::BlockBodies(vec![
            BlockBody::default(),
            BlockBody { transactions: vec![sample_transaction()], ommers: vec![sample_header(7)] },
        ]));
        roundtrip(Message::NewBlock(Box::new(NewBlock {
            header: sample_header(3),
            body: BlockBody { transactions: vec![sample_transaction()], ommers: vec![] },
            total_difficulty: 1 << 40,
        })));
    }

    #[test]
    fn test_contract_creation_transaction() {
        let mut tx = sample_transaction();
        tx.to = None;
        tx.data = vec![0x60, 0x60, 0x60, 0x40];
        roundtrip(Message::Transactions(vec![tx]));
    }

    #[test]
    fn test_unknown_id() {
        assert_eq!(Message::decode(0x42, &[0xc0]), Err(MessageError::UnknownId(0x42)));
    }

    #[test]
    fn test_handle_actions() {
        let (_, public) = keypair_generate();
        let hello = Message::Hello(Hello {
            protocol_version: 5,
            client_id: "x".into(),
            capabilities: vec![],
            listen_port: 0,
            node_id: PeerId::from_public_key(&public),
        });
        assert_eq!(hello.handle(), PacketAction::Activate);
        assert_eq!(
            Message::Disconnect(DisconnectReason::TooManyPeers).handle(),
            PacketAction::PeerDisconnected
        );
        assert_eq!(Message::Ping.handle(), PacketAction::Send(Box::new(Message::Pong)));
        assert_eq!(Message::Pong.handle(), PacketAction::Ok);
        assert_eq!(
            Message::Status(Status {
                version: 63,
                network_id: 1,
                total_difficulty: 0,
                head_hash: [0; 32],
                genesis_hash: [0; 32],
            })
            .handle(),
            PacketAction::Ok
        );
    }

    #[test]
    fn test_reason_codes_cover_canonical_range() {
        for code in (0x00..=0x0b).chain([0x10]) {
            let reason = DisconnectReason::from_code(code).unwrap();
            assert_eq!(reason.code(), code);
            assert!(!reason.message().is_empty());
        }
        assert!(DisconnectReason::from_code(0x0c).is_err());
        assert!(DisconnectReason::from_code(0xff).is_err());
    }

    #[test]
    fn test_display_includes_code() {
        assert_eq!(DisconnectReason::UselessPeer.to_string(), "useless peer (0x03)");
    }
}
