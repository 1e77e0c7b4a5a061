//! Request/response codec and dispatch onto the key window
//!
//! ```text
//! request:  id(4) | op(1) | payload
//! response: id(4) | status(1) | data        status 1 = ok, 0 = error (UTF-8 message)
//! ```
//!
//! All multi-byte integers are big-endian.

use keyring_core::{KeyIndex, KeyringError, KeyringResult, SharedKeyring};
use keyring_hardware_hal::{HsmCapability, UNCOMPRESSED_POINT_LEN};
use thiserror::Error;

/// Initialize the window: index(2)
pub const OP_INITIALIZE: u8 = 1;
/// Encoded public key: index(2)
pub const OP_GET_PUBLIC_KEY: u8 = 2;
/// ECDSA signature: index(2) | digest(32) | [advance(1)]
pub const OP_SIGN_ECDSA: u8 = 3;
/// Node seed: no payload
pub const OP_RETRIEVE_NODE_SEED: u8 = 4;
/// Current signing index: no payload
pub const OP_GET_KEY_INDEX: u8 = 5;
/// Reset the window: index(2)
pub const OP_SET_KEY_INDEX: u8 = 6;
/// ECDH shared point: index(2) | peer point(65)
pub const OP_GET_ECDH_POINT: u8 = 7;

/// Response status byte for success
pub const STATUS_OK: u8 = 1;
/// Response status byte for failure
pub const STATUS_ERROR: u8 = 0;

const REQUEST_ID_LEN: usize = 4;
const HEADER_LEN: usize = REQUEST_ID_LEN + 1;
const INDEX_LEN: usize = 2;
const DIGEST_LEN: usize = 32;

/// Envelope-level violations; the stream cannot be answered
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Message shorter than the request id
    #[error("missing request id")]
    MissingRequestId,

    /// Message ends after the request id
    #[error("missing fun id")]
    MissingOperation,

    /// Frame length header over the accepted maximum
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    /// Frame ended before its announced length
    #[error("missing message")]
    Truncated,

    /// Transport failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Opaque request id echoed in the response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestId(pub [u8; REQUEST_ID_LEN]);

/// Decoded request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// See [`OP_INITIALIZE`]
    Initialize {
        /// Window start
        index: KeyIndex,
    },
    /// See [`OP_GET_PUBLIC_KEY`]
    GetPublicKey {
        /// Key index
        index: KeyIndex,
    },
    /// See [`OP_SIGN_ECDSA`]
    SignEcdsa {
        /// Key index
        index: KeyIndex,
        /// Digest to sign
        digest: [u8; DIGEST_LEN],
        /// Advance the window after signing
        advance: bool,
    },
    /// See [`OP_RETRIEVE_NODE_SEED`]
    RetrieveNodeSeed,
    /// See [`OP_GET_KEY_INDEX`]
    GetKeyIndex,
    /// See [`OP_SET_KEY_INDEX`]
    SetKeyIndex {
        /// New window start
        index: KeyIndex,
    },
    /// See [`OP_GET_ECDH_POINT`]
    GetEcdhPoint {
        /// Key index
        index: KeyIndex,
        /// Uncompressed peer point
        peer: [u8; UNCOMPRESSED_POINT_LEN],
    },
}

fn invalid(message: &str) -> KeyringError {
    KeyringError::InvalidInput(message.to_string())
}

fn read_index(payload: &[u8]) -> KeyringResult<KeyIndex> {
    payload
        .get(..INDEX_LEN)
        .map(|bytes| KeyIndex::from_be_bytes([bytes[0], bytes[1]]))
        .ok_or_else(|| invalid("missing index"))
}

impl Request {
    /// Decode the payload of operation `op`
    pub fn parse(op: u8, payload: &[u8]) -> KeyringResult<Self> {
        match op {
            OP_INITIALIZE => Ok(Request::Initialize {
                index: read_index(payload)?,
            }),
            OP_GET_PUBLIC_KEY => Ok(Request::GetPublicKey {
                index: read_index(payload)?,
            }),
            OP_SIGN_ECDSA => {
                let index = read_index(payload)?;
                let digest = payload
                    .get(INDEX_LEN..INDEX_LEN + DIGEST_LEN)
                    .ok_or_else(|| invalid("missing digest"))?;
                let advance = payload
                    .get(INDEX_LEN + DIGEST_LEN)
                    .map_or(false, |flag| *flag != 0);

                let mut buf = [0u8; DIGEST_LEN];
                buf.copy_from_slice(digest);
                Ok(Request::SignEcdsa {
                    index,
                    digest: buf,
                    advance,
                })
            }
            OP_RETRIEVE_NODE_SEED => Ok(Request::RetrieveNodeSeed),
            OP_GET_KEY_INDEX => Ok(Request::GetKeyIndex),
            OP_SET_KEY_INDEX => Ok(Request::SetKeyIndex {
                index: read_index(payload)?,
            }),
            OP_GET_ECDH_POINT => {
                let index = read_index(payload)?;
                let point = payload
                    .get(INDEX_LEN..INDEX_LEN + UNCOMPRESSED_POINT_LEN)
                    .ok_or_else(|| invalid("missing peer point"))?;

                let mut peer = [0u8; UNCOMPRESSED_POINT_LEN];
                peer.copy_from_slice(point);
                Ok(Request::GetEcdhPoint { index, peer })
            }
            _ => Err(invalid("unknown operation")),
        }
    }
}

/// Build a success response
pub fn encode_success(id: RequestId, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + data.len());
    out.extend_from_slice(&id.0);
    out.push(STATUS_OK);
    out.extend_from_slice(data);
    out
}

/// Build a failure response carrying `message`
pub fn encode_failure(id: RequestId, message: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + message.len());
    out.extend_from_slice(&id.0);
    out.push(STATUS_ERROR);
    out.extend_from_slice(message.as_bytes());
    out
}

/// Message carried by a failure response. Input errors go out as their bare
/// reason (`missing index`), everything else as the full error text.
pub fn failure_message(error: &KeyringError) -> String {
    match error {
        KeyringError::InvalidInput(reason) => reason.clone(),
        other => other.to_string(),
    }
}

/// Response plus whether the port must stop serving after sending it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    /// Response message (without length prefix)
    pub response: Vec<u8>,
    /// Fatal keyring error: the window can no longer be trusted
    pub fatal: bool,
}

/// Maps requests onto a shared key window
pub struct Dispatcher<H: HsmCapability> {
    keyring: SharedKeyring<H>,
}

impl<H: HsmCapability> Dispatcher<H> {
    /// Dispatch onto `keyring`
    pub fn new(keyring: SharedKeyring<H>) -> Self {
        Dispatcher { keyring }
    }

    /// The keyring requests are served from
    pub fn keyring(&self) -> &SharedKeyring<H> {
        &self.keyring
    }

    /// Handle one request message
    pub fn handle(&self, message: &[u8]) -> Result<Dispatched, ProtocolError> {
        if message.len() < REQUEST_ID_LEN {
            return Err(ProtocolError::MissingRequestId);
        }
        if message.len() < HEADER_LEN {
            return Err(ProtocolError::MissingOperation);
        }

        let mut id = [0u8; REQUEST_ID_LEN];
        id.copy_from_slice(&message[..REQUEST_ID_LEN]);
        let id = RequestId(id);
        let op = message[REQUEST_ID_LEN];

        let outcome = Request::parse(op, &message[HEADER_LEN..]).and_then(|request| {
            log::debug!("request {:02x?}: {:?}", id.0, request);
            self.execute(request)
        });

        Ok(match outcome {
            Ok(data) => Dispatched {
                response: encode_success(id, &data),
                fatal: false,
            },
            Err(e) => {
                let fatal = e.is_fatal();
                if fatal {
                    log::error!("request {:02x?} (op {}) failed fatally: {}", id.0, op, e);
                } else {
                    log::warn!("request {:02x?} (op {}) rejected: {}", id.0, op, e);
                }
                Dispatched {
                    response: encode_failure(id, &failure_message(&e)),
                    fatal,
                }
            }
        })
    }

    fn execute(&self, request: Request) -> KeyringResult<Vec<u8>> {
        match request {
            Request::Initialize { index } => {
                self.keyring.initialize(index)?;
                Ok(Vec::new())
            }
            Request::GetPublicKey { index } => Ok(self.keyring.get_public_key(index)?.into_bytes()),
            Request::SignEcdsa {
                index,
                digest,
                advance,
            } => Ok(self.keyring.sign_ecdsa(index, &digest, advance)?.into_bytes()),
            Request::RetrieveNodeSeed => Ok(self.keyring.retrieve_node_seed()?.as_bytes().to_vec()),
            Request::GetKeyIndex => Ok(self.keyring.key_index()?.to_be_bytes().to_vec()),
            Request::SetKeyIndex { index } => {
                self.keyring.set_key_index(index)?;
                Ok(Vec::new())
            }
            Request::GetEcdhPoint { index, peer } => {
                Ok(self.keyring.get_ecdh_point(index, &peer)?.to_vec())
            }
        }
    }
}
