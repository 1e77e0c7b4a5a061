//! Keyring port
//!
//! Serves a [`keyring_core::SharedKeyring`] over length-prefixed frames on a
//! byte stream. The `keyring-port` binary binds it to stdin/stdout; `keygen`
//! lists the public points of a range of indices.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod dump;
pub mod port;
pub mod protocol;

pub use config::{BackendKind, ConfigError, KeyringConfig};
pub use dump::{dump_points, DumpError};
pub use port::{read_frame, serve, window_report, write_frame, ServeOutcome, MAX_FRAME_LEN};
pub use protocol::{Dispatched, Dispatcher, ProtocolError, Request, RequestId};

pub use keyring_core;
pub use keyring_hardware_hal;
