//! Length-prefixed framing and the serve loop
//!
//! Each frame is a 4-byte big-endian length followed by that many bytes.

use crate::protocol::{Dispatcher, ProtocolError};
use keyring_core::WindowState;
use keyring_hardware_hal::HsmCapability;
use std::io::{ErrorKind, Read, Write};

/// Largest accepted request frame
pub const MAX_FRAME_LEN: usize = 4096;

const LENGTH_PREFIX: usize = 4;

/// Why [`serve`] stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServeOutcome {
    /// Peer closed the stream between frames
    EndOfInput,
    /// A fatal keyring error was reported to the peer
    Fatal,
}

/// Read one frame; `None` on a clean end of stream
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>, ProtocolError> {
    let mut prefix = [0u8; LENGTH_PREFIX];
    let mut filled = 0;
    while filled < LENGTH_PREFIX {
        match reader.read(&mut prefix[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(ProtocolError::Truncated),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }

    let mut message = vec![0u8; len];
    reader.read_exact(&mut message).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => ProtocolError::Truncated,
        _ => ProtocolError::Io(e),
    })?;
    Ok(Some(message))
}

/// Write one frame and flush
pub fn write_frame<W: Write>(writer: &mut W, message: &[u8]) -> Result<(), ProtocolError> {
    let len = u32::try_from(message.len())
        .map_err(|_| ProtocolError::FrameTooLarge(message.len()))?;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(message)?;
    writer.flush()?;
    Ok(())
}

/// One-line JSON rendering of the window state for logs
pub fn window_report(state: &WindowState) -> String {
    serde_json::to_string(state).unwrap_or_else(|_| format!("{:?}", state))
}

/// Answer requests from `reader` on `writer` until end of input or a fatal error
pub fn serve<H, R, W>(
    dispatcher: &Dispatcher<H>,
    reader: &mut R,
    writer: &mut W,
) -> Result<ServeOutcome, ProtocolError>
where
    H: HsmCapability,
    R: Read,
    W: Write,
{
    let mut served: u64 = 0;
    while let Some(message) = read_frame(reader)? {
        let dispatched = dispatcher.handle(&message)?;
        write_frame(writer, &dispatched.response)?;
        served += 1;

        if dispatched.fatal {
            log::error!(
                "stopping after fatal error ({} requests served, window {})",
                served,
                window_report(&dispatcher.keyring().state())
            );
            return Ok(ServeOutcome::Fatal);
        }
    }

    log::info!(
        "input closed after {} requests, window {}",
        served,
        window_report(&dispatcher.keyring().state())
    );
    Ok(ServeOutcome::EndOfInput)
}
