//! Public point listing for provisioning records
//!
//! Prints `04 || x || y` in hex for every index in a range, one per line,
//! regenerating keys outside the live window.

use keyring_core::{KeyIndex, KeyWindowManager, KeyringError};
use keyring_hardware_hal::HsmCapability;
use std::io::Write;
use std::ops::Range;
use thiserror::Error;

/// Listing errors
#[derive(Error, Debug)]
pub enum DumpError {
    /// Key lookup failed
    #[error("key lookup failed: {0}")]
    Keyring(#[from] KeyringError),

    /// Output could not be written
    #[error("write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Write the SEC1 point of every index in `indices` to `out`
pub fn dump_points<H, W>(
    manager: &mut KeyWindowManager<H>,
    indices: Range<KeyIndex>,
    out: &mut W,
) -> Result<usize, DumpError>
where
    H: HsmCapability,
    W: Write,
{
    let mut written = 0;
    for index in indices {
        let key = manager.get_public_key(index)?;
        writeln!(out, "{}", hex::encode(key.sec1_point()))?;
        written += 1;
    }
    out.flush()?;
    Ok(written)
}
