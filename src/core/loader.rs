//! Binary image loading: a raw little-endian word image, or the same
//! content prefixed with an `0xDDD1` magic header. See `SPEC_FULL.md`
//! §6 for the header layout.

use tracing::info;

use crate::core::error::HostError;
use crate::core::memory::{Memory, PhysicalMemory};

const MAGIC: u16 = 0xDDD1;
const HEADER_LEN: usize = 16;

/// Loads `bytes` into physical memory starting at address 0, sniffing
/// the header magic to decide raw-image vs. header-prefixed framing.
pub fn load_image(memory: &mut PhysicalMemory, bytes: &[u8]) -> Result<(), HostError> {
    if bytes.len() % 2 != 0 {
        return Err(HostError::Malformed("image length must be an even number of bytes".into()));
    }
    if bytes.len() >= 2 && u16::from_le_bytes([bytes[0], bytes[1]]) == MAGIC {
        load_headered(memory, bytes)
    } else {
        memory.load_bytes(bytes, 0).map_err(HostError::Malformed)?;
        info!(md5 = %memory.md5, "loaded raw image");
        Ok(())
    }
}

fn load_headered(memory: &mut PhysicalMemory, bytes: &[u8]) -> Result<(), HostError> {
    if bytes.len() < HEADER_LEN {
        return Err(HostError::BadImage("header-prefixed image shorter than the 16-byte header".into()));
    }
    let code_size = u16::from_le_bytes([bytes[2], bytes[3]]) as usize;
    let data_size = u16::from_le_bytes([bytes[4], bytes[5]]) as usize;
    let payload = &bytes[HEADER_LEN..];
    if payload.len() < code_size + data_size {
        return Err(HostError::BadImage(format!(
            "header declares {code_size} code bytes + {data_size} data bytes but only {} are present",
            payload.len()
        )));
    }
    memory.load_bytes(&payload[..code_size + data_size], 0).map_err(HostError::Malformed)?;
    info!(code_size, data_size, md5 = %memory.md5, "loaded header-prefixed image");
    Ok(())
}
