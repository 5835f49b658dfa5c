//! Protocol versioning for Herald.
//!
//! Clients announce the protocol revision they speak in the `protocol`
//! query parameter of the WebSocket URL.

use crate::close::CloseCode;

/// Protocol revision spoken by this server.
pub const PROTOCOL_VERSION: u8 = 7;

/// Oldest protocol revision still accepted.
pub const MIN_PROTOCOL_VERSION: u8 = 5;

/// Validate the `protocol` query parameter.
///
/// # Errors
///
/// Returns the close code to terminate the handshake with:
/// [`CloseCode::NoProtocolVersion`] when the parameter is absent and
/// [`CloseCode::UnsupportedProtocol`] when it is out of range or unparsable.
pub fn negotiate(requested: Option<&str>) -> Result<u8, CloseCode> {
    let raw = requested.ok_or(CloseCode::NoProtocolVersion)?;
    let version: u8 = raw
        .trim()
        .parse()
        .map_err(|_| CloseCode::UnsupportedProtocol)?;

    if (MIN_PROTOCOL_VERSION..=PROTOCOL_VERSION).contains(&version) {
        Ok(version)
    } else {
        Err(CloseCode::UnsupportedProtocol)
    }
}
