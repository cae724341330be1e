//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Packet errors
    /// The transport write size cannot hold a packet header plus payload.
    #[error("max write size {size} is too small: packet header alone needs {header} bytes")]
    WriteSizeTooSmall {
        /// Write size reported by the transport.
        size: usize,
        /// Size of the packet header.
        header: usize,
    },

    /// Message needs more packets than a packet number can express.
    #[error("message of {size} bytes needs too many packets")]
    MessageTooLarge {
        /// Size of the serialized message.
        size: usize,
    },

    /// Packet arrived out of sequence for its message.
    #[error("unexpected packet number for message {message_id}: expected {expected}, got {got}")]
    UnexpectedPacketNumber {
        /// Message the packet belongs to.
        message_id: i32,
        /// Packet number that was expected next.
        expected: i32,
        /// Packet number that arrived.
        got: i32,
    },

    // Compression errors
    /// Deflate compression or inflation failed.
    #[error("compression failed: {0}")]
    Compression(String),

    // Cryptographic errors
    /// Encryption operation failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Decryption operation failed.
    #[error("decryption failed: {0}")]
    Decryption(String),

    // Handshake errors
    /// Noise protocol handshake failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Attempted to use transport before handshake completion.
    #[error("handshake incomplete: cannot perform operation before handshake is finished")]
    HandshakeIncomplete,
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

// Conversions from underlying crate errors

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        ProtocolError::Deserialization(err.to_string())
    }
}

impl From<snow::Error> for ProtocolError {
    fn from(err: snow::Error) -> Self {
        let msg = err.to_string();
        // Map snow errors to more specific protocol errors
        if msg.contains("decrypt") {
            ProtocolError::Decryption(msg)
        } else if msg.contains("encrypt") {
            ProtocolError::Encryption(msg)
        } else {
            ProtocolError::HandshakeFailed(msg)
        }
    }
}

impl From<chacha20poly1305::Error> for ProtocolError {
    fn from(_: chacha20poly1305::Error) -> Self {
        ProtocolError::Decryption("authentication tag mismatch".to_string())
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        ProtocolError::Compression(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_size_too_small_display() {
        let err = ProtocolError::WriteSizeTooSmall { size: 10, header: 12 };
        assert_eq!(
            err.to_string(),
            "max write size 10 is too small: packet header alone needs 12 bytes"
        );
    }

    #[test]
    fn test_unexpected_packet_number_display() {
        let err = ProtocolError::UnexpectedPacketNumber {
            message_id: 7,
            expected: 3,
            got: 5,
        };
        assert_eq!(
            err.to_string(),
            "unexpected packet number for message 7: expected 3, got 5"
        );
    }

    #[test]
    fn test_handshake_incomplete_error_display() {
        let err = ProtocolError::HandshakeIncomplete;
        assert_eq!(
            err.to_string(),
            "handshake incomplete: cannot perform operation before handshake is finished"
        );
    }

    #[test]
    fn test_from_rmp_serde_decode_error() {
        #[derive(Debug, serde::Deserialize)]
        #[allow(dead_code)]
        struct TestStruct {
            field: String,
        }
        let msgpack_err = rmp_serde::from_slice::<TestStruct>(&[0x00]).unwrap_err();
        let protocol_err: ProtocolError = msgpack_err.into();
        assert!(matches!(protocol_err, ProtocolError::Deserialization(_)));
    }

    #[test]
    fn test_from_io_error_maps_to_compression() {
        let io_err = std::io::Error::new(std::io::ErrorKind::InvalidData, "corrupt deflate stream");
        let protocol_err: ProtocolError = io_err.into();
        assert!(matches!(protocol_err, ProtocolError::Compression(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProtocolError>();
    }
}
