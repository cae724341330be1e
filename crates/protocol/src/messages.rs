//! Wire message definitions for Companion Link.
//!
//! This module defines every schema exchanged between host and device above
//! the packet layer. All messages are serialized using MessagePack in its
//! compact (struct-as-array) form.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// Recipient id of the built-in system feature that answers system queries.
pub const SYSTEM_FEATURE_ID: Uuid = Uuid::from_u128(0x892a_c5d9_e9a5_48dc_874a_c01e_3cb0_0d5d);

/// Serialize any wire schema to MessagePack.
pub fn to_msgpack<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec(value)?)
}

/// Deserialize any wire schema from MessagePack.
pub fn from_msgpack<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(rmp_serde::from_slice(bytes)?)
}

/// The operation a [`DeviceMessage`] carries.
///
/// Encoded as an integer; codes this build does not know decode as
/// [`OperationType::Unknown`] instead of failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum OperationType {
    /// Unrecognized operation.
    Unknown,
    /// Encryption handshake traffic.
    Handshake,
    /// Feature-to-feature application message.
    ClientMessage,
    /// Request expecting a [`QueryResponse`].
    Query,
    /// Response to a previously sent [`Query`].
    QueryResponse,
}

impl From<i32> for OperationType {
    fn from(code: i32) -> Self {
        match code {
            2 => OperationType::Handshake,
            3 => OperationType::ClientMessage,
            4 => OperationType::Query,
            5 => OperationType::QueryResponse,
            _ => OperationType::Unknown,
        }
    }
}

impl From<OperationType> for i32 {
    fn from(operation: OperationType) -> Self {
        match operation {
            OperationType::Unknown => 0,
            OperationType::Handshake => 2,
            OperationType::ClientMessage => 3,
            OperationType::Query => 4,
            OperationType::QueryResponse => 5,
        }
    }
}

/// Envelope for everything sent over an established packet stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMessage {
    /// What the payload is.
    pub operation: OperationType,
    /// Whether the payload is (or, outbound, should be) encrypted.
    pub is_payload_encrypted: bool,
    /// The message body.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
    /// Size before compression; 0 when the payload is not compressed.
    pub original_size: i32,
    /// Feature the message is addressed to.
    pub recipient: Option<Uuid>,
}

impl DeviceMessage {
    /// Create an unencrypted handshake message.
    pub fn handshake(payload: Vec<u8>) -> Self {
        Self {
            operation: OperationType::Handshake,
            is_payload_encrypted: false,
            payload,
            original_size: 0,
            recipient: None,
        }
    }

    /// Create an encrypted message of the given operation for a recipient.
    pub fn encrypted(operation: OperationType, recipient: Option<Uuid>, payload: Vec<u8>) -> Self {
        Self {
            operation,
            is_payload_encrypted: true,
            payload,
            original_size: 0,
            recipient,
        }
    }

    /// Serialize to MessagePack.
    pub fn to_msgpack(&self) -> Result<Vec<u8>> {
        to_msgpack(self)
    }

    /// Deserialize from MessagePack.
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self> {
        from_msgpack(bytes)
    }
}

/// Supported version ranges announced during negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionExchange {
    /// Lowest supported messaging version.
    pub min_messaging_version: i32,
    /// Highest supported messaging version.
    pub max_messaging_version: i32,
    /// Lowest supported security version.
    pub min_security_version: i32,
    /// Highest supported security version.
    pub max_security_version: i32,
}

impl VersionExchange {
    /// Serialize to MessagePack.
    pub fn to_msgpack(&self) -> Result<Vec<u8>> {
        to_msgpack(self)
    }

    /// Deserialize from MessagePack.
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self> {
        from_msgpack(bytes)
    }
}

/// A request sent to a remote feature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    /// Id, monotonic per sender.
    pub id: i32,
    /// Recipient id of the local feature that sent the query.
    pub sender: Uuid,
    /// Feature-defined request body.
    #[serde(with = "serde_bytes")]
    pub request: Vec<u8>,
    /// Optional feature-defined parameters.
    #[serde(with = "serde_bytes")]
    pub parameters: Option<Vec<u8>>,
}

/// The answer to a [`Query`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResponse {
    /// Id of the query being answered.
    pub query_id: i32,
    /// Whether the query succeeded.
    pub success: bool,
    /// Feature-defined response body.
    #[serde(with = "serde_bytes")]
    pub response: Option<Vec<u8>>,
}

/// Verification step carried by a handshake message on security version 4+.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum VerificationState {
    /// State code not understood.
    Unknown,
    /// Payload is the sender's verification code encrypted with the OOB key.
    OobVerification,
    /// Sender asks for the code to be confirmed visually.
    VisualVerification,
    /// User confirmed the visual code.
    VisualConfirmation,
}

impl From<i32> for VerificationState {
    fn from(code: i32) -> Self {
        match code {
            1 => VerificationState::OobVerification,
            2 => VerificationState::VisualVerification,
            3 => VerificationState::VisualConfirmation,
            _ => VerificationState::Unknown,
        }
    }
}

impl From<VerificationState> for i32 {
    fn from(state: VerificationState) -> Self {
        match state {
            VerificationState::Unknown => 0,
            VerificationState::OobVerification => 1,
            VerificationState::VisualVerification => 2,
            VerificationState::VisualConfirmation => 3,
        }
    }
}

/// A verification step exchanged after the key agreement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationCode {
    /// Which verification step this is.
    pub state: VerificationState,
    /// Step-specific payload.
    #[serde(with = "serde_bytes")]
    pub payload: Option<Vec<u8>>,
}

/// Kinds of system query answered by the device's system feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum SystemQueryType {
    /// Query type not understood.
    Unknown,
    /// Human-readable device name.
    DeviceName,
    /// Name of the companion application on the device.
    AppName,
    /// Whether the feature whose id is the first payload is supported.
    IsFeatureSupported,
}

impl From<i32> for SystemQueryType {
    fn from(code: i32) -> Self {
        match code {
            1 => SystemQueryType::DeviceName,
            2 => SystemQueryType::AppName,
            3 => SystemQueryType::IsFeatureSupported,
            _ => SystemQueryType::Unknown,
        }
    }
}

impl From<SystemQueryType> for i32 {
    fn from(query_type: SystemQueryType) -> Self {
        match query_type {
            SystemQueryType::Unknown => 0,
            SystemQueryType::DeviceName => 1,
            SystemQueryType::AppName => 2,
            SystemQueryType::IsFeatureSupported => 3,
        }
    }
}

/// Request body of a [`Query`] addressed to [`SYSTEM_FEATURE_ID`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemQuery {
    /// The query kind.
    pub query_type: SystemQueryType,
    /// Type-specific arguments.
    pub payloads: Vec<serde_bytes::ByteBuf>,
}

impl SystemQuery {
    /// Create a query without arguments.
    pub fn new(query_type: SystemQueryType) -> Self {
        Self {
            query_type,
            payloads: Vec::new(),
        }
    }

    /// Create an `IsFeatureSupported` query for one feature.
    pub fn is_feature_supported(feature_id: Uuid) -> Self {
        Self {
            query_type: SystemQueryType::IsFeatureSupported,
            payloads: vec![serde_bytes::ByteBuf::from(feature_id.as_bytes().to_vec())],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_message_roundtrip() {
        let message = DeviceMessage {
            operation: OperationType::ClientMessage,
            is_payload_encrypted: true,
            payload: b"hello".to_vec(),
            original_size: 42,
            recipient: Some(Uuid::new_v4()),
        };

        let bytes = message.to_msgpack().unwrap();
        assert_eq!(DeviceMessage::from_msgpack(&bytes).unwrap(), message);
    }

    #[test]
    fn test_unknown_operation_code_decodes_as_unknown() {
        // Same layout as DeviceMessage with an operation code of 99.
        let raw = (99i32, false, serde_bytes::ByteBuf::from(vec![1u8]), 0i32, None::<Uuid>);
        let bytes = rmp_serde::to_vec(&raw).unwrap();

        let message = DeviceMessage::from_msgpack(&bytes).unwrap();
        assert_eq!(message.operation, OperationType::Unknown);
    }

    #[test]
    fn test_operation_codes_are_stable() {
        for operation in [
            OperationType::Handshake,
            OperationType::ClientMessage,
            OperationType::Query,
            OperationType::QueryResponse,
        ] {
            assert_eq!(OperationType::from(i32::from(operation)), operation);
        }
    }

    #[test]
    fn test_version_exchange_roundtrip() {
        let exchange = VersionExchange {
            min_messaging_version: 2,
            max_messaging_version: 3,
            min_security_version: 2,
            max_security_version: 4,
        };
        let bytes = exchange.to_msgpack().unwrap();
        assert_eq!(VersionExchange::from_msgpack(&bytes).unwrap(), exchange);
    }

    #[test]
    fn test_garbage_is_not_a_version_exchange() {
        assert!(VersionExchange::from_msgpack(b"not msgpack").is_err());
    }

    #[test]
    fn test_query_without_parameters() {
        let query = Query {
            id: i32::MAX,
            sender: Uuid::new_v4(),
            request: vec![1, 2, 3],
            parameters: None,
        };
        let bytes = to_msgpack(&query).unwrap();
        assert_eq!(from_msgpack::<Query>(&bytes).unwrap(), query);
    }

    #[test]
    fn test_verification_code_states() {
        let code = VerificationCode {
            state: VerificationState::OobVerification,
            payload: Some(vec![9; 48]),
        };
        let bytes = to_msgpack(&code).unwrap();
        let decoded: VerificationCode = from_msgpack(&bytes).unwrap();
        assert_eq!(decoded, code);

        assert_eq!(VerificationState::from(17), VerificationState::Unknown);
    }

    #[test]
    fn test_system_query_feature_payload() {
        let feature = Uuid::new_v4();
        let query = SystemQuery::is_feature_supported(feature);
        assert_eq!(query.payloads[0].as_slice(), feature.as_bytes());

        let bytes = to_msgpack(&query).unwrap();
        assert_eq!(from_msgpack::<SystemQuery>(&bytes).unwrap(), query);
    }
}
