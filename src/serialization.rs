//! # Serialization Gate
//!
//! Network transports carry opaque bytes; this module is the boundary where
//! typed messages become bytes and back. Every payload type that crosses the
//! fabric implements [`FabricMessage`], which couples the type to its
//! `data_type` string (checked against [`ConnectionId::data_type`] by the IO
//! manager) and to an optional byte codec.
//!
//! Types are declared with the [`fabric_message!`] macro:
//!
//! ```
//! use serde::{Deserialize, Serialize};
//! use ipc_fabric::fabric_message;
//!
//! #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
//! struct Sample { seq: u64 }
//! fabric_message!(Sample, "Sample");
//!
//! // Queue-only types never touch the wire and may skip serde entirely:
//! struct Handle(std::sync::Arc<Vec<u8>>);
//! fabric_message!(@opaque Handle, "Handle");
//! ```
//!
//! The serializable arm encodes with `bincode`; the `@opaque` arm implements
//! the trait with codec hooks that fail with [`CodecError::NotSerializable`],
//! so a queue-only type can still travel through the typed façade but is
//! rejected the moment a network transport is asked to carry it.
//!
//! [`ConnectionId::data_type`]: crate::config::ConnectionId

use thiserror::Error;

/// Errors from the byte codec boundary.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The type is configured for network transfer but is not serializable.
    #[error("object of type {0} is not serializable but configured for network transfer")]
    NotSerializable(&'static str),

    /// Encoding a value failed.
    #[error("failed to serialize {data_type}: {source}")]
    Encode {
        data_type: &'static str,
        #[source]
        source: bincode::Error,
    },

    /// Decoding received bytes failed.
    #[error("failed to deserialize {data_type}: {source}")]
    Decode {
        data_type: &'static str,
        #[source]
        source: bincode::Error,
    },
}

/// A typed payload known to the fabric.
///
/// `data_type()` is the string label attached to connections carrying this
/// type; it is also the pub-sub topic. The codec hooks default to
/// not-serializable; the [`fabric_message!`] macro overrides them for serde
/// types.
pub trait FabricMessage: Send + 'static {
    /// The data-type label for this payload shape.
    fn data_type() -> &'static str;

    /// Whether this type can cross a network transport.
    fn is_serializable() -> bool {
        false
    }

    /// Encode the value for network transfer.
    fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        Err(CodecError::NotSerializable(Self::data_type()))
    }

    /// Decode a value received from a network transport.
    fn from_bytes(_bytes: &[u8]) -> Result<Self, CodecError>
    where
        Self: Sized,
    {
        Err(CodecError::NotSerializable(Self::data_type()))
    }
}

/// Encode a serde value with the fabric's wire codec.
pub fn serialize<T: serde::Serialize>(
    value: &T,
    data_type: &'static str,
) -> Result<Vec<u8>, CodecError> {
    bincode::serialize(value).map_err(|source| CodecError::Encode { data_type, source })
}

/// Decode a serde value with the fabric's wire codec.
pub fn deserialize<T: serde::de::DeserializeOwned>(
    bytes: &[u8],
    data_type: &'static str,
) -> Result<T, CodecError> {
    bincode::deserialize(bytes).map_err(|source| CodecError::Decode { data_type, source })
}

/// Declare a type as a fabric payload.
///
/// `fabric_message!(Type, "Name")` requires `Type: Serialize +
/// DeserializeOwned` and wires the codec through `bincode`.
/// `fabric_message!(@opaque Type, "Name")` declares a queue-only type whose
/// codec hooks fail at run time.
#[macro_export]
macro_rules! fabric_message {
    ($type:ty, $data_type:expr) => {
        impl $crate::serialization::FabricMessage for $type {
            fn data_type() -> &'static str {
                $data_type
            }

            fn is_serializable() -> bool {
                true
            }

            fn to_bytes(&self) -> Result<Vec<u8>, $crate::serialization::CodecError> {
                $crate::serialization::serialize(self, $data_type)
            }

            fn from_bytes(
                bytes: &[u8],
            ) -> Result<Self, $crate::serialization::CodecError> {
                $crate::serialization::deserialize(bytes, $data_type)
            }
        }
    };
    (@opaque $type:ty, $data_type:expr) => {
        impl $crate::serialization::FabricMessage for $type {
            fn data_type() -> &'static str {
                $data_type
            }
        }
    };
}

// Primitive payloads used pervasively in intra-process wiring.
fabric_message!(i32, "int");
fabric_message!(u64, "uint64");
fabric_message!(String, "string");

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        count: i32,
        factor: f64,
        tag: String,
    }
    fabric_message!(Sample, "Sample");

    struct Opaque {
        #[allow(dead_code)]
        fd: i64,
    }
    fabric_message!(@opaque Opaque, "Opaque");

    #[test]
    fn round_trip_preserves_payload() {
        let msg = Sample {
            count: 56,
            factor: 26.5,
            tag: "test1".to_string(),
        };
        let bytes = msg.to_bytes().unwrap();
        let back = Sample::from_bytes(&bytes).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn opaque_types_are_rejected() {
        assert!(!Opaque::is_serializable());
        let value = Opaque { fd: 3 };
        assert!(matches!(
            value.to_bytes(),
            Err(CodecError::NotSerializable("Opaque"))
        ));
        assert!(matches!(
            Opaque::from_bytes(&[1, 2, 3]),
            Err(CodecError::NotSerializable("Opaque"))
        ));
    }

    #[test]
    fn decode_of_garbage_is_an_error() {
        assert!(matches!(
            Sample::from_bytes(&[0xff]),
            Err(CodecError::Decode { .. })
        ));
    }
}
