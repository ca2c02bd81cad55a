//! Serialization registry
//!
//! Maps a message's logical type name to an encode/decode pair. Consulted
//! only at process boundaries - in-process delivery never serializes. Each
//! runtime owns its registry; there is no process-global state.

use crate::constants::MESSAGE_SIZE_BYTES_MAX;
use crate::error::{Error, Result};
use crate::message::{Message, MessageBody};
use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// A message encoded for the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedMessage {
    /// Logical type name, used by the receiver to pick a codec
    pub type_name: String,
    /// Encoded payload
    pub payload: Bytes,
}

type EncodeFn = Box<dyn Fn(&Message) -> Result<Bytes> + Send + Sync>;
type DecodeFn = Box<dyn Fn(&[u8]) -> Result<Message> + Send + Sync>;

struct CodecEntry {
    encode: EncodeFn,
    decode: DecodeFn,
}

/// Per-runtime codec registry
///
/// Register every message type that crosses a process boundary before its
/// first cross-process use; an unregistered type fails the send or publish
/// with `UnserializableType`.
#[derive(Clone, Default)]
pub struct SerializationRegistry {
    entries: Arc<RwLock<HashMap<String, CodecEntry>>>,
}

impl SerializationRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a JSON codec for a message type
    ///
    /// Idempotent: registering the same type again replaces the entry with
    /// an equivalent one.
    pub fn register<T>(&self)
    where
        T: MessageBody + Serialize + DeserializeOwned,
    {
        let type_name = T::type_name().to_string();
        let encode: EncodeFn = Box::new(|message: &Message| {
            let body = message
                .downcast_ref::<T>()
                .ok_or_else(|| Error::EncodeFailed {
                    type_name: T::type_name().to_string(),
                    reason: format!("body is not a {}", T::type_name()),
                })?;
            let bytes = serde_json::to_vec(body).map_err(|e| Error::EncodeFailed {
                type_name: T::type_name().to_string(),
                reason: e.to_string(),
            })?;
            Ok(Bytes::from(bytes))
        });
        let decode: DecodeFn = Box::new(|payload: &[u8]| {
            let body: T = serde_json::from_slice(payload).map_err(|e| Error::DecodeFailed {
                type_name: T::type_name().to_string(),
                reason: e.to_string(),
            })?;
            Ok(Message::new(body))
        });

        let mut entries = self.entries.write().expect("registry lock poisoned");
        entries.insert(type_name, CodecEntry { encode, decode });
    }

    /// Whether a codec is registered for a type name
    pub fn is_registered(&self, type_name: &str) -> bool {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .contains_key(type_name)
    }

    /// Encode a message for the wire
    pub fn encode(&self, message: &Message) -> Result<SerializedMessage> {
        let entries = self.entries.read().expect("registry lock poisoned");
        let entry = entries
            .get(message.type_name())
            .ok_or_else(|| Error::unserializable(message.type_name()))?;
        let payload = (entry.encode)(message)?;
        if payload.len() > MESSAGE_SIZE_BYTES_MAX {
            return Err(Error::EncodeFailed {
                type_name: message.type_name().to_string(),
                reason: format!(
                    "payload size {} exceeds limit {}",
                    payload.len(),
                    MESSAGE_SIZE_BYTES_MAX
                ),
            });
        }
        Ok(SerializedMessage {
            type_name: message.type_name().to_string(),
            payload,
        })
    }

    /// Decode a wire message back into a `Message`
    pub fn decode(&self, serialized: &SerializedMessage) -> Result<Message> {
        let entries = self.entries.read().expect("registry lock poisoned");
        let entry = entries
            .get(&serialized.type_name)
            .ok_or_else(|| Error::unserializable(&serialized.type_name))?;
        (entry.decode)(&serialized.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Greeting {
        text: String,
        tags: Vec<String>,
    }

    impl MessageBody for Greeting {
        fn type_name() -> &'static str {
            "Greeting"
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Nested {
        inner: Option<Greeting>,
        count: u64,
    }

    impl MessageBody for Nested {
        fn type_name() -> &'static str {
            "Nested"
        }
    }

    #[test]
    fn test_round_trip() {
        let registry = SerializationRegistry::new();
        registry.register::<Greeting>();

        let original = Greeting {
            text: "hello".into(),
            tags: vec!["a".into(), "b".into()],
        };
        let msg = Message::new(original.clone());

        let wire = registry.encode(&msg).unwrap();
        assert_eq!(wire.type_name, "Greeting");

        let back = registry.decode(&wire).unwrap();
        assert_eq!(back.downcast_ref::<Greeting>().unwrap(), &original);
    }

    #[test]
    fn test_round_trip_boundary_values() {
        let registry = SerializationRegistry::new();
        registry.register::<Greeting>();
        registry.register::<Nested>();

        for original in [
            Nested {
                inner: None,
                count: 0,
            },
            Nested {
                inner: Some(Greeting {
                    text: String::new(),
                    tags: vec![],
                }),
                count: u64::MAX,
            },
        ] {
            let wire = registry.encode(&Message::new(original.clone())).unwrap();
            let back = registry.decode(&wire).unwrap();
            assert_eq!(back.downcast_ref::<Nested>().unwrap(), &original);
        }
    }

    #[test]
    fn test_unregistered_type_fails() {
        let registry = SerializationRegistry::new();
        let msg = Message::new(Greeting {
            text: "x".into(),
            tags: vec![],
        });

        let err = registry.encode(&msg).unwrap_err();
        assert!(matches!(err, Error::UnserializableType { .. }));

        let wire = SerializedMessage {
            type_name: "Greeting".into(),
            payload: Bytes::from_static(b"{}"),
        };
        let err = registry.decode(&wire).unwrap_err();
        assert!(matches!(err, Error::UnserializableType { .. }));
    }

    #[test]
    fn test_decode_malformed_payload() {
        let registry = SerializationRegistry::new();
        registry.register::<Greeting>();

        let wire = SerializedMessage {
            type_name: "Greeting".into(),
            payload: Bytes::from_static(b"not json"),
        };
        let err = registry.decode(&wire).unwrap_err();
        assert!(matches!(err, Error::DecodeFailed { .. }));
    }

    #[test]
    fn test_registries_are_independent() {
        let a = SerializationRegistry::new();
        let b = SerializationRegistry::new();
        a.register::<Greeting>();

        assert!(a.is_registered("Greeting"));
        assert!(!b.is_registered("Greeting"));
    }
}
