//! Payload encodings.
//!
//! The wire negotiates an encoding by tag string during the handshake;
//! [`Encoding`] is that tag plus runtime dispatch to the codec behind it.
//! Codecs only turn values into bytes and back; framing is the `wire`
//! module's business.

use serde::{de::DeserializeOwned, Serialize};
use std::fmt;

use crate::error::Error;

/// Wire tag identifying how header and body frames are encoded.
///
/// The tag travels in the handshake record; both peers must resolve it to
/// a built-in codec before any frame is exchanged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
    /// Postcard: compact binary format, the default.
    Postcard,
    /// JSON: human-readable format for debugging and tooling.
    Json,
}

impl Encoding {
    /// Resolve a handshake tag to an encoding.
    ///
    /// This is the codec registry: unknown tags are rejected here, before
    /// any frame is read.
    pub fn from_tag(tag: &str) -> Result<Encoding, Error> {
        match tag {
            "application/postcard" => Ok(Encoding::Postcard),
            "application/json" => Ok(Encoding::Json),
            _ => Err(Error::UnknownCodec(tag.to_string())),
        }
    }

    /// The tag string this encoding answers to.
    pub fn tag(self) -> &'static str {
        match self {
            Encoding::Postcard => "application/postcard",
            Encoding::Json => "application/json",
        }
    }

    /// Encode a value with the codec behind this tag.
    pub fn encode<T: Serialize>(self, value: &T) -> Result<Vec<u8>, Error> {
        match self {
            Encoding::Postcard => PostcardCodec::encode(value),
            Encoding::Json => JsonCodec::encode(value),
        }
    }

    /// Decode a value with the codec behind this tag.
    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T, Error> {
        match self {
            Encoding::Postcard => PostcardCodec::decode(bytes),
            Encoding::Json => JsonCodec::decode(bytes),
        }
    }
}

impl Default for Encoding {
    fn default() -> Self {
        Encoding::Postcard
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Codec for one serialization format.
///
/// Implementations are stateless; they declare the encoding tag they
/// implement and provide encode/decode over serde bounds.
pub trait Codec {
    /// The encoding this codec implements.
    const ENCODING: Encoding;

    /// Encode a value into bytes.
    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, Error>;

    /// Decode bytes into a value.
    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Error>;
}

/// Postcard codec: compact binary encoding, deterministic output.
pub struct PostcardCodec;

impl Codec for PostcardCodec {
    const ENCODING: Encoding = Encoding::Postcard;

    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, Error> {
        postcard::to_allocvec(value).map_err(|e| Error::Encode(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Error> {
        postcard::from_bytes(bytes).map_err(|e| Error::Decode(e.to_string()))
    }
}

/// JSON codec: larger and slower than postcard, but inspectable as text.
pub struct JsonCodec;

impl Codec for JsonCodec {
    const ENCODING: Encoding = Encoding::Json;

    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(value).map_err(|e| Error::Encode(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, Error> {
        serde_json::from_slice(bytes).map_err(|e| Error::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct TestMessage {
        id: u32,
        name: String,
    }

    fn sample() -> TestMessage {
        TestMessage {
            id: 42,
            name: "test".to_string(),
        }
    }

    #[test]
    fn tag_round_trip() {
        for enc in [Encoding::Postcard, Encoding::Json] {
            assert_eq!(Encoding::from_tag(enc.tag()).unwrap(), enc);
        }
    }

    #[test]
    fn unknown_tag_rejected() {
        let err = Encoding::from_tag("application/gob");
        assert!(matches!(err, Err(Error::UnknownCodec(_))));
    }

    #[test]
    fn default_is_postcard() {
        assert_eq!(Encoding::default(), Encoding::Postcard);
        assert_eq!(Encoding::default().tag(), "application/postcard");
    }

    #[test]
    fn postcard_round_trip() {
        let msg = sample();
        let bytes = PostcardCodec::encode(&msg).unwrap();
        let back: TestMessage = PostcardCodec::decode(&bytes).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn json_round_trip_and_readability() {
        let msg = sample();
        let bytes = JsonCodec::encode(&msg).unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("42"));
        assert!(text.contains("test"));
        let back: TestMessage = JsonCodec::decode(&bytes).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn decode_garbage_fails() {
        let bad = [0xFFu8, 0xFF, 0xFF];
        assert!(PostcardCodec::decode::<TestMessage>(&bad).is_err());
        assert!(JsonCodec::decode::<TestMessage>(&bad).is_err());
    }

    #[test]
    fn dispatch_matches_direct() {
        let msg = sample();
        assert_eq!(
            Encoding::Postcard.encode(&msg).unwrap(),
            PostcardCodec::encode(&msg).unwrap()
        );
        assert_eq!(
            Encoding::Json.encode(&msg).unwrap(),
            JsonCodec::encode(&msg).unwrap()
        );
    }

    #[test]
    fn postcard_smaller_than_json() {
        let msg = sample();
        let p = PostcardCodec::encode(&msg).unwrap();
        let j = JsonCodec::encode(&msg).unwrap();
        assert!(p.len() < j.len());
    }
}
