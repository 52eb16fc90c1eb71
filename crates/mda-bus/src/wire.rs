//! Cross-process wire format.
//!
//! Each message is a flat JSON object tagged by `kind`:
//!
//! ```json
//! {"version":1,"kind":"frame_ready","coordinate":{"c":0,"z":0,"t":3,"p":0,"g":0},"shape":[512,512],"locator":1572864}
//! {"version":1,"kind":"sequence_started","descriptor":{"c":2,"z":1,"t":5,"p":0,"g":0}}
//! {"version":1,"kind":"stop"}
//! ```
//!
//! On a stream transport every message is preceded by its payload length as a
//! 4-byte little-endian integer. [`FrameDecoder`] reassembles messages from
//! arbitrary read chunks, so a read timeout in the middle of a message loses
//! nothing.

use bytes::{Buf, Bytes, BytesMut};
use mda_core::{
    AcquisitionEvent, Coordinate, EdaError, EdaResult, FrameReady, FrameShape, SequenceDescriptor,
};
use serde::{Deserialize, Serialize};

/// Current schema version, written into every message.
pub const WIRE_VERSION: u64 = 1;

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireMessage {
    FrameReady {
        coordinate: Coordinate,
        shape: FrameShape,
        locator: u64,
    },
    SequenceStarted {
        descriptor: SequenceDescriptor,
    },
    /// Sender is done; the receiver loop exits after this message.
    Stop,
}

impl WireMessage {
    pub fn into_event(self) -> Option<AcquisitionEvent> {
        match self {
            WireMessage::FrameReady {
                coordinate,
                shape,
                locator,
            } => Some(AcquisitionEvent::FrameReady(FrameReady {
                coordinate,
                shape,
                locator,
            })),
            WireMessage::SequenceStarted { descriptor } => {
                Some(AcquisitionEvent::SequenceStarted(descriptor))
            }
            WireMessage::Stop => None,
        }
    }
}

impl From<&AcquisitionEvent> for WireMessage {
    fn from(event: &AcquisitionEvent) -> Self {
        match *event {
            AcquisitionEvent::FrameReady(ready) => WireMessage::FrameReady {
                coordinate: ready.coordinate,
                shape: ready.shape,
                locator: ready.locator,
            },
            AcquisitionEvent::SequenceStarted(descriptor) => {
                WireMessage::SequenceStarted { descriptor }
            }
        }
    }
}

/// Serialize to the JSON payload (no length prefix).
pub fn to_payload(message: &WireMessage) -> EdaResult<Vec<u8>> {
    let mut value = serde_json::to_value(message)?;
    if let Some(object) = value.as_object_mut() {
        object.insert("version".into(), WIRE_VERSION.into());
    }
    Ok(serde_json::to_vec(&value)?)
}

/// Parse a JSON payload. A missing `version` is read as version 1.
pub fn from_payload(payload: &[u8]) -> EdaResult<WireMessage> {
    let mut value: serde_json::Value = serde_json::from_slice(payload)?;
    let version = match value.as_object_mut().and_then(|o| o.remove("version")) {
        None => WIRE_VERSION,
        Some(v) => v
            .as_u64()
            .ok_or_else(|| EdaError::Serialization(format!("non-integer version {v}")))?,
    };
    if version != WIRE_VERSION {
        return Err(EdaError::Serialization(format!(
            "unsupported wire version {version}"
        )));
    }
    Ok(serde_json::from_value(value)?)
}

/// Length-prefixed frame ready to be written to a stream.
pub fn encode(message: &WireMessage, max_len: usize) -> EdaResult<Vec<u8>> {
    let payload = to_payload(message)?;
    if payload.len() > max_len || payload.len() > u32::MAX as usize {
        return Err(EdaError::MessageTooLarge {
            len: payload.len(),
            max: max_len,
        });
    }
    let mut out = Vec::with_capacity(LENGTH_PREFIX + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Incremental splitter for length-prefixed payloads.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_len: usize,
    /// Bytes of an over-long payload still to be skipped
    discard: usize,
}

impl FrameDecoder {
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            max_len,
            discard: 0,
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete payload, if one is buffered.
    ///
    /// An over-long payload yields one `MessageTooLarge` error and is then
    /// skipped as its bytes arrive, so the stream stays in sync.
    pub fn next_payload(&mut self) -> Option<EdaResult<Bytes>> {
        if self.discard > 0 {
            let n = self.discard.min(self.buf.len());
            self.buf.advance(n);
            self.discard -= n;
            if self.discard > 0 {
                return None;
            }
        }

        if self.buf.len() < LENGTH_PREFIX {
            return None;
        }
        let len = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;

        if len > self.max_len {
            self.buf.advance(LENGTH_PREFIX);
            self.discard = len;
            return Some(Err(EdaError::MessageTooLarge {
                len,
                max: self.max_len,
            }));
        }

        if self.buf.len() < LENGTH_PREFIX + len {
            return None;
        }
        self.buf.advance(LENGTH_PREFIX);
        Some(Ok(self.buf.split_to(len).freeze()))
    }

    /// Next complete message, decoding the payload.
    pub fn next_message(&mut self) -> Option<EdaResult<WireMessage>> {
        self.next_payload()
            .map(|payload| payload.and_then(|bytes| from_payload(&bytes)))
    }

    /// Bytes received but not yet returned as a payload.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_ready() -> WireMessage {
        WireMessage::FrameReady {
            coordinate: Coordinate::new(1, 0, 3),
            shape: FrameShape::new(512, 256),
            locator: 4096,
        }
    }

    #[test]
    fn test_payload_is_flat_and_tagged() {
        let payload = to_payload(&frame_ready()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["kind"], "frame_ready");
        assert_eq!(value["version"], 1);
        assert_eq!(value["coordinate"]["c"], 1);
        assert_eq!(value["coordinate"]["t"], 3);
        assert_eq!(value["shape"], serde_json::json!([512, 256]));
        assert_eq!(value["locator"], 4096);

        let stop = to_payload(&WireMessage::Stop).unwrap();
        assert_eq!(
            serde_json::from_slice::<serde_json::Value>(&stop).unwrap(),
            serde_json::json!({"kind": "stop", "version": 1})
        );
    }

    #[test]
    fn test_parse_foreign_message() {
        // partial coordinate and descriptor maps, as another language might send
        let msg = from_payload(br#"{"kind":"sequence_started","descriptor":{"c":2,"t":5}}"#).unwrap();
        assert_eq!(
            msg,
            WireMessage::SequenceStarted {
                descriptor: SequenceDescriptor {
                    c: 2,
                    t: 5,
                    ..Default::default()
                }
            }
        );

        let msg = from_payload(
            br#"{"kind":"frame_ready","coordinate":{"t":7},"shape":[4,2],"locator":64}"#,
        )
        .unwrap();
        let event = msg.into_event().unwrap();
        assert_eq!(
            event,
            AcquisitionEvent::FrameReady(FrameReady {
                coordinate: Coordinate::new(0, 0, 7),
                shape: FrameShape::new(4, 2),
                locator: 64,
            })
        );
    }

    #[test]
    fn test_rejects_malformed() {
        let bad_payloads: [&[u8]; 5] = [
            b"not json",
            br#"{"kind":"explode"}"#,
            br#"{"kind":"frame_ready","shape":[1,1]}"#,
            br#"{"kind":"stop","version":99}"#,
            b"[1,2,3]",
        ];
        for bad in bad_payloads {
            assert!(
                matches!(from_payload(bad), Err(EdaError::Serialization(_))),
                "accepted {:?}",
                String::from_utf8_lossy(bad)
            );
        }
    }

    #[test]
    fn test_decoder_reassembles_split_reads() {
        let mut stream = encode(&frame_ready(), 1024).unwrap();
        stream.extend(encode(&WireMessage::Stop, 1024).unwrap());

        let mut decoder = FrameDecoder::new(1024);
        let mut out = Vec::new();
        for byte in &stream {
            decoder.extend(std::slice::from_ref(byte));
            while let Some(msg) = decoder.next_message() {
                out.push(msg.unwrap());
            }
        }
        assert_eq!(out, vec![frame_ready(), WireMessage::Stop]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_oversized_payload_is_skipped() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&(100u32).to_le_bytes());
        stream.extend_from_slice(&[b'x'; 100]);
        stream.extend(encode(&WireMessage::Stop, 64).unwrap());

        let mut decoder = FrameDecoder::new(64);
        decoder.extend(&stream[..50]);
        assert!(matches!(
            decoder.next_message(),
            Some(Err(EdaError::MessageTooLarge { len: 100, max: 64 }))
        ));
        assert!(decoder.next_message().is_none());

        decoder.extend(&stream[50..]);
        assert_eq!(decoder.next_message().unwrap().unwrap(), WireMessage::Stop);
    }

    #[test]
    fn test_encode_respects_limit() {
        assert!(matches!(
            encode(&frame_ready(), 8),
            Err(EdaError::MessageTooLarge { .. })
        ));
    }
}
