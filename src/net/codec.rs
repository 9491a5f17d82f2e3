//! Length-prefixed packet framing.
//!
//! Wire format on every mesh connection: repeated records of
//! `[4-byte big-endian length][JSON payload]`. The codec is stateful so
//! that a TCP read boundary can fall anywhere, including inside the
//! length prefix; partial trailing bytes are kept until the next feed.

use super::protocol::{Packet, ProtocolError, MAX_FRAME_LEN};

/// Stateful frame accumulator, one per connection.
#[derive(Default)]
pub struct FrameCodec {
    buf: Vec<u8>,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode one packet into a single length-prefixed frame.
    pub fn encode(packet: &Packet) -> Vec<u8> {
        let json = packet.to_json();
        let mut frame = Vec::with_capacity(4 + json.len());
        frame.extend_from_slice(&(json.len() as u32).to_be_bytes());
        frame.extend_from_slice(&json);
        frame
    }

    /// Feed raw bytes; returns every packet completed by this chunk.
    ///
    /// An oversize or malformed frame is an error, after which the codec
    /// must not be fed again — the owning connection is closed.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Packet>, ProtocolError> {
        self.buf.extend_from_slice(bytes);
        let mut packets = Vec::new();
        loop {
            if self.buf.len() < 4 {
                break;
            }
            let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
                as usize;
            if len > MAX_FRAME_LEN {
                return Err(ProtocolError::FrameTooLarge {
                    len,
                    max: MAX_FRAME_LEN,
                });
            }
            if self.buf.len() < 4 + len {
                break;
            }
            let packet = Packet::from_json(&self.buf[4..4 + len])?;
            packets.push(packet);
            self.buf.drain(..4 + len);
        }
        Ok(packets)
    }

    /// Drop any accumulated partial frame.
    pub fn reset(&mut self) {
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::protocol::{Countdown, GameText, PacketBody};
    use uuid::Uuid;

    fn sample(n: u64) -> Packet {
        Packet {
            sender: Uuid::from_u128(n as u128 + 1),
            ts: n,
            body: match n % 3 {
                0 => PacketBody::Countdown(Countdown { seconds: 3 }),
                1 => PacketBody::GameText(GameText {
                    text: "lorem ipsum".into(),
                    language: "english".into(),
                }),
                _ => PacketBody::GameStart,
            },
        }
    }

    #[test]
    fn single_frame_roundtrips() {
        let packet = sample(0);
        let mut codec = FrameCodec::new();
        let out = codec.feed(&FrameCodec::encode(&packet)).unwrap();
        assert_eq!(out, vec![packet]);
    }

    #[test]
    fn any_byte_split_yields_the_same_sequence() {
        let packets: Vec<Packet> = (0..4).map(sample).collect();
        let stream: Vec<u8> = packets.iter().flat_map(|p| FrameCodec::encode(p)).collect();

        for chunk in [1usize, 2, 3, 7, 16, 64, stream.len()] {
            let mut codec = FrameCodec::new();
            let mut decoded = Vec::new();
            for piece in stream.chunks(chunk) {
                decoded.extend(codec.feed(piece).unwrap());
            }
            assert_eq!(decoded, packets, "chunk size {}", chunk);
        }
    }

    #[test]
    fn partial_trailing_bytes_survive_feeds() {
        let packet = sample(1);
        let frame = FrameCodec::encode(&packet);
        let mut codec = FrameCodec::new();

        let split = frame.len() - 3;
        assert!(codec.feed(&frame[..split]).unwrap().is_empty());
        let out = codec.feed(&frame[split..]).unwrap();
        assert_eq!(out, vec![packet]);
    }

    #[test]
    fn oversize_frame_is_rejected() {
        let mut codec = FrameCodec::new();
        let bogus = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes();
        assert!(matches!(
            codec.feed(&bogus),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn malformed_payload_is_rejected() {
        let mut codec = FrameCodec::new();
        let mut frame = (7u32).to_be_bytes().to_vec();
        frame.extend_from_slice(b"not {} ");
        assert!(codec.feed(&frame).is_err());
    }

    #[test]
    fn reset_discards_partial_input() {
        let packet = sample(2);
        let frame = FrameCodec::encode(&packet);
        let mut codec = FrameCodec::new();
        assert!(codec.feed(&frame[..5]).unwrap().is_empty());
        codec.reset();
        // A fresh full frame decodes cleanly after the reset.
        assert_eq!(codec.feed(&frame).unwrap(), vec![packet]);
    }
}
