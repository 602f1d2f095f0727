//! FRAMER: byte-stream &harr; message boundary translator (§4.1).
//!
//! A [`Decoder`] owns nothing but a growable pending buffer; it never
//! touches a socket. [`Decoder::feed`] is handed whatever bytes the
//! reactor just read off one peer's stream and calls back once per fully
//! decoded message. Body decoding for a known command is delegated to
//! `bitcoin`'s own `consensus::deserialize::<RawNetworkMessage>`, which is
//! this workspace's `MSG_CODEC` (§1, "assumed available as a pure codec").
//! Everything before that point — magic, command charset, length bound,
//! checksum — is checked by hand so a malformed frame can be rejected
//! before its payload is ever allocated.
use bitcoin::consensus::encode;
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::network::message::{NetworkMessage, RawNetworkMessage};

/// Fixed size of the frame header: 4-byte magic, 12-byte command,
/// 4-byte length, 4-byte checksum.
const HEADER_LEN: usize = 24;

/// A message frame may carry at most 32 MiB of payload (§3, §5).
pub const MAX_MESSAGE: u32 = 32 * 1024 * 1024;

/// Why a frame was rejected. Every variant maps to "+10 ban, parser
/// latched closed" per §4.1/§7 kind 1.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The magic bytes didn't match the configured network.
    #[error("invalid magic: {0:#x}")]
    Magic(u32),
    /// The command bytes weren't NUL-padded printable ASCII.
    #[error("invalid command bytes")]
    Command,
    /// The declared payload length exceeds `MAX_MESSAGE`.
    #[error("payload length {0} exceeds maximum message size")]
    PayloadTooLarge(u32),
    /// The payload's double-SHA256 didn't match the declared checksum.
    #[error("checksum mismatch")]
    Checksum,
    /// The payload didn't decode as a known message body.
    #[error("body decode error: {0}")]
    Decode(#[from] encode::Error),
}

struct Header {
    length: u32,
    checksum: [u8; 4],
}

fn parse_header(magic: u32, bytes: &[u8; HEADER_LEN]) -> Result<Header, Error> {
    let got_magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    if got_magic != magic {
        return Err(Error::Magic(got_magic));
    }
    let command = &bytes[4..16];
    let mut seen_nul = false;
    for &b in command {
        if seen_nul {
            if b != 0 {
                return Err(Error::Command);
            }
        } else if b == 0 {
            seen_nul = true;
        } else if !(32..=126).contains(&b) {
            return Err(Error::Command);
        }
    }
    let length = u32::from_le_bytes(bytes[16..20].try_into().unwrap());
    if length > MAX_MESSAGE {
        return Err(Error::PayloadTooLarge(length));
    }
    let mut checksum = [0u8; 4];
    checksum.copy_from_slice(&bytes[20..24]);

    Ok(Header { length, checksum })
}

/// Decoder state for one peer's inbound byte stream.
pub struct Decoder {
    magic: u32,
    pending: Vec<u8>,
    header: Option<Header>,
    /// Latched after the first framing/decode error: subsequent `feed`
    /// calls are no-ops, mirroring "the parser is closed after first
    /// error for safety" (§4.1).
    closed: bool,
}

impl Decoder {
    /// Construct a decoder for the given network magic.
    pub fn new(magic: u32) -> Self {
        Self {
            magic,
            pending: Vec::new(),
            header: None,
            closed: false,
        }
    }

    /// Whether this decoder has latched closed after a prior error.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Feed newly-read bytes in. Calls `on_message` once per fully
    /// decoded frame, in order. Stops and returns the first error
    /// encountered, at which point the decoder is permanently closed.
    pub fn feed(
        &mut self,
        bytes: &[u8],
        mut on_message: impl FnMut(NetworkMessage),
    ) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        self.pending.extend_from_slice(bytes);

        loop {
            if self.header.is_none() {
                if self.pending.len() < HEADER_LEN {
                    break;
                }
                let mut head = [0u8; HEADER_LEN];
                head.copy_from_slice(&self.pending[..HEADER_LEN]);

                match parse_header(self.magic, &head) {
                    Ok(header) => self.header = Some(header),
                    Err(err) => {
                        self.closed = true;
                        return Err(err);
                    }
                }
            }

            let header = self.header.as_ref().expect("just set above");
            let total = HEADER_LEN + header.length as usize;

            if self.pending.len() < total {
                break;
            }
            let frame: Vec<u8> = self.pending.drain(..total).collect();
            let payload = &frame[HEADER_LEN..];
            let digest = sha256d::Hash::hash(payload);

            if digest[0..4] != header.checksum {
                self.closed = true;
                return Err(Error::Checksum);
            }

            match encode::deserialize::<RawNetworkMessage>(&frame) {
                Ok(raw) => on_message(raw.payload),
                Err(err) => {
                    self.closed = true;
                    return Err(Error::Decode(err));
                }
            }
            self.header = None;
        }
        Ok(())
    }
}

/// Encode an outbound message into a framed byte buffer (the inverse of
/// [`Decoder::feed`]).
pub fn encode(magic: u32, payload: NetworkMessage) -> Vec<u8> {
    encode::serialize(&RawNetworkMessage { magic, payload })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::network::message::NetworkMessage;

    const MAGIC: u32 = 0xD9B4_BEF9;

    fn ping(nonce: u64) -> NetworkMessage {
        NetworkMessage::Ping(nonce)
    }

    #[test]
    fn decodes_one_message_fed_in_one_chunk() {
        let mut decoder = Decoder::new(MAGIC);
        let frame = encode(MAGIC, ping(42));
        let mut out = Vec::new();

        decoder.feed(&frame, |m| out.push(m)).unwrap();
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], NetworkMessage::Ping(42)));
    }

    #[test]
    fn decodes_message_fed_one_byte_at_a_time() {
        let mut decoder = Decoder::new(MAGIC);
        let frame = encode(MAGIC, ping(7));
        let mut out = Vec::new();

        for i in 0..frame.len() {
            decoder.feed(&frame[i..=i], |m| out.push(m)).unwrap();
            if i + 1 < frame.len() {
                assert!(out.is_empty(), "message emitted before last byte arrived");
            }
        }
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn decodes_two_concatenated_frames_in_one_chunk() {
        let mut decoder = Decoder::new(MAGIC);
        let mut both = encode(MAGIC, ping(1));
        both.extend(encode(MAGIC, ping(2)));
        let mut out = Vec::new();

        decoder.feed(&both, |m| out.push(m)).unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn bad_checksum_closes_the_decoder() {
        let mut decoder = Decoder::new(MAGIC);
        let mut frame = encode(MAGIC, ping(1));
        let last = frame.len() - 1;
        frame[last] ^= 0xff;

        let result = decoder.feed(&frame, |_| {});
        assert!(matches!(result, Err(Error::Checksum)));
        assert!(decoder.is_closed());

        // Further bytes are ignored once closed.
        let mut out = Vec::new();
        decoder.feed(&encode(MAGIC, ping(2)), |m| out.push(m)).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn wrong_magic_is_rejected_before_allocating_payload() {
        let mut decoder = Decoder::new(MAGIC);
        let frame = encode(0xAAAA_AAAA, ping(1));

        let result = decoder.feed(&frame, |_| {});
        assert!(matches!(result, Err(Error::Magic(_))));
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut decoder = Decoder::new(MAGIC);
        let mut head = [0u8; HEADER_LEN];
        head[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        head[4..16].copy_from_slice(b"block\0\0\0\0\0\0\0");
        head[16..20].copy_from_slice(&(MAX_MESSAGE + 1).to_le_bytes());

        let result = decoder.feed(&head, |_| {});
        assert!(matches!(result, Err(Error::PayloadTooLarge(_))));
    }
}
