use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::{Error, Result, TextEncoding, FRAME_LEN};
use super::signal::Signal;

/// Encodes a signal: big-endian message followed by big-endian sequence id
pub fn encode(signal: &Signal) -> [u8; FRAME_LEN] {
    let [m0, m1] = signal.message().to_be_bytes();
    let [s0, s1] = signal.sequence_id().to_be_bytes();
    [m0, m1, s0, s1]
}

/// Decodes the first frame of `bytes`
///
/// Bytes past the first frame are ignored. The message value is not checked
/// against the control codes.
pub fn decode(bytes: &[u8]) -> Result<Signal> {
    if bytes.len() < FRAME_LEN {
        return Err(Error::MalformedFrame { len: bytes.len() });
    }
    let message = u16::from_be_bytes([bytes[0], bytes[1]]);
    let sequence_id = u16::from_be_bytes([bytes[2], bytes[3]]);
    Ok(Signal::new(message, sequence_id))
}

/// Digit-sum checksum of a message value
///
/// Sums the encoded bytes of the plain base-10 spelling of `value` (no sign,
/// no padding, no separators) with 16-bit wraparound. Bytes count as signed,
/// as peer firmware sums `char`s, so 0x80 and above are negative.
pub fn checksum(value: u16, encoding: TextEncoding) -> u16 {
    encoding
        .encode_digits(&value.to_string())
        .into_iter()
        .fold(0u16, |sum, byte| sum.wrapping_add(i16::from(byte as i8) as u16))
}

/// Stream codec for SCOM frames
#[derive(Clone, Copy, Debug, Default)]
pub struct SignalCodec;

impl SignalCodec {
    /// Creates a new signal codec
    pub fn new() -> Self {
        SignalCodec
    }
}

impl Decoder for SignalCodec {
    type Item = Signal;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < FRAME_LEN {
            // Wait for the rest of the frame
            return Ok(None);
        }
        let signal = decode(&src[..FRAME_LEN])?;
        src.advance(FRAME_LEN);
        Ok(Some(signal))
    }
}

impl Encoder<Signal> for SignalCodec {
    type Error = Error;

    fn encode(&mut self, item: Signal, dst: &mut BytesMut) -> Result<()> {
        dst.reserve(FRAME_LEN);
        dst.put_u16(item.message());
        dst.put_u16(item.sequence_id());
        Ok(())
    }
}
