//! Framing on an established connection. Each message travels as a fixed-width `u32`
//! little-endian body length followed by the body from [`Message::encode`]. Frames are
//! only delimited by the prefix, so a reader buffers until a whole frame is present.

use crate::protocol::{DecodeError, Message};

/// Width of the length prefix.
pub const LEN_SIZE: usize = 4;

/// Largest body a peer will accept. Encounter messages are a few hundred bytes at most, so
/// anything near this is a corrupt or hostile prefix rather than a real message.
pub const MAX_FRAME_LEN: u32 = 1 << 24;

/// Prefix `msg`'s body with its length.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    let body = msg.encode();
    let len = u32::try_from(body.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .ok_or(FrameEncodeError::TooLarge(body.len()))?;
    let mut frame = Vec::with_capacity(LEN_SIZE + body.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("message body of {0} bytes exceeds the {MAX_FRAME_LEN} byte frame limit")]
    TooLarge(usize),
}

/// Body length declared by the prefix at the front of `bytes`, once the whole prefix is present.
pub fn peek_len(bytes: &[u8]) -> Option<usize> {
    let prefix: [u8; LEN_SIZE] = bytes.get(..LEN_SIZE)?.try_into().ok()?;
    Some(u32::from_le_bytes(prefix) as usize)
}

/// Take one frame off the front of `bytes`, returning the message and how many bytes it
/// used. `NeedMore` means the frame is still incomplete; the caller keeps the bytes and
/// tries again after the next read.
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    let len = peek_len(bytes).ok_or(FrameDecodeError::NeedMore)?;
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameDecodeError::TooLarge(len));
    }
    let end = LEN_SIZE + len;
    let body = bytes.get(LEN_SIZE..end).ok_or(FrameDecodeError::NeedMore)?;
    Ok((Message::decode(body)?, end))
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("incomplete frame")]
    NeedMore,
    #[error("declared frame length {0} exceeds the {MAX_FRAME_LEN} byte limit")]
    TooLarge(usize),
    #[error("undecodable frame body: {0}")]
    Decode(#[from] DecodeError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn orc() -> Message {
        Message::InsertCombatant {
            to_index: 2,
            name: "Orc".into(),
            initiative: None,
            is_current_turn: false,
            is_alive: true,
        }
    }

    #[test]
    fn prefix_is_body_length_little_endian() {
        let frame = encode_frame(&Message::Round { round: 3 }).unwrap();
        assert_eq!(frame, [2, 0, 0, 0, 0x06, 3]);
        assert_eq!(peek_len(&frame), Some(2));
        assert_eq!(peek_len(&frame[..3]), None);
    }

    #[test]
    fn incomplete_frame_consumes_nothing() {
        let frame = encode_frame(&orc()).unwrap();
        for cut in 0..frame.len() {
            assert!(
                matches!(decode_frame(&frame[..cut]), Err(FrameDecodeError::NeedMore)),
                "cut at {cut}"
            );
        }
        assert_eq!(decode_frame(&frame).unwrap(), (orc(), frame.len()));
    }

    #[test]
    fn back_to_back_frames_split_at_prefix() {
        let mut buf = encode_frame(&orc()).unwrap();
        let first = buf.len();
        buf.extend(encode_frame(&Message::EndTurn { name: "Orc".into() }).unwrap());
        let (m1, n1) = decode_frame(&buf).unwrap();
        assert_eq!((m1, n1), (orc(), first));
        let (m2, n2) = decode_frame(&buf[n1..]).unwrap();
        assert_eq!(m2, Message::EndTurn { name: "Orc".into() });
        assert_eq!(n1 + n2, buf.len());
    }

    #[test]
    fn oversized_prefix_rejected_before_body_arrives() {
        let buf = (MAX_FRAME_LEN + 1).to_le_bytes();
        let err = decode_frame(&buf).unwrap_err();
        assert!(matches!(err, FrameDecodeError::TooLarge(len) if len == MAX_FRAME_LEN as usize + 1));
    }

    #[test]
    fn unknown_tag_is_decode_error() {
        let buf = [1, 0, 0, 0, 0x42];
        assert!(matches!(
            decode_frame(&buf),
            Err(FrameDecodeError::Decode(DecodeError::UnknownTag(0x42)))
        ));
    }
}
