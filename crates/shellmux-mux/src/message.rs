use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{MuxError, Result};

/// Envelope header: kind (1) + seq (8) + reply_to (8) + name length (2).
pub const ENVELOPE_HEADER_SIZE: usize = 19;

/// Longest accepted channel name, in bytes.
pub const MAX_CHANNEL_NAME_LEN: usize = 255;

/// High bit of the kind byte: the message holds one of the sender's credits.
const CREDITED: u8 = 0x80;

/// What a message means to the receiving channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Data = 0,
    Control = 1,
    /// The sender will publish nothing more on this channel.
    Close = 2,
    /// Hands credits back to the sender of a bounded channel. Outside the
    /// channel's sequence; the payload is a `u32` LE count.
    Credit = 3,
}

impl TryFrom<u8> for MessageKind {
    type Error = MuxError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageKind::Data),
            1 => Ok(MessageKind::Control),
            2 => Ok(MessageKind::Close),
            3 => Ok(MessageKind::Credit),
            _ => Err(MuxError::Malformed("unknown message kind")),
        }
    }
}

/// One multiplexed message.
///
/// `seq` starts at 1 and increases by one per message the sender publishes
/// on `channel`. `reply_to` carries the `seq` of the request a reply answers.
/// `credited` marks messages sent from a bounded channel; the receiver owes
/// the sender one credit for each once it has been consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub channel: String,
    pub seq: u64,
    pub reply_to: Option<u64>,
    pub kind: MessageKind,
    pub credited: bool,
    pub payload: Bytes,
}

impl Message {
    /// Return `count` credits to the sender of `channel`.
    pub fn credit(channel: &str, count: u32) -> Self {
        Self {
            channel: channel.to_owned(),
            seq: 1,
            reply_to: None,
            kind: MessageKind::Credit,
            credited: false,
            payload: Bytes::copy_from_slice(&count.to_le_bytes()),
        }
    }

    /// Credits carried by a `Credit` message.
    pub fn credit_count(&self) -> Option<u32> {
        if self.kind != MessageKind::Credit {
            return None;
        }
        let bytes: [u8; 4] = self.payload.as_ref().try_into().ok()?;
        Some(u32::from_le_bytes(bytes))
    }

    /// Encoded size of this message inside a frame.
    pub fn encoded_len(&self) -> usize {
        envelope_len(&self.channel, self.payload.len())
    }

    /// Encode into one frame payload.
    ///
    /// ```text
    /// kind u8 | seq u64 LE | reply_to u64 LE (0 = none) | name_len u16 LE | name | payload
    /// ```
    ///
    /// The kind byte's high bit carries `credited`.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        let flags = if self.credited { CREDITED } else { 0 };
        buf.put_u8(self.kind as u8 | flags);
        buf.put_u64_le(self.seq);
        buf.put_u64_le(self.reply_to.unwrap_or(0));
        buf.put_u16_le(self.channel.len() as u16);
        buf.put_slice(self.channel.as_bytes());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    /// Decode a frame payload. The message payload shares the frame's buffer.
    pub fn decode(mut frame: Bytes) -> Result<Self> {
        if frame.len() < ENVELOPE_HEADER_SIZE {
            return Err(MuxError::Malformed("short envelope"));
        }
        let head = frame.get_u8();
        let credited = head & CREDITED != 0;
        let kind = MessageKind::try_from(head & !CREDITED)?;
        let seq = frame.get_u64_le();
        let reply_to = match frame.get_u64_le() {
            0 => None,
            n => Some(n),
        };
        let name_len = frame.get_u16_le() as usize;
        if name_len == 0 || name_len > MAX_CHANNEL_NAME_LEN {
            return Err(MuxError::Malformed("bad channel name length"));
        }
        if frame.len() < name_len {
            return Err(MuxError::Malformed("truncated channel name"));
        }
        let name = frame.split_to(name_len);
        let channel = std::str::from_utf8(&name)
            .map_err(|_| MuxError::Malformed("channel name is not UTF-8"))?
            .to_owned();
        if seq == 0 {
            return Err(MuxError::Malformed("sequence number 0"));
        }

        Ok(Self {
            channel,
            seq,
            reply_to,
            kind,
            credited,
            payload: frame,
        })
    }
}

pub(crate) fn envelope_len(name: &str, payload_len: usize) -> usize {
    ENVELOPE_HEADER_SIZE + name.len() + payload_len
}

pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(MuxError::InvalidChannelName("empty".into()));
    }
    if name.len() > MAX_CHANNEL_NAME_LEN {
        return Err(MuxError::InvalidChannelName(format!(
            "{} bytes (max {MAX_CHANNEL_NAME_LEN})",
            name.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(kind: MessageKind, reply_to: Option<u64>) -> Message {
        Message {
            channel: "stdout".into(),
            seq: 42,
            reply_to,
            kind,
            credited: false,
            payload: Bytes::from_static(b"hello\n"),
        }
    }

    #[test]
    fn encode_layout() {
        let encoded = message(MessageKind::Control, Some(7)).encode();
        assert_eq!(encoded.len(), ENVELOPE_HEADER_SIZE + 6 + 6);
        assert_eq!(encoded[0], 1);
        assert_eq!(&encoded[1..9], &42u64.to_le_bytes());
        assert_eq!(&encoded[9..17], &7u64.to_le_bytes());
        assert_eq!(&encoded[17..19], &6u16.to_le_bytes());
        assert_eq!(&encoded[19..25], b"stdout");
        assert_eq!(&encoded[25..], b"hello\n");
    }

    #[test]
    fn decode_restores_every_field() {
        for (kind, reply_to) in [
            (MessageKind::Data, None),
            (MessageKind::Control, Some(3)),
            (MessageKind::Close, None),
        ] {
            let original = message(kind, reply_to);
            assert_eq!(Message::decode(original.encode()).unwrap(), original);
        }
    }

    #[test]
    fn credited_flag_rides_the_kind_byte() {
        let mut msg = message(MessageKind::Data, None);
        msg.credited = true;
        let encoded = msg.encode();
        assert_eq!(encoded[0], 0x80);
        let decoded = Message::decode(encoded).unwrap();
        assert!(decoded.credited);
        assert_eq!(decoded.kind, MessageKind::Data);
    }

    #[test]
    fn credit_messages_carry_a_count() {
        let credit = Message::decode(Message::credit("stdout", 3).encode()).unwrap();
        assert_eq!(credit.kind, MessageKind::Credit);
        assert_eq!(credit.channel, "stdout");
        assert_eq!(credit.credit_count(), Some(3));

        assert_eq!(message(MessageKind::Data, None).credit_count(), None);
        let mut short = Message::credit("stdout", 3);
        short.payload = Bytes::from_static(b"\x01");
        assert_eq!(short.credit_count(), None);
    }

    #[test]
    fn empty_payload_is_allowed() {
        let mut msg = message(MessageKind::Data, None);
        msg.payload = Bytes::new();
        assert_eq!(Message::decode(msg.encode()).unwrap(), msg);
    }

    #[test]
    fn rejects_short_and_truncated_envelopes() {
        assert!(matches!(
            Message::decode(Bytes::from_static(&[0u8; 5])),
            Err(MuxError::Malformed(_))
        ));

        let encoded = message(MessageKind::Data, None).encode();
        let truncated = encoded.slice(..ENVELOPE_HEADER_SIZE + 2);
        assert!(matches!(
            Message::decode(truncated),
            Err(MuxError::Malformed("truncated channel name"))
        ));
    }

    #[test]
    fn rejects_unknown_kind_and_zero_seq() {
        let mut raw = BytesMut::from(&message(MessageKind::Data, None).encode()[..]);
        raw[0] = 9;
        assert!(Message::decode(raw.freeze()).is_err());

        let mut msg = message(MessageKind::Data, None);
        msg.seq = 0;
        assert!(matches!(
            Message::decode(msg.encode()),
            Err(MuxError::Malformed("sequence number 0"))
        ));
    }

    #[test]
    fn name_validation() {
        assert!(validate_name("control").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name(&"n".repeat(MAX_CHANNEL_NAME_LEN)).is_ok());
        assert!(validate_name(&"n".repeat(MAX_CHANNEL_NAME_LEN + 1)).is_err());
    }
}
