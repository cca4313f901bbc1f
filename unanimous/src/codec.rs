//! Flat wire format for protocol messages
//!
//! A payload is an ASCII header, one NUL separator byte, then raw bytes:
//!
//! ```text
//! 1!pic1@a.jpg#b.jpg\0<artifact bytes>     VOTE
//! 2!pic1@n1#1\0                             VOTE_RESPONSE (1 = yes, 0 = no)
//! 3!pic1\0                                  EXEC
//! 4!pic1@n1\0                               ACK
//! 5!pic1\0                                  ABORT
//! ```
//!
//! The characters in [`RESERVED`] delimit fields and must never appear in
//! node ids, artifact ids or item names.

use bytes::{BufMut, Bytes, BytesMut};
use error_stack::{Report, ResultExt};

use crate::error::CodecError;
use crate::messages::{Message, MessageKind};

/// Separates the textual header from the opaque payload.
pub const SEPARATOR: u8 = b'\0';

/// Characters that cannot appear inside identifiers.
pub const RESERVED: &[char] = &['!', '@', '#', ':', '\0', '\t', '\n', '\r'];

/// Returns true if `id` is non-empty and free of reserved characters.
#[must_use]
pub fn is_valid_identifier(id: &str) -> bool {
    !id.is_empty() && !id.contains(RESERVED)
}

#[must_use]
pub fn encode(message: &Message) -> Bytes {
    let mut header = format!("{}!{}", message.kind().code(), message.artifact());
    let mut payload: &[u8] = &[];

    match message {
        Message::Vote {
            items,
            payload: bytes,
            ..
        } => {
            header.push('@');
            header.push_str(&items.join("#"));
            payload = bytes;
        }
        Message::VoteResponse {
            participant,
            approve,
            ..
        } => {
            header.push('@');
            header.push_str(participant);
            header.push_str(if *approve { "#1" } else { "#0" });
        }
        Message::Ack { participant, .. } => {
            header.push('@');
            header.push_str(participant);
        }
        Message::Exec { .. } | Message::Abort { .. } => {}
    }

    let mut buf = BytesMut::with_capacity(header.len() + 1 + payload.len());
    buf.put_slice(header.as_bytes());
    buf.put_u8(SEPARATOR);
    buf.put_slice(payload);
    buf.freeze()
}

pub fn decode(body: &Bytes) -> Result<Message, Report<CodecError>> {
    let sep = body
        .iter()
        .position(|&b| b == SEPARATOR)
        .ok_or_else(|| Report::new(CodecError).attach("missing header separator"))?;

    let header = std::str::from_utf8(&body[..sep])
        .change_context(CodecError)
        .attach("header is not UTF-8")?;
    let payload = body.slice(sep + 1..);

    let (code, rest) = header
        .split_once('!')
        .ok_or_else(|| Report::new(CodecError).attach(format!("no type code in {header:?}")))?;
    let kind = MessageKind::from_code(code)
        .ok_or_else(|| Report::new(CodecError).attach(format!("unknown type code {code:?}")))?;

    let (artifact, fields) = match rest.split_once('@') {
        Some((artifact, fields)) => (artifact.to_owned(), Some(fields)),
        None => (rest.to_owned(), None),
    };
    let missing = || Report::new(CodecError).attach(format!("{kind} without fields: {header:?}"));

    let message = match kind {
        MessageKind::Vote => {
            let fields = fields.ok_or_else(missing)?;
            let items = if fields.is_empty() {
                Vec::new()
            } else {
                fields.split('#').map(str::to_owned).collect()
            };
            Message::Vote {
                artifact,
                items,
                payload,
            }
        }
        MessageKind::VoteResponse => {
            let (participant, vote) = fields.and_then(|f| f.split_once('#')).ok_or_else(missing)?;
            let approve = match vote {
                "1" => true,
                "0" => false,
                other => {
                    return Err(Report::new(CodecError)
                        .attach(format!("vote result must be 0 or 1, got {other:?}")));
                }
            };
            Message::VoteResponse {
                artifact,
                participant: participant.to_owned(),
                approve,
            }
        }
        MessageKind::Ack => Message::Ack {
            artifact,
            participant: fields.ok_or_else(missing)?.to_owned(),
        },
        MessageKind::Exec => Message::Exec { artifact },
        MessageKind::Abort => Message::Abort { artifact },
    };

    Ok(message)
}
