//! JSON encoding of [`Message`]s.

use crate::message::Message;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid message: {0}")]
    Invalid(String),
}

pub fn encode(message: &Message) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(message)?)
}

/// Decode and validate one message.
pub fn decode(bytes: &[u8]) -> Result<Message, CodecError> {
    let message: Message = serde_json::from_slice(bytes)?;
    message.validate().map_err(CodecError::Invalid)?;
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{BatchPayload, Envelope, MessageBody, MessageType};
    use crate::state::{LastWriteWinState, Receipt};
    use mergebox_common::{Document, DocumentId};

    fn envelope() -> Envelope {
        Envelope {
            collection: "users".into(),
            user_name: "alice".into(),
            origin: "a".into(),
            tenant: None,
        }
    }

    #[test]
    fn test_batch_message_survives_encoding() {
        let mut feed = LastWriteWinState::new();
        let mut doc = Document::new().with("name", "ann").with("age", 31i64);
        doc.set_id(DocumentId::from_raw(77));
        doc.set_last_modified(1_000);
        feed.changes.push(doc);
        feed.tombstones.insert("78".into(), 1_001.into());

        let receipt = Receipt::of(&feed);
        let msg = envelope().wrap(
            "txn",
            MessageBody::BatchChangeStart(BatchPayload {
                feed,
                start_time: 0,
                end_time: 2_000,
                next_offset: 2,
                batch_size: 10,
                receipt: receipt.clone(),
            }),
        );

        let bytes = encode(&msg).unwrap();
        let back = decode(&bytes).unwrap();
        assert_eq!(back, msg);
        match back.body {
            MessageBody::BatchChangeStart(p) => assert_eq!(Receipt::of(&p.feed), receipt),
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(matches!(decode(b"not json"), Err(CodecError::Json(_))));
    }

    #[test]
    fn test_mismatched_header_is_invalid() {
        let mut msg = envelope().wrap("t", MessageBody::Disconnect);
        msg.header.message_type = MessageType::BatchAck;
        let bytes = encode(&msg).unwrap();
        assert!(matches!(decode(&bytes), Err(CodecError::Invalid(_))));
    }
}
