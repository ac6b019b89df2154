// Wire messages for feed blocks and data batches. Kept apart from
// crate::types, which reuses some of the same names.
pub mod wire {
    use bytes::Bytes;

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct TimeframeEntry {
        #[prost(bytes = "bytes", tag = "1")]
        pub feed_id: Bytes,
        #[prost(uint64, tag = "2")]
        pub seq: u64,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Timeframe {
        #[prost(message, repeated, tag = "1")]
        pub entries: Vec<TimeframeEntry>,
    }

    /// What is actually stored in a feed block.
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct FeedEnvelope {
        #[prost(message, optional, tag = "1")]
        pub timeframe: Option<Timeframe>,
        #[prost(bytes = "bytes", tag = "2")]
        pub payload: Bytes,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct DocUpdate {
        #[prost(string, tag = "1")]
        pub document_id: String,
        #[prost(bytes = "bytes", tag = "2")]
        pub delta: Bytes,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Batch {
        #[prost(message, repeated, tag = "1")]
        pub updates: Vec<DocUpdate>,
    }
}

use crate::error::{Error, Result};
use crate::timeframe::Timeframe;
use crate::types::{Batch, DocUpdate, FeedId, FeedMessage};
use bytes::Bytes;
use prost::Message;

/// Encode a payload together with the timeframe its writer declared
pub fn encode_feed_message(timeframe: &Timeframe, payload: Bytes) -> Bytes {
    let envelope = wire::FeedEnvelope {
        timeframe: Some(timeframe_to_proto(timeframe)),
        payload,
    };
    envelope.encode_to_vec().into()
}

/// Decode a feed block read from position `seq` of `feed_id`
pub fn decode_feed_message(feed_id: FeedId, seq: u64, block: &[u8]) -> Result<FeedMessage> {
    let envelope = wire::FeedEnvelope::decode(block)?;
    let timeframe = match envelope.timeframe.as_ref() {
        Some(proto) => proto_to_timeframe(proto)?,
        None => Timeframe::new(),
    };

    Ok(FeedMessage {
        feed_id,
        seq,
        timeframe,
        payload: envelope.payload,
    })
}

pub fn encode_batch(batch: &Batch) -> Bytes {
    let proto = wire::Batch {
        updates: batch
            .updates
            .iter()
            .map(|update| wire::DocUpdate {
                document_id: update.document_id.to_string(),
                delta: update.delta.clone(),
            })
            .collect(),
    };
    proto.encode_to_vec().into()
}

pub fn decode_batch(payload: &[u8]) -> Result<Batch> {
    let proto = wire::Batch::decode(payload)?;
    Ok(Batch {
        updates: proto
            .updates
            .into_iter()
            .map(|update| DocUpdate {
                document_id: update.document_id.into(),
                delta: update.delta,
            })
            .collect(),
    })
}

fn timeframe_to_proto(timeframe: &Timeframe) -> wire::Timeframe {
    let entries = timeframe
        .iter()
        .map(|(feed_id, seq)| wire::TimeframeEntry {
            feed_id: Bytes::copy_from_slice(feed_id.bytes()),
            seq,
        })
        .collect();

    wire::Timeframe { entries }
}

fn proto_to_timeframe(proto: &wire::Timeframe) -> Result<Timeframe> {
    let mut timeframe = Timeframe::new();
    for entry in &proto.entries {
        let feed_id =
            FeedId::from_bytes(&entry.feed_id).map_err(|e| Error::Decode(e.to_string()))?;
        timeframe.update(feed_id, entry.seq);
    }
    Ok(timeframe)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_message_carries_timeframe() {
        let timeframe = Timeframe::from_frames([(FeedId::from_u64(1), 3), (FeedId::from_u64(2), 1)]);
        let block = encode_feed_message(&timeframe, Bytes::from_static(b"payload"));

        let message = decode_feed_message(FeedId::from_u64(2), 2, &block).unwrap();
        assert_eq!(message.feed_id, FeedId::from_u64(2));
        assert_eq!(message.seq, 2);
        assert_eq!(message.timeframe, timeframe);
        assert_eq!(message.payload, Bytes::from_static(b"payload"));
    }

    #[test]
    fn test_decode_garbage_fails() {
        let result = decode_feed_message(FeedId::from_u64(1), 1, &[0xff, 0xff, 0xff]);
        assert!(matches!(result, Err(Error::Decode(_))));
        assert!(matches!(decode_batch(&[0x0a, 0x05]), Err(Error::Decode(_))));
    }

    #[test]
    fn test_bad_feed_id_in_timeframe() {
        let envelope = wire::FeedEnvelope {
            timeframe: Some(wire::Timeframe {
                entries: vec![wire::TimeframeEntry {
                    feed_id: Bytes::from_static(b"abc"),
                    seq: 1,
                }],
            }),
            payload: Bytes::new(),
        };
        let block = envelope.encode_to_vec();
        let result = decode_feed_message(FeedId::from_u64(1), 1, &block);
        assert!(matches!(result, Err(Error::Decode(_))));
    }

    #[test]
    fn test_batch_preserves_update_order() {
        let batch = Batch {
            updates: vec![
                DocUpdate {
                    document_id: "b".into(),
                    delta: Bytes::from_static(b"2"),
                },
                DocUpdate {
                    document_id: "a".into(),
                    delta: Bytes::from_static(b"1"),
                },
            ],
        };
        assert_eq!(decode_batch(&encode_batch(&batch)).unwrap(), batch);
    }
}
