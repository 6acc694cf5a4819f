//! Consumer protocol member assignment payload.
//!
//! Wire layout (big-endian):
//! ```text
//! version:     i16
//! topic_count: i32
//!   topic:     i16 length + utf8 bytes
//!   count:     i32
//!   partition: i32 * count
//! user_data:   i32 length (-1 = null) + bytes
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{KafdeskError, Result};
use crate::models::TopicAssignment;

pub const ASSIGNMENT_VERSION: i16 = 0;

pub fn decode_assignment(payload: &[u8]) -> Result<Vec<TopicAssignment>> {
    if payload.is_empty() {
        return Ok(Vec::new());
    }

    let mut buf = payload;
    let _version = read_i16(&mut buf)?;
    let topic_count = read_len(&mut buf, "topic count")?;

    let mut out = Vec::with_capacity(topic_count.min(64));
    for _ in 0..topic_count {
        let name_len = read_i16(&mut buf)?;
        if name_len < 0 {
            return Err(truncated("topic name length is negative"));
        }
        let topic = read_string(&mut buf, name_len as usize)?;

        let partition_count = read_len(&mut buf, "partition count")?;
        let mut partitions = Vec::with_capacity(partition_count.min(1024));
        for _ in 0..partition_count {
            partitions.push(read_i32(&mut buf)?);
        }
        out.push(TopicAssignment { topic, partitions });
    }

    // Trailing user data is optional in older encoders
    if buf.remaining() >= 4 {
        let user_len = buf.get_i32();
        if user_len > 0 && buf.remaining() < user_len as usize {
            return Err(truncated("user data"));
        }
    }

    Ok(out)
}

pub fn encode_assignment(assignment: &[TopicAssignment]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_i16(ASSIGNMENT_VERSION);
    buf.put_i32(assignment.len() as i32);
    for topic in assignment {
        buf.put_i16(topic.topic.len() as i16);
        buf.put_slice(topic.topic.as_bytes());
        buf.put_i32(topic.partitions.len() as i32);
        for partition in &topic.partitions {
            buf.put_i32(*partition);
        }
    }
    buf.put_i32(-1);
    buf.freeze()
}

fn read_i16(buf: &mut &[u8]) -> Result<i16> {
    if buf.remaining() < 2 {
        return Err(truncated("expected i16"));
    }
    Ok(buf.get_i16())
}

fn read_i32(buf: &mut &[u8]) -> Result<i32> {
    if buf.remaining() < 4 {
        return Err(truncated("expected i32"));
    }
    Ok(buf.get_i32())
}

fn read_len(buf: &mut &[u8], what: &str) -> Result<usize> {
    let len = read_i32(buf)?;
    if len < 0 {
        return Err(truncated(&format!("{} is negative", what)));
    }
    Ok(len as usize)
}

fn read_string(buf: &mut &[u8], len: usize) -> Result<String> {
    if buf.remaining() < len {
        return Err(truncated("topic name"));
    }
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).map_err(|_| KafdeskError::Validation("Member assignment topic is not UTF-8".to_string()))
}

fn truncated(detail: &str) -> KafdeskError {
    KafdeskError::Validation(format!("Malformed member assignment: {}", detail))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_two_topics() {
        let assignment = vec![
            TopicAssignment { topic: "orders".to_string(), partitions: vec![0, 2] },
            TopicAssignment { topic: "payments".to_string(), partitions: vec![1] },
        ];
        let payload = encode_assignment(&assignment);
        assert_eq!(decode_assignment(&payload).unwrap(), assignment);
    }

    #[test]
    fn test_decode_handcrafted_payload() {
        // version 1, one topic "t" with partitions [3], null user data
        let payload: Vec<u8> = vec![
            0, 1, // version
            0, 0, 0, 1, // topics
            0, 1, b't', // name
            0, 0, 0, 1, // partitions
            0, 0, 0, 3, // partition 3
            0xFF, 0xFF, 0xFF, 0xFF, // user data: null
        ];
        let decoded = decode_assignment(&payload).unwrap();
        assert_eq!(decoded, vec![TopicAssignment { topic: "t".to_string(), partitions: vec![3] }]);
    }

    #[test]
    fn test_empty_payload_means_no_assignment() {
        assert!(decode_assignment(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_truncated_payload_is_rejected() {
        let payload = encode_assignment(&[TopicAssignment { topic: "orders".to_string(), partitions: vec![0, 1, 2] }]);
        let cut = &payload[..payload.len() - 10];
        let err = decode_assignment(cut).unwrap_err();
        assert_eq!(err.kind(), "VALIDATION");
    }
}
