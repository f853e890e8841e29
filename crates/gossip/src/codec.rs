//! Length-prefixed frame codec.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::GossipError;

pub const MAX_MESSAGE_SIZE: usize = 8 * 1_024 * 1_024;

const LENGTH_PREFIX: usize = 4;

/// One raw frame on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub data: Vec<u8>,
}

/// Frames are a `u32` big-endian length followed by that many bytes.
#[derive(Clone, Copy, Debug)]
pub struct MessageCodec {
    max_size: usize,
}

impl MessageCodec {
    #[must_use]
    pub const fn new(max_size: usize) -> Self {
        Self { max_size }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = GossipError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.data.len() > self.max_size {
            return Err(GossipError::FrameTooLarge(item.data.len()));
        }

        dst.reserve(LENGTH_PREFIX + item.data.len());
        dst.put_u32(item.data.len() as u32);
        dst.put_slice(&item.data);

        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = GossipError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let mut length_bytes = [0; LENGTH_PREFIX];
        length_bytes.copy_from_slice(&src[..LENGTH_PREFIX]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > self.max_size {
            return Err(GossipError::FrameTooLarge(length));
        }

        if src.len() < LENGTH_PREFIX + length {
            src.reserve(LENGTH_PREFIX + length - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX);
        let data = src.split_to(length).to_vec();

        Ok(Some(Message { data }))
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;
    use tokio_test::io::Builder;
    use tokio_util::codec::FramedRead;

    use super::*;

    #[test]
    fn test_encoding_decoding() {
        let request = Message {
            data: "Hello".bytes().collect(),
        };
        let response = Message {
            data: "World".bytes().collect(),
        };

        let mut buffer = BytesMut::new();
        let mut codec = MessageCodec::new(MAX_MESSAGE_SIZE);
        codec.encode(request.clone(), &mut buffer).unwrap();
        codec.encode(response.clone(), &mut buffer).unwrap();

        let decoded_request = codec.decode(&mut buffer).unwrap();
        assert_eq!(decoded_request, Some(request));

        let decoded_response = codec.decode(&mut buffer).unwrap();
        assert_eq!(decoded_response, Some(response));
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let message = Message {
            data: vec![0xaa; 64],
        };

        let mut buffer = BytesMut::new();
        let mut codec = MessageCodec::new(MAX_MESSAGE_SIZE);
        codec.encode(message.clone(), &mut buffer).unwrap();

        let mut partial = buffer.split_to(10);
        assert_eq!(codec.decode(&mut partial).unwrap(), None);

        partial.unsplit(buffer);
        assert_eq!(codec.decode(&mut partial).unwrap(), Some(message));
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut codec = MessageCodec::new(16);

        let mut buffer = BytesMut::new();
        let oversized = Message {
            data: vec![0; 17],
        };
        assert!(matches!(
            codec.encode(oversized, &mut buffer),
            Err(GossipError::FrameTooLarge(17))
        ));

        // A forged oversized length prefix fails on decode too.
        let mut forged = BytesMut::new();
        forged.put_u32(1_000_000);
        assert!(matches!(
            codec.decode(&mut forged),
            Err(GossipError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_multiple_objects_stream() {
        let request = Message {
            data: "Hello".bytes().collect(),
        };
        let response = Message {
            data: "World".bytes().collect(),
        };

        let mut buffer = BytesMut::new();
        let mut codec = MessageCodec::new(MAX_MESSAGE_SIZE);
        codec.encode(request.clone(), &mut buffer).unwrap();
        codec.encode(response.clone(), &mut buffer).unwrap();

        let mut stream = Builder::new().read(&buffer.freeze()).build();
        let mut framed = FramedRead::new(&mut stream, MessageCodec::new(MAX_MESSAGE_SIZE));

        let decoded_request = framed.next().await.unwrap().unwrap();
        assert_eq!(decoded_request, request);

        let decoded_response = framed.next().await.unwrap().unwrap();
        assert_eq!(decoded_response, response);

        let decoded3 = framed.next().await;
        assert!(decoded3.is_none());
    }
}
