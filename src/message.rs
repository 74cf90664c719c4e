//! Byte collections with cheap protocol operations.
//!
//! [`Message`] is the buffer currency of the crate: segment payloads,
//! queue entries, and fully encoded segments are all messages. A message is
//! a rope of shared [`Chunk`]s, so the operations a TCP needs constantly —
//! prepending a header, stripping a header or trailer, splitting off a
//! prefix, and cloning a byte range into another buffer — adjust chunk
//! windows instead of copying payload bytes.

use std::collections::VecDeque;
use std::fmt;

mod chunk;
pub use chunk::Chunk;

mod message_bytes;
pub use message_bytes::MessageBytes;

/// A byte sequence assembled from shared chunks.
#[derive(Debug, Clone, Default)]
pub struct Message {
    chunks: VecDeque<Chunk>,
    len: usize,
}

impl Message {
    /// Creates a message with the given body.
    pub fn new(body: impl Into<Chunk>) -> Self {
        let body = body.into();
        let len = body.len();
        let mut chunks = VecDeque::new();
        if len > 0 {
            chunks.push_back(body);
        }
        Self { chunks, len }
    }

    /// Creates a message with no bytes.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Prepends `header` to the message.
    pub fn header(&mut self, header: impl Into<Chunk>) {
        let header = header.into();
        if header.is_empty() {
            return;
        }
        self.len += header.len();
        self.chunks.push_front(header);
    }

    /// Appends all of `other` to the message.
    pub fn concatenate(&mut self, other: Message) {
        self.len += other.len;
        self.chunks.extend(other.chunks);
    }

    /// Removes the first `len` bytes.
    pub fn remove_front(&mut self, len: usize) {
        assert!(len <= self.len);
        self.len -= len;

        let mut to_remove = len;
        while to_remove > 0 {
            let head = self.chunks.front_mut().expect("message shorter than its length");
            if head.len() <= to_remove {
                to_remove -= head.len();
                self.chunks.pop_front();
            } else {
                head.start += to_remove;
                break;
            }
        }
    }

    /// Removes the last `len` bytes.
    pub fn remove_back(&mut self, len: usize) {
        assert!(len <= self.len);
        self.len -= len;

        let mut to_remove = len;
        while to_remove > 0 {
            let tail = self.chunks.back_mut().expect("message shorter than its length");
            if tail.len() <= to_remove {
                to_remove -= tail.len();
                self.chunks.pop_back();
            } else {
                tail.end -= to_remove;
                break;
            }
        }
    }

    /// Shortens the message to at most `len` bytes, dropping the excess from
    /// the back.
    pub fn truncate(&mut self, len: usize) {
        if len < self.len {
            self.remove_back(self.len - len);
        }
    }

    /// Splits off and returns the first `len` bytes, leaving the remainder
    /// in place.
    pub fn cut(&mut self, len: usize) -> Message {
        assert!(len <= self.len);
        self.len -= len;

        let mut cut = Message::empty();
        cut.len = len;

        let mut to_take = len;
        while to_take > 0 {
            let head = self.chunks.front_mut().expect("message shorter than its length");
            if head.len() <= to_take {
                to_take -= head.len();
                cut.chunks.push_back(self.chunks.pop_front().unwrap());
            } else {
                cut.chunks.push_back(head.window(0, to_take));
                head.start += to_take;
                break;
            }
        }
        cut
    }

    /// Appends `len` bytes of `source`, starting at `offset`, to this
    /// message. The bytes are shared, not copied.
    pub fn append_cloned(&mut self, source: &Message, offset: usize, len: usize) {
        assert!(offset + len <= source.len);

        let mut skip = offset;
        let mut to_take = len;
        for chunk in &source.chunks {
            if to_take == 0 {
                break;
            }
            if chunk.len() <= skip {
                skip -= chunk.len();
                continue;
            }
            let take = (chunk.len() - skip).min(to_take);
            self.chunks.push_back(chunk.window(skip, skip + take));
            self.len += take;
            to_take -= take;
            skip = 0;
        }
    }

    /// Iterates over every byte of the message.
    pub fn iter(&self) -> MessageBytes<'_> {
        MessageBytes::new(self.chunks.iter(), self.len)
    }

    /// Copies the message into a fresh `Vec`.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.len);
        for chunk in &self.chunks {
            bytes.extend_from_slice(chunk.as_slice());
        }
        bytes
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.iter().eq(other.iter())
    }
}

impl Eq for Message {}

impl From<Vec<u8>> for Message {
    fn from(bytes: Vec<u8>) -> Self {
        Message::new(bytes)
    }
}

impl From<&[u8]> for Message {
    fn from(bytes: &[u8]) -> Self {
        Message::new(bytes)
    }
}

impl<const N: usize> From<[u8; N]> for Message {
    fn from(bytes: [u8; N]) -> Self {
        Message::new(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic() {
        let message = Message::new(b"body");
        assert_eq!(message.len(), 4);
        assert_eq!(message.to_vec(), b"body");
        assert!(Message::empty().is_empty());
    }

    #[test]
    fn header_and_remove_front() {
        let mut message = Message::new(b"body");
        message.header(b"header".as_slice());
        assert_eq!(message.to_vec(), b"headerbody");

        message.remove_front(6);
        assert_eq!(message.to_vec(), b"body");

        // removal crossing a chunk boundary
        let mut message = Message::new(b"body");
        message.header(b"hd".as_slice());
        message.remove_front(4);
        assert_eq!(message.to_vec(), b"dy");
    }

    #[test]
    fn remove_back_and_truncate() {
        let mut message = Message::new(b"stuff");
        message.header(b"things and ".as_slice());
        message.remove_back(3);
        assert_eq!(message.to_vec(), b"things and st");

        message.truncate(6);
        assert_eq!(message.to_vec(), b"things");
        message.truncate(100);
        assert_eq!(message.to_vec(), b"things");
        message.truncate(0);
        assert!(message.is_empty());
    }

    #[test]
    fn cut_splits_without_copying() {
        let mut tail = Message::new(b", world");
        tail.header(b"Hello".as_slice());
        let head = tail.cut(5);
        assert_eq!(head.to_vec(), b"Hello");
        assert_eq!(tail.to_vec(), b", world");

        let mut message = Message::new(b"abcdef");
        let head = message.cut(2);
        assert_eq!(head.to_vec(), b"ab");
        assert_eq!(message.to_vec(), b"cdef");
    }

    #[test]
    fn append_cloned_shares_ranges() {
        let mut source = Message::new(b" and stuff");
        source.header(b"things".as_slice());

        let mut out = Message::empty();
        out.append_cloned(&source, 4, 7);
        assert_eq!(out.to_vec(), b"gs and ");
        assert_eq!(source.len(), 16);

        out.append_cloned(&source, 0, 2);
        assert_eq!(out.to_vec(), b"gs and th");
    }

    #[test]
    fn iterator_crosses_chunks() {
        let mut message = Message::new(b"cd");
        message.header(b"ab".as_slice());
        message.concatenate(Message::new(b"ef"));
        assert!(message.iter().eq(b"abcdef".iter().copied()));
        assert_eq!(message.iter().len(), 6);
    }
}
