//! An ordered, gap-tolerant store of byte ranges keyed by sequence number.
//!
//! The same structure backs both directions of a connection: the receive
//! side reassembles out-of-order segments into a deliverable prefix, and the
//! send side keeps unacknowledged bytes around for retransmission. Entries
//! are kept strictly ordered and non-overlapping; overlapping inserts are
//! trimmed or dropped on the way in, because some peers send known data when
//! probing the window.
//!
//! `max_bytes` is a soft limit: it bounds what the window logic will accept,
//! not what the queue will retain, so `used()` may exceed it temporarily
//! after the cap is lowered.

use crate::errors::TcpError;
use crate::message::Message;
use crate::seq::Seq;
use std::collections::VecDeque;

#[derive(Debug)]
struct Entry {
    sequence: Seq,
    data: Message,
}

impl Entry {
    fn end(&self) -> Seq {
        self.sequence + self.data.len() as u32
    }
}

/// A sequence-addressed segment queue.
#[derive(Debug)]
pub struct BufferQueue {
    entries: VecDeque<Entry>,
    max_bytes: usize,
    num_bytes: usize,
    contiguous_bytes: usize,
    first_sequence: Seq,
    last_sequence: Seq,
    push_pointer: Seq,
}

impl BufferQueue {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_bytes,
            num_bytes: 0,
            contiguous_bytes: 0,
            first_sequence: Seq::ZERO,
            last_sequence: Seq::ZERO,
            push_pointer: Seq::ZERO,
        }
    }

    /// Adjusts the soft byte budget. Never discards retained data.
    pub fn set_max_bytes(&mut self, max_bytes: usize) {
        self.max_bytes = max_bytes;
    }

    /// Anchors the queue at `sequence`. Only valid while the queue is empty.
    pub fn set_initial_sequence(&mut self, sequence: Seq) {
        debug_assert!(self.entries.is_empty());
        self.first_sequence = sequence;
        self.last_sequence = sequence;
    }

    /// Appends `data` at the current end of the queue.
    pub fn add_back(&mut self, data: Message) {
        let sequence = self.last_sequence;
        self.add(data, sequence);
    }

    /// Inserts `data` labeled with `sequence`, resolving any overlap with
    /// what the queue already holds.
    pub fn add(&mut self, mut data: Message, mut sequence: Seq) {
        if sequence + data.len() as u32 <= self.first_sequence || data.is_empty() {
            // nothing in this buffer is of interest anymore
            return;
        }
        if sequence < self.first_sequence {
            data.remove_front((self.first_sequence - sequence) as usize);
            sequence = self.first_sequence;
        }

        if self.entries.is_empty() || sequence >= self.last_sequence {
            // the common case: data arrives in order and goes to the back
            if sequence == self.last_sequence
                && self.last_sequence - self.first_sequence == self.num_bytes as u32
            {
                self.contiguous_bytes += data.len();
            }
            self.last_sequence = sequence + data.len() as u32;
            self.num_bytes += data.len();
            self.entries.push_back(Entry { sequence, data });
            self.verify();
            return;
        }

        if self.last_sequence < sequence + data.len() as u32 {
            self.last_sequence = sequence + data.len() as u32;
        }

        // index of the first entry starting after the new data; the entry
        // before it (if any) starts at or before `sequence`
        let mut index = self
            .entries
            .iter()
            .position(|entry| entry.sequence > sequence)
            .unwrap_or(self.entries.len());

        let mut buffer = Some(data);

        if index > 0 {
            let previous_sequence = self.entries[index - 1].sequence;
            let previous_end = self.entries[index - 1].end();
            let previous_len = self.entries[index - 1].data.len();
            let mut data = buffer.take().unwrap();

            if sequence == previous_sequence {
                // some TCP implementations send known data when probing
                // the window
                if previous_len >= data.len() {
                    // we already have at least this much
                } else {
                    // the new buffer extends what we have; replace
                    let replaced = self.entries.remove(index - 1).unwrap();
                    self.num_bytes -= replaced.data.len();
                    index -= 1;
                    buffer = Some(data);
                }
            } else if previous_end >= sequence + data.len() as u32 {
                // fully covered by the predecessor
            } else if previous_end > sequence {
                // the predecessor holds the first part already
                data.remove_front((previous_end - sequence) as usize);
                sequence = previous_end;
                buffer = Some(data);
            } else {
                buffer = Some(data);
            }
        }

        loop {
            let Some(data) = buffer.as_ref() else { break };
            let data_end = sequence + data.len() as u32;
            let Some(next) = self.entries.get(index) else { break };
            if data_end <= next.sequence {
                break;
            }
            if next.end() <= data_end {
                // the new data swallows this entry
                let swallowed = self.entries.remove(index).unwrap();
                self.num_bytes -= swallowed.data.len();
            } else if next.sequence > sequence {
                // the tail of the new data is already present
                let trim = (data_end - next.sequence) as usize;
                buffer.as_mut().unwrap().remove_back(trim);
            } else {
                // everything left is already present
                buffer = None;
            }
        }

        let Some(data) = buffer else {
            self.verify();
            return;
        };

        self.num_bytes += data.len();
        self.entries.insert(index, Entry { sequence, data });

        if self.last_sequence - self.first_sequence == self.num_bytes as u32 {
            // no holes anywhere
            self.contiguous_bytes = self.num_bytes;
        } else if self.first_sequence + self.contiguous_bytes as u32 == sequence {
            // the new entry may have connected a chain of entries behind it
            while let Some(entry) = self.entries.get(index) {
                if self.first_sequence + self.contiguous_bytes as u32 != entry.sequence {
                    break;
                }
                self.contiguous_bytes += entry.data.len();
                index += 1;
            }
        }

        self.verify();
    }

    /// Drops everything below `sequence`.
    ///
    /// The removed range must lie within the contiguous region; removing
    /// through a hole would corrupt `contiguous_bytes`. The send path only
    /// ever removes acknowledged (and therefore contiguous) data.
    pub fn remove_until(&mut self, sequence: Seq) {
        if sequence < self.first_sequence {
            return;
        }

        let mut last_removed = self.first_sequence;
        loop {
            let Some(front) = self.entries.front() else { break };
            if front.sequence >= sequence {
                break;
            }
            debug_assert!(last_removed == front.sequence, "removal across a hole");

            if sequence >= front.end() {
                let entry = self.entries.pop_front().unwrap();
                self.num_bytes -= entry.data.len();
                self.contiguous_bytes -= entry.data.len();
                last_removed = entry.end();
            } else {
                let front = self.entries.front_mut().unwrap();
                let size = (sequence - front.sequence) as usize;
                front.data.remove_front(size);
                front.sequence = sequence;
                self.num_bytes -= size;
                self.contiguous_bytes -= size;
                break;
            }
        }

        self.first_sequence = match self.entries.front() {
            Some(front) => front.sequence,
            None => self.last_sequence,
        };
        self.verify();
    }

    /// Clones up to `bytes` bytes starting at `sequence` into a new message.
    /// The result is truncated to what the queue holds past `sequence`.
    pub fn get(&self, sequence: Seq, bytes: usize) -> Result<Message, TcpError> {
        if bytes == 0 {
            return Ok(Message::empty());
        }
        if sequence >= self.last_sequence || sequence < self.first_sequence {
            return Err(TcpError::Invalid);
        }
        let mut bytes_left = bytes.min((self.last_sequence - sequence) as usize);

        let mut out = Message::empty();
        for entry in &self.entries {
            if bytes_left == 0 {
                break;
            }
            if sequence >= entry.end() {
                continue;
            }
            let offset = if sequence > entry.sequence {
                (sequence - entry.sequence) as usize
            } else {
                0
            };
            let size = (entry.data.len() - offset).min(bytes_left);
            out.append_cloned(&entry.data, offset, size);
            bytes_left -= size;
        }
        Ok(out)
    }

    /// Takes up to `min(bytes, available())` bytes from the head of the
    /// contiguous prefix. With `remove` the bytes leave the queue; without
    /// it they are cloned. Returns an empty message when nothing is
    /// available.
    pub fn get_front(&mut self, bytes: usize, remove: bool) -> Message {
        let bytes = bytes.min(self.available());
        let mut out = Message::empty();
        if bytes == 0 {
            return out;
        }

        if remove {
            let mut left = bytes;
            while left > 0 {
                let take_whole = self.entries.front().unwrap().data.len() <= left;
                if take_whole {
                    let entry = self.entries.pop_front().unwrap();
                    left -= entry.data.len();
                    out.concatenate(entry.data);
                } else {
                    let front = self.entries.front_mut().unwrap();
                    out.concatenate(front.data.cut(left));
                    front.sequence += left as u32;
                    left = 0;
                }
            }
            self.first_sequence += bytes as u32;
            self.num_bytes -= bytes;
            self.contiguous_bytes -= bytes;
        } else {
            let mut left = bytes;
            for entry in &self.entries {
                if left == 0 {
                    break;
                }
                let size = entry.data.len().min(left);
                out.append_cloned(&entry.data, 0, size);
                left -= size;
            }
        }

        self.verify();
        out
    }

    /// Bytes deliverable from the head of the queue with no gap.
    pub fn available(&self) -> usize {
        self.contiguous_bytes
    }

    /// Bytes contiguously available from `sequence` onward.
    pub fn available_from(&self, sequence: Seq) -> usize {
        if sequence > self.first_sequence + self.contiguous_bytes as u32 {
            return 0;
        }
        (self.first_sequence + self.contiguous_bytes as u32 - sequence) as usize
    }

    pub fn used(&self) -> usize {
        self.num_bytes
    }

    /// Room left under the soft cap.
    pub fn free(&self) -> usize {
        self.max_bytes.saturating_sub(self.num_bytes)
    }

    pub fn size(&self) -> usize {
        self.max_bytes
    }

    pub fn is_contiguous(&self) -> bool {
        self.num_bytes == self.contiguous_bytes
    }

    pub fn first_sequence(&self) -> Seq {
        self.first_sequence
    }

    pub fn last_sequence(&self) -> Seq {
        self.last_sequence
    }

    /// The sequence just past the contiguous prefix; on the receive side
    /// this is the next expected sequence number.
    pub fn next_sequence(&self) -> Seq {
        self.first_sequence + self.contiguous_bytes as u32
    }

    /// Records the current end of the queue as the push boundary.
    pub fn set_push_pointer(&mut self) {
        self.push_pointer = match self.entries.back() {
            Some(back) => back.end(),
            None => Seq::ZERO,
        };
    }

    /// Pushed bytes still waiting in the queue; zero when no push boundary
    /// is set or the boundary has been consumed.
    pub fn pushed_data(&self) -> usize {
        // the explicit zero check matters: zero means "unset", and the
        // modular comparison alone cannot tell that apart
        if self.push_pointer != Seq::ZERO && self.push_pointer > self.first_sequence {
            (self.push_pointer - self.first_sequence) as usize
        } else {
            0
        }
    }

    /// Walks the entries and checks every queue invariant. Debug builds run
    /// this after each mutation.
    #[cfg(debug_assertions)]
    fn verify(&self) {
        if self.entries.is_empty() {
            assert_eq!(self.num_bytes, 0);
            assert_eq!(self.contiguous_bytes, 0);
            return;
        }

        let mut num_bytes = 0;
        let mut contiguous_bytes = 0;
        let mut contiguous = true;
        let mut last = self.first_sequence;

        for entry in &self.entries {
            if contiguous && entry.sequence == last {
                contiguous_bytes += entry.data.len();
            } else {
                contiguous = false;
            }

            assert!(last <= entry.sequence, "entries out of order");
            assert!(!entry.data.is_empty(), "empty entry stored");

            num_bytes += entry.data.len();
            last = entry.end();
        }

        assert!(last == self.last_sequence, "last entry does not end the queue");
        assert_eq!(contiguous_bytes, self.contiguous_bytes);
        assert_eq!(num_bytes, self.num_bytes);
    }

    #[cfg(not(debug_assertions))]
    fn verify(&self) {}
}
