use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::proxy::StreamStatus;

/// One unit of stream data, immutable once published. A chunk with a
/// `status` is terminal: it is the last chunk of the stream and is never
/// evicted from the buffer.
#[derive(Debug)]
pub struct StreamChunk {
    pub seq: u64,
    pub data: Bytes,
    pub timestamp: DateTime<Utc>,
    pub status: Option<StreamStatus>,
}

/// What a reader gets out of the buffer.
pub enum ReadOutcome {
    Chunk(Arc<StreamChunk>),
    Terminal(StreamStatus),
}

/// A reader's logical position: the sequence number of the next chunk to
/// deliver. Lapped readers are skipped forward to the oldest retained chunk.
pub struct ReaderCursor {
    pos: u64,
    lag_count: u64,
}

impl ReaderCursor {
    pub fn lag_count(&self) -> u64 {
        self.lag_count
    }
}

struct BufferState {
    /// Retained window, oldest first. Sequences are contiguous.
    slots: VecDeque<Arc<StreamChunk>>,
    next_seq: u64,
    terminal: Option<Arc<StreamChunk>>,
}

/// Bounded single-writer multi-reader chunk ring.
///
/// The writer never blocks on readers: once `capacity` chunks are retained,
/// publishing evicts the oldest chunk and any reader still pointing at it
/// skips forward on its next read. A lapped chunk is freed when the last
/// reference to it drops.
pub struct StreamBuffer {
    capacity: usize,
    state: Mutex<BufferState>,
    publish_tx: watch::Sender<u64>,
}

impl StreamBuffer {
    pub fn new(capacity: usize) -> Self {
        let (publish_tx, _) = watch::channel(0);
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(BufferState {
                slots: VecDeque::new(),
                next_seq: 0,
                terminal: None,
            }),
            publish_tx,
        }
    }

    /// Publish a data chunk. Returns the assigned sequence, or `None` once a
    /// terminal chunk exists (the stream is over, late data is dropped).
    pub fn write(&self, data: Bytes) -> Option<u64> {
        let seq = {
            let mut state = self.state.lock().unwrap();
            if state.terminal.is_some() {
                return None;
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.slots.push_back(Arc::new(StreamChunk {
                seq,
                data,
                timestamp: Utc::now(),
                status: None,
            }));
            if state.slots.len() > self.capacity {
                state.slots.pop_front();
            }
            seq
        };
        self.publish_tx.send_replace(seq);
        Some(seq)
    }

    /// Publish the terminal chunk. Only the first terminal wins.
    pub fn write_terminal(&self, status: StreamStatus) -> bool {
        let seq = {
            let mut state = self.state.lock().unwrap();
            if state.terminal.is_some() {
                return false;
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.terminal = Some(Arc::new(StreamChunk {
                seq,
                data: Bytes::new(),
                timestamp: Utc::now(),
                status: Some(status),
            }));
            seq
        };
        self.publish_tx.send_replace(seq);
        true
    }

    /// New readers start at the oldest retained chunk so they catch up on
    /// the buffered window.
    pub fn subscribe(&self) -> ReaderCursor {
        let state = self.state.lock().unwrap();
        let pos = state
            .slots
            .front()
            .map(|chunk| chunk.seq)
            .or_else(|| state.terminal.as_ref().map(|t| t.seq))
            .unwrap_or(state.next_seq);
        ReaderCursor { pos, lag_count: 0 }
    }

    /// Next chunk at or after the cursor, waiting for the writer when the
    /// cursor is ahead of everything published.
    pub async fn read(&self, cursor: &mut ReaderCursor) -> ReadOutcome {
        let mut publish_rx = self.publish_tx.subscribe();
        loop {
            {
                let state = self.state.lock().unwrap();
                if let Some(front) = state.slots.front() {
                    if cursor.pos < front.seq {
                        cursor.lag_count += front.seq - cursor.pos;
                        cursor.pos = front.seq;
                    }
                }
                if let (Some(front), Some(back)) = (state.slots.front(), state.slots.back()) {
                    if cursor.pos <= back.seq {
                        let chunk = state.slots[(cursor.pos - front.seq) as usize].clone();
                        cursor.pos += 1;
                        return ReadOutcome::Chunk(chunk);
                    }
                }
                if let Some(terminal) = &state.terminal {
                    if cursor.pos >= terminal.seq {
                        // Status is always present on the terminal chunk.
                        return ReadOutcome::Terminal(terminal.status.unwrap_or(StreamStatus::Eof));
                    }
                }
            }
            if publish_rx.changed().await.is_err() {
                return ReadOutcome::Terminal(StreamStatus::ServerError);
            }
        }
    }

    /// Drop all retained chunks and the terminal marker, ready for a fresh
    /// writer. Callers must ensure no reader is still mid-stream.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.slots.clear();
        state.terminal = None;
        state.next_seq = 0;
    }

    pub fn retained(&self) -> usize {
        self.state.lock().unwrap().slots.len()
    }

    pub fn has_terminal(&self) -> bool {
        self.state.lock().unwrap().terminal.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sequences_are_strictly_increasing() {
        let buffer = StreamBuffer::new(8);
        let mut cursor = buffer.subscribe();
        for i in 0..5u8 {
            buffer.write(Bytes::from(vec![i]));
        }
        let mut last = None;
        for _ in 0..5 {
            match buffer.read(&mut cursor).await {
                ReadOutcome::Chunk(chunk) => {
                    if let Some(prev) = last {
                        assert!(chunk.seq > prev);
                    }
                    assert!(chunk.timestamp <= Utc::now());
                    last = Some(chunk.seq);
                }
                ReadOutcome::Terminal(_) => panic!("unexpected terminal"),
            }
        }
    }

    #[tokio::test]
    async fn late_subscriber_starts_at_oldest_retained() {
        let buffer = StreamBuffer::new(3);
        for i in 0..5u8 {
            buffer.write(Bytes::from(vec![i]));
        }
        let mut cursor = buffer.subscribe();
        match buffer.read(&mut cursor).await {
            ReadOutcome::Chunk(chunk) => assert_eq!(chunk.seq, 2),
            ReadOutcome::Terminal(_) => panic!("unexpected terminal"),
        }
    }

    #[tokio::test]
    async fn lapped_reader_skips_forward() {
        let buffer = StreamBuffer::new(3);
        buffer.write(Bytes::from_static(b"0"));
        let mut cursor = buffer.subscribe();
        for i in 1..6u8 {
            buffer.write(Bytes::from(vec![i]));
        }
        // Chunks 0..2 are gone; the reader lands on 3 without reordering.
        match buffer.read(&mut cursor).await {
            ReadOutcome::Chunk(chunk) => assert_eq!(chunk.seq, 3),
            ReadOutcome::Terminal(_) => panic!("unexpected terminal"),
        }
        assert_eq!(cursor.lag_count(), 3);
    }

    #[tokio::test]
    async fn writer_never_blocks_and_ring_stays_bounded() {
        let buffer = StreamBuffer::new(4);
        for i in 0..100u8 {
            assert!(buffer.write(Bytes::from(vec![i])).is_some());
        }
        assert_eq!(buffer.retained(), 4);
    }

    #[tokio::test]
    async fn terminal_ends_the_stream() {
        let buffer = StreamBuffer::new(4);
        let mut cursor = buffer.subscribe();
        buffer.write(Bytes::from_static(b"data"));
        assert!(buffer.write_terminal(StreamStatus::Eof));
        // A second terminal or a late write is rejected.
        assert!(!buffer.write_terminal(StreamStatus::ServerError));
        assert!(buffer.write(Bytes::from_static(b"late")).is_none());

        match buffer.read(&mut cursor).await {
            ReadOutcome::Chunk(chunk) => assert_eq!(&chunk.data[..], b"data"),
            ReadOutcome::Terminal(_) => panic!("data should come before terminal"),
        }
        match buffer.read(&mut cursor).await {
            ReadOutcome::Terminal(status) => assert_eq!(status, StreamStatus::Eof),
            ReadOutcome::Chunk(_) => panic!("expected terminal"),
        }
        // The terminal chunk stays observable.
        match buffer.read(&mut cursor).await {
            ReadOutcome::Terminal(status) => assert_eq!(status, StreamStatus::Eof),
            ReadOutcome::Chunk(_) => panic!("expected terminal"),
        }
    }

    #[tokio::test]
    async fn blocked_reader_wakes_on_write() {
        let buffer = Arc::new(StreamBuffer::new(4));
        let reader_buffer = buffer.clone();
        let reader = tokio::spawn(async move {
            let mut cursor = reader_buffer.subscribe();
            match reader_buffer.read(&mut cursor).await {
                ReadOutcome::Chunk(chunk) => chunk.data.clone(),
                ReadOutcome::Terminal(_) => panic!("unexpected terminal"),
            }
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        buffer.write(Bytes::from_static(b"wake"));
        let data = reader.await.unwrap();
        assert_eq!(&data[..], b"wake");
    }

    #[tokio::test]
    async fn reset_clears_state() {
        let buffer = StreamBuffer::new(4);
        buffer.write(Bytes::from_static(b"x"));
        buffer.write_terminal(StreamStatus::Eof);
        buffer.reset();
        assert_eq!(buffer.retained(), 0);
        assert!(!buffer.has_terminal());
        assert_eq!(buffer.write(Bytes::from_static(b"y")), Some(0));
    }
}
