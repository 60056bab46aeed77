// Copyright 2025 Oxide Computer Company
//! Server-side receive buffer pool.
//!
//! Inbound requests land in a fixed-size buffer kept "posted" for the
//! transport; each buffer absorbs several back-to-back requests before it
//! is exhausted and recycled into a bounded history ring (kept for
//! duplicate-hunting and debugging, not correctness).  Request views hand
//! out reference-counted slices of the underlying allocation, so a
//! buffer's memory lives exactly as long as the last request still looking
//! at it, independent of pool bookkeeping.
//!
//! Pool low-water refill: when available-for-posting buffers drop below
//! half a group, the pool grows by one more group; if it cannot grow any
//! further, already-posted buffers keep the service alive and the pool
//! logs pressure.

use bytes::{Bytes, BytesMut};
use ringbuffer::{AllocRingBuffer, RingBuffer};
use slog::{o, warn, Logger};
use tokio::time::Instant;
use uuid::Uuid;

use talus_protocol::{Opcode, RequestHeader};

/// Hard ceiling on pool growth.
const MAX_BUFFER_GROUPS: usize = 16;

/// Retired buffers kept for debugging.
const HISTORY_CAPACITY: usize = 128;

/// One inbound request, decoupled from the buffer it arrived in: `body`
/// holds a reference-counted view of the buffer's allocation.
#[derive(Debug)]
pub struct IncomingRequest {
    pub export: Uuid,
    pub header: RequestHeader,
    pub body: Bytes,
    pub buffer_id: u64,
    pub received_at: Instant,
}

#[derive(Debug)]
struct PostedBuffer {
    id: u64,
    buf: BytesMut,
    requests: usize,
    opcodes: Vec<Opcode>,
}

#[derive(Debug)]
struct RetiredBuffer {
    id: u64,
    requests: usize,
    opcodes: Vec<Opcode>,
}

#[derive(Debug)]
pub struct BufferPool {
    buffers_per_group: usize,
    buffer_size: usize,
    /// Buffers available for posting.
    idle: Vec<PostedBuffer>,
    /// The buffer currently receiving requests.
    posted: PostedBuffer,
    groups: usize,
    history: AllocRingBuffer<RetiredBuffer>,
    next_id: u64,
    log: Logger,
}

impl BufferPool {
    pub fn new(
        buffers_per_group: usize,
        buffer_size: usize,
        log: &Logger,
    ) -> BufferPool {
        assert!(buffers_per_group >= 1);
        let log = log.new(o!("" => "buffer pool"));
        let mut pool = BufferPool {
            buffers_per_group,
            buffer_size,
            idle: Vec::new(),
            posted: PostedBuffer {
                id: 1,
                buf: BytesMut::with_capacity(buffer_size),
                requests: 0,
                opcodes: Vec::new(),
            },
            groups: 1,
            history: AllocRingBuffer::new(HISTORY_CAPACITY),
            next_id: 1,
            log,
        };
        for _ in 1..buffers_per_group {
            let b = pool.fresh_buffer();
            pool.idle.push(b);
        }
        pool
    }

    fn fresh_buffer(&mut self) -> PostedBuffer {
        self.next_id += 1;
        PostedBuffer {
            id: self.next_id,
            buf: BytesMut::with_capacity(self.buffer_size),
            requests: 0,
            opcodes: Vec::new(),
        }
    }

    /// Receive one request into the posted buffer, producing an
    /// independent view of it.
    pub fn ingest(
        &mut self,
        export: Uuid,
        header: RequestHeader,
        payload: &[u8],
        now: Instant,
    ) -> IncomingRequest {
        if self.posted.buf.capacity() < payload.len() {
            self.retire_and_post();
        }

        self.posted.requests += 1;
        self.posted.opcodes.push(header.opcode);
        self.posted.buf.extend_from_slice(payload);
        // Hand out the filled region; the remaining capacity of the same
        // allocation keeps receiving.
        let body = self.posted.buf.split().freeze();

        IncomingRequest {
            export,
            header,
            body,
            buffer_id: self.posted.id,
            received_at: now,
        }
    }

    /// Exhausted buffer: record it in the history ring and post a
    /// replacement.
    fn retire_and_post(&mut self) {
        self.maybe_grow();
        let replacement = match self.idle.pop() {
            Some(b) => b,
            None => self.fresh_buffer(),
        };
        let old = std::mem::replace(&mut self.posted, replacement);
        self.history.push(RetiredBuffer {
            id: old.id,
            requests: old.requests,
            opcodes: old.opcodes,
        });
    }

    fn maybe_grow(&mut self) {
        if self.idle.len() >= self.buffers_per_group / 2 {
            return;
        }
        if self.groups >= MAX_BUFFER_GROUPS {
            warn!(
                self.log,
                "buffer pool at maximum ({} groups), serving under pressure",
                self.groups
            );
            return;
        }
        self.groups += 1;
        for _ in 0..self.buffers_per_group {
            let b = self.fresh_buffer();
            self.idle.push(b);
        }
    }

    pub fn groups(&self) -> usize {
        self.groups
    }

    pub fn idle_buffers(&self) -> usize {
        self.idle.len()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Total requests recorded in the retired-buffer history.
    pub fn history_requests(&self) -> usize {
        self.history.iter().map(|r| r.requests).sum()
    }
}
