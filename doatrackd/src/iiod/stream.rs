use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::iiod::binary::{self, Opcode};
use crate::iiod::{Session, Transport};

/// Server-side buffer handle: groups the enabled channels of one device.
pub struct Buffer {
    pub id: u16,
    pub dev: u8,
    pub channels: Vec<u32>,
    pub cyclic: bool,
    next_block_id: u16,
}

/// Fixed-size transfer unit within a buffer. The in-flight counter guards
/// against freeing a block the server is still filling.
pub struct Block {
    pub id: u16,
    pub buffer_id: u16,
    pub dev: u8,
    pub size: u64,
    in_flight: AtomicU32,
}

impl Block {
    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }

    fn begin_transfer(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    fn end_transfer(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    /// CREATE_BLOCK/TRANSFER_BLOCK code: low half buffer id, high half
    /// block id.
    fn code(&self) -> i32 {
        ((self.id as i32) << 16) | self.buffer_id as i32
    }
}

impl Session {
    /// Allocate a server-side buffer over the given channel indexes.
    /// Streaming requires the binary transport.
    pub async fn create_buffer(
        &mut self,
        dev: u8,
        channels: &[u32],
        cyclic: bool,
    ) -> Result<Buffer> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        if self.transport() != Transport::Binary {
            return Err(Error::BinaryOnly);
        }
        if channels.is_empty() {
            return Err(Error::Config(
                "streaming buffer needs at least one channel".into(),
            ));
        }
        let mut channels = channels.to_vec();
        channels.sort_unstable();
        channels.dedup();

        let id = self.alloc_buffer_id();
        let mut payload = Vec::new();
        binary::put_channel_mask(&mut payload, &channels);
        let code = id as i32 | ((cyclic as i32) << 16);
        binary::roundtrip(
            &mut self.framer,
            self.client_id,
            Opcode::CreateBuffer,
            dev,
            code,
            &payload,
            &mut [],
        )
        .await?;
        debug!("buffer {id} created on dev {dev} ({} channels)", channels.len());
        Ok(Buffer {
            id,
            dev,
            channels,
            cyclic,
            next_block_id: 0,
        })
    }

    pub async fn enable_buffer(&mut self, buffer: &Buffer) -> Result<()> {
        self.buffer_op(Opcode::EnableBuffer, buffer).await
    }

    pub async fn disable_buffer(&mut self, buffer: &Buffer) -> Result<()> {
        self.buffer_op(Opcode::DisableBuffer, buffer).await
    }

    pub async fn free_buffer(&mut self, buffer: &Buffer) -> Result<()> {
        self.buffer_op(Opcode::FreeBuffer, buffer).await
    }

    async fn buffer_op(&mut self, op: Opcode, buffer: &Buffer) -> Result<()> {
        binary::roundtrip(
            &mut self.framer,
            self.client_id,
            op,
            buffer.dev,
            buffer.id as i32,
            &[],
            &mut [],
        )
        .await?;
        Ok(())
    }

    /// Allocate one block of `size` bytes inside the buffer.
    pub async fn create_block(&mut self, buffer: &mut Buffer, size: u64) -> Result<Block> {
        if size == 0 {
            return Err(Error::Config("block size must be positive".into()));
        }
        let block = Block {
            id: buffer.next_block_id,
            buffer_id: buffer.id,
            dev: buffer.dev,
            size,
            in_flight: AtomicU32::new(0),
        };
        buffer.next_block_id = buffer.next_block_id.wrapping_add(1);

        let mut payload = Vec::new();
        binary::put_u64_le(&mut payload, size);
        binary::roundtrip(
            &mut self.framer,
            self.client_id,
            Opcode::CreateBlock,
            block.dev,
            block.code(),
            &payload,
            &mut [],
        )
        .await?;
        Ok(block)
    }

    /// Free a block. Refused while a transfer is in flight.
    pub async fn free_block(&mut self, block: &Block) -> Result<()> {
        if block.in_flight() > 0 {
            return Err(Error::ResourceBusy(format!(
                "block {} of buffer {} has {} transfers in flight",
                block.id,
                block.buffer_id,
                block.in_flight()
            )));
        }
        binary::roundtrip(
            &mut self.framer,
            self.client_id,
            Opcode::FreeBlock,
            block.dev,
            block.code(),
            &[],
            &mut [],
        )
        .await?;
        Ok(())
    }

    /// RX transfer: request the block, receive its payload into `dst`.
    /// Overflow beyond `dst` is discarded by the framer so the stream stays
    /// aligned. Returns the declared byte count.
    pub async fn transfer_block(&mut self, block: &Block, dst: &mut [u8]) -> Result<usize> {
        block.begin_transfer();
        let res = {
            let mut payload = Vec::new();
            binary::put_u64_le(&mut payload, block.size);
            binary::roundtrip(
                &mut self.framer,
                self.client_id,
                Opcode::TransferBlock,
                block.dev,
                block.code(),
                &payload,
                dst,
            )
            .await
        };
        block.end_transfer();
        res
    }

    /// TX transfer: block id plus a length-prefixed payload.
    pub async fn transfer_tx_block(&mut self, block: &Block, data: &[u8]) -> Result<()> {
        block.begin_transfer();
        let res = {
            let mut payload = Vec::with_capacity(4 + data.len());
            payload.extend_from_slice(&(data.len() as u32).to_be_bytes());
            payload.extend_from_slice(data);
            binary::roundtrip(
                &mut self.framer,
                self.client_id,
                Opcode::TransferBlock,
                block.dev,
                block.code(),
                &payload,
                &mut [],
            )
            .await
        };
        block.end_transfer();
        res.map(|_| ())
    }

    /// Re-enqueue a block for cyclic TX replay.
    pub async fn enqueue_block_cyclic(&mut self, block: &Block) -> Result<()> {
        binary::roundtrip(
            &mut self.framer,
            self.client_id,
            Opcode::EnqueueBlockCyclic,
            block.dev,
            block.code(),
            &[],
            &mut [],
        )
        .await
        .map(|_| ())
    }

    /// Ask the server to retry a dequeue that reported no data yet.
    pub async fn retry_dequeue_block(&mut self, block: &Block) -> Result<()> {
        binary::roundtrip(
            &mut self.framer,
            self.client_id,
            Opcode::RetryDequeueBlock,
            block.dev,
            block.code(),
            &[],
            &mut [],
        )
        .await
        .map(|_| ())
    }
}

/// Bounded FIFO sizing. Zeroes are filled with the defaults: depth 8, high
/// watermark depth − 1, low watermark high / 2.
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub depth: usize,
    pub high_watermark: usize,
    pub low_watermark: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            depth: 0,
            high_watermark: 0,
            low_watermark: 0,
        }
        .normalized()
    }
}

impl QueueConfig {
    pub fn with_depth(depth: usize) -> QueueConfig {
        QueueConfig {
            depth,
            high_watermark: 0,
            low_watermark: 0,
        }
        .normalized()
    }

    fn normalized(mut self) -> QueueConfig {
        if self.depth == 0 {
            self.depth = 8;
        }
        if self.high_watermark == 0 || self.high_watermark > self.depth {
            self.high_watermark = self.depth.saturating_sub(1).max(1);
        }
        if self.low_watermark == 0 || self.low_watermark >= self.high_watermark {
            self.low_watermark = self.high_watermark / 2;
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseKind {
    Stopped,
    Closed,
}

impl CloseKind {
    fn to_error(self) -> Error {
        match self {
            CloseKind::Stopped => Error::StreamStopped,
            CloseKind::Closed => Error::StreamClosed,
        }
    }
}

struct QueueInner {
    frames: VecDeque<Vec<u8>>,
    closed: Option<CloseKind>,
}

/// Bounded frame FIFO between the transfer pump and the consumer.
///
/// Watermark notifications are best-effort and single-slot; a missed signal
/// is fine because `depth()` is authoritative. Close is idempotent and
/// keeps the first reason; dequeue drains remaining frames before turning
/// terminal.
pub struct FrameQueue {
    inner: Mutex<QueueInner>,
    not_empty: Notify,
    not_full: Notify,
    high_tx: mpsc::Sender<()>,
    low_tx: mpsc::Sender<()>,
    cfg: QueueConfig,
}

/// Single-slot receivers for the high and low watermark signals.
pub struct WatermarkSignals {
    pub high: mpsc::Receiver<()>,
    pub low: mpsc::Receiver<()>,
}

impl FrameQueue {
    pub fn new(cfg: QueueConfig) -> (Arc<FrameQueue>, WatermarkSignals) {
        let cfg = cfg.normalized();
        let (high_tx, high) = mpsc::channel(1);
        let (low_tx, low) = mpsc::channel(1);
        let queue = Arc::new(FrameQueue {
            inner: Mutex::new(QueueInner {
                frames: VecDeque::with_capacity(cfg.depth),
                closed: None,
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
            high_tx,
            low_tx,
            cfg,
        });
        (queue, WatermarkSignals { high, low })
    }

    pub fn depth(&self) -> usize {
        self.inner.lock().unwrap().frames.len()
    }

    /// Append one frame, waiting while the queue is full. Fails with the
    /// close reason once the queue is closed.
    pub async fn enqueue(&self, frame: Vec<u8>) -> Result<()> {
        let mut frame = Some(frame);
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(kind) = inner.closed {
                    return Err(kind.to_error());
                }
                if inner.frames.len() < self.cfg.depth {
                    inner.frames.push_back(frame.take().unwrap());
                    if inner.frames.len() == self.cfg.high_watermark {
                        self.high_tx.try_send(()).ok();
                    }
                    drop(inner);
                    self.not_empty.notify_one();
                    return Ok(());
                }
            }
            self.not_full.notified().await;
        }
    }

    /// Pop the oldest frame, waiting while the queue is empty. After close,
    /// remaining frames drain first, then the close reason is returned.
    pub async fn dequeue(&self) -> Result<Vec<u8>> {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(frame) = inner.frames.pop_front() {
                    if inner.frames.len() == self.cfg.low_watermark {
                        self.low_tx.try_send(()).ok();
                    }
                    drop(inner);
                    self.not_full.notify_one();
                    return Ok(frame);
                }
                if let Some(kind) = inner.closed {
                    return Err(kind.to_error());
                }
            }
            self.not_empty.notified().await;
        }
    }

    fn close(&self, kind: CloseKind) {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed.is_none() {
            inner.closed = Some(kind);
        }
        drop(inner);
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }
}

/// RX pump: a producer repeatedly transfers the block into a reusable
/// scratch buffer and enqueues copies; a consumer forwards frames to `out`
/// in production order. The stop token closes the queue with the stopped
/// sentinel (a clean return); the first transport error observed is
/// returned.
pub async fn start_rx_stream(
    session: Arc<tokio::sync::Mutex<Session>>,
    block: Arc<Block>,
    out: mpsc::Sender<Vec<u8>>,
    stop: CancellationToken,
    cfg: QueueConfig,
) -> Result<()> {
    let (queue, _marks) = FrameQueue::new(cfg);

    let producer = {
        let queue = Arc::clone(&queue);
        let block = Arc::clone(&block);
        let stop = stop.clone();
        tokio::spawn(async move {
            let mut scratch = vec![0u8; block.size as usize];
            loop {
                if stop.is_cancelled() {
                    queue.close(CloseKind::Stopped);
                    return Ok(());
                }
                let transferred = {
                    let mut session = session.lock().await;
                    session.transfer_block(&block, &mut scratch).await
                };
                match transferred {
                    Ok(n) => {
                        let frame = scratch[..n.min(scratch.len())].to_vec();
                        if queue.enqueue(frame).await.is_err() {
                            return Ok(());
                        }
                    }
                    Err(err) => {
                        queue.close(CloseKind::Closed);
                        return Err(err);
                    }
                }
            }
        })
    };

    let consumer = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            loop {
                match queue.dequeue().await {
                    Ok(frame) => {
                        if out.send(frame).await.is_err() {
                            queue.close(CloseKind::Closed);
                            return Ok::<(), Error>(());
                        }
                    }
                    Err(Error::StreamStopped) => return Ok(()),
                    Err(_) => return Ok(()),
                }
            }
        })
    };

    let (produced, consumed) = tokio::join!(producer, consumer);
    let produced: Result<()> = produced.unwrap_or(Err(Error::Cancelled));
    let consumed: Result<()> = consumed.unwrap_or(Err(Error::Cancelled));
    produced.and(consumed)
}

/// TX pump, symmetric to RX: frames from `input` are truncated to the block
/// size and copied into the queue, then transmitted in order.
pub async fn start_tx_stream(
    session: Arc<tokio::sync::Mutex<Session>>,
    block: Arc<Block>,
    mut input: mpsc::Receiver<Vec<u8>>,
    stop: CancellationToken,
    cfg: QueueConfig,
) -> Result<()> {
    let (queue, _marks) = FrameQueue::new(cfg);

    let feeder = {
        let queue = Arc::clone(&queue);
        let block_size = block.size as usize;
        let stop = stop.clone();
        tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    _ = stop.cancelled() => {
                        queue.close(CloseKind::Stopped);
                        return Ok::<(), Error>(());
                    }
                    frame = input.recv() => frame,
                };
                let Some(mut frame) = frame else {
                    queue.close(CloseKind::Closed);
                    return Ok(());
                };
                frame.truncate(block_size);
                if queue.enqueue(frame).await.is_err() {
                    return Ok(());
                }
            }
        })
    };

    let sender = {
        let queue = Arc::clone(&queue);
        let block = Arc::clone(&block);
        tokio::spawn(async move {
            loop {
                let frame = match queue.dequeue().await {
                    Ok(frame) => frame,
                    Err(_) => return Ok(()),
                };
                let sent = {
                    let mut session = session.lock().await;
                    session.transfer_tx_block(&block, &frame).await
                };
                if let Err(err) = sent {
                    queue.close(CloseKind::Closed);
                    return Err(err);
                }
            }
        })
    };

    let (fed, sent) = tokio::join!(feeder, sender);
    let fed: Result<()> = fed.unwrap_or(Err(Error::Cancelled));
    let sent: Result<()> = sent.unwrap_or(Err(Error::Cancelled));
    sent.and(fed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_defaults() {
        let cfg = QueueConfig::default();
        assert_eq!(cfg.depth, 8);
        assert_eq!(cfg.high_watermark, 7);
        assert_eq!(cfg.low_watermark, 3);
    }

    #[test]
    fn block_code_composition() {
        let block = Block {
            id: 0x0203,
            buffer_id: 0x0005,
            dev: 1,
            size: 4096,
            in_flight: AtomicU32::new(0),
        };
        assert_eq!(block.code(), 0x0203_0005);
    }

    #[tokio::test]
    async fn frames_come_out_in_order() {
        let (queue, _marks) = FrameQueue::new(QueueConfig::with_depth(4));
        for i in 0..4u8 {
            queue.enqueue(vec![i]).await.unwrap();
        }
        for i in 0..4u8 {
            assert_eq!(queue.dequeue().await.unwrap(), vec![i]);
        }
    }

    #[tokio::test]
    async fn close_drains_then_turns_terminal() {
        let (queue, _marks) = FrameQueue::new(QueueConfig::with_depth(4));
        queue.enqueue(vec![1]).await.unwrap();
        queue.enqueue(vec![2]).await.unwrap();
        queue.close(CloseKind::Stopped);
        // Close is idempotent; the first reason wins.
        queue.close(CloseKind::Closed);

        assert_eq!(queue.dequeue().await.unwrap(), vec![1]);
        assert_eq!(queue.dequeue().await.unwrap(), vec![2]);
        assert!(matches!(queue.dequeue().await, Err(Error::StreamStopped)));
        assert!(matches!(queue.enqueue(vec![3]).await, Err(Error::StreamStopped)));
    }

    #[tokio::test]
    async fn backpressure_blocks_until_a_slot_frees() {
        let (queue, _marks) = FrameQueue::new(QueueConfig::with_depth(2));
        queue.enqueue(vec![1]).await.unwrap();
        queue.enqueue(vec![2]).await.unwrap();

        let q = Arc::clone(&queue);
        let pending = tokio::spawn(async move { q.enqueue(vec![3]).await });
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());

        assert_eq!(queue.dequeue().await.unwrap(), vec![1]);
        pending.await.unwrap().unwrap();
        assert_eq!(queue.depth(), 2);
    }

    #[tokio::test]
    async fn watermarks_fire_on_crossings() {
        let (queue, mut marks) = FrameQueue::new(QueueConfig {
            depth: 4,
            high_watermark: 3,
            low_watermark: 1,
        });
        for i in 0..3u8 {
            queue.enqueue(vec![i]).await.unwrap();
        }
        marks.high.try_recv().expect("high watermark signal");

        queue.dequeue().await.unwrap();
        queue.dequeue().await.unwrap();
        marks.low.try_recv().expect("low watermark signal");
    }

    #[test]
    fn in_flight_accounting_balances() {
        let block = Block {
            id: 0,
            buffer_id: 0,
            dev: 0,
            size: 16,
            in_flight: AtomicU32::new(0),
        };
        block.begin_transfer();
        assert_eq!(block.in_flight(), 1);
        block.end_transfer();
        assert_eq!(block.in_flight(), 0);
    }

    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn respond(sock: &mut TcpStream, client: [u8; 2], code: i32, payload: &[u8]) {
        let mut out = Vec::with_capacity(8 + payload.len());
        out.extend_from_slice(&client);
        out.push(Opcode::Response as u8);
        out.push(0);
        out.extend_from_slice(&code.to_be_bytes());
        out.extend_from_slice(payload);
        sock.write_all(&out).await.unwrap();
    }

    /// Just enough server for buffer/block lifecycle tests.
    async fn mini_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut hdr = [0u8; 8];
            loop {
                if sock.read_exact(&mut hdr).await.is_err() {
                    return;
                }
                let client = [hdr[0], hdr[1]];
                match Opcode::from_u8(hdr[2]) {
                    Some(Opcode::Version) => {
                        let mut payload = Vec::new();
                        payload.extend_from_slice(&0u16.to_be_bytes());
                        payload.extend_from_slice(&26u16.to_be_bytes());
                        payload.extend_from_slice(&0u32.to_be_bytes());
                        respond(&mut sock, client, payload.len() as i32, &payload).await;
                    }
                    Some(Opcode::CreateBuffer) => {
                        let mut count = [0u8; 4];
                        sock.read_exact(&mut count).await.unwrap();
                        let words = u32::from_le_bytes(count) as usize;
                        let mut mask = vec![0u8; words * 4];
                        sock.read_exact(&mut mask).await.unwrap();
                        respond(&mut sock, client, 0, &[]).await;
                    }
                    Some(Opcode::CreateBlock) => {
                        let mut size = [0u8; 8];
                        sock.read_exact(&mut size).await.unwrap();
                        respond(&mut sock, client, 0, &[]).await;
                    }
                    Some(Opcode::FreeBlock) | Some(Opcode::FreeBuffer) => {
                        respond(&mut sock, client, 0, &[]).await;
                    }
                    _ => respond(&mut sock, client, -95, &[]).await,
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn free_block_rejected_while_in_flight() {
        let addr = mini_server().await;
        let mut session = Session::connect(&addr, Duration::from_secs(5)).await.unwrap();
        let mut buffer = session.create_buffer(1, &[0, 1], false).await.unwrap();
        let block = session.create_block(&mut buffer, 64).await.unwrap();

        block.begin_transfer();
        match session.free_block(&block).await {
            Err(Error::ResourceBusy(_)) => {}
            other => panic!("expected busy, got {other:?}"),
        }
        block.end_transfer();
        session.free_block(&block).await.unwrap();
    }

    #[tokio::test]
    async fn create_buffer_requires_channels() {
        let addr = mini_server().await;
        let mut session = Session::connect(&addr, Duration::from_secs(5)).await.unwrap();
        assert!(matches!(
            session.create_buffer(1, &[], false).await,
            Err(Error::Config(_))
        ));
        let mut buffer = session.create_buffer(1, &[0], false).await.unwrap();
        assert!(matches!(
            session.create_block(&mut buffer, 0).await,
            Err(Error::Config(_))
        ));
    }
}
