//! 内容流模块
//!
//! 提供单次 HTTP 交换的出站 [`ContentSink`] 与入站 [`ContentSource`]。
//!
//! 出站采用拉式流控：由传输侧在可写时回拉生产者（`maybe_pull`），
//! 而不是让生产者自由推送。瓶颈资源是传输的写缓冲/拥塞窗口，
//! 推式设计要么无界缓冲要么丢数据，这里不走那条路。
//!
//! 入站为手动读模式：`deliver` 在消费者滞后时挂起，连接级读循环
//! 据此暂停对套接字的拉取（另见 `should_read`）。

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{RatError, RatResult};
use crate::utils::logger::debug;

/// 下沉缓冲深度：生产者在一次拉取之外最多可滞留的事件数
const SINK_BUFFER_DEPTH: usize = 4;
/// 入站源缓冲深度：消费者未取走前允许暂存的块数
const SOURCE_BUFFER_DEPTH: usize = 8;

/// 响应体生产者
///
/// 由应用侧实现。传输可写时 `pull` 被调用，生产者应通过句柄
/// `push` 下一块数据，或 `release` 结束流。`pull` 在连接的
/// I/O 任务上同步执行，不要在其中做阻塞操作；需要异步取数时
/// 可把句柄克隆进自己的任务，稍后推送。
pub trait ContentProducer: Send + Sync + 'static {
    /// 传输就绪，请求下一块数据
    fn pull(&self, handle: SinkHandle);

    /// 下沉被强制关闭（对端复位/连接关闭），生产者不再有推送机会
    fn released(&self) {}
}

/// 下沉内部事件，由协议侧排水循环消费
#[derive(Debug)]
pub(crate) enum SinkEvent {
    /// 一块响应体数据
    Chunk(Bytes),
    /// 生产者结束；close 表示要求随后关闭底层连接
    End { close: bool },
}

struct SinkShared {
    closed: AtomicBool,
    /// 当前有效句柄的代号；0 表示未附加
    active: AtomicU64,
    next_id: AtomicU64,
    /// 附加/分离是冷路径，push 热路径只读原子代号，不碰这把锁
    producer: Mutex<Option<Arc<dyn ContentProducer>>>,
    tx: mpsc::Sender<SinkEvent>,
}

/// 单次交换的响应体下沉
///
/// 单生产者、尊重背压的输出通道。最多附加一个生产者，
/// 关闭后的任何操作都会被拒绝。
#[derive(Clone)]
pub struct ContentSink {
    shared: Arc<SinkShared>,
}

impl ContentSink {
    /// 创建下沉及其协议侧事件接收端
    pub(crate) fn channel() -> (Self, mpsc::Receiver<SinkEvent>) {
        let (tx, rx) = mpsc::channel(SINK_BUFFER_DEPTH);
        let sink = Self {
            shared: Arc::new(SinkShared {
                closed: AtomicBool::new(false),
                active: AtomicU64::new(0),
                next_id: AtomicU64::new(1),
                producer: Mutex::new(None),
                tx,
            }),
        };
        (sink, rx)
    }

    /// 附加生产者
    ///
    /// 已有生产者或下沉已关闭时失败，对本次交换是致命错误；
    /// 失败不影响已附加生产者。
    pub fn source(&self, producer: Arc<dyn ContentProducer>) -> RatResult<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(RatError::ContractViolation(
                "下沉已关闭，无法附加生产者".to_string(),
            ));
        }
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        if self
            .shared
            .active
            .compare_exchange(0, id, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(RatError::ContractViolation(
                "下沉已附加生产者，禁止重复附加".to_string(),
            ));
        }
        let mut slot = self
            .shared
            .producer
            .lock()
            .map_err(|_| RatError::ContractViolation("生产者槽位锁中毒".to_string()))?;
        *slot = Some(producer);
        Ok(())
    }

    /// 传输可写回调：回拉当前生产者
    ///
    /// 未附加生产者或已关闭时为空操作。返回下沉是否仍然开放。
    pub fn maybe_pull(&self) -> bool {
        if self.shared.closed.load(Ordering::Acquire) {
            return false;
        }
        let id = self.shared.active.load(Ordering::Acquire);
        if id == 0 {
            return true;
        }
        let producer = match self.shared.producer.lock() {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        if let Some(producer) = producer {
            producer.pull(SinkHandle {
                shared: self.shared.clone(),
                id,
            });
        }
        !self.shared.closed.load(Ordering::Acquire)
    }

    /// 分离生产者（幂等），并通知其不再有推送机会
    pub fn release(&self) {
        let prev = self.shared.active.swap(0, Ordering::AcqRel);
        if prev == 0 {
            return;
        }
        let producer = match self.shared.producer.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(producer) = producer {
            producer.released();
        }
    }

    /// 关闭下沉（幂等），隐含 release
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("🔒 [内容下沉] 下沉关闭");
        self.release();
        // 协议侧排水循环可能仍在等事件，补一个终止信号
        let _ = self.shared.tx.try_send(SinkEvent::End { close: true });
    }

    /// 是否已关闭
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// 当前是否附加了生产者
    pub fn has_producer(&self) -> bool {
        self.shared.active.load(Ordering::Acquire) != 0
    }
}

/// 生产者持有的推送句柄
///
/// 有效窗口从 `source` 附加起，到 `release`/下沉关闭止；
/// 窗口外的 `push` 是编程契约违规，确定性失败。
#[derive(Clone)]
pub struct SinkHandle {
    shared: Arc<SinkShared>,
    id: u64,
}

impl SinkHandle {
    /// 推送一块响应体数据
    pub fn push(&self, chunk: Bytes) -> RatResult<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(RatError::ContractViolation(
                "向已关闭的下沉推送数据".to_string(),
            ));
        }
        if self.shared.active.load(Ordering::Acquire) != self.id {
            return Err(RatError::ContractViolation(
                "通过已失效的句柄推送数据".to_string(),
            ));
        }
        self.shared
            .tx
            .try_send(SinkEvent::Chunk(chunk))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => RatError::ContractViolation(
                    "推送超出传输授予的缓冲额度".to_string(),
                ),
                mpsc::error::TrySendError::Closed(_) => {
                    RatError::ContractViolation("下沉通道已销毁".to_string())
                }
            })
    }

    /// 释放生产者（幂等）
    ///
    /// close 为 true 时要求协议侧随后按各自语义关闭底层连接
    /// （HTTP/1.1 放弃 keep-alive，多路复用协议结束所在流）。
    pub fn release(&self, close: bool) {
        if self
            .shared
            .active
            .compare_exchange(self.id, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            if let Ok(mut slot) = self.shared.producer.lock() {
                slot.take();
            }
            let _ = self.shared.tx.try_send(SinkEvent::End { close });
        }
    }
}

/// 协议侧响应体写出端
///
/// `write_chunk` 返回即表示该协议的传输重新可写
/// （HTTP/2 为窗口授予，HTTP/3 为 send_data 完成，
/// HTTP/1.1 为通道被 hyper 消费）。
#[async_trait]
pub(crate) trait SinkWriter: Send {
    async fn write_chunk(&mut self, chunk: Bytes) -> RatResult<()>;
    async fn finish(&mut self) -> RatResult<()>;
}

/// 拉式排水循环：每完成一次写出即回拉生产者
///
/// 返回 true 表示生产者要求随后关闭连接。
pub(crate) async fn pump_response_body<W: SinkWriter>(
    sink: &ContentSink,
    rx: &mut mpsc::Receiver<SinkEvent>,
    writer: &mut W,
) -> RatResult<bool> {
    if !sink.maybe_pull() {
        writer.finish().await?;
        return Ok(true);
    }
    loop {
        match rx.recv().await {
            Some(SinkEvent::Chunk(chunk)) => {
                writer.write_chunk(chunk).await?;
                if !sink.maybe_pull() {
                    // 写出期间下沉被强制关闭
                    writer.finish().await?;
                    return Ok(true);
                }
            }
            Some(SinkEvent::End { close }) => {
                writer.finish().await?;
                sink.release();
                return Ok(close);
            }
            None => {
                writer.finish().await?;
                return Ok(false);
            }
        }
    }
}

/// 单次交换的请求体源
///
/// 接收传输层送来的请求体块并转交应用侧消费者；消费者慢于网络时
/// `deliver` 挂起，读循环因此停止向套接字请求更多字节。
pub struct ContentSource {
    tx: Mutex<Option<mpsc::Sender<RatResult<Bytes>>>>,
    released: AtomicBool,
}

impl ContentSource {
    /// 创建源及应用侧读取端
    pub fn channel() -> (Arc<Self>, SourceReader) {
        let (tx, rx) = mpsc::channel(SOURCE_BUFFER_DEPTH);
        (
            Arc::new(Self {
                tx: Mutex::new(Some(tx)),
                released: AtomicBool::new(false),
            }),
            SourceReader { rx },
        )
    }

    /// 连接级读循环是否应继续从套接字读取
    pub fn should_read(&self) -> bool {
        if self.released.load(Ordering::Acquire) {
            return false;
        }
        match self.tx.lock() {
            Ok(slot) => slot
                .as_ref()
                .map(|tx| tx.capacity() > 0)
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// 投递一块请求体；消费者滞后时挂起（施加背压）
    ///
    /// 消费者已释放时返回错误，调用方应转为丢弃模式而不是中断连接。
    pub async fn deliver(&self, chunk: Bytes) -> RatResult<()> {
        let tx = {
            let slot = self.tx.lock().map_err(|_| {
                RatError::ContractViolation("请求体源锁中毒".to_string())
            })?;
            slot.clone()
        };
        let tx = tx.ok_or_else(|| {
            RatError::ConnectionClosed("请求体源已结束".to_string())
        })?;
        tx.send(Ok(chunk)).await.map_err(|_| {
            RatError::ConnectionClosed("请求体消费者已释放".to_string())
        })
    }

    /// 正常结束入站流（幂等）
    pub fn finish(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut slot) = self.tx.lock() {
            slot.take();
        }
    }

    /// 异常中止（对端复位、解码失败），消费者将收到错误
    pub fn abort(&self, err: RatError) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Ok(mut slot) = self.tx.lock() {
            if let Some(tx) = slot.take() {
                let _ = tx.try_send(Err(err));
            }
        }
    }

    /// 是否已结束（正常或异常）
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

/// 应用侧请求体读取端
pub struct SourceReader {
    rx: mpsc::Receiver<RatResult<Bytes>>,
}

impl SourceReader {
    /// 读取下一块请求体；None 表示流正常结束
    pub async fn recv(&mut self) -> Option<RatResult<Bytes>> {
        self.rx.recv().await
    }

    /// 聚合整个请求体，超出 limit 字节返回协议错误
    pub async fn read_to_end(&mut self, limit: usize) -> RatResult<Bytes> {
        let mut buf = Vec::new();
        while let Some(chunk) = self.rx.recv().await {
            let chunk = chunk?;
            if buf.len() + chunk.len() > limit {
                return Err(RatError::ProtocolError(format!(
                    "请求体超出限制: {} 字节",
                    limit
                )));
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(Bytes::from(buf))
    }
}
