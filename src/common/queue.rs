use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::{Notify, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;
use tracing::error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("队列已停止接收新内容")]
    Completed,

    #[error("队列已满")]
    Full,

    #[error("等待队列时被取消")]
    Cancelled,

    #[error("队列为空，取出前必须先确认有可用内容")]
    Empty,
}

/// 队列拒绝写入时把内容原样退回
#[derive(Debug)]
pub struct EnqueueError<T> {
    pub item: T,
    pub reason: QueueError,
}

impl<T> std::fmt::Display for EnqueueError<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.reason)
    }
}

impl<T: std::fmt::Debug> std::error::Error for EnqueueError<T> {}

struct Shared<T> {
    items: Mutex<VecDeque<T>>,
    completed: AtomicBool,
    available: Notify,
    slots: Option<Semaphore>,
    capacity: Option<usize>,
}

/// 多生产者多消费者的异步队列
///
/// 生产者调用 `complete_adding` 之后不再接受新内容，消费者取完剩余内容后
/// `output_available` 返回 false。每条内容只会交给一个消费者。
pub struct PostQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for PostQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> std::fmt::Debug for PostQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostQueue")
            .field("len", &self.len())
            .field("capacity", &self.shared.capacity)
            .field("completed", &self.is_completed())
            .finish()
    }
}

impl<T> PostQueue<T> {
    pub fn bounded(capacity: usize) -> Self {
        Self::with_capacity(Some(capacity.max(1)))
    }

    pub fn unbounded() -> Self {
        Self::with_capacity(None)
    }

    pub fn with_capacity(capacity: Option<usize>) -> Self {
        let capacity = capacity.map(|c| c.max(1));
        Self {
            shared: Arc::new(Shared {
                items: Mutex::new(VecDeque::new()),
                completed: AtomicBool::new(false),
                available: Notify::new(),
                slots: capacity.map(Semaphore::new),
                capacity,
            }),
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.shared.capacity
    }

    pub fn len(&self) -> usize {
        self.lock_items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_items().is_empty()
    }

    pub fn is_completed(&self) -> bool {
        self.shared.completed.load(Ordering::Acquire)
    }

    /// 写入一条内容，有容量限制时等待空位
    pub async fn enqueue(&self, item: T) -> Result<(), EnqueueError<T>> {
        if self.is_completed() {
            return Err(EnqueueError {
                item,
                reason: QueueError::Completed,
            });
        }

        if let Some(slots) = &self.shared.slots {
            match slots.acquire().await {
                Ok(permit) => permit.forget(),
                // complete_adding 会关闭信号量
                Err(_) => {
                    return Err(EnqueueError {
                        item,
                        reason: QueueError::Completed,
                    });
                }
            }
        }

        self.push(item)
    }

    /// 不等待的写入
    pub fn try_enqueue(&self, item: T) -> Result<(), EnqueueError<T>> {
        if self.is_completed() {
            return Err(EnqueueError {
                item,
                reason: QueueError::Completed,
            });
        }

        if let Some(slots) = &self.shared.slots {
            match slots.try_acquire() {
                Ok(permit) => permit.forget(),
                Err(TryAcquireError::NoPermits) => {
                    return Err(EnqueueError {
                        item,
                        reason: QueueError::Full,
                    });
                }
                Err(TryAcquireError::Closed) => {
                    return Err(EnqueueError {
                        item,
                        reason: QueueError::Completed,
                    });
                }
            }
        }

        self.push(item)
    }

    fn push(&self, item: T) -> Result<(), EnqueueError<T>> {
        {
            let mut items = self.lock_items();
            // 与 complete_adding 在同一把锁下判断，保证完成后不会再混入内容
            if self.is_completed() {
                drop(items);
                self.release_slot();
                return Err(EnqueueError {
                    item,
                    reason: QueueError::Completed,
                });
            }
            items.push_back(item);
        }
        self.shared.available.notify_waiters();
        Ok(())
    }

    pub fn try_receive(&self) -> Option<T> {
        let item = self.lock_items().pop_front();
        if item.is_some() {
            self.release_slot();
        }
        item
    }

    /// 取出一条内容，只能在 `output_available` 返回 true 之后调用
    pub fn receive(&self) -> Result<T, QueueError> {
        self.try_receive().ok_or_else(|| {
            error!("在空队列上调用了 receive");
            debug_assert!(false, "在空队列上调用了 receive");
            QueueError::Empty
        })
    }

    /// 等待直到有内容可取（true）、队列已完成且为空（false），或等待被取消
    pub async fn output_available(&self, cancel: &CancellationToken) -> Result<bool, QueueError> {
        loop {
            let notified = self.shared.available.notified();
            tokio::pin!(notified);
            // 先登记再检查状态，避免检查和等待之间漏掉通知
            notified.as_mut().enable();

            {
                let items = self.lock_items();
                if !items.is_empty() {
                    return Ok(true);
                }
                if self.is_completed() {
                    return Ok(false);
                }
            }

            if cancel.is_cancelled() {
                return Err(QueueError::Cancelled);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Err(QueueError::Cancelled),
            }
        }
    }

    /// 生产者声明不再写入，可重复调用
    pub fn complete_adding(&self) {
        {
            let _items = self.lock_items();
            self.shared.completed.store(true, Ordering::Release);
        }
        if let Some(slots) = &self.shared.slots {
            slots.close();
        }
        self.shared.available.notify_waiters();
    }

    fn release_slot(&self) {
        if let Some(slots) = &self.shared.slots {
            slots.add_permits(1);
        }
    }

    fn lock_items(&self) -> MutexGuard<'_, VecDeque<T>> {
        match self.shared.items.lock() {
            Ok(items) => items,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
