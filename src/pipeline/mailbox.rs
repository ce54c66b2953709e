// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! 单槽信箱 (Single-slot Mailbox)
//!
//! 容量为 1 的线程间交接: 新值直接覆盖旧值 (newest-wins), 被覆盖的旧值返回给调用方。
//! 输入 (采集 → 推理) 与输出 (推理 → 展示) 两个方向共用同一实现。

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

pub struct Mailbox<T> {
    slot: Mutex<Option<T>>,
    ready: Condvar,
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    /// 放入新值, 返回被挤掉的旧值 (检查-驱逐-写入在同一临界区内完成)
    pub fn replace(&self, value: T) -> Option<T> {
        let evicted = self.slot.lock().replace(value);
        self.ready.notify_one();
        evicted
    }

    /// 有条件地放入: `accept` 在同一临界区内查看当前值
    ///
    /// 接受时返回被挤掉的旧值, 拒绝时原样退回新值且槽位不变。
    pub fn offer(&self, value: T, accept: impl FnOnce(Option<&T>) -> bool) -> Result<Option<T>, T> {
        let mut slot = self.slot.lock();
        if !accept(slot.as_ref()) {
            return Err(value);
        }
        let evicted = slot.replace(value);
        drop(slot);
        self.ready.notify_one();
        Ok(evicted)
    }

    /// 非阻塞取出
    pub fn take(&self) -> Option<T> {
        self.slot.lock().take()
    }

    /// 阻塞等待, 最多 `timeout`; 超时返回 `None`
    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        let mut slot = self.slot.lock();
        if slot.is_none() {
            // 只等一次: 超时或被唤醒后都直接检查槽位, 由调用方决定是否继续等待
            let _ = self.ready.wait_for(&mut slot, timeout);
        }
        slot.take()
    }

    /// 当前值满足 `pred` 时取出
    pub fn take_if(&self, pred: impl FnOnce(&T) -> bool) -> Option<T> {
        let mut slot = self.slot.lock();
        match slot.as_ref() {
            Some(value) if pred(value) => slot.take(),
            _ => None,
        }
    }

    /// 清空, 返回被丢弃的值
    pub fn clear(&self) -> Option<T> {
        self.slot.lock().take()
    }

    pub fn is_empty(&self) -> bool {
        self.slot.lock().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_replace_keeps_newest() {
        let mailbox = Mailbox::new();
        assert_eq!(mailbox.replace(1), None);
        assert_eq!(mailbox.replace(2), Some(1));
        assert_eq!(mailbox.replace(3), Some(2));
        assert_eq!(mailbox.take(), Some(3));
        assert_eq!(mailbox.take(), None);
    }

    #[test]
    fn test_recv_timeout_expires() {
        let mailbox: Mailbox<u32> = Mailbox::new();
        let start = Instant::now();
        assert_eq!(mailbox.recv_timeout(Duration::from_millis(50)), None);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_recv_timeout_wakes_on_replace() {
        let mailbox = Arc::new(Mailbox::new());
        let producer = {
            let mailbox = mailbox.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                mailbox.replace("frame");
            })
        };

        let mut got = None;
        let deadline = Instant::now() + Duration::from_secs(5);
        while got.is_none() && Instant::now() < deadline {
            got = mailbox.recv_timeout(Duration::from_secs(1));
        }
        producer.join().unwrap();
        assert_eq!(got, Some("frame"));
        assert!(mailbox.is_empty());
    }

    #[test]
    fn test_offer_respects_current_value() {
        let mailbox = Mailbox::new();
        assert_eq!(mailbox.offer(1, |cur| cur.is_none()), Ok(None));
        assert_eq!(mailbox.offer(2, |cur| cur != Some(&1)), Err(2));
        assert_eq!(mailbox.offer(3, |_| true), Ok(Some(1)));
        assert_eq!(mailbox.take(), Some(3));
    }

    #[test]
    fn test_take_if() {
        let mailbox = Mailbox::new();
        mailbox.replace(5);
        assert_eq!(mailbox.take_if(|v| *v > 10), None);
        assert_eq!(mailbox.take_if(|v| *v == 5), Some(5));
        assert!(mailbox.is_empty());
        assert_eq!(mailbox.take_if(|_| true), None);
    }

    #[test]
    fn test_clear_returns_pending() {
        let mailbox = Mailbox::new();
        mailbox.replace(7);
        assert_eq!(mailbox.clear(), Some(7));
        assert!(mailbox.is_empty());
        assert_eq!(mailbox.clear(), None);
    }
}
