//! 连接下行队列：处理器产生的应答帧经此交给连接任务写出。

use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::mpsc;

#[derive(Default)]
pub struct Outbox {
    senders: RwLock<HashMap<u64, mpsc::UnboundedSender<Vec<u8>>>>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为连接登记下行队列，返回连接任务持有的接收端。
    pub fn attach(&self, conn_id: u64) -> mpsc::UnboundedReceiver<Vec<u8>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        if let Ok(mut senders) = self.senders.write() {
            senders.insert(conn_id, sender);
        }
        receiver
    }

    pub fn detach(&self, conn_id: u64) {
        if let Ok(mut senders) = self.senders.write() {
            senders.remove(&conn_id);
        }
    }

    /// 投递下行帧；连接已关闭时返回 false。
    pub fn send(&self, conn_id: u64, frame: Vec<u8>) -> bool {
        self.senders
            .read()
            .ok()
            .and_then(|senders| senders.get(&conn_id).map(|sender| sender.send(frame).is_ok()))
            .unwrap_or(false)
    }

    pub fn connection_count(&self) -> usize {
        self.senders.read().map(|senders| senders.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_reach_attached_connections_only() {
        let outbox = Outbox::new();
        let mut rx = outbox.attach(7);
        assert!(outbox.send(7, vec![1, 2]));
        assert!(!outbox.send(8, vec![3]));
        assert_eq!(rx.try_recv().expect("frame"), vec![1, 2]);
        outbox.detach(7);
        assert!(!outbox.send(7, vec![4]));
        assert_eq!(outbox.connection_count(), 0);
    }
}
