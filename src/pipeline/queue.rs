//! Work queue for the dedicated-thread worker model.
//!
//! Uses std::sync::mpsc. The orchestrator sends every unit up front and drops
//! the sender; workers share the receiver and exit when it runs dry.

use std::path::PathBuf;
use std::sync::mpsc::{channel, Receiver, Sender};

/// One unit of work: an image (or crop) to process end to end.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub path: PathBuf,
    /// Position in the sorted input listing
    pub index: usize,
}

impl WorkItem {
    pub fn new(path: PathBuf, index: usize) -> Self {
        Self { path, index }
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// Creates an unbounded work queue.
pub fn create_work_queue() -> (Sender<WorkItem>, Receiver<WorkItem>) {
    channel()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_queue_preserves_order() {
        let (sender, receiver) = create_work_queue();

        for i in 0..5 {
            sender
                .send(WorkItem::new(PathBuf::from(format!("img_{}.jpg", i)), i))
                .expect("Failed to send");
        }

        for i in 0..5 {
            let received = receiver.recv().expect("Failed to receive");
            assert_eq!(received.index, i);
            assert_eq!(received.file_name(), format!("img_{}.jpg", i));
        }
    }

    #[test]
    fn test_channel_closes_when_sender_dropped() {
        let (sender, receiver) = create_work_queue();

        sender.send(WorkItem::new(PathBuf::from("a.jpg"), 0)).unwrap();
        drop(sender);

        assert!(receiver.recv().is_ok());
        assert!(receiver.recv().is_err());
    }
}
