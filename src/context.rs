use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// ワーカー全体で共有する停止シグナル。
///
/// 一度[Context::cancel]されると元には戻らない。
#[derive(Clone, Debug)]
pub struct Context {
    shutdown: Arc<AtomicBool>,
    notifier: broadcast::Sender<()>,
}

impl Context {
    pub fn new() -> Self {
        let (notifier, _) = broadcast::channel(1);
        Self {
            shutdown: Arc::new(AtomicBool::new(false)),
            notifier,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.notifier.send(());
    }

    /// [Context::cancel]されるまで待機する。
    pub async fn done(&self) {
        let mut receiver = self.notifier.subscribe();
        if self.is_shutdown() {
            return;
        }
        let _ = receiver.recv().await;
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
