//! Process-wide shutdown signal.
//!
//! Once raised the signal stays raised, so a task that starts listening late
//! still sees it. Dropping every [`ShutdownTrigger`] counts as raising it.

use tokio::sync::watch;

#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

pub fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

impl ShutdownTrigger {
    pub fn raise(&self) {
        self.tx.send_replace(true);
    }
}

impl Shutdown {
    pub fn is_raised(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Completes once the signal is raised.
    pub async fn wait(&mut self) {
        // 送信側が消えた場合もエラーで抜ける
        let _ = self.rx.wait_for(|raised| *raised).await;
    }
}
