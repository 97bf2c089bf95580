//! Terminal console collaborator.
//!
//! One stdin task feeds the whole client. A timed yes/no prompt parks a
//! oneshot in the pending slot; the next input line answers it instead of
//! reaching the chat loop. Everything else is forwarded to whoever holds
//! the line receiver.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};

/// Help shown when the chat opens.
pub const HELP_TEXT: &str = "Commands:
  /peer                  show peer id & current path
  /send -f <file>        send a file
  /send -d <dir>         send a directory recursively
  /bye                   close the chat";

struct PendingPrompt {
    tx: oneshot::Sender<bool>,
}

/// Shared console handle.
pub struct Console {
    pending: Mutex<Option<PendingPrompt>>,
}

impl Console {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(None),
        })
    }

    /// Spawns the stdin reader. Lines that answer a pending prompt are
    /// consumed here; the rest arrive on the returned channel.
    pub fn spawn_stdin(self: &Arc<Self>) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(16);
        let console = Arc::clone(self);
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if console.try_answer(&line) {
                            continue;
                        }
                        if tx.send(line).await.is_err() {
                            return;
                        }
                    }
                    // stdin closed (^D) or broken
                    Ok(None) | Err(_) => {
                        drop(tx);
                        return;
                    }
                }
            }
        });
        rx
    }

    pub fn println(&self, msg: &str) {
        println!("{msg}");
    }

    /// Timestamped line for handshake and lifecycle events.
    pub fn logln(&self, msg: &str) {
        let ts = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        println!("{ts} {msg}");
    }

    /// Asks a yes/no question with a deadline. Timeout and anything but
    /// `y`/`yes` count as no.
    pub async fn confirm(&self, question: &str, timeout: Duration) -> bool {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            // A newer prompt replaces a stale one; the old waiter sees no.
            *pending = Some(PendingPrompt { tx });
        }
        self.logln(question);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(answer)) => answer,
            _ => {
                self.pending.lock().take();
                false
            }
        }
    }

    /// Routes a line into the pending prompt, if any. Returns true when the
    /// line was consumed as an answer.
    pub fn try_answer(&self, line: &str) -> bool {
        let Some(p) = self.pending.lock().take() else {
            return false;
        };
        let ans = matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes");
        let _ = p.tx.send(ans);
        true
    }
}
