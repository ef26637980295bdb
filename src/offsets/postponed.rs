use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use log::{debug, warn};

use crate::{RestructureError, Result};

/// How long a postponed write may lag behind the trigger that requested it.
pub(crate) const WRITE_DEBOUNCE: Duration = Duration::from_millis(500);

enum Message {
    Trigger,
    Flush(Sender<Result<()>>),
    Shutdown,
}

/// A background writer that coalesces bursts of write requests.
///
/// `trigger()` is a non-blocking signal; the dedicated thread debounces
/// further triggers for a bounded window, then invokes the write
/// closure once. Failed writes are logged and superseded by the next
/// successful write. `flush()` forces a synchronous write; `close()`
/// flushes, posts a shutdown sentinel and joins the thread.
pub struct PostponedWriter {
    tx: Sender<Message>,
    handle: Option<thread::JoinHandle<()>>,
}

impl PostponedWriter {
    /// Starts the writer thread around a write closure.
    pub fn new<F>(name: &str, debounce: Duration, write: F) -> Self
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        let (tx, rx) = channel::bounded::<Message>(1);
        let handle = thread::Builder::new()
            .name(format!("postponed-{name}"))
            .spawn(move || run(rx, debounce, write))
            .expect("failed to spawn postponed writer thread");
        Self {
            tx,
            handle: Some(handle),
        }
    }

    /// Requests a write. Never blocks; a full channel means a write is
    /// already pending and this request coalesces into it.
    pub fn trigger(&self) {
        let _ = self.tx.try_send(Message::Trigger);
    }

    /// Writes synchronously, returning the write result.
    pub fn flush(&self) -> Result<()> {
        let (ack_tx, ack_rx) = channel::bounded(1);
        self.tx
            .send(Message::Flush(ack_tx))
            .map_err(|_| RestructureError::StringError("postponed writer stopped".into()))?;
        ack_rx
            .recv()
            .map_err(|_| RestructureError::StringError("postponed writer stopped".into()))?
    }

    /// Forces a final synchronous write and stops the thread.
    pub fn close(&mut self) -> Result<()> {
        let result = self.flush();
        let _ = self.tx.send(Message::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        result
    }
}

impl Drop for PostponedWriter {
    fn drop(&mut self) {
        if self.handle.is_some() {
            let _ = self.close();
        }
    }
}

fn run<F>(rx: Receiver<Message>, debounce: Duration, mut write: F)
where
    F: FnMut() -> Result<()>,
{
    loop {
        match rx.recv() {
            Ok(Message::Trigger) => {
                // Debounce: swallow further triggers inside the window so a
                // burst becomes one write. A flush or shutdown arriving
                // mid-window cuts it short.
                let deadline = Instant::now() + debounce;
                let mut ack = None;
                let mut stop = false;
                loop {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    match rx.recv_timeout(deadline - now) {
                        Ok(Message::Trigger) => {}
                        Ok(Message::Flush(tx)) => {
                            ack = Some(tx);
                            break;
                        }
                        Ok(Message::Shutdown) => {
                            stop = true;
                            break;
                        }
                        Err(RecvTimeoutError::Timeout) => break,
                        Err(RecvTimeoutError::Disconnected) => {
                            stop = true;
                            break;
                        }
                    }
                }
                let result = do_write(&mut write);
                if let Some(tx) = ack {
                    let _ = tx.send(result);
                }
                if stop {
                    return;
                }
            }
            Ok(Message::Flush(tx)) => {
                let result = do_write(&mut write);
                let _ = tx.send(result);
            }
            Ok(Message::Shutdown) | Err(_) => {
                debug!("postponed writer shutting down");
                return;
            }
        }
    }
}

fn do_write<F>(write: &mut F) -> Result<()>
where
    F: FnMut() -> Result<()>,
{
    let result = write();
    if let Err(e) = &result {
        warn!("postponed write failed, retrying on next trigger: {e}");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn triggers_coalesce_into_few_writes() {
        let writes = Arc::new(AtomicUsize::new(0));
        let counter = writes.clone();
        let mut writer = PostponedWriter::new("test", Duration::from_millis(50), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        for _ in 0..100 {
            writer.trigger();
        }
        writer.close().unwrap();

        let n = writes.load(Ordering::SeqCst);
        assert!(n >= 1, "at least the final flush must write");
        assert!(n < 10, "100 triggers must coalesce, got {n} writes");
    }

    #[test]
    fn flush_is_synchronous() {
        let writes = Arc::new(AtomicUsize::new(0));
        let counter = writes.clone();
        let writer = PostponedWriter::new("test", Duration::from_millis(200), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        writer.flush().unwrap();
        assert_eq!(writes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_write_surfaces_on_flush_and_recovers() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let writer = PostponedWriter::new("test", Duration::from_millis(10), move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(RestructureError::StringError("disk full".into()))
            } else {
                Ok(())
            }
        });

        assert!(writer.flush().is_err());
        assert!(writer.flush().is_ok());
    }
}
