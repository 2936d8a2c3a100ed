use clap::Parser;
use serde_derive::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use descq::{Backend, Buffer, Queue, QueueError, ShmQueue, ShmQueueConfig};

const IDLE_SLEEP: Duration = Duration::from_micros(50);

#[derive(Parser)]
#[clap(about = "Sends every descriptor it receives straight back to the peer")]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "descq-echo.toml")]
    config: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
struct EchoConfig {
    queue: ShmQueueConfig,
}

impl Default for EchoConfig {
    fn default() -> Self {
        // The echo side reads what the sender writes.
        EchoConfig {
            queue: ShmQueueConfig::default().peer(),
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let opts: Opts = Opts::parse();
    let cfg: EchoConfig = confy::load_path(&opts.config)?;
    info!(queue = ?cfg.queue, "starting echo peer");

    let stop = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&stop))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&stop))?;

    let queue = ShmQueue::create(&cfg.queue)?;
    let mut echo = Echo::new(queue);
    while !stop.load(Ordering::Relaxed) {
        if !echo.poll()? {
            thread::sleep(IDLE_SLEEP);
        }
    }
    info!(echoed = echo.echoed, "stopping echo peer");
    if let Err(e) = echo.queue.destroy() {
        warn!(error = %e, "queue closed with buffers still held");
    }
    Ok(())
}

struct Echo<B: Backend> {
    queue: Queue<B>,
    // Dequeued but not yet accepted by the full send ring.
    pending: Option<Buffer>,
    echoed: u64,
}

impl<B: Backend> Echo<B> {
    fn new(queue: Queue<B>) -> Echo<B> {
        Echo {
            queue,
            pending: None,
            echoed: 0,
        }
    }

    /// Moves at most one descriptor. Returns whether anything happened.
    fn poll(&mut self) -> Result<bool, QueueError> {
        if let Some(buf) = self.pending {
            return match self.queue.enqueue(buf) {
                Ok(()) => {
                    self.pending = None;
                    self.echoed += 1;
                    self.queue.notify()?;
                    Ok(true)
                }
                Err(QueueError::QueueFull) => Ok(false),
                Err(e) => {
                    warn!(?buf, error = %e, "dropping descriptor that cannot be sent back");
                    self.pending = None;
                    Ok(true)
                }
            };
        }
        match self.queue.dequeue() {
            Ok(buf) => {
                debug!(?buf, "echo");
                self.pending = Some(buf);
                Ok(true)
            }
            Err(e) if e.is_retryable() => Ok(false),
            Err(e) => {
                warn!(error = %e, "skipping bad descriptor from peer");
                Ok(true)
            }
        }
    }
}
