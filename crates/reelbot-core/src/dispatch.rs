//! Per-user inbound queues
//!
//! Each active user gets one worker task draining an unbounded FIFO, so a
//! user's messages are handled in arrival order while different users run
//! concurrently. A worker idle for longer than the session TTL closes its
//! queue and exits; the next message for that user starts a fresh one.

use crate::error::BotError;
use crate::flow::Bot;
use reelbot_ipc::{Envelope, OutboundMessage};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error};

pub const MAX_INBOUND_CONCURRENCY: usize = 8;

struct UserQueue {
    tx: mpsc::UnboundedSender<Envelope>,
    worker: JoinHandle<()>,
}

pub struct Dispatcher {
    bot: Arc<Bot>,
    outbound: broadcast::Sender<OutboundMessage>,
    fatal_tx: mpsc::Sender<BotError>,
    semaphore: Arc<Semaphore>,
    queues: HashMap<i64, UserQueue>,
    idle_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        bot: Arc<Bot>,
        outbound: broadcast::Sender<OutboundMessage>,
        fatal_tx: mpsc::Sender<BotError>,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            bot,
            outbound,
            fatal_tx,
            semaphore: Arc::new(Semaphore::new(MAX_INBOUND_CONCURRENCY)),
            queues: HashMap::new(),
            idle_timeout,
        }
    }

    #[cfg(test)]
    fn active_users(&self) -> usize {
        self.queues.values().filter(|queue| !queue.tx.is_closed()).count()
    }

    pub fn dispatch(&mut self, envelope: Envelope) {
        let user_id = envelope.from.id;
        let envelope = match self.queues.get(&user_id) {
            Some(queue) => match queue.tx.send(envelope) {
                Ok(()) => return,
                Err(mpsc::error::SendError(envelope)) => envelope,
            },
            None => envelope,
        };

        // the old worker may still be draining; the new one waits for it
        let previous = self.queues.remove(&user_id).map(|queue| queue.worker);
        self.queues.retain(|_, queue| !queue.tx.is_closed());

        let (tx, rx) = mpsc::unbounded_channel();
        // the receiver is alive, so this send cannot fail
        let _ = tx.send(envelope);
        debug!(user_id, workers = self.queues.len(), "Starting inbound worker");
        let worker = self.spawn_worker(rx, previous);
        self.queues.insert(user_id, UserQueue { tx, worker });
    }

    fn spawn_worker(
        &self,
        mut rx: mpsc::UnboundedReceiver<Envelope>,
        previous: Option<JoinHandle<()>>,
    ) -> JoinHandle<()> {
        let bot = Arc::clone(&self.bot);
        let outbound = self.outbound.clone();
        let fatal_tx = self.fatal_tx.clone();
        let semaphore = Arc::clone(&self.semaphore);
        let idle_timeout = self.idle_timeout;

        tokio::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }

            loop {
                let envelope = match tokio::time::timeout(idle_timeout, rx.recv()).await {
                    Ok(Some(envelope)) => envelope,
                    Ok(None) => return,
                    Err(_) => {
                        // refuse new sends, then finish what is already queued
                        rx.close();
                        match rx.recv().await {
                            Some(envelope) => envelope,
                            None => return,
                        }
                    }
                };

                let _permit = match semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(err) => {
                        error!(
                            "Inbound worker semaphore closed (trace_id={}): {}",
                            envelope.trace_id, err
                        );
                        return;
                    }
                };
                if let Err(err) = bot.respond(&envelope, &outbound).await {
                    let _ = fatal_tx.send(err).await;
                }
            }
        })
    }
}
