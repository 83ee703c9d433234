//! Pool allocator: one actor per wallet owns that wallet's `PoolState`.
//!
//! Every mutation goes through the actor's command channel, so reservations
//! are totally ordered and no two callers can observe the same entries.
//! State is re-read from the store for each command and written back with a
//! forced save before the caller hears about the result.
//!
//! Background replenishment runs as a separate task; its batch is absorbed
//! by the actor when it completes, or earlier when a reservation needs it.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::config::PoolConfig;
use crate::errors::PoolError;
use crate::generator::KeyPairGenerator;
use crate::keys::KeyDeriver;
use crate::store::{DocumentStore, SaveOptions};
use crate::types::{KeyPair, PoolState};

const COMMAND_BUFFER: usize = 64;

/// Document id of a wallet's pool state.
pub fn pool_document_id(wallet_id: &str) -> String {
    format!("connection_key_pairs:{}", wallet_id)
}

/// Something that hands out and takes back connection key pairs.
#[async_trait]
pub trait KeyPairSource: Send + Sync {
    /// Remove up to `count` pairs from the pool. May return fewer.
    async fn reserve(&self, count: usize) -> Result<Vec<KeyPair>, PoolError>;

    /// Return pairs that were never put to use. Returns how many were taken back.
    async fn release(&self, pairs: Vec<KeyPair>) -> Result<usize, PoolError>;
}

type Reply<T> = oneshot::Sender<Result<T, PoolError>>;

enum Command {
    Reserve { count: usize, reply: Reply<Vec<KeyPair>> },
    Release { pairs: Vec<KeyPair>, reply: Reply<usize> },
    Replenish { reply: Reply<bool> },
    Snapshot { reply: Reply<PoolState> },
    WaitIdle { reply: Reply<()> },
    Reset { reply: Reply<()> },
}

/// Handle to a wallet's allocator actor.
#[derive(Clone)]
pub struct PoolAllocator {
    wallet_id: String,
    tx: mpsc::Sender<Command>,
}

impl PoolAllocator {
    /// Start the allocator actor for `wallet_id`.
    ///
    /// Must be called within a tokio runtime. There must be at most one
    /// allocator per wallet and store.
    pub fn spawn(
        wallet_id: impl Into<String>,
        store: DocumentStore,
        deriver: Arc<dyn KeyDeriver>,
        config: &PoolConfig,
    ) -> Self {
        let wallet_id = wallet_id.into();
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let actor = PoolActor {
            doc_id: pool_document_id(&wallet_id),
            wallet_id: wallet_id.clone(),
            store,
            generator: KeyPairGenerator::new(deriver, config.generator_workers),
            target_size: config.target_size,
            low_water_mark: config.low_water_mark,
            in_flight: None,
            idle_waiters: Vec::new(),
        };
        tokio::spawn(actor.run(rx));
        Self { wallet_id, tx }
    }

    pub fn wallet_id(&self) -> &str {
        &self.wallet_id
    }

    /// Reserve `count` pairs, generating inline when the pool runs short.
    pub async fn reserve(&self, count: usize) -> Result<Vec<KeyPair>, PoolError> {
        self.request(|reply| Command::Reserve { count, reply }).await
    }

    /// Put pairs that were never issued back into the pool.
    pub async fn release(&self, pairs: Vec<KeyPair>) -> Result<usize, PoolError> {
        self.request(|reply| Command::Release { pairs, reply }).await
    }

    /// Start a background top-up to the target size. Returns whether one started.
    pub async fn replenish(&self) -> Result<bool, PoolError> {
        self.request(|reply| Command::Replenish { reply }).await
    }

    /// Current persisted pool state.
    pub async fn snapshot(&self) -> Result<PoolState, PoolError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Wait until no background replenishment is in flight.
    pub async fn wait_idle(&self) -> Result<(), PoolError> {
        self.request(|reply| Command::WaitIdle { reply }).await
    }

    /// Delete the wallet's pool. The next generation starts at index 0.
    pub async fn reset(&self) -> Result<(), PoolError> {
        self.request(|reply| Command::Reset { reply }).await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, PoolError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| PoolError::Closed(self.wallet_id.clone()))?;
        rx.await
            .map_err(|_| PoolError::Closed(self.wallet_id.clone()))?
    }
}

#[async_trait]
impl KeyPairSource for PoolAllocator {
    async fn reserve(&self, count: usize) -> Result<Vec<KeyPair>, PoolError> {
        PoolAllocator::reserve(self, count).await
    }

    async fn release(&self, pairs: Vec<KeyPair>) -> Result<usize, PoolError> {
        PoolAllocator::release(self, pairs).await
    }
}

// ============================================================================
// Actor
// ============================================================================

struct InFlight {
    start: u64,
    count: usize,
    handle: JoinHandle<Vec<KeyPair>>,
}

struct PoolActor {
    wallet_id: String,
    doc_id: String,
    store: DocumentStore,
    generator: KeyPairGenerator,
    target_size: usize,
    low_water_mark: usize,
    in_flight: Option<InFlight>,
    idle_waiters: Vec<Reply<()>>,
}

async fn join_in_flight(in_flight: &mut Option<InFlight>) -> Result<Vec<KeyPair>, JoinError> {
    match in_flight {
        Some(batch) => (&mut batch.handle).await,
        None => std::future::pending().await,
    }
}

impl PoolActor {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        debug!(wallet = %self.wallet_id, "pool allocator started");
        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd).await,
                    None => break,
                },
                joined = join_in_flight(&mut self.in_flight), if self.in_flight.is_some() => {
                    if let Some(batch) = self.in_flight.take() {
                        self.finish_replenish(batch.start, batch.count, joined).await;
                    }
                }
            }
        }
        debug!(wallet = %self.wallet_id, "pool allocator stopped");
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Reserve { count, reply } => {
                let _ = reply.send(self.reserve(count).await);
            }
            Command::Release { pairs, reply } => {
                let _ = reply.send(self.release(pairs).await);
            }
            Command::Replenish { reply } => {
                let result = match self.load_state().await {
                    Ok(state) if self.in_flight.is_none() => Ok(self.start_replenish(&state)),
                    Ok(_) => Ok(false),
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.load_state().await);
            }
            Command::WaitIdle { reply } => {
                if self.in_flight.is_some() {
                    self.idle_waiters.push(reply);
                } else {
                    let _ = reply.send(Ok(()));
                }
            }
            Command::Reset { reply } => {
                if let Some(batch) = self.in_flight.take() {
                    batch.handle.abort();
                }
                self.notify_idle();
                let result = self
                    .store
                    .delete(&self.doc_id)
                    .await
                    .map(|_| ())
                    .map_err(PoolError::from);
                info!(wallet = %self.wallet_id, "pool reset");
                let _ = reply.send(result);
            }
        }
    }

    async fn reserve(&mut self, count: usize) -> Result<Vec<KeyPair>, PoolError> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut state = self.load_state().await?;

        if state.entries.len() < count {
            if let Some(batch) = self.in_flight.take() {
                debug!(wallet = %self.wallet_id, "waiting for in-flight replenishment");
                match batch.handle.await {
                    Ok(pairs) => {
                        self.absorb(&mut state, batch.start, pairs);
                    }
                    Err(e) => error!(wallet = %self.wallet_id, error = %e, "replenishment task failed"),
                }
            }
        }

        let reserved: Vec<KeyPair> = if state.entries.len() >= count {
            state.entries.drain(..count).collect()
        } else {
            let mut reserved = std::mem::take(&mut state.entries);
            let missing = count - reserved.len();
            let generated = self.generator.generate(state.next_index(), missing).await;
            if let Some(last) = generated.last() {
                state.last_connection_key_index = Some(last.connection_index);
            }
            if generated.len() < missing {
                warn!(
                    wallet = %self.wallet_id,
                    requested = count,
                    available = reserved.len() + generated.len(),
                    "short reservation"
                );
            }
            reserved.extend(generated);
            reserved
        };

        self.persist(&state).await?;
        debug!(
            wallet = %self.wallet_id,
            reserved = reserved.len(),
            remaining = state.entries.len(),
            "reserved key pairs"
        );

        if self.in_flight.is_none() {
            self.notify_idle();
        }
        if state.entries.len() < self.low_water_mark {
            self.start_replenish(&state);
        }
        Ok(reserved)
    }

    async fn release(&mut self, pairs: Vec<KeyPair>) -> Result<usize, PoolError> {
        let mut state = self.load_state().await?;

        if let Some(pair) = pairs.iter().find(|p| {
            state
                .last_connection_key_index
                .map_or(true, |w| p.connection_index > w)
        }) {
            return Err(PoolError::InvalidRelease(format!(
                "connection index {} was never generated",
                pair.connection_index
            )));
        }

        let mut accepted = 0;
        for pair in pairs {
            match state
                .entries
                .binary_search_by_key(&pair.connection_index, |p| p.connection_index)
            {
                Ok(_) => debug!(
                    wallet = %self.wallet_id,
                    connection_index = pair.connection_index,
                    "pair already in pool"
                ),
                Err(pos) => {
                    state.entries.insert(pos, pair);
                    accepted += 1;
                }
            }
        }

        if accepted > 0 {
            self.persist(&state).await?;
            info!(wallet = %self.wallet_id, accepted, "released key pairs back to pool");
        }
        Ok(accepted)
    }

    /// Spawn a top-up to `target_size` if nothing is in flight.
    fn start_replenish(&mut self, state: &PoolState) -> bool {
        if self.in_flight.is_some() {
            return false;
        }
        let count = self.target_size.saturating_sub(state.entries.len());
        if count == 0 {
            return false;
        }

        let start = state.next_index();
        let generator = self.generator.clone();
        let handle = tokio::spawn(async move { generator.generate(start, count).await });
        info!(wallet = %self.wallet_id, start, count, "replenishing key pool");
        self.in_flight = Some(InFlight {
            start,
            count,
            handle,
        });
        true
    }

    async fn finish_replenish(
        &mut self,
        start: u64,
        requested: usize,
        joined: Result<Vec<KeyPair>, JoinError>,
    ) {
        let pairs = match joined {
            Ok(pairs) => pairs,
            Err(e) => {
                error!(wallet = %self.wallet_id, error = %e, "replenishment task failed");
                self.notify_idle();
                return;
            }
        };
        let full = !pairs.is_empty() && pairs.len() == requested;

        let outcome = match self.load_state().await {
            Ok(mut state) => {
                let absorbed = self.absorb(&mut state, start, pairs);
                if absorbed == 0 {
                    Ok(None)
                } else {
                    self.persist(&state).await.map(|_| Some(state))
                }
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(Some(state)) => {
                if full && state.entries.len() < self.low_water_mark {
                    self.start_replenish(&state);
                }
            }
            Ok(None) => {}
            Err(e) => {
                error!(wallet = %self.wallet_id, error = %e, "failed to persist replenished key pairs");
            }
        }

        if self.in_flight.is_none() {
            self.notify_idle();
        }
    }

    /// Append a generated batch if it continues from the watermark.
    fn absorb(&self, state: &mut PoolState, start: u64, pairs: Vec<KeyPair>) -> usize {
        let Some(last) = pairs.last().map(|p| p.connection_index) else {
            warn!(wallet = %self.wallet_id, start, "replenishment produced no key pairs");
            return 0;
        };
        if start != state.next_index() {
            warn!(
                wallet = %self.wallet_id,
                start,
                expected = state.next_index(),
                "discarding stale replenishment batch"
            );
            return 0;
        }

        let absorbed = pairs.len();
        state.entries.extend(pairs);
        state.last_connection_key_index = Some(last);
        debug!(wallet = %self.wallet_id, absorbed, pool = state.entries.len(), "absorbed replenishment");
        absorbed
    }

    async fn load_state(&self) -> Result<PoolState, PoolError> {
        Ok(self
            .store
            .load::<PoolState>(&self.doc_id)
            .await?
            .unwrap_or_default())
    }

    async fn persist(&self, state: &PoolState) -> Result<(), PoolError> {
        self.store
            .store(&self.doc_id, state, SaveOptions::forced())
            .await?;
        Ok(())
    }

    fn notify_idle(&mut self) {
        for waiter in self.idle_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }
}
