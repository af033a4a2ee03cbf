//! Scriptable collaborators for unit tests.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use solana_sdk::{pubkey::Pubkey, signature::Signature, transaction::VersionedTransaction};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

use crate::cache::{CacheSources, DataCache, SliceKind};
use crate::clock::{Clock, ManualClock};
use crate::config::CoordinatorConfig;
use crate::cycle::{CycleOutcome, CycleRunner, ProgressTracker};
use crate::error::{Error, Result};
use crate::history::{HistoryStore, MemoryHistoryStore};
use crate::run_lock::{RunLock, RunOwner};
use crate::services::{ChainClient, SignedTx, SwapClient};
use crate::types::{HistoryRecord, Payout, Quote, TokenHolder, TxStatus};

fn next_error(queue: &Mutex<VecDeque<Error>>) -> Option<Error> {
    queue.lock().unwrap().pop_front()
}

async fn pass_gate(gate: &Mutex<Option<Arc<Semaphore>>>) {
    let gate = gate.lock().unwrap().clone();
    if let Some(gate) = gate {
        gate.acquire().await.unwrap().forget();
    }
}

enum Effect {
    Payouts(Vec<Payout>),
    Burn(u64),
}

fn unsigned() -> VersionedTransaction {
    VersionedTransaction::default()
}

#[derive(Default)]
pub struct FakeChain {
    balance: Mutex<u64>,
    tokens: Mutex<u64>,
    holders: Mutex<Vec<TokenHolder>>,
    statuses: Mutex<VecDeque<TxStatus>>,
    balance_errors: Mutex<VecDeque<Error>>,
    payout_errors: Mutex<VecDeque<Error>>,
    burn_errors: Mutex<VecDeque<Error>>,
    balance_gate: Mutex<Option<Arc<Semaphore>>>,
    payout_gate: Mutex<Option<Arc<Semaphore>>>,
    balance_calls: AtomicU32,
    payout_calls: AtomicU32,
    lost_replies: AtomicU32,
    signed: Mutex<HashMap<Signature, Effect>>,
    landed: Mutex<HashSet<Signature>>,
    payouts: Mutex<Vec<Vec<Payout>>>,
    burns: Mutex<Vec<u64>>,
}

impl FakeChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_balance(&self, lamports: u64) {
        *self.balance.lock().unwrap() = lamports;
    }

    pub fn balance(&self) -> u64 {
        *self.balance.lock().unwrap()
    }

    pub fn credit_tokens(&self, amount: u64) {
        *self.tokens.lock().unwrap() += amount;
    }

    pub fn token_balance(&self) -> u64 {
        *self.tokens.lock().unwrap()
    }

    pub fn set_holders(&self, holders: Vec<TokenHolder>) {
        *self.holders.lock().unwrap() = holders;
    }

    /// Statuses handed out for landed transactions, in order. Confirmed once
    /// the script runs out; anything not landed reads as pending.
    pub fn script_statuses(&self, statuses: Vec<TxStatus>) {
        self.statuses.lock().unwrap().extend(statuses);
    }

    pub fn fail_balance(&self, errors: Vec<Error>) {
        self.balance_errors.lock().unwrap().extend(errors);
    }

    pub fn fail_payouts(&self, errors: Vec<Error>) {
        self.payout_errors.lock().unwrap().extend(errors);
    }

    pub fn fail_burns(&self, errors: Vec<Error>) {
        self.burn_errors.lock().unwrap().extend(errors);
    }

    /// The next `n` submissions land but their reply is lost in transit.
    pub fn lose_replies(&self, n: u32) {
        self.lost_replies.store(n, Ordering::SeqCst);
    }

    /// Makes every balance fetch wait for a permit on the returned semaphore.
    pub fn gate_balance(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.balance_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn gate_payouts(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.payout_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn balance_calls(&self) -> u32 {
        self.balance_calls.load(Ordering::SeqCst)
    }

    /// Payout submissions that reached the chain, landed or not.
    pub fn payout_calls(&self) -> u32 {
        self.payout_calls.load(Ordering::SeqCst)
    }

    /// Batches that landed, in send order.
    pub fn sent_payouts(&self) -> Vec<Vec<Payout>> {
        self.payouts.lock().unwrap().clone()
    }

    pub fn burned(&self) -> Vec<u64> {
        self.burns.lock().unwrap().clone()
    }

    fn has_landed(&self, signature: &Signature) -> bool {
        self.landed.lock().unwrap().contains(signature)
    }

    /// Lands a swap: lamports leave the treasury and tokens arrive.
    fn settle_swap(&self, signature: Signature, lamports_in: u64, tokens_out: u64) {
        {
            let mut balance = self.balance.lock().unwrap();
            *balance = balance.saturating_sub(lamports_in);
        }
        self.credit_tokens(tokens_out);
        self.landed.lock().unwrap().insert(signature);
    }

    fn register(&self, effect: Effect) -> SignedTx {
        let signature = Signature::new_unique();
        self.signed.lock().unwrap().insert(signature, effect);
        SignedTx {
            signature,
            transaction: unsigned(),
        }
    }

    async fn land_payouts(&self, payouts: Vec<Payout>) -> Result<()> {
        self.payout_calls.fetch_add(1, Ordering::SeqCst);
        pass_gate(&self.payout_gate).await;
        if let Some(e) = next_error(&self.payout_errors) {
            return Err(e);
        }
        let total: u64 = payouts.iter().map(|p| p.lamports).sum();
        {
            let mut balance = self.balance.lock().unwrap();
            *balance = balance.saturating_sub(total);
        }
        self.payouts.lock().unwrap().push(payouts);
        Ok(())
    }

    fn land_burn(&self, amount: u64) -> Result<()> {
        if let Some(e) = next_error(&self.burn_errors) {
            return Err(e);
        }
        let mut tokens = self.tokens.lock().unwrap();
        if amount > *tokens {
            return Err(Error::Validation(format!("insufficient token balance: {amount} > {}", *tokens)));
        }
        *tokens -= amount;
        self.burns.lock().unwrap().push(amount);
        Ok(())
    }
}

#[async_trait]
impl ChainClient for FakeChain {
    async fn get_balance(&self, _address: &Pubkey) -> Result<u64> {
        self.balance_calls.fetch_add(1, Ordering::SeqCst);
        pass_gate(&self.balance_gate).await;
        if let Some(e) = next_error(&self.balance_errors) {
            return Err(e);
        }
        Ok(self.balance())
    }

    async fn get_token_balance(&self, _mint: &Pubkey) -> Result<u64> {
        Ok(self.token_balance())
    }

    async fn get_transaction_status(&self, signature: &Signature) -> Result<TxStatus> {
        if !self.has_landed(signature) {
            return Ok(TxStatus::Pending);
        }
        Ok(self.statuses.lock().unwrap().pop_front().unwrap_or(TxStatus::Confirmed))
    }

    async fn fetch_holders(&self, _mint: &Pubkey) -> Result<Vec<TokenHolder>> {
        Ok(self.holders.lock().unwrap().clone())
    }

    async fn sign_payouts(&self, payouts: &[Payout]) -> Result<SignedTx> {
        if payouts.is_empty() {
            return Err(Error::Validation("empty payout batch".into()));
        }
        Ok(self.register(Effect::Payouts(payouts.to_vec())))
    }

    async fn sign_burn(&self, _mint: &Pubkey, amount: u64) -> Result<SignedTx> {
        Ok(self.register(Effect::Burn(amount)))
    }

    async fn submit(&self, tx: &SignedTx) -> Result<Signature> {
        if self.has_landed(&tx.signature) {
            return Ok(tx.signature);
        }
        let effect = match self.signed.lock().unwrap().get(&tx.signature) {
            Some(Effect::Payouts(payouts)) => Effect::Payouts(payouts.clone()),
            Some(Effect::Burn(amount)) => Effect::Burn(*amount),
            None => return Err(Error::Validation(format!("unknown transaction {}", tx.signature))),
        };
        match effect {
            Effect::Payouts(payouts) => self.land_payouts(payouts).await?,
            Effect::Burn(amount) => self.land_burn(amount)?,
        }
        self.landed.lock().unwrap().insert(tx.signature);

        let lost = self
            .lost_replies
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lost {
            return Err(Error::TransientNetwork("reply lost".into()));
        }
        Ok(tx.signature)
    }
}

/// Swap venue paying a fixed number of token units per lamport. Executed
/// swaps settle on the shared [`FakeChain`].
pub struct FakeSwap {
    rate: u64,
    chain: Arc<FakeChain>,
    fill_bps: AtomicU64,
    quote_errors: Mutex<VecDeque<Error>>,
    execute_errors: Mutex<VecDeque<Error>>,
    quote_calls: AtomicU32,
    prepared: Mutex<HashMap<Signature, Quote>>,
    executed: Mutex<Vec<u64>>,
}

impl FakeSwap {
    pub fn new(rate: u64, chain: Arc<FakeChain>) -> Self {
        Self {
            rate,
            chain,
            fill_bps: AtomicU64::new(10_000),
            quote_errors: Mutex::default(),
            execute_errors: Mutex::default(),
            quote_calls: AtomicU32::new(0),
            prepared: Mutex::default(),
            executed: Mutex::default(),
        }
    }

    /// Share of the quoted output that actually arrives, in basis points.
    pub fn set_fill_bps(&self, bps: u64) {
        self.fill_bps.store(bps, Ordering::SeqCst);
    }

    pub fn fail_quotes(&self, errors: Vec<Error>) {
        self.quote_errors.lock().unwrap().extend(errors);
    }

    pub fn fail_executions(&self, errors: Vec<Error>) {
        self.execute_errors.lock().unwrap().extend(errors);
    }

    pub fn quote_calls(&self) -> u32 {
        self.quote_calls.load(Ordering::SeqCst)
    }

    /// `amount_in` of every executed swap.
    pub fn executed(&self) -> Vec<u64> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl SwapClient for FakeSwap {
    async fn quote(&self, amount_in: u64) -> Result<Quote> {
        self.quote_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = next_error(&self.quote_errors) {
            return Err(e);
        }
        Ok(Quote {
            amount_in,
            amount_out: amount_in.saturating_mul(self.rate),
            route: serde_json::json!({ "fake": true }),
        })
    }

    async fn prepare(&self, quote: &Quote) -> Result<SignedTx> {
        let signature = Signature::new_unique();
        self.prepared.lock().unwrap().insert(signature, quote.clone());
        Ok(SignedTx {
            signature,
            transaction: unsigned(),
        })
    }

    async fn execute(&self, tx: &SignedTx) -> Result<Signature> {
        if self.chain.has_landed(&tx.signature) {
            return Ok(tx.signature);
        }
        if let Some(e) = next_error(&self.execute_errors) {
            return Err(e);
        }
        let quote = self
            .prepared
            .lock()
            .unwrap()
            .get(&tx.signature)
            .cloned()
            .ok_or_else(|| Error::Validation(format!("unknown swap {}", tx.signature)))?;
        let filled = (quote.amount_out as u128 * self.fill_bps.load(Ordering::SeqCst) as u128 / 10_000) as u64;
        self.chain.settle_swap(tx.signature, quote.amount_in, filled);
        self.executed.lock().unwrap().push(quote.amount_in);
        Ok(tx.signature)
    }
}

/// History store whose appends can be switched off to simulate an outage.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryHistoryStore,
    failing: AtomicBool,
}

impl FlakyStore {
    pub fn fail_appends(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl HistoryStore for FlakyStore {
    async fn append(&self, record: HistoryRecord) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Persistence("history store unavailable".into()));
        }
        self.inner.append(record).await
    }

    async fn recent(&self, limit: usize) -> Result<Vec<HistoryRecord>> {
        self.inner.recent(limit).await
    }

    async fn all(&self) -> Result<Vec<HistoryRecord>> {
        self.inner.all().await
    }
}

pub fn start_time() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap()
}

/// Everything a cycle needs, wired to fakes and a manual clock.
pub struct Harness {
    pub config: CoordinatorConfig,
    pub clock: ManualClock,
    pub chain: Arc<FakeChain>,
    pub swap: Arc<FakeSwap>,
    pub store: Arc<FlakyStore>,
    pub cache: Arc<DataCache>,
    pub lock: Arc<RunLock>,
    pub progress: Arc<ProgressTracker>,
    pub runner: Arc<CycleRunner>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(|_| {})
    }

    pub fn with(tweak: impl FnOnce(&mut CoordinatorConfig)) -> Self {
        let mut config = CoordinatorConfig::new(Pubkey::new_unique(), Pubkey::new_unique());
        tweak(&mut config);

        let clock = ManualClock::new(start_time());
        let chain = Arc::new(FakeChain::new());
        let swap = Arc::new(FakeSwap::new(2, chain.clone()));
        let store = Arc::new(FlakyStore::default());
        let cache = Arc::new(DataCache::new(
            CacheSources {
                chain: chain.clone(),
                history: store.clone(),
                treasury: config.treasury,
                token_mint: config.token_mint,
                tiers: config.tiers,
                rpc_retry: config.retry.rpc,
            },
            &config.cache,
            Arc::new(clock.clone()),
        ));
        let progress = Arc::new(ProgressTracker::new());
        let runner = Arc::new(CycleRunner::new(
            store.clone(),
            chain.clone(),
            swap.clone(),
            cache.clone(),
            progress.clone(),
            Arc::new(clock.clone()),
            config.token_mint,
            config.cycles.clone(),
            config.retry,
        ));

        Self {
            config,
            clock,
            chain,
            swap,
            store,
            cache,
            lock: Arc::new(RunLock::new()),
            progress,
            runner,
        }
    }

    pub fn clock_now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Replaces the chain's holder list with one holder per balance.
    pub fn set_holders(&self, balances: &[u64]) {
        self.chain.set_holders(
            balances
                .iter()
                .map(|&balance| TokenHolder {
                    address: Pubkey::new_unique(),
                    balance,
                })
                .collect(),
        );
    }

    pub async fn refresh_all(&self) {
        for kind in SliceKind::ALL {
            self.cache.refresh(kind).await;
        }
    }

    pub async fn run(&self, owner: RunOwner) -> CycleOutcome {
        let guard = self.lock.try_guard(owner).expect("lock is free");
        self.runner.run(guard).await
    }
}
