use anyhow::{Context, Result, bail};
use solana_sdk::pubkey::Pubkey;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::retry::RetryPolicy;
use crate::types::HolderTiers;

pub fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_required(key: &str) -> Result<String> {
    env::var(key).with_context(|| format!("{key} must be set"))
}

fn env_pubkey(key: &str) -> Result<Option<Pubkey>> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => Pubkey::from_str(raw.trim())
            .map(Some)
            .with_context(|| format!("{key} is not a valid address")),
        _ => Ok(None),
    }
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(env_parse(key, default))
}

fn env_retry(prefix: &str, default: RetryPolicy) -> RetryPolicy {
    let default_delay_ms = default.delay_before_retry(1).as_millis() as u64;
    RetryPolicy::fixed(
        env_parse(&format!("RETRY_{prefix}_ATTEMPTS"), default.max_attempts),
        Duration::from_millis(env_parse(&format!("RETRY_{prefix}_DELAY_MS"), default_delay_ms)),
    )
}

/// Retry policy per class of outbound call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicies {
    /// Balance, status and holder reads.
    pub rpc: RetryPolicy,
    pub swap: RetryPolicy,
    pub payout: RetryPolicy,
    pub burn: RetryPolicy,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            rpc: RetryPolicy::fixed(3, Duration::from_secs(1)),
            swap: RetryPolicy::fixed(3, Duration::from_secs(2)),
            payout: RetryPolicy::fixed(3, Duration::from_secs(2)),
            burn: RetryPolicy::fixed(4, Duration::from_secs(2)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub balance_stale_after: Duration,
    pub holders_stale_after: Duration,
    pub tick: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            balance_stale_after: Duration::from_secs(45),
            holders_stale_after: Duration::from_secs(600),
            tick: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleConfig {
    pub distribution_interval: Duration,
    /// `None` leaves burns to manual triggers only.
    pub burn_interval: Option<Duration>,
    pub eligibility_tick: Duration,
    /// Share of the treasury paid out per distribution, in basis points.
    pub distribution_bps: u16,
    /// Share of the treasury spent per buy-and-burn, in basis points.
    pub burn_bps: u16,
    /// Cycles refuse to run at or below this treasury balance.
    pub minimum_balance: u64,
    pub payout_batch_size: usize,
    /// How long a sent transaction is polled before it counts as unconfirmed.
    /// Roughly one blockhash lifetime.
    pub confirm_timeout: Duration,
    pub confirm_poll_interval: Duration,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            distribution_interval: Duration::from_secs(3600),
            burn_interval: None,
            eligibility_tick: Duration::from_secs(30),
            distribution_bps: 9_500,
            burn_bps: 9_500,
            minimum_balance: 10_000_000,
            payout_batch_size: 20,
            confirm_timeout: Duration::from_secs(90),
            confirm_poll_interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub treasury: Pubkey,
    pub token_mint: Pubkey,
    pub cache: CacheConfig,
    pub cycles: CycleConfig,
    pub tiers: HolderTiers,
    pub retry: RetryPolicies,
}

impl CoordinatorConfig {
    pub fn new(treasury: Pubkey, token_mint: Pubkey) -> Self {
        Self {
            treasury,
            token_mint,
            cache: CacheConfig::default(),
            cycles: CycleConfig::default(),
            tiers: HolderTiers::default(),
            retry: RetryPolicies::default(),
        }
    }

    /// Reads the coordinator settings from the environment. `treasury` is
    /// passed in when it was derived from the signing keypair instead.
    pub fn from_env(treasury: Option<Pubkey>) -> Result<Self> {
        let treasury = match treasury {
            Some(t) => t,
            None => env_pubkey("TREASURY_ADDRESS")?
                .context("TREASURY_ADDRESS or TREASURY_KEYPAIR_PATH must be set")?,
        };
        let token_mint = env_pubkey("TOKEN_MINT")?.context("TOKEN_MINT must be set")?;

        let cache_defaults = CacheConfig::default();
        let cycle_defaults = CycleConfig::default();
        let tier_defaults = HolderTiers::default();
        let burn_interval_secs: u64 = env_parse("BURN_INTERVAL_SECS", 0);

        let config = Self {
            treasury,
            token_mint,
            cache: CacheConfig {
                balance_stale_after: env_secs("BALANCE_STALE_SECS", cache_defaults.balance_stale_after.as_secs()),
                holders_stale_after: env_secs("HOLDERS_STALE_SECS", cache_defaults.holders_stale_after.as_secs()),
                tick: env_secs("CACHE_TICK_SECS", cache_defaults.tick.as_secs()),
            },
            cycles: CycleConfig {
                distribution_interval: env_secs(
                    "DISTRIBUTION_INTERVAL_SECS",
                    cycle_defaults.distribution_interval.as_secs(),
                ),
                burn_interval: (burn_interval_secs > 0).then(|| Duration::from_secs(burn_interval_secs)),
                eligibility_tick: env_secs("ELIGIBILITY_TICK_SECS", cycle_defaults.eligibility_tick.as_secs()),
                distribution_bps: env_parse("DISTRIBUTION_BPS", cycle_defaults.distribution_bps),
                burn_bps: env_parse("BURN_BPS", cycle_defaults.burn_bps),
                minimum_balance: env_parse("MINIMUM_BALANCE_LAMPORTS", cycle_defaults.minimum_balance),
                payout_batch_size: env_parse("PAYOUT_BATCH_SIZE", cycle_defaults.payout_batch_size),
                confirm_timeout: env_secs("CONFIRM_TIMEOUT_SECS", cycle_defaults.confirm_timeout.as_secs()),
                confirm_poll_interval: Duration::from_millis(env_parse(
                    "CONFIRM_POLL_MS",
                    cycle_defaults.confirm_poll_interval.as_millis() as u64,
                )),
            },
            tiers: HolderTiers {
                top_holders: env_parse("TOP_HOLDERS_COUNT", tier_defaults.top_holders),
                diamond_hands_rank: env_parse("DIAMOND_HANDS_RANK", tier_defaults.diamond_hands_rank),
                early_adopters_rank: env_parse("EARLY_ADOPTERS_RANK", tier_defaults.early_adopters_rank),
                min_balance: env_parse("MIN_HOLDER_BALANCE", tier_defaults.min_balance),
            },
            retry: {
                let defaults = RetryPolicies::default();
                RetryPolicies {
                    rpc: env_retry("RPC", defaults.rpc),
                    swap: env_retry("SWAP", defaults.swap),
                    payout: env_retry("PAYOUT", defaults.payout),
                    burn: env_retry("BURN", defaults.burn),
                }
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cycles.distribution_bps > 10_000 || self.cycles.burn_bps > 10_000 {
            bail!("DISTRIBUTION_BPS and BURN_BPS must be at most 10000");
        }
        if self.cycles.payout_batch_size == 0 {
            bail!("PAYOUT_BATCH_SIZE must be at least 1");
        }
        let intervals = [
            ("CACHE_TICK_SECS", self.cache.tick),
            ("ELIGIBILITY_TICK_SECS", self.cycles.eligibility_tick),
            ("DISTRIBUTION_INTERVAL_SECS", self.cycles.distribution_interval),
            ("CONFIRM_POLL_MS", self.cycles.confirm_poll_interval),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                bail!("{name} must be greater than zero");
            }
        }
        let policies = [
            ("RPC", self.retry.rpc),
            ("SWAP", self.retry.swap),
            ("PAYOUT", self.retry.payout),
            ("BURN", self.retry.burn),
        ];
        for (name, policy) in policies {
            if policy.max_attempts == 0 {
                bail!("RETRY_{name}_ATTEMPTS must be at least 1");
            }
        }
        Ok(())
    }
}

/// Connection settings consumed by `main` only.
#[derive(Debug, Clone)]
pub struct ServiceEndpoints {
    pub rpc_url: String,
    pub rpc_timeout: Duration,
    pub keypair_path: Option<String>,
    pub jupiter_api_url: String,
    pub swap_slippage_bps: u16,
    pub clickhouse_url: Option<String>,
    pub history_table: String,
}

impl ServiceEndpoints {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            rpc_url: env_required("SOLANA_RPC_URL")?,
            rpc_timeout: env_secs("RPC_TIMEOUT_SECS", 30),
            keypair_path: env::var("TREASURY_KEYPAIR_PATH").ok().filter(|p| !p.trim().is_empty()),
            jupiter_api_url: env::var("JUPITER_API_URL")
                .unwrap_or_else(|_| "https://quote-api.jup.ag/v6".to_string()),
            swap_slippage_bps: env_parse("SWAP_SLIPPAGE_BPS", 100),
            clickhouse_url: env::var("CLICKHOUSE_URL").ok().filter(|u| !u.trim().is_empty()),
            history_table: env::var("HISTORY_TABLE").unwrap_or_else(|_| "reward_history".to_string()),
        })
    }
}
