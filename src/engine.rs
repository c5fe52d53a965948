use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::env;
use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

use crate::journal::{OrderJournal, OrderKind, OrderLogEntry};
use crate::ladder::{self, LadderParams};
use crate::notifier::notify_loop_stall;
use crate::ports::file_store::SnapshotStore;
use crate::ports::replay_gateway::ReplayGateway;
use crate::position::{Position, PositionSide, TickCtx};
use crate::price_feed::{spawn_feed, MarkPriceStream, PriceCache};
use crate::trade::execution::gateway::{
    ExchangeGateway, ExchangePosition, PriceChangeTicker, SymbolPrecision,
};
use crate::trade::execution::gateway_box::GatewayBox;

const DEFAULT_INTERVAL_SECS: u64 = 5;
const DEFAULT_QUOTE_ASSET: &str = "USDT";
const DEFAULT_POSITIONS_FILE: &str = "ladderbot_positions.json";
const DEFAULT_ORDERS_FILE: &str = "ladderbot_orders.json";
/// Externally created exposures larger than this are taken over in manual
/// mode instead of being run through the ladder.
const MANUAL_NOTIONAL_THRESHOLD: Decimal = dec!(20);
const PRICE_CHANGE_DISPLAY_TOP: usize = 10;
const WATCHDOG_CHECK_SECS: u64 = 60;
const WATCHDOG_STALL_SECS: i64 = 300;
/// Core reference symbols are never auto-entered; stable-pair markets are
/// excluded wholesale.
const ENTRY_DENYLIST: &[&str] = &["BTCUSDT", "ETHUSDT", "BTCDOMUSDT"];
const STABLE_PAIR_MARKER: &str = "BUSD";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
struct EngineYaml {
    gateway_name: Option<String>,
    replay_file: Option<String>,
    interval_secs: Option<u64>,
    quote_asset: Option<String>,
    positions_snapshot_file: Option<String>,
    orders_snapshot_file: Option<String>,
    disable_snapshot_persist: Option<bool>,
    dca_budgets: Option<Vec<Decimal>>,
    dca_percentages: Option<Vec<Decimal>>,
    profit_ratio: Option<Decimal>,
    min_profit: Option<Decimal>,
    min_profit_after_dca: Option<Decimal>,
    stop_limit_distance: Option<Decimal>,
    stop_prices_distance: Option<Decimal>,
    increase_vol_param: Option<Decimal>,
    base_budget: Option<Decimal>,
    max_entry_budget_diff: Option<Decimal>,
    min_budget: Option<Decimal>,
    long_num_pos: Option<usize>,
    short_num_pos: Option<usize>,
    entry_change_threshold: Option<Decimal>,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub gateway_name: String,
    pub replay_file: Option<String>,
    pub interval_secs: u64,
    pub quote_asset: String,
    pub positions_snapshot_file: String,
    pub orders_snapshot_file: String,
    pub disable_snapshot_persist: bool,
    pub ladder: LadderParams,
}

impl EngineConfig {
    pub fn from_env_or_yaml() -> Result<Self> {
        let config_path = env::var("LADDERBOT_CONFIG_PATH")
            .ok()
            .filter(|value| !value.trim().is_empty());
        if let Some(path) = config_path {
            return Self::from_yaml_path(path);
        }
        Self::from_env()
    }

    pub fn from_yaml_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let file = File::open(path_ref)
            .with_context(|| format!("failed to open config {}", path_ref.display()))?;
        let yaml: EngineYaml = serde_yaml::from_reader(file)
            .with_context(|| format!("failed to parse config {}", path_ref.display()))?;

        let defaults = LadderParams::default();
        let mut cfg = EngineConfig {
            gateway_name: yaml.gateway_name.unwrap_or_else(|| "replay".to_string()),
            replay_file: yaml.replay_file,
            interval_secs: yaml.interval_secs.unwrap_or(DEFAULT_INTERVAL_SECS),
            quote_asset: yaml
                .quote_asset
                .unwrap_or_else(|| DEFAULT_QUOTE_ASSET.to_string()),
            positions_snapshot_file: yaml
                .positions_snapshot_file
                .unwrap_or_else(|| DEFAULT_POSITIONS_FILE.to_string()),
            orders_snapshot_file: yaml
                .orders_snapshot_file
                .unwrap_or_else(|| DEFAULT_ORDERS_FILE.to_string()),
            disable_snapshot_persist: yaml.disable_snapshot_persist.unwrap_or(false),
            ladder: LadderParams {
                dca_budgets: yaml.dca_budgets.unwrap_or(defaults.dca_budgets),
                dca_percentages: yaml.dca_percentages.unwrap_or(defaults.dca_percentages),
                profit_ratio: yaml.profit_ratio.unwrap_or(defaults.profit_ratio),
                min_profit: yaml.min_profit.unwrap_or(defaults.min_profit),
                min_profit_after_dca: yaml
                    .min_profit_after_dca
                    .unwrap_or(defaults.min_profit_after_dca),
                stop_limit_distance: yaml
                    .stop_limit_distance
                    .unwrap_or(defaults.stop_limit_distance),
                stop_prices_distance: yaml
                    .stop_prices_distance
                    .unwrap_or(defaults.stop_prices_distance),
                increase_vol_param: yaml
                    .increase_vol_param
                    .unwrap_or(defaults.increase_vol_param),
                base_budget: yaml.base_budget.unwrap_or(defaults.base_budget),
                max_entry_budget_diff: yaml
                    .max_entry_budget_diff
                    .unwrap_or(defaults.max_entry_budget_diff),
                min_budget: yaml.min_budget.unwrap_or(defaults.min_budget),
                long_num_pos: yaml.long_num_pos.unwrap_or(defaults.long_num_pos),
                short_num_pos: yaml.short_num_pos.unwrap_or(defaults.short_num_pos),
                entry_change_threshold: yaml
                    .entry_change_threshold
                    .unwrap_or(defaults.entry_change_threshold),
            },
        };
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_env() -> Result<Self> {
        let mut cfg = EngineConfig {
            gateway_name: "replay".to_string(),
            replay_file: None,
            interval_secs: DEFAULT_INTERVAL_SECS,
            quote_asset: DEFAULT_QUOTE_ASSET.to_string(),
            positions_snapshot_file: DEFAULT_POSITIONS_FILE.to_string(),
            orders_snapshot_file: DEFAULT_ORDERS_FILE.to_string(),
            disable_snapshot_persist: false,
            ladder: LadderParams::default(),
        };
        cfg.apply_env_overrides()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(value) = env::var("GATEWAY_NAME") {
            if !value.trim().is_empty() {
                self.gateway_name = value;
            }
        }
        if let Ok(value) = env::var("REPLAY_FILE") {
            if !value.trim().is_empty() {
                self.replay_file = Some(value);
            }
        }
        if let Ok(value) = env::var("INTERVAL_SECS") {
            if let Ok(parsed) = value.parse() {
                self.interval_secs = parsed;
            }
        }
        if let Ok(value) = env::var("QUOTE_ASSET") {
            if !value.trim().is_empty() {
                self.quote_asset = value;
            }
        }
        if let Ok(value) = env::var("POSITIONS_SNAPSHOT_FILE") {
            if !value.trim().is_empty() {
                self.positions_snapshot_file = value;
            }
        }
        if let Ok(value) = env::var("ORDERS_SNAPSHOT_FILE") {
            if !value.trim().is_empty() {
                self.orders_snapshot_file = value;
            }
        }
        if let Ok(value) = env::var("DISABLE_SNAPSHOT_PERSIST") {
            let lower = value.trim().to_ascii_lowercase();
            self.disable_snapshot_persist = lower == "1" || lower == "true" || lower == "yes";
        }

        if let Ok(value) = env::var("DCA_BASE_BUDGET") {
            if let Ok(parsed) = value.parse::<Decimal>() {
                self.ladder.dca_budgets = vec![parsed, parsed, parsed];
            }
        }
        if let Ok(value) = env::var("DCA_RATIOS") {
            let ratios: Result<Vec<Decimal>, _> = value
                .split(',')
                .map(|item| item.trim())
                .filter(|item| !item.is_empty())
                .map(|item| item.parse::<Decimal>())
                .collect();
            match ratios {
                Ok(ratios) if !ratios.is_empty() => self.ladder.dca_percentages = ratios,
                Ok(_) => return Err(anyhow!("DCA_RATIOS produced no valid ratios")),
                Err(err) => return Err(anyhow!("invalid DCA_RATIOS: {}", err)),
            }
        }
        if let Ok(value) = env::var("PROFIT_RATIO") {
            if let Ok(parsed) = value.parse() {
                self.ladder.profit_ratio = parsed;
            }
        }
        if let Ok(value) = env::var("MIN_PROFIT") {
            if let Ok(parsed) = value.parse() {
                self.ladder.min_profit = parsed;
            }
        }
        if let Ok(value) = env::var("MIN_PROFIT_AFTER_DCA") {
            if let Ok(parsed) = value.parse() {
                self.ladder.min_profit_after_dca = parsed;
            }
        }
        if let Ok(value) = env::var("STOP_LIMIT_DISTANCE") {
            if let Ok(parsed) = value.parse() {
                self.ladder.stop_limit_distance = parsed;
            }
        }
        if let Ok(value) = env::var("STOP_PRICES_DISTANCE") {
            if let Ok(parsed) = value.parse() {
                self.ladder.stop_prices_distance = parsed;
            }
        }
        if let Ok(value) = env::var("INCREASE_VOL_PARAM") {
            if let Ok(parsed) = value.parse() {
                self.ladder.increase_vol_param = parsed;
            }
        }
        if let Ok(value) = env::var("BASE_BUDGET") {
            if let Ok(parsed) = value.parse() {
                self.ladder.base_budget = parsed;
            }
        }
        if let Ok(value) = env::var("MAX_ENTRY_BUDGET_DIFF") {
            if let Ok(parsed) = value.parse() {
                self.ladder.max_entry_budget_diff = parsed;
            }
        }
        if let Ok(value) = env::var("MIN_BUDGET") {
            if let Ok(parsed) = value.parse() {
                self.ladder.min_budget = parsed;
            }
        }
        if let Ok(value) = env::var("NUM_OF_LONG") {
            if let Ok(parsed) = value.parse() {
                self.ladder.long_num_pos = parsed;
            }
        }
        if let Ok(value) = env::var("NUM_OF_SHORT") {
            if let Ok(parsed) = value.parse() {
                self.ladder.short_num_pos = parsed;
            }
        }
        if let Ok(value) = env::var("ENTRY_CHANGE_THRESHOLD") {
            if let Ok(parsed) = value.parse() {
                self.ladder.entry_change_threshold = parsed;
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.ladder.dca_budgets.is_empty() {
            return Err(anyhow!("dca_budgets must not be empty"));
        }
        if self.ladder.dca_percentages.is_empty() {
            return Err(anyhow!("dca_percentages must not be empty"));
        }
        if self.gateway_name == "replay" && self.replay_file.is_none() {
            return Err(anyhow!("REPLAY_FILE must be set for the replay gateway"));
        }
        Ok(())
    }
}

/// Shared handle the embedding control surface talks to: read views are
/// refreshed once per tick, imperative hooks are queued and drained at the
/// next tick.
#[derive(Clone)]
pub struct ControlHandle {
    shared: Arc<ControlShared>,
}

struct ControlShared {
    to_manual: Mutex<Vec<String>>,
    stop_loss: Mutex<HashMap<String, Decimal>>,
    open_requests: Mutex<Vec<(String, PositionSide)>>,
    ladder: RwLock<LadderParams>,
    positions_view: RwLock<Vec<Position>>,
    price_changes_view: RwLock<Vec<PriceChangeTicker>>,
    balance_view: RwLock<Decimal>,
    journal: OrderJournal,
}

impl ControlHandle {
    fn new(ladder: LadderParams, journal: OrderJournal) -> Self {
        Self {
            shared: Arc::new(ControlShared {
                to_manual: Mutex::new(Vec::new()),
                stop_loss: Mutex::new(HashMap::new()),
                open_requests: Mutex::new(Vec::new()),
                ladder: RwLock::new(ladder),
                positions_view: RwLock::new(Vec::new()),
                price_changes_view: RwLock::new(Vec::new()),
                balance_view: RwLock::new(Decimal::ZERO),
                journal,
            }),
        }
    }

    pub fn force_manual(&self, symbol: &str) {
        self.shared
            .to_manual
            .lock()
            .expect("control lock poisoned")
            .push(symbol.to_string());
    }

    pub fn set_stop_loss_percent(&self, symbol: &str, percent: Decimal) {
        self.shared
            .stop_loss
            .lock()
            .expect("control lock poisoned")
            .insert(symbol.to_string(), percent);
    }

    pub fn open_long(&self, symbol: &str) {
        self.shared
            .open_requests
            .lock()
            .expect("control lock poisoned")
            .push((symbol.to_string(), PositionSide::Long));
    }

    pub fn open_short(&self, symbol: &str) {
        self.shared
            .open_requests
            .lock()
            .expect("control lock poisoned")
            .push((symbol.to_string(), PositionSide::Short));
    }

    pub fn positions(&self) -> Vec<Position> {
        self.shared
            .positions_view
            .read()
            .expect("control lock poisoned")
            .clone()
    }

    pub fn orders(&self) -> Vec<OrderLogEntry> {
        self.shared.journal.snapshot()
    }

    pub fn price_changes(&self) -> Vec<PriceChangeTicker> {
        self.shared
            .price_changes_view
            .read()
            .expect("control lock poisoned")
            .clone()
    }

    pub fn balance(&self) -> Decimal {
        *self.shared.balance_view.read().expect("control lock poisoned")
    }

    pub fn ladder_params(&self) -> LadderParams {
        self.shared.ladder.read().expect("control lock poisoned").clone()
    }

    pub fn replace_ladder_params(&self, params: LadderParams) {
        *self.shared.ladder.write().expect("control lock poisoned") = params;
    }

    fn take_manual_requests(&self) -> Vec<String> {
        std::mem::take(&mut *self.shared.to_manual.lock().expect("control lock poisoned"))
    }

    fn take_stop_loss_overrides(&self) -> HashMap<String, Decimal> {
        std::mem::take(&mut *self.shared.stop_loss.lock().expect("control lock poisoned"))
    }

    fn take_open_requests(&self) -> Vec<(String, PositionSide)> {
        std::mem::take(
            &mut *self
                .shared
                .open_requests
                .lock()
                .expect("control lock poisoned"),
        )
    }

    fn publish_positions(&self, positions: &[Position]) {
        *self
            .shared
            .positions_view
            .write()
            .expect("control lock poisoned") = positions.to_vec();
    }

    fn publish_price_changes(&self, changes: Vec<PriceChangeTicker>) {
        *self
            .shared
            .price_changes_view
            .write()
            .expect("control lock poisoned") = changes;
    }

    fn publish_balance(&self, balance: Decimal) {
        *self.shared.balance_view.write().expect("control lock poisoned") = balance;
    }
}

/// The process-wide driver: one tick syncs the managed set against the
/// exchange, advances every position and persists the outcome. Positions
/// advance on their own tasks so a slow symbol never stalls the rest.
pub struct LadderEngine {
    cfg: EngineConfig,
    gateway: Arc<dyn ExchangeGateway>,
    replay: Option<Arc<ReplayGateway>>,
    stream: Arc<dyn MarkPriceStream>,
    prices: PriceCache,
    positions: Vec<Position>,
    precisions: HashMap<String, SymbolPrecision>,
    exchange_positions: HashMap<String, ExchangePosition>,
    journal: OrderJournal,
    store: SnapshotStore,
    control: ControlHandle,
    heartbeat: Arc<AtomicI64>,
    subscribed: HashSet<String>,
    feed_handles: Vec<JoinHandle<()>>,
}

impl LadderEngine {
    pub async fn new(cfg: EngineConfig) -> Result<Self> {
        let (gateway, replay, stream): (
            Arc<dyn ExchangeGateway>,
            Option<Arc<ReplayGateway>>,
            Arc<dyn MarkPriceStream>,
        ) = if cfg.gateway_name == "replay" {
            let file = cfg
                .replay_file
                .as_deref()
                .ok_or_else(|| anyhow!("replay gateway requires a replay file"))?;
            let replay = Arc::new(ReplayGateway::new(file)?);
            let boxed = GatewayBox::create(&cfg.gateway_name, Some(replay.clone()))
                .context("failed to initialize gateway")?;
            (Arc::new(boxed), Some(replay.clone()), replay)
        } else {
            // create() only knows the replay gateway; deployments link live
            // connectors in there, together with their price stream.
            let _boxed = GatewayBox::create(&cfg.gateway_name, None)
                .context("failed to initialize gateway")?;
            return Err(anyhow!(
                "gateway {} provides no price stream",
                cfg.gateway_name
            ));
        };

        let precisions = gateway
            .get_precisions()
            .await
            .context("failed to fetch symbol precisions")?;

        let journal = OrderJournal::new();
        let control = ControlHandle::new(cfg.ladder.clone(), journal.clone());
        let store = SnapshotStore::new(
            cfg.positions_snapshot_file.clone(),
            cfg.orders_snapshot_file.clone(),
        );

        Ok(Self {
            cfg,
            gateway,
            replay,
            stream,
            prices: PriceCache::new(),
            positions: Vec::new(),
            precisions,
            exchange_positions: HashMap::new(),
            journal,
            store,
            control,
            heartbeat: Arc::new(AtomicI64::new(0)),
            subscribed: HashSet::new(),
            feed_handles: Vec::new(),
        })
    }

    pub fn control_handle(&self) -> ControlHandle {
        self.control.clone()
    }

    pub async fn run(&mut self) -> Result<()> {
        log::info!(
            "[CONFIG] gateway={} interval_secs={} quote_asset={}",
            self.cfg.gateway_name,
            self.cfg.interval_secs,
            self.cfg.quote_asset
        );
        self.load_snapshot();
        let _watchdog = self.spawn_watchdog();
        self.spawn_initial_feeds().await;

        if let Some(replay) = self.replay.clone() {
            log::info!("[REPLAY] running from file");
            loop {
                // The replay driver is authoritative for the cache; the feed
                // tasks deliver the same values with task-scheduling lag.
                for (symbol, price) in replay.current_prices() {
                    self.prices.update(&symbol, price);
                }
                if let Err(err) = self.step().await {
                    log::error!("ladder step failed: {:?}", err);
                }
                self.heartbeat.store(Utc::now().timestamp(), Ordering::SeqCst);
                if !replay.tick() {
                    log::info!("[REPLAY] end of file reached");
                    break;
                }
            }
        } else {
            log::info!("[LIVE] running live");
            // let the feeds warm up before the first tick
            sleep(Duration::from_secs(5)).await;
            let mut ticker = tokio::time::interval(Duration::from_secs(self.cfg.interval_secs));
            loop {
                ticker.tick().await;
                if let Err(err) = self.step().await {
                    log::error!("ladder step failed: {:?}", err);
                }
                self.heartbeat.store(Utc::now().timestamp(), Ordering::SeqCst);
            }
        }
        Ok(())
    }

    async fn step(&mut self) -> Result<()> {
        self.refresh_balance().await?;
        self.admit_new_entries().await?;
        self.sync_positions_from_exchange().await?;
        self.monitor_positions().await;
        self.control.publish_positions(&self.positions);
        self.persist_snapshot();
        Ok(())
    }

    async fn refresh_balance(&mut self) -> Result<()> {
        let balances = self
            .gateway
            .get_balances()
            .await
            .context("failed to fetch balances")?;
        let total: Decimal = balances
            .iter()
            .filter(|entry| entry.asset == self.cfg.quote_asset)
            .map(|entry| entry.free + entry.locked)
            .sum();
        self.control.publish_balance(total);
        log::debug!("[BALANCE] {} {}", total, self.cfg.quote_asset);
        Ok(())
    }

    /// Admission control: operator-queued entries first (they bypass the
    /// caps), then ranked candidates while the per-side risky caps allow.
    async fn admit_new_entries(&mut self) -> Result<()> {
        let ladder = self.control.ladder_params();

        for (symbol, side) in self.control.take_open_requests() {
            match self.place_entry_order(&symbol, side, &ladder).await {
                Ok(()) => log::info!("[ADMIT] operator entry {} {:?}", symbol, side),
                Err(err) => log::error!("[ADMIT] operator entry {} failed: {:?}", symbol, err),
            }
        }

        let mut risky_long = self
            .positions
            .iter()
            .filter(|p| p.sl_price.is_none() && p.side == PositionSide::Long)
            .count();
        let mut risky_short = self
            .positions
            .iter()
            .filter(|p| p.sl_price.is_none() && p.side == PositionSide::Short)
            .count();

        let changes = self
            .gateway
            .get_price_changes()
            .await
            .context("failed to fetch price changes")?;
        let held: HashSet<&str> = self.positions.iter().map(|p| p.symbol.as_str()).collect();

        let mut unheld: Vec<&PriceChangeTicker> = changes
            .iter()
            .filter(|ticker| !held.contains(ticker.symbol.as_str()))
            .collect();
        unheld.sort_by(|a, b| b.percent_change.cmp(&a.percent_change));
        let mut display: Vec<PriceChangeTicker> = unheld
            .iter()
            .take(PRICE_CHANGE_DISPLAY_TOP)
            .map(|t| (*t).clone())
            .collect();
        display.extend(
            unheld
                .iter()
                .rev()
                .take(PRICE_CHANGE_DISPLAY_TOP)
                .map(|t| (*t).clone()),
        );
        self.control.publish_price_changes(display);

        if risky_long >= ladder.long_num_pos && risky_short >= ladder.short_num_pos {
            return Ok(());
        }

        let candidates: Vec<&PriceChangeTicker> = changes
            .iter()
            .filter(|ticker| {
                !held.contains(ticker.symbol.as_str()) && !Self::is_denied(&ticker.symbol)
            })
            .collect();

        let mut long_candidates: Vec<&PriceChangeTicker> = candidates
            .iter()
            .copied()
            .filter(|t| t.percent_change < -ladder.entry_change_threshold)
            .collect();
        long_candidates.sort_by(|a, b| a.percent_change.cmp(&b.percent_change));
        for candidate in long_candidates {
            if risky_long >= ladder.long_num_pos {
                break;
            }
            match self
                .place_entry_order(&candidate.symbol, PositionSide::Long, &ladder)
                .await
            {
                Ok(()) => {
                    log::info!(
                        "[ADMIT] long {} at change {}%",
                        candidate.symbol,
                        candidate.percent_change
                    );
                    risky_long += 1;
                }
                Err(err) => {
                    log::debug!("[ADMIT] skipping long {}: {:?}", candidate.symbol, err);
                    continue;
                }
            }
        }

        let mut short_candidates: Vec<&PriceChangeTicker> = candidates
            .iter()
            .copied()
            .filter(|t| t.percent_change > ladder.entry_change_threshold)
            .collect();
        short_candidates.sort_by(|a, b| b.percent_change.cmp(&a.percent_change));
        for candidate in short_candidates {
            if risky_short >= ladder.short_num_pos {
                break;
            }
            match self
                .place_entry_order(&candidate.symbol, PositionSide::Short, &ladder)
                .await
            {
                Ok(()) => {
                    log::info!(
                        "[ADMIT] short {} at change {}%",
                        candidate.symbol,
                        candidate.percent_change
                    );
                    risky_short += 1;
                }
                Err(err) => {
                    log::debug!("[ADMIT] skipping short {}: {:?}", candidate.symbol, err);
                    continue;
                }
            }
        }

        Ok(())
    }

    fn is_denied(symbol: &str) -> bool {
        symbol.contains(STABLE_PAIR_MARKER) || ENTRY_DENYLIST.contains(&symbol)
    }

    async fn place_entry_order(
        &self,
        symbol: &str,
        side: PositionSide,
        ladder_cfg: &LadderParams,
    ) -> Result<()> {
        let precision = self
            .precisions
            .get(symbol)
            .copied()
            .ok_or_else(|| anyhow!("no precision metadata for {}", symbol))?;
        let price = self.gateway.get_price(symbol).await?;
        if price <= Decimal::ZERO {
            return Err(anyhow!("no usable price for {}", symbol));
        }
        let qty = ladder::best_qty(
            ladder_cfg.base_budget / price,
            precision.quantity_precision,
            price,
            ladder_cfg.min_budget,
        );
        // Lot-size rounding can inflate tiny budgets well past the intended
        // notional; skip such symbols instead of oversizing the entry.
        if qty * price > ladder_cfg.base_budget + ladder_cfg.max_entry_budget_diff {
            return Err(anyhow!(
                "entry notional {} for {} exceeds allowed budget",
                qty * price,
                symbol
            ));
        }
        let order = self
            .gateway
            .create_market_order(symbol, side.accumulate_side(), qty)
            .await?;
        self.journal.record(OrderKind::Entry, order, None);
        Ok(())
    }

    /// Diffs the authoritative exchange list against the managed set and
    /// admits every untracked exposure worth managing. Removal is handled
    /// by the positions themselves when their exchange quantity hits zero.
    async fn sync_positions_from_exchange(&mut self) -> Result<()> {
        let ladder = self.control.ladder_params();
        let reported = self
            .gateway
            .get_positions()
            .await
            .context("failed to fetch exchange positions")?;

        let mut snapshots: HashMap<String, ExchangePosition> = HashMap::new();
        for snapshot in reported {
            if snapshot.position_qty == Decimal::ZERO {
                continue;
            }
            snapshots.insert(snapshot.symbol.clone(), snapshot);
        }
        self.exchange_positions = snapshots;

        let mut admitted: Vec<Position> = Vec::new();
        for snapshot in self.exchange_positions.values() {
            if snapshot.notional() < ladder.min_budget {
                continue;
            }
            if self
                .positions
                .iter()
                .any(|p| p.symbol == snapshot.symbol)
            {
                continue;
            }
            let Some(precision) = self.precisions.get(&snapshot.symbol).copied() else {
                log::warn!(
                    "[POSITION] no precision metadata for {}, cannot admit",
                    snapshot.symbol
                );
                continue;
            };
            let current_price = self
                .prices
                .latest(&snapshot.symbol)
                .unwrap_or(snapshot.mark_price);
            let position = Position::admit(
                snapshot,
                precision,
                current_price,
                &ladder,
                MANUAL_NOTIONAL_THRESHOLD,
            );
            log::info!(
                "[POSITION] admitted {} {:?} qty={} entry={} manual={}",
                position.symbol,
                position.side,
                position.entry_qty,
                position.entry_price,
                position.manual
            );
            admitted.push(position);
        }
        for position in admitted {
            let symbol = position.symbol.clone();
            self.ensure_feed(&symbol);
            self.positions.push(position);
        }
        Ok(())
    }

    /// Advances every position on its own task. A failed tick keeps the
    /// prior value so the position is simply revisited next tick.
    async fn monitor_positions(&mut self) {
        let ladder = self.control.ladder_params();
        let manual_requests = self.control.take_manual_requests();
        let mut sl_overrides = self.control.take_stop_loss_overrides();

        let mut handles = Vec::new();
        for mut position in std::mem::take(&mut self.positions) {
            if manual_requests.contains(&position.symbol) && !position.manual {
                log::info!("[POSITION] {} switched to manual", position.symbol);
                position.manual = true;
            }

            let current_price = match self.prices.latest(&position.symbol) {
                Some(price) => price,
                None => match self.gateway.get_price(&position.symbol).await {
                    Ok(price) => {
                        self.prices.update(&position.symbol, price);
                        price
                    }
                    Err(err) => {
                        log::warn!(
                            "[POSITION] no price for {}, skipping tick: {}",
                            position.symbol,
                            err
                        );
                        self.positions.push(position);
                        continue;
                    }
                },
            };

            let ctx = TickCtx {
                gateway: self.gateway.clone(),
                ladder: ladder.clone(),
                current_price,
                exchange_position: self.exchange_positions.get(&position.symbol).cloned(),
                journal: self.journal.clone(),
                stop_loss_override: sl_overrides.remove(&position.symbol),
            };
            let fallback = position.clone();
            handles.push((
                tokio::spawn(async move { position.advance(&ctx).await }),
                fallback,
            ));
        }

        for (handle, fallback) in handles {
            match handle.await {
                Ok(Ok(Some(next))) => self.positions.push(next),
                Ok(Ok(None)) => {}
                Ok(Err(err)) => {
                    log::error!("[POSITION] {} tick failed: {:?}", fallback.symbol, err);
                    self.positions.push(fallback);
                }
                Err(err) => {
                    log::error!("[POSITION] {} tick panicked: {:?}", fallback.symbol, err);
                    self.positions.push(fallback);
                }
            }
        }
    }

    fn persist_snapshot(&mut self) {
        if self.cfg.disable_snapshot_persist {
            return;
        }
        self.store.save_positions(&self.positions);
        if let Some(orders) = self.journal.take_dirty() {
            self.store.save_orders(&orders);
        }
    }

    fn load_snapshot(&mut self) {
        if self.cfg.disable_snapshot_persist {
            return;
        }
        if let Some(positions) = self.store.load_positions() {
            log::info!("[SNAPSHOT] restored {} positions", positions.len());
            self.positions = positions;
        }
        if let Some(orders) = self.store.load_orders() {
            log::info!("[SNAPSHOT] restored {} order log entries", orders.len());
            self.journal.restore(orders);
        }
    }

    async fn spawn_initial_feeds(&mut self) {
        let symbols: Vec<String> = match self.gateway.get_price_changes().await {
            Ok(changes) => changes.into_iter().map(|c| c.symbol).collect(),
            Err(err) => {
                log::warn!("[FEED] could not list symbols for feeds: {}", err);
                Vec::new()
            }
        };
        for symbol in symbols {
            self.ensure_feed(&symbol);
        }
        let tracked: Vec<String> = self.positions.iter().map(|p| p.symbol.clone()).collect();
        for symbol in tracked {
            self.ensure_feed(&symbol);
        }
    }

    fn ensure_feed(&mut self, symbol: &str) {
        if self.subscribed.insert(symbol.to_string()) {
            let handle = spawn_feed(
                self.prices.clone(),
                self.stream.clone(),
                symbol.to_string(),
            );
            self.feed_handles.push(handle);
        }
    }

    fn spawn_watchdog(&self) -> JoinHandle<()> {
        let heartbeat = self.heartbeat.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(WATCHDOG_CHECK_SECS));
            let mut alerted = false;
            loop {
                ticker.tick().await;
                let last = heartbeat.load(Ordering::SeqCst);
                if last == 0 {
                    continue;
                }
                let idle = Utc::now().timestamp() - last;
                if idle > WATCHDOG_STALL_SECS {
                    log::error!("[WATCHDOG] no tick for {}s", idle);
                    if !alerted {
                        notify_loop_stall(idle);
                        alerted = true;
                    }
                } else {
                    alerted = false;
                }
            }
        })
    }
}

#[cfg(test)]
impl LadderEngine {
    fn test_instance(
        gateway: Arc<dyn ExchangeGateway>,
        precisions: HashMap<String, SymbolPrecision>,
    ) -> Self {
        use tokio::sync::mpsc;

        struct NullStream;

        #[async_trait::async_trait]
        impl MarkPriceStream for NullStream {
            async fn subscribe(
                &self,
                _symbol: &str,
            ) -> Result<mpsc::Receiver<Decimal>, crate::trade::execution::gateway::GatewayError>
            {
                let (tx, rx) = mpsc::channel(1);
                std::mem::forget(tx);
                Ok(rx)
            }
        }

        let cfg = EngineConfig {
            gateway_name: "test".to_string(),
            replay_file: None,
            interval_secs: 1,
            quote_asset: DEFAULT_QUOTE_ASSET.to_string(),
            positions_snapshot_file: "test-positions.json".to_string(),
            orders_snapshot_file: "test-orders.json".to_string(),
            disable_snapshot_persist: true,
            ladder: LadderParams::default(),
        };
        let journal = OrderJournal::new();
        let control = ControlHandle::new(cfg.ladder.clone(), journal.clone());
        let store = SnapshotStore::new(
            cfg.positions_snapshot_file.clone(),
            cfg.orders_snapshot_file.clone(),
        );
        Self {
            cfg,
            gateway,
            replay: None,
            stream: Arc::new(NullStream),
            prices: PriceCache::new(),
            positions: Vec::new(),
            precisions,
            exchange_positions: HashMap::new(),
            journal,
            store,
            control,
            heartbeat: Arc::new(AtomicI64::new(0)),
            subscribed: HashSet::new(),
            feed_handles: Vec::new(),
        }
    }
}
