use std::sync::Arc;
use std::sync::Mutex;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use fnv::FnvHashMap;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::account::AccountState;
use crate::breaker::ApiCircuitBreaker;
use crate::candle::Candle;
use crate::clock::SimClock;
use crate::data_store::DataStore;
use crate::error::{OperationalError, ReplayError, ReplayResult};
use crate::fault::FaultInjector;
use crate::fill::Fill;
use crate::liquidity::{LiquidityParams, VolatilityRegime};
use crate::order::{NewOrderRequest, Order, OrderId, OrderKind, OrderStatus, OrderView, Side};
use crate::position::{Position, PositionSide, PositionView};

/// Per-symbol funding curve: the perpetual-futures funding rate and its multiplier
/// under elevated volatility.
#[derive(Debug, Clone, Copy)]
pub struct FundingCurve {
    pub base_rate_8h_bps: Decimal,
    pub vol_spike_multiplier: Decimal,
}

impl Default for FundingCurve {
    fn default() -> Self {
        Self {
            base_rate_8h_bps: Decimal::new(20, 1), // 2.0 bps
            vol_spike_multiplier: Decimal::new(3, 0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExchangeSimConfig {
    pub initial_equity_usd: Decimal,
    pub min_order_size_usd: Decimal,
    pub maker_bps: Decimal,
    pub taker_bps: Decimal,
    pub base_entered_book_delay_secs: f64,
    pub jitter_enabled: bool,
    pub jitter_seed: u64,
    pub jitter_delay_pct: f64,
    pub slippage_factor: Decimal,
    pub jitter_slippage_pct: f64,
    pub jitter_fill_bps: Decimal,
    pub hide_entered_book_from_open_orders: bool,
    pub latency_enabled: bool,
    pub latency_base_ms: u64,
    pub latency_max_ms: u64,
    pub funding_curves: FnvHashMap<String, FundingCurve>,
    pub default_funding_curve: FundingCurve,
    pub refuse_orders_in_dry_run: bool,
    pub dry_run: bool,
    pub default_leverage: Decimal,
}

impl Default for ExchangeSimConfig {
    fn default() -> Self {
        Self {
            initial_equity_usd: Decimal::new(10_000, 0),
            min_order_size_usd: Decimal::new(10, 0),
            maker_bps: Decimal::new(2, 0),
            taker_bps: Decimal::new(5, 0),
            base_entered_book_delay_secs: 120.0,
            jitter_enabled: true,
            jitter_seed: 42,
            jitter_delay_pct: 0.1,
            slippage_factor: Decimal::new(1, 1), // 0.1
            jitter_slippage_pct: 0.1,
            jitter_fill_bps: Decimal::ONE,
            hide_entered_book_from_open_orders: true,
            latency_enabled: false,
            latency_base_ms: 20,
            latency_max_ms: 150,
            funding_curves: FnvHashMap::default(),
            default_funding_curve: FundingCurve::default(),
            refuse_orders_in_dry_run: false,
            dry_run: false,
            default_leverage: Decimal::ONE,
        }
    }
}

#[derive(Debug, Default, Clone)]
struct RejectionCounters {
    reduce_only_rejections: u64,
    insufficient_margin_rejections: u64,
    min_size_rejections: u64,
}

impl RejectionCounters {
    fn total(&self) -> u64 {
        self.reduce_only_rejections + self.insufficient_margin_rejections + self.min_size_rejections
    }
}

/// The statically typed response `get_ticker`/`fetch_ticker` return, in place of the
/// loose dictionary the original's `_make_ticker_dict` built (spec §9 design note).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickerView {
    pub symbol: String,
    pub last: Decimal,
    pub bid: Decimal,
    pub ask: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub open: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub percentage: Decimal,
}

/// The statically typed response `get_futures_account_info`/`get_futures_balance`
/// return.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountInfoView {
    pub equity: Decimal,
    pub available_margin: Decimal,
    pub margin_used: Decimal,
    pub unrealized_pnl: Decimal,
    pub leverage: Decimal,
}

#[derive(Debug, Clone)]
pub struct ExchangeMetrics {
    pub equity: Decimal,
    pub margin_used: Decimal,
    pub available_margin: Decimal,
    pub unrealized_pnl: Decimal,
    pub open_positions: usize,
    pub total_fees: Decimal,
    pub total_funding: Decimal,
    pub realized_pnl: Decimal,
    pub mid_fallback_count: u64,
    pub orders_rejected_total: u64,
    pub reduce_only_rejections: u64,
    pub insufficient_margin_rejections: u64,
    pub min_size_rejections: u64,
    pub total_latency_ms: u64,
    pub orders_placed_total: u64,
    pub orders_cancelled_total: u64,
}

struct State {
    account: AccountState,
    orders: FnvHashMap<OrderId, Order>,
    insertion_order: Vec<OrderId>,
    next_order_id: u64,
    fills: Vec<Fill>,
    last_funding_time: Option<DateTime<Utc>>,
    rejections: RejectionCounters,
    mid_fallback_count: u64,
    latency_total_ms: u64,
    orders_cancelled_count: u64,
}

/// The simulated exchange: order/position lifecycle, fills, funding, account state,
/// and the API circuit breaker. All randomness flows through one seeded RNG so that
/// identical inputs and `jitter_seed` reproduce byte-identical results.
pub struct SimulatedExchange {
    clock: SimClock,
    data_store: Arc<DataStore>,
    config: ExchangeSimConfig,
    fault_injector: Option<Arc<FaultInjector>>,
    pub breaker: ApiCircuitBreaker,
    rng: Mutex<StdRng>,
    state: Mutex<State>,
}

impl SimulatedExchange {
    pub fn new(
        clock: SimClock,
        data_store: Arc<DataStore>,
        config: ExchangeSimConfig,
        fault_injector: Option<Arc<FaultInjector>>,
    ) -> Self {
        let rng = StdRng::seed_from_u64(config.jitter_seed);
        let equity = config.initial_equity_usd;
        Self {
            clock,
            data_store,
            config,
            fault_injector,
            breaker: ApiCircuitBreaker::default_thresholds(),
            rng: Mutex::new(rng),
            state: Mutex::new(State {
                account: AccountState::new(equity),
                orders: FnvHashMap::default(),
                insertion_order: Vec::new(),
                next_order_id: 1,
                fills: Vec::new(),
                last_funding_time: None,
                rejections: RejectionCounters::default(),
                mid_fallback_count: 0,
                latency_total_ms: 0,
                orders_cancelled_count: 0,
            }),
        }
    }

    /// Guards every externally visible method: checks the breaker, runs fault
    /// injection, and applies the latency model when enabled.
    async fn guard(&self, method: &str) -> ReplayResult<()> {
        let now = self.clock.now();
        self.breaker.before_call(now)?;

        if let Some(injector) = &self.fault_injector {
            let mut rng = self.rng.lock().unwrap();
            if let Err(err) = injector.maybe_inject(method, now, &mut rng) {
                drop(rng);
                match &err {
                    ReplayError::Operational(OperationalError::RateLimit) => self.breaker.record_rate_limit(now),
                    ReplayError::Operational(_) => self.breaker.record_failure(now),
                    _ => {}
                }
                return Err(err);
            }
        }

        if self.config.latency_enabled {
            let latency_ms = {
                let mut rng = self.rng.lock().unwrap();
                rng.random_range(self.config.latency_base_ms..=self.config.latency_max_ms)
            };
            self.clock.advance(ChronoDuration::milliseconds(latency_ms as i64))?;
            self.state.lock().unwrap().latency_total_ms += latency_ms;
            self.clock.sleep(latency_ms as f64 / 1000.0).await;
        }

        self.breaker.record_success();
        Ok(())
    }

    // ---- order placement ---------------------------------------------------

    pub async fn place_futures_order(&self, request: NewOrderRequest) -> ReplayResult<OrderView> {
        self.guard("place_futures_order").await?;

        if self.config.dry_run && self.config.refuse_orders_in_dry_run {
            return Err(ReplayError::data("order refused: dry run"));
        }

        let now = self.clock.now();
        let bar = self
            .data_store
            .candle_at(&request.symbol, "1m", now)
            .ok_or_else(|| ReplayError::data(format!("no market data for {} at {now}", request.symbol)))?;

        self.preflight(&request, &bar)?;

        let mid_at_placement = Some(bar.mid());
        let mut state = self.state.lock().unwrap();
        let id = OrderId(state.next_order_id);
        state.next_order_id += 1;

        let mut order = Order::new(id, request, now, mid_at_placement);

        if order.kind == OrderKind::Market {
            let liquidity = self
                .data_store
                .liquidity_at(&order.symbol, now)
                .unwrap_or(LiquidityParams {
                    timestamp: now,
                    spread_bps: Decimal::ZERO,
                    depth_usd_at_1bp: Decimal::new(50_000, 0),
                    volatility_regime: VolatilityRegime::Normal,
                });
            let fill_price = self.market_fill_price(order.side, &bar, &liquidity, order.size, &mut state);
            self.apply_fill(&mut state, &mut order, fill_price, order.size, false, now);
        }

        let view = order.view();
        state.insertion_order.push(id);
        state.orders.insert(id, order);
        Ok(view)
    }

    fn preflight(&self, request: &NewOrderRequest, bar: &Candle) -> ReplayResult<()> {
        let notional = request.size * bar.mid();
        let mut state = self.state.lock().unwrap();

        if notional < self.config.min_order_size_usd {
            state.rejections.min_size_rejections += 1;
            return Err(ReplayError::data(format!(
                "order notional {notional} below minimum {}",
                self.config.min_order_size_usd
            )));
        }

        let existing = state.account.positions.get(&request.symbol).cloned();
        if request.reduce_only {
            match &existing {
                None => {
                    state.rejections.reduce_only_rejections += 1;
                    return Err(ReplayError::data("reduce-only order with no open position"));
                }
                Some(position) => {
                    let same_direction = PositionSide::from(request.side) == position.side;
                    if same_direction {
                        state.rejections.reduce_only_rejections += 1;
                        return Err(ReplayError::data("reduce-only order would increase exposure"));
                    }
                }
            }
        } else {
            let leverage = request.leverage.unwrap_or(Decimal::ONE);
            let required_margin = notional / leverage;
            if required_margin > state.account.available_margin() {
                state.rejections.insufficient_margin_rejections += 1;
                return Err(ReplayError::data(format!(
                    "required margin {required_margin} exceeds available margin {}",
                    state.account.available_margin()
                )));
            }
        }
        Ok(())
    }

    /// Flattens a position with a reduce-only market order, the convenience method a
    /// trading engine calls on shutdown or a safety trip rather than hand-building a
    /// closing order.
    pub async fn close_position(&self, symbol: &str) -> ReplayResult<Option<OrderView>> {
        self.guard("close_position").await?;
        let position = {
            let state = self.state.lock().unwrap();
            state.account.positions.get(symbol).cloned()
        };
        let Some(position) = position else {
            return Ok(None);
        };
        let side = match position.side {
            PositionSide::Long => Side::Sell,
            PositionSide::Short => Side::Buy,
        };
        let view = self
            .place_futures_order(NewOrderRequest::new(
                symbol.to_string(),
                None,
                side,
                OrderKind::Market,
                position.size,
                None,
                None,
                true,
                None,
            ))
            .await?;
        Ok(Some(view))
    }

    /// Primary cancellation path, grounded on the original's `cancel_futures_order`;
    /// `cancel_order` is a thin alias, matching the original's own delegation.
    pub async fn cancel_futures_order(&self, id: OrderId) -> ReplayResult<()> {
        self.guard("cancel_futures_order").await?;
        let mut state = self.state.lock().unwrap();
        let Some(order) = state.orders.get_mut(&id) else {
            return Err(ReplayError::data(format!("unknown order {id}")));
        };
        if order.status.is_terminal() {
            return Err(ReplayError::data(format!("order {id} already terminal")));
        }
        order.status = OrderStatus::Cancelled;
        state.orders_cancelled_count += 1;
        Ok(())
    }

    pub async fn cancel_order(&self, id: OrderId) -> ReplayResult<()> {
        self.cancel_futures_order(id).await
    }

    pub async fn cancel_all_orders(&self, symbol: Option<&str>) -> ReplayResult<usize> {
        self.guard("cancel_all_orders").await?;
        let mut state = self.state.lock().unwrap();
        let ids: Vec<OrderId> = state
            .orders
            .values()
            .filter(|o| !o.status.is_terminal() && symbol.is_none_or(|s| s == o.symbol))
            .map(|o| o.id)
            .collect();
        for id in &ids {
            if let Some(order) = state.orders.get_mut(id) {
                order.status = OrderStatus::Cancelled;
            }
        }
        state.orders_cancelled_count += ids.len() as u64;
        Ok(ids.len())
    }

    /// Mutates `stop_price`/`price` on a resting order in place.
    pub async fn edit_futures_order(&self, id: OrderId, price: Option<Decimal>, stop_price: Option<Decimal>) -> ReplayResult<OrderView> {
        self.guard("edit_futures_order").await?;
        let mut state = self.state.lock().unwrap();
        let Some(order) = state.orders.get_mut(&id) else {
            return Err(ReplayError::data(format!("order {id} not found")));
        };
        if let Some(stop_price) = stop_price {
            order.stop_price = Some(stop_price);
        }
        if let Some(price) = price {
            order.price = Some(price);
        }
        Ok(order.view())
    }

    pub async fn fetch_order(&self, id: OrderId) -> ReplayResult<Option<OrderView>> {
        self.guard("fetch_order").await?;
        Ok(self.state.lock().unwrap().orders.get(&id).map(Order::view))
    }

    pub async fn get_futures_open_orders(&self, symbol: Option<&str>) -> ReplayResult<Vec<OrderView>> {
        self.guard("get_futures_open_orders").await?;
        let state = self.state.lock().unwrap();
        Ok(state
            .insertion_order
            .iter()
            .filter_map(|id| state.orders.get(id))
            .filter(|o| !o.status.is_terminal())
            .filter(|o| symbol.is_none_or(|s| s == o.symbol))
            .filter(|o| !(self.config.hide_entered_book_from_open_orders && o.status == OrderStatus::EnteredBook))
            .map(Order::view)
            .collect())
    }

    pub async fn get_futures_position(&self, symbol: &str) -> ReplayResult<Option<PositionView>> {
        self.guard("get_futures_position").await?;
        Ok(self.state.lock().unwrap().account.positions.get(symbol).map(Position::view))
    }

    pub async fn get_all_futures_positions(&self) -> ReplayResult<Vec<PositionView>> {
        self.guard("get_all_futures_positions").await?;
        Ok(self.state.lock().unwrap().account.positions.values().map(Position::view).collect())
    }

    /// A single best bid/ask/OHLCV snapshot for `symbol` at the current clock time.
    /// `fetch_order`-style naming convention (`get_ticker`/`fetch_ticker`) mirrors the
    /// original exposing the same data under two call sites; both are guarded here for
    /// uniformity even though the original only checked faults on `get_ticker`.
    fn ticker_view(&self, symbol: &str) -> TickerView {
        let now = self.clock.now();
        let Some(bar) = self.data_store.candle_at(symbol, "1m", now) else {
            return TickerView {
                symbol: symbol.to_string(),
                last: Decimal::ZERO,
                bid: Decimal::ZERO,
                ask: Decimal::ZERO,
                high: Decimal::ZERO,
                low: Decimal::ZERO,
                open: Decimal::ZERO,
                close: Decimal::ZERO,
                volume: Decimal::ZERO,
                percentage: Decimal::ZERO,
            };
        };
        let liquidity = self.data_store.liquidity_at(symbol, now).unwrap_or(LiquidityParams {
            timestamp: now,
            spread_bps: Decimal::ZERO,
            depth_usd_at_1bp: Decimal::new(50_000, 0),
            volatility_regime: VolatilityRegime::Normal,
        });
        let mid = bar.close;
        let spread_half = mid * liquidity.spread_bps / Decimal::new(20_000, 0);
        TickerView {
            symbol: symbol.to_string(),
            last: mid,
            bid: mid - spread_half,
            ask: mid + spread_half,
            high: bar.high,
            low: bar.low,
            open: bar.open,
            close: bar.close,
            volume: bar.volume,
            percentage: Decimal::ZERO,
        }
    }

    pub async fn get_ticker(&self, symbol: &str) -> ReplayResult<TickerView> {
        self.guard("get_ticker").await?;
        Ok(self.ticker_view(symbol))
    }

    pub async fn fetch_ticker(&self, symbol: &str) -> ReplayResult<TickerView> {
        self.guard("fetch_ticker").await?;
        Ok(self.ticker_view(symbol))
    }

    pub async fn get_futures_mark_price(&self, symbol: &str) -> ReplayResult<Decimal> {
        self.guard("get_futures_mark_price").await?;
        let bar = self.data_store.candle_at(symbol, "1m", self.clock.now());
        Ok(bar.map(|b| b.close).unwrap_or(Decimal::ZERO))
    }

    /// Up to `limit` most recent bars for `symbol`/`timeframe`, ending at the current
    /// clock time.
    pub async fn get_futures_ohlcv(&self, symbol: &str, timeframe: &str, limit: usize) -> ReplayResult<Vec<Candle>> {
        self.guard("get_futures_ohlcv").await?;
        Ok(self.data_store.candles_up_to(symbol, timeframe, self.clock.now(), limit))
    }

    pub async fn get_account_balance(&self) -> ReplayResult<Decimal> {
        self.guard("get_account_balance").await?;
        Ok(self.state.lock().unwrap().account.equity())
    }

    fn account_info_view(&self) -> AccountInfoView {
        let state = self.state.lock().unwrap();
        AccountInfoView {
            equity: state.account.equity(),
            available_margin: state.account.available_margin(),
            margin_used: state.account.margin_used(),
            unrealized_pnl: state.account.unrealized_pnl(),
            leverage: self.config.default_leverage,
        }
    }

    pub async fn get_futures_balance(&self) -> ReplayResult<AccountInfoView> {
        self.guard("get_futures_balance").await?;
        Ok(self.account_info_view())
    }

    pub async fn get_futures_account_info(&self) -> ReplayResult<AccountInfoView> {
        self.guard("get_futures_account_info").await?;
        Ok(self.account_info_view())
    }

    /// A ccxt-style creation call that just forwards to `place_futures_order`,
    /// matching the original's own delegation (no separate fault check — the
    /// delegate's own `guard` call covers it).
    pub async fn create_order(&self, request: NewOrderRequest) -> ReplayResult<OrderView> {
        self.place_futures_order(request).await
    }

    /// True no-ops: the original never calls `_check_fault` for these either.
    pub async fn initialize(&self) -> ReplayResult<()> {
        Ok(())
    }

    pub async fn close(&self) -> ReplayResult<()> {
        Ok(())
    }

    pub fn exchange_metrics(&self) -> ExchangeMetrics {
        let state = self.state.lock().unwrap();
        ExchangeMetrics {
            equity: state.account.equity(),
            margin_used: state.account.margin_used(),
            available_margin: state.account.available_margin(),
            unrealized_pnl: state.account.unrealized_pnl(),
            open_positions: state.account.positions.len(),
            total_fees: state.account.total_fees,
            total_funding: state.account.total_funding,
            realized_pnl: state.account.realized_pnl,
            mid_fallback_count: state.mid_fallback_count,
            orders_rejected_total: state.rejections.total(),
            reduce_only_rejections: state.rejections.reduce_only_rejections,
            insufficient_margin_rejections: state.rejections.insufficient_margin_rejections,
            min_size_rejections: state.rejections.min_size_rejections,
            total_latency_ms: state.latency_total_ms,
            orders_placed_total: state.next_order_id - 1,
            orders_cancelled_total: state.orders_cancelled_count,
        }
    }

    pub fn fills(&self) -> Vec<Fill> {
        self.state.lock().unwrap().fills.clone()
    }

    pub fn fault_stats(&self) -> Option<crate::fault::FaultStats> {
        self.fault_injector.as_ref().map(|injector| injector.stats())
    }

    // ---- step ---------------------------------------------------------------

    /// Advances order/position/funding state to `now`. Orders are processed in
    /// insertion order; trigger -> entered-book -> fill is strictly sequential
    /// within one order. Returns the fills produced during this step.
    pub fn step(&self, now: DateTime<Utc>) -> Vec<Fill> {
        let mut state = self.state.lock().unwrap();
        let fills_before = state.fills.len();

        let ids = state.insertion_order.clone();
        for id in ids {
            let Some(mut order) = state.orders.get(&id).cloned() else {
                continue;
            };
            if order.status.is_terminal() {
                continue;
            }

            let Some(bar) = self.data_store.candle_at(&order.symbol, "1m", now) else {
                continue;
            };
            let liquidity = self.data_store.liquidity_at(&order.symbol, now).unwrap_or(LiquidityParams {
                timestamp: now,
                spread_bps: Decimal::ZERO,
                depth_usd_at_1bp: Decimal::new(50_000, 0),
                volatility_regime: VolatilityRegime::Normal,
            });

            if matches!(order.kind, OrderKind::Stop | OrderKind::TakeProfit) && order.status == OrderStatus::Open {
                if self.stop_triggered(&order, &bar) {
                    order.triggered_at = Some(now);
                    order.status = OrderStatus::EnteredBook;
                    debug!(order_id = %order.id, "order entered book");
                }
            }

            if order.status == OrderStatus::EnteredBook {
                let triggered_at = order.triggered_at.expect("entered-book orders always have triggered_at");
                let delay = self.entered_book_delay(&liquidity);
                if now >= triggered_at + ChronoDuration::milliseconds((delay * 1000.0) as i64) {
                    let fill_price = self.stop_fill_price(&order, &bar, &liquidity, &mut state);
                    self.apply_fill(&mut state, &mut order, fill_price, order.remaining(), false, now);
                }
            } else if order.kind == OrderKind::Market && order.status == OrderStatus::Open {
                let fill_price = self.market_fill_price(order.side, &bar, &liquidity, order.size, &mut state);
                self.apply_fill(&mut state, &mut order, fill_price, order.remaining(), false, now);
            } else if order.kind == OrderKind::Limit && order.status == OrderStatus::Open {
                if let Some(limit_crossed_price) = self.limit_crossed(&order, &bar) {
                    let (fill_price, is_maker) = self.limit_fill(&order, limit_crossed_price, &bar, &mut state);
                    self.apply_fill(&mut state, &mut order, fill_price, order.remaining(), is_maker, now);
                }
            }

            state.orders.insert(id, order);
        }

        self.apply_funding(&mut state, now);
        self.refresh_marks(&mut state, now);

        state.fills[fills_before..].to_vec()
    }

    fn stop_triggered(&self, order: &Order, bar: &Candle) -> bool {
        let Some(stop) = order.stop_price else { return false };
        match (order.kind, order.side) {
            (OrderKind::Stop, Side::Buy) => bar.high >= stop,
            (OrderKind::Stop, Side::Sell) => bar.low <= stop,
            (OrderKind::TakeProfit, Side::Buy) => bar.low <= stop,
            (OrderKind::TakeProfit, Side::Sell) => bar.high >= stop,
            _ => false,
        }
    }

    fn limit_crossed(&self, order: &Order, bar: &Candle) -> Option<Decimal> {
        let price = order.price?;
        let crossed = match order.side {
            Side::Buy => bar.low <= price,
            Side::Sell => bar.high >= price,
        };
        crossed.then_some(price)
    }

    fn entered_book_delay(&self, liquidity: &LiquidityParams) -> f64 {
        let vol_mult = liquidity.volatility_regime.vol_mult();
        let depth_mult = liquidity.depth_mult();
        let multiplier = vol_mult.max(depth_mult);
        let jitter = if self.config.jitter_enabled {
            self.uniform_jitter(self.config.jitter_delay_pct)
        } else {
            0.0
        };
        self.config.base_entered_book_delay_secs * multiplier.to_f64().unwrap_or(1.0) * (1.0 + jitter)
    }

    fn uniform_jitter(&self, pct: f64) -> f64 {
        let mut rng = self.rng.lock().unwrap();
        rng.random_range(-pct..=pct)
    }

    /// Market/stop fill price: mid +/- spread-half +/- slippage, jittered, clamped
    /// into the bar's range. For a stop, never better than `stop_price`.
    fn market_fill_price(&self, side: Side, bar: &Candle, liquidity: &LiquidityParams, size: Decimal, _state: &mut State) -> Decimal {
        let mid = bar.mid();
        let spread_half = mid * liquidity.spread_bps / Decimal::new(20_000, 0);
        let notional = size * mid;
        let mut slippage_mult = self.config.slippage_factor * notional / liquidity.depth_usd_at_1bp;
        if self.config.jitter_enabled {
            let jitter = self.uniform_jitter(self.config.jitter_slippage_pct);
            slippage_mult *= Decimal::from_f64_retain(1.0 + jitter).unwrap_or(Decimal::ONE);
        }
        slippage_mult = slippage_mult.clamp(Decimal::ZERO, Decimal::new(1, 2)); // [0, 1%]
        let slippage = mid * slippage_mult;

        let mut price = match side {
            Side::Buy => mid + spread_half + slippage,
            Side::Sell => mid - spread_half - slippage,
        };

        if self.config.jitter_enabled {
            let fill_jitter_bps = Decimal::from_f64_retain(self.uniform_jitter(1.0)).unwrap_or(Decimal::ZERO)
                * self.config.jitter_fill_bps;
            price += mid * fill_jitter_bps / Decimal::new(10_000, 0);
        }

        price.clamp(bar.low, bar.high)
    }

    fn stop_fill_price(&self, order: &Order, bar: &Candle, liquidity: &LiquidityParams, state: &mut State) -> Decimal {
        let price = self.market_fill_price(order.side, bar, liquidity, order.remaining(), state);
        match (order.side, order.stop_price) {
            (Side::Buy, Some(stop)) => price.max(stop),
            (Side::Sell, Some(stop)) => price.min(stop),
            _ => price,
        }
        .clamp(bar.low, bar.high)
    }

    /// Maker/taker classification from `mid_at_placement`, falling back to bar open
    /// (incrementing `mid_fallback_count`) when unavailable.
    fn limit_fill(&self, order: &Order, price: Decimal, bar: &Candle, state: &mut State) -> (Decimal, bool) {
        let reference_mid = match order.mid_at_placement {
            Some(mid) => mid,
            None => {
                state.mid_fallback_count += 1;
                bar.open
            }
        };
        let is_taker = match order.side {
            Side::Buy => price >= reference_mid,
            Side::Sell => price <= reference_mid,
        };
        (price, !is_taker)
    }

    fn fee_for(&self, size: Decimal, price: Decimal, is_maker: bool) -> Decimal {
        let bps = if is_maker { self.config.maker_bps } else { self.config.taker_bps };
        size * price * bps / Decimal::new(10_000, 0)
    }

    /// Applies a fill to the position per the seven authoritative rules (spec §4.4),
    /// records the fill, and charges fees.
    fn apply_fill(&self, state: &mut State, order: &mut Order, price: Decimal, size: Decimal, is_maker: bool, now: DateTime<Utc>) {
        if size <= Decimal::ZERO {
            return;
        }
        let fee = self.fee_for(size, price, is_maker);
        state.account.total_fees += fee;

        let mut realized_pnl = Decimal::ZERO;
        let mut opened_position = false;
        let mut closed_position = false;

        let existing = state.account.positions.get(&order.symbol).cloned();
        match existing {
            None if !order.reduce_only => {
                opened_position = true;
                state.account.positions.insert(
                    order.symbol.clone(),
                    Position {
                        symbol: order.symbol.clone(),
                        side: PositionSide::from(order.side),
                        size,
                        entry_price: price,
                        unrealized_pnl: Decimal::ZERO,
                        leverage: order.leverage.unwrap_or(Decimal::ONE),
                    },
                );
            }
            None => {
                // reduce-only with no position: no-op at the fill stage.
            }
            Some(mut position) => {
                let fill_side = PositionSide::from(order.side);
                if fill_side == position.side {
                    if !order.reduce_only {
                        let total_size = position.size + size;
                        position.entry_price = (position.entry_price * position.size + price * size) / total_size;
                        position.size = total_size;
                        state.account.positions.insert(order.symbol.clone(), position);
                    }
                    // same-direction reduce-only: no-op.
                } else if size <= position.size {
                    let closed = size;
                    let pnl = match position.side {
                        PositionSide::Long => (price - position.entry_price) * closed,
                        PositionSide::Short => (position.entry_price - price) * closed,
                    };
                    state.account.realized_pnl += pnl;
                    realized_pnl = pnl;
                    position.size -= closed;
                    if position.size > Decimal::ZERO {
                        state.account.positions.insert(order.symbol.clone(), position);
                    } else {
                        state.account.positions.remove(&order.symbol);
                        closed_position = true;
                    }
                } else if !order.reduce_only {
                    let closed = position.size;
                    let pnl = match position.side {
                        PositionSide::Long => (price - position.entry_price) * closed,
                        PositionSide::Short => (position.entry_price - price) * closed,
                    };
                    state.account.realized_pnl += pnl;
                    realized_pnl = pnl;
                    closed_position = true;
                    opened_position = true;
                    let remainder = size - closed;
                    state.account.positions.insert(
                        order.symbol.clone(),
                        Position {
                            symbol: order.symbol.clone(),
                            side: fill_side,
                            size: remainder,
                            entry_price: price,
                            unrealized_pnl: Decimal::ZERO,
                            leverage: order.leverage.unwrap_or(position.leverage),
                        },
                    );
                } else {
                    // reduce-only surplus beyond flat: cap at flat, discard surplus.
                    let closed = position.size;
                    let pnl = match position.side {
                        PositionSide::Long => (price - position.entry_price) * closed,
                        PositionSide::Short => (position.entry_price - price) * closed,
                    };
                    state.account.realized_pnl += pnl;
                    realized_pnl = pnl;
                    closed_position = true;
                    state.account.positions.remove(&order.symbol);
                }
            }
        }

        order.filled_size += size;
        order.avg_fill_price = Some(price);
        order.filled_at = Some(now);
        if order.filled_size >= order.size {
            order.status = OrderStatus::Filled;
        }

        info!(order_id = %order.id, symbol = %order.symbol, price = %price, size = %size, is_maker, "fill");
        state.fills.push(Fill {
            order_id: order.id,
            symbol: order.symbol.clone(),
            side: order.side,
            price,
            size,
            fee,
            is_maker,
            timestamp: now,
            reduce_only: order.reduce_only,
            realized_pnl,
            opened_position,
            closed_position,
        });
    }

    /// Charges funding on every open position every >= 8h elapsed.
    fn apply_funding(&self, state: &mut State, now: DateTime<Utc>) {
        let Some(last) = state.last_funding_time else {
            state.last_funding_time = Some(now);
            return;
        };
        if now - last < ChronoDuration::hours(8) {
            return;
        }

        let symbols: Vec<String> = state.account.positions.keys().cloned().collect();
        for symbol in symbols {
            let Some(position) = state.account.positions.get(&symbol).cloned() else {
                continue;
            };
            let curve = self.config.funding_curves.get(&symbol).copied().unwrap_or(self.config.default_funding_curve);
            let regime = self
                .data_store
                .liquidity_at(&symbol, now)
                .map(|l| l.volatility_regime)
                .unwrap_or(VolatilityRegime::Normal);
            let rate = if regime.is_elevated() {
                curve.base_rate_8h_bps * curve.vol_spike_multiplier
            } else {
                curve.base_rate_8h_bps
            };
            let funding = position.notional() * rate / Decimal::new(10_000, 0);
            state.account.total_funding += funding;
            info!(symbol = %symbol, rate_bps = %rate, funding = %funding, "funding applied");
        }
        state.last_funding_time = Some(now);
    }

    fn refresh_marks(&self, state: &mut State, now: DateTime<Utc>) {
        let symbols: Vec<String> = state.account.positions.keys().cloned().collect();
        for symbol in symbols {
            let Some(bar) = self.data_store.candle_at(&symbol, "1m", now) else {
                continue;
            };
            if let Some(position) = state.account.positions.get_mut(&symbol) {
                position.unrealized_pnl = position.unrealized_pnl_at(bar.close);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn make_store(symbol: &str, bars: Vec<Candle>) -> Arc<DataStore> {
        let mut store = DataStore::new("unused", vec![symbol.to_string()], vec!["1m".to_string()]);
        // load() reads from disk; tests instead poke the private series via a helper
        // constructor that mirrors what `load()` would have produced.
        store.inject_for_test(symbol, "1m", bars);
        Arc::new(store)
    }

    fn bar(ts: DateTime<Utc>, price: Decimal) -> Candle {
        Candle {
            timestamp: ts,
            open: price,
            high: price + dec!(50),
            low: price - dec!(50),
            close: price,
            volume: dec!(500_000),
        }
    }

    fn config() -> ExchangeSimConfig {
        ExchangeSimConfig {
            jitter_enabled: false,
            ..ExchangeSimConfig::default()
        }
    }

    fn new_exchange(symbol: &str, bars: Vec<Candle>, cfg: ExchangeSimConfig) -> (SimulatedExchange, SimClock) {
        let t0 = bars[0].timestamp;
        let clock = SimClock::new(t0);
        let store = make_store(symbol, bars);
        (SimulatedExchange::new(clock.clone(), store, cfg, None), clock)
    }

    fn t(offset_min: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + ChronoDuration::minutes(offset_min)
    }

    #[tokio::test]
    async fn market_buy_then_reduce_only_sell_exceeding_size_flattens_without_reversal() {
        let bars = (0..5).map(|i| bar(t(i), dec!(50_000))).collect();
        let (ex, clock) = new_exchange("BTC/USD:USD", bars, config());
        clock.set(t(0));

        ex.place_futures_order(NewOrderRequest::new(
            "BTC/USD:USD".into(), None, Side::Buy, OrderKind::Market, dec!(0.1), None, None, false, Some(dec!(5)),
        )).await.unwrap();

        ex.place_futures_order(NewOrderRequest::new(
            "BTC/USD:USD".into(), None, Side::Sell, OrderKind::Market, dec!(0.2), None, None, true, None,
        )).await.unwrap();

        assert!(ex.get_futures_position("BTC/USD:USD").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn market_buy_then_non_reduce_sell_exceeding_size_reverses() {
        let bars = (0..5).map(|i| bar(t(i), dec!(50_000))).collect();
        let (ex, clock) = new_exchange("BTC/USD:USD", bars, config());
        clock.set(t(0));

        ex.place_futures_order(NewOrderRequest::new(
            "BTC/USD:USD".into(), None, Side::Buy, OrderKind::Market, dec!(0.1), None, None, false, Some(dec!(5)),
        )).await.unwrap();

        ex.place_futures_order(NewOrderRequest::new(
            "BTC/USD:USD".into(), None, Side::Sell, OrderKind::Market, dec!(0.2), None, None, false, Some(dec!(5)),
        )).await.unwrap();

        let position = ex.get_futures_position("BTC/USD:USD").await.unwrap().unwrap();
        assert_eq!(position.side, PositionSide::Short);
        assert_eq!(position.size, dec!(0.1));
    }

    #[tokio::test]
    async fn reduce_only_on_empty_position_is_rejected() {
        let bars = (0..5).map(|i| bar(t(i), dec!(50_000))).collect();
        let (ex, clock) = new_exchange("BTC/USD:USD", bars, config());
        clock.set(t(0));

        let err = ex.place_futures_order(NewOrderRequest::new(
            "BTC/USD:USD".into(), None, Side::Sell, OrderKind::Market, dec!(0.1), None, None, true, None,
        )).await.unwrap_err();

        assert_eq!(err.kind(), crate::error::ErrorKind::Data);
        assert_eq!(ex.exchange_metrics().reduce_only_rejections, 1);
    }

    #[tokio::test]
    async fn insufficient_margin_is_rejected() {
        let bars = (0..5).map(|i| bar(t(i), dec!(50_000))).collect();
        let (ex, clock) = new_exchange("BTC/USD:USD", bars, config());
        clock.set(t(0));

        let err = ex.place_futures_order(NewOrderRequest::new(
            "BTC/USD:USD".into(), None, Side::Buy, OrderKind::Market, dec!(10), None, None, false, Some(dec!(7)),
        )).await.unwrap_err();

        assert_eq!(err.kind(), crate::error::ErrorKind::Data);
        assert_eq!(ex.exchange_metrics().insufficient_margin_rejections, 1);
    }

    #[tokio::test]
    async fn stop_order_enters_book_then_fills_after_delay() {
        let mut bars = vec![bar(t(0), dec!(50_000))];
        for i in 1..10 {
            bars.push(bar(t(i), dec!(49_900)));
        }
        let mut cfg = config();
        cfg.base_entered_book_delay_secs = 120.0;
        let (ex, clock) = new_exchange("BTC/USD:USD", bars, cfg);
        clock.set(t(0));

        ex.place_futures_order(NewOrderRequest::new(
            "BTC/USD:USD".into(), None, Side::Buy, OrderKind::Market, dec!(0.1), None, None, false, Some(dec!(5)),
        )).await.unwrap();

        let order = ex.place_futures_order(NewOrderRequest::new(
            "BTC/USD:USD".into(), None, Side::Sell, OrderKind::Stop, dec!(0.1), None, Some(dec!(49_950)), false, None,
        )).await.unwrap();

        clock.set(t(1));
        ex.step(t(1));
        let view = ex.fetch_order(order.id).await.unwrap().unwrap();
        assert_eq!(view.status, OrderStatus::EnteredBook);
        assert!(ex.get_futures_open_orders(None).await.unwrap().is_empty());

        clock.set(t(4));
        ex.step(t(4));
        let view = ex.fetch_order(order.id).await.unwrap().unwrap();
        assert_eq!(view.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn funding_charges_every_open_position_after_eight_hours() {
        let bars: Vec<Candle> = (0..600).map(|i| bar(t(i), dec!(50_000))).collect();
        let (ex, clock) = new_exchange("BTC/USD:USD", bars, config());
        clock.set(t(0));

        ex.place_futures_order(NewOrderRequest::new(
            "BTC/USD:USD".into(), None, Side::Buy, OrderKind::Market, dec!(1), None, None, false, Some(dec!(5)),
        )).await.unwrap();
        ex.step(t(0));

        clock.set(t(9 * 60));
        ex.step(t(9 * 60));

        assert!(ex.exchange_metrics().total_funding > Decimal::ZERO);
    }
}
