use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

use super::arbiter::Arbiter;
use crate::broker::{Broker, CloseOutcome, ModifyOutcome};
use crate::config::{ExitConfig, ExitProfile};
use crate::error::GuardError;
use crate::feed::FeedSynchronizer;
use crate::indicators::{StopDistance, VolatilityEstimator};
use crate::models::{Direction, ExitStage, ExitState, Owner, Position, Ticket};
use crate::notify::{Notification, NotificationDispatcher};
use crate::persistence::StateStore;

/// A ticket counts as urgent once progress reaches this share of its next trigger
const URGENCY_PROXIMITY: f64 = 0.8;

/// Entry-to-target distance used to scale the stage triggers
pub fn planned_distance(position: &Position, profile: &ExitProfile) -> Option<f64> {
    if let Some(tp) = position.take_profit {
        let distance = (tp - position.entry_price).abs();
        if distance > 0.0 {
            return Some(distance);
        }
    }
    position
        .stop_loss
        .map(|sl| (position.entry_price - sl).abs() * profile.fallback_reward_ratio)
        .filter(|d| *d > 0.0)
}

/// Breakeven stop: entry shifted against the position by spread plus a buffer,
/// kept outside the broker's minimum stop distance from `price`
pub fn breakeven_stop(
    position: &Position,
    profile: &ExitProfile,
    spread: f64,
    price: f64,
    stops_level: f64,
) -> f64 {
    let buffer = spread + position.entry_price * profile.breakeven_buffer_fraction;
    match position.direction {
        Direction::Buy => (position.entry_price - buffer).min(price - stops_level),
        Direction::Sell => (position.entry_price + buffer).max(price + stops_level),
    }
}

/// Trailing candidate `distance` behind `price`, outside the stop band
pub fn trailing_stop(direction: Direction, price: f64, distance: f64, stops_level: f64) -> f64 {
    let gap = distance.max(stops_level);
    match direction {
        Direction::Buy => price - gap,
        Direction::Sell => price + gap,
    }
}

/// Counters from one monitoring pass
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CycleReport {
    pub managed: usize,
    pub transitions: usize,
    pub mutations: usize,
    pub failures: usize,
    pub closed: usize,
    pub urgent: bool,
}

enum MutationResult {
    Done,
    Failed(String),
}

/// Drives the exit stage machine for the tickets its role owns.
///
/// Two instances run side by side, one GENERIC and one STRATEGY_SPECIFIC,
/// sharing a single `Arbiter`.
pub struct ExitController {
    role: Owner,
    broker: Arc<dyn Broker>,
    arbiter: Arc<Arbiter>,
    estimator: VolatilityEstimator,
    feed: FeedSynchronizer,
    store: Arc<dyn StateStore>,
    notifier: NotificationDispatcher,
    config: ExitConfig,
}

impl ExitController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        role: Owner,
        broker: Arc<dyn Broker>,
        arbiter: Arc<Arbiter>,
        estimator: VolatilityEstimator,
        feed: FeedSynchronizer,
        store: Arc<dyn StateStore>,
        notifier: NotificationDispatcher,
        config: ExitConfig,
    ) -> Self {
        Self {
            role,
            broker,
            arbiter,
            estimator,
            feed,
            store,
            notifier,
            config,
        }
    }

    pub fn role(&self) -> Owner {
        self.role
    }

    fn profile_for(&self, state: &ExitState) -> &ExitProfile {
        if self.role == Owner::StrategySpecific {
            if let Some(profile) = state
                .strategy_tag
                .as_deref()
                .and_then(|tag| self.config.strategy_profiles.get(tag))
            {
                return profile;
            }
        }
        &self.config.default_profile
    }

    async fn persist(&self, state: &ExitState) {
        if let Err(e) = self.store.save_exit_state(state).await {
            tracing::error!(ticket = state.ticket, "Failed to persist exit state: {}", e);
        }
    }

    /// One pass over every broker-reported position
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> CycleReport {
        let mut report = CycleReport::default();

        let positions = match self.broker.get_positions().await {
            Ok(positions) => positions,
            Err(e) => {
                tracing::warn!(role = %self.role, "Skipping exit cycle, positions unavailable: {}", e);
                return report;
            }
        };

        let live: HashSet<_> = positions.iter().map(|p| p.ticket).collect();
        for ticket in self.arbiter.tickets() {
            if !live.contains(&ticket) && self.forget_closed(ticket).await {
                report.closed += 1;
            }
        }

        for position in &positions {
            let (shared, created) = self.arbiter.observe(position, now);
            let mut state = shared.lock().await;
            if created {
                self.persist(&state).await;
            }
            if state.owner != self.role {
                continue;
            }
            report.managed += 1;

            let stage_before = state.stage;
            let failures_before = state.consecutive_failures;
            match self.process(position, &mut state, now, &mut report).await {
                Ok(urgent) => report.urgent |= urgent,
                Err(GuardError::DataUnavailable { symbol, reason }) => {
                    tracing::debug!(ticket = position.ticket, symbol = %symbol, "Skipped: {}", reason);
                }
                Err(e) => {
                    tracing::warn!(ticket = position.ticket, "Exit tick skipped: {}", e);
                }
            }
            if state.stage != stage_before {
                report.transitions += 1;
            }
            if state.consecutive_failures > failures_before {
                report.failures += 1;
            }
        }

        report
    }

    /// Drop the state of a position the broker no longer reports.
    /// False if the sibling controller got there first.
    async fn forget_closed(&self, ticket: Ticket) -> bool {
        let Some(shared) = self.arbiter.remove(ticket) else {
            return false;
        };
        let state = shared.lock().await;
        if let Err(e) = self.store.delete_exit_state(ticket).await {
            tracing::error!(ticket, "Failed to delete exit state: {}", e);
        }
        tracing::info!(ticket, stage = %state.stage, "Position closed, exit state removed");
        self.notifier.send(Notification::info(
            format!("exit:{}:closed", ticket),
            format!("Position {} ({}) closed at stage {}", ticket, state.symbol, state.stage),
        ));
        true
    }

    /// Advance one owned ticket; returns whether it needs the urgent cadence
    async fn process(
        &self,
        position: &Position,
        state: &mut ExitState,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Result<bool, GuardError> {
        let profile = self.profile_for(state).clone();

        if state.planned_distance.is_none() {
            state.planned_distance = planned_distance(position, &profile);
            if state.planned_distance.is_some() {
                self.persist(state).await;
            }
        }
        let planned = state.planned_distance.ok_or_else(|| {
            GuardError::data_unavailable(&position.symbol, "no take profit or stop to derive planned distance")
        })?;

        let (price, spread) = self.resolve_price(position, now).await?;
        let progress = position.profit_distance(price) / planned;

        match state.stage {
            ExitStage::Initial => {
                if progress >= profile.breakeven_trigger {
                    self.set_breakeven(position, state, &profile, price, spread, now, report)
                        .await?;
                }
                Ok(progress >= profile.breakeven_trigger * URGENCY_PROXIMITY)
            }
            ExitStage::BreakevenSet => {
                if progress >= profile.partial_trigger {
                    self.take_partial(position, state, &profile, now, report).await?;
                }
                Ok(progress >= profile.partial_trigger * URGENCY_PROXIMITY)
            }
            ExitStage::PartialTaken => {
                self.advance(state, ExitStage::Trailing, now).await;
                Ok(true)
            }
            ExitStage::Trailing => {
                self.trail(position, state, price, now, report).await?;
                Ok(true)
            }
        }
    }

    async fn resolve_price(
        &self,
        position: &Position,
        now: DateTime<Utc>,
    ) -> Result<(f64, f64), GuardError> {
        match self.broker.get_quote(&position.symbol).await {
            Ok(quote) => Ok((quote.exit_price(position.direction), quote.spread())),
            Err(e) => {
                tracing::debug!(
                    ticket = position.ticket,
                    "Broker quote unavailable ({}), using translated exchange price",
                    e
                );
                let price = self.feed.translated_exchange_price(&position.symbol, now)?;
                Ok((price, 0.0))
            }
        }
    }

    async fn advance(&self, state: &mut ExitState, stage: ExitStage, now: DateTime<Utc>) {
        tracing::info!(ticket = state.ticket, from = %state.stage, to = %stage, "Exit stage transition");
        state.stage = stage;
        state.last_update_at = now;
        self.persist(state).await;
        self.notifier.send(Notification::info(
            format!("exit:{}:{}", state.ticket, stage),
            format!("Position {} ({}) moved to {}", state.ticket, state.symbol, stage),
        ));
    }

    /// Count a failed mutation and persist the count so alerting survives a restart
    async fn record_failure(&self, state: &mut ExitState, reason: &str) {
        state.consecutive_failures += 1;
        let err = GuardError::BrokerRejected {
            ticket: state.ticket,
            reason: reason.to_string(),
        };
        tracing::warn!(
            ticket = state.ticket,
            failures = state.consecutive_failures,
            "{}, retrying next tick",
            err
        );
        if state.consecutive_failures >= self.config.failure_alert_threshold {
            self.notifier.send(Notification::critical(
                format!("exit:{}:failures", state.ticket),
                format!(
                    "Position {} ({}): {} consecutive broker failures, last: {}",
                    state.ticket, state.symbol, state.consecutive_failures, reason
                ),
            ));
        }
        self.persist(state).await;
    }

    /// Ownership-checked stop modification
    async fn modify(
        &self,
        position: &Position,
        state: &mut ExitState,
        stop: f64,
        report: &mut CycleReport,
    ) -> Result<MutationResult, GuardError> {
        self.arbiter.authorize(state, self.role)?;
        report.mutations += 1;

        let outcome = self
            .broker
            .modify_stop(position.ticket, stop, position.take_profit)
            .await;
        Ok(match outcome {
            Ok(ModifyOutcome::Applied) | Ok(ModifyOutcome::NoChange) => {
                state.consecutive_failures = 0;
                MutationResult::Done
            }
            Ok(ModifyOutcome::Rejected(reason)) => MutationResult::Failed(reason),
            Err(e) => MutationResult::Failed(e.to_string()),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn set_breakeven(
        &self,
        position: &Position,
        state: &mut ExitState,
        profile: &ExitProfile,
        price: f64,
        spread: f64,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Result<(), GuardError> {
        let spec = self.broker.symbol_spec(&position.symbol).await?;
        let stop = breakeven_stop(position, profile, spread, price, spec.stops_level);

        if position.stop_improves(stop) {
            match self.modify(position, state, stop, report).await? {
                MutationResult::Done => {
                    tracing::info!(ticket = position.ticket, stop, "Breakeven stop set");
                }
                MutationResult::Failed(reason) => {
                    self.record_failure(state, &reason).await;
                    return Ok(());
                }
            }
        } else {
            tracing::debug!(ticket = position.ticket, stop, "Existing stop already at or past breakeven");
        }

        self.advance(state, ExitStage::BreakevenSet, now).await;

        if self.role == Owner::Generic {
            if let Some(tag) = self.arbiter.try_handoff(state) {
                self.persist(state).await;
                self.notifier.send(Notification::info(
                    format!("exit:{}:handoff", state.ticket),
                    format!("Position {} handed to strategy '{}'", state.ticket, tag),
                ));
            }
        }
        Ok(())
    }

    async fn take_partial(
        &self,
        position: &Position,
        state: &mut ExitState,
        profile: &ExitProfile,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Result<(), GuardError> {
        let spec = self.broker.symbol_spec(&position.symbol).await?;
        let dust = self
            .config
            .dust_thresholds
            .get(&position.symbol)
            .copied()
            .unwrap_or(spec.min_volume)
            .max(spec.min_volume);

        let close_volume = spec.round_volume(position.volume * profile.partial_close_fraction);
        let remaining = position.volume - close_volume;
        if close_volume + 1e-9 < dust || remaining + 1e-9 < dust {
            tracing::info!(
                ticket = position.ticket,
                volume = position.volume,
                dust,
                "Partial close skipped, volume too small"
            );
            self.advance(state, ExitStage::Trailing, now).await;
            return Ok(());
        }

        // Re-read before closing: never close twice
        let Some(fresh) = self.broker.get_position(position.ticket).await? else {
            tracing::info!(ticket = position.ticket, "Position gone before partial close");
            return Ok(());
        };
        if fresh.volume + 1e-9 < state.initial_volume {
            tracing::info!(ticket = position.ticket, volume = fresh.volume, "Partial close already done");
            self.advance(state, ExitStage::PartialTaken, now).await;
            self.advance(state, ExitStage::Trailing, now).await;
            return Ok(());
        }

        self.arbiter.authorize(state, self.role)?;
        report.mutations += 1;
        let fraction = close_volume / fresh.volume;
        match self.broker.close(position.ticket, fraction).await {
            Ok(CloseOutcome::Closed { closed_volume }) => {
                state.consecutive_failures = 0;
                tracing::info!(ticket = position.ticket, closed_volume, "Partial profit taken");
                self.advance(state, ExitStage::PartialTaken, now).await;
                self.advance(state, ExitStage::Trailing, now).await;
            }
            Ok(CloseOutcome::AlreadyClosed) => {
                tracing::info!(ticket = position.ticket, "Position already closed at broker");
            }
            Ok(CloseOutcome::Rejected(reason)) => self.record_failure(state, &reason).await,
            Err(e) => self.record_failure(state, &e.to_string()).await,
        }
        Ok(())
    }

    async fn trail(
        &self,
        position: &Position,
        state: &mut ExitState,
        price: f64,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> Result<(), GuardError> {
        let distance = match self
            .estimator
            .stop_distance_at(&position.symbol, self.estimator.timeframes(), now)
        {
            StopDistance::Available(distance) => distance,
            StopDistance::Unavailable => {
                tracing::debug!(ticket = position.ticket, "No stop distance, trailing paused");
                return Ok(());
            }
        };

        let spec = self.broker.symbol_spec(&position.symbol).await?;
        let candidate = trailing_stop(position.direction, price, distance, spec.stops_level);
        if !position.stop_improves(candidate) {
            return Ok(());
        }

        match self.modify(position, state, candidate, report).await? {
            MutationResult::Done => {
                state.last_update_at = now;
                self.persist(state).await;
                tracing::info!(ticket = position.ticket, stop = candidate, distance, "Trailing stop moved");
            }
            MutationResult::Failed(reason) => self.record_failure(state, &reason).await,
        }
        Ok(())
    }

    /// Poll forever, faster while any owned ticket is close to acting
    pub async fn run(self) {
        let urgent = Duration::from_secs(self.config.urgent_interval_secs);
        let relaxed = Duration::from_secs(self.config.relaxed_interval_secs);
        tracing::info!(role = %self.role, "Exit controller started");

        loop {
            let report = self.run_cycle(Utc::now()).await;
            if report.managed > 0 {
                tracing::debug!(role = %self.role, ?report, "Exit cycle complete");
            }
            sleep(if report.urgent { urgent } else { relaxed }).await;
        }
    }
}

/// Reload persisted exit states, dropping those whose positions are gone.
///
/// With the broker unreachable every state is kept; the first successful
/// cycle drops the vanished ones.
pub async fn restore_exit_states(
    broker: &dyn Broker,
    store: &dyn StateStore,
    arbiter: &Arbiter,
) -> Result<usize, GuardError> {
    let persisted = store.load_exit_states().await?;
    let live: Option<HashSet<Ticket>> = match broker.get_positions().await {
        Ok(positions) => Some(positions.into_iter().map(|p| p.ticket).collect()),
        Err(e) => {
            tracing::warn!("Broker unreachable during restore, keeping all persisted states: {}", e);
            None
        }
    };

    let mut restored = 0;
    for state in persisted {
        let alive = live.as_ref().map_or(true, |l| l.contains(&state.ticket));
        if alive {
            arbiter.restore(state);
            restored += 1;
        } else {
            tracing::info!(ticket = state.ticket, stage = %state.stage, "Dropping exit state of vanished position");
            store.delete_exit_state(state.ticket).await?;
        }
    }

    tracing::info!("Restored {} exit states", restored);
    Ok(restored)
}
