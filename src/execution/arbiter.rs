use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Mutex as TicketLock;

use crate::error::GuardError;
use crate::models::{ExitStage, ExitState, Intent, Owner, Position, Ticket};

pub type SharedExitState = Arc<TicketLock<ExitState>>;

#[derive(Default)]
struct Registry {
    states: HashMap<Ticket, SharedExitState>,
    /// Strategy tags announced before the position appeared
    preregistered: HashMap<Ticket, String>,
    /// Strategy claims on GENERIC tickets, honoured at breakeven
    pending_claims: HashMap<Ticket, String>,
}

/// Single authority over which controller may mutate a ticket.
///
/// Each ExitState sits behind its own async lock; holders keep it across
/// the broker call so ownership cannot change mid-mutation.
pub struct Arbiter {
    registry: Mutex<Registry>,
    known_tags: HashSet<String>,
}

impl Arbiter {
    pub fn new<I, S>(known_tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            registry: Mutex::new(Registry::default()),
            known_tags: known_tags.into_iter().map(Into::into).collect(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_known_tag(&self, tag: &str) -> bool {
        self.known_tags.contains(tag)
    }

    /// Announce that an upcoming position belongs to a strategy
    pub fn preregister(&self, ticket: Ticket, tag: impl Into<String>) {
        let tag = tag.into();
        tracing::debug!(ticket, tag = %tag, "Pre-registered strategy tag");
        self.lock().preregistered.insert(ticket, tag);
    }

    /// Seed ownership from the trade intent that opened `ticket`; untagged intents stay generic
    pub fn register_intent(&self, ticket: Ticket, intent: &Intent) {
        if let Some(tag) = intent.strategy_tag.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            self.preregister(ticket, tag);
        }
    }

    /// Claim a GENERIC ticket for a strategy; takes effect at its breakeven transition.
    /// Returns false if the tag has no profile or the ticket is not eligible.
    pub fn request_handoff(&self, ticket: Ticket, tag: impl Into<String>) -> bool {
        let tag = tag.into();
        if !self.is_known_tag(&tag) {
            tracing::warn!(ticket, tag = %tag, "Handoff requested for unknown strategy tag");
            return false;
        }

        let mut registry = self.lock();
        if let Some(state) = registry.states.get(&ticket) {
            // Not generic, or already past the breakeven handoff point
            match state.try_lock() {
                Ok(state)
                    if state.owner != Owner::Generic
                        || state.handed_off
                        || state.stage != ExitStage::Initial =>
                {
                    return false
                }
                _ => {}
            }
        }
        registry.pending_claims.insert(ticket, tag);
        true
    }

    /// Shared state for a position, created on first observation.
    /// Returns the state and whether it was just created.
    pub fn observe(&self, position: &Position, now: DateTime<Utc>) -> (SharedExitState, bool) {
        let mut registry = self.lock();
        if let Some(existing) = registry.states.get(&position.ticket) {
            return (existing.clone(), false);
        }

        let tag = registry
            .preregistered
            .remove(&position.ticket)
            .or_else(|| {
                position
                    .comment
                    .as_deref()
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(str::to_string)
            });

        let owner = match &tag {
            Some(t) if self.is_known_tag(t) => Owner::StrategySpecific,
            Some(t) => {
                tracing::warn!(
                    ticket = position.ticket,
                    tag = %t,
                    "No exit profile for strategy tag, managing generically"
                );
                Owner::Generic
            }
            None => Owner::Generic,
        };

        tracing::info!(
            ticket = position.ticket,
            symbol = %position.symbol,
            owner = %owner,
            "Tracking new position"
        );

        let state = Arc::new(TicketLock::new(ExitState::new(position, owner, tag, now)));
        registry.states.insert(position.ticket, state.clone());
        (state, true)
    }

    /// Reinstate a persisted state after restart
    pub fn restore(&self, state: ExitState) {
        let ticket = state.ticket;
        self.lock()
            .states
            .insert(ticket, Arc::new(TicketLock::new(state)));
    }

    pub fn get(&self, ticket: Ticket) -> Option<SharedExitState> {
        self.lock().states.get(&ticket).cloned()
    }

    pub fn tickets(&self) -> Vec<Ticket> {
        let mut tickets: Vec<Ticket> = self.lock().states.keys().copied().collect();
        tickets.sort_unstable();
        tickets
    }

    /// Forget a closed ticket; `None` if another caller already did
    pub fn remove(&self, ticket: Ticket) -> Option<SharedExitState> {
        let mut registry = self.lock();
        registry.pending_claims.remove(&ticket);
        registry.preregistered.remove(&ticket);
        registry.states.remove(&ticket)
    }

    /// Hand a GENERIC ticket to its pending strategy claim.
    ///
    /// Caller holds the ticket lock and has just set BREAKEVEN_SET. Happens at
    /// most once per ticket; returns the new strategy tag on handoff.
    pub fn try_handoff(&self, state: &mut ExitState) -> Option<String> {
        if state.owner != Owner::Generic || state.handed_off {
            return None;
        }
        let tag = self.lock().pending_claims.remove(&state.ticket)?;

        state.owner = Owner::StrategySpecific;
        state.strategy_tag = Some(tag.clone());
        state.handed_off = true;

        tracing::info!(ticket = state.ticket, tag = %tag, "Ownership handed to strategy controller");
        Some(tag)
    }

    /// Ownership gate checked before every stop or volume mutation
    pub fn authorize(&self, state: &ExitState, role: Owner) -> Result<(), GuardError> {
        if state.owner == role {
            return Ok(());
        }
        tracing::error!(
            ticket = state.ticket,
            attempted = %role,
            owner = %state.owner,
            "Ownership conflict, dropping mutation"
        );
        Err(GuardError::OwnershipConflict {
            ticket: state.ticket,
            attempted: role,
            owner: state.owner,
        })
    }
}
