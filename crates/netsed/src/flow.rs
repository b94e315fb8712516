//! Per-conversation state and the datagram pseudo-connection registry.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::rules::RuleSet;
use crate::sed::{self, Rewrite};

/// Lifecycle of one proxied conversation.
///
/// Ordering is significant: every state at or past [`Disconnected`] is
/// terminal and the flow is discarded.
///
/// [`Disconnected`]: FlowState::Disconnected
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FlowState {
    /// Datagram forwarded upstream, no reply from the server yet.
    Unreplied,
    /// Accepted stream, or datagram conversation with at least one reply.
    Established,
    /// Read or write error on either side, or upstream EOF.
    Disconnected,
    /// Datagram conversation idle past the timeout.
    TimedOut,
}

impl FlowState {
    pub fn is_terminal(self) -> bool {
        self >= FlowState::Disconnected
    }
}

/// Mutable per-flow state: lifecycle, per-rule budgets, and the idle clock.
///
/// The TTL vector is cloned from the rule set at admission and consumed as
/// rules fire; it is never shared between flows.
#[derive(Debug)]
pub struct Flow {
    state: FlowState,
    ttl: Vec<i32>,
    last_activity: Instant,
}

impl Flow {
    /// New stream flow; accepted connections start established.
    pub fn stream(rules: &RuleSet) -> Self {
        Flow::with_state(rules, FlowState::Established)
    }

    /// New datagram pseudo-connection; unreplied until the server answers.
    pub fn datagram(rules: &RuleSet) -> Self {
        Flow::with_state(rules, FlowState::Unreplied)
    }

    fn with_state(rules: &RuleSet, state: FlowState) -> Self {
        Flow {
            state,
            ttl: rules.initial_ttls(),
            last_activity: Instant::now(),
        }
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub fn ttl(&self) -> &[i32] {
        &self.ttl
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Run one payload through the rule list and refresh the idle clock.
    pub fn rewrite(&mut self, rules: &RuleSet, payload: &[u8]) -> Result<Rewrite> {
        let rewrite = sed::rewrite(rules, &mut self.ttl, payload)?;
        self.last_activity = Instant::now();
        Ok(rewrite)
    }

    /// The server answered; the conversation is established.
    pub fn mark_established(&mut self) {
        self.state = FlowState::Established;
    }

    /// I/O error or EOF on either side.
    pub fn disconnect(&mut self) {
        self.state = FlowState::Disconnected;
    }

    /// Idle past the datagram timeout.
    pub fn time_out(&mut self) {
        self.state = FlowState::TimedOut;
    }

    /// When this flow expires if no further activity is seen.
    pub fn idle_deadline(&self, timeout: Duration) -> Instant {
        self.last_activity + timeout
    }
}

/// Ordered registry of live datagram pseudo-connections.
///
/// Keyed by the exact peer address the OS reported; equality covers every
/// component, so any difference keys a new flow. Lookup is a linear scan —
/// the expected population is small — and iteration order is insertion
/// order.
#[derive(Debug)]
pub struct FlowTable<H> {
    entries: Vec<(SocketAddr, H)>,
}

impl<H> FlowTable<H> {
    pub fn new() -> Self {
        FlowTable {
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, peer: SocketAddr, handle: H) {
        self.entries.push((peer, handle));
    }

    pub fn find(&self, peer: &SocketAddr) -> Option<&H> {
        self.entries
            .iter()
            .find(|(known, _)| known == peer)
            .map(|(_, handle)| handle)
    }

    pub fn remove(&mut self, peer: &SocketAddr) -> Option<H> {
        let index = self.entries.iter().position(|(known, _)| known == peer)?;
        Some(self.entries.remove(index).1)
    }

    pub fn peers(&self) -> impl Iterator<Item = &SocketAddr> {
        self.entries.iter().map(|(peer, _)| peer)
    }
}

impl<H> Default for FlowTable<H> {
    fn default() -> Self {
        FlowTable::new()
    }
}
