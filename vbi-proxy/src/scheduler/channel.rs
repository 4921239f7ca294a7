//! Channel token arbitration for one device.
//!
//! At most one client holds the channel token at a time. Clients above
//! the background tier win outright, the most recent request first.
//! Background clients time-share the channel: a holder keeps it for its
//! minimum duration, after which the client served the fewest times takes
//! over. Sub-priority and waiting time break ties.
//!
//! Hand-off is two-phase. The holder is asked to give the token back and
//! the next client is only granted after it confirms, or after the
//! reclaim timeout elapses.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use log::{debug, warn};
use vbi_proxy_protocol::{ChannelNotifyFlags, ChannelPriority, ChannelProfile, TokenReply, TokenStatus};

use crate::device::ClientId;

/// Per-client token state. Every state from `Grant` on counts as holding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum TokenState {
    None,
    Grant,
    Granted,
    Reclaim,
    Release,
    Returned,
}

struct ChannelClient {
    priority: ChannelPriority,
    profile: ChannelProfile,
    requested: bool,
    request_seq: u64,
    token: TokenState,
    last_start: Option<Instant>,
    last_duration: Duration,
    cycle_count: u32,
    is_completed: bool,
    reclaim_since: Option<Instant>,
}

impl ChannelClient {
    fn new() -> Self {
        Self {
            priority: ChannelPriority::default(),
            profile: ChannelProfile::default(),
            requested: false,
            request_seq: 0,
            token: TokenState::None,
            last_start: None,
            last_duration: Duration::ZERO,
            cycle_count: 0,
            is_completed: false,
            reclaim_since: None,
        }
    }

    fn holds(&self) -> bool {
        self.token >= TokenState::Grant
    }

    fn is_candidate(&self) -> bool {
        self.requested
            && !self.is_completed
            && (self.priority > ChannelPriority::Background || self.profile.is_valid)
    }

    fn min_duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.profile.min_duration))
    }

    /// Still inside the minimum hold time of its current grant.
    fn is_protected(&self, now: Instant) -> bool {
        self.holds()
            && self
                .last_start
                .map_or(false, |start| now.saturating_duration_since(start) < self.min_duration())
    }

    fn end_hold(&mut self, now: Instant) {
        if let Some(start) = self.last_start {
            self.last_duration = now.saturating_duration_since(start);
        }
        self.cycle_count += 1;
        self.token = TokenState::None;
        self.reclaim_since = None;
    }
}

/// Indication the broker must deliver after a scheduling decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelAction {
    /// Tell the client it now holds the token.
    Grant(ClientId),
    /// Ask the client to give the token back.
    Reclaim(ClientId),
}

pub struct ChannelScheduler {
    clients: BTreeMap<ClientId, ChannelClient>,
    reclaim_timeout: Duration,
    next_seq: u64,
}

impl ChannelScheduler {
    pub fn new(reclaim_timeout: Duration) -> Self {
        Self {
            clients: BTreeMap::new(),
            reclaim_timeout,
            next_seq: 1,
        }
    }

    pub fn add_client(&mut self, id: ClientId) {
        self.clients.entry(id).or_insert_with(ChannelClient::new);
    }

    /// Drop a client; if it held the token the channel is rescheduled.
    pub fn remove_client(&mut self, id: ClientId, now: Instant) -> Vec<ChannelAction> {
        match self.clients.remove(&id) {
            Some(_) => self.schedule(now),
            None => Vec::new(),
        }
    }

    pub fn holder(&self) -> Option<ClientId> {
        self.clients.iter().find(|(_, c)| c.holds()).map(|(id, _)| *id)
    }

    /// Whether `id` may change the channel: nobody holds it, or `id` does.
    pub fn may_switch(&self, id: ClientId) -> bool {
        self.holder().map_or(true, |holder| holder == id)
    }

    pub fn cycle_count(&self, id: ClientId) -> Option<u32> {
        self.clients.get(&id).map(|c| c.cycle_count)
    }

    /// Handle a token request. The requester's own grant is reported in
    /// the reply rather than as an action.
    pub fn request_token(
        &mut self,
        id: ClientId,
        priority: ChannelPriority,
        profile: ChannelProfile,
        now: Instant,
    ) -> (TokenReply, Vec<ChannelAction>) {
        let base = self.min_cycle(Some(id));
        let seq = self.next_seq;
        self.next_seq += 1;

        let client = match self.clients.get_mut(&id) {
            Some(c) => c,
            None => return (TokenReply::default(), Vec::new()),
        };
        if !client.requested || client.is_completed {
            // Newcomers join the rotation level with the others.
            client.cycle_count = base;
        }
        client.priority = priority;
        client.profile = profile;
        client.requested = true;
        client.is_completed = false;
        client.request_seq = seq;
        debug!(
            "[Client {}] Channel token requested ({:?}, sub-priority 0x{:02X}, min {}s, exp {}s)",
            id, priority, profile.sub_prio, profile.min_duration, profile.exp_duration
        );

        let mut actions = self.schedule(now);
        actions.retain(|a| *a != ChannelAction::Grant(id));
        self.confirm_grant(id);
        (self.reply_for(id), actions)
    }

    /// The grant indication was delivered.
    pub fn confirm_grant(&mut self, id: ClientId) {
        if let Some(c) = self.clients.get_mut(&id) {
            if c.token == TokenState::Grant {
                c.token = TokenState::Granted;
            }
        }
    }

    /// The client confirmed a reclaim request.
    pub fn reclaim_confirmed(&mut self, id: ClientId, now: Instant) -> Vec<ChannelAction> {
        if let Some(c) = self.clients.get_mut(&id) {
            if c.token == TokenState::Reclaim {
                c.token = TokenState::Returned;
            }
        }
        self.schedule(now)
    }

    /// Token related notification from a client.
    pub fn notify(&mut self, id: ClientId, flags: ChannelNotifyFlags, now: Instant) -> Vec<ChannelAction> {
        if let Some(c) = self.clients.get_mut(&id) {
            if flags.contains(ChannelNotifyFlags::RELEASE) {
                c.is_completed = true;
            }
            if flags.contains(ChannelNotifyFlags::TOKEN) && c.priority > ChannelPriority::Background {
                c.requested = false;
            }
            if flags.intersects(ChannelNotifyFlags::TOKEN | ChannelNotifyFlags::RELEASE)
                && c.holds()
                && c.token <= TokenState::Reclaim
            {
                c.token = TokenState::Release;
            }
        }
        self.schedule(now)
    }

    /// Soonest instant at which [`schedule`](Self::schedule) may change its decision.
    pub fn next_deadline(&self, now: Instant) -> Option<Instant> {
        let candidates = self.clients.values().filter(|c| c.is_candidate()).count();
        self.clients
            .values()
            .filter_map(|c| match c.token {
                TokenState::Granted | TokenState::Grant
                    if c.priority == ChannelPriority::Background && candidates > 1 =>
                {
                    c.last_start.map(|s| s + c.min_duration())
                }
                TokenState::Reclaim => c.reclaim_since.map(|s| s + self.reclaim_timeout),
                _ => None,
            })
            .filter(|deadline| *deadline > now)
            .min()
    }

    /// Re-evaluate who should hold the channel.
    pub fn schedule(&mut self, now: Instant) -> Vec<ChannelAction> {
        let mut actions = Vec::new();
        let reclaim_timeout = self.reclaim_timeout;

        for (id, c) in self.clients.iter_mut() {
            match c.token {
                TokenState::Release | TokenState::Returned => {
                    c.end_hold(now);
                    debug!(
                        "[Client {}] Channel token returned after {:?} (cycle {})",
                        id, c.last_duration, c.cycle_count
                    );
                }
                TokenState::Reclaim
                    if c.reclaim_since
                        .map_or(false, |s| now.saturating_duration_since(s) >= reclaim_timeout) =>
                {
                    warn!("[Client {}] Did not return the channel token in time, revoking it", id);
                    c.end_hold(now);
                }
                _ => {}
            }
        }

        let max_priority = self
            .clients
            .values()
            .filter(|c| c.is_candidate())
            .map(|c| c.priority)
            .max();

        match max_priority {
            Some(top) if top > ChannelPriority::Background => {
                self.schedule_priority(top, now, &mut actions)
            }
            _ => self.schedule_background(now, &mut actions),
        }

        self.rebase_cycles();
        actions
    }

    /// Most recent request at the top tier wins; everyone else is revoked at once.
    fn schedule_priority(&mut self, top: ChannelPriority, now: Instant, actions: &mut Vec<ChannelAction>) {
        let winner = self
            .clients
            .iter()
            .filter(|(_, c)| c.is_candidate() && c.priority == top)
            .max_by_key(|(_, c)| c.request_seq)
            .map(|(id, _)| *id);
        let winner = match winner {
            Some(w) => w,
            None => return,
        };

        for (id, c) in self.clients.iter_mut() {
            if *id != winner && c.holds() {
                debug!("[Client {}] Channel token preempted by client {}", id, winner);
                c.end_hold(now);
                actions.push(ChannelAction::Reclaim(*id));
            }
        }

        if let Some(c) = self.clients.get_mut(&winner) {
            match c.token {
                TokenState::None => {
                    c.token = TokenState::Grant;
                    c.last_start = Some(now);
                    actions.push(ChannelAction::Grant(winner));
                }
                TokenState::Reclaim => {
                    c.token = TokenState::Granted;
                    c.reclaim_since = None;
                }
                _ => {}
            }
        }
    }

    fn schedule_background(&mut self, now: Instant, actions: &mut Vec<ChannelAction>) {
        let holder = self.holder();
        if let Some(h) = holder {
            if self.clients[&h].token == TokenState::Reclaim {
                return;
            }
        }

        let winner = self
            .clients
            .iter()
            .filter(|(_, c)| c.is_candidate())
            .min_by_key(|(_, c)| {
                let protected = c.is_protected(now);
                let active = c.holds() && !protected;
                (
                    !protected,
                    c.cycle_count + u32::from(active),
                    Reverse(c.profile.sub_prio),
                    c.last_start,
                    c.request_seq,
                )
            })
            .map(|(id, _)| *id);

        match (holder, winner) {
            (Some(h), w) if w != Some(h) => {
                if let Some(c) = self.clients.get_mut(&h) {
                    debug!("[Client {}] Reclaiming channel token", h);
                    c.token = TokenState::Reclaim;
                    c.reclaim_since = Some(now);
                    actions.push(ChannelAction::Reclaim(h));
                }
            }
            (None, Some(w)) => {
                if let Some(c) = self.clients.get_mut(&w) {
                    debug!("[Client {}] Granting channel token (cycle {})", w, c.cycle_count);
                    c.token = TokenState::Grant;
                    c.last_start = Some(now);
                    actions.push(ChannelAction::Grant(w));
                }
            }
            _ => {}
        }
    }

    fn min_cycle(&self, except: Option<ClientId>) -> u32 {
        self.clients
            .iter()
            .filter(|(id, c)| Some(**id) != except && c.is_candidate())
            .map(|(_, c)| c.cycle_count)
            .min()
            .unwrap_or(0)
    }

    /// Keep counters small; only their differences matter.
    fn rebase_cycles(&mut self) {
        let base = self.min_cycle(None);
        if base > 0 {
            for c in self.clients.values_mut() {
                c.cycle_count = c.cycle_count.saturating_sub(base);
            }
        }
    }

    fn reply_for(&self, id: ClientId) -> TokenReply {
        let client = match self.clients.get(&id) {
            Some(c) => c,
            None => return TokenReply::default(),
        };
        let status = if client.holds() {
            TokenStatus::Granted
        } else if client.is_candidate() {
            TokenStatus::Pending
        } else {
            TokenStatus::Idle
        };
        let non_exclusive = client.priority > ChannelPriority::Background
            && self.clients.iter().any(|(other, c)| {
                *other != id && c.requested && c.priority == client.priority
            });
        TokenReply {
            status,
            permitted: self.may_switch(id),
            non_exclusive,
        }
    }
}
