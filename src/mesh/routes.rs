//! Multi-path distance-vector route table.
//!
//! Up to [`MAX_ROUTES_PER_DEST`] alternatives are held per destination.
//! Exactly one is primary whenever any exist: the highest-scoring entry,
//! freshest on ties. Score folds link quality against path length:
//! `quality - 20 x hops`, clamped to 0..=255.

use crate::types::{MAX_ROUTES_PER_DEST, NodeAddr};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Routes younger than this are fresh.
pub const ROUTE_FRESH_SECS: u64 = 120;

/// Routes older than this are stale and eligible for proactive refresh.
pub const ROUTE_STALE_SECS: u64 = 240;

/// Routes older than this are dropped outright.
pub const ROUTE_EXPIRE_SECS: u64 = 300;

/// Hop-count penalty per hop when scoring a route.
const HOP_PENALTY: i32 = 20;

/// Destinations tracked at once; relay-heavy nodes stay bounded.
const MAX_DESTINATIONS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteFreshness {
    Fresh,
    Aging,
    Stale,
}

impl RouteFreshness {
    pub fn name(self) -> &'static str {
        match self {
            RouteFreshness::Fresh => "fresh",
            RouteFreshness::Aging => "aging",
            RouteFreshness::Stale => "stale",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RouteEntry {
    pub dest: NodeAddr,
    pub next_hop: NodeAddr,
    pub hop_count: u8,
    pub quality: u8,
    pub score: u8,
    pub updated: Instant,
    pub is_primary: bool,
}

impl RouteEntry {
    pub fn freshness(&self, now: Instant) -> RouteFreshness {
        let age = now.saturating_duration_since(self.updated);
        if age < Duration::from_secs(ROUTE_FRESH_SECS) {
            RouteFreshness::Fresh
        } else if age < Duration::from_secs(ROUTE_STALE_SECS) {
            RouteFreshness::Aging
        } else {
            RouteFreshness::Stale
        }
    }
}

/// Compute a route score from reply quality and path length.
pub fn route_score(quality: u8, hop_count: u8) -> u8 {
    (quality as i32 - hop_count as i32 * HOP_PENALTY).clamp(0, 255) as u8
}

/// Serializable warm-start snapshot (`route_cache`). Ages do not survive the
/// restart: loaded routes come back stale so they are re-verified before
/// being trusted for long.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RouteSnapshot {
    pub routes: Vec<(u32, u32, u8, u8)>, // dest, next_hop, hop_count, quality
}

/// The route table. Owned by the engine loop.
pub struct RouteTable {
    routes: HashMap<NodeAddr, Vec<RouteEntry>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self { routes: HashMap::with_capacity(MAX_DESTINATIONS) }
    }

    /// Insert or refresh a route. An existing `(dest, next_hop)` pair is
    /// updated in place; otherwise the route is added, evicting the worst
    /// stored alternative when the table is full and the newcomer beats it.
    /// Returns `true` when the table changed.
    pub fn add_route(
        &mut self,
        dest: NodeAddr,
        next_hop: NodeAddr,
        hop_count: u8,
        quality: u8,
        now: Instant,
    ) -> bool {
        if !dest.is_valid_source() || !next_hop.is_valid_source() {
            return false;
        }
        if self.routes.len() >= MAX_DESTINATIONS && !self.routes.contains_key(&dest) {
            self.drop_worst_destination();
        }

        let score = route_score(quality, hop_count);
        let entries = self.routes.entry(dest).or_default();

        if let Some(entry) = entries.iter_mut().find(|e| e.next_hop == next_hop) {
            entry.hop_count = hop_count;
            entry.quality = quality;
            entry.score = score;
            entry.updated = now;
            Self::elect_primary(entries);
            return true;
        }

        if entries.len() >= MAX_ROUTES_PER_DEST {
            let worst = entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| (e.score, e.updated))
                .map(|(i, e)| (i, e.score));
            match worst {
                Some((idx, worst_score)) if score > worst_score => {
                    let evicted = entries.remove(idx);
                    debug!(dest = %dest, via = %evicted.next_hop, "evicting lowest-scoring route");
                }
                _ => return false,
            }
        }

        entries.push(RouteEntry {
            dest,
            next_hop,
            hop_count,
            quality,
            score,
            updated: now,
            is_primary: false,
        });
        Self::elect_primary(entries);
        trace!(dest = %dest, via = %next_hop, hops = hop_count, score, "route added");
        true
    }

    /// Primary route toward `dest`, if any.
    pub fn find_route(&self, dest: NodeAddr) -> Option<&RouteEntry> {
        self.routes.get(&dest)?.iter().find(|e| e.is_primary)
    }

    /// All routes toward `dest` (primary first is not guaranteed).
    pub fn routes_to(&self, dest: NodeAddr) -> &[RouteEntry] {
        self.routes.get(&dest).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Drop the failing primary and promote the best backup. Returns the new
    /// primary, or `None` when no alternative remains.
    pub fn failover(&mut self, dest: NodeAddr) -> Option<&RouteEntry> {
        let entries = self.routes.get_mut(&dest)?;
        entries.retain(|e| !e.is_primary);
        if entries.is_empty() {
            self.routes.remove(&dest);
            return None;
        }
        Self::elect_primary(entries);
        debug!(dest = %dest, "failing over to backup route");
        self.routes.get(&dest)?.iter().find(|e| e.is_primary)
    }

    /// Remove every route through a failed neighbor. Returns the
    /// destinations that lost their last route (ROUTE_ERR material);
    /// destinations with surviving alternatives silently promote one.
    pub fn invalidate_via(&mut self, next_hop: NodeAddr) -> Vec<NodeAddr> {
        let mut orphaned = Vec::new();
        self.routes.retain(|dest, entries| {
            let before = entries.len();
            entries.retain(|e| e.next_hop != next_hop);
            if entries.is_empty() {
                if before > 0 {
                    orphaned.push(*dest);
                }
                false
            } else {
                if entries.len() != before {
                    Self::elect_primary(entries);
                }
                true
            }
        });
        orphaned
    }

    /// Remove routes to `dest` that pass through `via` (on a received
    /// ROUTE_ERR). Returns `true` only when this actually removed something
    /// and left `dest` unreachable — the condition for propagating the
    /// error further.
    pub fn invalidate_dest_via(&mut self, dest: NodeAddr, via: NodeAddr) -> bool {
        let Some(entries) = self.routes.get_mut(&dest) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|e| e.next_hop != via);
        if entries.is_empty() {
            self.routes.remove(&dest);
            return before > 0;
        }
        if entries.len() != before {
            Self::elect_primary(entries);
        }
        false
    }

    /// Refresh every route through `via` (a HELLO reply proved the link is
    /// alive). Returns how many routes were touched.
    pub fn touch_all_via(&mut self, via: NodeAddr, now: Instant) -> usize {
        let mut touched = 0;
        for entries in self.routes.values_mut() {
            let mut changed = false;
            for entry in entries.iter_mut() {
                if entry.next_hop == via {
                    entry.updated = now;
                    changed = true;
                    touched += 1;
                }
            }
            if changed {
                Self::elect_primary(entries);
            }
        }
        touched
    }

    /// Drop expired routes; returns destinations that lost every route.
    pub fn scavenge(&mut self, now: Instant) -> Vec<NodeAddr> {
        let expiry = Duration::from_secs(ROUTE_EXPIRE_SECS);
        let mut lost = Vec::new();
        self.routes.retain(|dest, entries| {
            let before = entries.len();
            entries.retain(|e| now.saturating_duration_since(e.updated) < expiry);
            if entries.is_empty() {
                if before > 0 {
                    lost.push(*dest);
                }
                false
            } else {
                if entries.len() != before {
                    Self::elect_primary(entries);
                }
                true
            }
        });
        lost
    }

    /// Primaries old enough to deserve a proactive refresh ping.
    pub fn refresh_candidates(&self, now: Instant) -> Vec<(NodeAddr, NodeAddr)> {
        self.routes
            .values()
            .filter_map(|entries| entries.iter().find(|e| e.is_primary))
            .filter(|e| e.freshness(now) != RouteFreshness::Fresh)
            .map(|e| (e.dest, e.next_hop))
            .collect()
    }

    /// Refresh the timestamp of the route to `dest` via `via` (HELLO reply
    /// came back) without a discovery round.
    pub fn touch(&mut self, dest: NodeAddr, via: NodeAddr, now: Instant) -> bool {
        let Some(entries) = self.routes.get_mut(&dest) else {
            return false;
        };
        match entries.iter_mut().find(|e| e.next_hop == via) {
            Some(entry) => {
                entry.updated = now;
                Self::elect_primary(entries);
                true
            }
            None => false,
        }
    }

    pub fn known_destinations(&self) -> Vec<NodeAddr> {
        self.routes.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.routes.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RouteEntry> {
        self.routes.values().flatten()
    }

    /// Build the warm-start snapshot for persistence.
    pub fn snapshot(&self) -> RouteSnapshot {
        RouteSnapshot {
            routes: self
                .iter()
                .map(|e| (e.dest.to_u32(), e.next_hop.to_u32(), e.hop_count, e.quality))
                .collect(),
        }
    }

    /// Restore a snapshot; every loaded route is backdated to stale so it is
    /// verified before being relied on.
    pub fn restore(&mut self, snapshot: RouteSnapshot, now: Instant) {
        let backdated = now
            .checked_sub(Duration::from_secs(ROUTE_STALE_SECS + 1))
            .unwrap_or(now);
        for (dest, next_hop, hop_count, quality) in snapshot.routes {
            self.add_route(NodeAddr(dest), NodeAddr(next_hop), hop_count, quality, backdated);
        }
    }

    /// Re-establish the primary invariant: the max-score entry, freshest on
    /// ties, is the unique primary.
    fn elect_primary(entries: &mut [RouteEntry]) {
        let best = entries
            .iter()
            .enumerate()
            .max_by_key(|(_, e)| (e.score, e.updated))
            .map(|(i, _)| i);
        for (i, entry) in entries.iter_mut().enumerate() {
            entry.is_primary = Some(i) == best;
        }
    }

    fn drop_worst_destination(&mut self) {
        let victim = self
            .routes
            .iter()
            .filter_map(|(dest, entries)| {
                entries.iter().find(|e| e.is_primary).map(|e| (*dest, e.score, e.updated))
            })
            .min_by_key(|(_, score, updated)| (*score, *updated))
            .map(|(dest, _, _)| dest);
        if let Some(dest) = victim {
            debug!(dest = %dest, "destination table full, dropping weakest");
            self.routes.remove(&dest);
        }
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}
