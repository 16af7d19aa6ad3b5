//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//
//
// Per-source state used by IGMPv3 (RFC 3376) and MLDv2 (RFC 3810).
//
// Source records are owned by the group record they belong to, inside
// one of its two source sets. The RFC state-transition tables are
// phrased in terms of set algebra over shared records; here the same
// effect is obtained by moving records between the owned sets, which
// preserves their timers without sharing ownership.
//

use std::collections::{BTreeMap, BTreeSet};
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use mgmd_utils::task::TimeoutTask;
use tokio::sync::mpsc::Sender;

use crate::tasks;
use crate::tasks::messages::input::SourceTimeoutMsg;
use crate::version::Version;

// State for one source address within one group record.
#[derive(Debug)]
pub struct SourceRecord<V: Version> {
    // Source address.
    pub source: V::IpAddr,
    // Source timer. In INCLUDE mode it bounds the lifetime of the
    // forwarding state for this source; in EXCLUDE mode it is running
    // iff the source is in the "forward" set.
    pub source_timer: Option<TimeoutTask>,
    // Number of outstanding Group-and-Source-Specific Query
    // retransmissions addressed at this source.
    pub query_retransmission_count: u8,
}

// Set of source records, ordered by source address.
#[derive(Debug, Default)]
pub struct SourceSet<V: Version>(BTreeMap<V::IpAddr, SourceRecord<V>>);

// Arguments needed to (re)arm source timers.
#[derive(Clone, Copy, Debug)]
pub struct SourceTimerArgs<'a, V: Version> {
    pub ifindex: u32,
    pub group: V::IpAddr,
    pub source_timeoutp: &'a Sender<SourceTimeoutMsg<V>>,
}

// ===== impl SourceRecord =====

impl<V> SourceRecord<V>
where
    V: Version,
{
    pub(crate) fn new(source: V::IpAddr) -> SourceRecord<V> {
        SourceRecord {
            source,
            source_timer: None,
            query_retransmission_count: 0,
        }
    }

    // (Re)arms the source timer.
    pub(crate) fn set_source_timer(
        &mut self,
        timeout: Duration,
        args: &SourceTimerArgs<'_, V>,
    ) {
        self.source_timer = Some(tasks::source_timer(
            args.ifindex,
            args.group,
            self.source,
            timeout,
            args.source_timeoutp,
        ));
    }

    pub fn cancel_source_timer(&mut self) {
        self.source_timer = None;
    }

    // Lowers the source timer to the given timeout. A timer with less
    // time remaining, or no timer at all, is left untouched.
    pub(crate) fn lower_source_timer(
        &mut self,
        timeout: Duration,
        _args: &SourceTimerArgs<'_, V>,
    ) {
        if let Some(timer) = self.source_timer.as_mut() {
            if timer.remaining() > timeout {
                timer.reset(Some(timeout));
            }
        }
    }

    // Returns the remaining time until the source timer expires.
    pub fn timeout(&self) -> Duration {
        self.source_timer
            .as_ref()
            .map(TimeoutTask::remaining)
            .unwrap_or(Duration::ZERO)
    }
}

// ===== impl SourceSet =====

impl<V> SourceSet<V>
where
    V: Version,
{
    pub(crate) fn new() -> SourceSet<V> {
        SourceSet(BTreeMap::new())
    }

    // Extracts the set of source addresses.
    pub fn addresses(&self) -> BTreeSet<V::IpAddr> {
        self.0.keys().copied().collect()
    }

    // Creates records for the given addresses that aren't present yet.
    // Existing records are left untouched.
    pub(crate) fn insert_new_sources(&mut self, sources: &BTreeSet<V::IpAddr>) {
        for source in sources {
            self.0
                .entry(*source)
                .or_insert_with(|| SourceRecord::new(*source));
        }
    }

    // Removes and returns the records whose address is in the given
    // set, preserving their timers.
    pub(crate) fn take(
        &mut self,
        sources: &BTreeSet<V::IpAddr>,
    ) -> SourceSet<V> {
        let mut taken = SourceSet::new();
        for source in sources {
            if let Some(record) = self.0.remove(source) {
                taken.0.insert(*source, record);
            }
        }
        taken
    }

    // Keeps only the records whose address is in the given set, and
    // returns the removed remainder.
    pub(crate) fn retain_sources(
        &mut self,
        sources: &BTreeSet<V::IpAddr>,
    ) -> SourceSet<V> {
        let mut removed = SourceSet::new();
        let keys = self.addresses();
        for source in keys.difference(sources) {
            let record = self.0.remove(source).unwrap();
            removed.0.insert(*source, record);
        }
        removed
    }

    // Merges the records of another set into this one. On address
    // collision the record already present wins, preserving its timer.
    pub(crate) fn merge(&mut self, other: SourceSet<V>) {
        for (source, record) in other.0 {
            self.0.entry(source).or_insert(record);
        }
    }

    // Sets the source timer on every member whose address is in the
    // given set.
    pub(crate) fn set_source_timer(
        &mut self,
        sources: &BTreeSet<V::IpAddr>,
        timeout: Duration,
        args: &SourceTimerArgs<'_, V>,
    ) {
        for source in sources {
            if let Some(record) = self.0.get_mut(source) {
                record.set_source_timer(timeout, args);
            }
        }
    }

    // Sets the source timer on every member.
    pub fn set_source_timer_all(
        &mut self,
        timeout: Duration,
        args: &SourceTimerArgs<'_, V>,
    ) {
        for record in self.0.values_mut() {
            record.set_source_timer(timeout, args);
        }
    }

    // Cancels the source timer of every member whose address is in the
    // given set.
    pub fn cancel_source_timer(
        &mut self,
        sources: &BTreeSet<V::IpAddr>,
    ) {
        for source in sources {
            if let Some(record) = self.0.get_mut(source) {
                record.cancel_source_timer();
            }
        }
    }

    // Cancels the source timer of every member.
    pub fn cancel_source_timer_all(&mut self) {
        for record in self.0.values_mut() {
            record.cancel_source_timer();
        }
    }

    // Lowers the source timer of every member whose address is in the
    // given set.
    pub(crate) fn lower_source_timer(
        &mut self,
        sources: &BTreeSet<V::IpAddr>,
        timeout: Duration,
        args: &SourceTimerArgs<'_, V>,
    ) {
        for source in sources {
            if let Some(record) = self.0.get_mut(source) {
                record.lower_source_timer(timeout, args);
            }
        }
    }
}

impl<V> Deref for SourceSet<V>
where
    V: Version,
{
    type Target = BTreeMap<V::IpAddr, SourceRecord<V>>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<V> DerefMut for SourceSet<V>
where
    V: Version,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}
