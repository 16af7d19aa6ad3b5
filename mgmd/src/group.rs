//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//
//
// Per-group membership state used by IGMPv1/v2 (RFC 2236),
// IGMPv3 (RFC 3376), MLDv1 (RFC 2710) and MLDv2 (RFC 3810).
//
// Each group record runs the router-side report state machine of
// RFC 3376 Section 6.4 / RFC 3810 Section 7.4. The record owns its
// source records; the set operations of the RFC transition tables are
// expressed by moving records between the "forward" and "don't
// forward" sets so that running source timers are preserved.
//

use std::collections::{BTreeMap, BTreeSet};
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use chrono::{DateTime, Utc};
use mgmd_utils::bus::MembershipAction;
use mgmd_utils::ip::IpAddrKind;
use mgmd_utils::protocol::Protocol;
use mgmd_utils::task::{IntervalTask, TimeoutTask};
use serde::{Deserialize, Serialize};

use crate::debug::Debug;
use crate::instance::{InstanceUpView, join_prune_notify_routing};
use crate::interface::InterfaceView;
use crate::source::{SourceSet, SourceTimerArgs};
use crate::version::Version;
use crate::{output, tasks};

// Group filter mode (RFC 3376 Section 6.2.1).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum FilterMode {
    #[default]
    Include,
    Exclude,
}

// The two older-version-host-present timers. IGMPv2 and MLDv1 share
// one slot since at most one of them applies to a running instance.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum OlderHostTimer {
    V1,
    V2OrMldv1,
}

// Queries mandated by a state transition, to be transmitted by the
// owning interface once the transition has been applied.
#[derive(Debug)]
pub struct PendingQueries<V: Version> {
    // Group-Specific Query required.
    pub group_query: bool,
    // Sources requiring a Group-and-Source-Specific Query.
    pub source_query: BTreeSet<V::IpAddr>,
}

impl<V: Version> Default for PendingQueries<V> {
    fn default() -> Self {
        PendingQueries {
            group_query: false,
            source_query: BTreeSet::new(),
        }
    }
}

// Membership state for one (interface, group) pair.
#[derive(Debug)]
pub struct GroupRecord<V: Version> {
    // Multicast group address.
    pub group: V::IpAddr,
    // Current filter mode.
    pub filter_mode: FilterMode,
    // Sources whose traffic is forwarded.
    pub forward_sources: SourceSet<V>,
    // Sources whose traffic is not forwarded (EXCLUDE mode only).
    pub dont_forward_sources: SourceSet<V>,
    // Group timer. Running iff the filter mode is EXCLUDE; its expiry
    // switches the record back to INCLUDE mode.
    pub group_timer: Option<TimeoutTask>,
    // Periodic Group-Specific and Group-and-Source-Specific Query
    // retransmission timer.
    pub group_query_timer: Option<IntervalTask>,
    // Outstanding Group-Specific Query retransmissions.
    pub query_retransmission_count: u8,
    // Older-version-host-present timers (IGMPv1, IGMPv2/MLDv1).
    pub v1_host_present_timer: Option<TimeoutTask>,
    pub v2_or_mldv1_host_present_timer: Option<TimeoutTask>,
    // Host that last reported membership for this group.
    pub last_reported_host: Option<V::IpAddr>,
    // Time when the record was created.
    pub created: DateTime<Utc>,
}

// Group records owned by one interface, ordered by group address.
#[derive(Debug, Default)]
pub struct GroupSet<V: Version>(BTreeMap<V::IpAddr, GroupRecord<V>>);

// ===== impl GroupRecord =====

impl<V> GroupRecord<V>
where
    V: Version,
{
    pub(crate) fn new(group: V::IpAddr) -> GroupRecord<V> {
        Debug::<V>::GroupCreate(&group).log();

        GroupRecord {
            group,
            filter_mode: FilterMode::Include,
            forward_sources: SourceSet::new(),
            dont_forward_sources: SourceSet::new(),
            group_timer: None,
            group_query_timer: None,
            query_retransmission_count: 0,
            v1_host_present_timer: None,
            v2_or_mldv1_host_present_timer: None,
            last_reported_host: None,
            created: Utc::now(),
        }
    }

    // A record is unused once it no longer describes any forwarding
    // state. Unused records are deleted by the owning group set.
    pub fn is_unused(&self) -> bool {
        match self.filter_mode {
            FilterMode::Include => {
                debug_assert!(self.dont_forward_sources.is_empty());
                self.forward_sources.is_empty()
            }
            FilterMode::Exclude => {
                // The group timer must be running in EXCLUDE mode,
                // otherwise a transition to INCLUDE mode took place.
                if self.group_timer.is_some() {
                    return false;
                }
                debug_assert!(self.forward_sources.is_empty());
                debug_assert!(self.dont_forward_sources.is_empty());
                true
            }
        }
    }

    // Returns the remaining time until the group timer expires.
    pub fn timeout(&self) -> Duration {
        self.group_timer
            .as_ref()
            .map(TimeoutTask::remaining)
            .unwrap_or(Duration::ZERO)
    }

    fn set_filter_mode(&mut self, filter_mode: FilterMode) {
        if self.filter_mode != filter_mode {
            Debug::<V>::GroupFilterModeChange(
                &self.group,
                self.filter_mode,
                filter_mode,
            )
            .log();
            self.filter_mode = filter_mode;
        }
    }

    fn set_group_timer(
        &mut self,
        instance: &InstanceUpView<'_, V>,
        iface: &InterfaceView<'_, V>,
        timeout: Duration,
    ) {
        self.group_timer = Some(tasks::group_timer(
            iface.ifindex,
            self.group,
            timeout,
            &instance.tx.protocol_input.group_timeout,
        ));
    }

    // Lowers the group timer to the given timeout. A timer with less
    // time remaining, or no timer at all, is left untouched.
    pub(crate) fn lower_group_timer(&mut self, timeout: Duration) {
        if let Some(timer) = self.group_timer.as_mut() {
            if timer.remaining() > timeout {
                timer.reset(Some(timeout));
            }
        }
    }

    // Lowers the timers of the given forwarded sources.
    pub(crate) fn lower_source_timer(
        &mut self,
        instance: &InstanceUpView<'_, V>,
        iface: &InterfaceView<'_, V>,
        sources: &BTreeSet<V::IpAddr>,
        timeout: Duration,
    ) {
        let args = SourceTimerArgs {
            ifindex: iface.ifindex,
            group: self.group,
            source_timeoutp: &instance.tx.protocol_input.source_timeout,
        };
        self.forward_sources.lower_source_timer(sources, timeout, &args);
    }

    //
    // Report processing. One method per report type; each one computes
    // the new state from a snapshot of the old one, following the
    // transition tables of RFC 3376 Section 6.4.1/6.4.2 and
    // RFC 3810 Section 7.4.1/7.4.2.
    //

    // Process MODE_IS_INCLUDE report.
    pub(crate) fn process_mode_is_include(
        &mut self,
        instance: &mut InstanceUpView<'_, V>,
        iface: &InterfaceView<'_, V>,
        sources: &BTreeSet<V::IpAddr>,
        reporter: V::IpAddr,
    ) -> PendingQueries<V> {
        let old_mode = self.filter_mode;
        let old_forward = self.forward_sources.addresses();
        let old_dont_forward = self.dont_forward_sources.addresses();

        self.last_reported_host = Some(reporter);
        self.add_and_refresh_sources(instance, iface, sources);

        self.calculate_forwarding_changes(
            instance,
            iface,
            old_mode,
            &old_forward,
            &old_dont_forward,
        );

        PendingQueries::default()
    }

    // Process ALLOW_NEW_SOURCES report.
    //
    // The transitions are those of MODE_IS_INCLUDE.
    pub(crate) fn process_allow_new_sources(
        &mut self,
        instance: &mut InstanceUpView<'_, V>,
        iface: &InterfaceView<'_, V>,
        sources: &BTreeSet<V::IpAddr>,
        reporter: V::IpAddr,
    ) -> PendingQueries<V> {
        self.process_mode_is_include(instance, iface, sources, reporter)
    }

    // Process MODE_IS_EXCLUDE report.
    pub(crate) fn process_mode_is_exclude(
        &mut self,
        instance: &mut InstanceUpView<'_, V>,
        iface: &InterfaceView<'_, V>,
        sources: &BTreeSet<V::IpAddr>,
        reporter: V::IpAddr,
    ) -> PendingQueries<V> {
        let old_mode = self.filter_mode;
        let old_forward = self.forward_sources.addresses();
        let old_dont_forward = self.dont_forward_sources.addresses();

        self.last_reported_host = Some(reporter);
        let gmi = iface.config.group_membership_interval();

        match self.filter_mode {
            FilterMode::Include => {
                //
                // Router State: INCLUDE (A)
                // Report Received: IS_EX (B)
                // New Router State: EXCLUDE (A * B, B - A)
                // Actions: (B - A) = 0
                //          Delete (A - B)
                //          Group Timer = GMI
                //
                let a = self.forward_sources.addresses();
                let b_minus_a: BTreeSet<_> =
                    sources.difference(&a).copied().collect();

                self.set_filter_mode(FilterMode::Exclude);
                self.forward_sources.retain_sources(sources);
                self.dont_forward_sources.insert_new_sources(&b_minus_a);
                self.set_group_timer(instance, iface, gmi);
            }
            FilterMode::Exclude => {
                //
                // Router State: EXCLUDE (X, Y)
                // Report Received: IS_EX (A)
                // New Router State: EXCLUDE (A - Y, Y * A)
                // Actions: (A - X - Y) = GMI
                //          Delete (X - A)
                //          Delete (Y - A)
                //          Group Timer = GMI
                //
                let fresh = self.sources_not_present(sources);

                self.forward_sources.retain_sources(sources);
                self.dont_forward_sources.retain_sources(sources);
                self.forward_sources.insert_new_sources(&fresh);
                {
                    let args = SourceTimerArgs {
                        ifindex: iface.ifindex,
                        group: self.group,
                        source_timeoutp: &instance
                            .tx
                            .protocol_input
                            .source_timeout,
                    };
                    self.forward_sources.set_source_timer(&fresh, gmi, &args);
                }
                self.set_group_timer(instance, iface, gmi);
            }
        }

        self.calculate_forwarding_changes(
            instance,
            iface,
            old_mode,
            &old_forward,
            &old_dont_forward,
        );

        PendingQueries::default()
    }

    // Process CHANGE_TO_INCLUDE_MODE report.
    pub(crate) fn process_change_to_include_mode(
        &mut self,
        instance: &mut InstanceUpView<'_, V>,
        iface: &InterfaceView<'_, V>,
        sources: &BTreeSet<V::IpAddr>,
        reporter: V::IpAddr,
    ) -> PendingQueries<V> {
        let old_mode = self.filter_mode;
        let old_forward = self.forward_sources.addresses();
        let old_dont_forward = self.dont_forward_sources.addresses();

        self.last_reported_host = Some(reporter);
        let mut queries = PendingQueries::default();

        match self.filter_mode {
            FilterMode::Include => {
                //
                // Router State: INCLUDE (A)
                // Report Received: TO_IN (B)
                // New Router State: INCLUDE (A + B)
                // Actions: (B) = GMI
                //          Send Q(G, A - B)
                //
                let a = self.forward_sources.addresses();
                queries.source_query =
                    a.difference(sources).copied().collect();
            }
            FilterMode::Exclude => {
                //
                // Router State: EXCLUDE (X, Y)
                // Report Received: TO_IN (A)
                // New Router State: EXCLUDE (X + A, Y - A)
                // Actions: (A) = GMI
                //          Send Q(G, X - A)
                //          Send Q(G)
                //
                let x = self.forward_sources.addresses();
                queries.source_query =
                    x.difference(sources).copied().collect();
                queries.group_query = true;
            }
        }

        self.add_and_refresh_sources(instance, iface, sources);

        self.calculate_forwarding_changes(
            instance,
            iface,
            old_mode,
            &old_forward,
            &old_dont_forward,
        );

        queries
    }

    // Process CHANGE_TO_EXCLUDE_MODE report.
    pub(crate) fn process_change_to_exclude_mode(
        &mut self,
        instance: &mut InstanceUpView<'_, V>,
        iface: &InterfaceView<'_, V>,
        sources: &BTreeSet<V::IpAddr>,
        reporter: V::IpAddr,
    ) -> PendingQueries<V> {
        let old_mode = self.filter_mode;
        let old_forward = self.forward_sources.addresses();
        let old_dont_forward = self.dont_forward_sources.addresses();

        self.last_reported_host = Some(reporter);
        let gmi = iface.config.group_membership_interval();
        let mut queries = PendingQueries::default();

        match self.filter_mode {
            FilterMode::Include => {
                //
                // Router State: INCLUDE (A)
                // Report Received: TO_EX (B)
                // New Router State: EXCLUDE (A * B, B - A)
                // Actions: (B - A) = 0
                //          Delete (A - B)
                //          Send Q(G, A * B)
                //          Group Timer = GMI
                //
                let a = self.forward_sources.addresses();
                let b_minus_a: BTreeSet<_> =
                    sources.difference(&a).copied().collect();

                self.set_filter_mode(FilterMode::Exclude);
                self.forward_sources.retain_sources(sources);
                self.dont_forward_sources.insert_new_sources(&b_minus_a);
                self.set_group_timer(instance, iface, gmi);

                queries.source_query = self.forward_sources.addresses();
            }
            FilterMode::Exclude => {
                //
                // Router State: EXCLUDE (X, Y)
                // Report Received: TO_EX (A)
                // New Router State: EXCLUDE (A - Y, Y * A)
                // Actions: (A - X - Y) = Group Timer
                //          Delete (X - A)
                //          Delete (Y - A)
                //          Send Q(G, A - Y)
                //          Group Timer = GMI
                //
                let fresh = self.sources_not_present(sources);
                let group_timer_remaining = self.timeout();

                self.forward_sources.retain_sources(sources);
                self.dont_forward_sources.retain_sources(sources);
                self.forward_sources.insert_new_sources(&fresh);
                {
                    let args = SourceTimerArgs {
                        ifindex: iface.ifindex,
                        group: self.group,
                        source_timeoutp: &instance
                            .tx
                            .protocol_input
                            .source_timeout,
                    };
                    self.forward_sources.set_source_timer(
                        &fresh,
                        group_timer_remaining,
                        &args,
                    );
                }
                self.set_group_timer(instance, iface, gmi);

                queries.source_query = self.forward_sources.addresses();
            }
        }

        self.calculate_forwarding_changes(
            instance,
            iface,
            old_mode,
            &old_forward,
            &old_dont_forward,
        );

        queries
    }

    // Process BLOCK_OLD_SOURCES report.
    pub(crate) fn process_block_old_sources(
        &mut self,
        instance: &mut InstanceUpView<'_, V>,
        iface: &InterfaceView<'_, V>,
        sources: &BTreeSet<V::IpAddr>,
        reporter: V::IpAddr,
    ) -> PendingQueries<V> {
        let old_mode = self.filter_mode;
        let old_forward = self.forward_sources.addresses();
        let old_dont_forward = self.dont_forward_sources.addresses();

        self.last_reported_host = Some(reporter);
        let mut queries = PendingQueries::default();

        match self.filter_mode {
            FilterMode::Include => {
                //
                // Router State: INCLUDE (A)
                // Report Received: BLOCK (B)
                // New Router State: INCLUDE (A)
                // Actions: Send Q(G, A * B)
                //
                let a = self.forward_sources.addresses();
                queries.source_query =
                    a.intersection(sources).copied().collect();
            }
            FilterMode::Exclude => {
                //
                // Router State: EXCLUDE (X, Y)
                // Report Received: BLOCK (A)
                // New Router State: EXCLUDE (X + (A - Y), Y)
                // Actions: (A - X - Y) = Group Timer
                //          Send Q(G, A - Y)
                //
                let y = self.dont_forward_sources.addresses();
                let fresh = self.sources_not_present(sources);
                let group_timer_remaining = self.timeout();

                self.forward_sources.insert_new_sources(&fresh);
                {
                    let args = SourceTimerArgs {
                        ifindex: iface.ifindex,
                        group: self.group,
                        source_timeoutp: &instance
                            .tx
                            .protocol_input
                            .source_timeout,
                    };
                    self.forward_sources.set_source_timer(
                        &fresh,
                        group_timer_remaining,
                        &args,
                    );
                }

                queries.source_query =
                    sources.difference(&y).copied().collect();
            }
        }

        self.calculate_forwarding_changes(
            instance,
            iface,
            old_mode,
            &old_forward,
            &old_dont_forward,
        );

        queries
    }

    // INCLUDE (A) + (B) -> INCLUDE (A + B), (B) = GMI, and the
    // EXCLUDE-mode counterpart EXCLUDE (X + A, Y - A), (A) = GMI.
    // Shared by the IS_IN, TO_IN and ALLOW transitions.
    fn add_and_refresh_sources(
        &mut self,
        instance: &InstanceUpView<'_, V>,
        iface: &InterfaceView<'_, V>,
        sources: &BTreeSet<V::IpAddr>,
    ) {
        let gmi = iface.config.group_membership_interval();

        if self.filter_mode == FilterMode::Exclude {
            // Transfer (Y * A) from (Y) to (X), preserving timers.
            let transferred = self.dont_forward_sources.take(sources);
            self.forward_sources.merge(transferred);
        }
        self.forward_sources.insert_new_sources(sources);

        let args = SourceTimerArgs {
            ifindex: iface.ifindex,
            group: self.group,
            source_timeoutp: &instance.tx.protocol_input.source_timeout,
        };
        self.forward_sources.set_source_timer(sources, gmi, &args);
    }

    // Returns the subset of the given sources that is in neither of
    // the two source sets.
    fn sources_not_present(
        &self,
        sources: &BTreeSet<V::IpAddr>,
    ) -> BTreeSet<V::IpAddr> {
        sources
            .iter()
            .filter(|source| {
                !self.forward_sources.contains_key(*source)
                    && !self.dont_forward_sources.contains_key(*source)
            })
            .copied()
            .collect()
    }

    // Computes the forwarding changes caused by a state transition and
    // notifies the downstream multicast routing protocols.
    fn calculate_forwarding_changes(
        &self,
        instance: &mut InstanceUpView<'_, V>,
        iface: &InterfaceView<'_, V>,
        old_mode: FilterMode,
        old_forward: &BTreeSet<V::IpAddr>,
        old_dont_forward: &BTreeSet<V::IpAddr>,
    ) {
        let new_mode = self.filter_mode;
        let new_forward = self.forward_sources.addresses();
        let new_dont_forward = self.dont_forward_sources.addresses();
        let group_itself = V::IpAddr::unspecified();

        match (old_mode, new_mode) {
            (FilterMode::Include, FilterMode::Include) => {
                debug_assert!(old_dont_forward.is_empty());
                debug_assert!(new_dont_forward.is_empty());

                // Join all new sources that are to be forwarded.
                for source in new_forward.difference(old_forward) {
                    self.notify(instance, iface, *source, MembershipAction::Join);
                }
                // Prune all old sources that were forwarded.
                for source in old_forward.difference(&new_forward) {
                    self.notify(instance, iface, *source, MembershipAction::Prune);
                }
            }
            (FilterMode::Include, FilterMode::Exclude) => {
                debug_assert!(old_dont_forward.is_empty());

                // Prune the old sources that were forwarded.
                for source in old_forward.difference(&new_forward) {
                    self.notify(instance, iface, *source, MembershipAction::Prune);
                }
                // Join the group itself.
                self.notify(instance, iface, group_itself, MembershipAction::Join);
                // Join all new sources that are to be forwarded.
                for source in new_forward.difference(old_forward) {
                    self.notify(instance, iface, *source, MembershipAction::Join);
                }
                // Prune all new sources that are not to be forwarded.
                for source in new_dont_forward.difference(old_dont_forward) {
                    self.notify(instance, iface, *source, MembershipAction::Prune);
                }
            }
            (FilterMode::Exclude, FilterMode::Include) => {
                debug_assert!(new_dont_forward.is_empty());

                // Join all old sources that were not to be forwarded.
                for source in old_dont_forward.difference(&new_dont_forward) {
                    self.notify(instance, iface, *source, MembershipAction::Join);
                }
                // Prune the group itself.
                self.notify(instance, iface, group_itself, MembershipAction::Prune);
                // Join all new sources that are to be forwarded.
                for source in new_forward.difference(old_forward) {
                    self.notify(instance, iface, *source, MembershipAction::Join);
                }
            }
            (FilterMode::Exclude, FilterMode::Exclude) => {
                // Join all new sources that are to be forwarded.
                for source in new_forward.difference(old_forward) {
                    self.notify(instance, iface, *source, MembershipAction::Join);
                }
                // Prune all old sources that were forwarded.
                for source in old_forward.difference(&new_forward) {
                    self.notify(instance, iface, *source, MembershipAction::Prune);
                }
                // Join all old sources that were not to be forwarded.
                for source in old_dont_forward.difference(&new_dont_forward) {
                    self.notify(instance, iface, *source, MembershipAction::Join);
                }
                // Prune all new sources that are not to be forwarded.
                for source in new_dont_forward.difference(old_dont_forward) {
                    self.notify(instance, iface, *source, MembershipAction::Prune);
                }
            }
        }
    }

    fn notify(
        &self,
        instance: &mut InstanceUpView<'_, V>,
        iface: &InterfaceView<'_, V>,
        source: V::IpAddr,
        action: MembershipAction,
    ) {
        join_prune_notify_routing(
            instance,
            iface.ifname,
            iface.ifindex,
            source,
            self.group,
            action,
        );
    }

    // Takes the appropriate actions for a source whose timer expired.
    pub(crate) fn source_expired(
        &mut self,
        instance: &mut InstanceUpView<'_, V>,
        iface: &InterfaceView<'_, V>,
        source: V::IpAddr,
    ) {
        Debug::<V>::SourceTimerExpiry(&self.group, &source).log();

        let Some(mut record) = self.forward_sources.remove(&source) else {
            return;
        };

        match self.filter_mode {
            FilterMode::Include => {
                self.notify(instance, iface, source, MembershipAction::Prune);
                // The record is dropped; once the forward set drains
                // the whole group record becomes unused.
            }
            FilterMode::Exclude => {
                // A PRUNE is sent twice: the first removes the
                // original JOIN for the source, the second installs
                // the prune state for it.
                self.notify(instance, iface, source, MembershipAction::Prune);
                self.notify(instance, iface, source, MembershipAction::Prune);

                // Keep the record, but move it to the "don't forward"
                // set.
                record.cancel_source_timer();
                self.dont_forward_sources.insert(source, record);
            }
        }
    }

    // Takes the appropriate actions for an expired group timer
    // (EXCLUDE mode only).
    pub(crate) fn group_timer_expired(
        &mut self,
        instance: &mut InstanceUpView<'_, V>,
        iface: &InterfaceView<'_, V>,
    ) {
        Debug::<V>::GroupTimerExpiry(&self.group).log();

        self.group_timer = None;

        if self.filter_mode == FilterMode::Include {
            return;
        }

        // Clear the state for all excluded sources.
        for source in self.dont_forward_sources.addresses() {
            self.notify(instance, iface, source, MembershipAction::Join);
        }
        self.dont_forward_sources.clear();

        // Prune the group itself.
        self.notify(
            instance,
            iface,
            V::IpAddr::unspecified(),
            MembershipAction::Prune,
        );

        if !self.forward_sources.is_empty() {
            // Transition to INCLUDE mode.
            self.set_filter_mode(FilterMode::Include);
            return;
        }

        // No sources with running source timers remain; the owning
        // group set deletes the record.
    }

    //
    // Group-Specific and Group-and-Source-Specific Query
    // retransmission (RFC 3376 Section 6.6.3, RFC 3810 Section 7.6.3).
    //

    // Schedules periodic query retransmission. An empty source set
    // schedules Group-Specific Queries, otherwise
    // Group-and-Source-Specific Queries are scheduled for the given
    // sources.
    pub(crate) fn schedule_periodic_group_query(
        &mut self,
        instance: &InstanceUpView<'_, V>,
        iface: &InterfaceView<'_, V>,
        sources: &BTreeSet<V::IpAddr>,
    ) {
        let count = iface.config.last_member_query_count().saturating_sub(1);

        // Reset the retransmission count of all "don't forward"
        // sources.
        for record in self.dont_forward_sources.values_mut() {
            record.query_retransmission_count = 0;
        }

        if iface.config.last_member_query_count() == 0 {
            return;
        }
        if iface.config.query_last_member_interval.is_zero() {
            return;
        }

        if sources.is_empty() {
            self.query_retransmission_count = count;
        } else {
            for source in sources {
                if let Some(record) = self.forward_sources.get_mut(source) {
                    record.query_retransmission_count = count;
                }
            }
        }

        if self.group_query_timer.is_none() {
            self.group_query_timer = Some(tasks::group_query_timer(
                iface.ifindex,
                self.group,
                iface.config.query_last_member_interval,
                &instance.tx.protocol_input.group_query_interval,
            ));
        }
    }

    // Transmits the next round of Group-Specific and
    // Group-and-Source-Specific Queries. Returns whether another round
    // remains.
    pub(crate) fn group_query_timeout(
        &mut self,
        instance: &mut InstanceUpView<'_, V>,
        iface: &InterfaceView<'_, V>,
    ) -> bool {
        // Don't send Group-Specific or Group-and-Source-Specific
        // Queries for groups running in IGMPv1 mode.
        if self.is_v1_mode(iface) {
            return false;
        }

        let max_resp_time = iface.config.query_last_member_interval;
        let last_member_query_time = iface.config.last_member_query_time();

        // Send the Group-Specific Query.
        let mut do_send_group_query = false;
        if self.query_retransmission_count > 0 {
            self.query_retransmission_count -= 1;
            do_send_group_query = true;

            // The "Suppress Router-Side Processing" bit is set iff the
            // group timer is larger than the Last Member Query Time.
            let s_flag = self.timeout() > last_member_query_time;
            output::send_query(
                instance,
                iface,
                self.group,
                &BTreeSet::new(),
                max_resp_time,
                s_flag,
            );
        }

        // Partition the sources to be queried by their
        // "Suppress Router-Side Processing" bit.
        let mut sources_with_s_flag = BTreeSet::new();
        let mut sources_without_s_flag = BTreeSet::new();
        for record in self.forward_sources.values_mut() {
            if record.query_retransmission_count == 0 {
                continue;
            }
            record.query_retransmission_count -= 1;
            if record.timeout() > last_member_query_time {
                sources_with_s_flag.insert(record.source);
            } else {
                sources_without_s_flag.insert(record.source);
            }
        }

        // Send the Group-and-Source-Specific Queries. When a
        // Group-Specific Query was sent this round, the queries with
        // the "Suppress Router-Side Processing" bit set may be
        // suppressed (RFC 3376 Section 6.6.3.2).
        if !sources_with_s_flag.is_empty() && !do_send_group_query {
            output::send_query(
                instance,
                iface,
                self.group,
                &sources_with_s_flag,
                max_resp_time,
                true,
            );
        }
        if !sources_without_s_flag.is_empty() {
            output::send_query(
                instance,
                iface,
                self.group,
                &sources_without_s_flag,
                max_resp_time,
                false,
            );
        }

        do_send_group_query
            || !sources_with_s_flag.is_empty()
            || !sources_without_s_flag.is_empty()
    }

    //
    // Older-version host compatibility
    // (RFC 3376 Section 7.3.2, RFC 3810 Section 8.3.2).
    //

    // Records that an older-version membership report was received for
    // this group.
    pub(crate) fn received_older_membership_report(
        &mut self,
        instance: &InstanceUpView<'_, V>,
        iface: &InterfaceView<'_, V>,
        version: u8,
    ) {
        let timeout = iface.config.older_version_host_present_interval();

        match V::PROTOCOL {
            Protocol::IGMP => match version {
                1 => {
                    self.v1_host_present_timer =
                        Some(tasks::host_present_timer(
                            iface.ifindex,
                            self.group,
                            OlderHostTimer::V1,
                            timeout,
                            &instance.tx.protocol_input.host_present_timeout,
                        ));
                }
                2 => {
                    self.v2_or_mldv1_host_present_timer =
                        Some(tasks::host_present_timer(
                            iface.ifindex,
                            self.group,
                            OlderHostTimer::V2OrMldv1,
                            timeout,
                            &instance.tx.protocol_input.host_present_timeout,
                        ));
                }
                _ => (),
            },
            Protocol::MLD => {
                if version == 1 {
                    self.v2_or_mldv1_host_present_timer =
                        Some(tasks::host_present_timer(
                            iface.ifindex,
                            self.group,
                            OlderHostTimer::V2OrMldv1,
                            timeout,
                            &instance.tx.protocol_input.host_present_timeout,
                        ));
                }
            }
        }
    }

    // Tests if the group is running in IGMPv1 compatibility mode.
    pub fn is_v1_mode(&self, iface: &InterfaceView<'_, V>) -> bool {
        V::PROTOCOL == Protocol::IGMP
            && (iface.config.version == 1
                || self.v1_host_present_timer.is_some())
    }

    // Tests if the group is running in IGMPv2 or MLDv1 compatibility
    // mode.
    pub fn is_v2_or_mldv1_mode(&self, iface: &InterfaceView<'_, V>) -> bool {
        match V::PROTOCOL {
            Protocol::IGMP => {
                !self.is_v1_mode(iface)
                    && (iface.config.version == 2
                        || self.v2_or_mldv1_host_present_timer.is_some())
            }
            Protocol::MLD => {
                iface.config.version == 1
                    || self.v2_or_mldv1_host_present_timer.is_some()
            }
        }
    }

    // Protocol version the group effectively runs at.
    pub fn effective_version(&self, iface: &InterfaceView<'_, V>) -> u8 {
        if self.is_v1_mode(iface) {
            return 1;
        }
        if self.is_v2_or_mldv1_mode(iface) {
            return match V::PROTOCOL {
                Protocol::IGMP => 2,
                Protocol::MLD => 1,
            };
        }
        V::VERSION_MAX
    }
}

// ===== impl GroupSet =====

impl<V> GroupSet<V>
where
    V: Version,
{
    pub(crate) fn new() -> GroupSet<V> {
        GroupSet(BTreeMap::new())
    }

    fn get_or_create(&mut self, group: V::IpAddr) -> &mut GroupRecord<V> {
        self.0
            .entry(group)
            .or_insert_with(|| GroupRecord::new(group))
    }

    // Deletes the record if it became unused.
    fn remove_if_unused(&mut self, group: V::IpAddr) {
        if let Some(record) = self.0.get(&group) {
            if record.is_unused() {
                Debug::<V>::GroupDelete(&group).log();
                self.0.remove(&group);
            }
        }
    }

    fn send_pending_queries(
        instance: &mut InstanceUpView<'_, V>,
        iface: &InterfaceView<'_, V>,
        record: &mut GroupRecord<V>,
        queries: PendingQueries<V>,
    ) {
        if queries.group_query {
            output::group_specific_query(instance, iface, record);
        }
        if !queries.source_query.is_empty() {
            output::group_source_specific_query(
                instance,
                iface,
                record,
                &queries.source_query,
            );
        }
    }

    // Process MODE_IS_INCLUDE report.
    pub fn process_mode_is_include(
        &mut self,
        instance: &mut InstanceUpView<'_, V>,
        iface: &InterfaceView<'_, V>,
        group: V::IpAddr,
        sources: &BTreeSet<V::IpAddr>,
        reporter: V::IpAddr,
    ) {
        let record = self.get_or_create(group);
        let queries =
            record.process_mode_is_include(instance, iface, sources, reporter);
        Self::send_pending_queries(instance, iface, record, queries);
        self.remove_if_unused(group);
    }

    // Process MODE_IS_EXCLUDE report.
    pub fn process_mode_is_exclude(
        &mut self,
        instance: &mut InstanceUpView<'_, V>,
        iface: &InterfaceView<'_, V>,
        group: V::IpAddr,
        sources: &BTreeSet<V::IpAddr>,
        reporter: V::IpAddr,
    ) {
        let record = self.get_or_create(group);
        let queries = if record.is_v1_mode(iface)
            || record.is_v2_or_mldv1_mode(iface)
        {
            // Below source-list-capable compatibility mode the report
            // acts as a plain mode change without sources.
            record.process_change_to_exclude_mode(
                instance,
                iface,
                &BTreeSet::new(),
                reporter,
            )
        } else {
            record.process_mode_is_exclude(instance, iface, sources, reporter)
        };
        Self::send_pending_queries(instance, iface, record, queries);
        self.remove_if_unused(group);
    }

    // Process CHANGE_TO_INCLUDE_MODE report.
    pub fn process_change_to_include_mode(
        &mut self,
        instance: &mut InstanceUpView<'_, V>,
        iface: &InterfaceView<'_, V>,
        group: V::IpAddr,
        sources: &BTreeSet<V::IpAddr>,
        reporter: V::IpAddr,
    ) {
        let record = self.get_or_create(group);
        if !record.is_v1_mode(iface) {
            // CHANGE_TO_INCLUDE_MODE messages are ignored when in
            // IGMPv1 mode.
            let queries = record.process_change_to_include_mode(
                instance, iface, sources, reporter,
            );
            Self::send_pending_queries(instance, iface, record, queries);
        }
        self.remove_if_unused(group);
    }

    // Process CHANGE_TO_EXCLUDE_MODE report.
    pub fn process_change_to_exclude_mode(
        &mut self,
        instance: &mut InstanceUpView<'_, V>,
        iface: &InterfaceView<'_, V>,
        group: V::IpAddr,
        sources: &BTreeSet<V::IpAddr>,
        reporter: V::IpAddr,
    ) {
        let record = self.get_or_create(group);
        let queries = if record.is_v1_mode(iface)
            || record.is_v2_or_mldv1_mode(iface)
        {
            // The source list is ignored when in IGMPv1, IGMPv2, or
            // MLDv1 mode.
            record.process_change_to_exclude_mode(
                instance,
                iface,
                &BTreeSet::new(),
                reporter,
            )
        } else {
            record.process_change_to_exclude_mode(
                instance, iface, sources, reporter,
            )
        };
        Self::send_pending_queries(instance, iface, record, queries);
        self.remove_if_unused(group);
    }

    // Process ALLOW_NEW_SOURCES report.
    pub fn process_allow_new_sources(
        &mut self,
        instance: &mut InstanceUpView<'_, V>,
        iface: &InterfaceView<'_, V>,
        group: V::IpAddr,
        sources: &BTreeSet<V::IpAddr>,
        reporter: V::IpAddr,
    ) {
        let record = self.get_or_create(group);
        let queries = record
            .process_allow_new_sources(instance, iface, sources, reporter);
        Self::send_pending_queries(instance, iface, record, queries);
        self.remove_if_unused(group);
    }

    // Process BLOCK_OLD_SOURCES report.
    pub fn process_block_old_sources(
        &mut self,
        instance: &mut InstanceUpView<'_, V>,
        iface: &InterfaceView<'_, V>,
        group: V::IpAddr,
        sources: &BTreeSet<V::IpAddr>,
        reporter: V::IpAddr,
    ) {
        let record = self.get_or_create(group);
        if !record.is_v1_mode(iface) && !record.is_v2_or_mldv1_mode(iface) {
            // BLOCK_OLD_SOURCES messages are ignored when in IGMPv1,
            // IGMPv2, or MLDv1 mode.
            let queries = record
                .process_block_old_sources(instance, iface, sources, reporter);
            Self::send_pending_queries(instance, iface, record, queries);
        }
        self.remove_if_unused(group);
    }

    // Records that an older-version membership report was received.
    pub fn record_older_report(
        &mut self,
        instance: &InstanceUpView<'_, V>,
        iface: &InterfaceView<'_, V>,
        group: V::IpAddr,
        version: u8,
    ) {
        let record = self.get_or_create(group);
        record.received_older_membership_report(instance, iface, version);
    }

    // Lowers the group timer of the given group.
    pub fn lower_group_timer(&mut self, group: V::IpAddr, timeout: Duration) {
        if let Some(record) = self.0.get_mut(&group) {
            record.lower_group_timer(timeout);
        }
    }

    // Lowers the source timers of the given sources within the given
    // group.
    pub fn lower_source_timer(
        &mut self,
        instance: &InstanceUpView<'_, V>,
        iface: &InterfaceView<'_, V>,
        group: V::IpAddr,
        sources: &BTreeSet<V::IpAddr>,
        timeout: Duration,
    ) {
        if let Some(record) = self.0.get_mut(&group) {
            record.lower_source_timer(instance, iface, sources, timeout);
        }
    }

    // Handles the expiry of a group timer.
    pub fn process_group_timer_expiry(
        &mut self,
        instance: &mut InstanceUpView<'_, V>,
        iface: &InterfaceView<'_, V>,
        group: V::IpAddr,
    ) {
        if let Some(record) = self.0.get_mut(&group) {
            record.group_timer_expired(instance, iface);
        }
        self.remove_if_unused(group);
    }

    // Handles the expiry of a source timer.
    pub fn process_source_timer_expiry(
        &mut self,
        instance: &mut InstanceUpView<'_, V>,
        iface: &InterfaceView<'_, V>,
        group: V::IpAddr,
        source: V::IpAddr,
    ) {
        if let Some(record) = self.0.get_mut(&group) {
            record.source_expired(instance, iface, source);
        }
        self.remove_if_unused(group);
    }

    // Handles a periodic query retransmission tick.
    pub fn process_group_query_interval(
        &mut self,
        instance: &mut InstanceUpView<'_, V>,
        iface: &InterfaceView<'_, V>,
        group: V::IpAddr,
    ) {
        if let Some(record) = self.0.get_mut(&group) {
            if !record.group_query_timeout(instance, iface) {
                record.group_query_timer = None;
            }
        }
    }

    // Handles the expiry of an older-version-host-present timer.
    pub fn process_host_present_timeout(
        &mut self,
        group: V::IpAddr,
        timer: OlderHostTimer,
    ) {
        if let Some(record) = self.0.get_mut(&group) {
            match timer {
                OlderHostTimer::V1 => {
                    record.v1_host_present_timer = None;
                }
                OlderHostTimer::V2OrMldv1 => {
                    record.v2_or_mldv1_host_present_timer = None;
                }
            }
        }
    }

    // Withdraws all state learned on the owning interface, notifying
    // the downstream protocols.
    pub(crate) fn flush(
        &mut self,
        instance: &mut InstanceUpView<'_, V>,
        iface: &InterfaceView<'_, V>,
    ) {
        for (group, record) in std::mem::take(&mut self.0) {
            for source in record.forward_sources.addresses() {
                join_prune_notify_routing(
                    instance,
                    iface.ifname,
                    iface.ifindex,
                    source,
                    group,
                    MembershipAction::Prune,
                );
            }
            if record.filter_mode == FilterMode::Exclude {
                for source in record.dont_forward_sources.addresses() {
                    join_prune_notify_routing(
                        instance,
                        iface.ifname,
                        iface.ifindex,
                        source,
                        group,
                        MembershipAction::Join,
                    );
                }
                join_prune_notify_routing(
                    instance,
                    iface.ifname,
                    iface.ifindex,
                    V::IpAddr::unspecified(),
                    group,
                    MembershipAction::Prune,
                );
            }
            Debug::<V>::GroupDelete(&group).log();
        }
    }
}

impl<V> Deref for GroupSet<V>
where
    V: Version,
{
    type Target = BTreeMap<V::IpAddr, GroupRecord<V>>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<V> DerefMut for GroupSet<V>
where
    V: Version,
{
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

// ===== impl FilterMode =====

impl std::fmt::Display for FilterMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilterMode::Include => write!(f, "include"),
            FilterMode::Exclude => write!(f, "exclude"),
        }
    }
}
