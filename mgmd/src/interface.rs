//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use generational_arena::{Arena, Index};
use mgmd_utils::ip::{IpAddrKind, IpNetworkKind};
use mgmd_utils::protocol::Protocol;
use mgmd_utils::southbound::InterfaceFlags;
use mgmd_utils::task::{IntervalTask, TimeoutTask};

use crate::debug::{Debug, InterfaceInactiveReason};
use crate::group::GroupSet;
use crate::instance::InstanceUpView;
use crate::northbound::configuration::InterfaceCfg;
use crate::rpc::{self, FeaTask};
use crate::version::Version;
use crate::{output, tasks};

pub type InterfaceIndex = Index;

#[derive(Debug)]
pub struct Interface<V: Version> {
    pub name: String,
    pub system: InterfaceSys<V>,
    pub config: InterfaceCfg,
    pub state: InterfaceState<V>,
}

// Interface data mirrored from the system interface tree.
#[derive(Debug)]
pub struct InterfaceSys<V: Version> {
    pub flags: InterfaceFlags,
    pub ifindex: Option<u32>,
    pub mtu: Option<u32>,
    pub addr_list: BTreeSet<V::IpNetwork>,
    // Peer addresses of point-to-point links.
    pub peer_addr_list: BTreeSet<V::IpAddr>,
}

#[derive(Debug)]
pub struct InterfaceState<V: Version> {
    // Whether the membership protocol is running on the interface.
    pub active: bool,
    // Address used as the source of transmitted queries and as the
    // querier-election identity.
    pub primary_addr: Option<V::IpAddr>,
    // Address of the elected querier (our own primary address while we
    // act as querier).
    pub querier_addr: Option<V::IpAddr>,
    // Periodic General Query transmission (querier role). Exactly one
    // of this timer and the Other Querier Present timer is running
    // while the interface is up.
    pub general_query_timer: Option<IntervalTask>,
    // General Queries left to send at the faster startup cadence.
    pub startup_query_count: u8,
    // Other Querier Present timer (non-querier role).
    pub other_querier_present_timer: Option<TimeoutTask>,
    // Group membership records.
    pub groups: GroupSet<V>,
    // Message statistics.
    pub statistics: InterfaceStatistics,
}

// Inbound statistic counters.
#[derive(Debug, Default)]
pub struct InterfaceStatistics {
    pub discontinuity_time: Option<DateTime<Utc>>,
    pub queries_rcvd: u32,
    pub reports_rcvd: u32,
    pub leaves_rcvd: u32,
    pub bad_packets_rcvd: u32,
}

// Borrowed interface data handed down to the group records, shaped so
// that the group set can be borrowed mutably alongside it.
#[derive(Debug)]
pub struct InterfaceView<'a, V: Version> {
    pub ifindex: u32,
    pub ifname: &'a str,
    pub primary_addr: V::IpAddr,
    pub config: &'a InterfaceCfg,
}

#[derive(Debug)]
pub struct Interfaces<V: Version> {
    pub arena: Arena<Interface<V>>,
    name_tree: BTreeMap<String, InterfaceIndex>,
    ifindex_tree: HashMap<u32, InterfaceIndex>,
}

// ===== impl Interface =====

impl<V> Interface<V>
where
    V: Version,
{
    fn new(name: String) -> Interface<V> {
        Debug::<V>::InterfaceCreate(&name).log();

        Interface {
            name,
            system: InterfaceSys::default(),
            config: InterfaceCfg::new(V::VERSION_MAX),
            state: InterfaceState::default(),
        }
    }

    // Checks if the interface needs to be started or stopped in
    // response to a northbound or southbound event.
    pub(crate) fn update(&mut self, instance: &mut InstanceUpView<'_, V>) {
        match self.is_ready() {
            Ok(()) if !self.state.active => {
                self.start(instance);
            }
            Err(reason) if self.state.active => {
                self.stop(instance, reason);
            }
            _ => (),
        }
    }

    // Returns whether the interface is ready for membership tracking.
    fn is_ready(&self) -> Result<(), InterfaceInactiveReason> {
        if !self.config.enabled {
            return Err(InterfaceInactiveReason::AdminDown);
        }

        if !self.system.flags.contains(InterfaceFlags::OPERATIVE) {
            return Err(InterfaceInactiveReason::OperationalDown);
        }

        if !self.system.flags.contains(InterfaceFlags::MULTICAST) {
            return Err(InterfaceInactiveReason::MulticastNotSupported);
        }

        if self.system.ifindex.is_none() {
            return Err(InterfaceInactiveReason::MissingIfindex);
        }

        if self.state.primary_addr.is_none() {
            return Err(InterfaceInactiveReason::MissingIpAddress);
        }

        Ok(())
    }

    // Starts membership tracking on this interface.
    fn start(&mut self, instance: &mut InstanceUpView<'_, V>) {
        Debug::<V>::InterfaceStart(&self.name).log();

        let ifindex = self.system.ifindex.unwrap();
        let primary_addr = self.state.primary_addr.unwrap();

        // Open the protocol receiver channel and join the well-known
        // router groups through the FEA.
        instance.state.incr_startup_requests();
        rpc::fea_task_push(
            instance,
            FeaTask::RegisterUnregisterReceiver {
                ifname: self.name.clone(),
                ifindex,
                is_register: true,
            },
        );
        instance.state.incr_startup_requests();
        rpc::fea_task_push(
            instance,
            FeaTask::JoinLeaveMulticastGroup {
                ifname: self.name.clone(),
                ifindex,
                group: V::all_routers(),
                is_join: true,
            },
        );
        if V::PROTOCOL == Protocol::IGMP {
            instance.state.incr_startup_requests();
            rpc::fea_task_push(
                instance,
                FeaTask::JoinLeaveMulticastGroup {
                    ifname: self.name.clone(),
                    ifindex,
                    group: V::source_list_routers(),
                    is_join: true,
                },
            );
        }

        // Start as querier: send one General Query right away, then
        // keep querying at the startup cadence until the startup burst
        // is over.
        Debug::<V>::QuerierElect(&self.name, &primary_addr).log();
        self.state.querier_addr = Some(primary_addr);
        {
            let view = InterfaceView {
                ifindex,
                ifname: &self.name,
                primary_addr,
                config: &self.config,
            };
            output::general_query(instance, &view);
        }
        self.state.startup_query_count =
            self.config.startup_query_count().saturating_sub(1);
        let interval = if self.state.startup_query_count > 0 {
            self.config.startup_query_interval()
        } else {
            self.config.query_interval
        };
        self.state.general_query_timer = Some(tasks::general_query_interval(
            ifindex,
            interval,
            &instance.tx.protocol_input.general_query_interval,
        ));

        self.state.active = true;
    }

    // Stops membership tracking on this interface.
    pub(crate) fn stop(
        &mut self,
        instance: &mut InstanceUpView<'_, V>,
        reason: InterfaceInactiveReason,
    ) {
        if !self.state.active {
            return;
        }

        Debug::<V>::InterfaceStop(&self.name, reason).log();

        let ifindex = self.system.ifindex.unwrap();

        // Withdraw all learned membership state.
        {
            let view = InterfaceView {
                ifindex,
                ifname: &self.name,
                primary_addr: self
                    .state
                    .primary_addr
                    .unwrap_or_else(V::IpAddr::unspecified),
                config: &self.config,
            };
            self.state.groups.flush(instance, &view);
        }

        // Stop querier duties.
        self.state.general_query_timer = None;
        self.state.other_querier_present_timer = None;
        self.state.querier_addr = None;
        self.state.startup_query_count = 0;

        // Leave the well-known router groups and close the protocol
        // receiver channel.
        if V::PROTOCOL == Protocol::IGMP {
            instance.state.incr_shutdown_requests();
            rpc::fea_task_push(
                instance,
                FeaTask::JoinLeaveMulticastGroup {
                    ifname: self.name.clone(),
                    ifindex,
                    group: V::source_list_routers(),
                    is_join: false,
                },
            );
        }
        instance.state.incr_shutdown_requests();
        rpc::fea_task_push(
            instance,
            FeaTask::JoinLeaveMulticastGroup {
                ifname: self.name.clone(),
                ifindex,
                group: V::all_routers(),
                is_join: false,
            },
        );
        instance.state.incr_shutdown_requests();
        rpc::fea_task_push(
            instance,
            FeaTask::RegisterUnregisterReceiver {
                ifname: self.name.clone(),
                ifindex,
                is_register: false,
            },
        );

        self.state.active = false;
    }

    // Recomputes the primary address after an address change.
    pub(crate) fn update_primary_addr(&mut self) {
        self.state.primary_addr =
            self.system.addr_list.iter().map(|addr| addr.ip()).min();
    }

    // Tests whether we are the querier elected on the attached link.
    pub fn is_querier(&self) -> bool {
        self.state.general_query_timer.is_some()
    }

    // Tests whether the given address is directly connected to this
    // interface. On point-to-point links the peer address also
    // matches.
    pub fn is_directly_connected(&self, addr: V::IpAddr) -> bool {
        if !self.state.active {
            return false;
        }

        self.system.addr_list.iter().any(|local| local.contains(addr))
            || self.system.peer_addr_list.contains(&addr)
    }
}

// ===== impl InterfaceSys =====

impl<V> Default for InterfaceSys<V>
where
    V: Version,
{
    fn default() -> InterfaceSys<V> {
        InterfaceSys {
            flags: Default::default(),
            ifindex: None,
            mtu: None,
            addr_list: Default::default(),
            peer_addr_list: Default::default(),
        }
    }
}

// ===== impl InterfaceState =====

impl<V> Default for InterfaceState<V>
where
    V: Version,
{
    fn default() -> InterfaceState<V> {
        InterfaceState {
            active: false,
            primary_addr: None,
            querier_addr: None,
            general_query_timer: None,
            startup_query_count: 0,
            other_querier_present_timer: None,
            groups: GroupSet::new(),
            statistics: Default::default(),
        }
    }
}

// ===== impl InterfaceStatistics =====

impl InterfaceStatistics {
    pub(crate) fn update_discontinuity_time(&mut self) {
        self.discontinuity_time = Some(Utc::now());
    }
}

// ===== impl Interfaces =====

impl<V> Interfaces<V>
where
    V: Version,
{
    pub(crate) fn add(
        &mut self,
        ifname: &str,
    ) -> (InterfaceIndex, &mut Interface<V>) {
        // Check for existing entry first.
        if let Some(iface_idx) = self.name_tree.get(ifname).copied() {
            let iface = &mut self.arena[iface_idx];
            return (iface_idx, iface);
        }

        // Create and insert interface into the arena.
        let iface = Interface::new(ifname.to_owned());
        let iface_idx = self.arena.insert(iface);

        // Link interface to the lookup collections.
        let iface = &mut self.arena[iface_idx];
        self.name_tree.insert(iface.name.clone(), iface_idx);

        (iface_idx, iface)
    }

    pub(crate) fn delete(&mut self, iface_idx: InterfaceIndex) {
        let iface = &mut self.arena[iface_idx];

        Debug::<V>::InterfaceDelete(&iface.name).log();

        // Unlink interface from the lookup collections.
        self.name_tree.remove(&iface.name);
        if let Some(ifindex) = iface.system.ifindex {
            self.ifindex_tree.remove(&ifindex);
        }

        // Remove interface from the arena.
        self.arena.remove(iface_idx);
    }

    pub(crate) fn update_ifindex(
        &mut self,
        ifname: &str,
        ifindex: Option<u32>,
    ) -> Option<(InterfaceIndex, &mut Interface<V>)> {
        let iface_idx = self.name_tree.get(ifname).copied()?;
        let iface = &mut self.arena[iface_idx];

        // Update interface ifindex.
        if let Some(ifindex) = iface.system.ifindex {
            self.ifindex_tree.remove(&ifindex);
        }
        iface.system.ifindex = ifindex;
        if let Some(ifindex) = ifindex {
            self.ifindex_tree.insert(ifindex, iface_idx);
        }

        Some((iface_idx, iface))
    }

    // Returns a reference to the interface corresponding to the given
    // name.
    pub fn get_by_name(
        &self,
        ifname: &str,
    ) -> Option<(InterfaceIndex, &Interface<V>)> {
        self.name_tree
            .get(ifname)
            .copied()
            .map(|iface_idx| (iface_idx, &self.arena[iface_idx]))
    }

    // Returns a mutable reference to the interface corresponding to
    // the given name.
    pub fn get_mut_by_name(
        &mut self,
        ifname: &str,
    ) -> Option<(InterfaceIndex, &mut Interface<V>)> {
        self.name_tree
            .get(ifname)
            .copied()
            .map(move |iface_idx| (iface_idx, &mut self.arena[iface_idx]))
    }

    // Returns a reference to the interface corresponding to the given
    // ifindex.
    pub fn get_by_ifindex(
        &self,
        ifindex: u32,
    ) -> Option<(InterfaceIndex, &Interface<V>)> {
        self.ifindex_tree
            .get(&ifindex)
            .copied()
            .map(|iface_idx| (iface_idx, &self.arena[iface_idx]))
    }

    // Returns a mutable reference to the interface corresponding to
    // the given ifindex.
    pub fn get_mut_by_ifindex(
        &mut self,
        ifindex: u32,
    ) -> Option<(InterfaceIndex, &mut Interface<V>)> {
        self.ifindex_tree
            .get(&ifindex)
            .copied()
            .map(move |iface_idx| (iface_idx, &mut self.arena[iface_idx]))
    }

    // Returns an iterator visiting all interfaces.
    //
    // Interfaces are ordered by their names.
    pub fn iter(&self) -> impl Iterator<Item = &'_ Interface<V>> + '_ {
        self.name_tree
            .values()
            .map(|iface_idx| &self.arena[*iface_idx])
    }

    // Returns an iterator visiting all interfaces with mutable
    // references.
    //
    // Order of iteration is not defined.
    pub fn iter_mut(
        &mut self,
    ) -> impl Iterator<Item = &'_ mut Interface<V>> + '_ {
        self.arena.iter_mut().map(|(_, iface)| iface)
    }
}

impl<V> Default for Interfaces<V>
where
    V: Version,
{
    fn default() -> Interfaces<V> {
        Interfaces {
            arena: Arena::new(),
            name_tree: Default::default(),
            ifindex_tree: Default::default(),
        }
    }
}

impl<V> std::ops::Index<InterfaceIndex> for Interfaces<V>
where
    V: Version,
{
    type Output = Interface<V>;

    fn index(&self, index: InterfaceIndex) -> &Self::Output {
        &self.arena[index]
    }
}

impl<V> std::ops::IndexMut<InterfaceIndex> for Interfaces<V>
where
    V: Version,
{
    fn index_mut(&mut self, index: InterfaceIndex) -> &mut Self::Output {
        &mut self.arena[index]
    }
}
