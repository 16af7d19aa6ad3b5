//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use derive_new::new;
use mgmd_utils::bus::{
    BusChannelsTx, BusMsg, BusReceiver, MembershipAction, MembershipSender,
};
use tokio::sync::mpsc;
use tokio::sync::mpsc::{Receiver, Sender};

use crate::debug::{Debug, InstanceInactiveReason, InterfaceInactiveReason};
use crate::interface::Interfaces;
use crate::northbound;
use crate::northbound::configuration::InstanceCfg;
use crate::rpc::{self, FeaQueue, FeaTask, MembershipQueue};
use crate::tasks::messages::ProtocolInputMsg;
use crate::tasks::messages::input::{
    FeaRetryTimeoutMsg, GeneralQueryIntervalMsg, GroupQueryIntervalMsg,
    GroupTimeoutMsg, HostPresentTimeoutMsg, MembershipRetryTimeoutMsg,
    OtherQuerierTimeoutMsg, SourceTimeoutMsg,
};
use crate::events;
use crate::version::Version;

#[derive(Debug)]
pub struct Instance<V: Version> {
    // Instance name.
    pub name: String,
    // Instance configuration data.
    pub config: InstanceCfg,
    // Instance state data.
    pub state: Option<InstanceState<V>>,
    // Instance interfaces.
    pub interfaces: Interfaces<V>,
    // Instance Tx channels.
    pub tx: InstanceChannelsTx<V>,
}

#[derive(Debug)]
pub struct InstanceState<V: Version> {
    // Startup/shutdown progress.
    pub status: InstanceStatus,
    pub startup_requests: u32,
    pub shutdown_requests: u32,
    // Whether the interface mirror delivered its initial snapshot.
    pub mirror_running: bool,
    // Liveness and registration state of the external services.
    pub services: ServiceState,
    // FEA request queue.
    pub fea: FeaQueue<V>,
    // Membership notification queue.
    pub membership: MembershipQueue<V>,
    // Downstream protocol subscribers: per-module notification
    // channels and (module, ifindex) subscriptions.
    pub subscribers: BTreeMap<String, MembershipSender>,
    pub subscriptions: BTreeSet<(String, u32)>,
    // Message statistics.
    pub statistics: Statistics,
}

// Node readiness as observed by the management plane.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InstanceStatus {
    Startup,
    Running,
    ShuttingDown,
}

#[derive(Debug)]
pub struct ServiceState {
    pub finder_alive: bool,
    pub fea_alive: bool,
    pub mfea_alive: bool,
    pub fea_registered: bool,
    pub mfea_registered: bool,
}

#[derive(Debug, Default)]
pub struct Statistics {
    pub discontinuity_time: Option<DateTime<Utc>>,
    pub msgs_rcvd: MessageCounters,
    pub msgs_sent: MessageCounters,
}

#[derive(Debug, Default)]
pub struct MessageCounters {
    pub total: u64,
    pub query: u64,
    pub report: u64,
    pub leave: u64,
}

pub struct InstanceUpView<'a, V: Version> {
    pub name: &'a str,
    pub config: &'a InstanceCfg,
    pub state: &'a mut InstanceState<V>,
    pub tx: &'a InstanceChannelsTx<V>,
}

#[derive(Clone, Debug, new)]
pub struct InstanceChannelsTx<V: Version> {
    pub bus: BusChannelsTx,
    pub protocol_input: ProtocolInputChannelsTx<V>,
}

#[derive(Clone, Debug)]
pub struct ProtocolInputChannelsTx<V: Version> {
    // General Query transmission tick.
    pub general_query_interval: Sender<GeneralQueryIntervalMsg>,
    // Other Querier Present timeout.
    pub other_querier_timeout: Sender<OtherQuerierTimeoutMsg>,
    // Group timer expiry.
    pub group_timeout: Sender<GroupTimeoutMsg<V>>,
    // Group query retransmission tick.
    pub group_query_interval: Sender<GroupQueryIntervalMsg<V>>,
    // Source timer expiry.
    pub source_timeout: Sender<SourceTimeoutMsg<V>>,
    // Older-version-host-present timeout.
    pub host_present_timeout: Sender<HostPresentTimeoutMsg<V>>,
    // FEA queue retry timeout.
    pub fea_retry_timeout: Sender<FeaRetryTimeoutMsg>,
    // Membership queue retry timeout.
    pub membership_retry_timeout: Sender<MembershipRetryTimeoutMsg>,
}

#[derive(Debug)]
pub struct ProtocolInputChannelsRx<V: Version> {
    pub general_query_interval: Receiver<GeneralQueryIntervalMsg>,
    pub other_querier_timeout: Receiver<OtherQuerierTimeoutMsg>,
    pub group_timeout: Receiver<GroupTimeoutMsg<V>>,
    pub group_query_interval: Receiver<GroupQueryIntervalMsg<V>>,
    pub source_timeout: Receiver<SourceTimeoutMsg<V>>,
    pub host_present_timeout: Receiver<HostPresentTimeoutMsg<V>>,
    pub fea_retry_timeout: Receiver<FeaRetryTimeoutMsg>,
    pub membership_retry_timeout: Receiver<MembershipRetryTimeoutMsg>,
}

// ===== impl Instance =====

impl<V> Instance<V>
where
    V: Version,
{
    pub fn new(name: String, tx: InstanceChannelsTx<V>) -> Instance<V> {
        Debug::<V>::InstanceCreate.log();

        Instance {
            name,
            config: Default::default(),
            state: None,
            interfaces: Default::default(),
            tx,
        }
    }

    pub fn init(&mut self) {
        self.update();
    }

    // Checks if the instance needs to be started or stopped in
    // response to a northbound event.
    pub(crate) fn update(&mut self) {
        if self.config.enabled {
            if !self.is_active() {
                self.start();
            }
        } else if self.is_active() {
            self.stop(InstanceInactiveReason::AdminDown);
        }
    }

    fn start(&mut self) {
        Debug::<V>::InstanceStart.log();

        self.state = Some(InstanceState::new());
        let (mut instance, interfaces) = self.as_up().unwrap();

        // Register interest in the FEA and MFEA service classes with
        // the finder, and wait for the initial interface mirror
        // snapshot.
        let fea_target = instance.config.fea_target.clone();
        let mfea_target = instance.config.mfea_target.clone();
        instance.state.incr_startup_requests();
        rpc::fea_task_push(
            &mut instance,
            FeaTask::RegisterUnregisterInterest {
                target: fea_target,
                is_register: true,
            },
        );
        instance.state.incr_startup_requests();
        rpc::fea_task_push(
            &mut instance,
            FeaTask::RegisterUnregisterInterest {
                target: mfea_target,
                is_register: true,
            },
        );
        instance.state.incr_startup_requests();

        // Try to start interfaces.
        for iface in interfaces.iter_mut() {
            iface.update(&mut instance);
        }
    }

    pub(crate) fn stop(&mut self, reason: InstanceInactiveReason) {
        if !self.is_active() {
            return;
        }

        Debug::<V>::InstanceStop(reason).log();

        let (mut instance, interfaces) = self.as_up().unwrap();
        graceful_shutdown(&mut instance, interfaces);
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state.is_some()
    }

    // Returns a view struct for the instance if it's operational.
    pub fn as_up(
        &mut self,
    ) -> Option<(InstanceUpView<'_, V>, &mut Interfaces<V>)> {
        if let Some(state) = &mut self.state {
            let instance = InstanceUpView {
                name: &self.name,
                config: &self.config,
                state,
                tx: &self.tx,
            };
            Some((instance, &mut self.interfaces))
        } else {
            None
        }
    }

    pub(crate) fn shutdown(mut self) {
        // Ensure instance is disabled before exiting.
        self.stop(InstanceInactiveReason::AdminDown);
        Debug::<V>::InstanceDelete.log();
    }

    // Processes a message received over the service bus.
    pub fn process_bus_msg(&mut self, msg: BusMsg) {
        if self.config.trace_opts.ibus {
            Debug::<V>::BusRx(&msg).log();
        }

        let mut stop_reason = None;

        if let Some((mut instance, interfaces)) = self.as_up() {
            match msg {
                BusMsg::FeaReply(msg) => {
                    rpc::process_fea_reply(&mut instance, interfaces, msg);
                }
                BusMsg::FeaRxPacket(msg) => {
                    if let Err(error) =
                        events::process_packet(&mut instance, interfaces, msg)
                    {
                        error.log();
                    }
                }
                BusMsg::FinderReply(msg) => {
                    rpc::process_finder_reply(&mut instance, interfaces, msg);
                }
                BusMsg::FinderEvent(event) => {
                    stop_reason = events::process_finder_event(
                        &mut instance,
                        interfaces,
                        event,
                    );
                }
                BusMsg::MembershipReply(msg) => {
                    rpc::process_membership_reply(
                        &mut instance,
                        interfaces,
                        msg,
                    );
                }
                BusMsg::ProtocolSubscribe(msg) => {
                    events::process_protocol_subscribe(
                        &mut instance,
                        interfaces,
                        msg,
                    );
                }
                BusMsg::ProtocolUnsubscribe(msg) => {
                    events::process_protocol_unsubscribe(&mut instance, msg);
                }
                BusMsg::InterfaceUpd(msg) => {
                    crate::southbound::process_iface_update(
                        &mut instance,
                        interfaces,
                        msg,
                    );
                }
                BusMsg::InterfaceAddressAdd(msg) => {
                    crate::southbound::process_addr_add(
                        &mut instance,
                        interfaces,
                        msg,
                    );
                }
                BusMsg::InterfaceAddressDel(msg) => {
                    crate::southbound::process_addr_del(
                        &mut instance,
                        interfaces,
                        msg,
                    );
                }
                BusMsg::InterfaceTreeComplete => {
                    crate::southbound::process_tree_complete(
                        &mut instance,
                        interfaces,
                    );
                }
            }
        }

        if let Some(reason) = stop_reason {
            self.stop(reason);
        }
    }

    // Processes a timer message from one of the child tasks.
    pub fn process_protocol_msg(&mut self, msg: ProtocolInputMsg<V>) {
        let Some((mut instance, interfaces)) = self.as_up() else {
            return;
        };

        match msg {
            ProtocolInputMsg::GeneralQueryInterval(msg) => {
                events::process_general_query_interval(
                    &mut instance,
                    interfaces,
                    msg.ifindex,
                );
            }
            ProtocolInputMsg::OtherQuerierTimeout(msg) => {
                events::process_other_querier_timeout(
                    &mut instance,
                    interfaces,
                    msg.ifindex,
                );
            }
            ProtocolInputMsg::GroupTimeout(msg) => {
                events::process_group_timeout(
                    &mut instance,
                    interfaces,
                    msg.ifindex,
                    msg.group,
                );
            }
            ProtocolInputMsg::GroupQueryInterval(msg) => {
                events::process_group_query_interval(
                    &mut instance,
                    interfaces,
                    msg.ifindex,
                    msg.group,
                );
            }
            ProtocolInputMsg::SourceTimeout(msg) => {
                events::process_source_timeout(
                    &mut instance,
                    interfaces,
                    msg.ifindex,
                    msg.group,
                    msg.source,
                );
            }
            ProtocolInputMsg::HostPresentTimeout(msg) => {
                events::process_host_present_timeout(
                    &mut instance,
                    interfaces,
                    msg.ifindex,
                    msg.group,
                    msg.timer,
                );
            }
            ProtocolInputMsg::FeaRetryTimeout(_msg) => {
                rpc::process_fea_retry(&mut instance);
            }
            ProtocolInputMsg::MembershipRetryTimeout(_msg) => {
                rpc::process_membership_retry(&mut instance);
            }
        }
    }
}

// ===== impl InstanceState =====

impl<V> InstanceState<V>
where
    V: Version,
{
    fn new() -> InstanceState<V> {
        InstanceState {
            status: InstanceStatus::Startup,
            startup_requests: 0,
            shutdown_requests: 0,
            mirror_running: false,
            services: Default::default(),
            fea: Default::default(),
            membership: Default::default(),
            subscribers: Default::default(),
            subscriptions: Default::default(),
            statistics: Default::default(),
        }
    }

    // Startup/shutdown readiness bookkeeping. Every asynchronous
    // startup (shutdown) step is bracketed by an increment and a
    // decrement; the instance reports itself running (shut down) once
    // the respective count drains to zero.
    pub(crate) fn incr_startup_requests(&mut self) {
        self.startup_requests += 1;
    }

    pub(crate) fn decr_startup_requests(&mut self) {
        self.startup_requests = self.startup_requests.saturating_sub(1);
        self.update_status();
    }

    pub(crate) fn incr_shutdown_requests(&mut self) {
        self.shutdown_requests += 1;
    }

    pub(crate) fn decr_shutdown_requests(&mut self) {
        self.shutdown_requests = self.shutdown_requests.saturating_sub(1);
        self.update_status();
    }

    pub(crate) fn update_status(&mut self) {
        match self.status {
            InstanceStatus::Startup => {
                if self.startup_requests == 0 && self.mirror_running {
                    self.status = InstanceStatus::Running;
                    Debug::<V>::InstanceStatusChange("running").log();
                }
            }
            InstanceStatus::ShuttingDown => {
                if self.shutdown_requests == 0 {
                    Debug::<V>::InstanceStatusChange("shut down").log();
                }
            }
            InstanceStatus::Running => (),
        }
    }
}

// ===== impl ServiceState =====

impl Default for ServiceState {
    fn default() -> ServiceState {
        ServiceState {
            // The bus toward the finder exists from the start;
            // a disconnect event flips this off until reconnection.
            finder_alive: true,
            fea_alive: false,
            mfea_alive: false,
            fea_registered: false,
            mfea_registered: false,
        }
    }
}

// ===== impl InstanceStatus =====

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceStatus::Startup => write!(f, "startup"),
            InstanceStatus::Running => write!(f, "running"),
            InstanceStatus::ShuttingDown => write!(f, "shutting down"),
        }
    }
}

// ===== global functions =====

// Initiates a graceful shutdown: interfaces are stopped (withdrawing
// all learned state) and interest in the service classes is
// deregistered. In-flight request completions keep being drained.
pub(crate) fn graceful_shutdown<V>(
    instance: &mut InstanceUpView<'_, V>,
    interfaces: &mut Interfaces<V>,
) where
    V: Version,
{
    if instance.state.status == InstanceStatus::ShuttingDown {
        return;
    }
    instance.state.status = InstanceStatus::ShuttingDown;

    // Stop interfaces.
    for iface in interfaces.iter_mut() {
        iface.stop(instance, InterfaceInactiveReason::InstanceDown);
    }

    // Deregister interest in the service classes.
    let fea_target = instance.config.fea_target.clone();
    let mfea_target = instance.config.mfea_target.clone();
    instance.state.incr_shutdown_requests();
    rpc::fea_task_push(
        instance,
        FeaTask::RegisterUnregisterInterest {
            target: mfea_target,
            is_register: false,
        },
    );
    instance.state.incr_shutdown_requests();
    rpc::fea_task_push(
        instance,
        FeaTask::RegisterUnregisterInterest {
            target: fea_target,
            is_register: false,
        },
    );
}

// Notifies the downstream multicast routing protocols subscribed on
// the given interface of a membership change. An unspecified source
// address denotes the group itself (ASM).
pub(crate) fn join_prune_notify_routing<V>(
    instance: &mut InstanceUpView<'_, V>,
    ifname: &str,
    ifindex: u32,
    source: V::IpAddr,
    group: V::IpAddr,
    action: MembershipAction,
) where
    V: Version,
{
    Debug::<V>::MembershipNotify(ifname, &source, &group, action).log();

    let modules: Vec<String> = instance
        .state
        .subscriptions
        .iter()
        .filter(|(_, subscribed_ifindex)| *subscribed_ifindex == ifindex)
        .map(|(module_name, _)| module_name.clone())
        .collect();
    for module_name in modules {
        rpc::membership_task_push(
            instance,
            module_name,
            ifname.to_owned(),
            ifindex,
            source,
            group,
            action,
        );
    }
}

// Creates channels for all protocol input events.
pub fn protocol_input_channels<V>()
-> (ProtocolInputChannelsTx<V>, ProtocolInputChannelsRx<V>)
where
    V: Version,
{
    let (general_query_intervalp, general_query_intervalc) = mpsc::channel(4);
    let (other_querier_timeoutp, other_querier_timeoutc) = mpsc::channel(4);
    let (group_timeoutp, group_timeoutc) = mpsc::channel(4);
    let (group_query_intervalp, group_query_intervalc) = mpsc::channel(4);
    let (source_timeoutp, source_timeoutc) = mpsc::channel(4);
    let (host_present_timeoutp, host_present_timeoutc) = mpsc::channel(4);
    let (fea_retry_timeoutp, fea_retry_timeoutc) = mpsc::channel(4);
    let (membership_retry_timeoutp, membership_retry_timeoutc) =
        mpsc::channel(4);

    let tx = ProtocolInputChannelsTx {
        general_query_interval: general_query_intervalp,
        other_querier_timeout: other_querier_timeoutp,
        group_timeout: group_timeoutp,
        group_query_interval: group_query_intervalp,
        source_timeout: source_timeoutp,
        host_present_timeout: host_present_timeoutp,
        fea_retry_timeout: fea_retry_timeoutp,
        membership_retry_timeout: membership_retry_timeoutp,
    };
    let rx = ProtocolInputChannelsRx {
        general_query_interval: general_query_intervalc,
        other_querier_timeout: other_querier_timeoutc,
        group_timeout: group_timeoutc,
        group_query_interval: group_query_intervalc,
        source_timeout: source_timeoutc,
        host_present_timeout: host_present_timeoutc,
        fea_retry_timeout: fea_retry_timeoutc,
        membership_retry_timeout: membership_retry_timeoutc,
    };

    (tx, rx)
}

// Instance event loop.
pub async fn run<V>(
    mut instance: Instance<V>,
    mut bus_rx: BusReceiver,
    mut northbound_rx: Receiver<northbound::Request>,
    mut protocol_input_rx: ProtocolInputChannelsRx<V>,
) where
    V: Version,
{
    instance.init();

    loop {
        tokio::select! {
            msg = northbound_rx.recv() => {
                match msg {
                    Some(request) => {
                        northbound::process_request(&mut instance, request);
                    }
                    // The instance was unconfigured.
                    None => break,
                }
            }
            msg = bus_rx.recv() => {
                match msg {
                    Some(msg) => instance.process_bus_msg(msg),
                    None => break,
                }
            }
            Some(msg) = protocol_input_rx.recv() => {
                instance.process_protocol_msg(msg);
            }
        }
    }

    instance.shutdown();
}

// ===== impl ProtocolInputChannelsRx =====

impl<V> ProtocolInputChannelsRx<V>
where
    V: Version,
{
    pub(crate) async fn recv(&mut self) -> Option<ProtocolInputMsg<V>> {
        tokio::select! {
            msg = self.general_query_interval.recv() => {
                msg.map(ProtocolInputMsg::GeneralQueryInterval)
            }
            msg = self.other_querier_timeout.recv() => {
                msg.map(ProtocolInputMsg::OtherQuerierTimeout)
            }
            msg = self.group_timeout.recv() => {
                msg.map(ProtocolInputMsg::GroupTimeout)
            }
            msg = self.group_query_interval.recv() => {
                msg.map(ProtocolInputMsg::GroupQueryInterval)
            }
            msg = self.source_timeout.recv() => {
                msg.map(ProtocolInputMsg::SourceTimeout)
            }
            msg = self.host_present_timeout.recv() => {
                msg.map(ProtocolInputMsg::HostPresentTimeout)
            }
            msg = self.fea_retry_timeout.recv() => {
                msg.map(ProtocolInputMsg::FeaRetryTimeout)
            }
            msg = self.membership_retry_timeout.recv() => {
                msg.map(ProtocolInputMsg::MembershipRetryTimeout)
            }
        }
    }
}
