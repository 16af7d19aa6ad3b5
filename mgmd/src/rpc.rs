//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//
//
// Orchestration of the asynchronous requests toward the external
// services. Two independent FIFO queues are maintained:
//
// - The FEA queue carries interest (de)registrations, receiver
//   open/close requests, kernel multicast joins/leaves and outbound
//   protocol packets.
// - The membership queue carries add/delete membership notifications
//   toward the downstream multicast routing protocols.
//
// Each queue dispatches at most one request at a time. The head is
// dispatched when the queue becomes non-empty and popped when its
// reply arrives; transient failures re-arm a fixed back-off timer and
// dispatch the same head again.
//

use std::collections::VecDeque;

use mgmd_utils::bus::{
    FeaReplyMsg, FeaRequest, FeaRequestMsg, FinderReplyMsg, FinderRequestMsg,
    MembershipAction, MembershipMsg, MembershipReplyMsg, ProtocolPacket,
    ServiceError,
};
use mgmd_utils::task::TimeoutTask;
use tracing::warn;

use crate::consts;
use crate::debug::Debug;
use crate::error::Error;
use crate::instance::InstanceUpView;
use crate::interface::Interfaces;
use crate::tasks;
use crate::version::Version;

// Requests toward the FEA (and, for interest registrations, the
// finder).
#[derive(Debug)]
pub enum FeaTask<V: Version> {
    RegisterUnregisterInterest {
        target: String,
        is_register: bool,
    },
    RegisterUnregisterReceiver {
        ifname: String,
        ifindex: u32,
        is_register: bool,
    },
    JoinLeaveMulticastGroup {
        ifname: String,
        ifindex: u32,
        group: V::IpAddr,
        is_join: bool,
    },
    SendProtocolMessage {
        ifname: String,
        ifindex: u32,
        src: V::IpAddr,
        dst: V::IpAddr,
        packet: ProtocolPacket,
    },
}

#[derive(Debug)]
pub struct FeaQueue<V: Version> {
    pub queue: VecDeque<FeaTask<V>>,
    pub in_flight: Option<u64>,
    pub next_request_id: u64,
    pub retry_timer: Option<TimeoutTask>,
}

// Membership notification toward one downstream protocol.
#[derive(Debug)]
pub struct MembershipTask<V: Version> {
    pub module_name: String,
    pub ifname: String,
    pub ifindex: u32,
    pub source: V::IpAddr,
    pub group: V::IpAddr,
    pub action: MembershipAction,
}

#[derive(Debug)]
pub struct MembershipQueue<V: Version> {
    pub queue: VecDeque<MembershipTask<V>>,
    pub in_flight: Option<u64>,
    pub next_request_id: u64,
    pub retry_timer: Option<TimeoutTask>,
}

// ===== impl FeaTask =====

impl<V> FeaTask<V>
where
    V: Version,
{
    pub(crate) fn operation_name(&self) -> &'static str {
        match self {
            FeaTask::RegisterUnregisterInterest {
                is_register: true, ..
            } => "register interest",
            FeaTask::RegisterUnregisterInterest {
                is_register: false,
                ..
            } => "deregister interest",
            FeaTask::RegisterUnregisterReceiver {
                is_register: true, ..
            } => "register receiver",
            FeaTask::RegisterUnregisterReceiver {
                is_register: false,
                ..
            } => "unregister receiver",
            FeaTask::JoinLeaveMulticastGroup { is_join: true, .. } => {
                "join group"
            }
            FeaTask::JoinLeaveMulticastGroup { is_join: false, .. } => {
                "leave group"
            }
            FeaTask::SendProtocolMessage { .. } => "send packet",
        }
    }

    // Teardown requests are considered done when the peer is gone.
    fn is_teardown(&self) -> bool {
        matches!(
            self,
            FeaTask::RegisterUnregisterInterest {
                is_register: false,
                ..
            } | FeaTask::RegisterUnregisterReceiver {
                is_register: false,
                ..
            } | FeaTask::JoinLeaveMulticastGroup { is_join: false, .. }
        )
    }
}

impl<V> Default for FeaQueue<V>
where
    V: Version,
{
    fn default() -> FeaQueue<V> {
        FeaQueue {
            queue: VecDeque::new(),
            in_flight: None,
            next_request_id: 0,
            retry_timer: None,
        }
    }
}

impl<V> Default for MembershipQueue<V>
where
    V: Version,
{
    fn default() -> MembershipQueue<V> {
        MembershipQueue {
            queue: VecDeque::new(),
            in_flight: None,
            next_request_id: 0,
            retry_timer: None,
        }
    }
}

// ===== FEA queue =====

// Appends a request to the FEA queue and dispatches it if the queue
// was idle.
pub(crate) fn fea_task_push<V>(
    instance: &mut InstanceUpView<'_, V>,
    task: FeaTask<V>,
) where
    V: Version,
{
    instance.state.fea.queue.push_back(task);
    fea_dispatch(instance);
}

// Dispatches the head of the FEA queue, unless a request is already
// in flight or a prerequisite is missing.
pub(crate) fn fea_dispatch<V>(instance: &mut InstanceUpView<'_, V>)
where
    V: Version,
{
    if instance.state.fea.in_flight.is_some() {
        return;
    }
    if !instance.state.services.finder_alive {
        return;
    }

    {
        let Some(task) = instance.state.fea.queue.front() else {
            return;
        };

        // Requests toward the FEA require registered interest first.
        if !matches!(task, FeaTask::RegisterUnregisterInterest { .. })
            && !instance.state.services.fea_registered
        {
            fea_retry_arm(instance);
            return;
        }
    }

    instance.state.fea.next_request_id += 1;
    let request_id = instance.state.fea.next_request_id;
    let task = instance.state.fea.queue.front().unwrap();

    Debug::<V>::ServiceRequestTx(task.operation_name()).log();

    let sent = match task {
        FeaTask::RegisterUnregisterInterest {
            target,
            is_register,
        } => {
            let msg =
                FinderRequestMsg::new(request_id, target.clone(), *is_register);
            instance.tx.bus.finder.send(msg).is_ok()
        }
        FeaTask::RegisterUnregisterReceiver {
            ifname,
            ifindex,
            is_register,
        } => {
            let request = if *is_register {
                FeaRequest::RegisterReceiver {
                    ifname: ifname.clone(),
                    ifindex: *ifindex,
                    ip_protocol: V::IP_PROTOCOL,
                    enable_multicast_loopback: false,
                }
            } else {
                FeaRequest::UnregisterReceiver {
                    ifname: ifname.clone(),
                    ifindex: *ifindex,
                    ip_protocol: V::IP_PROTOCOL,
                }
            };
            let msg = FeaRequestMsg::new(request_id, request);
            instance.tx.bus.fea.send(msg).is_ok()
        }
        FeaTask::JoinLeaveMulticastGroup {
            ifname,
            ifindex,
            group,
            is_join,
        } => {
            let request = if *is_join {
                FeaRequest::JoinMulticastGroup {
                    ifname: ifname.clone(),
                    ifindex: *ifindex,
                    ip_protocol: V::IP_PROTOCOL,
                    group: (*group).into(),
                }
            } else {
                FeaRequest::LeaveMulticastGroup {
                    ifname: ifname.clone(),
                    ifindex: *ifindex,
                    ip_protocol: V::IP_PROTOCOL,
                    group: (*group).into(),
                }
            };
            let msg = FeaRequestMsg::new(request_id, request);
            instance.tx.bus.fea.send(msg).is_ok()
        }
        FeaTask::SendProtocolMessage {
            ifname,
            ifindex,
            src,
            dst,
            packet,
        } => {
            let request = FeaRequest::SendPacket {
                ifname: ifname.clone(),
                ifindex: *ifindex,
                src: (*src).into(),
                dst: (*dst).into(),
                ip_protocol: V::IP_PROTOCOL,
                ttl: consts::PROTOCOL_TTL,
                tos: consts::PROTOCOL_TOS,
                router_alert: true,
                internet_control: true,
                packet: packet.clone(),
            };
            let msg = FeaRequestMsg::new(request_id, request);
            instance.tx.bus.fea.send(msg).is_ok()
        }
    };

    if !sent {
        fea_retry_arm(instance);
        return;
    }

    instance.state.fea.in_flight = Some(request_id);
}

fn fea_retry_arm<V>(instance: &mut InstanceUpView<'_, V>)
where
    V: Version,
{
    if instance.state.fea.retry_timer.is_some() {
        return;
    }

    Debug::<V>::ServiceRetry("fea").log();

    let timer = tasks::fea_retry_timer(
        consts::SERVICE_RETRY_INTERVAL,
        &instance.tx.protocol_input.fea_retry_timeout,
    );
    instance.state.fea.retry_timer = Some(timer);
}

pub(crate) fn process_fea_retry<V>(instance: &mut InstanceUpView<'_, V>)
where
    V: Version,
{
    instance.state.fea.retry_timer = None;
    fea_dispatch(instance);
}

pub(crate) fn process_fea_reply<V>(
    instance: &mut InstanceUpView<'_, V>,
    interfaces: &mut Interfaces<V>,
    msg: FeaReplyMsg,
) where
    V: Version,
{
    fea_reply(instance, interfaces, msg.request_id, msg.result);
}

pub(crate) fn process_finder_reply<V>(
    instance: &mut InstanceUpView<'_, V>,
    interfaces: &mut Interfaces<V>,
    msg: FinderReplyMsg,
) where
    V: Version,
{
    fea_reply(instance, interfaces, msg.request_id, msg.result);
}

fn fea_reply<V>(
    instance: &mut InstanceUpView<'_, V>,
    interfaces: &mut Interfaces<V>,
    request_id: u64,
    result: Result<(), ServiceError>,
) where
    V: Version,
{
    // Ignore stale replies.
    if instance.state.fea.in_flight != Some(request_id) {
        return;
    }
    instance.state.fea.in_flight = None;

    let Some(task) = instance.state.fea.queue.front() else {
        return;
    };
    let operation = task.operation_name();
    let is_teardown = task.is_teardown();
    let is_send = matches!(task, FeaTask::SendProtocolMessage { .. });
    let compensating_leave = match task {
        FeaTask::JoinLeaveMulticastGroup {
            ifname,
            ifindex,
            group,
            is_join: true,
        } => Some((ifname.clone(), *ifindex, *group)),
        _ => None,
    };

    let error = match result {
        Ok(()) => {
            fea_task_completed(instance);
            return;
        }
        Err(error) => error,
    };

    if error.is_fatal() {
        instance.state.fea.queue.pop_front();
        fatal_service_error(instance, interfaces, operation, error);
        fea_dispatch(instance);
        return;
    }

    if error.is_unreachable() {
        if is_teardown {
            // The peer is gone; our job is done.
            fea_task_completed(instance);
        } else {
            warn!(%operation, %error, "service communication error");
            fea_retry_arm(instance);
        }
        return;
    }

    if error.is_transient() {
        if is_send {
            // Protocol messages are soft state and will be
            // retransmitted by the protocol timers.
            warn!(%operation, %error, "dropping protocol message");
            instance.state.fea.queue.pop_front();
            fea_dispatch(instance);
        } else {
            warn!(%operation, %error, "service request failed, will retry");
            fea_retry_arm(instance);
        }
        return;
    }

    // The peer rejected the request.
    if is_send {
        warn!(%operation, %error, "dropping protocol message");
        instance.state.fea.queue.pop_front();
        fea_dispatch(instance);
    } else if let Some((ifname, ifindex, group)) = compensating_leave {
        // Try to leave the group to clean up the FEA state as best as
        // possible.
        warn!(%operation, %error, "join rejected, leaving group");
        instance.state.fea.queue.pop_front();
        instance.state.decr_startup_requests();
        fea_task_push(
            instance,
            FeaTask::JoinLeaveMulticastGroup {
                ifname,
                ifindex,
                group,
                is_join: false,
            },
        );
    } else {
        instance.state.fea.queue.pop_front();
        fatal_service_error(instance, interfaces, operation, error);
        fea_dispatch(instance);
    }
}

// The head of the FEA queue completed successfully: apply its side
// effects, pop it and dispatch the next request.
fn fea_task_completed<V>(instance: &mut InstanceUpView<'_, V>)
where
    V: Version,
{
    let Some(task) = instance.state.fea.queue.pop_front() else {
        return;
    };

    match task {
        FeaTask::RegisterUnregisterInterest {
            target,
            is_register,
        } => {
            if target == instance.config.fea_target {
                instance.state.services.fea_registered = is_register;
            }
            if target == instance.config.mfea_target {
                instance.state.services.mfea_registered = is_register;
            }
            if is_register {
                instance.state.decr_startup_requests();
            } else {
                instance.state.decr_shutdown_requests();
            }
        }
        FeaTask::RegisterUnregisterReceiver { is_register, .. } => {
            if is_register {
                instance.state.decr_startup_requests();
            } else {
                instance.state.decr_shutdown_requests();
            }
        }
        FeaTask::JoinLeaveMulticastGroup { is_join, .. } => {
            if is_join {
                instance.state.decr_startup_requests();
            } else {
                instance.state.decr_shutdown_requests();
            }
        }
        FeaTask::SendProtocolMessage { .. } => (),
    }

    fea_dispatch(instance);
}

// An unrecoverable service error: log it and initiate a graceful
// shutdown. In-flight completions keep being drained, but the data
// path stops.
pub(crate) fn fatal_service_error<V>(
    instance: &mut InstanceUpView<'_, V>,
    interfaces: &mut Interfaces<V>,
    operation: &'static str,
    error: ServiceError,
) where
    V: Version,
{
    Error::ServiceFatal(operation, error).log();

    crate::instance::graceful_shutdown(instance, interfaces);
}

// ===== Membership notification queue =====

// Appends a notification to the membership queue and dispatches it if
// the queue was idle.
pub(crate) fn membership_task_push<V>(
    instance: &mut InstanceUpView<'_, V>,
    module_name: String,
    ifname: String,
    ifindex: u32,
    source: V::IpAddr,
    group: V::IpAddr,
    action: MembershipAction,
) where
    V: Version,
{
    let task = MembershipTask {
        module_name,
        ifname,
        ifindex,
        source,
        group,
        action,
    };
    instance.state.membership.queue.push_back(task);
    membership_dispatch(instance);
}

// Dispatches the head of the membership queue, unless a notification
// is already in flight.
pub(crate) fn membership_dispatch<V>(instance: &mut InstanceUpView<'_, V>)
where
    V: Version,
{
    if instance.state.membership.in_flight.is_some() {
        return;
    }
    if !instance.state.services.finder_alive {
        return;
    }

    loop {
        let Some(task) = instance.state.membership.queue.front() else {
            return;
        };
        if !instance.state.subscribers.contains_key(&task.module_name) {
            // The subscriber went away; drop the notification.
            instance.state.membership.queue.pop_front();
            continue;
        }

        instance.state.membership.next_request_id += 1;
        let request_id = instance.state.membership.next_request_id;
        let task = instance.state.membership.queue.front().unwrap();
        let module_name = task.module_name.clone();
        let msg = MembershipMsg {
            request_id,
            ifname: task.ifname.clone(),
            ifindex: task.ifindex,
            source: task.source.into(),
            group: task.group.into(),
            action: task.action,
        };

        let subscriber_tx =
            instance.state.subscribers.get(&module_name).unwrap();
        if subscriber_tx.send(msg).is_err() {
            // The subscriber channel is closed; forget about it.
            instance.state.subscribers.remove(&module_name);
            instance.state.membership.queue.pop_front();
            continue;
        }

        instance.state.membership.in_flight = Some(request_id);
        return;
    }
}

fn membership_retry_arm<V>(instance: &mut InstanceUpView<'_, V>)
where
    V: Version,
{
    if instance.state.membership.retry_timer.is_some() {
        return;
    }

    Debug::<V>::ServiceRetry("membership").log();

    let timer = tasks::membership_retry_timer(
        consts::SERVICE_RETRY_INTERVAL,
        &instance.tx.protocol_input.membership_retry_timeout,
    );
    instance.state.membership.retry_timer = Some(timer);
}

pub(crate) fn process_membership_retry<V>(instance: &mut InstanceUpView<'_, V>)
where
    V: Version,
{
    instance.state.membership.retry_timer = None;
    membership_dispatch(instance);
}

pub(crate) fn process_membership_reply<V>(
    instance: &mut InstanceUpView<'_, V>,
    interfaces: &mut Interfaces<V>,
    msg: MembershipReplyMsg,
) where
    V: Version,
{
    // Ignore stale replies.
    if instance.state.membership.in_flight != Some(msg.request_id) {
        return;
    }
    instance.state.membership.in_flight = None;

    let Some(task) = instance.state.membership.queue.front() else {
        return;
    };
    let is_delete = task.action == MembershipAction::Prune;

    let error = match msg.result {
        Ok(()) => {
            instance.state.membership.queue.pop_front();
            membership_dispatch(instance);
            return;
        }
        Err(error) => error,
    };

    if error.is_fatal() {
        instance.state.membership.queue.pop_front();
        fatal_service_error(
            instance,
            interfaces,
            "notify membership",
            error,
        );
        membership_dispatch(instance);
        return;
    }

    if error.is_unreachable() && is_delete {
        // The peer is gone; the notification is moot.
        instance.state.membership.queue.pop_front();
        membership_dispatch(instance);
        return;
    }

    if let ServiceError::CommandFailed(_) = &error {
        // Membership notifications are advisory; log and move on.
        warn!(%error, "membership notification rejected");
        instance.state.membership.queue.pop_front();
        membership_dispatch(instance);
        return;
    }

    warn!(%error, "membership notification failed, will retry");
    membership_retry_arm(instance);
}
