//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeSet;
use std::time::Duration;

use mgmd_utils::bus::{ProtocolPacket, QueryPacket};
use mgmd_utils::ip::IpAddrKind;

use crate::debug::Debug;
use crate::group::GroupRecord;
use crate::instance::InstanceUpView;
use crate::interface::InterfaceView;
use crate::rpc::{self, FeaTask};
use crate::version::Version;

// Transmits a General Query.
pub(crate) fn general_query<V>(
    instance: &mut InstanceUpView<'_, V>,
    iface: &InterfaceView<'_, V>,
) where
    V: Version,
{
    send_query(
        instance,
        iface,
        V::IpAddr::unspecified(),
        &BTreeSet::new(),
        iface.config.query_response_interval,
        false,
    );
}

// Transmits a Group-Specific Query and schedules its retransmissions.
//
// Sending the query also lowers the group timer to the Last Member
// Query Time (RFC 3376 Section 6.6.3.1).
pub(crate) fn group_specific_query<V>(
    instance: &mut InstanceUpView<'_, V>,
    iface: &InterfaceView<'_, V>,
    record: &mut GroupRecord<V>,
) where
    V: Version,
{
    record.lower_group_timer(iface.config.last_member_query_time());
    send_query(
        instance,
        iface,
        record.group,
        &BTreeSet::new(),
        iface.config.query_last_member_interval,
        false,
    );
    record.schedule_periodic_group_query(instance, iface, &BTreeSet::new());
}

// Transmits a Group-and-Source-Specific Query and schedules its
// retransmissions.
//
// Sending the query also lowers the addressed source timers to the
// Last Member Query Time (RFC 3376 Section 6.6.3.1).
pub(crate) fn group_source_specific_query<V>(
    instance: &mut InstanceUpView<'_, V>,
    iface: &InterfaceView<'_, V>,
    record: &mut GroupRecord<V>,
    sources: &BTreeSet<V::IpAddr>,
) where
    V: Version,
{
    record.lower_source_timer(
        instance,
        iface,
        sources,
        iface.config.last_member_query_time(),
    );
    send_query(
        instance,
        iface,
        record.group,
        sources,
        iface.config.query_last_member_interval,
        false,
    );
    record.schedule_periodic_group_query(instance, iface, sources);
}

// Builds a query descriptor and enqueues it for transmission through
// the FEA. General Queries are addressed to the all-systems group,
// specific queries to the group itself.
pub(crate) fn send_query<V>(
    instance: &mut InstanceUpView<'_, V>,
    iface: &InterfaceView<'_, V>,
    group: V::IpAddr,
    sources: &BTreeSet<V::IpAddr>,
    max_resp_time: Duration,
    suppress_router_processing: bool,
) where
    V: Version,
{
    let dst = if group.is_unspecified() {
        V::all_systems()
    } else {
        group
    };
    let packet = ProtocolPacket::Query(QueryPacket {
        version: iface.config.version,
        group: group.into(),
        sources: sources.iter().copied().map(Into::into).collect(),
        max_resp_time,
        suppress_router_processing,
    });

    if instance.config.trace_opts.packets_tx {
        Debug::<V>::PacketTx(iface.ifname, &packet).log();
    }

    instance.state.statistics.msgs_sent.total += 1;
    instance.state.statistics.msgs_sent.query += 1;

    rpc::fea_task_push(
        instance,
        FeaTask::SendProtocolMessage {
            ifname: iface.ifname.to_owned(),
            ifindex: iface.ifindex,
            src: iface.primary_addr,
            dst,
            packet,
        },
    );
}
