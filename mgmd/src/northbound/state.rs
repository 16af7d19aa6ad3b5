//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::group::FilterMode;
use crate::instance::Instance;
use crate::version::Version;

// Operational state of one interface.
#[derive(Debug, Serialize)]
pub struct InterfaceEntry {
    pub ifname: String,
    pub ifindex: Option<u32>,
    pub active: bool,
    pub version: u8,
    // Elected querier, and whether it is us.
    pub querier_addr: Option<IpAddr>,
    pub is_querier: bool,
    pub group_count: usize,
}

// Operational state of one group record.
#[derive(Debug, Serialize)]
pub struct GroupEntry {
    pub ifname: String,
    pub group: IpAddr,
    pub filter_mode: FilterMode,
    // Remaining group timer (zero in INCLUDE mode).
    pub timeout: Duration,
    pub last_reported_host: Option<IpAddr>,
    pub created: DateTime<Utc>,
    pub sources: Vec<SourceEntry>,
}

// Operational state of one source record.
#[derive(Debug, Serialize)]
pub struct SourceEntry {
    pub source: IpAddr,
    pub timeout: Duration,
    // Whether traffic from this source is forwarded.
    pub forwarding: bool,
}

// ===== global functions =====

pub(crate) fn interfaces<V>(instance: &Instance<V>) -> Vec<InterfaceEntry>
where
    V: Version,
{
    instance
        .interfaces
        .iter()
        .map(|iface| InterfaceEntry {
            ifname: iface.name.clone(),
            ifindex: iface.system.ifindex,
            active: iface.state.active,
            version: iface.config.version,
            querier_addr: iface.state.querier_addr.map(Into::into),
            is_querier: iface.is_querier(),
            group_count: iface.state.groups.len(),
        })
        .collect()
}

pub(crate) fn groups<V>(instance: &Instance<V>) -> Vec<GroupEntry>
where
    V: Version,
{
    let mut entries = Vec::new();

    for iface in instance.interfaces.iter() {
        for (group, record) in iface.state.groups.iter() {
            let mut sources = Vec::new();
            for (source, source_record) in record.forward_sources.iter() {
                sources.push(SourceEntry {
                    source: (*source).into(),
                    timeout: source_record.timeout(),
                    forwarding: true,
                });
            }
            for (source, source_record) in record.dont_forward_sources.iter()
            {
                sources.push(SourceEntry {
                    source: (*source).into(),
                    timeout: source_record.timeout(),
                    forwarding: false,
                });
            }

            entries.push(GroupEntry {
                ifname: iface.name.clone(),
                group: (*group).into(),
                filter_mode: record.filter_mode,
                timeout: record.timeout(),
                last_reported_host: record.last_reported_host.map(Into::into),
                created: record.created,
                sources,
            });
        }
    }

    entries
}
