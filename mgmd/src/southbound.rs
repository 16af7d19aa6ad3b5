//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//
//
// Read-only mirror of the system interface tree. The mirror publishes
// interface and address updates over the bus; they are reconciled here
// against the configured interfaces, which are started or stopped as
// their underlying state changes.
//

use mgmd_utils::ip::{IpAddrKind, IpNetworkKind};
use mgmd_utils::southbound::{AddressFlags, AddressMsg, InterfaceUpdateMsg};

use crate::instance::InstanceUpView;
use crate::interface::Interfaces;
use crate::version::Version;

// ===== global functions =====

pub(crate) fn process_iface_update<V>(
    instance: &mut InstanceUpView<'_, V>,
    interfaces: &mut Interfaces<V>,
    msg: InterfaceUpdateMsg,
) where
    V: Version,
{
    // Lookup interface.
    let Some((_, iface)) =
        interfaces.update_ifindex(&msg.ifname, Some(msg.ifindex))
    else {
        return;
    };

    // Update interface data.
    iface.system.mtu = Some(msg.mtu);
    iface.system.flags = msg.flags;

    // Check if the interface needs to be started or stopped.
    iface.update(instance);
}

pub(crate) fn process_addr_add<V>(
    instance: &mut InstanceUpView<'_, V>,
    interfaces: &mut Interfaces<V>,
    msg: AddressMsg,
) where
    V: Version,
{
    let Some(addr) = V::IpNetwork::get(msg.addr) else {
        return;
    };

    // Lookup interface.
    let Some((_, iface)) = interfaces.get_mut_by_name(&msg.ifname) else {
        return;
    };

    // Ignore unnumbered addresses.
    if msg.flags.contains(AddressFlags::UNNUMBERED) {
        return;
    }

    // Add address.
    if !iface.system.addr_list.insert(addr) {
        return;
    }
    if let Some(peer) = msg.peer.and_then(V::IpAddr::get) {
        iface.system.peer_addr_list.insert(peer);
    }
    iface.update_primary_addr();

    // Check if the interface needs to be started.
    iface.update(instance);
}

pub(crate) fn process_addr_del<V>(
    instance: &mut InstanceUpView<'_, V>,
    interfaces: &mut Interfaces<V>,
    msg: AddressMsg,
) where
    V: Version,
{
    let Some(addr) = V::IpNetwork::get(msg.addr) else {
        return;
    };

    // Lookup interface.
    let Some((_, iface)) = interfaces.get_mut_by_name(&msg.ifname) else {
        return;
    };

    // Ignore unnumbered addresses.
    if msg.flags.contains(AddressFlags::UNNUMBERED) {
        return;
    }

    // Remove address.
    if !iface.system.addr_list.remove(&addr) {
        return;
    }
    if let Some(peer) = msg.peer.and_then(V::IpAddr::get) {
        iface.system.peer_addr_list.remove(&peer);
    }
    iface.update_primary_addr();

    // Check if the interface needs to be stopped.
    iface.update(instance);
}

// The initial snapshot of the interface tree was delivered; the
// instance startup can make progress.
pub(crate) fn process_tree_complete<V>(
    instance: &mut InstanceUpView<'_, V>,
    interfaces: &mut Interfaces<V>,
) where
    V: Version,
{
    if instance.state.mirror_running {
        return;
    }

    instance.state.mirror_running = true;
    instance.state.decr_startup_requests();

    // Try to start interfaces.
    for iface in interfaces.iter_mut() {
        iface.update(instance);
    }
}
