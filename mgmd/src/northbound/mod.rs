//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

pub mod configuration;
pub mod state;

use tokio::sync::oneshot;

use crate::instance::Instance;
use crate::northbound::configuration::ConfigRequest;
use crate::northbound::state::{GroupEntry, InterfaceEntry};
use crate::version::Version;

// Requests received from the management plane.
#[derive(Debug)]
pub enum Request {
    // Configuration change.
    Config(ConfigRequest),
    // Operational state queries.
    GetGroups {
        reply: oneshot::Sender<Vec<GroupEntry>>,
    },
    GetInterfaces {
        reply: oneshot::Sender<Vec<InterfaceEntry>>,
    },
}

// ===== global functions =====

pub fn process_request<V>(instance: &mut Instance<V>, request: Request)
where
    V: Version,
{
    match request {
        Request::Config(config) => {
            if let Err(error) = configuration::process(instance, config) {
                error.log();
            }
        }
        Request::GetGroups { reply } => {
            let _ = reply.send(state::groups(instance));
        }
        Request::GetInterfaces { reply } => {
            let _ = reply.send(state::interfaces(instance));
        }
    }
}
