//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

#![warn(rust_2018_idioms)]

mod bus;
mod config;

use std::time::Duration;

use clap::{App, Arg};
use config::{Config, Family, InterfaceConfig};
use mgmd::instance::{self, Instance, InstanceChannelsTx};
use mgmd::northbound::Request;
use mgmd::northbound::configuration::ConfigRequest;
use mgmd::version::{Igmp, Mld, Version};
use mgmd_utils::bus::BusChannelsTx;
use tokio::sync::mpsc;
use tokio::sync::mpsc::Sender;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mgmd=debug,mgmdd=info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

#[tokio::main]
async fn main() {
    // Parse command-line parameters.
    let matches = App::new("mgmdd")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Multicast group membership daemon")
        .arg(
            Arg::with_name("config")
                .short("f")
                .long("config-file")
                .value_name("FILE")
                .help("Path to the configuration file")
                .default_value("/etc/mgmd.json"),
        )
        .get_matches();

    init_tracing();

    let config_path = matches.value_of("config").unwrap();
    let config = match Config::load(config_path) {
        Ok(config) => config,
        Err(err) => {
            error!(path = %config_path, error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };

    match config.instance.family {
        Family::Ipv4 => run::<Igmp>(config).await,
        Family::Ipv6 => run::<Mld>(config).await,
    }
}

async fn run<V>(config: Config)
where
    V: Version,
{
    // Create channels.
    let (bus_tx, bus_rx) = mpsc::unbounded_channel();
    let (fea_tx, fea_rx) = mpsc::unbounded_channel();
    let (finder_tx, finder_rx) = mpsc::unbounded_channel();
    let (northbound_tx, northbound_rx) = mpsc::channel(4);
    let (protocol_input_tx, protocol_input_rx) =
        instance::protocol_input_channels::<V>();

    // Create the protocol instance.
    let channels_tx = InstanceChannelsTx::new(
        BusChannelsTx::new(fea_tx, finder_tx),
        protocol_input_tx,
    );
    let mut instance =
        Instance::<V>::new(config.instance.name.clone(), channels_tx);
    instance.config.fea_target = config.instance.fea_target.clone();
    instance.config.mfea_target = config.instance.mfea_target.clone();

    // Spawn the instance event loop.
    let instance_task = tokio::spawn(instance::run(
        instance,
        bus_rx,
        northbound_rx,
        protocol_input_rx,
    ));

    // Serve the service bus socket.
    let server = bus::BusServer::new(bus_tx.clone(), fea_rx, finder_rx);
    tokio::spawn(server.run(config.socket_path.clone()));

    // Apply the configuration.
    for iface in &config.interfaces {
        apply_interface_config(&northbound_tx, iface).await;
    }
    let _ = northbound_tx
        .send(Request::Config(ConfigRequest::InstanceEnable {
            enabled: config.instance.enabled,
        }))
        .await;

    info!(name = %config.instance.name, "daemon started");

    // Run until interrupted.
    let _ = tokio::signal::ctrl_c().await;
    info!("shutting down");

    // Closing the northbound channel stops the instance event loop.
    drop(northbound_tx);
    let _ = instance_task.await;
}

async fn apply_interface_config(
    northbound_tx: &Sender<Request>,
    iface: &InterfaceConfig,
) {
    let ifname = iface.name.clone();

    let mut requests = vec![ConfigRequest::InterfaceCreate {
        ifname: ifname.clone(),
    }];
    if let Some(version) = iface.version {
        requests.push(ConfigRequest::InterfaceVersion {
            ifname: ifname.clone(),
            version,
        });
    }
    if iface.router_alert_check {
        requests.push(ConfigRequest::InterfaceRouterAlertCheck {
            ifname: ifname.clone(),
            enabled: true,
        });
    }
    if let Some(secs) = iface.query_interval {
        requests.push(ConfigRequest::InterfaceQueryInterval {
            ifname: ifname.clone(),
            interval: Duration::from_secs(secs),
        });
    }
    if let Some(secs) = iface.query_last_member_interval {
        requests.push(ConfigRequest::InterfaceQueryLastMemberInterval {
            ifname: ifname.clone(),
            interval: Duration::from_secs(secs),
        });
    }
    if let Some(secs) = iface.query_response_interval {
        requests.push(ConfigRequest::InterfaceQueryResponseInterval {
            ifname: ifname.clone(),
            interval: Duration::from_secs(secs),
        });
    }
    if let Some(robustness) = iface.robustness_variable {
        requests.push(ConfigRequest::InterfaceRobustnessVariable {
            ifname: ifname.clone(),
            robustness,
        });
    }
    if !iface.enabled {
        requests.push(ConfigRequest::InterfaceEnable {
            ifname,
            enabled: false,
        });
    }

    for request in requests {
        let _ = northbound_tx.send(Request::Config(request)).await;
    }
}
