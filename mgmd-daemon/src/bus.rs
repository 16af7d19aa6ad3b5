//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//
//
// Service bus endpoint. External collaborators (the FEA, the finder,
// the interface mirror and the downstream multicast routing
// protocols) connect over a unix socket and speak newline-delimited
// JSON: the first line identifies the peer's role, every following
// line carries one bus message.
//

use std::sync::Arc;

use mgmd_utils::bus::{
    BusMsg, BusSender, FeaRequestMsg, FinderRequestMsg, MembershipMsg,
    ProtocolSubscribeMsg, ProtocolUnsubscribeMsg,
};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
enum Hello {
    Fea,
    Finder,
    Ifmgr,
    Protocol { module_name: String, ifindex: u32 },
}

pub struct BusServer {
    bus_tx: BusSender,
    fea_rx: Arc<Mutex<Option<UnboundedReceiver<FeaRequestMsg>>>>,
    finder_rx: Arc<Mutex<Option<UnboundedReceiver<FinderRequestMsg>>>>,
}

// ===== impl BusServer =====

impl BusServer {
    pub fn new(
        bus_tx: BusSender,
        fea_rx: UnboundedReceiver<FeaRequestMsg>,
        finder_rx: UnboundedReceiver<FinderRequestMsg>,
    ) -> BusServer {
        BusServer {
            bus_tx,
            fea_rx: Arc::new(Mutex::new(Some(fea_rx))),
            finder_rx: Arc::new(Mutex::new(Some(finder_rx))),
        }
    }

    pub async fn run(self, path: String) {
        let _ = std::fs::remove_file(&path);
        let listener = match UnixListener::bind(&path) {
            Ok(listener) => listener,
            Err(error) => {
                warn!(%path, %error, "failed to bind service bus socket");
                return;
            }
        };
        info!(%path, "listening for service connections");

        loop {
            let stream = match listener.accept().await {
                Ok((stream, _)) => stream,
                Err(error) => {
                    warn!(%error, "failed to accept service connection");
                    continue;
                }
            };

            let bus_tx = self.bus_tx.clone();
            let fea_rx = self.fea_rx.clone();
            let finder_rx = self.finder_rx.clone();
            tokio::spawn(async move {
                if let Err(error) =
                    handle_connection(stream, bus_tx, fea_rx, finder_rx).await
                {
                    warn!(%error, "service connection error");
                }
            });
        }
    }
}

// ===== helper functions =====

async fn handle_connection(
    stream: UnixStream,
    bus_tx: BusSender,
    fea_rx: Arc<Mutex<Option<UnboundedReceiver<FeaRequestMsg>>>>,
    finder_rx: Arc<Mutex<Option<UnboundedReceiver<FinderRequestMsg>>>>,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    // The first line identifies the peer.
    let Some(hello) = lines.next_line().await? else {
        return Ok(());
    };
    let hello: Hello = match serde_json::from_str(&hello) {
        Ok(hello) => hello,
        Err(error) => {
            warn!(%error, "invalid hello message");
            return Ok(());
        }
    };

    match hello {
        Hello::Fea => {
            let Some(mut rx) = fea_rx.lock().await.take() else {
                warn!("fea peer already connected");
                return Ok(());
            };
            info!("fea peer connected");

            loop {
                tokio::select! {
                    line = lines.next_line() => {
                        match line? {
                            Some(line) => forward_bus_msg(&bus_tx, &line),
                            None => break,
                        }
                    }
                    msg = rx.recv() => {
                        match msg {
                            Some(msg) => write_msg(&mut write_half, &msg).await?,
                            None => break,
                        }
                    }
                }
            }

            info!("fea peer disconnected");
            *fea_rx.lock().await = Some(rx);
        }
        Hello::Finder => {
            let Some(mut rx) = finder_rx.lock().await.take() else {
                warn!("finder peer already connected");
                return Ok(());
            };
            info!("finder peer connected");

            loop {
                tokio::select! {
                    line = lines.next_line() => {
                        match line? {
                            Some(line) => forward_bus_msg(&bus_tx, &line),
                            None => break,
                        }
                    }
                    msg = rx.recv() => {
                        match msg {
                            Some(msg) => write_msg(&mut write_half, &msg).await?,
                            None => break,
                        }
                    }
                }
            }

            info!("finder peer disconnected");
            *finder_rx.lock().await = Some(rx);
        }
        Hello::Ifmgr => {
            info!("interface mirror connected");
            while let Some(line) = lines.next_line().await? {
                forward_bus_msg(&bus_tx, &line);
            }
            info!("interface mirror disconnected");
        }
        Hello::Protocol {
            module_name,
            ifindex,
        } => {
            info!(module = %module_name, %ifindex, "protocol peer connected");

            let (tx, mut rx) = mpsc::unbounded_channel::<MembershipMsg>();
            let _ = bus_tx.send(BusMsg::ProtocolSubscribe(
                ProtocolSubscribeMsg {
                    module_name: module_name.clone(),
                    ifindex,
                    tx: Some(tx),
                },
            ));

            loop {
                tokio::select! {
                    line = lines.next_line() => {
                        match line? {
                            Some(line) => forward_bus_msg(&bus_tx, &line),
                            None => break,
                        }
                    }
                    msg = rx.recv() => {
                        match msg {
                            Some(msg) => write_msg(&mut write_half, &msg).await?,
                            None => break,
                        }
                    }
                }
            }

            info!(module = %module_name, "protocol peer disconnected");
            let _ = bus_tx.send(BusMsg::ProtocolUnsubscribe(
                ProtocolUnsubscribeMsg {
                    module_name,
                    ifindex,
                },
            ));
        }
    }

    Ok(())
}

async fn write_msg<T>(
    write_half: &mut OwnedWriteHalf,
    msg: &T,
) -> std::io::Result<()>
where
    T: serde::Serialize,
{
    let data = serde_json::to_string(msg).unwrap();
    write_half.write_all(data.as_bytes()).await?;
    write_half.write_all(b"\n").await?;
    Ok(())
}

fn forward_bus_msg(bus_tx: &BusSender, line: &str) {
    match serde_json::from_str::<BusMsg>(line) {
        Ok(msg) => {
            let _ = bus_tx.send(msg);
        }
        Err(error) => {
            warn!(%error, "invalid bus message");
        }
    }
}
