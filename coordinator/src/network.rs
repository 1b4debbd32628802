//! Coordinator network layer: UDP socket tasks around the poll loop

use crate::coordinator::{Coordinator, Outbound};
use crate::store::DurableStore;
use log::{debug, error, info, warn};
use shared::transport::{decode, encode, DrainToken, MAX_DATAGRAM};
use shared::utils::get_timestamp;
use shared::{Packet, ZoneConfig, ZoneResult};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

/// Messages sent from network tasks to the poll loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived { packet: Packet, addr: SocketAddr },
    Shutdown,
}

/// One coordinator instance bound to a UDP socket
pub struct CoordinatorServer<S: DurableStore + 'static> {
    socket: Arc<UdpSocket>,
    coordinator: Coordinator<S>,

    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    outbound_rx: Option<mpsc::UnboundedReceiver<Outbound>>,
}

impl<S: DurableStore + 'static> CoordinatorServer<S> {
    pub async fn new(addr: &str, coordinator: Coordinator<S>) -> ZoneResult<Self> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("{} listening on {}", coordinator.id(), socket.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        Ok(Self {
            socket,
            coordinator,
            server_tx,
            server_rx,
            outbound_tx,
            outbound_rx: Some(outbound_rx),
        })
    }

    pub fn local_addr(&self) -> ZoneResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn coordinator(&self) -> &Coordinator<S> {
        &self.coordinator
    }

    /// Spawns task that continuously listens for incoming packets
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => match decode(&buffer[..len]) {
                        Ok(packet) => {
                            if let Err(e) =
                                server_tx.send(ServerMessage::PacketReceived { packet, addr })
                            {
                                error!("Failed to send packet to poll loop: {}", e);
                                break;
                            }
                        }
                        Err(e) => warn!("Failed to decode packet from {}: {}", addr, e),
                    },
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that drains the outgoing packet queue
    fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let Some(mut outbound_rx) = self.outbound_rx.take() else {
            return;
        };

        tokio::spawn(async move {
            while let Some(Outbound { addr, packet }) = outbound_rx.recv().await {
                let sent: ZoneResult<()> = match encode(&packet) {
                    Ok(data) => socket.send_to(&data, addr).await.map(|_| ()).map_err(Into::into),
                    Err(e) => Err(e),
                };
                if let Err(e) = sent {
                    error!("Failed to send {} to {}: {}", packet.kind(), addr, e);
                }
            }
        });
    }

    fn send_all(&self, outbound: Vec<Outbound>) {
        for message in outbound {
            if let Err(e) = self.outbound_tx.send(message) {
                error!("Failed to queue packet for sending: {}", e);
            }
        }
    }

    /// Handle for stopping the poll loop from another task.
    pub fn shutdown_handle(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.server_tx.clone()
    }

    /// Bootstraps, then runs the poll loop until shutdown or drain.
    pub async fn run(&mut self, mut drain: DrainToken) -> ZoneResult<()> {
        self.spawn_network_receiver();
        self.spawn_network_sender();

        self.coordinator.bootstrap(get_timestamp()).await?;
        info!(
            "{} started as {} with map version {}",
            self.coordinator.id(),
            if self.coordinator.is_primary() { "primary" } else { "secondary" },
            self.coordinator.map_version()
        );

        let config = self.coordinator.config().clone();
        let mut balance_tick = interval(ZoneConfig::duration(config.balance_interval_ms));
        let mut commit_tick = interval(ZoneConfig::duration(config.commit_interval_ms));
        let mut leader_tick = interval(ZoneConfig::duration(config.leader_check_interval_ms));
        let mut timeout_tick = interval(Duration::from_secs(1));
        for tick in [
            &mut balance_tick,
            &mut commit_tick,
            &mut leader_tick,
            &mut timeout_tick,
        ] {
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        }

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            let out = self.coordinator.handle_packet(packet, addr, get_timestamp());
                            self.send_all(out);
                        }
                        Some(ServerMessage::Shutdown) | None => {
                            info!("{} shutting down", self.coordinator.id());
                            break;
                        }
                    }
                },

                _ = balance_tick.tick() => {
                    match self.coordinator.balance(get_timestamp()) {
                        Ok(out) => self.send_all(out),
                        Err(e) => error!("Balancer pass failed: {}", e),
                    }
                },

                _ = commit_tick.tick() => {
                    let out = self.coordinator.resolve_commits(get_timestamp());
                    self.send_all(out);
                },

                _ = leader_tick.tick() => {
                    match self.coordinator.check_leadership(get_timestamp()) {
                        Ok(out) => self.send_all(out),
                        Err(e) => error!("Leadership check failed: {}", e),
                    }
                },

                _ = timeout_tick.tick() => {
                    let expired = self.coordinator.expire_hosts(get_timestamp());
                    if !expired.is_empty() {
                        debug!("Expired {} hosts", expired.len());
                    }
                },

                _ = drain.drained() => {
                    info!("{} draining", self.coordinator.id());
                    break;
                }
            }
        }

        self.coordinator.resign();
        Ok(())
    }
}
