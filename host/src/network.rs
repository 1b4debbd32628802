//! Host network layer: UDP socket tasks, login with backoff and the poll
//! loop with its drain phase.

use crate::peer::PeerHost;
use crate::Outgoing;
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use shared::transport::{decode, encode, Backoff, DrainToken, MAX_DATAGRAM};
use shared::utils::get_timestamp;
use shared::{Packet, ZoneConfig, ZoneError, ZoneResult};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, timeout, Instant, MissedTickBehavior};

const SIM_TICK: Duration = Duration::from_millis(50);

/// Messages sent from the receiver task to the poll loop
#[derive(Debug)]
pub enum HostMessage {
    PacketReceived { packet: Packet, addr: SocketAddr },
}

pub struct Host {
    socket: Arc<UdpSocket>,
    peer: PeerHost,

    host_tx: mpsc::UnboundedSender<HostMessage>,
    host_rx: mpsc::UnboundedReceiver<HostMessage>,
    outgoing_tx: mpsc::UnboundedSender<Outgoing>,
    outgoing_rx: Option<mpsc::UnboundedReceiver<Outgoing>>,
    started: bool,
}

impl Host {
    /// `coordinators` is a comma-separated list of coordinator instances in
    /// failover order.
    pub async fn new(
        bind: &str,
        coordinators: &str,
        config: ZoneConfig,
        subjects: u32,
    ) -> ZoneResult<Self> {
        let addrs = coordinators
            .split(',')
            .map(|addr| {
                addr.trim()
                    .parse::<SocketAddr>()
                    .map_err(|e| ZoneError::Unavailable(format!("{}: {}", addr, e)))
            })
            .collect::<ZoneResult<Vec<SocketAddr>>>()?;
        let Some((&coordinator, standbys)) = addrs.split_first() else {
            return Err(ZoneError::Unavailable("no coordinator address".to_string()));
        };
        let peer = PeerHost::new(coordinator, config, subjects).with_standbys(standbys.iter().copied());
        let socket = Arc::new(UdpSocket::bind(bind).await?);
        info!("Host bound to {}", socket.local_addr()?);

        let (host_tx, host_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();

        Ok(Self {
            socket,
            peer,
            host_tx,
            host_rx,
            outgoing_tx,
            outgoing_rx: Some(outgoing_rx),
            started: false,
        })
    }

    pub fn local_addr(&self) -> ZoneResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn peer(&self) -> &PeerHost {
        &self.peer
    }

    fn start_tasks(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        self.spawn_network_receiver();
        self.spawn_network_sender();
    }

    /// Spawns task that continuously listens for incoming packets
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let host_tx = self.host_tx.clone();

        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => match decode(&buffer[..len]) {
                        Ok(packet) => {
                            if host_tx
                                .send(HostMessage::PacketReceived { packet, addr })
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(e) => warn!("Failed to decode packet from {}: {}", addr, e),
                    },
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that drains the outgoing packet queue
    fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let Some(mut outgoing_rx) = self.outgoing_rx.take() else {
            return;
        };

        tokio::spawn(async move {
            while let Some(Outgoing { addr, packet }) = outgoing_rx.recv().await {
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

    fn send_all(&self, outgoing: Vec<Outgoing>) {
        for message in outgoing {
            if let Err(e) = self.outgoing_tx.send(message) {
                error!("Failed to queue packet for sending: {}", e);
            }
        }
    }

    fn dispatch(&mut self, message: HostMessage) {
        let HostMessage::PacketReceived { packet, addr } = message;
        let out = self.peer.handle_packet(packet, addr, get_timestamp());
        self.send_all(out);
    }

    /// Logs in with the coordinator, retrying with exponential backoff until
    /// accepted, rejected, or the retry budget is spent. With standby
    /// instances configured, every unanswered or rejected attempt moves on
    /// to the next instance.
    pub async fn connect(&mut self) -> ZoneResult<()> {
        self.start_tasks();
        let config = self.peer.config().clone();
        let mut backoff = Backoff::new(
            ZoneConfig::duration(config.reconnect_initial_ms),
            ZoneConfig::duration(config.reconnect_max_ms),
        );

        loop {
            info!("Logging in with {}", self.peer.coordinator());
            self.send_all(vec![self.peer.login_packet()]);

            let deadline = Instant::now() + ZoneConfig::duration(config.request_timeout_ms);
            while let Ok(Some(message)) = timeout(
                deadline.saturating_duration_since(Instant::now()),
                self.host_rx.recv(),
            )
            .await
            {
                let HostMessage::PacketReceived { packet, addr } = message;
                if addr == self.peer.coordinator() {
                    if let Packet::LoginRejected { reason } = &packet {
                        if !self.peer.has_standbys() {
                            return Err(ZoneError::Unavailable(reason.clone()));
                        }
                        warn!("{} rejected the login: {}", addr, reason);
                        break;
                    }
                }
                let accepted = matches!(packet, Packet::LoginAccepted { .. });
                self.dispatch(HostMessage::PacketReceived { packet, addr });
                if accepted && !self.peer.needs_login() {
                    return Ok(());
                }
            }

            if self.peer.has_standbys() {
                self.peer.fail_over();
            }
            match backoff.next_delay() {
                Some(delay) => {
                    warn!("No login from coordinator; retrying in {:?}", delay);
                    sleep(delay).await;
                }
                None => {
                    error!("Giving up on {}", self.peer.coordinator());
                    return Err(ZoneError::Timeout(config.reconnect_max_ms));
                }
            }
        }
    }

    /// Logs in, then simulates and serves until the drain token fires. The
    /// drain phase unregisters every subject before disconnecting.
    pub async fn run(&mut self, mut drain: DrainToken) -> ZoneResult<()> {
        self.connect().await?;

        let mut rng = StdRng::from_entropy();
        let mut sim_tick = interval(SIM_TICK);
        let mut report_tick = interval(ZoneConfig::duration(self.peer.config().report_interval_ms));
        for tick in [&mut sim_tick, &mut report_tick] {
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        }

        loop {
            if self.peer.needs_login() {
                warn!("Coordinator lost this host; logging in again");
                self.connect().await?;
            }

            tokio::select! {
                message = self.host_rx.recv() => {
                    match message {
                        Some(message) => self.dispatch(message),
                        None => break,
                    }
                },

                _ = sim_tick.tick() => {
                    let out = self.peer.tick(SIM_TICK.as_secs_f32(), get_timestamp(), &mut rng);
                    self.send_all(out);
                },

                _ = report_tick.tick() => {
                    let out = self.peer.report(get_timestamp());
                    self.send_all(out);
                },

                _ = drain.drained() => {
                    info!("Drain requested");
                    break;
                }
            }
        }

        self.drain().await
    }

    async fn drain(&mut self) -> ZoneResult<()> {
        let out = self.peer.begin_drain(get_timestamp());
        self.send_all(out);

        let deadline = Instant::now()
            + ZoneConfig::duration(self.peer.config().drain_timeout_ms);
        let mut report_tick = interval(ZoneConfig::duration(self.peer.config().request_timeout_ms));
        report_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while !self.peer.is_drained() {
            tokio::select! {
                message = self.host_rx.recv() => {
                    match message {
                        Some(message) => self.dispatch(message),
                        None => break,
                    }
                },

                _ = report_tick.tick() => {
                    let out = self.peer.report(get_timestamp());
                    self.send_all(out);
                },

                _ = tokio::time::sleep_until(deadline) => {
                    warn!("Drain timed out with handoffs still open");
                    break;
                }
            }
        }
        debug!("Drain finished");

        // Sent inline so it leaves before the runtime shuts down.
        let Outgoing { addr, packet } = self.peer.disconnect_packet();
        self.socket.send_to(&encode(&packet)?, addr).await?;
        info!("Disconnected from {}", addr);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::transport::drain_channel;
    use shared::HostId;

    fn quick_config() -> ZoneConfig {
        ZoneConfig {
            request_timeout_ms: 100,
            reconnect_initial_ms: 20,
            reconnect_max_ms: 60,
            drain_timeout_ms: 200,
            ..ZoneConfig::default()
        }
    }

    /// Answers the first datagram it receives with `reply`.
    async fn fake_coordinator(reply: Packet) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM];
            let (_, from) = socket.recv_from(&mut buffer).await.unwrap();
            socket
                .send_to(&encode(&reply).unwrap(), from)
                .await
                .unwrap();
            // Keep the socket open for the disconnect.
            let _ = socket.recv_from(&mut buffer).await;
        });
        addr
    }

    #[tokio::test]
    async fn test_invalid_coordinator_address() {
        let result = Host::new("127.0.0.1:0", "not-an-address", quick_config(), 1).await;
        assert!(matches!(result, Err(ZoneError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_connect_accepted() {
        let coordinator = fake_coordinator(Packet::LoginAccepted {
            host_id: HostId(2),
            settings: vec![],
        })
        .await;
        let mut host = Host::new("127.0.0.1:0", &coordinator.to_string(), quick_config(), 3)
            .await
            .unwrap();

        host.connect().await.unwrap();
        assert_eq!(host.peer().host_id(), Some(HostId(2)));
        assert_eq!(host.peer().world().len(), 3);
    }

    #[tokio::test]
    async fn test_connect_rejected() {
        let coordinator = fake_coordinator(Packet::LoginRejected {
            reason: "Coordinator full".to_string(),
        })
        .await;
        let mut host = Host::new("127.0.0.1:0", &coordinator.to_string(), quick_config(), 1)
            .await
            .unwrap();

        let result = host.connect().await;
        assert!(matches!(result, Err(ZoneError::Unavailable(reason)) if reason == "Coordinator full"));
    }

    #[tokio::test]
    async fn test_connect_gives_up_after_backoff() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let coordinator = silent.local_addr().unwrap();
        let mut host = Host::new("127.0.0.1:0", &coordinator.to_string(), quick_config(), 1)
            .await
            .unwrap();

        let result = host.connect().await;
        assert!(matches!(result, Err(ZoneError::Timeout(60))));
    }

    #[tokio::test]
    async fn test_blank_coordinator_entry() {
        let result = Host::new("127.0.0.1:0", "127.0.0.1:8080,", quick_config(), 1).await;
        assert!(matches!(result, Err(ZoneError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_connect_fails_over_to_standby() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let standby = fake_coordinator(Packet::LoginAccepted {
            host_id: HostId(4),
            settings: vec![],
        })
        .await;
        let coordinators = format!("{},{}", silent.local_addr().unwrap(), standby);
        let mut host = Host::new("127.0.0.1:0", &coordinators, quick_config(), 1)
            .await
            .unwrap();

        host.connect().await.unwrap();
        assert_eq!(host.peer().coordinator(), standby);
        assert_eq!(host.peer().host_id(), Some(HostId(4)));
    }

    #[tokio::test]
    async fn test_run_stops_on_drain() {
        let coordinator = fake_coordinator(Packet::LoginAccepted {
            host_id: HostId(1),
            settings: vec![],
        })
        .await;
        let mut host = Host::new("127.0.0.1:0", &coordinator.to_string(), quick_config(), 1)
            .await
            .unwrap();

        let (trigger, drain) = drain_channel();
        let handle = tokio::spawn(async move { host.run(drain).await });
        sleep(Duration::from_millis(150)).await;
        trigger.trigger();

        let result = timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
        assert!(result.is_ok());
    }
}
