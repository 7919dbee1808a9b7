//! Session orchestration. One cooperative loop drives the whole test
//! session: sample the coupler, publish status on a timer, advance the
//! state machine one step, then check for coupler removal and shutdown.

use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{sleep, timeout, Instant};

use crate::data_io::config::{AppConfig, DeviceRole};
use crate::data_io::mqtt::{broker_connect, MqttInbox, Publisher, HANDSHAKE_MARKER};
use crate::data_io::serial::FrameLink;
use crate::error::RthError;
use crate::j1772::{J1772, PilotState};
use crate::log_error;
use crate::relay::{self, RelayContext};
use crate::sdp::{self, DiscoveredEndpoint, SDP_PORT};
use crate::slac::PlcLink;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_PACING: Duration = Duration::from_secs(3);
const HANDSHAKE_MAX_RETRIES: u32 = 10;
/// EV stops waiting for the mutual confirmation after this many replies.
const HANDSHAKE_REPLY_COUNT: u32 = 3;
const REMOTE_SESSION: Duration = Duration::from_secs(90);
const PUBLISH_INTERVAL: Duration = Duration::from_millis(250);
const LOOP_SLEEP: Duration = Duration::from_millis(50);
/// Settle time after changing the pilot duty cycle.
const PWM_SETTLE: Duration = Duration::from_millis(100);

/// Session phases, strictly sequential. Error is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RthState {
    Init,
    NetworkCheck,
    BrokerCheck,
    Handshake,
    UnpluggedWait,
    PluggedIn,
    Sdp,
    TcpNetwork,
    Remote,
    Error,
}

impl RthState {
    pub fn name(&self) -> &'static str {
        use RthState::*;
        match self {
            Init => "INIT",
            NetworkCheck => "NETWORK_CHECK",
            BrokerCheck => "BROKER_CHECK",
            Handshake => "RTH_HANDSHAKE",
            UnpluggedWait => "UNPLUGGED_WAIT",
            PluggedIn => "PLUGGED_IN",
            Sdp => "SDP",
            TcpNetwork => "TCP_NETWORK",
            Remote => "REMOTE",
            Error => "ERROR",
        }
    }

    /// Successor on a successful step. Remote holds until the session
    /// timer ends the process.
    pub fn next(&self) -> RthState {
        use RthState::*;
        match self {
            Init => NetworkCheck,
            NetworkCheck => BrokerCheck,
            BrokerCheck => Handshake,
            Handshake => UnpluggedWait,
            UnpluggedWait => PluggedIn,
            PluggedIn => Sdp,
            Sdp => TcpNetwork,
            TcpNetwork => Remote,
            Remote => Remote,
            Error => Error,
        }
    }
}

/// Progress of the one-byte ready exchange. Written by the MQTT delivery
/// task, read by the orchestrator's handshake step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeState {
    #[default]
    None,
    FirstReceived,
    BothConfirmed,
}

/// True once the session has passed plug-in and the pilot reads as
/// removed or faulted.
pub fn coupler_removed(state: RthState, pilot: PilotState) -> bool {
    state >= RthState::PluggedIn && state != RthState::Error && pilot.is_disconnect()
}

pub struct Orchestrator<L: FrameLink> {
    config: Arc<AppConfig>,
    role: DeviceRole,
    /// IPv6 address advertised in the SDP response (EVSE only).
    local_ipv6: Ipv6Addr,
    state: RthState,
    j1772: J1772<L>,
    plc: Box<dyn PlcLink + Send>,
    inbox: MqttInbox,
    shutdown: Arc<AtomicBool>,
    publisher: Option<Publisher>,
    sdp_listener: Option<UdpSocket>,
    relay_server_up: bool,
    endpoint: Option<DiscoveredEndpoint>,
    remote_deadline: Option<Instant>,
}

impl<L: FrameLink> Orchestrator<L> {
    pub fn new(
        config: Arc<AppConfig>,
        local_ipv6: Ipv6Addr,
        j1772: J1772<L>,
        plc: Box<dyn PlcLink + Send>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let role = config.general.device_type;
        Self {
            config,
            role,
            local_ipv6,
            state: RthState::Init,
            j1772,
            plc,
            inbox: MqttInbox::new(),
            shutdown,
            publisher: None,
            sdp_listener: None,
            relay_server_up: false,
            endpoint: None,
            remote_deadline: None,
        }
    }

    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Build a relay context and spawn the task that drains its outbound
    /// channel onto this station's data topic.
    fn relay_context(&self) -> Option<RelayContext> {
        let publisher = self.publisher.clone()?;
        let topic = self.config.mqtt.data_topic(self.role).to_string();
        let (tx, mut rx) = crate::statics::relay_channel();
        tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                publisher.send_message(&topic, chunk).await;
            }
        });
        Some(RelayContext {
            outbound: tx,
            inbox: self.inbox.datapacket.clone(),
            shutdown: self.shutdown.clone(),
            relay_port: self.config.network.relay_port,
        })
    }

    /// Advance the session by at most one state. Steps that wait on the
    /// coupler return Ok without advancing so the outer loop keeps
    /// sampling and publishing.
    async fn step(&mut self) -> Result<(), RthError> {
        match self.state {
            RthState::Init => {
                log::info!("Starting remote test session as {}", self.role);
                self.state = self.state.next();
            }
            RthState::NetworkCheck => {
                self.probe_network().await?;
                self.state = self.state.next();
            }
            RthState::BrokerCheck => {
                let publisher =
                    broker_connect(&self.config.mqtt, self.role, self.inbox.clone()).await?;
                self.publisher = Some(publisher);
                self.state = self.state.next();
            }
            RthState::Handshake => {
                self.handshake().await?;
                self.state = self.state.next();
            }
            RthState::UnpluggedWait => {
                if self.unplugged_wait().await? {
                    self.state = self.state.next();
                }
            }
            RthState::PluggedIn => {
                if self.plc.init(self.role) && self.plc.connect() {
                    self.state = self.state.next();
                } else {
                    return Err(RthError::PlcLinkFailed);
                }
            }
            RthState::Sdp => {
                self.sdp_exchange().await?;
                self.state = self.state.next();
            }
            RthState::TcpNetwork => {
                if self.role == DeviceRole::Ev {
                    let ep = self.endpoint.expect("set by the SDP step");
                    if let Some(ctx) = self.relay_context() {
                        tokio::spawn(async move {
                            log_error!("RELAY CLIENT", relay::client_task(ctx, ep.address, ep.port).await);
                        });
                    }
                }
                self.remote_deadline = Some(Instant::now() + REMOTE_SESSION);
                log::info!("Remote mode now enabled");
                self.state = self.state.next();
            }
            RthState::Remote => {
                if let Some(deadline) = self.remote_deadline {
                    if Instant::now() >= deadline {
                        log::info!("Remote session timer expired, shutting down");
                        self.shutdown.store(true, Ordering::Relaxed);
                    }
                }
            }
            RthState::Error => {}
        }
        Ok(())
    }

    /// Reachability probe: a plain TCP connect to a known external
    /// address, bounded by a timeout.
    async fn probe_network(&self) -> Result<(), RthError> {
        let target = self.config.network.probe_addr.as_str();
        match timeout(PROBE_TIMEOUT, TcpStream::connect(target)).await {
            Ok(Ok(_)) => {
                log::info!("Network probe to {target} ok");
                Ok(())
            }
            Ok(Err(e)) => {
                log::error!("Network probe to {target} failed {e:?}");
                Err(RthError::NetworkUnreachable)
            }
            Err(_) => Err(RthError::NetworkUnreachable),
        }
    }

    /// One-byte ready exchange. The EVSE keeps offering its marker until
    /// the EV's reply arrives; the EV replies once it has seen the offer
    /// and declares success after a fixed number of replies.
    async fn handshake(&mut self) -> Result<(), RthError> {
        let publisher = self.publisher.clone().ok_or(RthError::HandshakeFailed)?;
        let topic = self.config.mqtt.data_topic(self.role).to_string();
        let mut retries = 0u32;
        let mut replies = 0u32;
        loop {
            if self.stopping() {
                return Err(RthError::Interrupted);
            }
            if retries > HANDSHAKE_MAX_RETRIES {
                return Err(RthError::HandshakeFailed);
            }
            let progress = *self.inbox.handshake.lock().await;
            match (self.role, progress) {
                (_, HandshakeState::BothConfirmed) => {
                    log::info!("Handshake with peer station complete");
                    return Ok(());
                }
                (DeviceRole::Evse, _) => {
                    log::info!("Handshake offer {retries}");
                    publisher.send_message(&topic, HANDSHAKE_MARKER).await;
                }
                (DeviceRole::Ev, HandshakeState::None) => {
                    log::info!("Waiting for handshake offer {retries}");
                }
                (DeviceRole::Ev, HandshakeState::FirstReceived) => {
                    log::info!("Handshake reply {replies}");
                    publisher.send_message(&topic, HANDSHAKE_MARKER).await;
                    replies += 1;
                    if replies >= HANDSHAKE_REPLY_COUNT {
                        *self.inbox.handshake.lock().await = HandshakeState::BothConfirmed;
                    }
                }
            }
            retries += 1;
            sleep(HANDSHAKE_PACING).await;
        }
    }

    /// Wait for the vehicle to plug in. Non-blocking: one observation per
    /// control-loop cycle, returns true once the plugged state is seen.
    async fn unplugged_wait(&mut self) -> Result<bool, RthError> {
        if self.role == DeviceRole::Evse {
            // Stand up discovery and relay endpoints before the vehicle
            // arrives so the EV never races them.
            if self.sdp_listener.is_none() {
                let sock = UdpSocket::bind(("::", SDP_PORT))
                    .await
                    .map_err(RthError::SocketBind)?;
                log::info!("SDP listener bound on port {SDP_PORT}");
                self.sdp_listener = Some(sock);
            }
            if !self.relay_server_up {
                if let Some(ctx) = self.relay_context() {
                    tokio::spawn(async move {
                        log_error!("RELAY SERVER", relay::server_task(ctx).await);
                    });
                    self.relay_server_up = true;
                }
            }
            match self.j1772.status.pilot_state {
                PilotState::B1 => {
                    log::info!("Vehicle detected, driving pilot to 5% duty");
                    self.j1772.set_duty_cycle(5.0).await;
                    sleep(PWM_SETTLE).await;
                }
                PilotState::B2 => return Ok(true),
                _ => {}
            }
        } else if self.j1772.status.pilot_state == PilotState::B2 {
            log::info!("Plugged in, oscillator seen");
            return Ok(true);
        }
        Ok(false)
    }

    async fn sdp_exchange(&mut self) -> Result<(), RthError> {
        match self.role {
            DeviceRole::Evse => {
                let listener = self.sdp_listener.as_ref().expect("bound in UnpluggedWait");
                sdp::serve_once(listener, self.local_ipv6, self.config.network.relay_port).await
            }
            DeviceRole::Ev => {
                let ep = sdp::discover(self.config.network.interface_index).await?;
                self.endpoint = Some(ep);
                Ok(())
            }
        }
    }

    async fn publish_measurements(&self) {
        let Some(publisher) = &self.publisher else {
            return;
        };
        match serde_json::to_string(&self.j1772.status).map_err(RthError::Serialise) {
            Ok(json) => {
                publisher
                    .send_message(self.config.mqtt.status_topic(self.role), json)
                    .await;
            }
            Err(e) => log::error!("{e}"),
        }
    }

    async fn publish_state(&self) {
        if let Some(publisher) = &self.publisher {
            publisher
                .send_message(self.config.mqtt.state_topic(self.role), self.state.name())
                .await;
        }
    }

    /// The primary control loop. Returns once the session ends, the
    /// coupler is pulled, a step fails or the operator interrupts.
    pub async fn run(&mut self) {
        // Measurements and state name run on independent timers with the
        // same period.
        let mut last_measurements: Option<Instant> = None;
        let mut last_state: Option<Instant> = None;
        loop {
            self.j1772.sample().await;

            if last_measurements.map_or(true, |t| t.elapsed() >= PUBLISH_INTERVAL) {
                self.publish_measurements().await;
                last_measurements = Some(Instant::now());
            }
            if last_state.map_or(true, |t| t.elapsed() >= PUBLISH_INTERVAL) {
                self.publish_state().await;
                last_state = Some(Instant::now());
            }

            if let Err(e) = self.step().await {
                log::error!("{} step failed: {e}", self.state.name());
                self.state = RthState::Error;
                break;
            }

            if coupler_removed(self.state, self.j1772.status.pilot_state) {
                log::warn!(
                    "Coupler removed in {} ({}), ending session",
                    self.state.name(),
                    self.j1772.status.pilot_state.name()
                );
                break;
            }

            if self.stopping() {
                log::info!("Shutdown flag set, ending session");
                break;
            }

            sleep(LOOP_SLEEP).await;
        }
        self.finish().await;
    }

    /// Orderly teardown: stop the oscillator, flag the relay tasks down
    /// and leave the broker cleanly.
    async fn finish(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if self.role == DeviceRole::Evse {
            self.j1772.set_pwm_enable(false).await;
        }
        if let Some(publisher) = &self.publisher {
            self.publish_measurements().await;
            self.publish_state().await;
            publisher.disconnect().await;
        }
        log::info!("Session ended in {}", self.state.name());
    }
}
