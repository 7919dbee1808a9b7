//! MQTT link between the two stations. One background task polls the
//! rumqttc event loop and sorts deliveries into the shared inbox; all
//! publishes funnel through [`Publisher`] so concurrent tasks serialize on
//! one client handle.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::app::HandshakeState;
use crate::data_io::config::{DeviceRole, MqttConfig};
use crate::error::RthError;
use crate::log_error;

/// Handshake marker exchanged on the data topics. Anything else on those
/// topics is a hex-encoded relay payload.
pub const HANDSHAKE_MARKER: &str = "1";

/// Cross-thread state written by the MQTT delivery task and read by the
/// orchestrator and relay tasks. Flag and buffer live behind one mutex
/// each so a payload is never observed half-written.
#[derive(Clone)]
pub struct MqttInbox {
    pub handshake: Arc<Mutex<HandshakeState>>,
    pub datapacket: Arc<Mutex<Option<String>>>,
}

impl MqttInbox {
    pub fn new() -> Self {
        Self {
            handshake: crate::statics::mutex(HandshakeState::None),
            datapacket: crate::statics::mutex(None),
        }
    }
}

/// Publish handle shared by the status timers and the relay tasks. The
/// underlying client is not assumed reentrant, so publishes serialize on
/// the mutex.
#[derive(Clone)]
pub struct Publisher {
    client: Arc<Mutex<AsyncClient>>,
}

impl Publisher {
    pub async fn send_message(&self, topic: &str, message: impl Into<Vec<u8>>) {
        let client = self.client.lock().await;
        log_error!(
            "MQTT SEND",
            client
                .publish(topic, QoS::AtLeastOnce, false, message)
                .await
                .map_err(RthError::MqttSend)
        );
    }

    pub async fn disconnect(&self) {
        let client = self.client.lock().await;
        if let Err(e) = client.disconnect().await {
            log::error!("MQTT disconnect failed {e:?}");
        }
    }
}

/// Connect and authenticate to the broker, subscribe to the peer station's
/// data topic and spawn the delivery task. Errors here fail the
/// BROKER_CHECK step.
pub async fn broker_connect(
    config: &MqttConfig,
    role: DeviceRole,
    inbox: MqttInbox,
) -> Result<Publisher, RthError> {
    log::info!(
        "Connecting to broker {}:{} as {}",
        config.broker_ip,
        config.broker_port,
        config.client_id
    );
    let mut mqttoptions = MqttOptions::new(
        config.client_id.clone(),
        config.broker_ip.clone(),
        config.broker_port,
    );
    mqttoptions.set_keep_alive(Duration::from_secs(5));
    mqttoptions.set_credentials(config.username.clone(), config.password.clone());
    mqttoptions.set_transport(rumqttc::Transport::Tcp);
    mqttoptions.set_clean_session(true);
    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);

    // Wait for the ConnAck so a refused connection fails the step instead
    // of being retried silently by the event loop.
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => break,
            Ok(_) => continue,
            Err(e) => return Err(RthError::MqttConnect(e)),
        }
    }

    client
        .subscribe(config.peer_data_topic(role), QoS::AtLeastOnce)
        .await
        .map_err(RthError::MqttSub)?;

    let topics = config.clone();
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(event) => handle_mqtt_event(event, &topics, &inbox).await,
                Err(e) => {
                    log::error!("MQTT event loop error {e:?}");
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    log::info!("Connected to broker and subscribed");
    Ok(Publisher {
        client: Arc::new(Mutex::new(client)),
    })
}

async fn handle_mqtt_event(event: Event, config: &MqttConfig, inbox: &MqttInbox) {
    match event {
        Event::Incoming(Packet::Publish(msg)) => {
            let payload = String::from_utf8_lossy(&msg.payload).to_string();
            dispatch_payload(&msg.topic, payload, config, inbox).await;
        }
        Event::Incoming(_) | Event::Outgoing(_) => {}
    }
}

async fn dispatch_payload(topic: &str, payload: String, config: &MqttConfig, inbox: &MqttInbox) {
    if topic == config.ev_message {
        if payload == HANDSHAKE_MARKER {
            // Reply handshake received from the EV.
            *inbox.handshake.lock().await = HandshakeState::BothConfirmed;
        } else {
            *inbox.datapacket.lock().await = Some(payload);
        }
    } else if topic == config.evse_message {
        if payload == HANDSHAKE_MARKER {
            // First handshake message received from the EVSE.
            *inbox.handshake.lock().await = HandshakeState::FirstReceived;
        } else {
            *inbox.datapacket.lock().await = Some(payload);
        }
    } else {
        log::warn!("Message arrived on invalid topic {topic}");
    }
}
