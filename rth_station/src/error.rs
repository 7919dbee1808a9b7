use rumqttc::ClientError;

#[allow(dead_code)]
#[derive(Debug)]
pub enum RthError {
    SerialOpen(serialport::Error),
    SerialWrite(std::io::Error),
    MqttConnect(rumqttc::ConnectionError),
    MqttSub(ClientError),
    MqttSend(ClientError),
    Sdp(v2gtp::V2gtpError),
    SocketBind(std::io::Error),
    SocketConnect(std::io::Error),
    UdpIo(std::io::Error),
    NetworkUnreachable,
    HandshakeFailed,
    PlcLinkFailed,
    Timeout,
    Interrupted,
    RelayDecode(hex::FromHexError),
    Serialise(serde_json::Error),
}

impl std::error::Error for RthError {}
impl std::fmt::Display for RthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use RthError::*;
        match self {
            SerialOpen(e) => write!(f, "Serial port open failed {e:?}"),
            SerialWrite(e) => write!(f, "Serial write failed {e:?}"),
            MqttConnect(e) => write!(f, "MQTT broker connect failed {e:?}"),
            MqttSub(e) => write!(f, "MQTT subscription failed {e:?}"),
            MqttSend(e) => write!(f, "MQTT send failed {e:?}"),
            Sdp(e) => write!(f, "SDP message rejected {e}"),
            SocketBind(e) => write!(f, "Socket bind failed {e:?}"),
            SocketConnect(e) => write!(f, "TCP connect failed {e:?}"),
            UdpIo(e) => write!(f, "UDP send/receive failed {e:?}"),
            NetworkUnreachable => write!(f, "Network reachability probe failed"),
            HandshakeFailed => write!(f, "Could not establish handshake with other station"),
            PlcLinkFailed => write!(f, "Powerline link establishment failed"),
            Timeout => write!(f, "Timeout"),
            Interrupted => write!(f, "Interrupted by operator"),
            RelayDecode(e) => write!(f, "Relay payload hex decode failed {e:?}"),
            Serialise(e) => write!(f, "json serialise {e:?}"),
        }
    }
}
