//! UDP discovery step. The EVSE answers one SDP request on port 15118;
//! the EV multicasts a request on the link and waits for the answer.

use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::error::RthError;
use v2gtp::{SdpRole, SdpMessage, SECURITY_NONE, TRANSPORT_TCP};

pub const SDP_PORT: u16 = 15118;
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);
const RECV_BUF: usize = 64;

/// Where the EVSE says its relay endpoint lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveredEndpoint {
    pub address: Ipv6Addr,
    pub port: u16,
}

/// EVSE side: wait for one discovery request and answer it with our relay
/// endpoint. The listener is bound once at startup and reused, so a
/// restarted session does not race the old socket's linger.
pub async fn serve_once(
    listener: &UdpSocket,
    local_ipv6: Ipv6Addr,
    tcp_port: u16,
) -> Result<(), RthError> {
    let mut buf = [0u8; RECV_BUF];
    let (n, peer) = timeout(EXCHANGE_TIMEOUT, listener.recv_from(&mut buf))
        .await
        .map_err(|_| RthError::Timeout)?
        .map_err(RthError::UdpIo)?;
    log::info!("SDP request from {peer}");

    match v2gtp::parse(&buf[..n], SdpRole::Evse).map_err(RthError::Sdp)? {
        SdpMessage::Request(req) => {
            log::debug!(
                "SDP request security {:#04x} transport {:#04x}",
                req.security,
                req.transport
            );
        }
        SdpMessage::Response(_) => unreachable!("role filter rejects responses"),
    }

    let reply = v2gtp::build_response(local_ipv6, tcp_port, SECURITY_NONE, TRANSPORT_TCP);
    listener
        .send_to(&reply, peer)
        .await
        .map_err(RthError::UdpIo)?;
    log::info!("SDP response sent to {peer}");
    Ok(())
}

/// EV side: multicast a discovery request to all link nodes and wait for
/// the EVSE's answer on the same socket.
pub async fn discover(scope_id: u32) -> Result<DiscoveredEndpoint, RthError> {
    let sock = UdpSocket::bind("[::]:0").await.map_err(RthError::SocketBind)?;
    let dest = SocketAddr::V6(SocketAddrV6::new(
        Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1),
        SDP_PORT,
        0,
        scope_id,
    ));
    let request = v2gtp::build_request(SECURITY_NONE, TRANSPORT_TCP);
    sock.send_to(&request, dest).await.map_err(RthError::UdpIo)?;
    log::info!("SDP request multicast to {dest}");

    let mut buf = [0u8; RECV_BUF];
    let (n, peer) = timeout(EXCHANGE_TIMEOUT, sock.recv_from(&mut buf))
        .await
        .map_err(|_| RthError::Timeout)?
        .map_err(RthError::UdpIo)?;

    match v2gtp::parse(&buf[..n], SdpRole::Ev).map_err(RthError::Sdp)? {
        SdpMessage::Response(rsp) => {
            log::info!(
                "SDP response from {peer}: endpoint [{}]:{}",
                rsp.address,
                rsp.port
            );
            Ok(DiscoveredEndpoint {
                address: rsp.address,
                port: rsp.port,
            })
        }
        SdpMessage::Request(_) => unreachable!("role filter rejects requests"),
    }
}
