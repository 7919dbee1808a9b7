//! TCP relay over the broker. Each station terminates one TCP socket
//! locally (the EVSE listens, the EV connects out) and forwards the byte
//! stream as hex-encoded MQTT payloads on its own data topic, taking the
//! peer's bytes from the shared inbox.

use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};

use crate::error::RthError;
use crate::statics::RelayTx;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const SOCKET_BUF: usize = 4096;

/// Relay link lifecycle. A drop on either end returns to Disconnected and
/// the loop re-arms rather than tearing the task down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Disconnected,
    Connected,
}

/// Everything a relay task needs, shared with the orchestrator. Outbound
/// chunks go into a channel; the orchestrator owns the task that drains
/// it onto the broker.
#[derive(Clone)]
pub struct RelayContext {
    pub outbound: RelayTx,
    /// Hex payloads delivered from the peer station's data topic.
    pub inbox: Arc<Mutex<Option<String>>>,
    pub shutdown: Arc<AtomicBool>,
    pub relay_port: u16,
}

impl RelayContext {
    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    async fn take_inbox(&self) -> Option<String> {
        self.inbox.lock().await.take()
    }

    async fn publish_chunk(&self, data: &[u8]) {
        if self.outbound.send(hex::encode(data)).await.is_err() {
            log::error!("Relay publish channel closed");
        }
    }
}

/// EVSE side. Accept one client at a time on the relay port; relay bytes
/// both ways until the client drops, then accept again.
pub async fn server_task(ctx: RelayContext) -> Result<(), RthError> {
    let listener = TcpListener::bind(("::", ctx.relay_port))
        .await
        .map_err(RthError::SocketBind)?;
    log::info!("Relay server listening on port {}", ctx.relay_port);

    let mut link = LinkState::Disconnected;
    let mut session: Option<TcpStream> = None;
    while !ctx.stopping() {
        match link {
            LinkState::Disconnected => match timeout(POLL_INTERVAL, listener.accept()).await {
                Ok(Ok((stream, peer))) => {
                    log::info!("Relay client connected from {peer}");
                    session = Some(stream);
                    link = LinkState::Connected;
                }
                Ok(Err(e)) => {
                    log::error!("Relay accept failed {e:?}");
                    sleep(RECONNECT_DELAY).await;
                }
                Err(_) => {}
            },
            LinkState::Connected => {
                if let Some(stream) = session.take() {
                    serve_client(&ctx, stream).await;
                }
                log::info!("Relay client gone, accepting again");
                link = LinkState::Disconnected;
            }
        }
    }
    Ok(())
}

/// One accepted connection: local reads go out on MQTT, inbox payloads go
/// down the socket.
async fn serve_client(ctx: &RelayContext, mut stream: TcpStream) {
    let mut buf = [0u8; SOCKET_BUF];
    while !ctx.stopping() {
        match timeout(POLL_INTERVAL, stream.read(&mut buf)).await {
            Ok(Ok(0)) => return,
            Ok(Ok(n)) => {
                log::debug!("Relay rx {n} bytes from local socket");
                ctx.publish_chunk(&buf[..n]).await;
            }
            Ok(Err(e)) => {
                log::error!("Relay socket read failed {e:?}");
                return;
            }
            Err(_) => {}
        }
        if let Some(payload) = ctx.take_inbox().await {
            match hex::decode(payload.trim()) {
                Ok(data) => {
                    if let Err(e) = stream.write_all(&data).await {
                        log::error!("Relay socket write failed {e:?}");
                        return;
                    }
                }
                Err(e) => log::error!("{}", RthError::RelayDecode(e)),
            }
        }
    }
}

/// EV side. Connect out to the endpoint learned from discovery; forward
/// inbox payloads into the socket and socket bytes back onto MQTT.
/// Reconnects until shutdown.
pub async fn client_task(ctx: RelayContext, address: Ipv6Addr, port: u16) -> Result<(), RthError> {
    let mut link = LinkState::Disconnected;
    let mut session: Option<TcpStream> = None;
    while !ctx.stopping() {
        match link {
            LinkState::Disconnected => match TcpStream::connect((address, port)).await {
                Ok(stream) => {
                    log::info!("Relay connected to [{address}]:{port}");
                    session = Some(stream);
                    link = LinkState::Connected;
                }
                Err(e) => {
                    log::error!(
                        "Relay endpoint [{address}]:{port}: {}",
                        RthError::SocketConnect(e)
                    );
                    sleep(RECONNECT_DELAY).await;
                }
            },
            LinkState::Connected => {
                if let Some(stream) = session.take() {
                    drive_client(&ctx, stream).await;
                }
                log::info!("Relay link dropped, reconnecting");
                link = LinkState::Disconnected;
            }
        }
    }
    Ok(())
}

async fn drive_client(ctx: &RelayContext, mut stream: TcpStream) {
    let mut buf = [0u8; SOCKET_BUF];
    while !ctx.stopping() {
        if let Some(payload) = ctx.take_inbox().await {
            let data = match hex::decode(payload.trim()) {
                Ok(data) => data,
                Err(e) => {
                    log::error!("{}", RthError::RelayDecode(e));
                    continue;
                }
            };
            if let Err(e) = stream.write_all(&data).await {
                log::error!("Relay socket write failed {e:?}");
                return;
            }
        }
        match timeout(POLL_INTERVAL, stream.read(&mut buf)).await {
            Ok(Ok(0)) => return,
            Ok(Ok(n)) => {
                log::debug!("Relay rx {n} bytes from local socket");
                ctx.publish_chunk(&buf[..n]).await;
            }
            Ok(Err(e)) => {
                log::error!("Relay socket read failed {e:?}");
                return;
            }
            Err(_) => {}
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::statics::{self, RelayRx};

    fn context(inbox: Arc<Mutex<Option<String>>>) -> (RelayContext, RelayRx, Arc<AtomicBool>) {
        let (tx, rx) = statics::relay_channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let ctx = RelayContext {
            outbound: tx,
            inbox,
            shutdown: shutdown.clone(),
            relay_port: 0,
        };
        (ctx, rx, shutdown)
    }

    /// EVSE-role session: bytes written by the local TCP peer come out as
    /// one hex publish, and the same payload echoed back through the
    /// inbox is written to the peer byte-identical.
    #[tokio::test]
    async fn server_session_relays_bytes_both_ways() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let inbox = statics::mutex(None);
        let (ctx, mut published, shutdown) = context(inbox.clone());

        let mut local = TcpStream::connect(addr).await.unwrap();
        let (session, _) = listener.accept().await.unwrap();
        let relay = tokio::spawn(async move { serve_client(&ctx, session).await });

        let sent = [0x01u8, 0xFE, 0x90, 0x00];
        local.write_all(&sent).await.unwrap();
        let chunk = published.recv().await.unwrap();
        assert_eq!(chunk, "01fe9000");

        *inbox.lock().await = Some(chunk);
        let mut echoed = [0u8; 4];
        local.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, sent);

        shutdown.store(true, Ordering::Relaxed);
        relay.await.unwrap();
    }

    /// EV-role session: an inbox payload is decoded onto the socket, and
    /// the peer's reply is hex-published.
    #[tokio::test]
    async fn client_session_bridges_inbox_and_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let inbox = statics::mutex(Some("0a0b0c".to_string()));
        let (ctx, mut published, shutdown) = context(inbox);

        let stream = TcpStream::connect(addr).await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();
        let relay = tokio::spawn(async move { drive_client(&ctx, stream).await });

        let mut buf = [0u8; 3];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x0A, 0x0B, 0x0C]);

        peer.write_all(&[0xFF, 0x00]).await.unwrap();
        assert_eq!(published.recv().await.unwrap(), "ff00");

        shutdown.store(true, Ordering::Relaxed);
        relay.await.unwrap();
    }

    /// A malformed inbox payload is dropped; the session keeps relaying.
    #[tokio::test]
    async fn malformed_inbox_payload_keeps_session_alive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let inbox = statics::mutex(Some("not-hex".to_string()));
        let (ctx, _published, shutdown) = context(inbox.clone());

        let mut local = TcpStream::connect(addr).await.unwrap();
        let (session, _) = listener.accept().await.unwrap();
        let relay = tokio::spawn(async move { serve_client(&ctx, session).await });

        // Wait until the bad payload has been consumed, then feed a good one.
        while inbox.lock().await.is_some() {
            sleep(Duration::from_millis(5)).await;
        }
        *inbox.lock().await = Some("42".to_string());
        let mut buf = [0u8; 1];
        local.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x42]);

        shutdown.store(true, Ordering::Relaxed);
        relay.await.unwrap();
    }

    #[test]
    fn connect_failure_wraps_io_error() {
        let e = RthError::SocketConnect(std::io::ErrorKind::ConnectionRefused.into());
        assert!(e.to_string().contains("TCP connect failed"));
    }

    #[test]
    fn hex_round_trip_preserves_binary_payloads() {
        let payload = [0x01u8, 0xFE, 0x80, 0x01, 0x00, 0x00, 0x00, 0x02];
        let encoded = hex::encode(payload);
        assert_eq!(encoded, "01fe800100000002");
        assert_eq!(hex::decode(&encoded).unwrap(), payload);
    }

    #[test]
    fn whitespace_trimmed_before_decode() {
        assert_eq!(hex::decode("01ff\n".trim()).unwrap(), vec![0x01, 0xFF]);
    }
}
