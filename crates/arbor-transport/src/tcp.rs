//! TCP transport
//!
//! Every connection gets a reader task and a writer task. The reader
//! decodes lines, settles the connection's role from its first frame and
//! pushes everything else onto the engine's event queue. The writer drains
//! the connection's queue, holding each message back by the link lag.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use arbor_core::{ArborError, ArborResult, ConnectionId, ConnectionRole, Message};
use arbor_runtime::{Event, EventSender, Inbound, RemotePeer};
use arbor_wire::{encode_line, LineDecoder};

use crate::{ConnectionRegistry, WriterReceiver};

/// Socket read chunk size
pub const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Accepts peer servers and clients
pub struct TcpTransport {
    listener: TcpListener,
    local_addr: SocketAddr,
    registry: ConnectionRegistry,
    events: EventSender,
    /// Lag applied to sends on accepted connections
    lag: Duration,
}

impl TcpTransport {
    /// Bind to a local address
    pub async fn bind(
        addr: SocketAddr,
        registry: ConnectionRegistry,
        events: EventSender,
        lag: Duration,
    ) -> ArborResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ArborError::TransportError(format!("bind {}: {}", addr, e)))?;
        let local_addr = listener.local_addr()?;

        Ok(TcpTransport {
            listener,
            local_addr,
            registry,
            events,
            lag,
        })
    }

    /// Get local address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start a background accept loop
    pub fn start_accept_loop(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(addr = %self.local_addr, "listening");
            loop {
                match self.listener.accept().await {
                    Ok((stream, addr)) => {
                        let id = spawn_connection(
                            stream,
                            addr,
                            None,
                            self.lag,
                            self.registry.clone(),
                            self.events.clone(),
                        );
                        debug!(connection = %id, %addr, "accepted connection");
                    }
                    Err(e) => {
                        warn!("accept error: {}", e);
                    }
                }
                if self.events.is_closed() {
                    break; // Engine gone
                }
            }
        })
    }
}

/// Dial a peer server and ask the engine to open the handshake
pub async fn dial(
    remote: &RemotePeer,
    registry: &ConnectionRegistry,
    events: &EventSender,
) -> ArborResult<ConnectionId> {
    let stream = TcpStream::connect(remote.address())
        .await
        .map_err(|e| ArborError::TransportError(format!("connect {}: {}", remote, e)))?;
    let addr = stream.peer_addr()?;

    let id = spawn_connection(
        stream,
        addr,
        Some(ConnectionRole::Server),
        Duration::from_millis(remote.lag),
        registry.clone(),
        events.clone(),
    );
    registry.send(
        id,
        Message::Hello {
            role: ConnectionRole::Server,
        },
    )?;
    events.push(Inbound::new(id, Event::PeerDialed { lag: remote.lag }))?;

    info!(connection = %id, %remote, "dialed peer");
    Ok(id)
}

fn spawn_connection(
    stream: TcpStream,
    addr: SocketAddr,
    role: Option<ConnectionRole>,
    lag: Duration,
    registry: ConnectionRegistry,
    events: EventSender,
) -> ConnectionId {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(%addr, "set_nodelay failed: {}", e);
    }
    let (id, writer_rx) = registry.register(addr, role, lag);
    let (read_half, write_half) = stream.into_split();

    tokio::spawn(write_loop(id, write_half, writer_rx, lag));
    tokio::spawn(read_loop(id, read_half, role, registry, events));
    id
}

async fn write_loop(
    id: ConnectionId,
    mut writer: OwnedWriteHalf,
    mut queue: WriterReceiver,
    lag: Duration,
) {
    while let Some(queued) = queue.recv().await {
        tokio::time::sleep_until(queued.sent_at + lag).await;

        let line = match encode_line(&queued.message) {
            Ok(line) => line,
            Err(e) => {
                warn!(connection = %id, kind = queued.message.kind(), "encode failed: {}", e);
                continue;
            }
        };
        if let Err(e) = writer.write_all(&line).await {
            warn!(connection = %id, "write failed: {}", e);
            break;
        }
    }

    let _ = writer.shutdown().await;
    debug!(connection = %id, "writer stopped");
}

async fn read_loop(
    id: ConnectionId,
    mut reader: OwnedReadHalf,
    mut role: Option<ConnectionRole>,
    registry: ConnectionRegistry,
    events: EventSender,
) {
    let mut decoder = LineDecoder::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    'read: loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(connection = %id, "read error: {}", e);
                break;
            }
        };
        decoder.extend(&buf[..n]);

        while let Some(decoded) = decoder.next_message() {
            let message = match decoded {
                Ok(message) => message,
                Err(e) => {
                    warn!(connection = %id, "dropping line: {}", e);
                    continue;
                }
            };

            let event = match admit(role, message) {
                Admission::Negotiated(announced) => {
                    role = Some(announced);
                    if let Err(e) = registry.set_role(id, announced) {
                        warn!(connection = %id, "role update failed: {}", e);
                    }
                    info!(connection = %id, role = ?announced, "connection role settled");
                    match announced {
                        ConnectionRole::Client => Event::ClientAttached,
                        ConnectionRole::Server => continue,
                    }
                }
                Admission::Forward(message) => Event::Message(message),
                Admission::Ignore(reason) => {
                    warn!(connection = %id, "ignoring frame: {}", reason);
                    continue;
                }
                Admission::Reject(reason) => {
                    warn!(connection = %id, "closing connection: {}", reason);
                    break 'read;
                }
            };

            if events.push(Inbound::new(id, event)).is_err() {
                break 'read; // Engine gone
            }
        }
    }

    registry.unregister(id);
    let _ = events.push(Inbound::new(id, Event::Closed));
    debug!(connection = %id, "reader stopped");
}

/// What the connection boundary does with a decoded frame
#[derive(Debug, PartialEq, Eq)]
enum Admission {
    /// The remote announced its role
    Negotiated(ConnectionRole),
    Forward(Message),
    Ignore(&'static str),
    /// Protocol violation; drop the connection
    Reject(&'static str),
}

fn admit(role: Option<ConnectionRole>, message: Message) -> Admission {
    match (role, message) {
        (None, Message::Hello { role }) => Admission::Negotiated(role),
        (None, _) => Admission::Reject("first frame must be hello"),
        (Some(_), Message::Hello { .. }) => Admission::Ignore("repeated hello"),
        (Some(ConnectionRole::Server), message) => Admission::Forward(message),
        (Some(ConnectionRole::Client), message @ (Message::Activity(_) | Message::WakeUp)) => {
            Admission::Forward(message)
        }
        (Some(ConnectionRole::Client), _) => {
            Admission::Ignore("clients may only send activity and wake-up")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_core::{Activity, NodeState, PeerId};
    use arbor_runtime::{
        event_queue, spawn_engine, Engine, EngineConfig, EngineHandle, EngineSnapshot,
    };
    use arbor_wire::decode_line;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::sync::watch;

    struct TestNode {
        addr: SocketAddr,
        registry: ConnectionRegistry,
        events: EventSender,
        engine: EngineHandle,
    }

    async fn start_node(peer: u64, lag_floor: u64) -> TestNode {
        let (events, rx) = event_queue();
        let registry = ConnectionRegistry::new();
        let transport = TcpTransport::bind(
            "127.0.0.1:0".parse().unwrap(),
            registry.clone(),
            events.clone(),
            Duration::from_millis(lag_floor),
        )
        .await
        .unwrap();
        let addr = transport.local_addr();
        transport.start_accept_loop();

        let engine = Engine::new(PeerId::new(peer), EngineConfig { lag_floor });
        let engine = spawn_engine(engine, rx, registry.clone());
        TestNode {
            addr,
            registry,
            events,
            engine,
        }
    }

    async fn dial_node(from: &TestNode, to: &TestNode, lag: u64) -> ConnectionId {
        let remote = RemotePeer {
            host: "127.0.0.1".to_string(),
            port: to.addr.port(),
            lag,
        };
        dial(&remote, &from.registry, &from.events).await.unwrap()
    }

    async fn wait_for(
        rx: &mut watch::Receiver<EngineSnapshot>,
        pred: impl Fn(&EngineSnapshot) -> bool,
    ) -> EngineSnapshot {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let snapshot = rx.borrow_and_update().clone();
                if pred(&snapshot) {
                    return snapshot;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("node did not reach the expected state")
    }

    async fn attach_client(node: &TestNode) -> (BufReader<OwnedReadHalf>, OwnedWriteHalf) {
        let stream = TcpStream::connect(node.addr).await.unwrap();
        let (read_half, mut write_half) = stream.into_split();
        let hello = encode_line(&Message::Hello {
            role: ConnectionRole::Client,
        })
        .unwrap();
        write_half.write_all(&hello).await.unwrap();
        (BufReader::new(read_half), write_half)
    }

    #[test]
    fn test_admission_rules() {
        let hello = |role| Message::Hello { role };
        assert_eq!(
            admit(None, hello(ConnectionRole::Client)),
            Admission::Negotiated(ConnectionRole::Client)
        );
        assert!(matches!(
            admit(None, Message::WakeUp),
            Admission::Reject(_)
        ));
        assert!(matches!(
            admit(Some(ConnectionRole::Server), hello(ConnectionRole::Server)),
            Admission::Ignore(_)
        ));
        assert_eq!(
            admit(Some(ConnectionRole::Server), Message::Connect { level: 1 }),
            Admission::Forward(Message::Connect { level: 1 })
        );
        assert_eq!(
            admit(Some(ConnectionRole::Client), Message::WakeUp),
            Admission::Forward(Message::WakeUp)
        );
        assert!(matches!(
            admit(
                Some(ConnectionRole::Client),
                Message::Handshake {
                    peer: PeerId::new(1),
                    lag: 0
                }
            ),
            Admission::Ignore(_)
        ));
    }

    #[tokio::test]
    async fn test_tcp_handshake() {
        let mut a = start_node(1, 30).await;
        let mut b = start_node(2, 0).await;

        let id = dial_node(&a, &b, 10).await;
        assert_eq!(
            a.registry.get(id).unwrap().role,
            Some(ConnectionRole::Server)
        );

        wait_for(&mut a.engine.snapshots, |s| s.unclassified == 1).await;
        let snapshot = wait_for(&mut b.engine.snapshots, |s| s.unclassified == 1).await;
        assert_eq!(snapshot.state, NodeState::Sleeping);
        assert_eq!(b.registry.len(), 1);
    }

    #[tokio::test]
    async fn test_client_must_say_hello_first() {
        let mut node = start_node(1, 0).await;
        let mut stream = TcpStream::connect(node.addr).await.unwrap();
        stream
            .write_all(&encode_line(&Message::WakeUp).unwrap())
            .await
            .unwrap();

        // The node drops us: reads hit EOF.
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        let snapshot = wait_for(&mut node.engine.snapshots, |s| s.stats.events_processed >= 1).await;
        assert_eq!(snapshot.clients, 0);
        assert_eq!(snapshot.state, NodeState::Sleeping);
    }

    #[tokio::test]
    async fn test_tcp_triangle_end_to_end() {
        let mut a = start_node(1, 0).await;
        let mut b = start_node(2, 0).await;
        let mut c = start_node(3, 0).await;

        dial_node(&a, &b, 10).await;
        dial_node(&b, &c, 20).await;
        dial_node(&c, &a, 15).await;
        for node in [&mut a, &mut b, &mut c] {
            wait_for(&mut node.engine.snapshots, |s| s.unclassified == 2).await;
        }

        let (_client_a_reader, mut client_a) = attach_client(&a).await;
        let (mut client_c, _client_c_writer) = attach_client(&c).await;
        wait_for(&mut a.engine.snapshots, |s| s.clients == 1).await;
        wait_for(&mut c.engine.snapshots, |s| s.clients == 1).await;

        // A client asks B to start the construction.
        let (_client_b_reader, mut client_b) = attach_client(&b).await;
        client_b
            .write_all(&encode_line(&Message::WakeUp).unwrap())
            .await
            .unwrap();

        let (pa, pb, pc) = (PeerId::new(1), PeerId::new(2), PeerId::new(3));
        let sa = wait_for(&mut a.engine.snapshots, |s| s.branches == vec![pb, pc]).await;
        let sb = wait_for(&mut b.engine.snapshots, |s| s.rejected == vec![pc]).await;
        let sc = wait_for(&mut c.engine.snapshots, |s| s.rejected == vec![pb]).await;
        assert_eq!(sa.rejected, Vec::<PeerId>::new());
        assert_eq!(sb.branches, vec![pa]);
        assert_eq!(sc.branches, vec![pa]);

        let activity = Message::Activity(Activity::new(pa, "hello over the tree"));
        client_a
            .write_all(&encode_line(&activity).unwrap())
            .await
            .unwrap();

        let mut line = String::new();
        tokio::time::timeout(Duration::from_secs(5), client_c.read_line(&mut line))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decode_line(line.trim_end().as_bytes()).unwrap(), activity);
    }
}
