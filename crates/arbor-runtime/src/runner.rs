//! Engine loop
//!
//! The single consumer of the event queue. It owns the [`Engine`] and is
//! the only place where engine state is touched once a node is running.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use arbor_core::{ArborResult, ConnectionId, Message};

use crate::{Disposition, Engine, EngineSnapshot, EventReceiver};

/// Outbound side of the connection layer
pub trait Transmit: Send + Sync + 'static {
    /// Queue a message for writing on `connection`. Must not block.
    fn transmit(&self, connection: ConnectionId, message: Message) -> ArborResult<()>;
}

impl<T: Transmit> Transmit for Arc<T> {
    fn transmit(&self, connection: ConnectionId, message: Message) -> ArborResult<()> {
        (**self).transmit(connection, message)
    }
}

/// Drive `engine` until every event producer is gone, returning it.
pub async fn run_engine<T: Transmit>(
    mut engine: Engine,
    mut events: EventReceiver,
    transmit: T,
    snapshots: watch::Sender<EngineSnapshot>,
) -> Engine {
    info!(peer = %engine.local_id(), "engine started");

    while let Some(inbound) = events.next().await {
        trace!(connection = %inbound.connection, event = ?inbound.event, "handling event");

        match engine.handle(inbound) {
            Disposition::Done => events.progressed(),
            Disposition::Deferred(inbound) => events.requeue(inbound),
        }

        while let Some(out) = engine.pop_outgoing() {
            let kind = out.message.kind();
            if let Err(e) = transmit.transmit(out.connection, out.message) {
                warn!(connection = %out.connection, kind, "send failed: {}", e);
            }
        }

        snapshots.send_replace(engine.snapshot());
    }

    debug!(pending = events.pending(), "event queue closed");
    info!(peer = %engine.local_id(), "engine stopped");
    engine
}

/// A running engine task
pub struct EngineHandle {
    /// Latest published state of the engine
    pub snapshots: watch::Receiver<EngineSnapshot>,
    pub join: JoinHandle<Engine>,
}

/// Spawn [`run_engine`] on the current tokio runtime
pub fn spawn_engine<T: Transmit>(engine: Engine, events: EventReceiver, transmit: T) -> EngineHandle {
    let (tx, rx) = watch::channel(engine.snapshot());
    let join = tokio::spawn(run_engine(engine, events, transmit, tx));
    EngineHandle {
        snapshots: rx,
        join,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    use arbor_core::{Activity, ArborError, Identifier, NodeState, PeerId};
    use parking_lot::Mutex;

    use crate::{event_queue, EngineConfig, Event, EventSender, Inbound};

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(ConnectionId, Message)>>,
    }

    impl Transmit for Recorder {
        fn transmit(&self, connection: ConnectionId, message: Message) -> ArborResult<()> {
            self.sent.lock().push((connection, message));
            Ok(())
        }
    }

    /// Routes each local connection to the queue of the node on the other end
    #[derive(Default)]
    struct Loopback {
        routes: HashMap<ConnectionId, (EventSender, ConnectionId)>,
    }

    impl Transmit for Loopback {
        fn transmit(&self, connection: ConnectionId, message: Message) -> ArborResult<()> {
            let (queue, remote) = self
                .routes
                .get(&connection)
                .ok_or(ArborError::UnknownConnection(connection))?;
            queue.push(Inbound::message(*remote, message))
        }
    }

    async fn wait_for(
        rx: &mut watch::Receiver<EngineSnapshot>,
        pred: impl Fn(&EngineSnapshot) -> bool,
    ) -> EngineSnapshot {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let snapshot = rx.borrow_and_update().clone();
                if pred(&snapshot) {
                    return snapshot;
                }
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("engine did not reach the expected state")
    }

    #[tokio::test]
    async fn test_loop_transmits_and_publishes() {
        let (tx, rx) = event_queue();
        let recorder = Arc::new(Recorder::default());
        let engine = Engine::new(PeerId::new(1), EngineConfig::default());
        let mut handle = spawn_engine(engine, rx, recorder.clone());

        let conn = ConnectionId::new(4);
        tx.push(Inbound::message(
            conn,
            Message::Handshake {
                peer: PeerId::new(2),
                lag: 12,
            },
        ))
        .unwrap();

        let snapshot = wait_for(&mut handle.snapshots, |s| s.unclassified == 1).await;
        assert_eq!(snapshot.state, NodeState::Sleeping);
        assert_eq!(
            recorder.sent.lock().as_slice(),
            &[(
                conn,
                Message::HandshakeAck {
                    peer: PeerId::new(1),
                    lag: 12
                }
            )]
        );

        drop(tx);
        let engine = handle.join.await.unwrap();
        assert_eq!(engine.edge(conn).unwrap().lag(), 12);
    }

    #[tokio::test]
    async fn test_deferred_connect_completes_after_wakeup() {
        let (tx, rx) = event_queue();
        let recorder = Arc::new(Recorder::default());
        let local = PeerId::new(1);
        let mut handle = spawn_engine(Engine::new(local, EngineConfig::default()), rx, recorder.clone());

        let (b, c) = (ConnectionId::new(1), ConnectionId::new(2));
        for (conn, peer, lag) in [(b, 2, 10), (c, 3, 20)] {
            tx.push(Inbound::message(
                conn,
                Message::Handshake {
                    peer: PeerId::new(peer),
                    lag,
                },
            ))
            .unwrap();
        }
        // C connects over an edge we have not classified yet; it stays
        // parked while our level is not above C's.
        tx.push(Inbound::message(c, Message::Connect { level: 0 })).unwrap();
        let snapshot = wait_for(&mut handle.snapshots, |s| s.stats.events_deferred >= 1).await;
        assert_eq!(snapshot.state, NodeState::Found);
        assert_eq!(snapshot.branches, vec![PeerId::new(2)]);

        // B merges with us and its Initiate raises our level, which lets
        // the parked Connect through as an absorb.
        tx.push(Inbound::message(b, Message::Connect { level: 0 })).unwrap();
        tx.push(Inbound::message(
            b,
            Message::Initiate {
                level: 1,
                fragment: Identifier::new(local, PeerId::new(2)),
                state: NodeState::Find,
            },
        ))
        .unwrap();
        let snapshot = wait_for(&mut handle.snapshots, |s| s.level == 1 && s.branches.len() == 2).await;
        assert_eq!(snapshot.branches, vec![PeerId::new(2), PeerId::new(3)]);
        assert!(recorder
            .sent
            .lock()
            .iter()
            .any(|(conn, m)| *conn == c && matches!(m, Message::Initiate { level: 1, .. })));
    }

    #[tokio::test]
    async fn test_loopback_triangle_converges_and_floods() {
        let peers = [PeerId::new(1), PeerId::new(2), PeerId::new(3)];
        let links = [(0usize, 1usize, 10u64), (1, 2, 20), (2, 0, 15)];

        let queues: Vec<_> = (0..3).map(|_| event_queue()).collect();
        let senders: Vec<EventSender> = queues.iter().map(|(tx, _)| tx.clone()).collect();
        let mut routers: Vec<Loopback> = (0..3).map(|_| Loopback::default()).collect();

        // Connection id on node `i` toward node `j` is `j + 1`.
        let conn_to = |j: usize| ConnectionId::new(j as u64 + 1);
        for &(a, b, _) in &links {
            routers[a]
                .routes
                .insert(conn_to(b), (senders[b].clone(), conn_to(a)));
            routers[b]
                .routes
                .insert(conn_to(a), (senders[a].clone(), conn_to(b)));
        }

        let mut handles = Vec::new();
        for ((i, (_, rx)), router) in queues.into_iter().enumerate().zip(routers) {
            let engine = Engine::new(peers[i], EngineConfig::default());
            handles.push(spawn_engine(engine, rx, router));
        }

        for &(a, b, lag) in &links {
            senders[a]
                .push(Inbound::new(conn_to(b), Event::PeerDialed { lag }))
                .unwrap();
        }
        for (i, handle) in handles.iter_mut().enumerate() {
            let edges = wait_for(&mut handle.snapshots, |s| s.unclassified == 2).await;
            assert_eq!(edges.peer, peers[i]);
        }

        senders[1].push(Inbound::local(Message::WakeUp)).unwrap();

        let expected = [
            (vec![peers[1], peers[2]], vec![]),
            (vec![peers[0]], vec![peers[2]]),
            (vec![peers[0]], vec![peers[1]]),
        ];
        for (handle, (branches, rejected)) in handles.iter_mut().zip(expected) {
            let snapshot = wait_for(&mut handle.snapshots, |s| {
                s.unclassified == 0 && s.branches == branches && s.rejected == rejected
            })
            .await;
            assert_ne!(snapshot.state, NodeState::Sleeping);
        }

        // One activity injected at B reaches A and C exactly once each.
        senders[1]
            .push(Inbound::local(Message::Activity(Activity::new(peers[1], "ping"))))
            .unwrap();
        for i in [0, 2] {
            wait_for(&mut handles[i].snapshots, |s| s.stats.activities_relayed == 1).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        for handle in &handles {
            assert_eq!(handle.snapshots.borrow().stats.activities_relayed, 1);
        }
    }
}
