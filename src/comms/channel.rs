//! Channel transport
//! -----------------
//! Runs companion calls on a private tokio runtime and funnels their results
//! into one crossbeam channel. The control thread only ever sees that
//! channel, through `poll`, which never blocks.
//
//!   control thread ── send_* ──▶ runtime task ── RpcBackend call ──┐
//!        ▲                                                        │
//!        └──────── poll (try_recv) ◀── crossbeam Sender ◀─────────┘
//
//! Streams are pull-based: after each message the task parks until
//! `read_next` re-arms it, so a slow control loop never has more than one
//! undelivered message per stream.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use crossbeam::channel::{Receiver, Sender, unbounded};
use futures::StreamExt;
use futures::stream::BoxStream;
use log::Level;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tonic::{Code, Status};

use crate::agent_log;
use crate::comms::messages::{Reply, Request};
use crate::comms::registry::Token;
use crate::comms::transport::{
    Completion, ConnectionHandle, Outcome, Poll, Transport, TransportError,
};

pub type ReplyStream = BoxStream<'static, Result<Reply, Status>>;

/// The async side of a connection to the companion.
#[async_trait]
pub trait RpcBackend: Send + Sync + 'static {
    async fn unary(&self, request: Request) -> Result<Reply, Status>;

    async fn open_stream(&self, request: Request) -> Result<ReplyStream, Status>;
}

/// Builds a backend for an endpoint. Runs inside the transport's runtime
/// context, so it may spawn.
pub type Connector =
    Box<dyn Fn(&str) -> Result<Arc<dyn RpcBackend>, TransportError> + Send + 'static>;

enum Signal {
    Completion(Completion),
    /// The connection with this generation is unusable.
    Lost(u64),
}

pub struct ChannelTransport {
    runtime:   Runtime,
    connector: Connector,
    backend:   Option<(ConnectionHandle, Arc<dyn RpcBackend>)>,
    generation: u64,
    tx:        Sender<Signal>,
    rx:        Receiver<Signal>,
    streams:   HashMap<Token, mpsc::UnboundedSender<()>>,
    tasks:     Vec<AbortHandle>,
    shutdown_pending: bool,
}

impl ChannelTransport {
    pub fn new(
        connector: impl Fn(&str) -> Result<Arc<dyn RpcBackend>, TransportError> + Send + 'static,
    ) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("companion-io")
            .enable_all()
            .build()?;
        let (tx, rx) = unbounded();
        Ok(Self {
            runtime,
            connector: Box::new(connector),
            backend: None,
            generation: 0,
            tx,
            rx,
            streams: HashMap::new(),
            tasks: Vec::new(),
            shutdown_pending: false,
        })
    }

    fn backend_for(&self, conn: ConnectionHandle) -> Option<Arc<dyn RpcBackend>> {
        match &self.backend {
            Some((handle, backend)) if *handle == conn => Some(Arc::clone(backend)),
            _ => None,
        }
    }

    /// Forget finished tasks and streams nobody can re-arm any more.
    fn prune(&mut self) {
        self.tasks.retain(|task| !task.is_finished());
        self.streams.retain(|_, arm| !arm.is_closed());
    }

    fn disconnect(&mut self) {
        self.backend = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.streams.clear();
    }

    /// Completion for a send that could not even start.
    fn reject(&self, token: Token) {
        let _ = self.tx.send(Signal::Completion(Completion {
            token,
            outcome: Outcome::Failed(Status::unavailable("companion connection is closed")),
        }));
    }

    pub fn in_flight_tasks(&self) -> usize {
        self.tasks.iter().filter(|task| !task.is_finished()).count()
    }
}

/// Push a completion and, when the channel itself failed, the loss marker
/// behind it.
fn report(tx: &Sender<Signal>, generation: u64, token: Token, outcome: Outcome) {
    let lost = matches!(&outcome, Outcome::Failed(s) if s.code() == Code::Unavailable);
    let _ = tx.send(Signal::Completion(Completion { token, outcome }));
    if lost {
        let _ = tx.send(Signal::Lost(generation));
    }
}

impl Transport for ChannelTransport {
    fn connect(&mut self, endpoint: &str) -> Result<ConnectionHandle, TransportError> {
        let _guard = self.runtime.enter();
        let backend = (self.connector)(endpoint)?;
        self.generation += 1;
        let handle = ConnectionHandle(self.generation);
        self.backend = Some((handle, backend));
        self.shutdown_pending = false;
        agent_log!(Level::Debug, "transport", "connection {} to {}", handle.0, endpoint);
        Ok(handle)
    }

    fn send_unary(&mut self, conn: ConnectionHandle, request: Request, token: Token) {
        self.prune();
        let Some(backend) = self.backend_for(conn) else {
            return self.reject(token);
        };
        let tx = self.tx.clone();
        let task = self.runtime.spawn(async move {
            let outcome = match backend.unary(request).await {
                Ok(reply) => Outcome::Success(Some(reply)),
                Err(status) => Outcome::Failed(status),
            };
            report(&tx, conn.0, token, outcome);
        });
        self.tasks.push(task.abort_handle());
    }

    fn send_stream_open(&mut self, conn: ConnectionHandle, request: Request, token: Token) {
        self.prune();
        let Some(backend) = self.backend_for(conn) else {
            return self.reject(token);
        };
        let (arm_tx, mut arm_rx) = mpsc::unbounded_channel::<()>();
        self.streams.insert(token, arm_tx);
        let tx = self.tx.clone();
        let task = self.runtime.spawn(async move {
            let mut stream = match backend.open_stream(request).await {
                Ok(stream) => {
                    report(&tx, conn.0, token, Outcome::Success(None));
                    stream
                }
                Err(status) => return report(&tx, conn.0, token, Outcome::Failed(status)),
            };
            while arm_rx.recv().await.is_some() {
                match stream.next().await {
                    Some(Ok(reply)) => report(&tx, conn.0, token, Outcome::Success(Some(reply))),
                    Some(Err(status)) => return report(&tx, conn.0, token, Outcome::Failed(status)),
                    None => return report(&tx, conn.0, token, Outcome::Finished),
                }
            }
        });
        self.tasks.push(task.abort_handle());
    }

    fn read_next(&mut self, _conn: ConnectionHandle, token: Token) {
        if let Some(arm) = self.streams.get(&token) {
            if arm.send(()).is_err() {
                self.streams.remove(&token);
            }
        }
    }

    fn poll(&mut self) -> Poll {
        if self.shutdown_pending {
            self.shutdown_pending = false;
            return Poll::Shutdown;
        }
        loop {
            match self.rx.try_recv() {
                Ok(Signal::Completion(completion)) => return Poll::Completion(completion),
                Ok(Signal::Lost(generation)) => {
                    let current = self.backend.as_ref().map(|(handle, _)| handle.0);
                    if current == Some(generation) {
                        agent_log!(Level::Warn, "transport", "connection {} lost", generation);
                        self.disconnect();
                        return Poll::Shutdown;
                    }
                }
                Err(_) => return Poll::Empty,
            }
        }
    }

    fn shutdown(&mut self) {
        agent_log!(
            Level::Debug,
            "transport",
            "shutdown, aborting {} running task(s)",
            self.in_flight_tasks()
        );
        self.disconnect();
        while self.rx.try_recv().is_ok() {}
        self.shutdown_pending = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comms::messages::{Ping, Pong, TraceCommand, TraceRecord};
    use std::time::{Duration, Instant};

    struct EchoBackend;

    #[async_trait]
    impl RpcBackend for EchoBackend {
        async fn unary(&self, request: Request) -> Result<Reply, Status> {
            match request {
                Request::Ping(p) => Ok(Reply::Pong(Pong { token: p.token, pid: 1 })),
                _ => Err(Status::unavailable("gone")),
            }
        }

        async fn open_stream(&self, _request: Request) -> Result<ReplyStream, Status> {
            let records = (0..2).map(|i| Ok(Reply::TraceRecord(TraceRecord { ts_ns: i, summary: "x".into() })));
            Ok(tokio_stream::iter(records).boxed())
        }
    }

    fn transport() -> ChannelTransport {
        ChannelTransport::new(|_| Ok(Arc::new(EchoBackend) as Arc<dyn RpcBackend>)).unwrap()
    }

    fn wait(t: &mut ChannelTransport) -> Poll {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match t.poll() {
                Poll::Empty if Instant::now() < deadline => std::thread::sleep(Duration::from_millis(5)),
                other => return other,
            }
        }
    }

    #[test]
    fn unary_completion_arrives_through_poll() {
        let mut t = transport();
        let conn = t.connect("mem://").unwrap();
        t.send_unary(conn, Request::Ping(Ping { token: 9 }), Token(1));
        match wait(&mut t) {
            Poll::Completion(c) => {
                assert_eq!(c.token, Token(1));
                assert!(matches!(
                    c.outcome,
                    Outcome::Success(Some(Reply::Pong(Pong { token: 9, pid: 1 })))
                ));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unavailable_marks_connection_lost() {
        let mut t = transport();
        let conn = t.connect("mem://").unwrap();
        t.send_unary(conn, Request::SwarmState(Default::default()), Token(3));
        assert!(matches!(wait(&mut t), Poll::Completion(c) if matches!(c.outcome, Outcome::Failed(_))));
        assert!(matches!(wait(&mut t), Poll::Shutdown));
        // the dead handle is refused from now on
        t.send_unary(conn, Request::Ping(Ping { token: 1 }), Token(4));
        assert!(matches!(wait(&mut t), Poll::Completion(c) if c.token == Token(4)));
    }

    #[test]
    fn stream_waits_for_rearm() {
        let mut t = transport();
        let conn = t.connect("mem://").unwrap();
        t.send_stream_open(conn, Request::Trace(TraceCommand::default()), Token(2));
        assert!(matches!(wait(&mut t), Poll::Completion(c) if matches!(c.outcome, Outcome::Success(None))));

        std::thread::sleep(Duration::from_millis(20));
        assert!(matches!(t.poll(), Poll::Empty), "no message before read_next");

        for _ in 0..2 {
            t.read_next(conn, Token(2));
            assert!(matches!(wait(&mut t), Poll::Completion(c) if matches!(c.outcome, Outcome::Success(Some(_)))));
        }
        t.read_next(conn, Token(2));
        assert!(matches!(wait(&mut t), Poll::Completion(c) if matches!(c.outcome, Outcome::Finished)));
    }

    #[test]
    fn shutdown_is_reported_once() {
        let mut t = transport();
        let conn = t.connect("mem://").unwrap();
        t.send_stream_open(conn, Request::Trace(TraceCommand::default()), Token(5));
        assert!(matches!(wait(&mut t), Poll::Completion(c) if c.token == Token(5)));
        // parked waiting for read_next
        assert_eq!(t.in_flight_tasks(), 1);

        t.shutdown();
        assert_eq!(t.in_flight_tasks(), 0);
        assert!(matches!(t.poll(), Poll::Shutdown));
        assert!(matches!(t.poll(), Poll::Empty));
    }
}
