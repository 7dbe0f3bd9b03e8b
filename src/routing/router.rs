//! The accept routing router and its per-connection state machine.

use std::fmt;
use std::io;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tracing::{debug, error, trace};

use super::{
    ConnectionId, ConnectionRegistry, DownstreamChain, DownstreamPipelineFactory, ParseError,
    ParseStatus, RouterError, RoutingDataParser, RoutingDataParserFactory, RoutingError,
    Transport,
};

/// Routing buffer cap used unless [`Router::with_buffer_limit`] says otherwise.
const DEFAULT_BUFFER_LIMIT: usize = 64 * 1024;

/// Lifecycle events for one accepted connection, in transport order.
pub enum ConnectionEvent<T> {
    /// The connection is established and owned by the router.
    TransportActive(T),
    /// Bytes read from the peer.
    Read(BytesMut),
    /// The peer closed its side.
    ReadEof,
    /// A read failed.
    ReadError(io::Error),
    /// The transport failed outside a read; before activation this is a no-op.
    TransportError(io::Error),
    /// No routing decision was reached within the allowed time.
    RoutingTimeout(Duration),
}

/// Externally visible phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accepted but not yet active. No registry entry.
    Idle,
    /// Bytes are being buffered and classified.
    Routing,
    /// A downstream chain owns the connection.
    Routed,
    /// Routing failed; the connection is being torn down.
    Failed,
    /// The peer closed the connection.
    Closed,
}

enum Phase {
    Idle,
    Routing,
    Routed(Box<dyn DownstreamChain>),
    Failed,
    Closed,
}

/// Per-connection routing state, owned by the connection's own task.
pub struct RoutedConnection {
    id: ConnectionId,
    phase: Phase,
}

impl RoutedConnection {
    pub fn new(id: ConnectionId) -> Self {
        Self {
            id,
            phase: Phase::Idle,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnState {
        match self.phase {
            Phase::Idle => ConnState::Idle,
            Phase::Routing => ConnState::Routing,
            Phase::Routed(_) => ConnState::Routed,
            Phase::Failed => ConnState::Failed,
            Phase::Closed => ConnState::Closed,
        }
    }

    pub fn is_routing(&self) -> bool {
        matches!(self.phase, Phase::Routing)
    }

    /// Install a chain produced by [`Router::on_routing_data`].
    ///
    /// Only a connection that is still routing accepts a chain; otherwise
    /// the chain is handed back.
    pub fn attach(
        &mut self,
        chain: Box<dyn DownstreamChain>,
    ) -> Result<(), Box<dyn DownstreamChain>> {
        if self.is_routing() {
            self.phase = Phase::Routed(chain);
            Ok(())
        } else {
            Err(chain)
        }
    }
}

impl fmt::Debug for RoutedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutedConnection")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Hooks fired once per connection when routing ends.
pub trait RoutingObserver<D>: Send + Sync {
    fn on_routing_complete(&self, _conn_id: ConnectionId, _data: &D) {}

    fn on_routing_error(&self, _conn_id: ConnectionId, _error: &RoutingError) {}
}

/// In-flight state of a connection that is still being classified.
///
/// `parser` is `None` only while `Router::with_parser` has it checked out.
struct RoutingEntry<D, T> {
    parser: Option<Box<dyn RoutingDataParser<D>>>,
    transport: T,
    buffer: BytesMut,
}

enum Step {
    Pending,
    Routed(Box<dyn DownstreamChain>),
    Failed,
}

/// Routes accepted connections to downstream chains.
///
/// One router serves every connection of a listener. It owns the registry
/// of connections that are still being routed; per-connection state that
/// outlives routing lives in each [`RoutedConnection`].
pub struct Router<D, T> {
    parsers: Arc<dyn RoutingDataParserFactory<D>>,
    downstream: Arc<dyn DownstreamPipelineFactory<D, T>>,
    observer: Option<Arc<dyn RoutingObserver<D>>>,
    registry: ConnectionRegistry<RoutingEntry<D, T>>,
    buffer_limit: usize,
}

impl<D, T> Router<D, T>
where
    D: fmt::Debug,
    T: Transport,
{
    pub fn new(
        parsers: Arc<dyn RoutingDataParserFactory<D>>,
        downstream: Arc<dyn DownstreamPipelineFactory<D, T>>,
    ) -> Self {
        Self {
            parsers,
            downstream,
            observer: None,
            registry: ConnectionRegistry::new(),
            buffer_limit: DEFAULT_BUFFER_LIMIT,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn RoutingObserver<D>>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Fail routing once more than `limit` bytes are buffered without a decision.
    pub fn with_buffer_limit(mut self, limit: usize) -> Self {
        self.buffer_limit = limit;
        self
    }

    /// Number of connections currently being routed.
    pub fn routing_entry_count(&self) -> usize {
        self.registry.len()
    }

    pub fn is_routing(&self, conn_id: ConnectionId) -> bool {
        self.registry.contains(conn_id)
    }

    /// Apply one lifecycle event to a connection.
    ///
    /// Only contract violations are returned as errors; routing failures
    /// are handled here and reported through the observer.
    pub fn dispatch(
        &self,
        conn: &mut RoutedConnection,
        event: ConnectionEvent<T>,
    ) -> Result<(), RouterError> {
        let id = conn.id;

        match event {
            ConnectionEvent::TransportActive(transport) => {
                if !matches!(conn.phase, Phase::Idle) {
                    error!(conn_id = %id, state = ?conn.state(), "transport activated twice");
                    return Err(RouterError::DuplicateActivation(id));
                }
                self.activate(id, transport)?;
                conn.phase = Phase::Routing;
            }

            ConnectionEvent::Read(data) => {
                if let Phase::Routed(chain) = &mut conn.phase {
                    chain.read(data);
                } else if conn.is_routing() {
                    conn.phase = match self.route(id, data) {
                        Step::Pending => Phase::Routing,
                        Step::Routed(chain) => Phase::Routed(chain),
                        Step::Failed => Phase::Failed,
                    };
                } else {
                    trace!(conn_id = %id, len = data.len(), "dropping read without a routing path");
                }
            }

            ConnectionEvent::ReadEof => match mem::replace(&mut conn.phase, Phase::Closed) {
                Phase::Routed(mut chain) => chain.read_eof(),
                Phase::Routing => {
                    if let Some(entry) = self.registry.remove(id) {
                        debug!(
                            conn_id = %id,
                            buffered = entry.buffer.len(),
                            "peer closed before routing completed"
                        );
                        entry.transport.close();
                    }
                }
                Phase::Failed => conn.phase = Phase::Failed,
                Phase::Idle | Phase::Closed => {}
            },

            ConnectionEvent::TransportError(error) if matches!(conn.phase, Phase::Idle) => {
                debug!(conn_id = %id, error = %error, "transport failed before activation");
            }

            ConnectionEvent::ReadError(error) | ConnectionEvent::TransportError(error) => {
                if let Phase::Routed(chain) = &mut conn.phase {
                    chain.read_error(&error);
                } else if conn.is_routing() {
                    self.with_parser(id, |parser, _| parser.on_read_error(&error));
                    self.on_error(id, RoutingError::Transport(error));
                    conn.phase = Phase::Failed;
                } else {
                    trace!(conn_id = %id, error = %error, "error without a routing path");
                }
            }

            ConnectionEvent::RoutingTimeout(after) => {
                if conn.is_routing() {
                    self.on_error(id, RoutingError::Timeout(after));
                    conn.phase = Phase::Failed;
                }
            }
        }

        Ok(())
    }

    /// Complete routing for `conn_id` with an already computed decision.
    ///
    /// Removes the routing entry, builds and activates the downstream chain
    /// and replays everything after the first `consumed` buffered bytes.
    /// Returns `None` when the connection is no longer being routed.
    pub fn on_routing_data(
        &self,
        conn_id: ConnectionId,
        data: D,
        consumed: usize,
    ) -> Option<Box<dyn DownstreamChain>> {
        let Some(entry) = self.registry.remove(conn_id) else {
            trace!(conn_id = %conn_id, routing_data = ?data, "routing data without a routing entry");
            return None;
        };

        let RoutingEntry {
            parser,
            transport,
            mut buffer,
        } = entry;
        drop(parser);
        let replay = buffer.split_off(consumed.min(buffer.len()));

        debug!(
            conn_id = %conn_id,
            routing_data = ?data,
            replay = replay.len(),
            "routing complete"
        );
        if let Some(observer) = &self.observer {
            observer.on_routing_complete(conn_id, &data);
        }

        let mut chain = self.downstream.build(conn_id, transport, data);
        chain.activate();
        if !replay.is_empty() {
            chain.read(replay);
        }
        Some(chain)
    }

    /// Fail routing for `conn_id`: drop its entry and close its transport.
    ///
    /// Returns `false` without side effects when there is no entry, which
    /// happens whenever another path already finished the connection.
    pub fn on_error(&self, conn_id: ConnectionId, error: RoutingError) -> bool {
        let Some(entry) = self.registry.remove(conn_id) else {
            trace!(conn_id = %conn_id, error = %error, "error without a routing entry");
            return false;
        };

        debug!(conn_id = %conn_id, error = %error, "routing failed");
        if let Some(observer) = &self.observer {
            observer.on_routing_error(conn_id, &error);
        }
        entry.transport.close();
        true
    }

    /// Close the transport of every connection still being routed.
    ///
    /// Entries stay registered; each connection's own EOF or error path
    /// removes them.
    pub fn close_pending(&self) -> usize {
        let mut closed = 0;
        self.registry.for_each(|_, entry| {
            entry.transport.close();
            closed += 1;
        });
        closed
    }

    fn activate(&self, id: ConnectionId, transport: T) -> Result<(), RouterError> {
        if self.registry.contains(id) {
            error!(conn_id = %id, "connection id already routing");
            return Err(RouterError::DuplicateActivation(id));
        }

        let entry = RoutingEntry {
            parser: Some(self.parsers.create(id)),
            transport,
            buffer: BytesMut::new(),
        };
        if self.registry.insert(id, entry).is_err() {
            error!(conn_id = %id, "connection id already routing");
            return Err(RouterError::DuplicateActivation(id));
        }
        self.with_parser(id, |parser, _| parser.on_activated());

        trace!(conn_id = %id, "routing started");
        Ok(())
    }

    /// Run `f` on the parser and buffer of `id` with the registry unlocked.
    ///
    /// Both are checked out of the entry for the call and put back after.
    /// Returns `None` when there is no entry, or when the entry went away
    /// during the call, in which case the parser is dropped.
    fn with_parser<R>(
        &self,
        id: ConnectionId,
        f: impl FnOnce(&mut dyn RoutingDataParser<D>, &mut BytesMut) -> R,
    ) -> Option<R> {
        let (parser, mut buffer) = self
            .registry
            .with_entry(id, |entry| (entry.parser.take(), mem::take(&mut entry.buffer)))?;
        let mut parser = parser?;

        let result = f(parser.as_mut(), &mut buffer);

        self.registry
            .with_entry(id, move |entry| {
                entry.parser = Some(parser);
                entry.buffer = buffer;
            })
            .map(|()| result)
    }

    fn route(&self, id: ConnectionId, data: BytesMut) -> Step {
        let limit = self.buffer_limit;
        let status = self.with_parser(id, |parser, buffer| {
            buffer.unsplit(data);
            match parser.parse(&buffer[..]) {
                Ok(ParseStatus::NeedData) if buffer.len() > limit => {
                    Err(ParseError::BufferLimit { limit })
                }
                status => status,
            }
        });

        match status {
            Some(Ok(ParseStatus::NeedData)) => Step::Pending,
            Some(Ok(ParseStatus::Classified { data, consumed })) => {
                match self.on_routing_data(id, data, consumed) {
                    Some(chain) => Step::Routed(chain),
                    None => Step::Failed,
                }
            }
            Some(Err(error)) => {
                self.on_error(id, error.into());
                Step::Failed
            }
            None => {
                trace!(conn_id = %id, "read after the routing entry was removed");
                Step::Failed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::RecordingTransport;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
    use std::sync::{Mutex, OnceLock, Weak};

    type Outcome = Result<ParseStatus<char>, ParseError>;

    const CONN: ConnectionId = ConnectionId::new(0);

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum ChainEvent {
        Active(char),
        Read(Vec<u8>),
        Eof,
        Error,
    }

    #[derive(Default)]
    struct Witness {
        parsers_created: AtomicUsize,
        parsers_dropped: AtomicUsize,
        activations: AtomicUsize,
        read_errors: AtomicUsize,
        parsed: Mutex<Vec<Vec<u8>>>,
        chains_built: AtomicUsize,
        chain_events: Mutex<Vec<ChainEvent>>,
        completed: Mutex<Vec<(ConnectionId, char)>>,
        failed: Mutex<Vec<ConnectionId>>,
    }

    impl Witness {
        fn chain_events(&self) -> Vec<ChainEvent> {
            self.chain_events.lock().unwrap().clone()
        }

        fn failed(&self) -> usize {
            self.failed.lock().unwrap().len()
        }

        fn completed(&self) -> usize {
            self.completed.lock().unwrap().len()
        }
    }

    impl RoutingObserver<char> for Witness {
        fn on_routing_complete(&self, conn_id: ConnectionId, data: &char) {
            self.completed.lock().unwrap().push((conn_id, *data));
        }

        fn on_routing_error(&self, conn_id: ConnectionId, _error: &RoutingError) {
            self.failed.lock().unwrap().push(conn_id);
        }
    }

    struct ScriptedParser {
        witness: Arc<Witness>,
        script: VecDeque<Outcome>,
    }

    impl RoutingDataParser<char> for ScriptedParser {
        fn on_activated(&mut self) {
            self.witness.activations.fetch_add(1, SeqCst);
        }

        fn parse(&mut self, buffer: &[u8]) -> Outcome {
            self.witness.parsed.lock().unwrap().push(buffer.to_vec());
            self.script.pop_front().unwrap_or(Ok(ParseStatus::NeedData))
        }

        fn on_read_error(&mut self, _error: &io::Error) {
            self.witness.read_errors.fetch_add(1, SeqCst);
        }
    }

    impl Drop for ScriptedParser {
        fn drop(&mut self) {
            self.witness.parsers_dropped.fetch_add(1, SeqCst);
        }
    }

    struct ScriptedParsers {
        witness: Arc<Witness>,
        script: Mutex<VecDeque<Outcome>>,
    }

    impl RoutingDataParserFactory<char> for ScriptedParsers {
        fn create(&self, _conn_id: ConnectionId) -> Box<dyn RoutingDataParser<char>> {
            self.witness.parsers_created.fetch_add(1, SeqCst);
            Box::new(ScriptedParser {
                witness: Arc::clone(&self.witness),
                script: mem::take(&mut *self.script.lock().unwrap()),
            })
        }
    }

    struct RecordingChain {
        witness: Arc<Witness>,
        data: char,
        _transport: RecordingTransport,
    }

    impl DownstreamChain for RecordingChain {
        fn activate(&mut self) {
            self.record(ChainEvent::Active(self.data));
        }

        fn read(&mut self, data: BytesMut) {
            self.record(ChainEvent::Read(data.to_vec()));
        }

        fn read_eof(&mut self) {
            self.record(ChainEvent::Eof);
        }

        fn read_error(&mut self, _error: &io::Error) {
            self.record(ChainEvent::Error);
        }
    }

    impl RecordingChain {
        fn record(&self, event: ChainEvent) {
            self.witness.chain_events.lock().unwrap().push(event);
        }
    }

    struct RecordingChains(Arc<Witness>);

    impl DownstreamPipelineFactory<char, RecordingTransport> for RecordingChains {
        fn build(
            &self,
            _conn_id: ConnectionId,
            transport: RecordingTransport,
            data: char,
        ) -> Box<dyn DownstreamChain> {
            self.0.chains_built.fetch_add(1, SeqCst);
            Box::new(RecordingChain {
                witness: Arc::clone(&self.0),
                data,
                _transport: transport,
            })
        }
    }

    fn router(witness: &Arc<Witness>, script: Vec<Outcome>) -> Router<char, RecordingTransport> {
        Router::new(
            Arc::new(ScriptedParsers {
                witness: Arc::clone(witness),
                script: Mutex::new(script.into()),
            }),
            Arc::new(RecordingChains(Arc::clone(witness))),
        )
        .with_observer(Arc::clone(witness) as Arc<dyn RoutingObserver<char>>)
    }

    fn classified(data: char, consumed: usize) -> Outcome {
        Ok(ParseStatus::Classified { data, consumed })
    }

    fn read(bytes: &[u8]) -> ConnectionEvent<RecordingTransport> {
        ConnectionEvent::Read(BytesMut::from(bytes))
    }

    fn reset() -> io::Error {
        io::Error::new(io::ErrorKind::ConnectionReset, "peer reset")
    }

    fn activate(
        router: &Router<char, RecordingTransport>,
        id: ConnectionId,
    ) -> (RoutedConnection, RecordingTransport) {
        let transport = RecordingTransport::default();
        let mut conn = RoutedConnection::new(id);
        router
            .dispatch(&mut conn, ConnectionEvent::TransportActive(transport.clone()))
            .unwrap();
        (conn, transport)
    }

    #[test]
    fn test_classification_hands_off_and_erases_entry() {
        let witness = Arc::new(Witness::default());
        let router = router(&witness, vec![classified('A', 1)]);

        let (mut conn, transport) = activate(&router, CONN);
        assert_eq!(conn.state(), ConnState::Routing);
        assert_eq!(router.routing_entry_count(), 1);
        assert_eq!(witness.activations.load(SeqCst), 1);

        router.dispatch(&mut conn, read(b"a")).unwrap();
        assert_eq!(conn.state(), ConnState::Routed);
        assert_eq!(router.routing_entry_count(), 0);
        assert_eq!(witness.parsers_dropped.load(SeqCst), 1);
        assert_eq!(witness.chain_events(), vec![ChainEvent::Active('A')]);
        assert_eq!(*witness.completed.lock().unwrap(), vec![(CONN, 'A')]);

        // EOF after the handoff belongs to the downstream chain.
        router.dispatch(&mut conn, ConnectionEvent::ReadEof).unwrap();
        assert_eq!(conn.state(), ConnState::Closed);
        assert_eq!(
            witness.chain_events(),
            vec![ChainEvent::Active('A'), ChainEvent::Eof]
        );

        assert_eq!(router.routing_entry_count(), 0);
        assert_eq!(witness.parsers_dropped.load(SeqCst), 1);
        assert_eq!(witness.completed(), 1);
        assert_eq!(witness.failed(), 0);
        assert_eq!(transport.close_count(), 0);
    }

    #[test]
    fn test_leftover_is_replayed_before_later_reads() {
        let witness = Arc::new(Witness::default());
        let router = router(&witness, vec![Ok(ParseStatus::NeedData), classified('B', 3)]);
        let (mut conn, _transport) = activate(&router, CONN);

        router.dispatch(&mut conn, read(b"ab")).unwrap();
        assert_eq!(conn.state(), ConnState::Routing);
        assert!(witness.chain_events().is_empty());

        router.dispatch(&mut conn, read(b"cdef")).unwrap();
        router.dispatch(&mut conn, read(b"gh")).unwrap();

        assert_eq!(
            *witness.parsed.lock().unwrap(),
            vec![b"ab".to_vec(), b"abcdef".to_vec()]
        );
        assert_eq!(
            witness.chain_events(),
            vec![
                ChainEvent::Active('B'),
                ChainEvent::Read(b"def".to_vec()),
                ChainEvent::Read(b"gh".to_vec()),
            ]
        );
    }

    #[test]
    fn test_zero_consumed_replays_everything() {
        let witness = Arc::new(Witness::default());
        let router = router(&witness, vec![classified('C', 0)]);
        let (mut conn, _transport) = activate(&router, CONN);

        router.dispatch(&mut conn, read(b"hello")).unwrap();

        assert_eq!(
            witness.chain_events(),
            vec![ChainEvent::Active('C'), ChainEvent::Read(b"hello".to_vec())]
        );
    }

    #[test]
    fn test_oversized_consumed_leaves_nothing_to_replay() {
        let witness = Arc::new(Witness::default());
        let router = router(&witness, vec![classified('C', 99)]);
        let (mut conn, _transport) = activate(&router, CONN);

        router.dispatch(&mut conn, read(b"abc")).unwrap();

        assert_eq!(witness.chain_events(), vec![ChainEvent::Active('C')]);
    }

    #[test]
    fn test_read_error_while_routing_never_builds_downstream() {
        let witness = Arc::new(Witness::default());
        let router = router(&witness, vec![Ok(ParseStatus::NeedData)]);
        let (mut conn, transport) = activate(&router, CONN);

        router.dispatch(&mut conn, read(b"a")).unwrap();
        router
            .dispatch(&mut conn, ConnectionEvent::ReadError(reset()))
            .unwrap();

        assert_eq!(conn.state(), ConnState::Failed);
        assert_eq!(witness.read_errors.load(SeqCst), 1);
        assert_eq!(witness.failed(), 1);
        assert_eq!(witness.chains_built.load(SeqCst), 0);
        assert_eq!(router.routing_entry_count(), 0);
        assert_eq!(transport.close_count(), 1);

        // Late events are ignored.
        router.dispatch(&mut conn, read(b"more")).unwrap();
        router.dispatch(&mut conn, ConnectionEvent::ReadEof).unwrap();
        assert_eq!(conn.state(), ConnState::Failed);
        assert_eq!(witness.failed(), 1);
        assert_eq!(witness.parsers_dropped.load(SeqCst), 1);
        assert_eq!(transport.close_count(), 1);
    }

    #[test]
    fn test_parse_error_fails_routing() {
        let witness = Arc::new(Witness::default());
        let router = router(
            &witness,
            vec![Err(ParseError::Unrecognized { byte: 0x16 })],
        );
        let (mut conn, transport) = activate(&router, CONN);

        router.dispatch(&mut conn, read(&[0x16, 0x03])).unwrap();

        assert_eq!(conn.state(), ConnState::Failed);
        assert_eq!(witness.failed(), 1);
        assert_eq!(witness.read_errors.load(SeqCst), 0);
        assert_eq!(witness.chains_built.load(SeqCst), 0);
        assert_eq!(router.routing_entry_count(), 0);
        assert!(transport.is_closed());
    }

    #[test]
    fn test_buffer_limit_fails_routing() {
        let witness = Arc::new(Witness::default());
        let router = router(&witness, vec![]).with_buffer_limit(4);
        let (mut conn, transport) = activate(&router, CONN);

        router.dispatch(&mut conn, read(b"abcd")).unwrap();
        assert_eq!(conn.state(), ConnState::Routing);

        router.dispatch(&mut conn, read(b"e")).unwrap();
        assert_eq!(conn.state(), ConnState::Failed);
        assert_eq!(witness.failed(), 1);
        assert!(transport.is_closed());
    }

    #[test]
    fn test_transport_error_before_activation_is_noop() {
        let witness = Arc::new(Witness::default());
        let router = router(&witness, vec![classified('A', 0)]);
        let mut conn = RoutedConnection::new(CONN);

        router
            .dispatch(&mut conn, ConnectionEvent::TransportError(reset()))
            .unwrap();

        assert_eq!(conn.state(), ConnState::Idle);
        assert_eq!(witness.parsers_created.load(SeqCst), 0);
        assert_eq!(witness.failed(), 0);
        assert_eq!(router.routing_entry_count(), 0);
    }

    #[test]
    fn test_error_without_entry_is_noop() {
        let witness = Arc::new(Witness::default());
        let router = router(&witness, vec![]);

        assert!(!router.on_error(CONN, reset().into()));
        assert!(!router.on_error(CONN, RoutingError::Timeout(Duration::from_secs(1))));

        assert_eq!(witness.failed(), 0);
        assert_eq!(router.routing_entry_count(), 0);
    }

    #[test]
    fn test_routing_data_after_error_is_ignored() {
        let witness = Arc::new(Witness::default());
        let router = router(&witness, vec![]);
        let (mut conn, transport) = activate(&router, CONN);

        assert!(router.on_error(CONN, reset().into()));
        assert!(router.on_routing_data(CONN, 'A', 0).is_none());
        assert!(!router.on_error(CONN, reset().into()));

        assert_eq!(witness.chains_built.load(SeqCst), 0);
        assert_eq!(witness.completed(), 0);
        assert_eq!(witness.failed(), 1);
        assert_eq!(witness.parsers_dropped.load(SeqCst), 1);
        assert_eq!(transport.close_count(), 1);

        // The connection notices on its next read.
        router.dispatch(&mut conn, read(b"a")).unwrap();
        assert_eq!(conn.state(), ConnState::Failed);
    }

    #[test]
    fn test_external_routing_data_can_be_attached() {
        let witness = Arc::new(Witness::default());
        let router = router(&witness, vec![]);
        let (mut conn, _transport) = activate(&router, CONN);

        router.dispatch(&mut conn, read(b"xy")).unwrap();
        let chain = router.on_routing_data(CONN, 'D', 1).unwrap();
        assert!(conn.attach(chain).is_ok());
        router.dispatch(&mut conn, read(b"z")).unwrap();

        assert_eq!(conn.state(), ConnState::Routed);
        assert_eq!(
            witness.chain_events(),
            vec![
                ChainEvent::Active('D'),
                ChainEvent::Read(b"y".to_vec()),
                ChainEvent::Read(b"z".to_vec()),
            ]
        );
    }

    #[test]
    fn test_error_after_handoff_goes_downstream() {
        let witness = Arc::new(Witness::default());
        let router = router(&witness, vec![classified('A', 0)]);
        let (mut conn, transport) = activate(&router, CONN);

        router.dispatch(&mut conn, read(b"a")).unwrap();
        router
            .dispatch(&mut conn, ConnectionEvent::ReadError(reset()))
            .unwrap();
        assert!(!router.on_error(CONN, reset().into()));

        assert_eq!(conn.state(), ConnState::Routed);
        assert_eq!(
            witness.chain_events(),
            vec![
                ChainEvent::Active('A'),
                ChainEvent::Read(b"a".to_vec()),
                ChainEvent::Error,
            ]
        );
        assert_eq!(witness.read_errors.load(SeqCst), 0);
        assert_eq!(witness.failed(), 0);
        assert_eq!(transport.close_count(), 0);
    }

    #[test]
    fn test_eof_before_classification_removes_entry() {
        let witness = Arc::new(Witness::default());
        let router = router(&witness, vec![]);
        let (mut conn, transport) = activate(&router, CONN);

        router.dispatch(&mut conn, read(b"par")).unwrap();
        router.dispatch(&mut conn, ConnectionEvent::ReadEof).unwrap();
        router.dispatch(&mut conn, ConnectionEvent::ReadEof).unwrap();

        assert_eq!(conn.state(), ConnState::Closed);
        assert_eq!(router.routing_entry_count(), 0);
        assert_eq!(witness.completed(), 0);
        assert_eq!(witness.failed(), 0);
        assert_eq!(witness.parsers_dropped.load(SeqCst), 1);
        assert_eq!(transport.close_count(), 1);
    }

    #[test]
    fn test_timeout_only_applies_while_routing() {
        let witness = Arc::new(Witness::default());
        let router = router(&witness, vec![]);
        let (mut conn, transport) = activate(&router, CONN);
        let after = Duration::from_millis(50);

        router
            .dispatch(&mut conn, ConnectionEvent::RoutingTimeout(after))
            .unwrap();
        router
            .dispatch(&mut conn, ConnectionEvent::RoutingTimeout(after))
            .unwrap();

        assert_eq!(conn.state(), ConnState::Failed);
        assert_eq!(witness.failed(), 1);
        assert_eq!(transport.close_count(), 1);
    }

    #[test]
    fn test_duplicate_activation_is_rejected() {
        let witness = Arc::new(Witness::default());
        let router = router(&witness, vec![]);
        let (mut conn, _transport) = activate(&router, CONN);

        let err = router
            .dispatch(
                &mut conn,
                ConnectionEvent::TransportActive(RecordingTransport::default()),
            )
            .unwrap_err();
        assert!(matches!(err, RouterError::DuplicateActivation(id) if id == CONN));

        let mut twin = RoutedConnection::new(CONN);
        let err = router
            .dispatch(
                &mut twin,
                ConnectionEvent::TransportActive(RecordingTransport::default()),
            )
            .unwrap_err();
        assert!(matches!(err, RouterError::DuplicateActivation(_)));
        assert_eq!(twin.state(), ConnState::Idle);

        // The original entry survives untouched.
        assert_eq!(router.routing_entry_count(), 1);
        assert_eq!(witness.parsers_created.load(SeqCst), 1);
        assert_eq!(witness.activations.load(SeqCst), 1);
    }

    /// Parser that looks at the router's entry count from inside its callbacks.
    struct CountingParser {
        router: Arc<OnceLock<Weak<Router<char, RecordingTransport>>>>,
        seen: Arc<Mutex<Vec<usize>>>,
    }

    impl CountingParser {
        fn record(&self) {
            if let Some(router) = self.router.get().and_then(Weak::upgrade) {
                self.seen.lock().unwrap().push(router.routing_entry_count());
            }
        }
    }

    impl RoutingDataParser<char> for CountingParser {
        fn on_activated(&mut self) {
            self.record();
        }

        fn parse(&mut self, buffer: &[u8]) -> Outcome {
            self.record();
            if buffer.len() < 2 {
                Ok(ParseStatus::NeedData)
            } else {
                classified('E', 2)
            }
        }
    }

    #[test]
    fn test_parser_may_query_router() {
        let witness = Arc::new(Witness::default());
        let slot = Arc::new(OnceLock::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let parsers = {
            let slot = Arc::clone(&slot);
            let seen = Arc::clone(&seen);
            move |_conn_id: ConnectionId| -> Box<dyn RoutingDataParser<char>> {
                Box::new(CountingParser {
                    router: Arc::clone(&slot),
                    seen: Arc::clone(&seen),
                })
            }
        };
        let router = Arc::new(Router::new(
            Arc::new(parsers),
            Arc::new(RecordingChains(Arc::clone(&witness))),
        ));
        slot.set(Arc::downgrade(&router)).ok().unwrap();

        let (mut conn, _transport) = activate(&router, CONN);
        router.dispatch(&mut conn, read(b"a")).unwrap();
        router.dispatch(&mut conn, read(b"b")).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![1, 1, 1]);
        assert_eq!(conn.state(), ConnState::Routed);
        assert_eq!(router.routing_entry_count(), 0);
    }

    #[test]
    fn test_connections_route_independently() {
        let witness = Arc::new(Witness::default());
        let router = router(&witness, vec![]);
        let (mut first, _t1) = activate(&router, ConnectionId::new(1));
        let (_second, second_transport) = activate(&router, ConnectionId::new(2));
        assert_eq!(router.routing_entry_count(), 2);

        let chain = router.on_routing_data(first.id(), 'A', 0).unwrap();
        first.attach(chain).ok().unwrap();
        assert_eq!(router.routing_entry_count(), 1);
        assert!(router.is_routing(ConnectionId::new(2)));

        assert_eq!(router.close_pending(), 1);
        assert!(second_transport.is_closed());
    }
}
