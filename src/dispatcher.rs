use std::{
    collections::VecDeque,
    io,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot},
    task::{JoinError, JoinHandle},
    time::{sleep, timeout},
};
use tokio_util::codec::Framed;

use crate::{
    cmd::{cmd, Cmd},
    config::{ClientConfig, InflightPolicy},
    connection::{implied_update, ConnectionState, StateUpdate},
    error::{Error, Result},
    resp::{Reply, RespCodec},
    retry::RetryStrategy,
};

type Transport = Framed<TcpStream, RespCodec>;
type ReplySender = oneshot::Sender<Result<Reply>>;
type ReconnectTask = JoinHandle<Result<Transport>>;

enum Message {
    Request(Request),
    Close,
}

struct Request {
    cmd: Option<Cmd>,
    update: Option<StateUpdate>,
    tx: ReplySender,
}

/// Written to the socket, waiting for `cmds.len()` replies. Only the reply
/// at `keep` goes back to the caller; the others belong to the SELECTs
/// wrapped around a database-pinned command.
///
/// Only `cmds[..written]` is on the wire. A pinned command whose guard
/// SELECT might be refused stays unwritten until the guard is acknowledged.
struct PendingRequest {
    seq: u64,
    cmds: Vec<Cmd>,
    keep: usize,
    written: usize,
    replies: Vec<Reply>,
    update: Option<StateUpdate>,
    tx: ReplySender,
    replayed: bool,
}

impl PendingRequest {
    fn is_complete(&self) -> bool {
        self.replies.len() == self.cmds.len()
    }

    fn is_staged(&self) -> bool {
        self.written < self.cmds.len()
    }

    /// The SELECT back to the previous database was refused, so the server
    /// is left on the pinned one.
    fn restore_failed(&self) -> bool {
        self.keep > 0
            && self.replies.len() == self.keep + 2
            && self.replies.last().is_some_and(Reply::is_error)
    }

    fn finish(mut self) -> (Result<Reply>, Option<StateUpdate>, ReplySender) {
        let guard_error = self.replies[..self.keep].iter().find_map(|reply| match reply {
            Reply::Error(msg) => Some(msg.clone()),
            _ => None,
        });
        let result = match guard_error {
            Some(msg) => Err(Error::Request(msg)),
            None => into_result(self.replies.swap_remove(self.keep)),
        };
        (result, self.update, self.tx)
    }

    fn fail(self, err: Error) {
        debug!("#{} failed: {err}", self.seq);
        let _ = self.tx.send(Err(err));
    }
}

fn into_result(reply: Reply) -> Result<Reply> {
    match reply {
        Reply::Error(msg) => Err(Error::Request(msg)),
        reply => Ok(reply),
    }
}

fn closing() -> Error {
    Error::Closing("the client is closed".into())
}

/// Handle to the task that owns the socket.
///
/// Cloning is cheap; every clone talks to the same connection. Writes are
/// serialised by the task and replies are handed back in request order, so
/// callers on different tasks never see each other's replies.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Message>,
    state: Arc<RwLock<ConnectionState>>,
    request_timeout: Duration,
}

impl Dispatcher {
    /// Connects (retrying per the configured strategy), runs the handshake
    /// and starts the dispatcher task.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let state = Arc::new(RwLock::new(ConnectionState::from_config(&config)));
        let request_timeout = config.request_timeout;
        let (tx, rx) = mpsc::unbounded_channel();

        let connector = Connector {
            retry: RetryStrategy::new(config.retry_strategy),
            config,
            state: state.clone(),
        };
        let transport = connector.connect_with_retry(true).await?;

        let mut task = DispatcherTask::new(connector, rx);
        task.attach(transport);
        tokio::spawn(task.run());

        Ok(Self {
            tx,
            state,
            request_timeout,
        })
    }

    /// Sends `cmd`. A raw SELECT or CLIENT SETNAME updates the connection
    /// state once the server accepts it, same as the typed methods.
    pub async fn send(&self, cmd: Cmd) -> Result<Reply> {
        let update = implied_update(&cmd);
        self.submit(Some(cmd), update).await
    }

    /// Sends `cmd` (if any) and applies `update` once the server accepts it.
    /// Without a command the update is applied in order with other requests.
    pub(crate) async fn send_with_update(
        &self,
        cmd: Option<Cmd>,
        update: StateUpdate,
    ) -> Result<Reply> {
        self.submit(cmd, Some(update)).await
    }

    async fn submit(&self, cmd: Option<Cmd>, update: Option<StateUpdate>) -> Result<Reply> {
        if self.is_closed() {
            return Err(closing());
        }
        if let Some(cmd) = &cmd {
            cmd.validate()?;
        }

        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Message::Request(Request { cmd, update, tx }))
            .map_err(|_| closing())?;

        match timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            // The task dropped the sender without answering: it is gone.
            Ok(Err(_)) => Err(closing()),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Marks the client closed. Requests still in flight and every later
    /// request fail with [`Error::Closing`]. Calling it twice is harmless.
    pub fn close(&self) {
        let was_closed = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let was_closed = state.is_closed();
            state.mark_closed();
            was_closed
        };
        if !was_closed {
            let _ = self.tx.send(Message::Close);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_closed()
    }

    /// Snapshot of the connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("state", &self.state)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

enum ConnectFailure {
    /// Worth another attempt: refused, timed out, dropped mid-handshake.
    Transient(Error),
    /// The server answered the handshake with an error; retrying won't help.
    Rejected(Error),
}

/// Opens sockets and replays the handshake. Cloned into the background
/// task that keeps retrying while the dispatcher answers requests.
#[derive(Clone)]
struct Connector {
    config: ClientConfig,
    retry: RetryStrategy,
    state: Arc<RwLock<ConnectionState>>,
}

impl Connector {
    fn state(&self) -> RwLockReadGuard<'_, ConnectionState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_mut(&self) -> RwLockWriteGuard<'_, ConnectionState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Tries once right away (when `attempt_now`), then once per retry
    /// delay. Gives up after the last retry with the last failure.
    async fn connect_with_retry(&self, attempt_now: bool) -> Result<Transport> {
        let first = attempt_now.then_some(Duration::ZERO);
        let delays = first.into_iter().chain(self.retry.get_iterator());
        let mut last_err = Error::Connection("no connection attempt was made".into());

        for (attempt, delay) in delays.enumerate() {
            if !delay.is_zero() {
                debug!("reconnect attempt {attempt} in {delay:?}");
                sleep(delay).await;
            }
            match self.try_connect().await {
                Ok(transport) => return Ok(transport),
                Err(ConnectFailure::Rejected(e)) => {
                    error!("server rejected the handshake: {e}");
                    return Err(e);
                }
                Err(ConnectFailure::Transient(e)) => {
                    warn!("connect attempt {attempt} failed: {e}");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn try_connect(&self) -> std::result::Result<Transport, ConnectFailure> {
        let mut last_err = Error::Connection("no address configured".into());

        for node in self.config.nodes() {
            let addr = node.to_string();
            let stream = match timeout(self.config.connection_timeout, TcpStream::connect(&addr)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    last_err = Error::Connection(format!("{addr}: {e}"));
                    continue;
                }
                Err(_) => {
                    last_err = Error::Connection(format!("{addr}: connect timed out"));
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                warn!("{addr}: could not disable Nagle: {e}");
            }

            let mut transport = Framed::new(stream, RespCodec);
            self.handshake(&mut transport).await?;
            info!("connected to {addr}");
            return Ok(transport);
        }
        Err(ConnectFailure::Transient(last_err))
    }

    async fn handshake(&self, transport: &mut Transport) -> std::result::Result<(), ConnectFailure> {
        let commands = self.state().handshake();
        for command in commands {
            let name = command.name_lossy();
            let reply = self
                .round_trip(transport, command)
                .await
                .map_err(ConnectFailure::Transient)?;
            if let Reply::Error(msg) = reply {
                return Err(ConnectFailure::Rejected(Error::Connection(format!(
                    "{name} failed during handshake: {msg}"
                ))));
            }
        }

        let count_unknown = self.state().database_count().is_none();
        if count_unknown {
            let probe = cmd("CONFIG").arg("GET").arg("databases");
            let reply = self
                .round_trip(transport, probe)
                .await
                .map_err(ConnectFailure::Transient)?;
            match parse_database_count(reply) {
                Some(count) => self.state_mut().set_database_count(count),
                None => debug!("server did not advertise its database count"),
            }
        }
        Ok(())
    }

    async fn round_trip(&self, transport: &mut Transport, command: Cmd) -> Result<Reply> {
        transport.send(command).await?;
        match timeout(self.config.connection_timeout, transport.next()).await {
            Ok(Some(Ok(reply))) => Ok(reply),
            Ok(Some(Err(e))) => Err(e.into()),
            Ok(None) => Err(Error::Connection(
                "server closed the connection during handshake".into(),
            )),
            Err(_) => Err(Error::Connection("handshake timed out".into())),
        }
    }
}

struct DispatcherTask {
    connector: Connector,
    rx: mpsc::UnboundedReceiver<Message>,
    transport: Option<Transport>,
    reconnecting: Option<ReconnectTask>,
    pending: VecDeque<PendingRequest>,
    next_seq: u64,
    // Database the server will be on once everything written so far has run.
    wire_db: u32,
}

impl DispatcherTask {
    fn new(connector: Connector, rx: mpsc::UnboundedReceiver<Message>) -> Self {
        let wire_db = connector.config.database_id;
        Self {
            connector,
            rx,
            transport: None,
            reconnecting: None,
            pending: VecDeque::new(),
            next_seq: 0,
            wire_db,
        }
    }

    fn state(&self) -> RwLockReadGuard<'_, ConnectionState> {
        self.connector.state()
    }

    fn state_mut(&self) -> RwLockWriteGuard<'_, ConnectionState> {
        self.connector.state_mut()
    }

    async fn run(mut self) {
        loop {
            // Nothing new goes on the wire while a pinned command waits on
            // its guard SELECT.
            let staged = self.pending.back().is_some_and(PendingRequest::is_staged);

            tokio::select! {
                msg = self.rx.recv(), if !staged => match msg {
                    Some(Message::Request(request)) => self.dispatch(request).await,
                    Some(Message::Close) => {
                        self.shutdown().await;
                        return;
                    }
                    None => {
                        debug!("every handle was dropped, stopping dispatcher");
                        self.shutdown().await;
                        return;
                    }
                },
                frame = read_frame(&mut self.transport) => match frame {
                    Some(Ok(reply)) => self.on_reply(reply).await,
                    Some(Err(e)) => self.on_disconnect(e).await,
                    None => {
                        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "server closed the connection");
                        self.on_disconnect(eof).await;
                    }
                },
                joined = join_reconnect(&mut self.reconnecting) => self.on_reconnected(joined),
            }
        }
    }

    async fn dispatch(&mut self, request: Request) {
        let Request { cmd, update, tx } = request;

        if self.state().is_closed() {
            let _ = tx.send(Err(closing()));
            return;
        }

        let Some(command) = cmd else {
            // Nothing to send, e.g. a password stored for the next reconnect.
            if let Some(update) = update {
                self.state_mut().apply(update);
            }
            let _ = tx.send(Ok(Reply::ok()));
            return;
        };

        if self.transport.is_none() {
            if let Err(e) = self.establish().await {
                let _ = tx.send(Err(e));
                return;
            }
            // close() may have landed while the socket was being set up.
            let closed = self.state().is_closed();
            if closed {
                let _ = tx.send(Err(closing()));
                return;
            }
        }

        let (cmds, keep, written) = match self.plan(command) {
            Ok(plan) => plan,
            Err(e) => {
                let _ = tx.send(Err(e));
                return;
            }
        };
        if let Some(StateUpdate::Database(db)) = &update {
            self.wire_db = *db;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        debug!("#{seq} -> {}", cmds[keep].name_lossy());

        let request = PendingRequest {
            seq,
            cmds,
            keep,
            written,
            replies: Vec::new(),
            update,
            tx,
            replayed: false,
        };
        let result = self.write(&request.cmds[..request.written]).await;
        self.pending.push_back(request);
        if let Err(e) = result {
            self.on_disconnect(e).await;
        }
    }

    /// Wraps a database-pinned command in SELECTs so the connection ends up
    /// where it started. Returns the commands, the index of the reply that
    /// answers the caller, and how many commands may be written right away.
    fn plan(&self, command: Cmd) -> Result<(Vec<Cmd>, usize, usize)> {
        match command.db() {
            Some(db) if db != self.wire_db => {
                let count = self.state().database_count();
                if let Some(count) = count {
                    if db >= count {
                        return Err(Error::request(format!(
                            "ERR DB index is out of range: {db} (server has {count} databases)"
                        )));
                    }
                }
                let restore = cmd("SELECT").arg(self.wire_db);
                let cmds = vec![cmd("SELECT").arg(db), command, restore];
                // An index the server may refuse: hold the command back
                // until the guard SELECT is acknowledged.
                let written = if count.is_some() { cmds.len() } else { 1 };
                Ok((cmds, 1, written))
            }
            _ => Ok((vec![command], 0, 1)),
        }
    }

    async fn write(&mut self, cmds: &[Cmd]) -> io::Result<()> {
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "not connected"))?;
        for command in cmds {
            transport.feed(command.clone()).await?;
        }
        SinkExt::<Cmd>::flush(transport).await
    }

    /// Database the server ends up on once every SELECT still in flight has
    /// run; the acknowledged one when none is.
    fn expected_db(&self) -> u32 {
        let in_flight = self.pending.iter().rev().find_map(|request| match &request.update {
            Some(StateUpdate::Database(db)) => Some(*db),
            _ => None,
        });
        match in_flight {
            Some(db) => db,
            None => self.state().database(),
        }
    }

    async fn on_reply(&mut self, reply: Reply) {
        let Some(front) = self.pending.front_mut() else {
            warn!("dropping reply with no pending request: {reply:?}");
            return;
        };
        front.replies.push(reply);

        if front.is_staged() && front.replies.len() == front.written {
            if front.replies.iter().any(Reply::is_error) {
                // Guard refused: the pinned command is never sent.
                front.cmds.truncate(front.written);
            } else {
                let rest = front.cmds[front.written..].to_vec();
                front.written = front.cmds.len();
                if let Err(e) = self.write(&rest).await {
                    self.on_disconnect(e).await;
                }
                return;
            }
        }
        if !front.is_complete() {
            return;
        }

        let Some(request) = self.pending.pop_front() else {
            return;
        };
        let seq = request.seq;
        let restore_failed = request.restore_failed();
        let (result, update, tx) = request.finish();

        match (&result, update) {
            (Ok(_), Some(update)) => {
                debug!("#{seq} applying {update:?}");
                self.state_mut().apply(update);
            }
            (Err(_), Some(StateUpdate::Database(_))) => {
                let db = self.expected_db();
                self.wire_db = db;
            }
            _ => {}
        }

        debug!("#{seq} <- {}", if result.is_ok() { "ok" } else { "error" });
        // The caller may have timed out and gone away.
        let _ = tx.send(result);

        if restore_failed {
            error!("#{seq} could not switch back to database {}", self.wire_db);
            let err = io::Error::new(io::ErrorKind::Other, "could not restore the selected database");
            self.on_disconnect(err).await;
        }
    }

    async fn on_disconnect(&mut self, err: io::Error) {
        warn!("connection lost: {err}");
        self.transport = None;

        let pending = std::mem::take(&mut self.pending);
        if pending.is_empty() {
            return;
        }

        match self.connector.config.inflight_policy {
            InflightPolicy::FailPending => {
                for request in pending {
                    request.fail(Error::Connection(err.to_string()));
                }
            }
            InflightPolicy::Replay => {
                // A request is replayed at most once, so one that keeps
                // killing the connection cannot loop forever.
                let (pending, exhausted): (Vec<_>, Vec<_>) =
                    pending.into_iter().partition(|request| !request.replayed);
                for request in exhausted {
                    request.fail(Error::Connection(err.to_string()));
                }
                if pending.is_empty() {
                    return;
                }
                if let Err(e) = self.establish().await {
                    for request in pending {
                        request.fail(e.clone());
                    }
                    return;
                }

                info!("replaying {} in-flight request(s)", pending.len());
                let mut pending = pending.into_iter();
                while let Some(mut request) = pending.next() {
                    request.replies.clear();
                    request.replayed = true;
                    if let Some(StateUpdate::Database(db)) = &request.update {
                        self.wire_db = *db;
                    }
                    if let Err(e) = self.write(&request.cmds[..request.written]).await {
                        warn!("replay failed: {e}");
                        self.transport = None;
                        let failure = Error::Connection(e.to_string());
                        let in_flight = std::mem::take(&mut self.pending);
                        for request in in_flight
                            .into_iter()
                            .chain(std::iter::once(request))
                            .chain(pending)
                        {
                            request.fail(failure.clone());
                        }
                        return;
                    }
                    self.pending.push_back(request);
                }
            }
        }
    }

    /// Makes one connection attempt right away. If it fails in a way worth
    /// retrying, the backoff continues in the background and requests fail
    /// fast with a connection error until a socket is back.
    async fn establish(&mut self) -> Result<()> {
        if self.reconnecting.is_some() {
            return Err(Error::Connection("reconnecting to the server".into()));
        }
        match self.connector.try_connect().await {
            Ok(transport) => {
                self.attach(transport);
                Ok(())
            }
            Err(ConnectFailure::Rejected(e)) => {
                error!("server rejected the handshake: {e}");
                Err(e)
            }
            Err(ConnectFailure::Transient(e)) => {
                warn!("connect failed, retrying in the background: {e}");
                let connector = self.connector.clone();
                self.reconnecting = Some(tokio::spawn(async move {
                    connector.connect_with_retry(false).await
                }));
                Err(e)
            }
        }
    }

    fn attach(&mut self, transport: Transport) {
        self.transport = Some(transport);
        let db = self.state().database();
        self.wire_db = db;
    }

    fn on_reconnected(&mut self, joined: std::result::Result<Result<Transport>, JoinError>) {
        match joined {
            Ok(Ok(transport)) => {
                info!("connection re-established");
                self.attach(transport);
            }
            Ok(Err(e)) => warn!("gave up reconnecting: {e}"),
            Err(e) => error!("reconnect task failed: {e}"),
        }
    }

    async fn shutdown(&mut self) {
        self.state_mut().mark_closed();
        self.rx.close();
        if let Some(task) = self.reconnecting.take() {
            task.abort();
        }

        for request in self.pending.drain(..) {
            request.fail(closing());
        }
        while let Some(msg) = self.rx.recv().await {
            if let Message::Request(request) = msg {
                let _ = request.tx.send(Err(closing()));
            }
        }

        self.transport = None;
        info!("dispatcher closed");
    }
}

async fn read_frame(transport: &mut Option<Transport>) -> Option<io::Result<Reply>> {
    match transport {
        Some(transport) => transport.next().await,
        None => std::future::pending().await,
    }
}

async fn join_reconnect(
    task: &mut Option<ReconnectTask>,
) -> std::result::Result<Result<Transport>, JoinError> {
    let Some(handle) = task.as_mut() else {
        return std::future::pending().await;
    };
    let joined = handle.await;
    *task = None;
    joined
}

/// Reads `databases` out of a CONFIG GET reply (map or flat array).
fn parse_database_count(reply: Reply) -> Option<u32> {
    reply
        .into_map()?
        .into_iter()
        .find(|(key, _)| key.as_str() == Some("databases"))
        .and_then(|(_, value)| value.as_str()?.parse().ok())
}
