//! In-process RESP server for exercising the client end to end.
//!
//! It keeps just enough server behaviour to answer the commands the tests
//! use: sixteen databases selected per connection, CONFIG with
//! `requirepass`, AUTH, client names, plus a few test-only verbs
//! (`SLOWPING ms`, `CRASH`, `CRASHONCE`) to provoke timeouts and
//! disconnects.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use resp_client::{ClientConfig, Reply, RespCodec};
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tokio_util::codec::Framed;

pub const DATABASES: usize = 16;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Debug)]
struct Shared {
    dbs: Vec<HashMap<String, Bytes>>,
    config: HashMap<String, String>,
    next_client_id: i64,
}

impl Default for Shared {
    fn default() -> Self {
        let config = [
            ("databases", DATABASES.to_string()),
            ("timeout", "0".to_string()),
            ("maxmemory", "0".to_string()),
            ("requirepass", String::new()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();

        Self {
            dbs: vec![HashMap::new(); DATABASES],
            config,
            next_client_id: 1,
        }
    }
}

pub struct FakeServer {
    pub addr: SocketAddr,
    shared: Arc<Mutex<Shared>>,
    commands_seen: Arc<AtomicUsize>,
    crashed_once: Arc<AtomicBool>,
    setname_delay_ms: Arc<AtomicU64>,
    accept_loop: JoinHandle<()>,
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.accept_loop.abort();
    }
}

impl FakeServer {
    pub async fn start() -> Self {
        init_logger();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Arc::new(Mutex::new(Shared::default()));
        let commands_seen = Arc::new(AtomicUsize::new(0));
        let crashed_once = Arc::new(AtomicBool::new(false));
        let setname_delay_ms = Arc::new(AtomicU64::new(0));

        let accept_loop = {
            let shared = shared.clone();
            let commands_seen = commands_seen.clone();
            let crashed_once = crashed_once.clone();
            let setname_delay_ms = setname_delay_ms.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((socket, _)) = listener.accept().await else {
                        return;
                    };
                    let mut conn = FakeConnection::new(
                        socket,
                        shared.clone(),
                        commands_seen.clone(),
                        crashed_once.clone(),
                        setname_delay_ms.clone(),
                    );
                    tokio::spawn(async move { conn.handle().await });
                }
            })
        };

        Self {
            addr,
            shared,
            commands_seen,
            crashed_once,
            setname_delay_ms,
            accept_loop,
        }
    }

    pub fn config(&self) -> ClientConfig {
        ClientConfig::new()
            .with_address(self.addr.ip().to_string(), self.addr.port())
            .with_request_timeout(Duration::from_secs(2))
            .with_connection_timeout(Duration::from_secs(2))
    }

    /// Commands received over all connections, handshakes included.
    pub fn commands_seen(&self) -> usize {
        self.commands_seen.load(Ordering::SeqCst)
    }

    pub fn set_requirepass(&self, password: &str) {
        self.shared
            .lock()
            .unwrap()
            .config
            .insert("requirepass".into(), password.into());
    }

    /// Makes `CONFIG GET databases` come back empty, as from a server that
    /// does not expose it.
    pub fn hide_database_count(&self) {
        self.shared.lock().unwrap().config.remove("databases");
    }

    /// Delays every later CLIENT SETNAME reply, handshakes included.
    pub fn set_setname_delay(&self, delay: Duration) {
        self.setname_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn key_in_db(&self, db: usize, key: &str) -> Option<Bytes> {
        self.shared.lock().unwrap().dbs[db].get(key).cloned()
    }
}

struct FakeConnection {
    framed: Framed<TcpStream, RespCodec>,
    shared: Arc<Mutex<Shared>>,
    commands_seen: Arc<AtomicUsize>,
    crashed_once: Arc<AtomicBool>,
    setname_delay_ms: Arc<AtomicU64>,
    db: usize,
    id: i64,
    name: Option<String>,
    authenticated: bool,
    resp3: bool,
}

fn err(msg: &str) -> Reply {
    Reply::Error(msg.to_string())
}

fn wrong_arity(command: &str) -> Reply {
    Reply::Error(format!(
        "ERR wrong number of arguments for '{}' command",
        command.to_lowercase()
    ))
}

enum Outcome {
    Reply(Reply),
    Hangup,
}

impl FakeConnection {
    fn new(
        socket: TcpStream,
        shared: Arc<Mutex<Shared>>,
        commands_seen: Arc<AtomicUsize>,
        crashed_once: Arc<AtomicBool>,
        setname_delay_ms: Arc<AtomicU64>,
    ) -> Self {
        let (id, authenticated) = {
            let mut shared = shared.lock().unwrap();
            let id = shared.next_client_id;
            shared.next_client_id += 1;
            (id, shared.config["requirepass"].is_empty())
        };
        Self {
            framed: Framed::new(socket, RespCodec),
            shared,
            commands_seen,
            crashed_once,
            setname_delay_ms,
            db: 0,
            id,
            name: None,
            authenticated,
            resp3: false,
        }
    }

    async fn handle(&mut self) {
        while let Some(Ok(frame)) = self.framed.next().await {
            self.commands_seen.fetch_add(1, Ordering::SeqCst);
            let args: Vec<String> = match frame {
                Reply::Array(parts) => parts
                    .into_iter()
                    .filter_map(|part| part.into_string())
                    .collect(),
                _ => return,
            };
            match self.execute(args).await {
                Outcome::Reply(reply) => {
                    if self.framed.send(reply).await.is_err() {
                        return;
                    }
                }
                Outcome::Hangup => return,
            }
        }
    }

    async fn execute(&mut self, args: Vec<String>) -> Outcome {
        let Some(verb) = args.first().map(|v| v.to_uppercase()) else {
            return Outcome::Reply(err("ERR empty command"));
        };
        let rest = &args[1..];

        if !self.authenticated && verb != "AUTH" && verb != "HELLO" {
            return Outcome::Reply(err("NOAUTH Authentication required."));
        }

        let reply = match verb.as_str() {
            "PING" => match rest {
                [] => Reply::SimpleString("PONG".into()),
                [msg] => Reply::bulk(msg.clone()),
                _ => wrong_arity("ping"),
            },
            "SLOWPING" => {
                let millis = rest.first().and_then(|ms| ms.parse().ok()).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Reply::SimpleString("SLOWPONG".into())
            }
            "CRASH" => return Outcome::Hangup,
            "CRASHONCE" => {
                if !self.crashed_once.swap(true, Ordering::SeqCst) {
                    return Outcome::Hangup;
                }
                Reply::ok()
            }
            "ECHO" => match rest {
                [msg] => Reply::bulk(msg.clone()),
                _ => wrong_arity("echo"),
            },
            "HELLO" => self.hello(rest),
            "AUTH" => self.auth(rest),
            "SELECT" => match rest {
                [index] => match index.parse::<usize>() {
                    Ok(db) if db < DATABASES => {
                        self.db = db;
                        Reply::ok()
                    }
                    _ => err("ERR DB index is out of range"),
                },
                _ => wrong_arity("select"),
            },
            "GET" => match rest {
                [key] => self.with_db(|db| db.get(key).cloned().map_or(Reply::Nil, Reply::BulkString)),
                _ => wrong_arity("get"),
            },
            "SET" => match rest {
                [key, value] => self.with_db(|db| {
                    db.insert(key.clone(), Bytes::from(value.clone()));
                    Reply::ok()
                }),
                _ => wrong_arity("set"),
            },
            "MSET" if !rest.is_empty() && rest.len() % 2 == 0 => self.with_db(|db| {
                for pair in rest.chunks(2) {
                    db.insert(pair[0].clone(), Bytes::from(pair[1].clone()));
                }
                Reply::ok()
            }),
            "MSET" => wrong_arity("mset"),
            "MGET" if !rest.is_empty() => self.with_db(|db| {
                Reply::Array(
                    rest.iter()
                        .map(|key| db.get(key).cloned().map_or(Reply::Nil, Reply::BulkString))
                        .collect(),
                )
            }),
            "DEL" if !rest.is_empty() => self.with_db(|db| {
                Reply::Integer(rest.iter().filter(|key| db.remove(*key).is_some()).count() as i64)
            }),
            "DBSIZE" => self.with_db(|db| Reply::Integer(db.len() as i64)),
            "FLUSHDB" => self.with_db(|db| {
                db.clear();
                Reply::ok()
            }),
            "FLUSHALL" => {
                for db in self.shared.lock().unwrap().dbs.iter_mut() {
                    db.clear();
                }
                Reply::ok()
            }
            "SCAN" => self.with_db(|db| {
                Reply::Array(vec![
                    Reply::bulk("0"),
                    Reply::Array(db.keys().map(|k| Reply::bulk(k.clone())).collect()),
                ])
            }),
            "CONFIG" => self.config(rest),
            "CLIENT" => {
                if rest.first().is_some_and(|sub| sub.eq_ignore_ascii_case("SETNAME")) {
                    let delay = self.setname_delay_ms.load(Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                self.client(rest)
            }
            _ => Reply::Error(format!(
                "ERR unknown command '{}', with args beginning with: {}",
                args[0],
                rest.iter().map(|a| format!("'{a}' ")).collect::<String>()
            )),
        };
        Outcome::Reply(reply)
    }

    fn with_db(&self, f: impl FnOnce(&mut HashMap<String, Bytes>) -> Reply) -> Reply {
        let mut shared = self.shared.lock().unwrap();
        f(&mut shared.dbs[self.db])
    }

    fn requirepass(&self) -> String {
        self.shared.lock().unwrap().config["requirepass"].clone()
    }

    fn auth(&mut self, rest: &[String]) -> Reply {
        let password = match rest {
            [password] | [_, password] => password,
            _ => return wrong_arity("auth"),
        };
        let required = self.requirepass();
        if required.is_empty() {
            return err("ERR AUTH <password> called without any password configured for the default user. Are you sure your configuration is correct?");
        }
        if *password != required {
            return err("WRONGPASS invalid username-password pair or user is disabled.");
        }
        self.authenticated = true;
        Reply::ok()
    }

    fn hello(&mut self, rest: &[String]) -> Reply {
        let mut iter = rest.iter();
        match iter.next().map(String::as_str) {
            Some("3") => self.resp3 = true,
            Some("2") | None => self.resp3 = false,
            Some(_) => return err("NOPROTO unsupported protocol version"),
        }
        while let Some(option) = iter.next() {
            match option.to_uppercase().as_str() {
                "AUTH" => {
                    let (Some(user), Some(pass)) = (iter.next(), iter.next()) else {
                        return err("ERR Syntax error in HELLO option 'auth'");
                    };
                    let reply = self.auth(&[user.clone(), pass.clone()]);
                    if reply.is_error() {
                        return reply;
                    }
                }
                "SETNAME" => self.name = iter.next().cloned(),
                _ => return err("ERR Syntax error in HELLO option"),
            }
        }
        if !self.authenticated {
            return err("NOAUTH HELLO must be called with the client already authenticated");
        }
        Reply::Map(
            [
                (Reply::bulk("server"), Reply::bulk("fake")),
                (Reply::bulk("proto"), Reply::Integer(if self.resp3 { 3 } else { 2 })),
                (Reply::bulk("id"), Reply::Integer(self.id)),
            ]
            .into_iter()
            .collect(),
        )
    }

    fn config(&mut self, rest: &[String]) -> Reply {
        let Some(sub) = rest.first().map(|s| s.to_uppercase()) else {
            return wrong_arity("config");
        };
        let params = &rest[1..];
        let mut shared = self.shared.lock().unwrap();
        match sub.as_str() {
            "GET" if !params.is_empty() => {
                let pairs: Vec<(Reply, Reply)> = params
                    .iter()
                    .filter_map(|p| {
                        shared
                            .config
                            .get(p)
                            .map(|v| (Reply::bulk(p.clone()), Reply::bulk(v.clone())))
                    })
                    .collect();
                if self.resp3 {
                    Reply::Map(pairs.into_iter().collect())
                } else {
                    Reply::Array(pairs.into_iter().flat_map(|(k, v)| [k, v]).collect())
                }
            }
            "SET" if !params.is_empty() && params.len() % 2 == 0 => {
                for pair in params.chunks(2) {
                    if !shared.config.contains_key(&pair[0]) {
                        return Reply::Error(format!(
                            "ERR Unknown option or number of arguments for CONFIG SET - '{}'",
                            pair[0]
                        ));
                    }
                }
                for pair in params.chunks(2) {
                    shared.config.insert(pair[0].clone(), pair[1].clone());
                }
                Reply::ok()
            }
            "RESETSTAT" => Reply::ok(),
            _ => wrong_arity(&format!("config|{}", sub.to_lowercase())),
        }
    }

    fn client(&mut self, rest: &[String]) -> Reply {
        match rest {
            [sub] if sub.eq_ignore_ascii_case("ID") => Reply::Integer(self.id),
            [sub] if sub.eq_ignore_ascii_case("GETNAME") => self
                .name
                .clone()
                .map_or(Reply::Nil, Reply::bulk),
            [sub, name] if sub.eq_ignore_ascii_case("SETNAME") => {
                if name.contains(' ') {
                    return err("ERR Client names cannot contain spaces, newlines or special characters.");
                }
                self.name = (!name.is_empty()).then(|| name.clone());
                Reply::ok()
            }
            [sub] if sub.eq_ignore_ascii_case("INFO") => Reply::bulk(format!(
                "id={} name={} db={}\n",
                self.id,
                self.name.clone().unwrap_or_default(),
                self.db
            )),
            _ => err("ERR unknown subcommand"),
        }
    }
}
