//! A small in-process MQTT 3.1.1 broker for round-trip tests.
//!
//! Enough of the protocol for the client under test: CONNECT with optional
//! username/password, QoS 0 fan-out with `+` and `#` filters, PUBACK and
//! PUBREC/PUBCOMP for inbound QoS 1 and 2, SUBACK with a deny list, UNSUBACK
//! and PINGRESP. Every message published under `test/#` is republished to the
//! same topic with `/echo` appended, unless it already ends in `/echo`.

use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{tcp::OwnedReadHalf, TcpListener, TcpStream},
    runtime::Runtime,
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

const CONNECT: u8 = 1;
const PUBLISH: u8 = 3;
const PUBREL: u8 = 6;
const SUBSCRIBE: u8 = 8;
const UNSUBSCRIBE: u8 = 10;
const PINGREQ: u8 = 12;
const DISCONNECT: u8 = 14;

const ECHO_FILTER: &str = "test/#";
const ECHO_SUFFIX: &str = "/echo";

#[derive(Debug, Clone, Default)]
pub struct BrokerConfig {
    /// Required username and password, if any.
    pub credentials: Option<(String, String)>,
    /// Subscriptions to filters matching any of these are refused.
    pub deny: Vec<String>,
}

struct Session {
    filters: Vec<String>,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    kick: CancellationToken,
}

struct State {
    config: BrokerConfig,
    sessions: Mutex<HashMap<u64, Session>>,
    next_id: AtomicU64,
    connects: AtomicUsize,
}

pub struct Broker {
    addr: SocketAddr,
    state: Arc<State>,
    shutdown: CancellationToken,
    runtime: Option<Runtime>,
}

impl Broker {
    /// Open broker: no credentials, no deny list.
    pub fn start() -> Self {
        Self::with_config(BrokerConfig::default())
    }

    pub fn with_config(config: BrokerConfig) -> Self {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .thread_name("test-broker")
            .build()
            .expect("broker runtime");

        let listener = runtime
            .block_on(TcpListener::bind("127.0.0.1:0"))
            .expect("bind broker listener");
        let addr = listener.local_addr().expect("broker address");

        let state = Arc::new(State {
            config,
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            connects: AtomicUsize::new(0),
        });
        let shutdown = CancellationToken::new();
        runtime.spawn(accept(listener, state.clone(), shutdown.clone()));

        Self {
            addr,
            state,
            shutdown,
            runtime: Some(runtime),
        }
    }

    pub fn url(&self) -> String {
        format!("mqtt://{}", self.addr)
    }

    /// Number of accepted CONNECT packets so far.
    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Drops every client connection without a DISCONNECT.
    pub fn kick_all(&self) {
        for session in self.state.sessions.lock().values() {
            session.kick.cancel();
        }
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

async fn accept(listener: TcpListener, state: Arc<State>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tokio::spawn(serve(stream, state.clone(), shutdown.child_token()));
                }
                Err(_) => return,
            }
        }
    }
}

async fn serve(stream: TcpStream, state: Arc<State>, kick: CancellationToken) {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if writer.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    let id = state.next_id.fetch_add(1, Ordering::SeqCst);
    let _ = session(&mut reader, id, &state, &tx, &kick).await;

    state.sessions.lock().remove(&id);
    drop(tx);
    let _ = writer_task.await;
}

async fn session(
    reader: &mut OwnedReadHalf,
    id: u64,
    state: &State,
    tx: &mpsc::UnboundedSender<Vec<u8>>,
    kick: &CancellationToken,
) -> io::Result<()> {
    let mut authenticated = false;

    loop {
        let (header, body) = tokio::select! {
            _ = kick.cancelled() => return Ok(()),
            packet = read_packet(reader) => match packet? {
                Some(packet) => packet,
                None => return Ok(()),
            },
        };
        let mut body = Reader::new(&body);

        match header >> 4 {
            CONNECT => {
                let accepted = check_connect(&mut body, &state.config)?;
                let code = if accepted { 0 } else { 4 };
                let _ = tx.send(vec![0x20, 0x02, 0x00, code]);
                if !accepted {
                    return Ok(());
                }

                authenticated = true;
                state.connects.fetch_add(1, Ordering::SeqCst);
                state.sessions.lock().insert(
                    id,
                    Session {
                        filters: Vec::new(),
                        tx: tx.clone(),
                        kick: kick.clone(),
                    },
                );
            }
            _ if !authenticated => return Ok(()),
            PUBLISH => {
                let qos = (header >> 1) & 0x03;
                let topic = body.string()?;
                let pkid = if qos > 0 { body.u16()? } else { 0 };
                let payload = body.rest();

                match qos {
                    1 => send_ack(tx, 0x40, pkid),
                    2 => send_ack(tx, 0x50, pkid),
                    _ => {}
                }
                route(state, &topic, payload);
                if matches(ECHO_FILTER, &topic) && !topic.ends_with(ECHO_SUFFIX) {
                    route(state, &format!("{topic}{ECHO_SUFFIX}"), payload);
                }
            }
            PUBREL => send_ack(tx, 0x70, body.u16()?),
            SUBSCRIBE => {
                let pkid = body.u16()?;
                let mut codes: Vec<u8> = Vec::new();
                let mut granted = Vec::new();
                while !body.is_empty() {
                    let filter = body.string()?;
                    let _requested_qos = body.u8()?;
                    if state.config.deny.iter().any(|deny| matches(deny, &filter)) {
                        codes.push(0x80);
                    } else {
                        codes.push(0x00);
                        granted.push(filter);
                    }
                }
                if let Some(session) = state.sessions.lock().get_mut(&id) {
                    for filter in granted {
                        if !session.filters.contains(&filter) {
                            session.filters.push(filter);
                        }
                    }
                }

                let mut ack = pkid.to_be_bytes().to_vec();
                ack.extend(codes);
                let _ = tx.send(frame(0x90, &ack));
            }
            UNSUBSCRIBE => {
                let pkid = body.u16()?;
                let mut removed = Vec::new();
                while !body.is_empty() {
                    removed.push(body.string()?);
                }
                if let Some(session) = state.sessions.lock().get_mut(&id) {
                    session.filters.retain(|f| !removed.contains(f));
                }
                send_ack(tx, 0xB0, pkid);
            }
            PINGREQ => {
                let _ = tx.send(vec![0xD0, 0x00]);
            }
            DISCONNECT => return Ok(()),
            _ => {}
        }
    }
}

fn check_connect(body: &mut Reader<'_>, config: &BrokerConfig) -> io::Result<bool> {
    let _protocol = body.string()?;
    let _level = body.u8()?;
    let flags = body.u8()?;
    let _keepalive = body.u16()?;
    let _client_id = body.string()?;

    if flags & 0x04 != 0 {
        let _will_topic = body.string()?;
        let _will_payload = body.binary()?;
    }
    let username = if flags & 0x80 != 0 {
        Some(body.string()?)
    } else {
        None
    };
    let password = if flags & 0x40 != 0 {
        Some(String::from_utf8_lossy(body.binary()?).into_owned())
    } else {
        None
    };

    Ok(match &config.credentials {
        None => true,
        Some((user, pass)) => {
            username.as_deref() == Some(user.as_str()) && password.as_deref() == Some(pass.as_str())
        }
    })
}

fn route(state: &State, topic: &str, payload: &[u8]) {
    let mut body = Vec::with_capacity(topic.len() + payload.len() + 2);
    body.extend((topic.len() as u16).to_be_bytes());
    body.extend(topic.as_bytes());
    body.extend(payload);
    let packet = frame(0x30, &body);

    for session in state.sessions.lock().values() {
        if session.filters.iter().any(|f| matches(f, topic)) {
            let _ = session.tx.send(packet.clone());
        }
    }
}

fn send_ack(tx: &mpsc::UnboundedSender<Vec<u8>>, header: u8, pkid: u16) {
    let [hi, lo] = pkid.to_be_bytes();
    let _ = tx.send(vec![header, 0x02, hi, lo]);
}

/// Topic filter matching with `+` (one level) and `#` (all remaining levels).
pub fn matches(filter: &str, topic: &str) -> bool {
    let mut filter = filter.split('/');
    let mut topic = topic.split('/');
    loop {
        match (filter.next(), topic.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

fn frame(header: u8, body: &[u8]) -> Vec<u8> {
    let mut out = vec![header];
    let mut len = body.len();
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
    out.extend(body);
    out
}

async fn read_packet(reader: &mut OwnedReadHalf) -> io::Result<Option<(u8, Vec<u8>)>> {
    let header = match reader.read_u8().await {
        Ok(header) => header,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };

    let mut len = 0usize;
    let mut shift = 0;
    loop {
        let byte = reader.read_u8().await?;
        len |= ((byte & 0x7F) as usize) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 21 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "remaining length"));
        }
    }

    let mut body = vec![0; len];
    reader.read_exact(&mut body).await?;
    Ok(Some((header, body)))
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, n: usize) -> io::Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "short packet"));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> io::Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> io::Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn binary(&mut self) -> io::Result<&'a [u8]> {
        let len = self.u16()? as usize;
        self.take(len)
    }

    fn string(&mut self) -> io::Result<String> {
        let bytes = self.binary()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }
}

