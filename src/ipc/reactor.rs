//! Event-driven reactor.
//!
//! One reactor per instance multiplexes the listening socket, accepted and
//! outbound connections, timers and an interrupt wake, all on a single
//! thread. mio supplies the OS primitive (epoll, kqueue or IOCP) behind one
//! interface; the connection state machine is identical on every backend:
//!
//! ```text
//! CLOSED → accept/connect → AWAIT_HANDSHAKE → READY
//! READY:  read 16-byte header, read body, dispatch on msgtype
//!         SYNC → evaluate, enqueue RESP   ASYNC → evaluate, discard
//!         RESP → park for the pending synchronous caller
//! ```
//!
//! Writes drain the front of the per-connection queue until the kernel
//! pushes back, at which point OUT interest is armed. SIGINT writes through
//! the waker; the loop treats it as a normal wake, sets exit code 0 and
//! falls out.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use once_cell::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::eval;
use crate::obj::Obj;
use crate::wire::{self, MsgType, HEADER_SIZE};
use crate::vm;
use crate::{RayError, Result};

use super::{handshake_byte, SELECTOR_ID_OFFSET, SYNC_TIMEOUT, TX_QUEUE_SIZE};

const TOK_WAKER: Token = Token(0);
const TOK_LISTENER: Token = Token(1);
const MAX_EVENTS: usize = 1024;
const HANDSHAKE_MAX: usize = 256;

static SIGINT_FLAG: AtomicBool = AtomicBool::new(false);
static SIGNAL_WAKER: OnceCell<Arc<Waker>> = OnceCell::new();

#[cfg(unix)]
extern "C" fn sigint_handler(_sig: libc::c_int) {
    SIGINT_FLAG.store(true, Ordering::Release);
    if let Some(w) = SIGNAL_WAKER.get() {
        let _ = w.wake();
    }
}

/// Connection hooks: fired with the connection id after the handshake
/// completes and just before teardown (the `.z.po` / `.z.pc` surface).
pub type Hook = Box<dyn FnMut(i64)>;

/// Evaluation callback for inbound SYNC/ASYNC payloads. The default
/// evaluates value trees; installing a parser-aware one is the REPL
/// front-end's business.
pub type Evaluator = Box<dyn FnMut(&Obj) -> Obj>;

#[derive(PartialEq)]
enum PollOutcome {
    Done,
    Pending,
    Error,
}

struct Conn {
    stream: TcpStream,
    id: i64,
    client_side: bool,
    handshake_done: bool,
    hs_buf: Vec<u8>,

    rx_head: [u8; HEADER_SIZE],
    rx_got: usize,
    rx_body: Vec<u8>,
    rx_need: usize,
    rx_msgtype: MsgType,
    rx_in_body: bool,

    tx_cur: Vec<u8>,
    tx_sent: usize,
    tx_q: VecDeque<Vec<u8>>,
    out_armed: bool,

    resp: Option<Obj>,
}

impl Conn {
    fn new(stream: TcpStream, id: i64, client_side: bool) -> Self {
        Self {
            stream,
            id,
            client_side,
            handshake_done: false,
            hs_buf: Vec::new(),
            rx_head: [0; HEADER_SIZE],
            rx_got: 0,
            rx_body: Vec::new(),
            rx_need: 0,
            rx_msgtype: MsgType::Async,
            rx_in_body: false,
            tx_cur: Vec::new(),
            tx_sent: 0,
            tx_q: VecDeque::new(),
            out_armed: false,
            resp: None,
        }
    }

    fn reset_rx(&mut self) {
        self.rx_got = 0;
        self.rx_body = Vec::new();
        self.rx_need = 0;
        self.rx_in_body = false;
    }
}

struct TimerEntry {
    deadline: Instant,
    id: u64,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Min-heap by deadline.
        other.deadline.cmp(&self.deadline).then(other.id.cmp(&self.id))
    }
}

/// Handle for stopping a running reactor from another thread.
#[derive(Clone)]
pub struct Shutdown {
    waker: Arc<Waker>,
    flag: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::Release);
        let _ = self.waker.wake();
    }
}

pub struct Reactor {
    poll: Poll,
    waker: Arc<Waker>,
    stop: Arc<AtomicBool>,
    listener: Option<TcpListener>,
    conns: Vec<Option<Conn>>,
    free: Vec<usize>,
    timers: BinaryHeap<TimerEntry>,
    timer_cbs: HashMap<u64, Box<dyn FnOnce()>>,
    next_timer: u64,
    evaluator: Evaluator,
    on_open: Option<Hook>,
    on_close: Option<Hook>,
    exit: Option<i64>,
}

impl Reactor {
    /// Create a reactor; a `port` opens the listening socket immediately.
    pub fn new(port: Option<u16>) -> Result<Reactor> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), TOK_WAKER)?);

        let listener = match port {
            Some(port) => {
                let addr: SocketAddr = format!("0.0.0.0:{}", port).parse().unwrap();
                let mut l = TcpListener::bind(addr)?;
                poll.registry().register(&mut l, TOK_LISTENER, Interest::READABLE)?;
                info!(port, "listening");
                Some(l)
            }
            None => None,
        };

        let _ = SIGNAL_WAKER.set(Arc::clone(&waker));
        #[cfg(unix)]
        unsafe {
            libc::signal(libc::SIGINT, sigint_handler as usize);
        }

        Ok(Reactor {
            poll,
            waker,
            stop: Arc::new(AtomicBool::new(false)),
            listener,
            conns: Vec::new(),
            free: Vec::new(),
            timers: BinaryHeap::new(),
            timer_cbs: HashMap::new(),
            next_timer: 0,
            evaluator: Box::new(|expr| eval::eval(expr)),
            on_open: None,
            on_close: None,
            exit: None,
        })
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        Shutdown { waker: Arc::clone(&self.waker), flag: Arc::clone(&self.stop) }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn set_evaluator(&mut self, f: Evaluator) {
        self.evaluator = f;
    }

    pub fn set_on_open(&mut self, f: Hook) {
        self.on_open = Some(f);
    }

    pub fn set_on_close(&mut self, f: Hook) {
        self.on_close = Some(f);
    }

    /// Schedule `cb` to run on the loop thread at `delay` from now.
    pub fn add_timer(&mut self, delay: Duration, cb: Box<dyn FnOnce()>) -> u64 {
        let id = self.next_timer;
        self.next_timer += 1;
        self.timers.push(TimerEntry { deadline: Instant::now() + delay, id });
        self.timer_cbs.insert(id, cb);
        id
    }

    /// Request loop exit with `code`.
    pub fn exit(&mut self, code: i64) {
        self.exit = Some(code);
    }

    fn register(&mut self, mut stream: TcpStream, client_side: bool) -> Result<i64> {
        let slot = match self.free.pop() {
            Some(s) => s,
            None => {
                self.conns.push(None);
                self.conns.len() - 1
            }
        };
        let id = (slot + SELECTOR_ID_OFFSET) as i64;
        self.poll
            .registry()
            .register(&mut stream, Token(id as usize), Interest::READABLE)?;
        self.conns[slot] = Some(Conn::new(stream, id, client_side));
        debug!(id, client_side, "connection registered");
        Ok(id)
    }

    fn slot_of(&self, id: i64) -> Option<usize> {
        let slot = (id as usize).checked_sub(SELECTOR_ID_OFFSET)?;
        if slot < self.conns.len() && self.conns[slot].is_some() {
            Some(slot)
        } else {
            None
        }
    }

    fn take_conn(&mut self, id: i64) -> Option<Conn> {
        let slot = self.slot_of(id)?;
        self.conns[slot].take()
    }

    fn put_conn(&mut self, conn: Conn) {
        let slot = conn.id as usize - SELECTOR_ID_OFFSET;
        self.conns[slot] = Some(conn);
    }

    /// Tear down a connection: fire the close hook, deregister, release the
    /// id back to the freelist.
    fn deregister(&mut self, id: i64) {
        let Some(slot) = self.slot_of(id) else { return };
        if let Some(hook) = self.on_close.as_mut() {
            hook(id);
        }
        if let Some(mut conn) = self.conns[slot].take() {
            let _ = self.poll.registry().deregister(&mut conn.stream);
        }
        self.free.push(slot);
        debug!(id, "connection closed");
    }

    /// Connect to a peer, sending `user:pass` credentials when given.
    /// Returns the connection id once registered; the handshake completes
    /// asynchronously (or synchronously inside the first `send_sync`).
    pub fn connect(&mut self, addr: SocketAddr, creds: Option<&str>) -> Result<i64> {
        let stream = TcpStream::connect(addr)?;
        let id = self.register(stream, true)?;
        let slot = self.slot_of(id).unwrap();
        let conn = self.conns[slot].as_mut().unwrap();
        let mut hello = Vec::new();
        if let Some(c) = creds {
            hello.extend_from_slice(c.as_bytes());
        }
        hello.push(handshake_byte());
        hello.push(0);
        conn.tx_cur = hello;
        conn.tx_sent = 0;
        self.drive_tx(id);
        Ok(id)
    }

    // -- handshake ---------------------------------------------------------

    fn handle_handshake(&mut self, conn: &mut Conn) -> PollOutcome {
        // Both sides read until the peer's NUL; the acceptor then replies
        // with its own version byte.
        let mut byte = [0u8; 1];
        loop {
            match conn.stream.read(&mut byte) {
                Ok(0) => return PollOutcome::Error,
                Ok(_) => {
                    if byte[0] == 0 {
                        let _peer_version = conn.hs_buf.last().copied().unwrap_or(0);
                        conn.handshake_done = true;
                        if !conn.client_side {
                            let reply = [handshake_byte(), 0u8];
                            conn.tx_cur.extend_from_slice(&reply);
                        }
                        return PollOutcome::Done;
                    }
                    conn.hs_buf.push(byte[0]);
                    if conn.hs_buf.len() > HANDSHAKE_MAX {
                        return PollOutcome::Error;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return PollOutcome::Pending,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return PollOutcome::Error,
            }
        }
    }

    // -- receive -----------------------------------------------------------

    /// Pull bytes until the kernel runs dry, yielding complete frames.
    fn recv_frames(&mut self, conn: &mut Conn) -> (Vec<(MsgType, Vec<u8>)>, PollOutcome) {
        let mut frames = Vec::new();

        if !conn.handshake_done {
            match self.handle_handshake(conn) {
                PollOutcome::Done => {
                    let id = conn.id;
                    self.drive_conn_tx(conn);
                    if let Some(hook) = self.on_open.as_mut() {
                        hook(id);
                    }
                }
                other => return (frames, other),
            }
        }

        loop {
            if !conn.rx_in_body {
                match conn.stream.read(&mut conn.rx_head[conn.rx_got..]) {
                    Ok(0) => return (frames, PollOutcome::Error),
                    Ok(n) => {
                        conn.rx_got += n;
                        if conn.rx_got == HEADER_SIZE {
                            let header = match wire::parse_header(&conn.rx_head) {
                                Ok(h) => h,
                                Err(e) => {
                                    warn!(id = conn.id, error = %e, "bad frame header");
                                    return (frames, PollOutcome::Error);
                                }
                            };
                            conn.rx_msgtype = header.msgtype;
                            conn.rx_need = header.size as usize;
                            conn.rx_body = vec![0u8; conn.rx_need];
                            conn.rx_got = 0;
                            conn.rx_in_body = true;
                            if conn.rx_need == 0 {
                                frames.push((conn.rx_msgtype, std::mem::take(&mut conn.rx_body)));
                                conn.reset_rx();
                            }
                        }
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return (frames, PollOutcome::Pending)
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => return (frames, PollOutcome::Error),
                }
            } else {
                let need = conn.rx_need;
                match conn.stream.read(&mut conn.rx_body[conn.rx_got..need]) {
                    Ok(0) => return (frames, PollOutcome::Error),
                    Ok(n) => {
                        conn.rx_got += n;
                        if conn.rx_got == need {
                            frames.push((conn.rx_msgtype, std::mem::take(&mut conn.rx_body)));
                            conn.reset_rx();
                        }
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return (frames, PollOutcome::Pending)
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => return (frames, PollOutcome::Error),
                }
            }
        }
    }

    /// Evaluate one inbound frame and queue the response where one is due.
    fn handle_frame(&mut self, conn: &mut Conn, msgtype: MsgType, payload: Vec<u8>) {
        let value = match wire::deserialize(&payload) {
            Ok(v) => v,
            Err(e) => {
                warn!(id = conn.id, error = %e, "undecodable payload");
                crate::error::err_parse()
            }
        };

        match msgtype {
            MsgType::Sync => {
                vm::set_user_fd(conn.id);
                let result = if value.is_err() { value } else { (self.evaluator)(&value) };
                vm::set_user_fd(0);
                self.enqueue(conn, MsgType::Resp, &result);
                self.drive_conn_tx(conn);
            }
            MsgType::Async => {
                if !value.is_err() {
                    vm::set_user_fd(conn.id);
                    let v = (self.evaluator)(&value);
                    vm::set_user_fd(0);
                    drop(v);
                }
            }
            MsgType::Resp => {
                conn.resp = Some(value);
            }
        }
    }

    // -- send --------------------------------------------------------------

    fn enqueue(&mut self, conn: &mut Conn, msgtype: MsgType, v: &Obj) {
        let bytes = match wire::serialize(v, msgtype) {
            Ok(b) => b,
            Err(e) => {
                warn!(id = conn.id, error = %e, "unserializable value");
                let err = crate::error::err_nyi(v.tag());
                wire::serialize(&err, msgtype).expect("error values always serialize")
            }
        };
        if conn.tx_cur.is_empty() {
            conn.tx_cur = bytes;
            conn.tx_sent = 0;
        } else if conn.tx_q.len() < TX_QUEUE_SIZE {
            conn.tx_q.push_back(bytes);
        } else {
            warn!(id = conn.id, "tx queue overflow");
        }
    }

    fn drive_conn_tx(&mut self, conn: &mut Conn) -> PollOutcome {
        loop {
            while conn.tx_sent < conn.tx_cur.len() {
                match conn.stream.write(&conn.tx_cur[conn.tx_sent..]) {
                    Ok(0) => return PollOutcome::Error,
                    Ok(n) => conn.tx_sent += n,
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        if !conn.out_armed {
                            conn.out_armed = true;
                            let tok = Token(conn.id as usize);
                            if self
                                .poll
                                .registry()
                                .reregister(
                                    &mut conn.stream,
                                    tok,
                                    Interest::READABLE | Interest::WRITABLE,
                                )
                                .is_err()
                            {
                                return PollOutcome::Error;
                            }
                        }
                        return PollOutcome::Pending;
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => return PollOutcome::Error,
                }
            }
            conn.tx_cur.clear();
            conn.tx_sent = 0;
            match conn.tx_q.pop_front() {
                Some(next) => {
                    conn.tx_cur = next;
                }
                None => break,
            }
        }

        if conn.out_armed {
            conn.out_armed = false;
            let tok = Token(conn.id as usize);
            if self
                .poll
                .registry()
                .reregister(&mut conn.stream, tok, Interest::READABLE)
                .is_err()
            {
                return PollOutcome::Error;
            }
        }
        PollOutcome::Done
    }

    fn drive_tx(&mut self, id: i64) {
        let Some(mut conn) = self.take_conn(id) else { return };
        let outcome = self.drive_conn_tx(&mut conn);
        if outcome == PollOutcome::Error {
            self.put_conn(conn);
            self.deregister(id);
        } else {
            self.put_conn(conn);
        }
    }

    // -- readiness dispatch ------------------------------------------------

    fn handle_readable(&mut self, id: i64) {
        let Some(mut conn) = self.take_conn(id) else { return };
        let (frames, outcome) = self.recv_frames(&mut conn);
        for (msgtype, payload) in frames {
            self.handle_frame(&mut conn, msgtype, payload);
        }
        self.put_conn(conn);
        if outcome == PollOutcome::Error {
            self.deregister(id);
        }
    }

    fn accept_all(&mut self) {
        loop {
            let accepted = match self.listener.as_ref() {
                Some(l) => l.accept(),
                None => return,
            };
            match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted");
                    if let Err(e) = self.register(stream, false) {
                        warn!(error = %e, "failed to register accepted socket");
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();
        while let Some(top) = self.timers.peek() {
            if top.deadline > now {
                break;
            }
            let entry = self.timers.pop().unwrap();
            if let Some(cb) = self.timer_cbs.remove(&entry.id) {
                cb();
            }
        }
    }

    fn next_timeout(&self) -> Option<Duration> {
        self.timers
            .peek()
            .map(|t| t.deadline.saturating_duration_since(Instant::now()))
    }

    /// Run the loop until interrupted or asked to exit. Returns the exit
    /// code: 0 for a clean shutdown, 1 on reactor failure.
    pub fn run(&mut self) -> i64 {
        let mut events = Events::with_capacity(MAX_EVENTS);
        while self.exit.is_none() {
            let timeout = self.next_timeout();
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                warn!(error = %e, "poll failed");
                return 1;
            }

            if SIGINT_FLAG.swap(false, Ordering::AcqRel) || self.stop.load(Ordering::Acquire) {
                self.exit = Some(0);
                break;
            }

            for event in events.iter() {
                match event.token() {
                    TOK_WAKER => {}
                    TOK_LISTENER => self.accept_all(),
                    Token(t) => {
                        let id = t as i64;
                        if event.is_error() || event.is_read_closed() && !event.is_readable() {
                            self.deregister(id);
                            continue;
                        }
                        if event.is_readable() || event.is_read_closed() {
                            self.handle_readable(id);
                        }
                        if event.is_writable() {
                            self.drive_tx(id);
                        }
                    }
                }
            }

            self.fire_timers();
        }
        self.exit.unwrap_or(0)
    }

    // -- synchronous client RPC --------------------------------------------

    #[cfg(unix)]
    fn wait_fd(conn: &Conn, write: bool, timeout: Duration) -> Result<()> {
        use std::os::unix::io::AsRawFd;
        let mut pfd = libc::pollfd {
            fd: conn.stream.as_raw_fd(),
            events: if write { libc::POLLOUT } else { libc::POLLIN },
            revents: 0,
        };
        let ms = timeout.as_millis() as libc::c_int;
        loop {
            let r = unsafe { libc::poll(&mut pfd, 1, ms) };
            if r > 0 {
                return Ok(());
            }
            if r == 0 {
                return Err(RayError::SyncTimeout);
            }
            let e = io::Error::last_os_error();
            if e.kind() != io::ErrorKind::Interrupted {
                return Err(e.into());
            }
        }
    }

    #[cfg(not(unix))]
    fn wait_fd(_conn: &Conn, _write: bool, timeout: Duration) -> Result<()> {
        std::thread::sleep(timeout.min(Duration::from_millis(10)));
        Ok(())
    }

    /// Send `msg` as a SYNC frame and block until the matching RESP comes
    /// back. Frames that arrive in the meantime are processed as nested
    /// requests so the peer can reenter.
    pub fn send_sync(&mut self, id: i64, msg: &Obj) -> Result<Obj> {
        let Some(mut conn) = self.take_conn(id) else {
            return Err(RayError::UnknownConnection(id));
        };

        self.enqueue(&mut conn, MsgType::Sync, msg);
        loop {
            match self.drive_conn_tx(&mut conn) {
                PollOutcome::Done => break,
                PollOutcome::Pending => {
                    if let Err(e) = Self::wait_fd(&conn, true, SYNC_TIMEOUT) {
                        self.put_conn(conn);
                        self.deregister(id);
                        return Err(e);
                    }
                }
                PollOutcome::Error => {
                    self.put_conn(conn);
                    self.deregister(id);
                    return Err(RayError::UnknownConnection(id));
                }
            }
        }

        loop {
            let (frames, outcome) = self.recv_frames(&mut conn);
            for (msgtype, payload) in frames {
                self.handle_frame(&mut conn, msgtype, payload);
            }
            if let Some(resp) = conn.resp.take() {
                self.put_conn(conn);
                return Ok(resp);
            }
            match outcome {
                PollOutcome::Error => {
                    self.put_conn(conn);
                    self.deregister(id);
                    return Err(RayError::UnknownConnection(id));
                }
                _ => {
                    if let Err(e) = Self::wait_fd(&conn, false, SYNC_TIMEOUT) {
                        self.put_conn(conn);
                        self.deregister(id);
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Queue `msg` as an ASYNC frame and return immediately.
    pub fn send_async(&mut self, id: i64, msg: &Obj) -> Result<()> {
        let Some(mut conn) = self.take_conn(id) else {
            return Err(RayError::UnknownConnection(id));
        };
        self.enqueue(&mut conn, MsgType::Async, msg);
        let outcome = self.drive_conn_tx(&mut conn);
        self.put_conn(conn);
        if outcome == PollOutcome::Error {
            self.deregister(id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbols::intern;
    use crate::verbs;

    fn tree(parts: Vec<Obj>) -> Obj {
        Obj::list_from(parts)
    }

    /// Spin up a server reactor on an ephemeral port in its own thread.
    fn spawn_server() -> (SocketAddr, Shutdown, std::thread::JoinHandle<i64>) {
        let (addr_tx, addr_rx) = std::sync::mpsc::channel();
        let handle = std::thread::spawn(move || {
            verbs::install();
            let mut r = Reactor::new(Some(0)).unwrap();
            addr_tx.send((r.local_addr().unwrap(), r.shutdown_handle())).unwrap();
            r.run()
        });
        let (addr, shutdown) = addr_rx.recv().unwrap();
        (addr, shutdown, handle)
    }

    #[test]
    fn test_sync_request_response() {
        let (addr, shutdown, server) = spawn_server();

        verbs::install();
        let mut client = Reactor::new(None).unwrap();
        let id = client.connect(addr, None).unwrap();

        // (+ 1 2) → 3
        let expr = tree(vec![Obj::sym(intern("+")), Obj::i64(1), Obj::i64(2)]);
        let resp = client.send_sync(id, &expr).unwrap();
        assert_eq!(resp.i64_val(), 3);

        // (count (til 100)) → 100
        let expr = tree(vec![
            Obj::sym(intern("count")),
            tree(vec![Obj::sym(intern("til")), Obj::i64(100)]),
        ]);
        let resp = client.send_sync(id, &expr).unwrap();
        assert_eq!(resp.i64_val(), 100);

        shutdown.shutdown();
        assert_eq!(server.join().unwrap(), 0);
    }

    #[test]
    fn test_sync_and_async_mixed() {
        let (addr, shutdown, server) = spawn_server();

        verbs::install();
        let mut client = Reactor::new(None).unwrap();
        let id = client.connect(addr, Some("user:pass")).unwrap();

        let a = tree(vec![Obj::sym(intern("sum")), Obj::i64_vec(&[1, 2, 3])]);
        client.send_async(id, &a).unwrap();

        let expr = tree(vec![Obj::sym(intern("sum")), Obj::i64_vec(&[1, 2, 3, 4, 5])]);
        let resp = client.send_sync(id, &expr).unwrap();
        assert_eq!(resp.i64_val(), 15);

        shutdown.shutdown();
        assert_eq!(server.join().unwrap(), 0);
    }

    #[test]
    fn test_error_comes_back_as_err_value() {
        let (addr, shutdown, server) = spawn_server();

        verbs::install();
        let mut client = Reactor::new(None).unwrap();
        let id = client.connect(addr, None).unwrap();

        let expr = Obj::sym(intern("definitely_not_bound"));
        let resp = client.send_sync(id, &expr).unwrap();
        assert!(resp.is_err());

        shutdown.shutdown();
        assert_eq!(server.join().unwrap(), 0);
    }

    #[test]
    fn test_timer_fires() {
        verbs::install();
        let mut r = Reactor::new(None).unwrap();
        let fired = Arc::new(AtomicBool::new(false));
        let f2 = Arc::clone(&fired);
        let shutdown = r.shutdown_handle();
        r.add_timer(
            Duration::from_millis(20),
            Box::new(move || {
                f2.store(true, Ordering::Release);
                shutdown.shutdown();
            }),
        );
        assert_eq!(r.run(), 0);
        assert!(fired.load(Ordering::Acquire));
    }
}
