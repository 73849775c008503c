// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Non-blocking AF_UNIX stream server for the control plane, plus the small
//! blocking client used by producers and diagnostic tools.
//!
//! Framing is shared by both sides: a 4-byte little-endian length prefix
//! followed by the payload. Messages are atomic; a session never sees a
//! partial message.
//!
//! Connection life cycle: a fresh connection is *New* until its first framed
//! message (the subscriber name) arrives, with a 500 ms deadline. The session
//! factory then turns it *Active*. Peer hangup moves it to *ClosedByPeer*;
//! sessions marked for deletion are removed after their final tick.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const NEW_SESSION_TIMEOUT: Duration = Duration::from_millis(500);
const POLL_PERIOD: Duration = Duration::from_millis(100);

pub fn write_framed(stream: &mut impl Write, message: &[u8]) -> io::Result<()> {
    stream.write_all(&(message.len() as u32).to_le_bytes())?;
    stream.write_all(message)?;
    Ok(())
}

/// Blocks until a whole message arrived. A clean EOF before the length
/// prefix reads as a zero-length error of kind `UnexpectedEof`.
pub fn read_framed(stream: &mut impl Read) -> io::Result<Vec<u8>> {
    let mut length = [0u8; 4];
    stream.read_exact(&mut length)?;
    let mut message = vec![0u8; u32::from_le_bytes(length) as usize];
    stream.read_exact(&mut message)?;
    Ok(message)
}

/// One control-plane session. Outbound messages are pushed onto `out` and
/// framed by the server.
pub trait Session: Send {
    fn on_command(&mut self, message: &[u8], out: &mut Vec<Vec<u8>>);

    /// Periodic work; returning true requeues the session for another tick
    /// in the same drain cycle.
    fn tick(&mut self, _out: &mut Vec<Vec<u8>>) -> bool {
        false
    }

    fn on_closed_by_peer(&mut self) {}

    /// Polled after every callback; a true value closes the connection.
    fn wants_close(&self) -> bool {
        false
    }
}

/// Invoked with the first framed message of a connection; `None` rejects
/// the peer.
pub type SessionFactory = Box<dyn FnMut(&[u8]) -> Option<Box<dyn Session>> + Send>;

struct SessionWrapper {
    stream: UnixStream,
    session: Option<Box<dyn Session>>,
    deadline: Instant,
    to_delete: bool,
    closed_by_peer: bool,
    enqueued: bool,
}

impl SessionWrapper {
    fn new(stream: UnixStream) -> SessionWrapper {
        SessionWrapper {
            stream,
            session: None,
            deadline: Instant::now() + NEW_SESSION_TIMEOUT,
            to_delete: false,
            closed_by_peer: false,
            enqueued: false,
        }
    }

    /// Returns false when the connection should be dropped.
    fn handle_command(&mut self, message: &[u8], factory: &mut SessionFactory) -> bool {
        match &mut self.session {
            None => {
                if !message.is_empty() {
                    match factory(message) {
                        Some(session) => self.session = Some(session),
                        None => return false,
                    }
                } else {
                    return Instant::now() < self.deadline;
                }
            }
            Some(session) => {
                if !message.is_empty() {
                    let mut out = Vec::new();
                    session.on_command(message, &mut out);
                    if !self.send_all(out) {
                        return false;
                    }
                    if self.wants_close() {
                        return false;
                    }
                }
            }
        }
        true
    }

    fn send_all(&mut self, out: Vec<Vec<u8>>) -> bool {
        for message in out {
            if let Err(err) = write_framed(&mut self.stream, &message) {
                debug!("session write failed: {err}");
                return false;
            }
        }
        true
    }

    fn wants_close(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.wants_close())
    }
}

pub struct UnixDomainServer {
    listener: UnixListener,
    factory: SessionFactory,
    sessions: HashMap<i32, SessionWrapper>,
    work_queue: VecDeque<i32>,
}

impl UnixDomainServer {
    pub fn bind(path: &Path, factory: SessionFactory) -> io::Result<UnixDomainServer> {
        // A stale socket file from a previous run would fail the bind.
        _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        Ok(UnixDomainServer {
            listener,
            factory,
            sessions: HashMap::new(),
            work_queue: VecDeque::new(),
        })
    }

    /// Runs the poll loop until `stop` is raised. Reacts to the flag within
    /// one poll period.
    pub fn run(&mut self, stop: &AtomicBool) {
        let mut deadline = Instant::now() + POLL_PERIOD;

        while !stop.load(Ordering::Relaxed) {
            let now = Instant::now();
            let mut timeout = deadline.saturating_duration_since(now).as_millis() as i32;
            if timeout <= 0 {
                timeout = 0;
                deadline = now + POLL_PERIOD;
            }

            self.iteration(timeout);
        }

        self.cleanup_all();
    }

    fn iteration(&mut self, timeout: i32) {
        let mut pollfds: Vec<libc::pollfd> = Vec::with_capacity(1 + self.sessions.len());
        pollfds.push(libc::pollfd {
            fd: self.listener.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        for &fd in self.sessions.keys() {
            pollfds.push(libc::pollfd {
                fd,
                events: libc::POLLIN,
                revents: 0,
            });
        }

        let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                warn!("poll failed: {err}");
            }
            return;
        }

        if pollfds[0].revents & libc::POLLIN != 0 {
            self.accept_new();
        }

        // Readable connections first.
        for pollfd in &pollfds[1..] {
            if pollfd.revents & libc::POLLIN != 0 {
                self.handle_readable(pollfd.fd);
            }
        }
        self.process_queue();

        if timeout > 0 {
            return;
        }

        // The poll period expired: give idle connections their timeout check
        // and a tick.
        let idle: Vec<i32> = pollfds[1..]
            .iter()
            .filter(|pollfd| pollfd.revents & libc::POLLIN == 0)
            .map(|pollfd| pollfd.fd)
            .collect();
        for fd in idle {
            self.handle_idle(fd);
        }
        self.process_queue();
    }

    fn accept_new(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    // Per-connection reads are blocking; poll gates them.
                    _ = stream.set_nonblocking(false);
                    let fd = stream.as_raw_fd();
                    self.sessions.insert(fd, SessionWrapper::new(stream));
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!("accept failed: {err}");
                    break;
                }
            }
        }
    }

    fn handle_readable(&mut self, fd: i32) {
        let Some(wrapper) = self.sessions.get_mut(&fd) else {
            return;
        };

        match read_framed(&mut wrapper.stream) {
            Ok(message) => {
                let keep = wrapper.handle_command(&message, &mut self.factory);
                if keep {
                    self.enqueue_tick(fd);
                } else {
                    self.remove_session(fd, false);
                }
            }
            Err(_) => {
                // recv() == 0 or a broken pipe: the peer is gone.
                self.remove_session(fd, true);
            }
        }
    }

    fn handle_idle(&mut self, fd: i32) {
        let Some(wrapper) = self.sessions.get_mut(&fd) else {
            return;
        };
        let keep = wrapper.handle_command(&[], &mut self.factory);
        if keep {
            if wrapper.session.is_some() {
                self.enqueue_tick(fd);
            }
        } else {
            self.remove_session(fd, false);
        }
    }

    fn enqueue_tick(&mut self, fd: i32) {
        if let Some(wrapper) = self.sessions.get_mut(&fd) {
            if wrapper.session.is_some() && !wrapper.enqueued && !wrapper.to_delete {
                wrapper.enqueued = true;
                self.work_queue.push_back(fd);
            }
        }
    }

    fn process_queue(&mut self) {
        while let Some(fd) = self.work_queue.pop_front() {
            let Some(wrapper) = self.sessions.get_mut(&fd) else {
                continue;
            };
            wrapper.enqueued = false;

            if wrapper.closed_by_peer {
                wrapper.closed_by_peer = false;
                if let Some(session) = &mut wrapper.session {
                    session.on_closed_by_peer();
                }
            }

            let mut out = Vec::new();
            let mut requeue = false;
            if let Some(session) = &mut wrapper.session {
                requeue = session.tick(&mut out);
            }
            let alive = wrapper.send_all(out) && !wrapper.wants_close();

            if wrapper.to_delete || !alive {
                self.sessions.remove(&fd);
            } else if requeue {
                self.enqueue_tick(fd);
            }
        }
    }

    /// Detaches the connection from the poll set. An active session gets a
    /// final tick (with the peer-close notification when applicable) before
    /// the wrapper is dropped.
    fn remove_session(&mut self, fd: i32, by_peer: bool) {
        let Some(wrapper) = self.sessions.get_mut(&fd) else {
            return;
        };
        if wrapper.session.is_some() {
            wrapper.to_delete = true;
            wrapper.closed_by_peer = by_peer;
            if !wrapper.enqueued {
                wrapper.enqueued = true;
                self.work_queue.push_back(fd);
            }
        } else {
            self.sessions.remove(&fd);
        }
    }

    fn cleanup_all(&mut self) {
        let fds: Vec<i32> = self.sessions.keys().copied().collect();
        for fd in fds {
            self.remove_session(fd, false);
        }
        self.process_queue();
        self.sessions.clear();
    }
}

/// Blocking client for the control socket: framed request/response.
pub struct UnixDomainClient {
    stream: UnixStream,
}

impl UnixDomainClient {
    pub fn connect(path: &Path) -> io::Result<UnixDomainClient> {
        Ok(UnixDomainClient {
            stream: UnixStream::connect(path)?,
        })
    }

    pub fn send(&mut self, message: &[u8]) -> io::Result<()> {
        write_framed(&mut self.stream, message)
    }

    pub fn recv(&mut self) -> io::Result<Vec<u8>> {
        read_framed(&mut self.stream)
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }

    /// One request, one response.
    pub fn call(&mut self, message: &[u8]) -> io::Result<Vec<u8>> {
        self.send(message)?;
        self.recv()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    struct EchoSession {
        closed: Arc<AtomicBool>,
        ticks: Arc<AtomicUsize>,
    }

    impl Session for EchoSession {
        fn on_command(&mut self, message: &[u8], out: &mut Vec<Vec<u8>>) {
            let mut reply = b"echo:".to_vec();
            reply.extend_from_slice(message);
            out.push(reply);
        }

        fn tick(&mut self, _out: &mut Vec<Vec<u8>>) -> bool {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            false
        }

        fn on_closed_by_peer(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct ServerFixture {
        path: std::path::PathBuf,
        stop: Arc<AtomicBool>,
        handle: Option<std::thread::JoinHandle<()>>,
        _dir: tempfile::TempDir,
    }

    impl ServerFixture {
        fn start(factory: SessionFactory) -> ServerFixture {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("control.sock");
            let mut server = UnixDomainServer::bind(&path, factory).unwrap();
            let stop = Arc::new(AtomicBool::new(false));
            let stop_clone = Arc::clone(&stop);
            let handle = std::thread::spawn(move || server.run(&stop_clone));
            ServerFixture {
                path,
                stop,
                handle: Some(handle),
                _dir: dir,
            }
        }
    }

    impl Drop for ServerFixture {
        fn drop(&mut self) {
            self.stop.store(true, Ordering::SeqCst);
            if let Some(handle) = self.handle.take() {
                _ = handle.join();
            }
        }
    }

    #[test]
    fn first_message_binds_session_then_commands_get_responses() {
        let closed = Arc::new(AtomicBool::new(false));
        let ticks = Arc::new(AtomicUsize::new(0));
        let closed_clone = Arc::clone(&closed);
        let ticks_clone = Arc::clone(&ticks);

        let fixture = ServerFixture::start(Box::new(move |name| {
            assert_eq!(name, b"tester");
            Some(Box::new(EchoSession {
                closed: Arc::clone(&closed_clone),
                ticks: Arc::clone(&ticks_clone),
            }))
        }));

        let mut client = UnixDomainClient::connect(&fixture.path).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        client.send(b"tester").unwrap();

        let reply = client.call(b"ping").unwrap();
        assert_eq!(reply, b"echo:ping");

        drop(client);
        // The hangup has to be noticed within a couple of poll periods.
        for _ in 0..50 {
            if closed.load(Ordering::SeqCst) {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn sessions_receive_periodic_ticks() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let ticks_clone = Arc::clone(&ticks);

        let fixture = ServerFixture::start(Box::new(move |_| {
            Some(Box::new(EchoSession {
                closed: Arc::new(AtomicBool::new(false)),
                ticks: Arc::clone(&ticks_clone),
            }))
        }));

        let mut client = UnixDomainClient::connect(&fixture.path).unwrap();
        client.send(b"subscriber").unwrap();

        for _ in 0..100 {
            if ticks.load(Ordering::SeqCst) >= 3 {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(ticks.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn silent_new_connection_is_closed_after_timeout() {
        let fixture = ServerFixture::start(Box::new(|_| {
            Some(Box::new(EchoSession {
                closed: Arc::new(AtomicBool::new(false)),
                ticks: Arc::new(AtomicUsize::new(0)),
            }))
        }));

        let client = UnixDomainClient::connect(&fixture.path).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        // Never send the subscriber name; the server must hang up on us.
        let mut probe = [0u8; 1];
        let start = Instant::now();
        let mut stream = &client.stream;
        let result = stream.read(&mut probe);
        assert!(matches!(result, Ok(0)), "expected server-side close");
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[test]
    fn framing_roundtrip() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        write_framed(&mut a, b"hello").unwrap();
        write_framed(&mut a, b"").unwrap();
        assert_eq!(read_framed(&mut b).unwrap(), b"hello");
        assert_eq!(read_framed(&mut b).unwrap(), b"");
    }
}
