//! The serving loop: accepts connections, reads requests, and pushes them
//! through the filter chain and the dispatcher.
//!
//! The accept loop blocks on `mio::Poll` so a waker can interrupt it for
//! graceful shutdown; accepted connections are converted back to blocking
//! sockets and handled on a worker pool.

use crate::callbacks::Callbacks;
use crate::conn::{Conn, CONN_ENTITY_TOO_LARGE, CONN_LINE_TOO_LONG, CONN_REQUEST_URI_TOO_LONG};
use crate::dispatch::{self, ReturnCode};
use crate::filter::FilterWhen;
use crate::request::{self, HeaderCase, Request};
use crate::server::Server;
use crate::status;
use bufstream::BufStream;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io::{self, BufRead, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

// Tokens used for the accept loop
const SERVER: Token = Token(0);
const SHUTDOWN: Token = Token(1);

// Reader limits. Exceeding one raises the matching connection flag so the
// dispatcher can answer with the right canned response.
const MAX_REQUEST_LINE: usize = 8192;
const MAX_HEADER_LINE: usize = 8192;
const MAX_HEADER_LINES: usize = 128;
const MAX_CONTENT: usize = 1 << 20;

/// The reason the driver exited.
#[derive(Debug, Default)]
pub enum DriverExitReason {
    /// It was gracefully shutdown.
    #[default]
    Normal,
    /// Polling the listening socket failed somehow.
    Err(io::Error),
    /// The driver thread panicked.
    Panic(String),
}

/// Handle to a running driver.
pub struct DriverHandle {
    address: SocketAddr,
    driver_loop: JoinHandle<DriverExitReason>,
    driver_waker: Waker,
    observe_shutdown: Receiver<()>,
}

impl DriverHandle {
    /// Blocks until the driver terminates, without stopping it.
    pub fn join(self) -> DriverExitReason {
        match self.driver_loop.join() {
            Ok(reason) => reason,
            Err(any) => match any.downcast_ref::<String>() {
                Some(s) => DriverExitReason::Panic(s.clone()),
                None => match any.downcast_ref::<&str>() {
                    Some(s) => DriverExitReason::Panic(s.to_string()),
                    None => DriverExitReason::Panic(String::new()),
                },
            },
        }
    }

    /// Stops the driver, waiting for in-flight requests to complete.
    pub fn stop(self) {
        let Ok(()) = self.driver_waker.wake() else {
            return;
        };
        let _ = self.observe_shutdown.recv();
    }

    /// The address the driver is listening on.
    pub fn address(&self) -> SocketAddr {
        self.address
    }
}

struct AcceptLoop {
    socket: TcpListener,
    server: Arc<Server>,
    callbacks: Arc<Callbacks>,
    poll: Poll,
    events: Events,
    signal_shutdown: SyncSender<()>,
}

/// Binds `address` and starts serving `server` on a background thread.
///
/// Binding port `0` requests an ephemeral port; [`DriverHandle::address`]
/// reports the bound one. Lifecycle callbacks fire around the transition:
/// pre-startup before the bind, startup and ready once listening.
pub fn start(
    server: Arc<Server>,
    callbacks: Arc<Callbacks>,
    address: impl ToSocketAddrs,
) -> Result<DriverHandle, io::Error> {
    let address = address
        .to_socket_addrs()?
        .next()
        .ok_or(io::Error::from(io::ErrorKind::InvalidInput))?;

    callbacks.run_pre_startup();

    let mut socket = TcpListener::bind(address)?;
    let address = socket.local_addr()?;

    log::info!("server {} listening on {address}", server.name);

    let poll = Poll::new()?;
    let events = Events::with_capacity(128);
    let driver_waker = Waker::new(poll.registry(), SHUTDOWN)?;

    poll.registry()
        .register(&mut socket, SERVER, Interest::READABLE)?;

    let (signal_shutdown, observe_shutdown) = sync_channel(0);

    let accept_loop = AcceptLoop {
        socket,
        server,
        callbacks: callbacks.clone(),
        poll,
        events,
        signal_shutdown,
    };

    callbacks.run_startup();
    callbacks.run_ready();

    let driver_loop = thread::spawn(move || run(accept_loop));

    Ok(DriverHandle {
        address,
        driver_loop,
        driver_waker,
        observe_shutdown,
    })
}

fn run(mut accept: AcceptLoop) -> DriverExitReason {
    let pool = threadpool::Builder::new().build();

    loop {
        match accept.poll.poll(&mut accept.events, None) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                log::warn!(error:err = err; "poll call failed, driver loop will exit");
                pool.join();
                return DriverExitReason::Err(err);
            }
        }

        for event in accept.events.iter() {
            match event.token() {
                SERVER => loop {
                    match accept.socket.accept() {
                        Ok((stream, peer)) => {
                            let stream = TcpStream::from(stream);
                            let server = accept.server.clone();
                            pool.execute(move || {
                                handle_connection(stream, peer, server);
                            });
                        }
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                        Err(err) => {
                            log::warn!(error:err = err; "accept call failed, driver loop will exit");
                            pool.join();
                            return DriverExitReason::Err(err);
                        }
                    }
                },
                SHUTDOWN => {
                    // Drain in-flight work, then rendezvous with stop().
                    pool.join();
                    accept.callbacks.run_exit();
                    if accept.signal_shutdown.send(()).is_err() {
                        log::error!("failed to notify of driver shutdown");
                    }
                    return DriverExitReason::Normal;
                }
                _ => unreachable!(),
            }
        }
    }
}

/// Reads one line, stopping at `limit` bytes. Returns the line without
/// its terminator and whether the limit was hit.
fn read_limited_line<R: BufRead>(reader: &mut R, limit: usize) -> io::Result<(String, bool)> {
    let mut buf = Vec::new();
    let mut truncated = false;

    loop {
        let available = reader.fill_buf()?;
        if available.is_empty() {
            break;
        }
        match available.iter().position(|&b| b == b'\n') {
            Some(newline) => {
                if buf.len() + newline > limit {
                    truncated = true;
                }
                buf.extend_from_slice(&available[..newline]);
                reader.consume(newline + 1);
                break;
            }
            None => {
                let n = available.len();
                buf.extend_from_slice(available);
                reader.consume(n);
                if buf.len() > limit {
                    truncated = true;
                    break;
                }
            }
        }
    }

    while buf.last() == Some(&b'\r') {
        buf.pop();
    }
    Ok((String::from_utf8_lossy(&buf).into_owned(), truncated))
}

fn handle_connection(stream: TcpStream, peer: SocketAddr, server: Arc<Server>) {
    if stream.set_nonblocking(false).is_err() {
        return;
    }
    // An idle connection is not kept open indefinitely.
    let _ = stream.set_read_timeout(Some(Duration::from_secs(3)));

    let mut stream = BufStream::new(stream);
    let mut conn = Conn::default();
    conn.peer_addr = Some(peer.to_string());

    if read_request(&mut stream, &mut conn) {
        process(&server, &mut conn);
    }
    let _ = write_response(&mut stream, &conn);
}

/// Reads the request line, headers, and body into `conn`. Returns whether
/// a response should be produced.
fn read_request<R: BufRead>(reader: &mut R, conn: &mut Conn) -> bool {
    let (line, truncated) = match read_limited_line(reader, MAX_REQUEST_LINE) {
        Ok(result) => result,
        Err(_) => return false,
    };
    if line.is_empty() && !truncated {
        return false;
    }
    if truncated {
        conn.flags |= CONN_REQUEST_URI_TOO_LONG;
        return true;
    }

    match Request::parse(&line) {
        Ok(request) => conn.request = request,
        Err(err) => {
            log::warn!(error:err = err; "unparseable request line");
            // The BAD sentinel makes the dispatcher answer 400.
            conn.request = Request::default();
            conn.request.method = "BAD".to_string();
            conn.request.url = "/".to_string();
            return true;
        }
    }

    // HTTP/0.9 requests carry no headers.
    if conn.request.version == 0.0 && !conn.request.line.contains("HTTP/") {
        return true;
    }

    for _ in 0..MAX_HEADER_LINES {
        let (line, truncated) = match read_limited_line(reader, MAX_HEADER_LINE) {
            Ok(result) => result,
            Err(_) => return false,
        };
        if truncated {
            conn.flags |= CONN_LINE_TOO_LONG;
            return true;
        }
        if line.is_empty() {
            break;
        }
        if request::parse_header(&mut conn.headers, &line, None, HeaderCase::ToLower).is_err() {
            conn.request.method = "BAD".to_string();
            return true;
        }
    }

    if let Some(length) = conn
        .headers
        .iget("content-length")
        .and_then(|v| v.parse::<usize>().ok())
    {
        if length > MAX_CONTENT {
            conn.flags |= CONN_ENTITY_TOO_LARGE;
            return true;
        }
        let mut body = vec![0u8; length];
        if reader.read_exact(&mut body).is_err() {
            return false;
        }
        conn.request_body = body;
    }

    true
}

/// Runs the request lifecycle: pre-auth filters, authorization, post-auth
/// filters, the handler, then traces and cleanups.
fn process(server: &Server, conn: &mut Conn) {
    let status = lifecycle(server, conn);

    if status == ReturnCode::Ok {
        server.filters.run_filters(conn, FilterWhen::Trace);
        server.filters.run_filters(conn, FilterWhen::VoidTrace);
        server.filters.run_traces(conn);
    }
    server.filters.run_cleanups(conn);

    if conn.response_status == 0 {
        conn.response_status = status::INTERNAL_SERVER_ERROR;
    }
}

fn lifecycle(server: &Server, conn: &mut Conn) -> ReturnCode {
    match server.filters.run_filters(conn, FilterWhen::PreAuth) {
        ReturnCode::Ok => {}
        ReturnCode::FilterReturn => return ReturnCode::Ok,
        cause => return conn.return_internal_error(cause, "filter, preauth"),
    }

    let authorized = match server.authorize.as_ref() {
        Some(authorize) => authorize(
            &conn.request.method,
            &conn.request.url,
            conn.auth_user.as_deref(),
            conn.auth_passwd.as_deref(),
            conn.peer_addr.as_deref(),
        ),
        None => ReturnCode::Ok,
    };
    match authorized {
        ReturnCode::Ok => {}
        ReturnCode::Forbidden => return conn.return_forbidden(),
        ReturnCode::Unauthorized => return conn.return_unauthorized(),
        cause => return conn.return_internal_error(cause, "authorize request"),
    }

    match server.filters.run_filters(conn, FilterWhen::PostAuth) {
        ReturnCode::Ok => {}
        ReturnCode::FilterReturn => return ReturnCode::Ok,
        cause => return conn.return_internal_error(cause, "filter, postauth"),
    }

    dispatch::run_request(server, conn)
}

fn write_response<W: Write>(writer: &mut W, conn: &Conn) -> io::Result<()> {
    // HTTP/0.9: body only, no status line or headers.
    if conn.request.version == 0.0 && conn.request.method != "BAD" && !conn.request.url.is_empty()
    {
        writer.write_all(&conn.response_body)?;
        return writer.flush();
    }

    let code = if conn.response_status == 0 {
        status::OK
    } else {
        conn.response_status
    };
    write!(writer, "HTTP/1.1 {code} {}\r\n", status::reason_phrase(code))?;

    let date = jiff::Timestamp::now().strftime("%a, %d %b %Y %H:%M:%S GMT");
    write!(writer, "date: {date}\r\n")?;
    write!(writer, "content-length: {}\r\n", conn.response_body.len())?;
    write!(writer, "connection: close\r\n")?;
    for field in conn.output_headers.iter() {
        write!(writer, "{}: {}\r\n", field.key, field.value)?;
    }
    write!(writer, "\r\n")?;
    writer.write_all(&conn.response_body)?;
    writer.flush()
}
