//! Plain OS TCP sockets, configured through `socket2`.

use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};

use super::{Transport, TransportServer, closed_error, read_timeout};

/// TCP socket options applied to every connection.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Disable Nagle's algorithm for lower latency. Default: true.
    pub tcp_nodelay: bool,
    /// Enable TCP keepalive. Default: true.
    pub keepalive_enabled: bool,
    /// How long before the first keepalive probe. Default: 60s.
    pub keepalive_idle: Duration,
    /// Keepalive probe interval. Default: 10s.
    pub keepalive_interval: Duration,
    /// Enable `SO_REUSEADDR` on listeners. Default: true except on Windows.
    pub reuse_addr: bool,
    /// Bound on the initial connect. Default: 5s.
    pub connect_timeout: Duration,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            keepalive_enabled: true,
            keepalive_idle: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(10),
            reuse_addr: !cfg!(target_os = "windows"),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

fn configure_stream(stream: &TcpStream, config: &SocketConfig) -> io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;

    if config.keepalive_enabled {
        let keepalive = TcpKeepalive::new()
            .with_time(config.keepalive_idle)
            .with_interval(config.keepalive_interval);
        SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    }

    Ok(())
}

/// A connected TCP stream.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
    remote: SocketAddr,
    closed: AtomicBool,
}

impl TcpTransport {
    /// Dial `addr` and configure the resulting socket.
    pub fn connect(addr: SocketAddr, config: &SocketConfig) -> io::Result<Self> {
        let stream = TcpStream::connect_timeout(&addr, config.connect_timeout)?;
        Self::from_stream(stream, config)
    }

    /// Wrap an already-connected stream.
    pub fn from_stream(stream: TcpStream, config: &SocketConfig) -> io::Result<Self> {
        configure_stream(&stream, config)?;
        let remote = stream.peer_addr()?;
        Ok(Self {
            stream,
            remote,
            closed: AtomicBool::new(false),
        })
    }

    pub fn nodelay(&self) -> io::Result<bool> {
        self.stream.nodelay()
    }
}

impl Transport for TcpTransport {
    fn reader(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(self.stream.try_clone()?))
    }

    fn writer(&self) -> io::Result<Box<dyn Write + Send>> {
        Ok(Box::new(self.stream.try_clone()?))
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(read_timeout(timeout))
    }

    fn remote_address(&self) -> String {
        self.remote.to_string()
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.stream.peer_addr().is_ok()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Shutdown wakes a reader blocked on any clone of this socket.
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// A listening TCP socket.
#[derive(Debug)]
pub struct TcpTransportServer {
    listener: TcpListener,
    local: SocketAddr,
    config: SocketConfig,
    closed: AtomicBool,
}

impl TcpTransportServer {
    /// Bind and listen on `addr`. Port 0 picks a free port.
    ///
    /// IPv6 addresses are bound dual-stack.
    pub fn bind(addr: SocketAddr, config: SocketConfig) -> io::Result<Self> {
        let domain = if addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        if config.reuse_addr {
            socket.set_reuse_address(true)?;
        }
        if addr.is_ipv6() {
            socket.set_only_v6(false)?;
        }
        socket.bind(&addr.into())?;
        socket.listen(128)?;

        let listener: TcpListener = socket.into();
        let local = listener.local_addr()?;
        Ok(Self {
            listener,
            local,
            config,
            closed: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Where a throwaway connection must go to reach this listener.
    fn wake_address(&self) -> SocketAddr {
        let ip = match self.local.ip() {
            IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            ip => ip,
        };
        SocketAddr::new(ip, self.local.port())
    }
}

impl TransportServer for TcpTransportServer {
    fn accept(&self) -> io::Result<Box<dyn Transport>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(closed_error("listener"));
        }
        let (stream, _) = self.listener.accept()?;
        if self.closed.load(Ordering::Acquire) {
            return Err(closed_error("listener"));
        }
        Ok(Box::new(TcpTransport::from_stream(stream, &self.config)?))
    }

    fn local_address(&self) -> String {
        self.local.to_string()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // std has no way to interrupt a blocking accept; connect to ourselves.
        let _ = TcpStream::connect_timeout(&self.wake_address(), Duration::from_millis(500));
    }
}

/// Loopback address with an OS-assigned port.
pub fn ephemeral_loopback() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
}
