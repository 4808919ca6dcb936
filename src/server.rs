use std::future::Future;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::lease::{Leases, PersistenceWorker};
use crate::packet::DhcpPacket;
use crate::session::TransactionTable;

pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;
const RECV_BUFFER_SIZE: usize = 65535;

/// Upper bound on one wait for the socket; the table is swept at least
/// this often.
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

fn create_socket(bind_addr: SocketAddrV4, broadcast: bool) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|error| Error::Socket(format!("Failed to create socket: {}", error)))?;

    socket
        .set_reuse_address(true)
        .map_err(|error| Error::Socket(format!("Failed to set SO_REUSEADDR: {}", error)))?;

    if broadcast {
        socket
            .set_broadcast(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_BROADCAST: {}", error)))?;
    }

    socket
        .set_nonblocking(true)
        .map_err(|error| Error::Socket(format!("Failed to set non-blocking: {}", error)))?;

    socket
        .bind(&bind_addr.into())
        .map_err(|error| Error::Socket(format!("Failed to bind to {}: {}", bind_addr, error)))?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
        .map_err(|error| Error::Socket(format!("Failed to convert to tokio socket: {}", error)))
}

/// One `received:` / `broadcasting:` log line.
fn log_packet(label: &str, packet: &DhcpPacket) {
    let message_type = match (packet.message_type(), packet.unknown_message_type()) {
        (Some(message_type), _) => message_type.to_string(),
        (None, Some(code)) => format!("UNKNOWN({})", code),
        (None, None) => "NONE".to_string(),
    };
    let direction = if packet.is_request() {
        "cli -> srv"
    } else {
        "srv -> cli"
    };
    info!(
        "{:<14}{:<12}; {}; MAC: {}",
        label,
        message_type,
        direction,
        packet.mac()
    );
}

/// Sends replies from a fresh broadcast-enabled socket per reply.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    bind_addr: SocketAddrV4,
    destinations: Vec<SocketAddrV4>,
}

impl Broadcaster {
    pub fn new(bind_addr: SocketAddrV4, destinations: Vec<SocketAddrV4>) -> Self {
        Self {
            bind_addr,
            destinations,
        }
    }

    /// Binds `server_ip:67` and targets the limited broadcast address and
    /// the network's directed broadcast address, both on port 68.
    pub fn for_config(config: &Config) -> Self {
        let mut destinations = vec![SocketAddrV4::new(Ipv4Addr::BROADCAST, DHCP_CLIENT_PORT)];
        let directed = SocketAddrV4::new(config.broadcast_address(), DHCP_CLIENT_PORT);
        if !destinations.contains(&directed) {
            destinations.push(directed);
        }
        Self::new(
            SocketAddrV4::new(config.server_ip, DHCP_SERVER_PORT),
            destinations,
        )
    }

    pub fn destinations(&self) -> &[SocketAddrV4] {
        &self.destinations
    }

    /// Encodes and sends `packet` to every destination. Failures are logged
    /// and never propagated.
    pub async fn send(&self, packet: &DhcpPacket) {
        log_packet("broadcasting:", packet);

        let data = packet.encode();
        let socket = match create_socket(self.bind_addr, true) {
            Ok(socket) => socket,
            Err(error) => {
                error!("Failed to broadcast from {}: {}", self.bind_addr, error);
                return;
            }
        };

        for destination in &self.destinations {
            if let Err(error) = socket.send_to(&data, *destination).await {
                error!(
                    "Failed to broadcast from {} to {}: {}",
                    self.bind_addr, destination, error
                );
            }
        }
    }
}

/// The DHCP server loop.
///
/// Owns the listening socket, the transaction table and the lease
/// persistence worker. [`run`](Self::run) consumes the server and returns
/// once the shutdown future resolves and every resource has been released.
pub struct DhcpServer {
    config: Arc<Config>,
    leases: Arc<Leases>,
    socket: UdpSocket,
    broadcaster: Broadcaster,
    transactions: TransactionTable,
    worker: PersistenceWorker,
}

impl DhcpServer {
    /// Listens on `0.0.0.0:67` and broadcasts replies from `server_ip:67`.
    pub async fn new(config: Arc<Config>, leases: Arc<Leases>) -> Result<Self> {
        let listen = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DHCP_SERVER_PORT);
        let broadcaster = Broadcaster::for_config(&config);
        Self::bind(config, leases, listen, broadcaster).await
    }

    /// Like [`new`](Self::new) with an explicit listen address and reply path.
    pub async fn bind(
        config: Arc<Config>,
        leases: Arc<Leases>,
        listen: SocketAddrV4,
        broadcaster: Broadcaster,
    ) -> Result<Self> {
        let socket = create_socket(listen, false)?;
        let worker = PersistenceWorker::spawn(Arc::clone(&leases), config.storage.flush_interval());

        info!("DHCP server {} listening on {}", config.server_ip, listen);
        info!(
            "Address range: {} - {} ({} addresses)",
            config.pool_start(),
            config.pool_end(),
            config.pool_size()
        );

        Ok(Self {
            config,
            leases,
            socket,
            broadcaster,
            transactions: TransactionTable::new(),
            worker,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn leases(&self) -> &Arc<Leases> {
        &self.leases
    }

    /// Serves until `shutdown` resolves, then stops in order: close the
    /// socket, flush leases, join the persistence worker, close every
    /// transaction.
    pub async fn run<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut buffer = vec![0u8; RECV_BUFFER_SIZE];

        info!("Started");

        loop {
            let readable = tokio::select! {
                _ = &mut shutdown => break,
                readable = tokio::time::timeout(POLL_TIMEOUT, self.socket.readable()) => readable,
            };

            match readable {
                Ok(Ok(())) => self.drain(&mut buffer).await,
                Ok(Err(error)) => error!("Error waiting for packets: {}", error),
                Err(_) => {}
            }

            let swept = self.transactions.sweep(Instant::now());
            if swept > 0 {
                debug!("Removed {} finished transaction(s)", swept);
            }
        }

        self.stop().await;
        Ok(())
    }

    /// Handles every datagram that is readable right now.
    async fn drain(&mut self, buffer: &mut [u8]) {
        loop {
            match self.socket.try_recv_from(buffer) {
                Ok((size, source)) => self.handle_datagram(&buffer[..size], source).await,
                Err(error) if error.kind() == ErrorKind::WouldBlock => break,
                Err(error) => {
                    warn!("Error receiving packet: {}", error);
                    break;
                }
            }
        }
    }

    async fn handle_datagram(&mut self, data: &[u8], source: SocketAddr) {
        let packet = match DhcpPacket::parse(data) {
            Ok(packet) => packet,
            Err(error) => {
                warn!("Discarding datagram from {}: {}", source, error);
                return;
            }
        };

        log_packet("received:", &packet);

        let now = Instant::now();
        let reply = self
            .transactions
            .get_or_create(packet.xid, now)
            .receive(&packet, now, &self.config, &self.leases)
            .await;

        if let Some(reply) = reply {
            self.broadcaster.send(&reply).await;
        }
    }

    async fn stop(self) {
        let Self {
            leases,
            socket,
            mut transactions,
            worker,
            ..
        } = self;

        info!("Stopping DHCP server");
        drop(socket);

        if let Err(error) = leases.flush().await {
            error!("Failed to persist leases on shutdown: {}", error);
        }
        worker.shutdown().await;

        let closed = transactions.close_all();
        debug!("Closed {} open transaction(s)", closed);
        info!("Closed");
    }
}
