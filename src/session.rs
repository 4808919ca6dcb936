//! Per-transaction DORA state machine and the table that owns transactions.
//!
//! A [`Transaction`] is keyed by the client-chosen xid. Retransmissions that
//! reuse an xid land on the same transaction; a new xid, even from the same
//! MAC, starts a fresh one. Transactions live at most
//! [`TRANSACTION_TIMEOUT`] and are removed by [`TransactionTable::sweep`].

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::config::{Config, sanitize_hostname};
use crate::lease::Leases;
use crate::options::{DhcpOption, MessageType};
use crate::packet::DhcpPacket;

/// How long a transaction stays in the table after its first datagram.
pub const TRANSACTION_TIMEOUT: Duration = Duration::from_secs(30);

/// One in-flight exchange with a client.
#[derive(Debug, Clone)]
pub struct Transaction {
    id: u32,
    started_at: Instant,
    deadline: Instant,
    closed: bool,
}

impl Transaction {
    pub fn new(id: u32, now: Instant) -> Self {
        Self {
            id,
            started_at: now,
            deadline: now + TRANSACTION_TIMEOUT,
            closed: false,
        }
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Closed, or past its deadline.
    pub fn is_done(&self, now: Instant) -> bool {
        self.closed || now >= self.deadline
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Feeds one inbound packet through the state machine.
    ///
    /// Returns the reply to broadcast, if any. Server-originated packets,
    /// packets on a closed transaction, and message types other than
    /// Discover and Request produce nothing.
    pub async fn receive(
        &mut self,
        packet: &DhcpPacket,
        now: Instant,
        config: &Config,
        leases: &Leases,
    ) -> Option<DhcpPacket> {
        if self.closed || !packet.is_request() {
            return None;
        }

        let Some(message_type) = packet.message_type() else {
            match packet.unknown_message_type() {
                Some(code) => warn!("Unknown DHCP message type {} from {}", code, packet.mac()),
                None => warn!("No DHCP message type from {}", packet.mac()),
            }
            return None;
        };

        let secs = self.elapsed_secs(now);
        match message_type {
            MessageType::Discover => self.offer(packet, secs, config, leases).await,
            MessageType::Request => self.acknowledge(packet, secs, config, leases).await,
            other => {
                warn!("Unhandled {} from {}", other, packet.mac());
                None
            }
        }
    }

    fn elapsed_secs(&self, now: Instant) -> u16 {
        let elapsed = now.saturating_duration_since(self.started_at).as_secs();
        u16::try_from(elapsed).unwrap_or(u16::MAX)
    }

    async fn offer(
        &self,
        packet: &DhcpPacket,
        secs: u16,
        config: &Config,
        leases: &Leases,
    ) -> Option<DhcpPacket> {
        let mac = packet.mac();
        let hint = packet
            .requested_ip()
            .or_else(|| (!packet.ciaddr.is_unspecified()).then_some(packet.ciaddr));
        let hostname = packet.hostname().and_then(sanitize_hostname);

        let Some(ip) = leases.find_or_allocate(mac, hint, hostname).await else {
            warn!("Address range exhausted, no offer for {}", mac);
            return None;
        };

        debug!("Offering {} to {} (xid {:#010x})", ip, mac, self.id);
        Some(DhcpPacket::reply(
            packet,
            MessageType::Offer,
            ip,
            config.server_ip,
            secs,
            lease_options(config),
        ))
    }

    async fn acknowledge(
        &self,
        packet: &DhcpPacket,
        secs: u16,
        config: &Config,
        leases: &Leases,
    ) -> Option<DhcpPacket> {
        let mac = packet.mac();

        let Some(lease) = leases.get(&mac).await else {
            error!("Failed DORA: no lease for {}", mac);
            return Some(nak(packet, secs, config));
        };

        if let Some(requested) = packet.requested_ip()
            && requested != lease.ip_address
        {
            error!(
                "Failed DORA: {} requested {} but holds {}",
                mac, requested, lease.ip_address
            );
            return Some(nak(packet, secs, config));
        }

        Some(DhcpPacket::reply(
            packet,
            MessageType::Ack,
            lease.ip_address,
            config.server_ip,
            secs,
            lease_options(config),
        ))
    }
}

/// Options carried by every Offer and Ack, in wire order after option 53.
fn lease_options(config: &Config) -> Vec<DhcpOption> {
    let mut options = vec![
        DhcpOption::SubnetMask(config.subnet_mask()),
        DhcpOption::Router(vec![config.router]),
    ];

    let dns_servers = config.unique_dns_servers();
    if !dns_servers.is_empty() {
        options.push(DhcpOption::DnsServer(dns_servers));
    }
    if !config.domain_name.is_empty() {
        options.push(DhcpOption::DomainName(config.domain_name.clone()));
    }

    options.extend([
        DhcpOption::BroadcastAddress(config.broadcast_address()),
        DhcpOption::LeaseTime(config.lease_duration_seconds),
        DhcpOption::ServerIdentifier(config.server_ip),
        DhcpOption::RenewalTime(config.renewal_time_seconds()),
        DhcpOption::RebindingTime(config.rebinding_time_seconds()),
    ]);
    options
}

fn nak(packet: &DhcpPacket, secs: u16, config: &Config) -> DhcpPacket {
    DhcpPacket::reply(
        packet,
        MessageType::Nak,
        Ipv4Addr::UNSPECIFIED,
        config.server_ip,
        secs,
        vec![DhcpOption::ServerIdentifier(config.server_ip)],
    )
}

/// Active transactions by xid.
#[derive(Debug, Default)]
pub struct TransactionTable {
    transactions: HashMap<u32, Transaction>,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The transaction for `xid`, started at `now` if none is active.
    pub fn get_or_create(&mut self, xid: u32, now: Instant) -> &mut Transaction {
        self.transactions
            .entry(xid)
            .or_insert_with(|| Transaction::new(xid, now))
    }

    pub fn get(&self, xid: u32) -> Option<&Transaction> {
        self.transactions.get(&xid)
    }

    /// Drops closed and expired transactions, returning how many went.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.transactions.len();
        self.transactions.retain(|_, transaction| {
            if transaction.is_done(now) {
                transaction.close();
                false
            } else {
                true
            }
        });
        before - self.transactions.len()
    }

    /// Closes and removes every transaction.
    pub fn close_all(&mut self) -> usize {
        let count = self.transactions.len();
        for (_, mut transaction) in self.transactions.drain() {
            transaction.close();
        }
        count
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AddressRange;
    use crate::options::OptionCode;
    use crate::packet::{BOOTREPLY, BOOTREQUEST, HLEN_ETHERNET, HTYPE_ETHERNET, MacAddress};
    use crate::storage::MemoryBackend;
    use std::sync::Arc;

    fn scenario_config() -> Arc<Config> {
        Arc::new(Config {
            range: Some(AddressRange {
                start: Ipv4Addr::new(10, 47, 0, 1),
                end: Ipv4Addr::new(10, 47, 0, 2),
            }),
            router: Ipv4Addr::new(10, 47, 0, 254),
            server_ip: Ipv4Addr::new(10, 47, 0, 254),
            ..Default::default()
        })
    }

    async fn test_leases(config: &Arc<Config>) -> Leases {
        Leases::new(config, Arc::new(MemoryBackend::default()))
            .await
            .unwrap()
    }

    fn mac(last: u8) -> [u8; 6] {
        [0xaa, 0xaa, 0xaa, 0xaa, 0xaa, last]
    }

    fn client_packet(
        message_type: MessageType,
        mac: [u8; 6],
        xid: u32,
        options: Vec<DhcpOption>,
    ) -> DhcpPacket {
        let mut chaddr = [0u8; 16];
        chaddr[..6].copy_from_slice(&mac);
        let mut all_options = vec![DhcpOption::MessageType(message_type)];
        all_options.extend(options);

        DhcpPacket {
            op: BOOTREQUEST,
            htype: HTYPE_ETHERNET,
            hlen: HLEN_ETHERNET,
            hops: 0,
            xid,
            secs: 0,
            flags: 0x8000,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            sname: [0u8; 64],
            file: [0u8; 128],
            options: all_options,
        }
    }

    #[tokio::test]
    async fn test_discover_then_request_same_ip() {
        let config = scenario_config();
        let leases = test_leases(&config).await;
        let now = Instant::now();
        let mut transaction = Transaction::new(0x1234, now);

        let discover = client_packet(MessageType::Discover, mac(1), 0x1234, vec![]);
        let offer = transaction
            .receive(&discover, now, &config, &leases)
            .await
            .unwrap();
        assert_eq!(offer.op, BOOTREPLY);
        assert_eq!(offer.message_type(), Some(MessageType::Offer));
        assert_eq!(offer.xid, 0x1234);
        assert_eq!(offer.yiaddr, Ipv4Addr::new(10, 47, 0, 1));
        assert_eq!(offer.siaddr, config.server_ip);

        let request = client_packet(
            MessageType::Request,
            mac(1),
            0x1234,
            vec![
                DhcpOption::RequestedIpAddress(offer.yiaddr),
                DhcpOption::ServerIdentifier(config.server_ip),
            ],
        );
        let ack = transaction
            .receive(&request, now + Duration::from_secs(2), &config, &leases)
            .await
            .unwrap();
        assert_eq!(ack.message_type(), Some(MessageType::Ack));
        assert_eq!(ack.yiaddr, offer.yiaddr);
        assert_eq!(ack.secs, 2);
    }

    #[tokio::test]
    async fn test_offer_carries_lease_options() {
        let config = scenario_config();
        let leases = test_leases(&config).await;
        let now = Instant::now();
        let mut transaction = Transaction::new(1, now);

        let discover = client_packet(MessageType::Discover, mac(1), 1, vec![]);
        let offer = transaction
            .receive(&discover, now, &config, &leases)
            .await
            .unwrap();

        let codes: Vec<u8> = offer.options.iter().map(|option| option.code()).collect();
        assert_eq!(codes, vec![53, 1, 3, 6, 15, 28, 51, 54, 58, 59]);
        assert_eq!(
            offer.option(OptionCode::RenewalTime),
            Some(&DhcpOption::RenewalTime(150))
        );
        assert_eq!(
            offer.option(OptionCode::RebindingTime),
            Some(&DhcpOption::RebindingTime(262))
        );
        assert_eq!(
            offer.option(OptionCode::BroadcastAddress),
            Some(&DhcpOption::BroadcastAddress(Ipv4Addr::new(10, 47, 0, 255)))
        );
    }

    #[tokio::test]
    async fn test_offer_options_survive_encoding() {
        let config = scenario_config();
        let leases = test_leases(&config).await;
        let now = Instant::now();
        let mut transaction = Transaction::new(2, now);

        let discover = client_packet(MessageType::Discover, mac(1), 2, vec![]);
        let offer = transaction
            .receive(&discover, now, &config, &leases)
            .await
            .unwrap();

        let decoded = DhcpPacket::parse(&offer.encode()).unwrap();
        assert_eq!(decoded.options, offer.options);
        assert_eq!(decoded.yiaddr, offer.yiaddr);
    }

    #[tokio::test]
    async fn test_request_without_lease_naks() {
        let config = scenario_config();
        let leases = test_leases(&config).await;
        let now = Instant::now();
        let mut table = TransactionTable::new();

        let request = client_packet(MessageType::Request, mac(9), 0xbeef, vec![]);
        let reply = table
            .get_or_create(0xbeef, now)
            .receive(&request, now, &config, &leases)
            .await
            .unwrap();

        assert_eq!(reply.message_type(), Some(MessageType::Nak));
        assert_eq!(reply.yiaddr, Ipv4Addr::UNSPECIFIED);
        assert_eq!(reply.server_identifier(), Some(config.server_ip));
        assert!(leases.get(&MacAddress(mac(9))).await.is_none());
    }

    #[tokio::test]
    async fn test_request_for_other_ip_naks() {
        let config = scenario_config();
        let leases = test_leases(&config).await;
        let now = Instant::now();
        let mut transaction = Transaction::new(7, now);

        let discover = client_packet(MessageType::Discover, mac(1), 7, vec![]);
        transaction.receive(&discover, now, &config, &leases).await;

        let request = client_packet(
            MessageType::Request,
            mac(1),
            7,
            vec![DhcpOption::RequestedIpAddress(Ipv4Addr::new(10, 47, 0, 2))],
        );
        let reply = transaction
            .receive(&request, now, &config, &leases)
            .await
            .unwrap();
        assert_eq!(reply.message_type(), Some(MessageType::Nak));
    }

    #[tokio::test]
    async fn test_request_without_requested_ip_acks_lease() {
        let config = scenario_config();
        let leases = test_leases(&config).await;
        leases
            .find_or_allocate(MacAddress(mac(3)), None, None)
            .await
            .unwrap();

        let now = Instant::now();
        let mut transaction = Transaction::new(11, now);
        let request = client_packet(MessageType::Request, mac(3), 11, vec![]);
        let reply = transaction
            .receive(&request, now, &config, &leases)
            .await
            .unwrap();
        assert_eq!(reply.message_type(), Some(MessageType::Ack));
        assert_eq!(reply.yiaddr, Ipv4Addr::new(10, 47, 0, 1));
    }

    #[tokio::test]
    async fn test_request_naming_other_server_still_answered() {
        let config = scenario_config();
        let leases = test_leases(&config).await;
        let now = Instant::now();
        let other_server = Ipv4Addr::new(10, 47, 0, 99);

        let mut transaction = Transaction::new(3, now);
        let request = client_packet(
            MessageType::Request,
            mac(2),
            3,
            vec![DhcpOption::ServerIdentifier(other_server)],
        );
        let reply = transaction
            .receive(&request, now, &config, &leases)
            .await
            .unwrap();
        assert_eq!(reply.message_type(), Some(MessageType::Nak));

        leases
            .find_or_allocate(MacAddress(mac(1)), None, None)
            .await
            .unwrap();
        let mut transaction = Transaction::new(4, now);
        let request = client_packet(
            MessageType::Request,
            mac(1),
            4,
            vec![
                DhcpOption::RequestedIpAddress(Ipv4Addr::new(10, 47, 0, 1)),
                DhcpOption::ServerIdentifier(other_server),
            ],
        );
        let reply = transaction
            .receive(&request, now, &config, &leases)
            .await
            .unwrap();
        assert_eq!(reply.message_type(), Some(MessageType::Ack));
        assert_eq!(reply.yiaddr, Ipv4Addr::new(10, 47, 0, 1));
        assert_eq!(reply.server_identifier(), Some(config.server_ip));
    }

    #[tokio::test]
    async fn test_request_never_allocates() {
        let config = scenario_config();
        let leases = test_leases(&config).await;
        let now = Instant::now();
        let mut transaction = Transaction::new(5, now);

        let request = client_packet(
            MessageType::Request,
            mac(1),
            5,
            vec![DhcpOption::RequestedIpAddress(Ipv4Addr::new(10, 47, 0, 1))],
        );
        transaction.receive(&request, now, &config, &leases).await;
        assert_eq!(leases.lease_count().await, 0);
        assert_eq!(leases.free_ip_count().await, 2);
    }

    #[tokio::test]
    async fn test_exhausted_range_gets_no_offer() {
        let config = scenario_config();
        let leases = test_leases(&config).await;
        let now = Instant::now();
        let mut table = TransactionTable::new();

        let mut offered = vec![];
        for (xid, last) in [(1u32, 1u8), (2, 2), (3, 3)] {
            let discover = client_packet(MessageType::Discover, mac(last), xid, vec![]);
            let reply = table
                .get_or_create(xid, now)
                .receive(&discover, now, &config, &leases)
                .await;
            offered.push(reply.map(|offer| offer.yiaddr));
        }

        assert_eq!(
            offered,
            vec![
                Some(Ipv4Addr::new(10, 47, 0, 1)),
                Some(Ipv4Addr::new(10, 47, 0, 2)),
                None,
            ]
        );
    }

    #[tokio::test]
    async fn test_repeated_discover_offers_same_ip() {
        let config = scenario_config();
        let leases = test_leases(&config).await;
        let now = Instant::now();
        let mut table = TransactionTable::new();

        let first = client_packet(MessageType::Discover, mac(1), 100, vec![]);
        let second = client_packet(MessageType::Discover, mac(1), 200, vec![]);
        let a = table
            .get_or_create(100, now)
            .receive(&first, now, &config, &leases)
            .await
            .unwrap();
        let b = table
            .get_or_create(200, now)
            .receive(&second, now, &config, &leases)
            .await
            .unwrap();

        assert_eq!(a.yiaddr, b.yiaddr);
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn test_discover_uses_ciaddr_hint() {
        let config = Arc::new(Config::default());
        let leases = test_leases(&config).await;
        let now = Instant::now();
        let mut transaction = Transaction::new(9, now);

        let mut discover = client_packet(MessageType::Discover, mac(1), 9, vec![]);
        discover.ciaddr = Ipv4Addr::new(10, 47, 0, 150);
        let offer = transaction
            .receive(&discover, now, &config, &leases)
            .await
            .unwrap();
        assert_eq!(offer.yiaddr, Ipv4Addr::new(10, 47, 0, 150));
    }

    #[tokio::test]
    async fn test_discover_stores_sanitized_hostname() {
        let config = scenario_config();
        let leases = test_leases(&config).await;
        let now = Instant::now();
        let mut transaction = Transaction::new(9, now);

        let discover = client_packet(
            MessageType::Discover,
            mac(1),
            9,
            vec![DhcpOption::Hostname("my laptop!".to_string())],
        );
        transaction.receive(&discover, now, &config, &leases).await;

        let lease = leases.get(&MacAddress(mac(1))).await.unwrap();
        assert_eq!(lease.hostname.as_deref(), Some("mylaptop"));
    }

    #[tokio::test]
    async fn test_ignored_messages() {
        let config = scenario_config();
        let leases = test_leases(&config).await;
        let now = Instant::now();
        let mut transaction = Transaction::new(4, now);

        for message_type in [
            MessageType::Decline,
            MessageType::Release,
            MessageType::Inform,
        ] {
            let packet = client_packet(message_type, mac(1), 4, vec![]);
            assert!(
                transaction
                    .receive(&packet, now, &config, &leases)
                    .await
                    .is_none()
            );
        }

        let mut unknown = client_packet(MessageType::Discover, mac(1), 4, vec![]);
        unknown.options = vec![DhcpOption::Unknown(53, vec![42])];
        assert!(
            transaction
                .receive(&unknown, now, &config, &leases)
                .await
                .is_none()
        );

        let mut reply = client_packet(MessageType::Discover, mac(1), 4, vec![]);
        reply.op = BOOTREPLY;
        assert!(
            transaction
                .receive(&reply, now, &config, &leases)
                .await
                .is_none()
        );

        assert_eq!(leases.lease_count().await, 0);
        assert!(!transaction.is_closed());
    }

    #[tokio::test]
    async fn test_closed_transaction_ignores_input() {
        let config = scenario_config();
        let leases = test_leases(&config).await;
        let now = Instant::now();
        let mut transaction = Transaction::new(4, now);
        transaction.close();

        let discover = client_packet(MessageType::Discover, mac(1), 4, vec![]);
        assert!(
            transaction
                .receive(&discover, now, &config, &leases)
                .await
                .is_none()
        );
        assert_eq!(leases.lease_count().await, 0);
    }

    #[test]
    fn test_sweep_removes_expired_transactions() {
        let start = Instant::now();
        let mut table = TransactionTable::new();
        table.get_or_create(1, start);
        table.get_or_create(2, start + Duration::from_secs(10));

        assert_eq!(table.sweep(start + Duration::from_secs(29)), 0);
        assert_eq!(table.sweep(start + TRANSACTION_TIMEOUT), 1);
        assert!(table.get(1).is_none());
        assert!(table.get(2).is_some());

        assert_eq!(table.sweep(start + Duration::from_secs(40)), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_sweep_removes_closed_transactions() {
        let now = Instant::now();
        let mut table = TransactionTable::new();
        table.get_or_create(1, now).close();
        table.get_or_create(2, now);

        assert_eq!(table.sweep(now), 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_same_xid_folds_into_one_transaction() {
        let now = Instant::now();
        let mut table = TransactionTable::new();
        let started = table.get_or_create(42, now).started_at();
        let again = table
            .get_or_create(42, now + Duration::from_secs(5))
            .started_at();

        assert_eq!(started, again);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_xid_recreated_after_removal() {
        let start = Instant::now();
        let mut table = TransactionTable::new();
        table.get_or_create(42, start);
        table.sweep(start + Duration::from_secs(31));

        let later = start + Duration::from_secs(32);
        assert_eq!(table.get_or_create(42, later).started_at(), later);
    }

    #[test]
    fn test_close_all() {
        let now = Instant::now();
        let mut table = TransactionTable::new();
        table.get_or_create(1, now);
        table.get_or_create(2, now);

        assert_eq!(table.close_all(), 2);
        assert!(table.is_empty());
    }
}
