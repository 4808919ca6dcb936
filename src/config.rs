use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

/// Longest hostname kept on a lease (one DNS label).
const MAX_HOSTNAME_LENGTH: usize = 63;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub network: Ipv4Net,
    /// Inclusive allocation range. Defaults to every host address of `network`.
    #[serde(default)]
    pub range: Option<AddressRange>,
    pub router: Ipv4Addr,
    pub domain_name: String,
    pub lease_duration_seconds: u32,
    pub dns_servers: Vec<Ipv4Addr>,
    pub server_ip: Ipv4Addr,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRange {
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageDriver {
    /// Leases kept in a JSON file on disk.
    Json,
    /// Leases kept in memory only; lost on restart.
    Memory,
}

impl FromStr for StorageDriver {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "memory" => Ok(Self::Memory),
            other => Err(Error::InvalidConfig(format!(
                "invalid storage driver '{}' (supported: json, memory)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub driver: StorageDriver,
    pub path: String,
    pub flush_interval_millis: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            driver: StorageDriver::Json,
            path: "leases.json".to_string(),
            flush_interval_millis: 5000,
        }
    }
}

impl StorageConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_millis)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: Ipv4Net::new(Ipv4Addr::new(10, 47, 0, 0), 24)
                .expect("24 is a valid IPv4 prefix length"),
            range: Some(AddressRange {
                start: Ipv4Addr::new(10, 47, 0, 100),
                end: Ipv4Addr::new(10, 47, 0, 200),
            }),
            router: Ipv4Addr::new(10, 47, 0, 1),
            domain_name: "local".to_string(),
            lease_duration_seconds: 300,
            dns_servers: vec![
                Ipv4Addr::new(1, 1, 1, 1),
                Ipv4Addr::new(8, 8, 8, 8),
                Ipv4Addr::new(9, 9, 9, 9),
            ],
            server_ip: Ipv4Addr::new(10, 47, 0, 1),
            storage: StorageConfig::default(),
        }
    }
}

impl Config {
    /// Loads the config file (writing defaults if it is missing), applies
    /// `DHCP_*` environment overrides and validates the result.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load_or_create(path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Overrides file values with `DHCP_SERVER_IP`, `DHCP_STORAGE_DRIVER`
    /// and `DHCP_STORAGE_PATH` as returned by `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("DHCP_SERVER_IP") {
            self.server_ip = value.trim().parse().map_err(|_| {
                Error::InvalidConfig(format!("DHCP_SERVER_IP '{}' is not an IPv4 address", value))
            })?;
        }
        if let Some(value) = lookup("DHCP_STORAGE_DRIVER") {
            self.storage.driver = value.trim().parse()?;
        }
        if let Some(value) = lookup("DHCP_STORAGE_PATH") {
            self.storage.path = value;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let start = u32::from(self.pool_start());
        let end = u32::from(self.pool_end());

        if start > end {
            return Err(Error::InvalidConfig(format!(
                "bad DHCP range: {} - {} is reversed",
                self.pool_start(),
                self.pool_end()
            )));
        }

        if !self.network.contains(&self.pool_start()) || !self.network.contains(&self.pool_end()) {
            return Err(Error::InvalidConfig(format!(
                "bad DHCP range: {} - {} not in network {}",
                self.pool_start(),
                self.pool_end(),
                self.network
            )));
        }

        if self.allocatable_addresses().take(2).count() < 2 {
            return Err(Error::InvalidConfig(
                "bad DHCP range: range is too small".to_string(),
            ));
        }

        if !self.network.contains(&self.server_ip)
            || self.server_ip == self.network.network()
            || self.server_ip == self.network.broadcast()
        {
            return Err(Error::InvalidConfig(format!(
                "no usable server IP: {} is not a host address in {}",
                self.server_ip, self.network
            )));
        }

        if !self.network.contains(&self.router) {
            warn!("Router {} not in network {}", self.router, self.network);
        }

        if self.lease_duration_seconds == 0 {
            return Err(Error::InvalidConfig(
                "lease_duration_seconds must be greater than 0".to_string(),
            ));
        }

        if self.storage.flush_interval_millis == 0 {
            return Err(Error::InvalidConfig(
                "storage.flush_interval_millis must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn pool_start(&self) -> Ipv4Addr {
        match self.range {
            Some(range) => range.start,
            None => Ipv4Addr::from(u32::from(self.network.network()).saturating_add(1)),
        }
    }

    pub fn pool_end(&self) -> Ipv4Addr {
        match self.range {
            Some(range) => range.end,
            None => Ipv4Addr::from(u32::from(self.network.broadcast()).saturating_sub(1)),
        }
    }

    pub fn ip_in_pool(&self, ip: Ipv4Addr) -> bool {
        let addr = u32::from(ip);
        addr >= u32::from(self.pool_start()) && addr <= u32::from(self.pool_end())
    }

    pub fn pool_size(&self) -> u32 {
        u32::from(self.pool_end())
            .saturating_sub(u32::from(self.pool_start()))
            .saturating_add(1)
    }

    /// Addresses inside the range that are never handed out.
    pub fn is_reserved(&self, ip: Ipv4Addr) -> bool {
        ip == self.server_ip || ip == self.router
    }

    /// Range addresses in ascending order, skipping reserved ones.
    pub fn allocatable_addresses(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        (u32::from(self.pool_start())..=u32::from(self.pool_end()))
            .map(Ipv4Addr::from)
            .filter(|ip| !self.is_reserved(*ip))
    }

    pub fn subnet_mask(&self) -> Ipv4Addr {
        self.network.netmask()
    }

    pub fn broadcast_address(&self) -> Ipv4Addr {
        self.network.broadcast()
    }

    /// T1: half of the lease time.
    pub fn renewal_time_seconds(&self) -> u32 {
        self.lease_duration_seconds / 2
    }

    /// T2: seven eighths of the lease time.
    pub fn rebinding_time_seconds(&self) -> u32 {
        ((self.lease_duration_seconds as u64 * 7) / 8) as u32
    }

    /// DNS servers with duplicates removed, first occurrence wins.
    pub fn unique_dns_servers(&self) -> Vec<Ipv4Addr> {
        let mut servers = Vec::with_capacity(self.dns_servers.len());
        for server in &self.dns_servers {
            if !servers.contains(server) {
                servers.push(*server);
            }
        }
        servers
    }
}

/// Strips a client-supplied hostname down to DNS-safe characters.
///
/// Returns `None` when nothing usable is left.
pub fn sanitize_hostname(hostname: &str) -> Option<String> {
    let cleaned: String = hostname
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '.')
        .take(MAX_HOSTNAME_LENGTH)
        .collect();
    let cleaned = cleaned.trim_matches(|c| c == '-' || c == '.').to_string();
    if cleaned.is_empty() { None } else { Some(cleaned) }
}
