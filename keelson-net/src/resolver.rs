//! Name resolution: user overrides merged with the system databases.
//!
//! Overrides always win. When they miss, the host and port databases
//! (the platform's `hosts` and `services` files) are consulted, then the
//! system resolver, with positive and negative caching in between.
//! [`Resolver::get_endpoint`] parses the endpoint text grammar:
//!
//! ```text
//! endpoint    = port-only | v6-endpoint | v4-or-host-endpoint | bare-v6
//! port-only   = DIGITS
//! v6-endpoint = "[" v6literal "]:" (DIGITS | service-name)
//! v4-or-host-endpoint = (v4literal | hostname) ":" (DIGITS | service-name)
//! bare-v6     = v6literal        ; recognized when >= 2 unbracketed ':'
//! ```

use dashmap::DashMap;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use keelson_core::endpoint::{Endpoint, IpAddressType, Transport};
use keelson_core::error::{Error, Result};
use keelson_core::strand::{Executor, ExecutorRef, Strand, ThreadPool};

/// Options filtering an address lookup.
#[derive(Debug, Clone, Default)]
pub struct IpAddressOptions {
    pub ip_address_type: Option<IpAddressType>,
    /// Select one address from the result list, modulo its length.
    pub ip_address_selector: Option<usize>,
    pub transport: Option<Transport>,
}

/// Options filtering a port lookup.
#[derive(Debug, Clone, Default)]
pub struct PortOptions {
    /// Select one port from the result list, modulo its length.
    pub port_selector: Option<usize>,
    pub transport: Option<Transport>,
}

/// Options steering endpoint text parsing.
#[derive(Debug, Clone, Default)]
pub struct EndpointOptions {
    /// Address used when the text names only a port.
    pub ip_address_fallback: Option<IpAddr>,
    /// Port used when the text names only an address.
    pub port_fallback: Option<u16>,
    pub ip_address_type: Option<IpAddressType>,
    pub ip_address_selector: Option<usize>,
    pub port_selector: Option<usize>,
    pub transport: Option<Transport>,
}

impl EndpointOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_ip_address_fallback(mut self, fallback: IpAddr) -> Self {
        self.ip_address_fallback = Some(fallback);
        self
    }

    #[must_use]
    pub fn with_port_fallback(mut self, fallback: u16) -> Self {
        self.port_fallback = Some(fallback);
        self
    }

    #[must_use]
    pub fn with_ip_address_type(mut self, family: IpAddressType) -> Self {
        self.ip_address_type = Some(family);
        self
    }

    #[must_use]
    pub fn with_transport(mut self, transport: Transport) -> Self {
        self.transport = Some(transport);
        self
    }
}

const MAX_CLIENT_ATTEMPTS: usize = 5;
const MAX_CLIENT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_CLIENT_DOTS: usize = 15;
const MAX_CLIENT_DOMAIN_SEARCH: usize = 6;

/// Resolver configuration. Out-of-range values are silently capped at
/// assignment.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Consult the per-instance overrides before anything else.
    pub overrides_enabled: bool,

    /// Consult the host database file.
    pub host_db_enabled: bool,
    /// Host database path; the platform default when `None`.
    pub host_db_path: Option<PathBuf>,

    /// Consult the port database file for named services.
    pub port_db_enabled: bool,
    /// Port database path; the platform default when `None`.
    pub port_db_path: Option<PathBuf>,

    pub positive_cache_enabled: bool,
    pub positive_cache_min_ttl: Duration,
    pub positive_cache_max_ttl: Duration,

    pub negative_cache_enabled: bool,
    pub negative_cache_min_ttl: Duration,
    pub negative_cache_max_ttl: Duration,

    /// Use a DNS client speaking to remote name servers.
    pub client_enabled: bool,
    pub client_spec_path: Option<PathBuf>,
    pub client_remote_endpoints: Vec<Endpoint>,
    client_domain_search: Vec<String>,
    client_attempts: Option<usize>,
    client_timeout: Option<Duration>,
    pub client_rotate: bool,
    client_dots: Option<usize>,
    pub client_debug: bool,

    /// Resolve through blocking system calls on a dedicated thread pool.
    pub system_enabled: bool,
    system_min_threads: usize,
    system_max_threads: usize,

    /// Serve resolution requests to remote clients.
    pub server_enabled: bool,
    pub server_source_endpoints: Vec<Endpoint>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            overrides_enabled: true,
            host_db_enabled: false,
            host_db_path: None,
            port_db_enabled: false,
            port_db_path: None,
            positive_cache_enabled: false,
            positive_cache_min_ttl: Duration::from_secs(1),
            positive_cache_max_ttl: Duration::from_secs(300),
            negative_cache_enabled: false,
            negative_cache_min_ttl: Duration::from_secs(1),
            negative_cache_max_ttl: Duration::from_secs(30),
            client_enabled: false,
            client_spec_path: None,
            client_remote_endpoints: Vec::new(),
            client_domain_search: Vec::new(),
            client_attempts: None,
            client_timeout: None,
            client_rotate: false,
            client_dots: None,
            client_debug: false,
            system_enabled: true,
            system_min_threads: 1,
            system_max_threads: 4,
            server_enabled: false,
            server_source_endpoints: Vec::new(),
        }
    }
}

impl ResolverConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_host_db(mut self, path: PathBuf) -> Self {
        self.host_db_enabled = true;
        self.host_db_path = Some(path);
        self
    }

    #[must_use]
    pub fn with_port_db(mut self, path: PathBuf) -> Self {
        self.port_db_enabled = true;
        self.port_db_path = Some(path);
        self
    }

    #[must_use]
    pub fn with_system_enabled(mut self, enabled: bool) -> Self {
        self.system_enabled = enabled;
        self
    }

    /// Set the DNS client domain search list; silently capped at 6
    /// entries.
    pub fn set_client_domain_search(&mut self, mut search: Vec<String>) {
        search.truncate(MAX_CLIENT_DOMAIN_SEARCH);
        self.client_domain_search = search;
    }

    #[must_use]
    pub fn client_domain_search(&self) -> &[String] {
        &self.client_domain_search
    }

    /// Set the number of DNS client attempts; silently capped at 5.
    pub fn set_client_attempts(&mut self, attempts: usize) {
        self.client_attempts = Some(attempts.min(MAX_CLIENT_ATTEMPTS));
    }

    #[must_use]
    pub fn client_attempts(&self) -> Option<usize> {
        self.client_attempts
    }

    /// Set the per-request DNS client timeout; silently capped at 30
    /// seconds.
    pub fn set_client_timeout(&mut self, timeout: Duration) {
        self.client_timeout = Some(timeout.min(MAX_CLIENT_TIMEOUT));
    }

    #[must_use]
    pub fn client_timeout(&self) -> Option<Duration> {
        self.client_timeout
    }

    /// Set the absolute-query dot threshold; silently capped at 15.
    pub fn set_client_dots(&mut self, dots: usize) {
        self.client_dots = Some(dots.min(MAX_CLIENT_DOTS));
    }

    #[must_use]
    pub fn client_dots(&self) -> Option<usize> {
        self.client_dots
    }

    /// Set the system thread-pool bounds; the maximum is raised to the
    /// minimum when inverted.
    pub fn set_system_threads(&mut self, min: usize, max: usize) {
        self.system_min_threads = min.max(1);
        self.system_max_threads = max.max(self.system_min_threads);
    }

    #[must_use]
    pub const fn system_min_threads(&self) -> usize {
        self.system_min_threads
    }

    #[must_use]
    pub const fn system_max_threads(&self) -> usize {
        self.system_max_threads
    }
}

#[derive(Default)]
struct OverrideMaps {
    ip_by_domain: HashMap<String, Vec<IpAddr>>,
    domain_by_ip: HashMap<IpAddr, String>,
    tcp_port_by_service: HashMap<String, Vec<u16>>,
    tcp_service_by_port: HashMap<u16, String>,
    udp_port_by_service: HashMap<String, Vec<u16>>,
    udp_service_by_port: HashMap<u16, String>,
    local_ip_list: Option<Vec<IpAddr>>,
    hostname: Option<String>,
    hostname_fully_qualified: Option<String>,
}

impl OverrideMaps {
    fn is_empty(&self) -> bool {
        self.ip_by_domain.is_empty()
            && self.tcp_port_by_service.is_empty()
            && self.udp_port_by_service.is_empty()
            && self.local_ip_list.is_none()
            && self.hostname.is_none()
            && self.hostname_fully_qualified.is_none()
    }
}

fn sort_ip_address_list(list: &mut [IpAddr]) {
    // v4 before v6, each ascending
    list.sort_by_key(|addr| match addr {
        IpAddr::V4(v4) => (0u8, u128::from(u32::from(*v4))),
        IpAddr::V6(v6) => (1u8, u128::from_be_bytes(v6.octets())),
    });
}

fn address_matches(addr: &IpAddr, family: Option<IpAddressType>) -> bool {
    match family {
        None => true,
        Some(IpAddressType::V4) => addr.is_ipv4(),
        Some(IpAddressType::V6) => addr.is_ipv6(),
    }
}

/// Reconcile an explicit family filter with a transport's family. They
/// must agree when both are given.
fn classify_family(options: &IpAddressOptions) -> Result<Option<IpAddressType>> {
    let from_transport = options.transport.and_then(|t| t.ip_address_type());
    match (options.ip_address_type, from_transport) {
        (Some(explicit), Some(required)) if explicit != required => Err(Error::Invalid),
        (explicit, required) => Ok(explicit.or(required)),
    }
}

/// User-supplied name and service mappings, consulted before any
/// database.
#[derive(Default)]
pub struct ResolverOverrides {
    maps: Mutex<OverrideMaps>,
}

impl ResolverOverrides {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn has_overrides(&self) -> bool {
        !self.maps.lock().is_empty()
    }

    /// Replace the addresses of `domain`, unmapping the previous reverse
    /// entries.
    pub fn set_ip_address(&self, domain: &str, addresses: Vec<IpAddr>) {
        let mut maps = self.maps.lock();
        let target = maps.ip_by_domain.entry(domain.to_owned()).or_default();
        let stale: Vec<IpAddr> = std::mem::take(target);
        for address in &addresses {
            target.push(*address);
        }
        for address in stale {
            maps.domain_by_ip.remove(&address);
        }
        for address in addresses {
            maps.domain_by_ip.insert(address, domain.to_owned());
        }
    }

    /// Append addresses for `domain`.
    pub fn add_ip_address(&self, domain: &str, address: IpAddr) {
        let mut maps = self.maps.lock();
        maps.ip_by_domain
            .entry(domain.to_owned())
            .or_default()
            .push(address);
        maps.domain_by_ip.insert(address, domain.to_owned());
    }

    /// Replace the ports of `service` for `transport`'s protocol,
    /// unmapping the previous reverse entries.
    pub fn set_port(&self, service: &str, ports: Vec<u16>, transport: Transport) -> Result<()> {
        let mut maps = self.maps.lock();
        let maps = &mut *maps;
        let (forward, reverse) = if transport.is_tcp() {
            (&mut maps.tcp_port_by_service, &mut maps.tcp_service_by_port)
        } else if transport.is_udp() {
            (&mut maps.udp_port_by_service, &mut maps.udp_service_by_port)
        } else {
            return Err(Error::Invalid);
        };

        let target = forward.entry(service.to_owned()).or_default();
        let stale: Vec<u16> = std::mem::take(target);
        target.extend_from_slice(&ports);
        for port in stale {
            reverse.remove(&port);
        }
        for port in ports {
            reverse.insert(port, service.to_owned());
        }
        Ok(())
    }

    pub fn set_local_ip_address(&self, addresses: Vec<IpAddr>) {
        self.maps.lock().local_ip_list = Some(addresses);
    }

    pub fn set_hostname(&self, name: &str) {
        self.maps.lock().hostname = Some(name.to_owned());
    }

    pub fn set_hostname_fully_qualified(&self, name: &str) {
        self.maps.lock().hostname_fully_qualified = Some(name.to_owned());
    }

    fn get_ip_address(&self, domain: &str, options: &IpAddressOptions) -> Result<Vec<IpAddr>> {
        let family = classify_family(options)?;
        let maps = self.maps.lock();
        let Some(list) = maps.ip_by_domain.get(domain) else {
            return Err(Error::NotFound);
        };

        let mut result: Vec<IpAddr> = list
            .iter()
            .filter(|addr| address_matches(addr, family))
            .copied()
            .collect();
        if result.is_empty() {
            return Err(Error::NotFound);
        }
        if family.is_none() {
            sort_ip_address_list(&mut result);
        }
        if let Some(selector) = options.ip_address_selector {
            result = vec![result[selector % result.len()]];
        }
        Ok(result)
    }

    fn get_domain_name(&self, address: &IpAddr) -> Result<String> {
        self.maps
            .lock()
            .domain_by_ip
            .get(address)
            .filter(|name| !name.is_empty())
            .cloned()
            .ok_or(Error::NotFound)
    }

    fn get_port(&self, service: &str, options: &PortOptions) -> Result<Vec<u16>> {
        let maps = self.maps.lock();
        let mut ports = Vec::new();
        let (tcp, udp) = match options.transport {
            None => (true, true),
            Some(t) if t.is_tcp() => (true, false),
            Some(t) if t.is_udp() => (false, true),
            Some(_) => return Err(Error::Invalid),
        };
        if tcp {
            if let Some(list) = maps.tcp_port_by_service.get(service) {
                ports.extend_from_slice(list);
            }
        }
        if udp {
            if let Some(list) = maps.udp_port_by_service.get(service) {
                ports.extend_from_slice(list);
            }
        }
        if ports.is_empty() {
            return Err(Error::NotFound);
        }
        if let Some(selector) = options.port_selector {
            ports = vec![ports[selector % ports.len()]];
        }
        Ok(ports)
    }

    fn get_service_name(&self, port: u16, transport: Transport) -> Result<String> {
        let maps = self.maps.lock();
        let reverse = if transport.is_tcp() {
            &maps.tcp_service_by_port
        } else if transport.is_udp() {
            &maps.udp_service_by_port
        } else {
            return Err(Error::Invalid);
        };
        reverse
            .get(&port)
            .filter(|name| !name.is_empty())
            .cloned()
            .ok_or(Error::NotFound)
    }

    fn get_local_ip_address(&self, options: &IpAddressOptions) -> Result<Vec<IpAddr>> {
        let family = classify_family(options)?;
        let maps = self.maps.lock();
        let Some(list) = maps.local_ip_list.as_ref() else {
            return Err(Error::NotFound);
        };
        let result: Vec<IpAddr> = list
            .iter()
            .filter(|addr| address_matches(addr, family))
            .copied()
            .collect();
        if result.is_empty() {
            return Err(Error::NotFound);
        }
        Ok(result)
    }

    fn get_hostname(&self) -> Result<String> {
        self.maps.lock().hostname.clone().ok_or(Error::NotFound)
    }

    fn get_hostname_fully_qualified(&self) -> Result<String> {
        self.maps
            .lock()
            .hostname_fully_qualified
            .clone()
            .ok_or(Error::NotFound)
    }
}

#[cfg(unix)]
const DEFAULT_HOST_DB_PATH: &str = "/etc/hosts";
#[cfg(unix)]
const DEFAULT_PORT_DB_PATH: &str = "/etc/services";
#[cfg(windows)]
const DEFAULT_HOST_DB_PATH: &str = r"C:\Windows\System32\drivers\etc\hosts";
#[cfg(windows)]
const DEFAULT_PORT_DB_PATH: &str = r"C:\Windows\System32\drivers\etc\services";

fn parse_host_db(path: &Path) -> HashMap<String, Vec<IpAddr>> {
    let mut map: HashMap<String, Vec<IpAddr>> = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(path) else {
        debug!(path = %path.display(), "host database unreadable");
        return map;
    };
    for line in contents.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let Some(address) = fields.next().and_then(|a| a.parse::<IpAddr>().ok()) else {
            continue;
        };
        for name in fields {
            map.entry(name.to_ascii_lowercase()).or_default().push(address);
        }
    }
    map
}

fn parse_port_db(path: &Path) -> (HashMap<String, Vec<u16>>, HashMap<String, Vec<u16>>) {
    let mut tcp: HashMap<String, Vec<u16>> = HashMap::new();
    let mut udp: HashMap<String, Vec<u16>> = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(path) else {
        debug!(path = %path.display(), "port database unreadable");
        return (tcp, udp);
    };
    for line in contents.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let Some(service) = fields.next() else {
            continue;
        };
        let Some((port, protocol)) = fields.next().and_then(|f| f.split_once('/')) else {
            continue;
        };
        let Ok(port) = port.parse::<u16>() else {
            continue;
        };
        let target = match protocol {
            "tcp" => &mut tcp,
            "udp" => &mut udp,
            _ => continue,
        };
        target
            .entry(service.to_ascii_lowercase())
            .or_default()
            .push(port);
        for alias in fields {
            target
                .entry(alias.to_ascii_lowercase())
                .or_default()
                .push(port);
        }
    }
    (tcp, udp)
}

/// Completion callback of a deferred endpoint resolution.
pub type GetEndpointCallback = Box<dyn FnOnce(Result<Endpoint>) + Send + 'static>;

/// The resolver.
pub struct Resolver {
    config: ResolverConfig,
    overrides: ResolverOverrides,
    host_db: HashMap<String, Vec<IpAddr>>,
    tcp_port_db: HashMap<String, Vec<u16>>,
    udp_port_db: HashMap<String, Vec<u16>>,
    positive_cache: DashMap<String, (Vec<IpAddr>, Instant)>,
    negative_cache: DashMap<String, Instant>,
    pool: Arc<ThreadPool>,
}

impl Resolver {
    #[must_use]
    pub fn create(config: ResolverConfig) -> Arc<Self> {
        let host_db = if config.host_db_enabled {
            let path = config
                .host_db_path
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_HOST_DB_PATH));
            parse_host_db(&path)
        } else {
            HashMap::new()
        };

        let (tcp_port_db, udp_port_db) = if config.port_db_enabled {
            let path = config
                .port_db_path
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PORT_DB_PATH));
            parse_port_db(&path)
        } else {
            (HashMap::new(), HashMap::new())
        };

        let pool = ThreadPool::with_threads(config.system_min_threads());

        Arc::new(Self {
            config,
            overrides: ResolverOverrides::new(),
            host_db,
            tcp_port_db,
            udp_port_db,
            positive_cache: DashMap::new(),
            negative_cache: DashMap::new(),
            pool,
        })
    }

    /// The per-instance overrides.
    #[must_use]
    pub fn overrides(&self) -> &ResolverOverrides {
        &self.overrides
    }

    fn positive_ttl(&self) -> Duration {
        self.config
            .positive_cache_max_ttl
            .max(self.config.positive_cache_min_ttl)
    }

    fn negative_ttl(&self) -> Duration {
        self.config
            .negative_cache_max_ttl
            .max(self.config.negative_cache_min_ttl)
    }

    fn system_lookup(&self, domain: &str) -> Result<Vec<IpAddr>> {
        let now = Instant::now();
        if self.config.negative_cache_enabled {
            if let Some(expiry) = self.negative_cache.get(domain) {
                if *expiry > now {
                    return Err(Error::NotFound);
                }
            }
        }
        if self.config.positive_cache_enabled {
            if let Some(cached) = self.positive_cache.get(domain) {
                let (addresses, expiry) = cached.value();
                if *expiry > now {
                    return Ok(addresses.clone());
                }
            }
        }

        let resolved: Vec<IpAddr> = (domain, 0u16)
            .to_socket_addrs()
            .map(|addrs| addrs.map(|a| a.ip()).collect::<Vec<_>>())
            .unwrap_or_default();

        if resolved.is_empty() {
            if self.config.negative_cache_enabled {
                self.negative_cache
                    .insert(domain.to_owned(), now + self.negative_ttl());
            }
            return Err(Error::NotFound);
        }
        if self.config.positive_cache_enabled {
            self.positive_cache
                .insert(domain.to_owned(), (resolved.clone(), now + self.positive_ttl()));
        }
        Ok(resolved)
    }

    /// Resolve `domain` to its addresses: overrides, then the host
    /// database, then the system resolver.
    pub fn get_ip_address(&self, domain: &str, options: &IpAddressOptions) -> Result<Vec<IpAddr>> {
        if self.config.overrides_enabled && self.overrides.has_overrides() {
            if let Ok(addresses) = self.overrides.get_ip_address(domain, options) {
                return Ok(addresses);
            }
        }

        let family = classify_family(options)?;
        let mut candidates: Vec<IpAddr> = Vec::new();

        if self.config.host_db_enabled {
            if let Some(list) = self.host_db.get(&domain.to_ascii_lowercase()) {
                candidates.extend_from_slice(list);
            }
        }
        if candidates.is_empty() && self.config.system_enabled {
            candidates = self.system_lookup(domain)?;
        }

        let mut result: Vec<IpAddr> = candidates
            .into_iter()
            .filter(|addr| address_matches(addr, family))
            .collect();
        if result.is_empty() {
            return Err(Error::NotFound);
        }
        sort_ip_address_list(&mut result);
        if let Some(selector) = options.ip_address_selector {
            result = vec![result[selector % result.len()]];
        }
        Ok(result)
    }

    /// Reverse-resolve an address to its domain; overrides only.
    pub fn get_domain_name(&self, address: &IpAddr) -> Result<String> {
        if self.config.overrides_enabled && self.overrides.has_overrides() {
            if let Ok(name) = self.overrides.get_domain_name(address) {
                return Ok(name);
            }
        }
        Err(Error::NotFound)
    }

    /// Resolve a service name to its ports: overrides, then the port
    /// database.
    pub fn get_port(&self, service: &str, options: &PortOptions) -> Result<Vec<u16>> {
        if self.config.overrides_enabled && self.overrides.has_overrides() {
            if let Ok(ports) = self.overrides.get_port(service, options) {
                return Ok(ports);
            }
        }

        let mut ports = Vec::new();
        let (tcp, udp) = match options.transport {
            None => (true, true),
            Some(t) if t.is_tcp() => (true, false),
            Some(t) if t.is_udp() => (false, true),
            Some(_) => return Err(Error::Invalid),
        };
        let service = service.to_ascii_lowercase();
        if tcp {
            if let Some(list) = self.tcp_port_db.get(&service) {
                ports.extend_from_slice(list);
            }
        }
        if udp {
            if let Some(list) = self.udp_port_db.get(&service) {
                ports.extend_from_slice(list);
            }
        }
        if ports.is_empty() {
            return Err(Error::NotFound);
        }
        if let Some(selector) = options.port_selector {
            ports = vec![ports[selector % ports.len()]];
        }
        Ok(ports)
    }

    /// Reverse-resolve a port to its service name; overrides only.
    pub fn get_service_name(&self, port: u16, transport: Transport) -> Result<String> {
        if self.config.overrides_enabled && self.overrides.has_overrides() {
            if let Ok(name) = self.overrides.get_service_name(port, transport) {
                return Ok(name);
            }
        }
        Err(Error::NotFound)
    }

    /// The local host's addresses; overrides only.
    pub fn get_local_ip_address(&self, options: &IpAddressOptions) -> Result<Vec<IpAddr>> {
        if self.config.overrides_enabled {
            if let Ok(addresses) = self.overrides.get_local_ip_address(options) {
                return Ok(addresses);
            }
        }
        Err(Error::NotFound)
    }

    /// The local hostname.
    pub fn get_hostname(&self) -> Result<String> {
        if self.config.overrides_enabled {
            if let Ok(name) = self.overrides.get_hostname() {
                return Ok(name);
            }
        }
        #[cfg(target_os = "linux")]
        if self.config.system_enabled {
            if let Ok(name) = std::fs::read_to_string("/proc/sys/kernel/hostname") {
                let name = name.trim();
                if !name.is_empty() {
                    return Ok(name.to_owned());
                }
            }
        }
        Err(Error::NotFound)
    }

    /// The fully-qualified local hostname; overrides only.
    pub fn get_hostname_fully_qualified(&self) -> Result<String> {
        if self.config.overrides_enabled {
            if let Ok(name) = self.overrides.get_hostname_fully_qualified() {
                return Ok(name);
            }
        }
        Err(Error::NotFound)
    }

    /// Parse `text` into an endpoint, resolving names and services as
    /// needed and applying the family/transport post-filters.
    pub fn get_endpoint(&self, text: &str, options: &EndpointOptions) -> Result<Endpoint> {
        if let Some(transport) = options.transport {
            if transport.is_local() {
                return Err(Error::Invalid);
            }
        }

        let mut address: Option<IpAddr> = None;
        let mut port: Option<u16> = None;
        let mut unresolved_domain: Option<&str> = None;
        let mut unresolved_port: Option<&str> = None;

        if !text.is_empty() {
            if text.bytes().all(|b| b.is_ascii_digit()) {
                port = Some(text.parse::<u16>().map_err(|_| Error::Invalid)?);
            } else if let Some(rest) = text.strip_prefix('[') {
                // [v6]:port
                let (literal, after) = rest.rsplit_once(']').ok_or(Error::Invalid)?;
                address = Some(IpAddr::V6(
                    literal.parse::<Ipv6Addr>().map_err(|_| Error::Invalid)?,
                ));
                let port_text = after.strip_prefix(':').ok_or(Error::Invalid)?;
                if port_text.is_empty() {
                    return Err(Error::Invalid);
                }
                match port_text.parse::<u16>() {
                    Ok(parsed) => port = Some(parsed),
                    Err(_) => unresolved_port = Some(port_text),
                }
            } else {
                let colons = text.bytes().filter(|b| *b == b':').count();
                if colons == 0 {
                    // address or host, no port
                    match text.parse::<IpAddr>() {
                        Ok(parsed) => address = Some(parsed),
                        Err(_) => unresolved_domain = Some(text),
                    }
                } else if colons == 1 {
                    // v4-or-host : port-or-service
                    let (host_text, port_text) = text.split_once(':').expect("one colon");
                    match host_text.parse::<Ipv4Addr>() {
                        Ok(parsed) => address = Some(IpAddr::V4(parsed)),
                        Err(_) => unresolved_domain = Some(host_text),
                    }
                    if port_text.is_empty() {
                        return Err(Error::Invalid);
                    }
                    match port_text.parse::<u16>() {
                        Ok(parsed) => port = Some(parsed),
                        Err(_) => unresolved_port = Some(port_text),
                    }
                } else {
                    // two or more unbracketed colons: a bare v6 literal
                    address = Some(IpAddr::V6(
                        text.parse::<Ipv6Addr>().map_err(|_| Error::Invalid)?,
                    ));
                }
            }
        }

        if let Some(service) = unresolved_port {
            let port_options = PortOptions {
                port_selector: options.port_selector,
                transport: options.transport,
            };
            let ports = self.get_port(service, &port_options)?;
            port = Some(*ports.first().ok_or(Error::NotFound)?);
        } else if port.is_none() {
            port = Some(options.port_fallback.ok_or(Error::Invalid)?);
        }

        if let Some(domain) = unresolved_domain {
            let address_options = IpAddressOptions {
                ip_address_type: options.ip_address_type,
                ip_address_selector: options.ip_address_selector,
                transport: options.transport,
            };
            let addresses = self.get_ip_address(domain, &address_options)?;
            address = Some(*addresses.first().ok_or(Error::NotFound)?);
        } else if address.is_none() {
            address = Some(options.ip_address_fallback.ok_or(Error::Invalid)?);
        }

        let address = address.ok_or(Error::Invalid)?;
        let port = port.ok_or(Error::Invalid)?;

        if !address_matches(&address, options.ip_address_type) {
            return Err(Error::Invalid);
        }
        if let Some(transport) = options.transport {
            match transport.ip_address_type() {
                Some(family) if !address_matches(&address, Some(family)) => {
                    return Err(Error::Invalid);
                }
                None => return Err(Error::Invalid),
                _ => {}
            }
        }

        Ok(Endpoint::Ip(SocketAddr::new(address, port)))
    }

    /// [`Resolver::get_endpoint`] on the resolver's thread pool, with the
    /// completion posted through `strand`.
    pub fn get_endpoint_deferred(
        self: &Arc<Self>,
        text: String,
        options: EndpointOptions,
        strand: Strand,
        callback: GetEndpointCallback,
    ) {
        let resolver = self.clone();
        self.pool.execute(Box::new(move || {
            let result = resolver.get_endpoint(&text, &options);
            strand.execute(Box::new(move || callback(result)));
        }));
    }

    /// The executor backing deferred resolutions.
    #[must_use]
    pub fn executor(&self) -> ExecutorRef {
        self.pool.clone()
    }
}
