//! Protocol parameters of the AODV engine (RFC 3561, section 10).
//! Every field has a default, so a configuration file only needs to list what it changes.
//! Timings are expressed in milliseconds. Parameters the RFC derives from others are
//! optional overrides; when absent they are computed from the base values.
use crate::{AodvError, AodvErrorKind};
use chrono::Duration;
use std::convert::TryFrom;
use std::fs::File;
use std::io::Read;
use std::path::Path;

const RREQ_RETRIES: u32 = 2;
/// Upper bound on rreq_retries. Keeps the exponential backoff representable.
const MAX_RREQ_RETRIES: u32 = 32;
const TTL_START: u8 = 1;
const TTL_INCREMENT: u8 = 2;
const TTL_THRESHOLD: u8 = 7;
const TIMEOUT_BUFFER: u8 = 2;
const NET_DIAMETER: u8 = 35;
const NODE_TRAVERSAL_TIME: i64 = 40;
const ACTIVE_ROUTE_TIMEOUT: i64 = 3000;
const HELLO_INTERVAL: i64 = 1000;
const ALLOWED_HELLO_LOSS: u32 = 2;
const MAX_QUEUE_LEN: usize = 64;
const MAX_QUEUE_LEN_PER_DESTINATION: usize = 32;
const MAX_QUEUE_TIME: i64 = 30_000;
const LOCAL_ADD_TTL: u8 = 2;
const RREQ_RATE_LIMIT: u32 = 10;
const RERR_RATE_LIMIT: u32 = 10;
const MAINTENANCE_INTERVAL: i64 = 1000;
/// K in DELETE_PERIOD = K * max(ACTIVE_ROUTE_TIMEOUT, HELLO_INTERVAL)
const DELETE_PERIOD_FACTOR: i64 = 5;
/// Extra slack on top of NODE_TRAVERSAL_TIME when waiting for a neighbor's RREP-ACK.
const NEXT_HOP_WAIT_SLACK: i64 = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AodvConfig {
    /// Number of RREQ transmissions for a single route discovery.
    pub rreq_retries: u32,
    pub ttl_start: u8,
    pub ttl_increment: u8,
    pub ttl_threshold: u8,
    pub timeout_buffer: u8,
    pub net_diameter: u8,
    pub node_traversal_time: i64,
    pub net_traversal_time: Option<i64>,
    pub path_discovery_time: Option<i64>,
    pub active_route_timeout: i64,
    pub my_route_timeout: Option<i64>,
    pub hello_interval: i64,
    pub allowed_hello_loss: u32,
    pub delete_period: Option<i64>,
    pub next_hop_wait: Option<i64>,
    pub blacklist_timeout: Option<i64>,
    pub max_queue_len: usize,
    pub max_queue_len_per_destination: usize,
    pub max_queue_time: i64,
    /// Only the destination may answer our route requests.
    pub destination_only: bool,
    /// Ask intermediate nodes answering our requests to notify the destination as well.
    pub gratuitous_reply: bool,
    pub enable_expanding_ring_search: bool,
    pub enable_hello: bool,
    pub enable_local_repair: bool,
    /// Request RREP-ACKs for relayed route replies.
    pub reply_ack_required: bool,
    pub max_repair_ttl: Option<u8>,
    pub local_add_ttl: u8,
    /// Originated RREQs per second.
    pub rreq_rate_limit: u32,
    /// RERRs per second.
    pub rerr_rate_limit: u32,
    pub maintenance_interval: i64,
}

impl Default for AodvConfig {
    fn default() -> Self {
        AodvConfig {
            rreq_retries: RREQ_RETRIES,
            ttl_start: TTL_START,
            ttl_increment: TTL_INCREMENT,
            ttl_threshold: TTL_THRESHOLD,
            timeout_buffer: TIMEOUT_BUFFER,
            net_diameter: NET_DIAMETER,
            node_traversal_time: NODE_TRAVERSAL_TIME,
            net_traversal_time: None,
            path_discovery_time: None,
            active_route_timeout: ACTIVE_ROUTE_TIMEOUT,
            my_route_timeout: None,
            hello_interval: HELLO_INTERVAL,
            allowed_hello_loss: ALLOWED_HELLO_LOSS,
            delete_period: None,
            next_hop_wait: None,
            blacklist_timeout: None,
            max_queue_len: MAX_QUEUE_LEN,
            max_queue_len_per_destination: MAX_QUEUE_LEN_PER_DESTINATION,
            max_queue_time: MAX_QUEUE_TIME,
            destination_only: false,
            gratuitous_reply: true,
            enable_expanding_ring_search: true,
            enable_hello: true,
            enable_local_repair: true,
            reply_ack_required: false,
            max_repair_ttl: None,
            local_add_ttl: LOCAL_ADD_TTL,
            rreq_rate_limit: RREQ_RATE_LIMIT,
            rerr_rate_limit: RERR_RATE_LIMIT,
            maintenance_interval: MAINTENANCE_INTERVAL,
        }
    }
}

impl AodvConfig {
    /// Reads and validates a TOML configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<AodvConfig, AodvError> {
        let mut file = File::open(path.as_ref()).map_err(|e| {
            let err_msg = format!("Could not open {}", path.as_ref().display());
            AodvError {
                kind: AodvErrorKind::Configuration(err_msg),
                cause: Some(Box::new(e)),
            }
        })?;
        let mut data = String::new();
        file.read_to_string(&mut data).map_err(|e| AodvError {
            kind: AodvErrorKind::Configuration(String::from("Could not read configuration file")),
            cause: Some(Box::new(e)),
        })?;
        AodvConfig::from_toml(&data)
    }

    pub fn from_toml(data: &str) -> Result<AodvConfig, AodvError> {
        let config: AodvConfig = toml::from_str(data).map_err(|e| AodvError {
            kind: AodvErrorKind::Configuration(String::from("Malformed AODV configuration")),
            cause: Some(Box::new(e)),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects parameter combinations the engine can't operate with.
    pub fn validate(&self) -> Result<(), AodvError> {
        let fail = |msg: &str| -> Result<(), AodvError> {
            Err(AodvErrorKind::Configuration(String::from(msg)).into())
        };

        if self.net_diameter == 0 {
            return fail("net_diameter must be at least 1");
        }
        if self.ttl_start == 0 || self.ttl_start > self.net_diameter {
            return fail("ttl_start must be between 1 and net_diameter");
        }
        if self.rreq_retries == 0 || self.rreq_retries > MAX_RREQ_RETRIES {
            return fail("rreq_retries must be between 1 and 32");
        }
        if self.node_traversal_time <= 0 || self.active_route_timeout <= 0 {
            return fail("node_traversal_time and active_route_timeout must be positive");
        }
        if self.enable_hello && (self.hello_interval <= 0 || self.allowed_hello_loss == 0) {
            return fail("hello_interval and allowed_hello_loss must be positive when Hello is enabled");
        }
        if self.maintenance_interval <= 0 {
            return fail("maintenance_interval must be positive");
        }
        if self.max_queue_len == 0 || self.max_queue_len_per_destination == 0 {
            return fail("Queue limits must be at least 1");
        }
        if self.max_queue_time <= 0 {
            return fail("max_queue_time must be positive");
        }
        let overrides = [
            self.net_traversal_time,
            self.path_discovery_time,
            self.my_route_timeout,
            self.delete_period,
            self.next_hop_wait,
            self.blacklist_timeout,
        ];
        if overrides.iter().any(|v| v.map_or(false, |ms| ms <= 0)) {
            return fail("Timing overrides must be positive");
        }

        Ok(())
    }

    pub fn node_traversal_time(&self) -> Duration {
        Duration::milliseconds(self.node_traversal_time)
    }

    /// 2 * NODE_TRAVERSAL_TIME * NET_DIAMETER
    pub fn net_traversal_time(&self) -> Duration {
        Duration::milliseconds(
            self.net_traversal_time
                .unwrap_or(2 * self.node_traversal_time * i64::from(self.net_diameter)),
        )
    }

    /// 2 * NET_TRAVERSAL_TIME
    pub fn path_discovery_time(&self) -> Duration {
        match self.path_discovery_time {
            Some(ms) => Duration::milliseconds(ms),
            None => self.net_traversal_time() * 2,
        }
    }

    pub fn active_route_timeout(&self) -> Duration {
        Duration::milliseconds(self.active_route_timeout)
    }

    /// 2 * ACTIVE_ROUTE_TIMEOUT
    pub fn my_route_timeout(&self) -> Duration {
        Duration::milliseconds(
            self.my_route_timeout
                .unwrap_or(2 * self.active_route_timeout),
        )
    }

    pub fn hello_interval(&self) -> Duration {
        Duration::milliseconds(self.hello_interval)
    }

    /// How long a neighbor is considered alive after it was last heard from.
    pub fn neighbor_timeout(&self) -> Duration {
        Duration::milliseconds(i64::from(self.allowed_hello_loss) * self.hello_interval)
    }

    pub fn delete_period(&self) -> Duration {
        Duration::milliseconds(self.delete_period.unwrap_or(
            DELETE_PERIOD_FACTOR * std::cmp::max(self.active_route_timeout, self.hello_interval),
        ))
    }

    /// NODE_TRAVERSAL_TIME + 10
    pub fn next_hop_wait(&self) -> Duration {
        Duration::milliseconds(
            self.next_hop_wait
                .unwrap_or(self.node_traversal_time + NEXT_HOP_WAIT_SLACK),
        )
    }

    /// RREQ_RETRIES * NET_TRAVERSAL_TIME
    pub fn blacklist_timeout(&self) -> Duration {
        match self.blacklist_timeout {
            Some(ms) => Duration::milliseconds(ms),
            None => self.net_traversal_time() * i32::try_from(self.rreq_retries).unwrap_or(std::i32::MAX),
        }
    }

    pub fn max_queue_time(&self) -> Duration {
        Duration::milliseconds(self.max_queue_time)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::milliseconds(self.maintenance_interval)
    }

    /// 0.3 * NET_DIAMETER, rounded.
    pub fn max_repair_ttl(&self) -> u8 {
        self.max_repair_ttl
            .unwrap_or_else(|| ((u16::from(self.net_diameter) * 3 + 5) / 10) as u8)
    }

    /// TTL of the first attempt of a route discovery.
    pub fn initial_ttl(&self) -> u8 {
        if self.enable_expanding_ring_search {
            self.ttl_start
        } else {
            self.net_diameter
        }
    }

    /// TTL of the attempt following one sent with `ttl`.
    pub fn next_ttl(&self, ttl: u8) -> u8 {
        if !self.enable_expanding_ring_search {
            return self.net_diameter;
        }
        let next = ttl.saturating_add(self.ttl_increment);
        if next > self.ttl_threshold {
            self.net_diameter
        } else {
            std::cmp::min(next, self.net_diameter)
        }
    }

    /// Time to wait for a reply to a request sent with `ttl` at the given retry attempt:
    /// 2^attempt * 2 * NODE_TRAVERSAL_TIME * (TTL + TIMEOUT_BUFFER)
    pub fn ring_traversal_time(&self, ttl: u8, attempt: u32) -> Duration {
        let base = 2 * self.node_traversal_time * (i64::from(ttl) + i64::from(self.timeout_buffer));
        let factor = 1i64
            .checked_shl(attempt)
            .filter(|f| *f > 0)
            .unwrap_or(std::i64::MAX);
        Duration::milliseconds(base.saturating_mul(factor))
    }
}
