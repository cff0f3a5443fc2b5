//! Pre-auth per-IP shield.
//!
//! Sits in front of authentication: a request-per-minute counter and a
//! unique-path counter per source address, plus a blocklist with TTL for
//! addresses that keep tripping either. Cheap enough to run on every
//! request before any key lookup happens.

use dashmap::DashMap;
use std::collections::{HashSet, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};

use crate::gateway_error::ApiError;

#[derive(Debug, Clone)]
pub struct ShieldConfig {
    pub enabled: bool,
    /// Requests per minute per source address.
    pub max_requests_per_minute: u32,
    /// Distinct paths per minute per source address; scanners trip this.
    pub max_unique_paths_per_minute: u32,
    pub block_ttl: Duration,
}

impl Default for ShieldConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests_per_minute: 600,
            max_unique_paths_per_minute: 30,
            block_ttl: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Default)]
struct IpWindow {
    stamps: VecDeque<Instant>,
    paths: HashSet<String>,
    window_start: Option<Instant>,
}

pub struct IpShield {
    config: ShieldConfig,
    windows: DashMap<IpAddr, IpWindow>,
    blocked: DashMap<IpAddr, Instant>,
}

const WINDOW: Duration = Duration::from_secs(60);

impl IpShield {
    pub fn new(config: ShieldConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
            blocked: DashMap::new(),
        }
    }

    pub fn check(&self, ip: IpAddr, path: &str) -> Result<(), ApiError> {
        if !self.config.enabled {
            return Ok(());
        }
        let now = Instant::now();

        if let Some(until) = self.blocked.get(&ip) {
            if now < *until {
                let retry_after = until.duration_since(now).as_secs().max(1);
                return Err(ApiError::RateLimited {
                    message: "source address temporarily blocked".to_string(),
                    retry_after,
                });
            }
            drop(until);
            self.blocked.remove(&ip);
        }

        let mut window = self.windows.entry(ip).or_default();

        // The unique-path set resets with the window rather than sliding;
        // precision does not matter for scanner detection.
        if window
            .window_start
            .map(|start| now.duration_since(start) >= WINDOW)
            .unwrap_or(true)
        {
            window.window_start = Some(now);
            window.paths.clear();
        }
        while window
            .stamps
            .front()
            .is_some_and(|t| now.duration_since(*t) >= WINDOW)
        {
            window.stamps.pop_front();
        }

        window.stamps.push_back(now);
        window.paths.insert(path.to_string());

        let too_many_requests =
            window.stamps.len() as u32 > self.config.max_requests_per_minute;
        let too_many_paths = window.paths.len() as u32 > self.config.max_unique_paths_per_minute;

        if too_many_requests || too_many_paths {
            drop(window);
            self.windows.remove(&ip);
            self.blocked.insert(ip, now + self.config.block_ttl);
            tracing::warn!(
                %ip,
                requests = too_many_requests,
                paths = too_many_paths,
                "shield blocked source address"
            );
            return Err(ApiError::RateLimited {
                message: "source address temporarily blocked".to_string(),
                retry_after: self.config.block_ttl.as_secs(),
            });
        }

        Ok(())
    }

    /// Expire stale windows and blocklist entries.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.blocked.retain(|_, until| now < *until);
        self.windows.retain(|_, window| {
            window
                .stamps
                .back()
                .is_some_and(|t| now.duration_since(*t) < WINDOW * 2)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([127, 0, 0, last])
    }

    #[test]
    fn normal_traffic_passes() {
        let shield = IpShield::new(ShieldConfig::default());
        for _ in 0..100 {
            shield.check(ip(1), "/v1/chat/completions").unwrap();
        }
    }

    #[test]
    fn request_flood_blocks_the_address() {
        let shield = IpShield::new(ShieldConfig {
            max_requests_per_minute: 5,
            ..ShieldConfig::default()
        });
        for _ in 0..5 {
            shield.check(ip(2), "/v1/chat/completions").unwrap();
        }
        assert!(shield.check(ip(2), "/v1/chat/completions").is_err());
        // Blocked for the TTL, not just rate-limited.
        assert!(shield.check(ip(2), "/healthz").is_err());
        // Other addresses are unaffected.
        shield.check(ip(3), "/v1/chat/completions").unwrap();
    }

    #[test]
    fn path_scanning_blocks_the_address() {
        let shield = IpShield::new(ShieldConfig {
            max_unique_paths_per_minute: 3,
            ..ShieldConfig::default()
        });
        shield.check(ip(4), "/a").unwrap();
        shield.check(ip(4), "/b").unwrap();
        shield.check(ip(4), "/c").unwrap();
        assert!(shield.check(ip(4), "/d").is_err());
    }

    #[test]
    fn disabled_shield_is_a_no_op() {
        let shield = IpShield::new(ShieldConfig {
            enabled: false,
            max_requests_per_minute: 1,
            ..ShieldConfig::default()
        });
        for _ in 0..10 {
            shield.check(ip(5), "/x").unwrap();
        }
    }
}
