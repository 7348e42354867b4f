use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use tracing::Level;

use crate::grid::bounds::{Bounds, Dimensions};
use crate::log::parse_level;
use crate::util::vec3::Vec3;

/// Lowest port a host may listen on; everything below is reserved
pub const MIN_PORT: u16 = 1024;

/// Largest visibility radius a map may use, in cells
///
/// A cell's visibility box holds (2r+1)^3 coordinates on volumetric maps.
pub const MAX_VISIBILITY_RADIUS: u32 = 16;

/// Text encoding accepted on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    Ascii,
}

/// Host configuration
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Address to bind the authority to
    pub bind_address: IpAddr,
    /// Port for both the reliable stream listener and the datagram socket
    pub port: u16,
    /// Service ticks per second
    pub tick_rate: u32,
    /// Wire text encoding
    pub text_encoding: TextEncoding,
    /// Largest partial frame kept while waiting for a terminator
    pub max_frame_size: usize,
    /// Authority closes connections silent for longer than this
    pub idle_timeout: Duration,
    /// Proxy keep-alive poke interval
    pub poke_interval: Duration,
    /// Delay between listener bind attempts
    pub bind_retry_delay: Duration,
    /// Metrics endpoint port (disabled when None)
    pub metrics_port: Option<u16>,
    /// Level for every injected log sink
    pub log_level: Level,
    /// Upper bound for the map worker pool
    pub max_map_workers: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            port: 7777,
            tick_rate: 20,
            text_encoding: TextEncoding::Utf8,
            max_frame_size: 64 * 1024,
            idle_timeout: Duration::from_secs(30),
            poke_interval: Duration::from_secs(5),
            bind_retry_delay: Duration::from_secs(1),
            metrics_port: None,
            log_level: Level::INFO,
            max_map_workers: 4,
        }
    }
}

impl HostConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("BIND_ADDRESS") {
            if let Ok(parsed) = addr.parse() {
                config.bind_address = parsed;
            } else {
                tracing::warn!("Invalid BIND_ADDRESS '{}', using default", addr);
            }
        }

        if let Ok(port) = std::env::var("PORT") {
            match port.parse::<u16>() {
                Ok(parsed) if parsed >= MIN_PORT => config.port = parsed,
                Ok(_) => tracing::warn!("PORT must be >= {}, using default", MIN_PORT),
                Err(_) => tracing::warn!("Invalid PORT '{}', using default", port),
            }
        }

        if let Ok(rate) = std::env::var("TICK_RATE") {
            match rate.parse::<u32>() {
                Ok(parsed) if (1..=1000).contains(&parsed) => config.tick_rate = parsed,
                _ => tracing::warn!("TICK_RATE must be 1-1000, got '{}', using default", rate),
            }
        }

        if let Ok(encoding) = std::env::var("TEXT_ENCODING") {
            match encoding.to_ascii_lowercase().as_str() {
                "utf8" | "utf-8" => config.text_encoding = TextEncoding::Utf8,
                "ascii" => config.text_encoding = TextEncoding::Ascii,
                _ => tracing::warn!("Invalid TEXT_ENCODING '{}', using default", encoding),
            }
        }

        if let Ok(size) = std::env::var("MAX_FRAME_SIZE") {
            match size.parse::<usize>() {
                Ok(parsed) if parsed >= 64 => config.max_frame_size = parsed,
                _ => tracing::warn!("MAX_FRAME_SIZE must be >= 64, got '{}', using default", size),
            }
        }

        if let Ok(secs) = std::env::var("IDLE_TIMEOUT_SECS") {
            match secs.parse::<u64>() {
                Ok(parsed) if parsed > 0 => config.idle_timeout = Duration::from_secs(parsed),
                _ => tracing::warn!("Invalid IDLE_TIMEOUT_SECS '{}', using default", secs),
            }
        }

        if let Ok(secs) = std::env::var("POKE_INTERVAL_SECS") {
            match secs.parse::<u64>() {
                Ok(parsed) if parsed > 0 => config.poke_interval = Duration::from_secs(parsed),
                _ => tracing::warn!("Invalid POKE_INTERVAL_SECS '{}', using default", secs),
            }
        }

        if let Ok(port) = std::env::var("METRICS_PORT") {
            match port.parse::<u16>() {
                Ok(parsed) if parsed > 0 => config.metrics_port = Some(parsed),
                _ => tracing::warn!("Invalid METRICS_PORT '{}', metrics disabled", port),
            }
        }

        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.log_level = parse_level(&level);
        }

        if let Ok(workers) = std::env::var("MAX_MAP_WORKERS") {
            match workers.parse::<usize>() {
                Ok(parsed) if parsed > 0 => config.max_map_workers = parsed,
                _ => tracing::warn!("Invalid MAX_MAP_WORKERS '{}', using default", workers),
            }
        }

        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        if self.port == 0 {
            return Err("Port cannot be 0".to_string());
        }
        if self.port < MIN_PORT {
            return Err(format!("Port {} is reserved (must be >= {})", self.port, MIN_PORT));
        }
        if let Some(metrics_port) = self.metrics_port {
            if metrics_port.abs_diff(self.port) <= 1 {
                return Err(format!(
                    "Metrics port {} collides with game port {} (datagram socket shares it)",
                    metrics_port, self.port
                ));
            }
        }
        if self.tick_rate == 0 || self.tick_rate > 1000 {
            return Err("tick_rate must be 1-1000".to_string());
        }
        if self.max_map_workers == 0 {
            return Err("max_map_workers must be at least 1".to_string());
        }
        Ok(())
    }

    /// Wall-clock interval between service ticks
    pub fn tick_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / self.tick_rate.max(1) as u64)
    }
}

/// Per-map spatial configuration
#[derive(Debug, Clone)]
pub struct MapConfig {
    pub name: String,
    /// Number of simultaneous instances of this map
    pub instances: u32,
    pub dimensions: Dimensions,
    /// Edge length of one grid cell in world units
    pub cell_size: f32,
    /// Visibility radius in cells (Chebyshev distance)
    pub visibility_radius: u32,
    pub bounds: Bounds,
    /// Where clients enter this map
    pub spawn_point: Vec3,
    /// Largest displacement accepted for one client move request
    pub speed_cap: f32,
    /// Maps never tick more often than this
    pub min_tick_interval: Duration,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            name: "overworld".to_string(),
            instances: 1,
            dimensions: Dimensions::Planar,
            cell_size: 32.0,
            visibility_radius: 1,
            bounds: Bounds::Box {
                half_extents: Vec3::new(1024.0, 1024.0, 64.0),
            },
            spawn_point: Vec3::ZERO,
            speed_cap: 8.0,
            min_tick_interval: Duration::from_millis(50),
        }
    }
}

impl MapConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("map name cannot be empty".to_string());
        }
        if !(self.cell_size.is_finite() && self.cell_size > 0.0) {
            return Err(format!("map '{}': cell_size must be > 0", self.name));
        }
        if self.instances == 0 {
            return Err(format!("map '{}': instances must be at least 1", self.name));
        }
        if self.visibility_radius > MAX_VISIBILITY_RADIUS {
            return Err(format!(
                "map '{}': visibility_radius {} exceeds {}",
                self.name, self.visibility_radius, MAX_VISIBILITY_RADIUS
            ));
        }
        if !(self.speed_cap.is_finite() && self.speed_cap >= 0.0) {
            return Err(format!("map '{}': speed_cap must be >= 0", self.name));
        }
        if !self.bounds.contains(self.spawn_point, self.dimensions) {
            return Err(format!("map '{}': spawn point outside bounds", self.name));
        }
        Ok(())
    }
}
