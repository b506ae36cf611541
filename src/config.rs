use std::env;

use chrono::Duration;

use crate::error::AppError;
use crate::models::courier::GeoPoint;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub event_buffer_size: usize,
    pub outbound_queue_size: usize,
    pub sweep_interval_ms: u64,
    pub delivery: DeliverySettings,
}

/// Tunables of the delivery core. Defaults are representative, not load-bearing.
#[derive(Debug, Clone, Default)]
pub struct DeliverySettings {
    pub matching: MatchingSettings,
    pub tracking: TrackingSettings,
    pub otp: OtpSettings,
    pub notifications: NotificationSettings,
}

#[derive(Debug, Clone)]
pub struct MatchingSettings {
    /// Where couriers pick orders up.
    pub origin: GeoPoint,
    pub radius_km: f64,
    pub max_radius_km: f64,
    pub radius_factor: f64,
    pub max_retries: u32,
    pub top_k: usize,
    pub offer_timeout: Duration,
}

impl Default for MatchingSettings {
    fn default() -> Self {
        Self {
            origin: GeoPoint {
                lat: 52.5200,
                lng: 13.4050,
            },
            radius_km: 5.0,
            max_radius_km: 15.0,
            radius_factor: 1.5,
            max_retries: 3,
            top_k: 5,
            offer_timeout: Duration::seconds(120),
        }
    }
}

impl MatchingSettings {
    pub fn expanded_radius(&self, current_km: f64) -> f64 {
        (current_km * self.radius_factor).min(self.max_radius_km)
    }
}

#[derive(Debug, Clone)]
pub struct TrackingSettings {
    pub arrival_radius_m: f64,
    pub stale_after: Duration,
    pub fallback_speed_kmh: f64,
    pub max_plausible_speed_kmh: f64,
    pub trail_len: usize,
    pub speed_window: usize,
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            arrival_radius_m: 100.0,
            stale_after: Duration::seconds(60),
            fallback_speed_kmh: 25.0,
            max_plausible_speed_kmh: 120.0,
            trail_len: 10,
            speed_window: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OtpSettings {
    pub digits: u32,
    pub ttl: Duration,
    pub max_attempts: u32,
}

impl Default for OtpSettings {
    fn default() -> Self {
        Self {
            digits: 4,
            ttl: Duration::minutes(30),
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotificationSettings {
    pub feed_cap: usize,
    pub dedup_window: Duration,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            feed_cap: 50,
            dedup_window: Duration::seconds(30),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        let defaults = DeliverySettings::default();

        let matching = MatchingSettings {
            origin: GeoPoint {
                lat: parse_or_default("STORE_LAT", defaults.matching.origin.lat)?,
                lng: parse_or_default("STORE_LNG", defaults.matching.origin.lng)?,
            },
            radius_km: parse_or_default("MATCH_RADIUS_KM", defaults.matching.radius_km)?,
            max_radius_km: parse_or_default("MATCH_MAX_RADIUS_KM", defaults.matching.max_radius_km)?,
            radius_factor: parse_or_default("MATCH_RADIUS_FACTOR", defaults.matching.radius_factor)?,
            max_retries: parse_or_default("MATCH_MAX_RETRIES", defaults.matching.max_retries)?,
            top_k: parse_or_default("MATCH_TOP_K", defaults.matching.top_k)?,
            offer_timeout: Duration::seconds(parse_or_default("OFFER_TIMEOUT_SECS", 120)?),
        };

        let tracking = TrackingSettings {
            arrival_radius_m: parse_or_default("ARRIVAL_RADIUS_M", defaults.tracking.arrival_radius_m)?,
            stale_after: Duration::seconds(parse_or_default("STALE_AFTER_SECS", 60)?),
            fallback_speed_kmh: parse_or_default(
                "FALLBACK_SPEED_KMH",
                defaults.tracking.fallback_speed_kmh,
            )?,
            max_plausible_speed_kmh: parse_or_default(
                "MAX_PLAUSIBLE_SPEED_KMH",
                defaults.tracking.max_plausible_speed_kmh,
            )?,
            trail_len: parse_or_default("TRAIL_LEN", defaults.tracking.trail_len)?,
            speed_window: parse_or_default("SPEED_WINDOW", defaults.tracking.speed_window)?,
        };

        let otp = OtpSettings {
            digits: parse_or_default("OTP_DIGITS", defaults.otp.digits)?,
            ttl: Duration::seconds(parse_or_default("OTP_TTL_SECS", 1800)?),
            max_attempts: parse_or_default("OTP_MAX_ATTEMPTS", defaults.otp.max_attempts)?,
        };

        let notifications = NotificationSettings {
            feed_cap: parse_or_default("NOTIFICATION_CAP", defaults.notifications.feed_cap)?,
            dedup_window: Duration::seconds(parse_or_default("DEDUP_WINDOW_SECS", 30)?),
        };

        let config = Self {
            http_port: parse_or_default("HTTP_PORT", 3000)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", 1024)?,
            outbound_queue_size: parse_or_default("OUTBOUND_QUEUE_SIZE", 1024)?,
            sweep_interval_ms: parse_or_default("SWEEP_INTERVAL_MS", 5000)?,
            delivery: DeliverySettings {
                matching,
                tracking,
                otp,
                notifications,
            },
        };

        config.delivery.validate()?;
        Ok(config)
    }
}

impl DeliverySettings {
    pub fn validate(&self) -> Result<(), AppError> {
        if !(4..=6).contains(&self.otp.digits) {
            return Err(AppError::Internal(format!(
                "invalid OTP_DIGITS: {} (expected 4..=6)",
                self.otp.digits
            )));
        }
        if self.otp.max_attempts == 0 {
            return Err(AppError::Internal("invalid OTP_MAX_ATTEMPTS: must be > 0".to_string()));
        }
        if self.matching.radius_km <= 0.0 || self.matching.max_radius_km < self.matching.radius_km {
            return Err(AppError::Internal(
                "invalid MATCH_RADIUS_KM/MATCH_MAX_RADIUS_KM: need 0 < radius <= max".to_string(),
            ));
        }
        if self.matching.radius_factor < 1.0 {
            return Err(AppError::Internal("invalid MATCH_RADIUS_FACTOR: must be >= 1".to_string()));
        }
        if self.matching.top_k == 0 || self.notifications.feed_cap == 0 {
            return Err(AppError::Internal(
                "invalid MATCH_TOP_K/NOTIFICATION_CAP: must be > 0".to_string(),
            ));
        }
        if self.tracking.fallback_speed_kmh <= 0.0 {
            return Err(AppError::Internal("invalid FALLBACK_SPEED_KMH: must be > 0".to_string()));
        }
        if self.tracking.trail_len == 0 || self.tracking.speed_window == 0 {
            return Err(AppError::Internal(
                "invalid TRAIL_LEN/SPEED_WINDOW: must be > 0".to_string(),
            ));
        }
        if self.tracking.stale_after <= Duration::zero() {
            return Err(AppError::Internal("invalid STALE_AFTER_SECS: must be > 0".to_string()));
        }
        if self.tracking.arrival_radius_m <= 0.0 {
            return Err(AppError::Internal("invalid ARRIVAL_RADIUS_M: must be > 0".to_string()));
        }

        Ok(())
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
