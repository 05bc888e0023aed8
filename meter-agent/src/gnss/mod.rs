//! GNSS position reader
//!
//! Drives the GNSS engine of the modem over the AT channel:
//! - initialization state machine (status query, start, configuration)
//! - fix acquisition with bounded retry
//! - NMEA GGA parsing into signed decimal degrees

use crate::config::ModemConfig;
use crate::error::{AgentError, Result};
use crate::modem::{AtChannel, AtResponse, Status, CME_NOT_STARTED, CME_NO_DATA};
use serde::Serialize;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

pub const STATUS_QUERY: &str = "AT+QGPSLOC=2";
pub const START_ENGINE: &str = "AT+QGPS=1";
/// Enable the engine, then select the NMEA sentence source
pub const INIT_SEQUENCE: [&str; 2] = ["AT+QGPSCFG=\"autogps\",1", "AT+QGPSCFG=\"nmeasrc\",1"];
pub const REQUEST_GGA: &str = "AT+QGPSGNMEA=\"GGA\"";
const GGA_PREFIX: &str = "+QGPSGNMEA:";

const MIN_GGA_FIELDS: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GnssState {
    Uninitialized,
    Initializing,
    Ready,
    Faulted,
}

/// Position in signed decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GpsFix {
    pub latitude: f64,
    pub longitude: f64,
}

enum FixRead {
    Fix(GpsFix),
    /// Module answered, no usable position yet
    NoFix,
    /// Error token or silence: the engine needs re-initialization
    Failed(AtResponse),
}

pub struct PositionReader {
    state: GnssState,
    fix_attempts: u32,
    retry_delay: Duration,
}

impl PositionReader {
    pub fn new(fix_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            state: GnssState::Uninitialized,
            fix_attempts: fix_attempts.max(1),
            retry_delay,
        }
    }

    pub fn from_config(config: &ModemConfig) -> Self {
        Self::new(config.fix_attempts, config.fix_retry_delay())
    }

    #[cfg(test)]
    pub fn state(&self) -> GnssState {
        self.state
    }

    /// Bring the GNSS engine to `Ready`; any error token leaves it `Faulted`.
    pub async fn initialize<T>(&mut self, at: &mut AtChannel<T>) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        self.state = GnssState::Initializing;
        let result = self.run_initialize(at).await;

        self.state = match &result {
            Ok(()) => GnssState::Ready,
            Err(_) => GnssState::Faulted,
        };
        match &result {
            Ok(()) => info!("GNSS engine ready"),
            Err(e) => warn!("GNSS initialization failed: {}", e),
        }
        result
    }

    async fn run_initialize<T>(&mut self, at: &mut AtChannel<T>) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let status = at.command(STATUS_QUERY).await?;

        match status.status {
            Status::Ok => Ok(()),
            Status::CmeError(CME_NO_DATA) => {
                debug!("GNSS engine running without data, probing for a fix");
                for attempt in 1..=self.fix_attempts {
                    if let FixRead::Fix(_) = self.read_fix(at).await? {
                        return Ok(());
                    }
                    if attempt < self.fix_attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
                Err(AgentError::Protocol {
                    command: REQUEST_GGA.to_string(),
                    response: format!("no fix after {} reads", self.fix_attempts),
                })
            }
            Status::CmeError(CME_NOT_STARTED) => {
                info!("Starting GNSS engine");
                expect_ok(at, START_ENGINE).await?;
                for command in INIT_SEQUENCE {
                    expect_ok(at, command).await?;
                }
                Ok(())
            }
            _ => Err(AgentError::Protocol {
                command: STATUS_QUERY.to_string(),
                response: status.to_string(),
            }),
        }
    }

    /// Acquire one fix; `None` once every attempt has failed.
    pub async fn get_fix<T>(&mut self, at: &mut AtChannel<T>) -> Option<GpsFix>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        if self.state != GnssState::Ready {
            // failure is already logged, the attempts below still run
            let _ = self.initialize(at).await;
        }

        for attempt in 1..=self.fix_attempts {
            let last = attempt == self.fix_attempts;

            match self.read_fix(at).await {
                Ok(FixRead::Fix(fix)) => {
                    debug!("GNSS fix {:.6}, {:.6}", fix.latitude, fix.longitude);
                    return Some(fix);
                }
                Ok(FixRead::NoFix) => {
                    debug!("No GNSS fix yet (attempt {}/{})", attempt, self.fix_attempts);
                    if !last {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
                Ok(FixRead::Failed(response)) => {
                    warn!("GNSS read failed (attempt {}/{}): {}", attempt, self.fix_attempts, response);
                    self.state = GnssState::Faulted;
                    if !last {
                        let _ = self.initialize(at).await;
                    }
                }
                Err(e) => {
                    warn!("GNSS channel error (attempt {}/{}): {}", attempt, self.fix_attempts, e);
                    self.state = GnssState::Faulted;
                    if !last {
                        let _ = self.initialize(at).await;
                    }
                }
            }
        }

        warn!("No GNSS fix after {} attempts", self.fix_attempts);
        None
    }

    async fn read_fix<T>(&self, at: &mut AtChannel<T>) -> Result<FixRead>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let response = at.command(REQUEST_GGA).await?;
        if !response.is_ok() {
            return Ok(FixRead::Failed(response));
        }

        Ok(response
            .payload(GGA_PREFIX)
            .and_then(parse)
            .map(FixRead::Fix)
            .unwrap_or(FixRead::NoFix))
    }
}

async fn expect_ok<T>(at: &mut AtChannel<T>, command: &str) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let response = at.command(command).await?;
    if response.is_ok() {
        Ok(())
    } else {
        Err(AgentError::Protocol {
            command: command.to_string(),
            response: response.to_string(),
        })
    }
}

/// Parse a GGA sentence; short or position-less sentences yield `None`.
pub fn parse(sentence: &str) -> Option<GpsFix> {
    let fields: Vec<&str> = sentence.trim().split(',').collect();
    if fields.len() < MIN_GGA_FIELDS {
        return None;
    }

    let (lat_raw, lon_raw) = (fields[2], fields[4]);
    if lat_raw.is_empty() || lon_raw.is_empty() {
        return None;
    }

    Some(GpsFix {
        latitude: convert_to_decimal_degrees(lat_raw, fields[3])?,
        longitude: convert_to_decimal_degrees(lon_raw, fields[5])?,
    })
}

/// Convert an NMEA `(d)ddmm.mmmm` field to signed decimal degrees.
///
/// The degree prefix ends two digits before the decimal point. Without a decimal
/// point, a 9-character field has a 2-digit prefix and anything else a 3-digit one.
pub fn convert_to_decimal_degrees(raw: &str, hemisphere: &str) -> Option<f64> {
    let raw = raw.trim();
    if raw.len() < 4 || !raw.is_ascii() {
        return None;
    }

    let width = match raw.find('.') {
        Some(dot) if (1..=3).contains(&dot.checked_sub(2)?) => dot - 2,
        Some(_) => return None,
        None if raw.len() == 9 => 2,
        None => 3,
    };
    if width >= raw.len() {
        return None;
    }

    let degrees: f64 = raw[..width].parse().ok()?;
    let minutes: f64 = raw[width..].parse().ok()?;
    let value = degrees + minutes / 60.0;

    match hemisphere.trim() {
        "S" | "W" => Some(-value),
        _ => Some(value),
    }
}
