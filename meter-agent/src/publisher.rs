//! Telemetry payload and the modem MQTT publish sequence
//!
//! The sequence is fire-and-forget by default: every step is attempted and logged
//! even when an earlier one failed. `publish.abort_on_error` stops at the first
//! failed step instead.

use crate::config::{BrokerConfig, DeviceConfig, PublishConfig};
use crate::error::Result;
use crate::gnss::GpsFix;
use crate::meter::EnergyReading;
use crate::modem::{AtChannel, AtResponse, Status};
use serde::Serialize;
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

/// Identity fields carried verbatim into every payload
#[derive(Debug, Clone, Serialize)]
pub struct DeviceIdentity {
    pub serial_number: String,
    pub account_id: String,
    pub access_token: String,
}

impl From<&DeviceConfig> for DeviceIdentity {
    fn from(config: &DeviceConfig) -> Self {
        Self {
            serial_number: config.serial_number.clone(),
            account_id: config.account_id.clone(),
            access_token: config.access_token.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum TelemetryPayload {
    Reading {
        #[serde(flatten)]
        identity: DeviceIdentity,
        #[serde(flatten)]
        reading: EnergyReading,
        latitude: Option<f64>,
        longitude: Option<f64>,
    },
    /// Register read failed entirely
    Unavailable {
        #[serde(rename = "Energy meter values")]
        values: &'static str,
    },
}

impl TelemetryPayload {
    pub fn reading(identity: DeviceIdentity, reading: EnergyReading, fix: Option<GpsFix>) -> Self {
        TelemetryPayload::Reading {
            identity,
            reading,
            latitude: fix.map(|f| f.latitude),
            longitude: fix.map(|f| f.longitude),
        }
    }

    pub fn unavailable() -> Self {
        TelemetryPayload::Unavailable { values: "None" }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishStep {
    OpenConnection,
    ConfigureReceive,
    OpenSocket,
    QuerySocket,
    Connect,
    Publish,
    Payload,
    Disconnect,
}

impl fmt::Display for PublishStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PublishStep::OpenConnection => "open-connection",
            PublishStep::ConfigureReceive => "configure-receive",
            PublishStep::OpenSocket => "open-socket",
            PublishStep::QuerySocket => "query-socket",
            PublishStep::Connect => "connect",
            PublishStep::Publish => "publish",
            PublishStep::Payload => "payload",
            PublishStep::Disconnect => "disconnect",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub step: PublishStep,
    pub response: AtResponse,
}

impl StepOutcome {
    pub fn succeeded(&self) -> bool {
        match self.step {
            PublishStep::Publish => matches!(self.response.status, Status::Prompt | Status::Ok),
            _ => self.response.is_ok(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PublishReport {
    pub steps: Vec<StepOutcome>,
    pub aborted: bool,
}

impl PublishReport {
    pub fn succeeded(&self) -> bool {
        !self.aborted && self.steps.iter().all(StepOutcome::succeeded)
    }

    pub fn failed_steps(&self) -> Vec<PublishStep> {
        self.steps
            .iter()
            .filter(|outcome| !outcome.succeeded())
            .map(|outcome| outcome.step)
            .collect()
    }
}

pub struct Publisher {
    broker: BrokerConfig,
    abort_on_error: bool,
}

impl Publisher {
    pub fn new(broker: BrokerConfig, publish: &PublishConfig) -> Self {
        Self {
            broker,
            abort_on_error: publish.abort_on_error,
        }
    }

    /// The ordered command list for one payload body
    pub fn commands(&self, body: &str) -> Vec<(PublishStep, String)> {
        let broker = &self.broker;
        vec![
            (PublishStep::OpenConnection, "AT+QIACT=1".to_string()),
            (
                PublishStep::ConfigureReceive,
                "AT+QMTCFG=\"recv/mode\",0,0,1".to_string(),
            ),
            (
                PublishStep::OpenSocket,
                format!("AT+QMTOPEN=0,\"{}\",{}", broker.host, broker.port),
            ),
            (PublishStep::QuerySocket, "AT+QMTOPEN?".to_string()),
            (
                PublishStep::Connect,
                format!(
                    "AT+QMTCONN=0,\"{}\",\"{}\",\"{}\"",
                    broker.client_id, broker.username, broker.password
                ),
            ),
            (
                PublishStep::Publish,
                format!("AT+QMTPUBEX=0,0,0,0,\"{}\",{}", broker.topic, body.len()),
            ),
            (PublishStep::Payload, body.to_string()),
            (PublishStep::Disconnect, "AT+QMTDISC=0".to_string()),
        ]
    }

    /// Serialize and send one payload.
    ///
    /// Error answers and timeouts are recorded in the report. Only serialization
    /// errors and a failed modem channel are returned as `Err`.
    pub async fn publish<T>(&self, at: &mut AtChannel<T>, payload: &TelemetryPayload) -> Result<PublishReport>
    where
        T: AsyncRead + AsyncWrite + Unpin,
    {
        let body = serde_json::to_string(payload)?;
        debug!("Publishing {} bytes to '{}'", body.len(), self.broker.topic);

        let mut report = PublishReport::default();
        for (step, command) in self.commands(&body) {
            let outcome = StepOutcome {
                step,
                response: at.command(&command).await?,
            };

            let failed = !outcome.succeeded();
            if failed {
                warn!("MQTT {}: {}", step, outcome.response);
            } else {
                info!("MQTT {}: {}", step, outcome.response);
            }
            report.steps.push(outcome);
            if failed && self.abort_on_error {
                warn!("Publish aborted at step {}", step);
                report.aborted = true;
                break;
            }
        }

        if report.succeeded() {
            info!("Telemetry published on '{}'", self.broker.topic);
        } else {
            warn!("Telemetry publish had failed steps: {:?}", report.failed_steps());
        }
        Ok(report)
    }
}
