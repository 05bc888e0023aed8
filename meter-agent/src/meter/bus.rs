//! Field bus access: Modbus RTU "read input registers" with bounded retry

use crate::config::MeterConfig;
use crate::error::{AgentError, Result};
use crate::meter::registers::RegisterBlock;
use std::time::Duration;
use tokio_modbus::client::{rtu, Context, Reader};
use tokio_modbus::slave::{Slave, SlaveContext};
use tokio_serial::{DataBits, Parity, SerialStream, StopBits};
use tracing::{debug, info, warn};

/// One request/response exchange on the field bus
#[allow(async_fn_in_trait)]
pub trait RegisterBus {
    async fn read_input_registers(&mut self, device: u8, start: u16, count: u16) -> Result<Vec<u16>>;
}

/// Modbus RTU over a serial line (8N1), opened lazily and reopened after a fault
pub struct ModbusRtuBus {
    port: String,
    baud_rate: u32,
    ctx: Option<Context>,
}

impl ModbusRtuBus {
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            ctx: None,
        }
    }

    fn connect(&self, device: u8) -> Result<Context> {
        let builder = tokio_serial::new(&self.port, self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One);
        let stream = SerialStream::open(&builder)
            .map_err(|e| AgentError::Transport(format!("open {}: {}", self.port, e)))?;

        info!("Field bus open on {} @ {} baud", self.port, self.baud_rate);
        Ok(rtu::attach_slave(stream, Slave(device)))
    }
}

impl RegisterBus for ModbusRtuBus {
    async fn read_input_registers(&mut self, device: u8, start: u16, count: u16) -> Result<Vec<u16>> {
        let mut ctx = match self.ctx.take() {
            Some(ctx) => ctx,
            None => self.connect(device)?,
        };
        ctx.set_slave(Slave(device));

        match ctx.read_input_registers(start, count).await {
            Ok(Ok(words)) => {
                self.ctx = Some(ctx);
                Ok(words)
            }
            Ok(Err(exception)) => {
                // the device answered, framing is intact
                self.ctx = Some(ctx);
                Err(AgentError::Protocol {
                    command: format!("read_input_registers({start}, {count})"),
                    response: format!("{exception:?}"),
                })
            }
            // dropping ctx forces a reopen on the next attempt
            Err(e) => Err(AgentError::Transport(e.to_string())),
        }
    }
}

/// Retrying client on top of any [`RegisterBus`]
pub struct RegisterClient<B> {
    bus: B,
    attempts: u32,
    backoff: Duration,
    response_timeout: Duration,
}

impl<B: RegisterBus> RegisterClient<B> {
    pub fn new(bus: B, attempts: u32, backoff: Duration, response_timeout: Duration) -> Self {
        Self {
            bus,
            attempts: attempts.max(1),
            backoff,
            response_timeout,
        }
    }

    pub fn from_config(bus: B, config: &MeterConfig) -> Self {
        Self::new(
            bus,
            config.retry_attempts,
            config.retry_backoff(),
            config.response_timeout(),
        )
    }

    #[cfg(test)]
    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Read `count` input registers, all or nothing.
    ///
    /// Every failure (transport, exception response, deadline, short response) spends
    /// one attempt; the last error is returned once the budget is exhausted.
    pub async fn read_block(&mut self, device: u8, start: u16, count: u16) -> Result<RegisterBlock> {
        let mut last_error = AgentError::Transport("no attempt made".to_string());

        for attempt in 1..=self.attempts {
            let outcome = tokio::time::timeout(
                self.response_timeout,
                self.bus.read_input_registers(device, start, count),
            )
            .await
            .unwrap_or_else(|_| {
                Err(AgentError::Timeout(
                    self.response_timeout,
                    format!("{count} input registers from device {device}"),
                ))
            });

            match outcome {
                Ok(words) if words.len() == count as usize => {
                    debug!("Read {} registers from device {} at {}", count, device, start);
                    return Ok(RegisterBlock::new(words));
                }
                Ok(words) => {
                    last_error = AgentError::Protocol {
                        command: format!("read_input_registers({start}, {count})"),
                        response: format!("{} words", words.len()),
                    };
                }
                Err(e) => last_error = e,
            }

            warn!("Register read attempt {}/{} failed: {}", attempt, self.attempts, last_error);
            if attempt < self.attempts {
                tokio::time::sleep(self.backoff).await;
            }
        }

        Err(last_error)
    }
}
