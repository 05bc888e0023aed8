//! Energy meter access
//!
//! - `bus`: Modbus RTU input-register reads with retry and response deadline
//! - `registers`: fixed register map and float decoding

pub mod bus;
pub mod registers;

pub use bus::{ModbusRtuBus, RegisterBus, RegisterClient};
pub use registers::{decode, EnergyReading};

use crate::config::MeterConfig;
use crate::error::Result;

/// Meter on one bus address, reading the configured register window
pub struct Meter<B> {
    client: RegisterClient<B>,
    device_address: u8,
    start_address: u16,
    register_count: u16,
}

impl<B: RegisterBus> Meter<B> {
    pub fn new(bus: B, config: &MeterConfig) -> Self {
        Self {
            client: RegisterClient::from_config(bus, config),
            device_address: config.device_address,
            start_address: config.start_address,
            register_count: config.register_count,
        }
    }

    /// Poll and decode one reading; no caching between polls.
    pub async fn read(&mut self) -> Result<EnergyReading> {
        let block = self
            .client
            .read_block(self.device_address, self.start_address, self.register_count)
            .await?;
        decode(&block)
    }
}
