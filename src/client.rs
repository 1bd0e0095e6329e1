//! Async register access for task-based clients, e.g. a host gateway on an
//! async executor. Requests go through a [`RequestChannel`] like everybody
//! else's; the session arbiter has to be polled elsewhere for them to complete.

use byteorder::{BigEndian, ByteOrder};
use embedded_hal_async::delay::DelayNs;

use crate::channel::{RequestChannel, Response};
use crate::error::{Error, Result};
use crate::fmt::*;
use crate::registers::*;
use crate::telemetry;
use crate::transport::TRANSFER_CAPACITY;

/// Skip ROM, write data, address
const WRITE_HEADER_SIZE: usize = 3;

/// Monitor handle
pub struct Ds2756<'a, D> {
    channel: &'a RequestChannel,
    delay: D,
    poll_interval_us: u32,
}

impl<'a, D> Ds2756<'a, D>
where
    D: DelayNs,
{
    /// How often the channel is checked for the response by default
    pub const DEFAULT_POLL_INTERVAL_US: u32 = 500;

    /// Creates the client. `channel` must not be shared with another client
    pub fn new(channel: &'a RequestChannel, delay: D) -> Self {
        Self {
            channel,
            delay,
            poll_interval_us: Self::DEFAULT_POLL_INTERVAL_US,
        }
    }

    pub fn with_poll_interval_us(mut self, us: u32) -> Self {
        self.poll_interval_us = us;
        self
    }

    /// Raw transfer: `request` goes out as is, `rx_len` bytes come back
    pub async fn transfer(&mut self, request: &[u8], rx_len: usize) -> Result<Response> {
        self.channel.submit(request, rx_len)?;

        loop {
            if let Some(response) = self.channel.take_response() {
                return response.into_result();
            }

            self.delay.delay_us(self.poll_interval_us).await;
        }
    }

    /// Reads `data.len()` bytes of the memory map starting at `address`
    pub async fn read_registers(&mut self, address: u8, data: &mut [u8]) -> Result<()> {
        let response = self
            .transfer(&read_data_request(address), data.len())
            .await?;

        data.copy_from_slice(response.data());
        Ok(())
    }

    /// Writes to the shadow RAM. EEPROM blocks need a [`Ds2756::copy_data`]
    /// afterwards to persist
    pub async fn write_registers(&mut self, address: u8, data: &[u8]) -> Result<()> {
        if data.len() > TRANSFER_CAPACITY - WRITE_HEADER_SIZE {
            return Err(Error::BufferOverflow);
        }

        let mut request = [0; TRANSFER_CAPACITY];
        request[..WRITE_HEADER_SIZE].copy_from_slice(&[
            rom_commands::SKIP_ROM,
            function_commands::WRITE_DATA,
            address,
        ]);
        request[WRITE_HEADER_SIZE..][..data.len()].copy_from_slice(data);

        self.transfer(&request[..WRITE_HEADER_SIZE + data.len()], 0)
            .await?;
        Ok(())
    }

    /// Copies the shadow RAM of the EEPROM block at `address` to the EEPROM
    pub async fn copy_data(&mut self, address: u8) -> Result<()> {
        info!("copying eeprom block {=u8:#x}", address);
        self.function_command(function_commands::COPY_DATA, address)
            .await
    }

    /// Reloads the shadow RAM of the EEPROM block at `address`
    pub async fn recall_data(&mut self, address: u8) -> Result<()> {
        self.function_command(function_commands::RECALL_DATA, address)
            .await
    }

    async fn function_command(&mut self, command: u8, address: u8) -> Result<()> {
        self.transfer(&[rom_commands::SKIP_ROM, command, address], 0)
            .await?;
        Ok(())
    }

    /// Reads the 64 bit ROM code: family, serial number, crc
    pub async fn read_rom(&mut self) -> Result<[u8; ROM_SIZE]> {
        let response = self.transfer(&[rom_commands::READ_ROM], ROM_SIZE).await?;

        let mut rom = [0; ROM_SIZE];
        rom.copy_from_slice(response.data());
        Ok(rom)
    }

    async fn read_word(&mut self, address: u8) -> Result<[u8; 2]> {
        let mut word = [0; 2];
        self.read_registers(address, &mut word).await?;
        Ok(word)
    }

    /// Reads the battery voltage in millivolts
    pub async fn voltage(&mut self) -> Result<u16> {
        let raw = self.read_word(addresses::VOLTAGE).await?;
        Ok(telemetry::voltage_mv(BigEndian::read_u16(&raw)))
    }

    pub async fn current(&mut self) -> Result<i16> {
        let raw = self.read_word(addresses::CURRENT).await?;
        Ok(telemetry::current_ma(BigEndian::read_i16(&raw)))
    }

    pub async fn average_current(&mut self) -> Result<i16> {
        let raw = self.read_word(addresses::AVERAGE_CURRENT).await?;
        Ok(telemetry::current_ma(BigEndian::read_i16(&raw)))
    }

    /// Accumulated charge in mAh
    pub async fn accumulated_charge(&mut self) -> Result<i16> {
        let raw = self.read_word(addresses::ACCUMULATED_CURRENT).await?;
        Ok(telemetry::charge_mah(BigEndian::read_i16(&raw)))
    }

    /// Temperature in 1/100 degree Celsius
    pub async fn temperature(&mut self) -> Result<i16> {
        let raw = self.read_word(addresses::TEMPERATURE).await?;
        Ok(telemetry::temperature_cc(BigEndian::read_i16(&raw)))
    }

    /// Gives back the delay
    pub fn free(self) -> D {
        self.delay
    }
}
