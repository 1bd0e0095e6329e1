//! Device session arbiter.
//!
//! Polled once per main loop pass, never blocks. It finds the monitor on the
//! bus, then multiplexes the battery and host request channels and its own
//! telemetry readout onto the transport, one transfer at a time. Battery
//! requests go first: the host can easily issue requests faster than they are
//! served and must not starve the charging logic.
//!
//! Nothing here tries to be clever. Apart from establishing communication and
//! the periodic readout it does nothing on its own: no caching, averaging or
//! read ahead, and requests are passed to the device unchanged.

use crate::bus::{BusLine, DeadlineTimer};
use crate::channel::{PendingRequest, RequestChannel, Response};
use crate::config::Config;
use crate::crc;
use crate::error::{Error, ErrorFlags, Result};
use crate::fmt::*;
use crate::known_chips::Family;
use crate::registers::*;
use crate::telemetry::{RawReadings, TelemetryCell, TelemetrySample};
use crate::transport::{Completion, SharedEngine, TransferBuffer};

/// Who the transfer in flight belongs to
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Rom,
    Battery,
    Host,
    Measurement,
    Thermal,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// First attempt goes out without waiting
    Startup,
    Backoff { since_ms: u32 },
    Transfer(Owner),
    Ready,
}

pub struct Session<'a> {
    config: Config,
    state: State,
    serial_number: [u8; 6],
    serial_number_valid: bool,
    family: Option<Family>,
    error: ErrorFlags,
    long_time_error: ErrorFlags,
    next_poll_ms: u32,
    measurement: Option<[u8; MEASUREMENT_BLOCK_SIZE]>,
    report_next_sample: bool,
    host: &'a RequestChannel,
    battery: &'a RequestChannel,
    telemetry: &'a TelemetryCell,
}

impl<'a> Session<'a> {
    pub const fn new(
        config: Config,
        host: &'a RequestChannel,
        battery: &'a RequestChannel,
        telemetry: &'a TelemetryCell,
    ) -> Self {
        Self {
            config,
            state: State::Startup,
            serial_number: [0; 6],
            serial_number_valid: false,
            family: None,
            error: ErrorFlags::empty(),
            long_time_error: ErrorFlags::empty(),
            next_poll_ms: 0,
            measurement: None,
            report_next_sample: false,
            host,
            battery,
            telemetry,
        }
    }

    pub fn poll<L, T>(&mut self, engine: &SharedEngine<L, T>, now_ms: u32)
    where
        L: BusLine,
        T: DeadlineTimer,
    {
        // You want to talk and do not know to whom?
        if !self.serial_number_valid {
            self.reject_pending();
        }

        match self.state {
            State::Startup => self.discover(engine, now_ms),

            State::Backoff { since_ms } => {
                if now_ms.wrapping_sub(since_ms) >= self.config.retry_interval_ms {
                    self.discover(engine, now_ms);
                }
            }

            State::Transfer(owner) => {
                if let Some(completion) = engine.lock(|e| e.take_completion()) {
                    self.finish(owner, &completion, now_ms);
                }
            }

            State::Ready => self.arbitrate(engine, now_ms),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn serial_number_valid(&self) -> bool {
        self.serial_number_valid
    }

    pub fn serial_number(&self) -> Option<[u8; 6]> {
        self.serial_number_valid.then_some(self.serial_number)
    }

    /// Family of the last device that answered the ROM read, wanted or not
    pub fn family(&self) -> Option<Family> {
        self.family
    }

    /// Errors of the current discovery cycle
    pub fn errors(&self) -> ErrorFlags {
        self.error
    }

    /// Everything seen since the last [`Session::take_long_time_errors`]
    pub fn long_time_errors(&self) -> ErrorFlags {
        self.long_time_error | self.error
    }

    /// Host has seen the current errors. They stay in the long time set
    pub fn acknowledge_errors(&mut self) -> ErrorFlags {
        let seen = self.error;
        self.long_time_error |= seen;
        self.error = ErrorFlags::empty();
        seen
    }

    /// Host read-and-reset of the long time errors
    pub fn take_long_time_errors(&mut self) -> ErrorFlags {
        let seen = self.long_time_errors();
        self.long_time_error = ErrorFlags::empty();
        seen
    }

    pub fn host(&self) -> &'a RequestChannel {
        self.host
    }

    pub fn battery(&self) -> &'a RequestChannel {
        self.battery
    }

    pub fn telemetry(&self) -> &'a TelemetryCell {
        self.telemetry
    }

    /// Legacy synchronous transfer that bypasses the request channels.
    ///
    /// Spins until the transport is done, calling `spin` in the loop, and
    /// leaves `BUSY_WAIT` in the error set when it had to wait. Do not use
    /// it in new code: submit on a channel and poll instead
    pub fn transfer_blocking<L, T>(
        &mut self,
        engine: &SharedEngine<L, T>,
        request: &[u8],
        rx_len: usize,
        spin: impl FnMut(),
        now_ms: u32,
    ) -> Result<Response>
    where
        L: BusLine,
        T: DeadlineTimer,
    {
        if !self.serial_number_valid || !self.error.is_empty() {
            return Err(Error::Rejected(self.error | ErrorFlags::ILLEGAL_WRITE));
        }

        if self.state != State::Ready {
            return Err(Error::Busy);
        }

        let buffer = TransferBuffer::from_slice(request)?;
        if let Err(e) = engine.lock(|e| e.start(buffer, request.len(), rx_len)) {
            if e == Error::Busy {
                self.error |= ErrorFlags::INTERNAL_ERROR;
            }
            return Err(e);
        }

        if engine.wait_idle(spin) {
            self.error |= ErrorFlags::BUSY_WAIT;
        }

        let completion = engine
            .lock(|e| e.take_completion())
            .ok_or(Error::Busy)?;

        if let Some(fault) = completion.fault {
            self.error |= ErrorFlags::from(fault);
            self.lose_device(now_ms);
        }

        Response::new(completion.buffer, completion.rx_len, self.error).into_result()
    }

    /// Dumps the whole register map, 8 bytes per call of `sink`, for the
    /// debug console. `sink` gets `None` for lines the device did not answer.
    ///
    /// Only checks that the transport is idle when it begins. `spin` runs
    /// while each line is in flight, same as for [`Session::transfer_blocking`]
    pub fn dump_registers<L, T>(
        &self,
        engine: &SharedEngine<L, T>,
        mut spin: impl FnMut(),
        mut sink: impl FnMut(u8, Option<&[u8]>),
    ) -> Result<()>
    where
        L: BusLine,
        T: DeadlineTimer,
    {
        if !engine.lock(|e| e.available()) {
            return Err(Error::Busy);
        }

        for address in (0..addresses::DUMP_END).step_by(DUMP_BLOCK_SIZE) {
            let buffer = TransferBuffer::from_slice(&read_data_request(address))?;
            engine.lock(|e| e.start(buffer, 3, DUMP_BLOCK_SIZE))?;
            engine.wait_idle(&mut spin);

            let completion = engine
                .lock(|e| e.take_completion())
                .ok_or(Error::Busy)?;

            match completion.fault {
                None => sink(address, Some(completion.data())),
                Some(_) => sink(address, None),
            }
        }

        Ok(())
    }

    fn discover<L, T>(&mut self, engine: &SharedEngine<L, T>, now_ms: u32)
    where
        L: BusLine,
        T: DeadlineTimer,
    {
        let newly_seen = self.error - self.long_time_error;
        if !newly_seen.is_empty() {
            warn!("new monitor errors: {=u8:#x}", newly_seen.bits());
        }

        self.long_time_error |= self.error;
        self.serial_number_valid = false;
        self.measurement = None;

        // we do not know for sure but this is a good default
        self.error = ErrorFlags::NO_DEVICE | ErrorFlags::NO_DEVICE_FLAG_STALE;

        let buffer = [rom_commands::READ_ROM];
        if !self.start(engine, Owner::Rom, &buffer, ROM_SIZE) {
            self.state = State::Backoff { since_ms: now_ms };
        }
    }

    fn arbitrate<L, T>(&mut self, engine: &SharedEngine<L, T>, now_ms: u32)
    where
        L: BusLine,
        T: DeadlineTimer,
    {
        // Someone bypassing the channels holds the transport
        if !engine.lock(|e| e.available()) {
            return;
        }

        // Nobody talks before the host has acknowledged the errors.
        // Telemetry keeps going
        if !self.error.is_empty() {
            self.reject_pending();
        }

        if let Some(request) = self.battery.claim() {
            self.service(engine, Owner::Battery, request);
        } else if let Some(block) = self.telemetry_due(now_ms) {
            self.read_block(engine, block, now_ms);
        } else if let Some(request) = self.host.claim() {
            self.service(engine, Owner::Host, request);
        }
    }

    fn telemetry_due(&self, now_ms: u32) -> Option<Owner> {
        if self.measurement.is_some() {
            Some(Owner::Thermal)
        } else if now_ms.wrapping_sub(self.next_poll_ms) as i32 >= 0 {
            Some(Owner::Measurement)
        } else {
            None
        }
    }

    fn read_block<L, T>(&mut self, engine: &SharedEngine<L, T>, block: Owner, now_ms: u32)
    where
        L: BusLine,
        T: DeadlineTimer,
    {
        let (address, size) = match block {
            Owner::Measurement => {
                self.next_poll_ms = now_ms.wrapping_add(self.config.poll_interval_ms);
                (MEASUREMENT_BLOCK, MEASUREMENT_BLOCK_SIZE)
            }
            _ => (THERMAL_BLOCK, THERMAL_BLOCK_SIZE),
        };

        self.start(engine, block, &read_data_request(address), size);
    }

    fn service<L, T>(&mut self, engine: &SharedEngine<L, T>, owner: Owner, request: PendingRequest)
    where
        L: BusLine,
        T: DeadlineTimer,
    {
        let started = engine.lock(|e| e.start(request.buffer, request.tx_len, request.rx_len));

        match started {
            Ok(()) => self.state = State::Transfer(owner),
            Err(_) => {
                self.error |= ErrorFlags::INTERNAL_ERROR;
                self.channel(owner).complete(&[], self.error);
            }
        }
    }

    fn start<L, T>(
        &mut self,
        engine: &SharedEngine<L, T>,
        owner: Owner,
        request: &[u8],
        rx_len: usize,
    ) -> bool
    where
        L: BusLine,
        T: DeadlineTimer,
    {
        let started = TransferBuffer::from_slice(request)
            .and_then(|buffer| engine.lock(|e| e.start(buffer, request.len(), rx_len)));

        match started {
            Ok(()) => {
                self.state = State::Transfer(owner);
                true
            }
            Err(_) => {
                self.error |= ErrorFlags::INTERNAL_ERROR;
                false
            }
        }
    }

    fn finish(&mut self, owner: Owner, completion: &Completion, now_ms: u32) {
        if let Some(fault) = completion.fault {
            self.error |= ErrorFlags::from(fault);
        }

        match owner {
            Owner::Rom => self.identify(completion, now_ms),

            Owner::Battery | Owner::Host => {
                self.channel(owner).complete(completion.data(), self.error);
                self.check_device(now_ms);
            }

            Owner::Measurement => {
                self.measurement = completion.data().try_into().ok();
                if self.measurement.is_none() {
                    self.error |= ErrorFlags::INTERNAL_ERROR;
                }
                self.check_device(now_ms);
            }

            Owner::Thermal => {
                let measurement = self.measurement.take();
                let thermal: Option<[u8; THERMAL_BLOCK_SIZE]> = completion.data().try_into().ok();

                if let (Some(measurement), Some(thermal)) = (measurement, thermal) {
                    if completion.fault.is_none() {
                        self.publish(&RawReadings::from_blocks(&measurement, &thermal), now_ms);
                    }
                }
                self.check_device(now_ms);
            }
        }
    }

    fn identify(&mut self, completion: &Completion, now_ms: u32) {
        self.error.remove(ErrorFlags::NO_DEVICE_FLAG_STALE);

        if completion.fault.is_some() {
            // NO_DEVICE stays, the line fault (if any) was added in finish
            return self.back_off(now_ms);
        }
        self.error.remove(ErrorFlags::NO_DEVICE);

        let rom = completion.data();
        if self.config.verify_rom_crc && !crc::rom_code_valid(rom) {
            warn!("monitor ROM code failed the crc check");
            self.error |= ErrorFlags::CRC_FAIL;
            return self.back_off(now_ms);
        }

        let family = Family::from(rom[0]);
        self.family = Some(family);

        if family.code() != self.config.family_code {
            warn!("unexpected device on the battery bus: {}", family);
            return self.back_off(now_ms);
        }

        self.serial_number.copy_from_slice(&rom[1..7]);
        self.serial_number_valid = true;
        self.long_time_error |= self.error;
        self.error = ErrorFlags::empty();

        // first readout right away, and tell us about it
        self.next_poll_ms = now_ms;
        self.report_next_sample = true;

        info!("battery monitor found, serial {:x}", self.serial_number);
        self.state = State::Ready;
    }

    fn publish(&mut self, raw: &RawReadings, now_ms: u32) {
        let sample = TelemetrySample::from_raw(raw, now_ms);
        self.telemetry.publish(sample);

        if core::mem::take(&mut self.report_next_sample) {
            debug!(
                "serial {:x} raw {} sample {} errors {=u8:#x}/{=u8:#x}",
                self.serial_number,
                raw,
                sample,
                self.long_time_error.bits(),
                self.error.bits()
            );
        }
    }

    /// Back to discovery if the last transfer hit a fault
    fn check_device(&mut self, now_ms: u32) {
        if self.error.intersects(ErrorFlags::FAULTS) {
            self.lose_device(now_ms);
        } else {
            self.state = State::Ready;
        }
    }

    fn lose_device(&mut self, now_ms: u32) {
        warn!("battery monitor lost, errors {=u8:#x}", self.error.bits());
        self.measurement = None;
        self.back_off(now_ms);
    }

    fn back_off(&mut self, now_ms: u32) {
        self.serial_number_valid = false;
        self.state = State::Backoff { since_ms: now_ms };
    }

    fn reject_pending(&mut self) {
        let error = self.error | ErrorFlags::ILLEGAL_WRITE;

        for channel in [self.battery, self.host] {
            if channel.reject(error) {
                debug!("request refused, errors {=u8:#x}", error.bits());
            }
        }
    }

    fn channel(&self, owner: Owner) -> &'a RequestChannel {
        match owner {
            Owner::Battery => self.battery,
            _ => self.host,
        }
    }
}
