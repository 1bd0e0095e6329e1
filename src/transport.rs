//! Bit level single-wire transport, driven from the deadline timer interrupt.
//!
//! Every call of [`Engine::step`] performs exactly one timing phase of the
//! protocol (a part of the reset sequence, or one bit slot) and re-arms the
//! timer for the next one before returning, so the interrupt itself provides
//! the protocol timing. A transfer is always reset/presence, then `tx_len`
//! bytes out, then `rx_len` bytes in, read back into the same buffer starting
//! at index 0.

use core::cell::RefCell;
use core::ops::{Deref, DerefMut};

use critical_section::Mutex;

use crate::bus::{BusFault, BusLine, DeadlineTimer};
use crate::error::{Error, Result};

pub const TRANSFER_CAPACITY: usize = 16;

/// Bus timings in microseconds, slightly above the data sheet minimums
pub mod timing {
    /// From arming a transfer to the first interrupt
    pub const START_US: u16 = 2;
    pub const RESET_LOW_US: u16 = 481;
    pub const RESET_HIGH_US: u16 = 481;
    /// Presence pulse is sampled this long after the end of the reset pulse
    pub const PRESENCE_SAMPLE_US: u16 = 70;
    pub const SLOT_US: u16 = 60;
    /// Low time that starts every slot, also the low time of a written one
    pub const SLOT_LOW_US: u16 = 2;
    pub const READ_SAMPLE_US: u16 = 14;
    pub const READ_RECOVERY_US: u16 = 2;
    /// Decides how much CPU is left to the main loop while writing
    pub const WRITE_RECOVERY_US: u16 = 20;
    /// Anything shorter is busy-waited inside the interrupt instead of re-armed
    pub const MIN_REARM_US: u16 = 16;
}

const _: () = assert!(timing::SLOT_LOW_US < timing::MIN_REARM_US);
const _: () = assert!(timing::READ_SAMPLE_US < timing::MIN_REARM_US);
const _: () = assert!(timing::PRESENCE_SAMPLE_US < timing::RESET_HIGH_US);

/// Outgoing bytes on input, received bytes on output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferBuffer([u8; TRANSFER_CAPACITY]);

impl TransferBuffer {
    pub const fn new() -> Self {
        Self([0; TRANSFER_CAPACITY])
    }

    pub fn from_slice(data: &[u8]) -> Result<Self> {
        if data.len() > TRANSFER_CAPACITY {
            return Err(Error::BufferOverflow);
        }

        let mut buffer = Self::new();
        buffer.0[..data.len()].copy_from_slice(data);
        Ok(buffer)
    }
}

impl Default for TransferBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for TransferBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl DerefMut for TransferBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    ResetLow,
    ResetRelease,
    PresenceSample,
    Write,
    WriteRelease,
    Read,
    /// Waits out the tail of the last slot before reporting completion
    Settle,
}

/// Progress of the transfer in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferDescriptor {
    pub tx_len: u8,
    pub rx_len: u8,
    pub phase: Phase,
    tx_remaining: u8,
    rx_remaining: u8,
    cursor: u8,
    bit_counter: u8,
}

impl TransferDescriptor {
    const IDLE: Self = Self {
        tx_len: 0,
        rx_len: 0,
        phase: Phase::Idle,
        tx_remaining: 0,
        rx_remaining: 0,
        cursor: 0,
        bit_counter: 0,
    };

    /// Bytes still to be sent or received
    pub fn remaining(&self) -> usize {
        self.tx_remaining as usize + self.rx_remaining as usize
    }

    /// Bits left in the current byte after the one on the wire, 0..=7
    pub fn bit_counter(&self) -> u8 {
        self.bit_counter
    }
}

/// Result of a finished transfer, kept until collected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub buffer: TransferBuffer,
    pub rx_len: u8,
    pub fault: Option<BusFault>,
}

impl Completion {
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.rx_len as usize]
    }
}

pub struct Engine<L, T> {
    line: L,
    timer: T,
    descriptor: TransferDescriptor,
    buffer: TransferBuffer,
    shift: u8,
    fault: Option<BusFault>,
    completion: Option<Completion>,
    wake: bool,
}

impl<L, T> Engine<L, T>
where
    L: BusLine,
    T: DeadlineTimer,
{
    pub const fn new(line: L, timer: T) -> Self {
        Self {
            line,
            timer,
            descriptor: TransferDescriptor::IDLE,
            buffer: TransferBuffer::new(),
            shift: 0,
            fault: None,
            completion: None,
            wake: false,
        }
    }

    /// True while a transfer owns the line and the timer
    pub fn busy(&self) -> bool {
        self.descriptor.phase != Phase::Idle
    }

    /// True if a new transfer can be started right now
    pub fn available(&self) -> bool {
        !self.busy() && self.completion.is_none()
    }

    pub fn descriptor(&self) -> &TransferDescriptor {
        &self.descriptor
    }

    /// Arms a transfer: reset/presence, `tx_len` bytes of `buffer` out,
    /// then `rx_len` bytes in. The first phase runs from the timer interrupt.
    ///
    /// Whoever starts a transfer has to collect it with `take_completion`,
    /// nothing else can start before that. Only the session does both
    pub(crate) fn start(&mut self, buffer: TransferBuffer, tx_len: usize, rx_len: usize) -> Result<()> {
        if !self.available() {
            return Err(Error::Busy);
        }

        if tx_len > TRANSFER_CAPACITY || rx_len > TRANSFER_CAPACITY {
            return Err(Error::BufferOverflow);
        }

        self.buffer = buffer;
        self.shift = 0;
        self.fault = None;
        self.descriptor = TransferDescriptor {
            tx_len: tx_len as u8,
            rx_len: rx_len as u8,
            phase: Phase::ResetLow,
            tx_remaining: tx_len as u8,
            rx_remaining: rx_len as u8,
            cursor: 0,
            bit_counter: 0,
        };

        self.timer.arm(timing::START_US);
        Ok(())
    }

    pub(crate) fn take_completion(&mut self) -> Option<Completion> {
        self.completion.take()
    }

    /// The "new data, do not idle" signal raised by every completion
    pub fn take_wake(&mut self) -> bool {
        core::mem::take(&mut self.wake)
    }

    /// Timer interrupt body. Does nothing when no transfer is in flight
    pub fn step(&mut self) {
        match self.descriptor.phase {
            Phase::Idle => {}

            Phase::ResetLow => {
                // Someone else holds the line (or it's shorted)
                if !self.line.sample() {
                    return self.abort(BusFault::LineStuckLow);
                }

                self.line.drive_low();
                self.rearm(Phase::ResetRelease, timing::RESET_LOW_US);
            }

            Phase::ResetRelease => {
                // We are driving it, it must read low
                if self.line.sample() {
                    return self.abort(BusFault::LineStuckHigh);
                }

                self.line.release();
                self.rearm(Phase::PresenceSample, timing::PRESENCE_SAMPLE_US);
            }

            Phase::PresenceSample => {
                if self.line.sample() {
                    return self.abort(BusFault::NoDeviceResponding);
                }

                let next = self.load_next_byte();
                self.rearm(
                    next,
                    timing::RESET_HIGH_US - timing::PRESENCE_SAMPLE_US,
                );
            }

            Phase::Write => {
                self.line.drive_low();
                self.busy_wait(timing::SLOT_LOW_US);

                if self.shift & 0x01 != 0 {
                    self.line.release();
                }

                // after 8 slots the byte is back where it started
                self.shift = self.shift.rotate_right(1);
                self.rearm(Phase::WriteRelease, timing::SLOT_US - timing::SLOT_LOW_US);
            }

            Phase::WriteRelease => {
                self.line.release();

                let next = self.next_bit(Phase::Write);
                self.rearm(next, timing::WRITE_RECOVERY_US);
            }

            Phase::Read => {
                self.line.drive_low();
                self.busy_wait(timing::SLOT_LOW_US);
                self.line.release();
                self.busy_wait(timing::READ_SAMPLE_US - timing::SLOT_LOW_US);

                let bit = self.line.sample();

                // least significant bit comes first
                self.shift = (self.shift >> 1) | if bit { 0x80 } else { 0x00 };

                let next = self.next_bit(Phase::Read);
                self.rearm(
                    next,
                    timing::SLOT_US - timing::READ_SAMPLE_US + timing::READ_RECOVERY_US,
                );
            }

            Phase::Settle => self.finish(),
        }
    }

    fn rearm(&mut self, phase: Phase, us: u16) {
        self.descriptor.phase = phase;
        self.timer.arm(us);
    }

    fn busy_wait(&mut self, us: u16) {
        self.timer.arm(us);
        while !self.timer.expired() {
            core::hint::spin_loop();
        }
    }

    fn next_bit(&mut self, same: Phase) -> Phase {
        if self.descriptor.bit_counter > 0 {
            self.descriptor.bit_counter -= 1;
            same
        } else {
            self.byte_done()
        }
    }

    fn byte_done(&mut self) -> Phase {
        let d = &mut self.descriptor;

        if d.tx_remaining > 0 {
            d.tx_remaining -= 1;
            d.cursor += 1;

            // Received bytes overwrite the request from the start
            if d.tx_remaining == 0 {
                d.cursor = 0;
            }
        } else {
            self.buffer[d.cursor as usize] = self.shift;
            d.rx_remaining -= 1;
            d.cursor += 1;
        }

        self.load_next_byte()
    }

    fn load_next_byte(&mut self) -> Phase {
        let d = &mut self.descriptor;

        if d.tx_remaining > 0 {
            self.shift = self.buffer[d.cursor as usize];
            d.bit_counter = 7;
            Phase::Write
        } else if d.rx_remaining > 0 {
            self.shift = 0;
            d.bit_counter = 7;
            Phase::Read
        } else {
            Phase::Settle
        }
    }

    fn abort(&mut self, fault: BusFault) {
        self.line.release();
        self.fault = Some(fault);

        // Nobody answered, which reads as all ones
        let rx_len = self.descriptor.rx_len as usize;
        self.buffer[..rx_len].fill(0xFF);

        self.finish();
    }

    fn finish(&mut self) {
        self.completion = Some(Completion {
            buffer: self.buffer,
            rx_len: self.descriptor.rx_len,
            fault: self.fault.take(),
        });

        self.descriptor = TransferDescriptor::IDLE;
        self.wake = true;
        self.timer.disable();
    }
}

/// The engine as shared between the timer interrupt and the main loop
pub struct SharedEngine<L, T> {
    inner: Mutex<RefCell<Engine<L, T>>>,
}

impl<L, T> SharedEngine<L, T>
where
    L: BusLine,
    T: DeadlineTimer,
{
    pub const fn new(engine: Engine<L, T>) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(engine)),
        }
    }

    /// To be called from the deadline timer interrupt handler
    pub fn on_timer_interrupt(&self) {
        self.lock(|engine| engine.step());
    }

    /// Transfers are started and collected by [`crate::session::Session`],
    /// outside users only get to look
    pub fn lock<R>(&self, f: impl FnOnce(&mut Engine<L, T>) -> R) -> R {
        critical_section::with(|cs| f(&mut self.inner.borrow_ref_mut(cs)))
    }

    pub fn busy(&self) -> bool {
        self.lock(|engine| engine.busy())
    }

    pub fn take_wake(&self) -> bool {
        self.lock(|engine| engine.take_wake())
    }

    /// Spins until the transfer in flight is done. Returns true if it had
    /// to wait at all
    pub fn wait_idle(&self, mut spin: impl FnMut()) -> bool {
        let mut waited = false;

        while self.busy() {
            waited = true;
            spin();
        }

        waited
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::{rom_commands, ROM_SIZE};
    use crate::sim::{Device, Sim};

    fn read_rom_buffer() -> TransferBuffer {
        TransferBuffer::from_slice(&[rom_commands::READ_ROM]).unwrap()
    }

    #[test]
    fn reads_rom_code() {
        let sim = Sim::with_device(Device::ds2756());
        let engine = sim.shared();

        engine
            .lock(|e| e.start(read_rom_buffer(), 1, ROM_SIZE))
            .unwrap();
        assert!(engine.busy());

        sim.run(&engine);

        let completion = engine.lock(|e| e.take_completion()).unwrap();
        assert_eq!(completion.fault, None);
        assert_eq!(completion.data(), &Device::ds2756().rom);
        assert_eq!(sim.device().received, [rom_commands::READ_ROM]);
        assert_eq!(sim.device().resets, 1);
    }

    #[test]
    fn busy_waits_stay_below_rearm_granularity() {
        let sim = Sim::with_device(Device::ds2756());
        let engine = sim.shared();

        engine
            .lock(|e| e.start(read_rom_buffer(), 1, ROM_SIZE))
            .unwrap();
        sim.run(&engine);

        let longest = sim.bus().longest_busy_wait_us;
        assert!(longest > 0);
        assert!(longest < timing::MIN_REARM_US);
    }

    #[test]
    fn completion_disables_timer_and_raises_wake() {
        let sim = Sim::with_device(Device::ds2756());
        let engine = sim.shared();

        engine
            .lock(|e| e.start(read_rom_buffer(), 1, ROM_SIZE))
            .unwrap();
        assert!(!engine.take_wake());

        sim.run(&engine);

        assert!(!sim.bus().timer_armed());
        assert!(engine.take_wake());
        assert!(!engine.take_wake());
    }

    #[test]
    fn line_stuck_low_before_reset() {
        let sim = Sim::with_device(Device::ds2756());
        sim.bus().stuck = Some(false);
        let engine = sim.shared();

        engine
            .lock(|e| e.start(read_rom_buffer(), 1, ROM_SIZE))
            .unwrap();
        sim.run(&engine);

        let completion = engine.lock(|e| e.take_completion()).unwrap();
        assert_eq!(completion.fault, Some(BusFault::LineStuckLow));
        assert_eq!(completion.data(), &[0xFF; ROM_SIZE]);
        // we never even started the reset pulse
        assert_eq!(sim.device().resets, 0);
    }

    #[test]
    fn line_stuck_high_after_reset_low() {
        let sim = Sim::with_device(Device::ds2756());
        let engine = sim.shared();

        engine
            .lock(|e| e.start(read_rom_buffer(), 1, ROM_SIZE))
            .unwrap();

        // first phase passes, then the line refuses to go down
        sim.fire(&engine);
        assert_eq!(engine.lock(|e| e.descriptor().phase), Phase::ResetRelease);
        sim.bus().stuck = Some(true);

        sim.run(&engine);

        let completion = engine.lock(|e| e.take_completion()).unwrap();
        assert_eq!(completion.fault, Some(BusFault::LineStuckHigh));
    }

    #[test]
    fn missing_device_reads_as_no_presence() {
        let sim = Sim::new();
        let engine = sim.shared();

        engine
            .lock(|e| e.start(read_rom_buffer(), 1, ROM_SIZE))
            .unwrap();
        sim.run(&engine);

        let completion = engine.lock(|e| e.take_completion()).unwrap();
        assert_eq!(completion.fault, Some(BusFault::NoDeviceResponding));
        assert_eq!(completion.data(), &[0xFF; ROM_SIZE]);
    }

    #[test]
    fn start_while_busy_is_rejected_and_harmless() {
        let sim = Sim::with_device(Device::ds2756());
        let engine = sim.shared();

        engine
            .lock(|e| e.start(read_rom_buffer(), 1, ROM_SIZE))
            .unwrap();
        sim.fire(&engine);
        sim.fire(&engine);

        let before = engine.lock(|e| *e.descriptor());
        let other = TransferBuffer::from_slice(&[0xCC, 0x69, 0x00]).unwrap();
        assert_eq!(engine.lock(|e| e.start(other, 3, 2)), Err(Error::Busy));
        assert_eq!(engine.lock(|e| *e.descriptor()), before);

        sim.run(&engine);
        let completion = engine.lock(|e| e.take_completion()).unwrap();
        assert_eq!(completion.data(), &Device::ds2756().rom);
    }

    #[test]
    fn uncollected_completion_blocks_next_start() {
        let sim = Sim::with_device(Device::ds2756());
        let engine = sim.shared();

        engine
            .lock(|e| e.start(read_rom_buffer(), 1, ROM_SIZE))
            .unwrap();
        sim.run(&engine);

        assert!(!engine.busy());
        assert_eq!(
            engine.lock(|e| e.start(read_rom_buffer(), 1, ROM_SIZE)),
            Err(Error::Busy)
        );

        engine.lock(|e| e.take_completion()).unwrap();
        assert!(engine.lock(|e| e.available()));
    }

    #[test]
    fn oversized_transfer_is_refused() {
        let sim = Sim::new();
        let engine = sim.shared();

        assert_eq!(
            engine.lock(|e| e.start(TransferBuffer::new(), 1, TRANSFER_CAPACITY + 1)),
            Err(Error::BufferOverflow)
        );
        assert!(!engine.busy());
        assert!(TransferBuffer::from_slice(&[0; TRANSFER_CAPACITY + 1]).is_err());
    }

    #[test]
    fn remaining_bytes_only_decrease() {
        let sim = Sim::with_device(Device::ds2756());
        let engine = sim.shared();

        let request = TransferBuffer::from_slice(&[0xCC, 0x69, 0x0C]).unwrap();
        engine.lock(|e| e.start(request, 3, 6)).unwrap();

        let mut last = engine.lock(|e| e.descriptor().remaining());
        assert_eq!(last, 9);

        while sim.fire(&engine) {
            let (remaining, bits) =
                engine.lock(|e| (e.descriptor().remaining(), e.descriptor().bit_counter()));
            assert!(remaining <= last);
            assert!(bits <= 7);
            last = remaining;
        }

        assert_eq!(last, 0);
    }

    #[test]
    fn bytes_go_out_lsb_first() {
        let sim = Sim::with_device(Device::ds2756());
        let engine = sim.shared();

        let request = TransferBuffer::from_slice(&[0xCC, 0x6C, 0x20, 0xA5, 0x01]).unwrap();
        engine.lock(|e| e.start(request, 5, 0)).unwrap();
        sim.run(&engine);

        assert_eq!(engine.lock(|e| e.take_completion()).unwrap().fault, None);
        assert_eq!(sim.device().received, [0xCC, 0x6C, 0x20, 0xA5, 0x01]);
        assert_eq!(sim.device().memory[0x20], 0xA5);
        assert_eq!(sim.device().memory[0x21], 0x01);
    }

    #[test]
    fn spurious_interrupt_is_ignored() {
        let sim = Sim::with_device(Device::ds2756());
        let engine = sim.shared();

        engine.on_timer_interrupt();

        assert!(!engine.busy());
        assert!(engine.lock(|e| e.take_completion()).is_none());
        assert_eq!(sim.device().resets, 0);
    }
}
