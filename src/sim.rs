//! Virtual-time single-wire bus with a DS2756 model behind it, for the unit tests.
//!
//! Time only moves when the timer says so: an interrupt jumps to the armed
//! deadline, a busy-wait on the expiry flag jumps to it as well. The device
//! decodes slots from how long the host kept the line low.

extern crate std;

use std::cell::{RefCell, RefMut};
use std::rc::Rc;
use std::vec::Vec;

use crate::bus::{BusLine, DeadlineTimer};
use crate::crc::crc8;
use crate::registers::{function_commands, rom_commands, DS2756_FAMILY_CODE, ROM_SIZE};
use crate::transport::{Engine, SharedEngine};

const RESET_MIN_US: u32 = 480;
const WRITE_ONE_MAX_US: u32 = 15;
const PRESENCE_DELAY_US: u32 = 30;
const PRESENCE_LENGTH_US: u32 = 120;
const READ_ZERO_HOLD_US: u32 = 30;

#[derive(Debug, Clone, Copy)]
enum Op {
    Read,
    Write,
    Copy,
    Recall,
}

#[derive(Debug, Clone, Copy)]
enum Source {
    Rom(usize),
    Memory(u8),
}

#[derive(Debug, Clone, Copy)]
enum Mode {
    Idle,
    Rom,
    Function,
    Address(Op),
    Writing(u8),
    Sending(Source, u8),
}

pub struct Device {
    pub rom: [u8; ROM_SIZE],
    pub memory: [u8; 256],
    /// Every byte received since power up, commands included
    pub received: Vec<u8>,
    pub resets: u32,
    pub copies: Vec<u8>,
    pub recalls: Vec<u8>,
    mode: Mode,
    bits: u8,
    byte: u8,
}

impl Device {
    pub fn with_rom(rom: [u8; ROM_SIZE]) -> Self {
        Self {
            rom,
            memory: [0; 256],
            received: Vec::new(),
            resets: 0,
            copies: Vec::new(),
            recalls: Vec::new(),
            mode: Mode::Idle,
            bits: 0,
            byte: 0,
        }
    }

    pub fn with_family(family: u8) -> Self {
        let mut rom = [family, 0x6B, 0x2A, 0x19, 0x05, 0x00, 0x00, 0x00];
        rom[7] = crc8(&rom[..7]);
        Self::with_rom(rom)
    }

    pub fn ds2756() -> Self {
        Self::with_family(DS2756_FAMILY_CODE)
    }

    pub fn serial(&self) -> [u8; 6] {
        let mut serial = [0; 6];
        serial.copy_from_slice(&self.rom[1..7]);
        serial
    }

    pub fn set_word(&mut self, address: u8, value: u16) {
        let [high, low] = value.to_be_bytes();
        self.memory[address as usize] = high;
        self.memory[address as usize + 1] = low;
    }

    fn reset(&mut self) {
        self.resets += 1;
        self.mode = Mode::Rom;
        self.bits = 0;
        self.byte = 0;
    }

    /// Host pulled the line down. Returns how long we keep it low ourselves
    fn on_fall(&mut self) -> Option<u32> {
        let Mode::Sending(source, bit) = self.mode else {
            return None;
        };

        let byte = match source {
            Source::Rom(index) => self.rom.get(index).copied().unwrap_or(0xFF),
            Source::Memory(address) => self.memory[address as usize],
        };
        let value = (byte >> bit) & 0x01;

        self.mode = if bit == 7 {
            let next = match source {
                Source::Rom(index) => Source::Rom(index + 1),
                Source::Memory(address) => Source::Memory(address.wrapping_add(1)),
            };
            Mode::Sending(next, 0)
        } else {
            Mode::Sending(source, bit + 1)
        };

        if value == 0 {
            Some(READ_ZERO_HOLD_US)
        } else {
            None
        }
    }

    /// Host released after `low_us`. Returns true if that was a reset
    fn on_release(&mut self, low_us: u32) -> bool {
        if low_us >= RESET_MIN_US {
            self.reset();
            return true;
        }

        match self.mode {
            Mode::Idle | Mode::Sending(..) => return false,
            _ => {}
        }

        if low_us < WRITE_ONE_MAX_US {
            self.byte |= 1 << self.bits;
        }
        self.bits += 1;

        if self.bits == 8 {
            let byte = self.byte;
            self.bits = 0;
            self.byte = 0;
            self.received.push(byte);
            self.on_byte(byte);
        }

        false
    }

    fn on_byte(&mut self, byte: u8) {
        self.mode = match (self.mode, byte) {
            (Mode::Rom, rom_commands::READ_ROM) => Mode::Sending(Source::Rom(0), 0),
            (Mode::Rom, rom_commands::SKIP_ROM) => Mode::Function,
            (Mode::Function, function_commands::READ_DATA) => Mode::Address(Op::Read),
            (Mode::Function, function_commands::WRITE_DATA) => Mode::Address(Op::Write),
            (Mode::Function, function_commands::COPY_DATA) => Mode::Address(Op::Copy),
            (Mode::Function, function_commands::RECALL_DATA) => Mode::Address(Op::Recall),
            (Mode::Address(Op::Read), address) => Mode::Sending(Source::Memory(address), 0),
            (Mode::Address(Op::Write), address) => Mode::Writing(address),
            (Mode::Address(Op::Copy), address) => {
                self.copies.push(address);
                Mode::Idle
            }
            (Mode::Address(Op::Recall), address) => {
                self.recalls.push(address);
                Mode::Idle
            }
            (Mode::Writing(address), data) => {
                self.memory[address as usize] = data;
                Mode::Writing(address.wrapping_add(1))
            }
            _ => Mode::Idle,
        };
    }
}

pub struct Bus {
    pub now_us: u32,
    pub longest_busy_wait_us: u16,
    /// Forces the line level: `Some(false)` shorted to ground, `Some(true)` stuck high
    pub stuck: Option<bool>,
    pub device: Option<Device>,
    deadline_us: Option<u32>,
    armed_us: u16,
    host_low: bool,
    host_fell_at: u32,
    device_low: (u32, u32),
}

impl Bus {
    pub fn timer_armed(&self) -> bool {
        self.deadline_us.is_some()
    }

    fn level(&self) -> bool {
        if let Some(level) = self.stuck {
            return level;
        }

        let (from, until) = self.device_low;
        let device_low = from <= self.now_us && self.now_us < until;
        !(self.host_low || device_low)
    }
}

pub struct MockLine {
    bus: Rc<RefCell<Bus>>,
}

impl BusLine for MockLine {
    fn drive_low(&mut self) {
        let mut guard = self.bus.borrow_mut();
        let bus = &mut *guard;
        if bus.host_low {
            return;
        }

        bus.host_low = true;
        bus.host_fell_at = bus.now_us;

        let now = bus.now_us;
        if let Some(hold) = bus.device.as_mut().and_then(|d| d.on_fall()) {
            bus.device_low = (now, now + hold);
        }
    }

    fn release(&mut self) {
        let mut guard = self.bus.borrow_mut();
        let bus = &mut *guard;
        if !bus.host_low {
            return;
        }

        bus.host_low = false;

        let now = bus.now_us;
        let low_us = now - bus.host_fell_at;
        let reset = bus
            .device
            .as_mut()
            .map(|d| d.on_release(low_us))
            .unwrap_or(false);

        if reset {
            let from = now + PRESENCE_DELAY_US;
            bus.device_low = (from, from + PRESENCE_LENGTH_US);
        }
    }

    fn sample(&mut self) -> bool {
        self.bus.borrow().level()
    }
}

pub struct MockTimer {
    bus: Rc<RefCell<Bus>>,
}

impl DeadlineTimer for MockTimer {
    fn arm(&mut self, us: u16) {
        let mut guard = self.bus.borrow_mut();
        let bus = &mut *guard;
        bus.deadline_us = Some(bus.now_us + us as u32);
        bus.armed_us = us;
    }

    fn expired(&mut self) -> bool {
        let mut guard = self.bus.borrow_mut();
        let bus = &mut *guard;
        if let Some(deadline) = bus.deadline_us {
            bus.longest_busy_wait_us = bus.longest_busy_wait_us.max(bus.armed_us);
            bus.now_us = bus.now_us.max(deadline);
        }
        true
    }

    fn disable(&mut self) {
        self.bus.borrow_mut().deadline_us = None;
    }
}

pub type SimEngine = SharedEngine<MockLine, MockTimer>;

#[derive(Clone)]
pub struct Sim {
    bus: Rc<RefCell<Bus>>,
}

impl Sim {
    pub fn new() -> Self {
        Self {
            bus: Rc::new(RefCell::new(Bus {
                now_us: 0,
                longest_busy_wait_us: 0,
                stuck: None,
                device: None,
                deadline_us: None,
                armed_us: 0,
                host_low: false,
                host_fell_at: 0,
                device_low: (0, 0),
            })),
        }
    }

    pub fn with_device(device: Device) -> Self {
        let sim = Self::new();
        sim.bus().device = Some(device);
        sim
    }

    pub fn bus(&self) -> RefMut<'_, Bus> {
        self.bus.borrow_mut()
    }

    pub fn device(&self) -> RefMut<'_, Device> {
        RefMut::map(self.bus.borrow_mut(), |bus| {
            bus.device.as_mut().expect("no device on the bus")
        })
    }

    pub fn shared(&self) -> SimEngine {
        SharedEngine::new(Engine::new(
            MockLine {
                bus: self.bus.clone(),
            },
            MockTimer {
                bus: self.bus.clone(),
            },
        ))
    }

    /// Delivers the pending timer interrupt, if any
    pub fn fire(&self, engine: &SimEngine) -> bool {
        let deadline = {
            let mut guard = self.bus.borrow_mut();
            let bus = &mut *guard;
            let deadline = bus.deadline_us.take();
            if let Some(deadline) = deadline {
                bus.now_us = bus.now_us.max(deadline);
            }
            deadline
        };

        if deadline.is_some() {
            engine.on_timer_interrupt();
        }

        deadline.is_some()
    }

    /// Runs the transfer in flight to completion
    pub fn run(&self, engine: &SimEngine) {
        for _ in 0..10_000 {
            if !self.fire(engine) {
                return;
            }
        }

        panic!("transfer never finished");
    }
}
