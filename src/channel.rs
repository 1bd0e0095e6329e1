//! Single-slot rendezvous between a client (host gateway, battery logic) and
//! the session arbiter.
//!
//! The client fills the slot and raises `request_new`; the arbiter claims it,
//! runs the transfer, writes the received bytes back into the slot and raises
//! `request_completed`. The client may not submit again before it has taken
//! the response. Channels are meant to live in `static`s.

use core::cell::RefCell;

use critical_section::Mutex;

use crate::error::{Error, ErrorFlags, Result};
use crate::transport::{TransferBuffer, TRANSFER_CAPACITY};

struct Slot {
    buffer: TransferBuffer,
    tx_len: u8,
    rx_len: u8,
    request_new: bool,
    request_completed: bool,
    error: ErrorFlags,
    outstanding: bool,
}

/// A request as handed to the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    pub buffer: TransferBuffer,
    pub tx_len: usize,
    pub rx_len: usize,
}

/// What the client gets back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    buffer: TransferBuffer,
    rx_len: u8,
    error: ErrorFlags,
}

impl Response {
    pub(crate) fn new(buffer: TransferBuffer, rx_len: u8, error: ErrorFlags) -> Self {
        Self {
            buffer,
            rx_len,
            error,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.rx_len as usize]
    }

    pub fn error(&self) -> ErrorFlags {
        self.error
    }

    /// Turns a response carrying a rejecting error into `Err`
    pub fn into_result(self) -> Result<Self> {
        if self.error.intersects(ErrorFlags::REJECTING) {
            Err(Error::Rejected(self.error))
        } else {
            Ok(self)
        }
    }
}

pub struct RequestChannel {
    slot: Mutex<RefCell<Slot>>,
}

impl RequestChannel {
    pub const fn new() -> Self {
        Self {
            slot: Mutex::new(RefCell::new(Slot {
                buffer: TransferBuffer::new(),
                tx_len: 0,
                rx_len: 0,
                request_new: false,
                request_completed: false,
                error: ErrorFlags::empty(),
                outstanding: false,
            })),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Slot) -> R) -> R {
        critical_section::with(|cs| f(&mut self.slot.borrow_ref_mut(cs)))
    }

    /// Client side: hands over `request` and asks for `rx_len` bytes back
    pub fn submit(&self, request: &[u8], rx_len: usize) -> Result<()> {
        if rx_len > TRANSFER_CAPACITY {
            return Err(Error::BufferOverflow);
        }
        let buffer = TransferBuffer::from_slice(request)?;

        self.with(|slot| {
            if slot.outstanding {
                return Err(Error::RequestPending);
            }

            slot.buffer = buffer;
            slot.tx_len = request.len() as u8;
            slot.rx_len = rx_len as u8;
            slot.error = ErrorFlags::empty();
            slot.request_completed = false;
            slot.outstanding = true;
            // last, the arbiter may look at it from now on
            slot.request_new = true;

            Ok(())
        })
    }

    pub fn is_completed(&self) -> bool {
        self.with(|slot| slot.request_completed)
    }

    /// True from submit until the response has been taken
    pub fn is_outstanding(&self) -> bool {
        self.with(|slot| slot.outstanding)
    }

    /// Client side: collects the response, freeing the channel
    pub fn take_response(&self) -> Option<Response> {
        self.with(|slot| {
            if !slot.request_completed {
                return None;
            }

            slot.request_completed = false;
            slot.outstanding = false;

            Some(Response::new(slot.buffer, slot.rx_len, slot.error))
        })
    }

    /// True while the request waits to be picked up by the arbiter
    pub fn has_request(&self) -> bool {
        self.with(|slot| slot.request_new)
    }

    /// Arbiter side: takes the new request, if there is one
    pub(crate) fn claim(&self) -> Option<PendingRequest> {
        self.with(|slot| {
            if !slot.request_new {
                return None;
            }

            slot.request_new = false;
            slot.request_completed = false;

            Some(PendingRequest {
                buffer: slot.buffer,
                tx_len: slot.tx_len as usize,
                rx_len: slot.rx_len as usize,
            })
        })
    }

    /// Arbiter side: answers the claimed request. `received` replaces the
    /// start of the buffer
    pub(crate) fn complete(&self, received: &[u8], error: ErrorFlags) {
        self.with(|slot| {
            let len = received.len().min(TRANSFER_CAPACITY);
            slot.buffer[..len].copy_from_slice(&received[..len]);
            slot.error = error;
            slot.request_completed = true;
        })
    }

    /// Arbiter side: refuses a request without touching the bus
    pub(crate) fn reject(&self, error: ErrorFlags) -> bool {
        match self.claim() {
            Some(_) => {
                self.complete(&[], error);
                true
            }
            None => false,
        }
    }
}

impl Default for RequestChannel {
    fn default() -> Self {
        Self::new()
    }
}
