//! Events delivered to waiting tasks and the packed callback-result format.

use crate::{Error, Result};

/// The code identifying an [`Event`] at the ABI boundary.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum EventCode {
    None = 0,
    Subtask = 1,
    Transmit = 2,
    TaskCancelled = 3,
}

/// An event observed by a task waiting on, or polling, a waitable set.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// Nothing happened; returned by polls and yields.
    None,
    /// A subtask joined to the set changed status.
    Subtask { handle: u32, status: u32 },
    /// A stream or future end joined to the set finished a copy.
    Transmit { handle: u32, code: u32 },
    /// The waiting task was cancelled.
    TaskCancelled,
}

impl Event {
    pub fn code(&self) -> EventCode {
        match self {
            Event::None => EventCode::None,
            Event::Subtask { .. } => EventCode::Subtask,
            Event::Transmit { .. } => EventCode::Transmit,
            Event::TaskCancelled => EventCode::TaskCancelled,
        }
    }

    /// Splits this event into the code and the two payload words that are
    /// written out to the component.
    pub fn parts(self) -> (EventCode, u32, u32) {
        match self {
            Event::None => (EventCode::None, 0, 0),
            Event::Subtask { handle, status } => (EventCode::Subtask, handle, status),
            Event::Transmit { handle, code } => (EventCode::Transmit, handle, code),
            Event::TaskCancelled => (EventCode::TaskCancelled, 0, 0),
        }
    }
}

/// What a callback-lifted export asks the runtime to do next.
///
/// This lives in the low 4 bits of the value a callback returns; see
/// [`unpack_callback_result`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CallbackCode {
    Exit = 0,
    Yield = 1,
    Wait = 2,
    Poll = 3,
}

impl CallbackCode {
    pub fn from_u32(code: u32) -> Result<CallbackCode> {
        Ok(match code {
            0 => CallbackCode::Exit,
            1 => CallbackCode::Yield,
            2 => CallbackCode::Wait,
            3 => CallbackCode::Poll,
            other => return Err(Error::InvalidCallbackCode(other)),
        })
    }
}

const CODE_BITS: u32 = 4;
const CODE_MASK: u32 = (1 << CODE_BITS) - 1;

/// Packs a callback code and waitable set index into the 32-bit value a
/// callback returns.
///
/// The low 4 bits hold the code while the upper 28 bits hold the set index.
pub fn pack_callback_result(code: CallbackCode, waitable_set: u32) -> Result<u32> {
    if waitable_set >= 1 << (32 - CODE_BITS) {
        return Err(Error::WaitableSetIndexOutOfRange(waitable_set));
    }
    Ok((waitable_set << CODE_BITS) | code as u32)
}

/// Splits the value returned by a callback into its code and waitable set
/// index.
///
/// The value must lie in the `u32` range, and its code must be one of the
/// four [`CallbackCode`]s.
pub fn unpack_callback_result(result: i64) -> Result<(CallbackCode, u32)> {
    let result = u32::try_from(result).map_err(|_| Error::InvalidCallbackResult(result))?;
    let code = CallbackCode::from_u32(result & CODE_MASK)?;
    Ok((code, result >> CODE_BITS))
}
