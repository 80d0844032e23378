//! BrewOS C-MCU firmware: the connectivity half of the two-MCU espresso
//! controller. Talks to the RT-MCU over the framed protocol, holds the
//! display-facing runtime snapshot, persists user-facing state, and carries
//! the SWD recovery flasher used to recover an unresponsive RT-MCU.
//!
//! Pure-logic modules build under `std` in `#[cfg(test)]` so they carry unit
//! tests without a target; the crate itself stays `no_std` for firmware
//! builds.

#![cfg_attr(not(test), no_std)]

pub mod external;
pub mod link;
pub mod runtime_state;
pub mod state_manager;
pub mod swd;
pub mod tasks;

/// Polls a future to completion without an executor, for host-side unit
/// tests of `async fn`s that only ever contend an uncontended
/// `embassy_sync::mutex::Mutex` and so resolve on the first poll. Not a
/// general-purpose executor: it spins on `Poll::Pending` rather than parking,
/// which is fine for tests and wrong for firmware.
#[cfg(test)]
pub(crate) fn block_on<F: core::future::Future>(mut fut: F) -> F::Output {
    use core::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

    fn noop(_: *const ()) {}
    fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(core::ptr::null(), &VTABLE)
    }
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);

    let waker = unsafe { Waker::from_raw(RawWaker::new(core::ptr::null(), &VTABLE)) };
    let mut cx = Context::from_waker(&waker);
    // SAFETY: `fut` is a local, never moved after this point.
    let mut fut = unsafe { core::pin::Pin::new_unchecked(&mut fut) };
    loop {
        if let Poll::Ready(out) = fut.as_mut().poll(&mut cx) {
            return out;
        }
    }
}
