//! Extern adapters invoked by the engine, and the run context they reach.
//!
//! The engine's callbacks carry no user-data pointer, so the host state of the
//! run in flight is published in a thread-local slot for the duration of the
//! single blocking engine call. Each adapter:
//!
//! 1. wraps the raw arguments in [`BufferView`]s of the contract's shapes,
//! 2. borrows the run context and calls the host function,
//! 3. writes the results back through the views,
//! 4. sets the status code to success.
//!
//! Nothing unwinds out of an adapter. A panic in a host function, or a broken
//! buffer contract, is logged and aborts the process, since the engine has no
//! channel for a failed callback.

use crate::buffer::{BufferView, BufferViewMut};
use crate::callbacks::{Callbacks, CoordinateReport};
use crate::injector::{ConfigurationInjector, ParamsRequest};
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::cell::Cell;
use std::ffi::c_void;
use std::marker::PhantomData;
use std::os::raw::{c_double, c_int};
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;

/// Number of times the engine invoked each callback during a run.
///
/// Notifications and get-params are counted whether or not the host
/// registered a function for them. Evaluator slots the host left empty are
/// served by an inert function outside the run context and are not counted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallStats {
    /// error-report
    pub error: usize,
    /// get-gradient
    pub gradient: usize,
    /// get-hessian
    pub hessian: usize,
    /// get-multistate-gradients
    pub multistate: usize,
    /// get-params
    pub params: usize,
    /// put-coords
    pub put_coords: usize,
    /// update
    pub update: usize,
}

impl CallStats {
    /// Total number of callback invocations.
    pub fn total(&self) -> usize {
        self.error
            + self.gradient
            + self.hessian
            + self.multistate
            + self.params
            + self.put_coords
            + self.update
    }
}

/// Host state of the run in flight.
pub(crate) struct RunContext<'a> {
    pub(crate) callbacks: Callbacks<'a>,
    pub(crate) injector: ConfigurationInjector,
    pub(crate) stats: CallStats,
}

impl<'a> RunContext<'a> {
    pub(crate) fn new(callbacks: Callbacks<'a>, injector: ConfigurationInjector) -> Self {
        Self {
            callbacks,
            injector,
            stats: CallStats::default(),
        }
    }

    fn expect_params(&self, callback: &str) {
        if self.stats.params == 0 {
            warn!("engine invoked {} before requesting its parameters", callback);
        }
    }
}

#[derive(Clone, Copy)]
enum Slot {
    Idle,
    Active(NonNull<c_void>),
    Dispatching,
}

thread_local! {
    static CURRENT: Cell<Slot> = const { Cell::new(Slot::Idle) };
}

/// Publishes a run context for the current thread while alive.
pub(crate) struct ActiveRun<'c> {
    _context: PhantomData<&'c mut ()>,
}

impl<'c> ActiveRun<'c> {
    /// Returns `None` if a run is already in flight on this thread.
    pub(crate) fn enter(context: &'c mut RunContext<'_>) -> Option<Self> {
        CURRENT.with(|slot| match slot.get() {
            Slot::Idle => {
                slot.set(Slot::Active(NonNull::from(context).cast()));
                Some(Self {
                    _context: PhantomData,
                })
            }
            Slot::Active(_) | Slot::Dispatching => None,
        })
    }
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        CURRENT.with(|slot| slot.set(Slot::Idle));
    }
}

/// Whether a run is in flight on the current thread.
pub(crate) fn run_in_flight() -> bool {
    CURRENT.with(|slot| !matches!(slot.get(), Slot::Idle))
}

/// Restores the published context when a dispatch ends.
struct DispatchGuard(NonNull<c_void>);

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        CURRENT.with(|slot| slot.set(Slot::Active(self.0)));
    }
}

/// Runs `f` with exclusive access to the context of the run in flight.
///
/// # Panics
///
/// Panics when no run is in flight or when a callback is re-entered while
/// another one is still executing.
fn dispatch<R>(callback: &str, f: impl FnOnce(&mut RunContext<'_>) -> R) -> R {
    let ptr = CURRENT.with(|slot| match slot.get() {
        Slot::Active(ptr) => {
            slot.set(Slot::Dispatching);
            ptr
        }
        Slot::Idle => panic!("engine invoked {} outside of a run", callback),
        Slot::Dispatching => panic!("engine re-entered {} from inside a callback", callback),
    });
    let _restore = DispatchGuard(ptr);
    debug!("dispatching {}", callback);
    // SAFETY: the pointer was published by `ActiveRun::enter` from a live
    // `&mut RunContext` whose borrow outlives the guard, and `Dispatching`
    // keeps this the only reference handed out.
    let context = unsafe { &mut *ptr.cast::<RunContext<'_>>().as_ptr() };
    f(context)
}

/// Runs an adapter body, turning any panic into a logged abort.
pub(crate) fn boundary<R>(callback: &str, f: impl FnOnce() -> R) -> R {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(payload) => {
            error!(
                "{} callback failed: {}; aborting the optimization run",
                callback,
                panic_message(payload.as_ref())
            );
            std::process::abort();
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic payload"
    }
}

/// Converts an engine-supplied count into a length.
pub(crate) fn engine_len(what: &str, value: c_int) -> usize {
    usize::try_from(value)
        .unwrap_or_else(|_| panic!("engine passed a negative {} ({})", what, value))
}

pub(crate) fn dispatch_params(request: &mut ParamsRequest<'_>) {
    dispatch("get_params", |ctx| {
        ctx.stats.params += 1;
        if ctx.stats.params > 1 {
            warn!(
                "engine requested parameters {} times; injecting the same record again",
                ctx.stats.params
            );
        }
        let injection = ctx.injector.inject(request);
        debug!(
            "injected {} arrays and {} scalar parameters",
            injection.arrays, injection.scalars
        );
    });
}

pub(crate) unsafe extern "C" fn error() {
    boundary("error", || {
        error!("engine reported an unrecoverable error");
        dispatch("error", |ctx| {
            ctx.stats.error += 1;
            if let Some(hook) = ctx.callbacks.error.host_mut() {
                hook();
            }
        });
    })
}

pub(crate) unsafe extern "C" fn get_gradient(
    nvar: c_int,
    coords: *const c_double,
    energy: *mut c_double,
    gradient: *mut c_double,
    iimage: c_int,
    kiter: c_int,
    status: *mut c_int,
) {
    boundary("get_gradient", || {
        let nvar = engine_len("nvar", nvar);
        let coords = unsafe { BufferView::from_raw(coords, nvar) };
        let mut gradient = unsafe { BufferViewMut::from_raw(gradient, nvar) };

        let evaluation = dispatch("get_gradient", |ctx| {
            ctx.stats.gradient += 1;
            ctx.expect_params("get_gradient");
            ctx.callbacks
                .gradient
                .host_mut()
                .map(|f| f(coords.atoms(), iimage, kiter))
        });

        if let Some(evaluation) = evaluation {
            gradient.atoms_mut().copy_from(&evaluation.gradient);
            unsafe { energy.write(evaluation.energy) };
        }
        unsafe { status.write(0) };
    })
}

pub(crate) unsafe extern "C" fn get_hessian(
    nvar: c_int,
    coords: *const c_double,
    hessian: *mut c_double,
    status: *mut c_int,
) {
    boundary("get_hessian", || {
        let nvar = engine_len("nvar", nvar);
        let len = nvar
            .checked_mul(nvar)
            .unwrap_or_else(|| panic!("hessian of dimension {} overflows", nvar));
        let coords = unsafe { BufferView::from_raw(coords, nvar) };
        let mut hessian = unsafe { BufferViewMut::from_raw(hessian, len) };

        let matrix = dispatch("get_hessian", |ctx| {
            ctx.stats.hessian += 1;
            ctx.expect_params("get_hessian");
            ctx.callbacks.hessian.host_mut().map(|f| f(coords.atoms()))
        });

        if let Some(matrix) = matrix {
            hessian.square_mut(nvar).copy_from(&matrix);
        }
        unsafe { status.write(0) };
    })
}

#[allow(clippy::too_many_arguments)]
pub(crate) unsafe extern "C" fn get_multistate_gradients(
    nvar: c_int,
    coords: *const c_double,
    energy: *mut c_double,
    gradient: *mut c_double,
    coupling: *mut c_double,
    needcoupling: c_int,
    iimage: c_int,
    status: *mut c_int,
) {
    boundary("get_multistate_gradients", || {
        let nvar = engine_len("nvar", nvar);
        let need_coupling = needcoupling != 0;
        let coords = unsafe { BufferView::from_raw(coords, nvar) };
        let mut energies = unsafe { BufferViewMut::from_raw(energy, 2) };
        let mut gradients = unsafe { BufferViewMut::from_raw(gradient, 2 * nvar) };

        let evaluation = dispatch("get_multistate_gradients", |ctx| {
            ctx.stats.multistate += 1;
            ctx.expect_params("get_multistate_gradients");
            ctx.callbacks
                .multistate
                .host_mut()
                .map(|f| f(coords.atoms(), need_coupling, iimage))
        });

        let mut host_coupling = None;
        if let Some(evaluation) = evaluation {
            energies.write_all(&evaluation.energies);
            let [mut first, mut second] = gradients.states_mut();
            first.copy_from(&evaluation.gradients[0]);
            second.copy_from(&evaluation.gradients[1]);
            host_coupling = evaluation.coupling;
        }

        if need_coupling {
            let mut coupling = unsafe { BufferViewMut::from_raw(coupling, nvar) };
            match host_coupling {
                Some(values) => coupling.atoms_mut().copy_from(&values),
                None => coupling.fill(0.0),
            }
        }
        unsafe { status.write(0) };
    })
}

pub(crate) unsafe extern "C" fn put_coords(
    nvar: c_int,
    switch: c_int,
    energy: c_double,
    coords: *const c_double,
    iam: c_int,
) {
    boundary("put_coords", || {
        let nvar = engine_len("nvar", nvar);
        let coords = unsafe { BufferView::from_raw(coords, nvar) };
        dispatch("put_coords", |ctx| {
            ctx.stats.put_coords += 1;
            if let Some(sink) = ctx.callbacks.put_coords.host_mut() {
                sink(CoordinateReport {
                    switch,
                    energy,
                    coords: coords.atoms(),
                    iam,
                });
            }
        });
    })
}

pub(crate) unsafe extern "C" fn update() {
    boundary("update", || {
        dispatch("update", |ctx| {
            ctx.stats.update += 1;
            if let Some(hook) = ctx.callbacks.update.host_mut() {
                hook();
            }
        });
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::injector::ArraySizes;
    use crate::params::DlfParams;

    fn context<'a>(callbacks: Callbacks<'a>) -> RunContext<'a> {
        let sizes = ArraySizes {
            nvar: 3,
            nvar2: 0,
            nspec: 2,
        };
        let injector = ConfigurationInjector::new(DlfParams::new(vec![[0.0; 3]]), sizes).unwrap();
        RunContext::new(callbacks, injector)
    }

    #[test]
    fn test_second_run_on_same_thread_is_refused() {
        let mut first = context(Callbacks::new());
        let mut second = context(Callbacks::new());
        let guard = ActiveRun::enter(&mut first).unwrap();
        assert!(run_in_flight());
        assert!(ActiveRun::enter(&mut second).is_none());
        drop(guard);
        assert!(!run_in_flight());
        assert!(ActiveRun::enter(&mut second).is_some());
    }

    #[test]
    fn test_dispatch_reaches_published_context() {
        let mut updates = 0;
        let mut ctx = context(Callbacks::new().on_update(|| updates += 1));
        {
            let _guard = ActiveRun::enter(&mut ctx).unwrap();
            unsafe {
                update();
                update();
            }
        }
        assert_eq!(ctx.stats.update, 2);
        assert_eq!(ctx.stats.total(), 2);
        drop(ctx);
        assert_eq!(updates, 2);
    }

    #[test]
    fn test_gradient_adapter_writes_outputs_and_status() {
        use crate::callbacks::Evaluation;
        use nalgebra::Matrix3xX;

        let mut ctx = context(Callbacks::new().gradient(|coords, image, iteration| {
            assert_eq!((image, iteration), (2, 7));
            Evaluation {
                energy: -1.25,
                gradient: Matrix3xX::from_fn(coords.ncols(), |i, _| coords[(i, 0)] * 2.0),
            }
        }));
        let coords = [1.0, 2.0, 3.0];
        let mut energy = f64::NAN;
        let mut gradient = [f64::NAN; 3];
        let mut status = -1;
        {
            let _guard = ActiveRun::enter(&mut ctx).unwrap();
            unsafe {
                get_gradient(
                    3,
                    coords.as_ptr(),
                    &mut energy,
                    gradient.as_mut_ptr(),
                    2,
                    7,
                    &mut status,
                );
            }
        }
        assert_eq!(energy, -1.25);
        assert_eq!(gradient, [2.0, 4.0, 6.0]);
        assert_eq!(status, 0);
        assert_eq!(ctx.stats.gradient, 1);
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(3u8);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }
}
