//! Binary calling contracts of the seven engine callbacks.
//!
//! Argument order, numeric kind and direction of every signature here must
//! match the engine's `bind(c)` interfaces exactly. Floating values are
//! `c_double`, counts, flags and status codes are `c_int`; scalars documented
//! as `value` are passed by value, everything else by pointer.

use crate::adapters;
use crate::callbacks::Callbacks;
use std::os::raw::{c_double, c_int};

pub use crate::params::GetParamsFn;

/// `dlf_error()`: the engine hit an unrecoverable error.
pub type ErrorFn = unsafe extern "C" fn();

/// `dlf_get_gradient(nvar, coords(nvar), energy, gradient(nvar), iimage, kiter, status)`
pub type GetGradientFn = unsafe extern "C" fn(
    nvar: c_int,
    coords: *const c_double,
    energy: *mut c_double,
    gradient: *mut c_double,
    iimage: c_int,
    kiter: c_int,
    status: *mut c_int,
);

/// `dlf_get_hessian(nvar, coords(nvar), hessian(nvar, nvar), status)`
pub type GetHessianFn = unsafe extern "C" fn(
    nvar: c_int,
    coords: *const c_double,
    hessian: *mut c_double,
    status: *mut c_int,
);

/// `dlf_get_multistate_gradients(nvar, coords(nvar), energy(2), gradient(nvar, 2),
/// coupling(nvar), needcoupling, iimage, status)`
pub type GetMultistateGradientsFn = unsafe extern "C" fn(
    nvar: c_int,
    coords: *const c_double,
    energy: *mut c_double,
    gradient: *mut c_double,
    coupling: *mut c_double,
    needcoupling: c_int,
    iimage: c_int,
    status: *mut c_int,
);

/// `dlf_put_coords(nvar, switch, energy, coords(nvar), iam)`
pub type PutCoordsFn = unsafe extern "C" fn(
    nvar: c_int,
    switch: c_int,
    energy: c_double,
    coords: *const c_double,
    iam: c_int,
);

/// `dlf_update()`: bare notification.
pub type UpdateFn = unsafe extern "C" fn();

/// The seven function pointers handed to the engine for one run.
#[derive(Clone, Copy)]
pub struct CallbackTable {
    /// Error report
    pub error: ErrorFn,
    /// Single-state energy and gradient
    pub get_gradient: GetGradientFn,
    /// Hessian
    pub get_hessian: GetHessianFn,
    /// Two-state energies, gradients and coupling
    pub get_multistate_gradients: GetMultistateGradientsFn,
    /// Run-time configuration
    pub get_params: GetParamsFn,
    /// Coordinate reports
    pub put_coords: PutCoordsFn,
    /// Update notification
    pub update: UpdateFn,
}

impl CallbackTable {
    /// Builds the table for one run.
    ///
    /// Evaluator slots left empty get an inert function that writes nothing.
    /// The notification slots (error, put-coords, update) and get-params
    /// always go through their adapters, so every such invocation is logged
    /// and counted; an empty notification slot only skips the host call.
    pub(crate) fn for_callbacks(callbacks: &Callbacks<'_>) -> Self {
        Self {
            error: adapters::error,
            get_gradient: if callbacks.gradient.is_noop() {
                noop::get_gradient
            } else {
                adapters::get_gradient
            },
            get_hessian: if callbacks.hessian.is_noop() {
                noop::get_hessian
            } else {
                adapters::get_hessian
            },
            get_multistate_gradients: if callbacks.multistate.is_noop() {
                noop::get_multistate_gradients
            } else {
                adapters::get_multistate_gradients
            },
            get_params: crate::params::get_params_adapter,
            put_coords: adapters::put_coords,
            update: adapters::update,
        }
    }
}

impl std::fmt::Debug for CallbackTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackTable")
            .field("error", &(self.error as usize))
            .field("get_gradient", &(self.get_gradient as usize))
            .field("get_hessian", &(self.get_hessian as usize))
            .field(
                "get_multistate_gradients",
                &(self.get_multistate_gradients as usize),
            )
            .field("get_params", &(self.get_params as usize))
            .field("put_coords", &(self.put_coords as usize))
            .field("update", &(self.update as usize))
            .finish()
    }
}

/// Registered for evaluator slots the host left empty. They touch no engine
/// memory, not even the status code.
pub(crate) mod noop {
    use log::warn;
    use std::os::raw::{c_double, c_int};

    pub(crate) unsafe extern "C" fn get_gradient(
        _nvar: c_int,
        _coords: *const c_double,
        _energy: *mut c_double,
        _gradient: *mut c_double,
        _iimage: c_int,
        _kiter: c_int,
        _status: *mut c_int,
    ) {
        warn!("engine invoked get_gradient but no gradient evaluator is registered");
    }

    pub(crate) unsafe extern "C" fn get_hessian(
        _nvar: c_int,
        _coords: *const c_double,
        _hessian: *mut c_double,
        _status: *mut c_int,
    ) {
        warn!("engine invoked get_hessian but no Hessian evaluator is registered");
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) unsafe extern "C" fn get_multistate_gradients(
        _nvar: c_int,
        _coords: *const c_double,
        _energy: *mut c_double,
        _gradient: *mut c_double,
        _coupling: *mut c_double,
        _needcoupling: c_int,
        _iimage: c_int,
        _status: *mut c_int,
    ) {
        warn!("engine invoked get_multistate_gradients but no multistate evaluator is registered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::Evaluation;
    use nalgebra::Matrix3xX;

    #[test]
    fn test_empty_notification_slots_still_use_adapters() {
        let table = CallbackTable::for_callbacks(&Callbacks::new());
        assert_eq!(table.error as usize, adapters::error as usize);
        assert_eq!(table.put_coords as usize, adapters::put_coords as usize);
        assert_eq!(table.update as usize, adapters::update as usize);
        assert_eq!(table.get_gradient as usize, noop::get_gradient as usize);
        assert_eq!(table.get_hessian as usize, noop::get_hessian as usize);
    }

    #[test]
    fn test_registered_evaluator_uses_adapter() {
        let callbacks = Callbacks::new().gradient(|coords, _, _| Evaluation {
            energy: 0.0,
            gradient: Matrix3xX::zeros(coords.ncols()),
        });
        let table = CallbackTable::for_callbacks(&callbacks);
        assert_eq!(table.get_gradient as usize, adapters::get_gradient as usize);
        assert_eq!(
            table.get_multistate_gradients as usize,
            noop::get_multistate_gradients as usize
        );
    }
}
