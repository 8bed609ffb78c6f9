//! Host-side callback registration.
//!
//! The host supplies plain Rust closures working on shaped nalgebra data;
//! [`Callbacks`] collects them into the six host-facing slots of a run (the
//! seventh, get-params, is always the configuration injector). Each slot is a
//! [`Callback`]: either [`Callback::Noop`] or a boxed host function. The choice
//! is made at registration time and decides which function pointer the engine
//! receives.
//!
//! # Examples
//!
//! ```
//! use dlfind::callbacks::{Callbacks, Evaluation};
//!
//! let mut energies = Vec::new();
//! let callbacks = Callbacks::new()
//!     .gradient(|coords, _image, _iteration| Evaluation {
//!         energy: coords.norm_squared(),
//!         gradient: coords * 2.0,
//!     })
//!     .put_coords(|report| energies.push(report.energy));
//!
//! assert!(!callbacks.has_hessian());
//! assert!(callbacks.has_evaluator());
//! ```

use crate::buffer::Coordinates;
use nalgebra::{DMatrix, Matrix3xX};
use std::fmt;

/// Result of a single-state energy and gradient evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// Energy
    pub energy: f64,
    /// Gradient, one column per atom
    pub gradient: Matrix3xX<f64>,
}

/// Result of a two-state evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct MultistateEvaluation {
    /// Energies of the two states
    pub energies: [f64; 2],
    /// Gradients of the two states, one column per atom
    pub gradients: [Matrix3xX<f64>; 2],
    /// Interstate coupling. Only written when the engine asks for it; a
    /// requested but missing coupling is written as zeros.
    pub coupling: Option<Matrix3xX<f64>>,
}

/// A structure reported by the engine through put-coords.
#[derive(Debug, Clone, Copy)]
pub struct CoordinateReport<'a> {
    /// Engine-defined discriminator, forwarded unchanged
    pub switch: i32,
    /// Energy of the structure
    pub energy: f64,
    /// Coordinates, one column per atom
    pub coords: Coordinates<'a>,
    /// Master flag of the reporting task, forwarded unchanged
    pub iam: i32,
}

impl CoordinateReport<'_> {
    /// Whether the reporting task is the master of a parallel run.
    pub fn is_master(&self) -> bool {
        self.iam != 0
    }
}

/// Host error-report hook.
pub type ErrorHook<'a> = dyn FnMut() + 'a;
/// Host gradient evaluator: coordinates, image index, iteration index.
pub type GradientFn<'a> = dyn FnMut(Coordinates<'_>, i32, i32) -> Evaluation + 'a;
/// Host Hessian evaluator.
pub type HessianFn<'a> = dyn FnMut(Coordinates<'_>) -> DMatrix<f64> + 'a;
/// Host two-state evaluator: coordinates, coupling requested, image index.
pub type MultistateFn<'a> = dyn FnMut(Coordinates<'_>, bool, i32) -> MultistateEvaluation + 'a;
/// Host coordinate sink.
pub type CoordinateSink<'a> = dyn FnMut(CoordinateReport<'_>) + 'a;
/// Host update hook.
pub type UpdateHook<'a> = dyn FnMut() + 'a;

/// One callback slot.
pub enum Callback<F: ?Sized> {
    /// Nothing registered; the engine gets a function that does nothing.
    Noop,
    /// A host function.
    Host(Box<F>),
}

impl<F: ?Sized> Callback<F> {
    /// Whether the slot is empty.
    pub fn is_noop(&self) -> bool {
        matches!(self, Callback::Noop)
    }

    pub(crate) fn host_mut(&mut self) -> Option<&mut F> {
        match self {
            Callback::Noop => None,
            Callback::Host(f) => Some(f.as_mut()),
        }
    }
}

impl<F: ?Sized> Default for Callback<F> {
    fn default() -> Self {
        Callback::Noop
    }
}

impl<F: ?Sized> fmt::Debug for Callback<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Callback::Noop => write!(f, "Noop"),
            Callback::Host(_) => write!(f, "Host(..)"),
        }
    }
}

/// The host functions of one run.
///
/// Closures may borrow from the caller's stack for `'a`; the run only lives
/// as long as the borrow.
#[derive(Debug, Default)]
pub struct Callbacks<'a> {
    pub(crate) error: Callback<ErrorHook<'a>>,
    pub(crate) gradient: Callback<GradientFn<'a>>,
    pub(crate) hessian: Callback<HessianFn<'a>>,
    pub(crate) multistate: Callback<MultistateFn<'a>>,
    pub(crate) put_coords: Callback<CoordinateSink<'a>>,
    pub(crate) update: Callback<UpdateHook<'a>>,
}

impl<'a> Callbacks<'a> {
    /// All slots empty.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the error-report hook.
    pub fn on_error(mut self, f: impl FnMut() + 'a) -> Self {
        self.error = Callback::Host(Box::new(f));
        self
    }

    /// Registers the single-state evaluator.
    pub fn gradient(
        mut self,
        f: impl FnMut(Coordinates<'_>, i32, i32) -> Evaluation + 'a,
    ) -> Self {
        self.gradient = Callback::Host(Box::new(f));
        self
    }

    /// Registers the Hessian evaluator. The returned matrix must be
    /// `nvar × nvar`.
    pub fn hessian(mut self, f: impl FnMut(Coordinates<'_>) -> DMatrix<f64> + 'a) -> Self {
        self.hessian = Callback::Host(Box::new(f));
        self
    }

    /// Registers the two-state evaluator.
    pub fn multistate(
        mut self,
        f: impl FnMut(Coordinates<'_>, bool, i32) -> MultistateEvaluation + 'a,
    ) -> Self {
        self.multistate = Callback::Host(Box::new(f));
        self
    }

    /// Registers the coordinate sink.
    pub fn put_coords(mut self, f: impl FnMut(CoordinateReport<'_>) + 'a) -> Self {
        self.put_coords = Callback::Host(Box::new(f));
        self
    }

    /// Registers the update hook.
    pub fn on_update(mut self, f: impl FnMut() + 'a) -> Self {
        self.update = Callback::Host(Box::new(f));
        self
    }

    /// Whether a gradient or a two-state evaluator is registered.
    pub fn has_evaluator(&self) -> bool {
        !self.gradient.is_noop() || !self.multistate.is_noop()
    }

    /// Whether a Hessian evaluator is registered.
    pub fn has_hessian(&self) -> bool {
        !self.hessian.is_noop()
    }

    /// Whether a coordinate sink is registered.
    pub fn has_coordinate_sink(&self) -> bool {
        !self.put_coords.is_noop()
    }
}
