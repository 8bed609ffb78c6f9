//! Engine invocation boundary.
//!
//! A run moves through three stages:
//!
//! * [`RunBuilder`] collects the configuration record, the host callbacks and
//!   optional size overrides.
//! * [`PreparedRun`] holds a validated injector and the derived
//!   [`RunParameters`]; every size error has been reported by now.
//! * [`PreparedRun::run`] publishes the run context, builds the
//!   [`CallbackTable`], makes the one blocking engine call and returns a
//!   [`RunSummary`].
//!
//! The engine itself is abstracted behind [`Engine`] so the boundary can be
//! driven by the linked Fortran library (feature `link`) or by any closure that
//! plays the engine's role.

use crate::adapters::{self, ActiveRun, CallStats, RunContext};
use crate::callbacks::Callbacks;
use crate::contracts::CallbackTable;
use crate::injector::{ArraySizes, ConfigurationInjector};
use crate::params::{DlfParams, ParamsError};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::os::raw::c_int;
use thiserror::Error;

/// Errors that can occur when preparing or starting a run
#[derive(Error, Debug)]
pub enum RunError {
    /// The configuration record does not fit the run
    #[error("Invalid run configuration: {0}")]
    Params(#[from] ParamsError),

    /// Neither a gradient nor a two-state evaluator was registered
    #[error("No energy evaluator registered; register a gradient or multistate callback")]
    MissingEvaluator,

    /// Another run is in flight on this thread
    #[error("An optimization run is already in progress on this thread")]
    AlreadyRunning,
}

/// Result type for run operations
pub type Result<T> = std::result::Result<T, RunError>;

/// The four scalars of the engine entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunParameters {
    /// Length of the primary coordinate array (3 × atoms)
    pub nvar: usize,
    /// Length of the secondary coordinate array
    pub nvar2: usize,
    /// Length of the atom classification array
    pub nspec: usize,
    /// Whether this process is the master of a parallel run
    pub master: bool,
}

impl RunParameters {
    /// Array sizes in injector terms.
    pub fn sizes(&self) -> ArraySizes {
        ArraySizes {
            nvar: self.nvar,
            nvar2: self.nvar2,
            nspec: self.nspec,
        }
    }

    /// Entry point arguments as C integers: `nvarin`, `nvarin2`, `nspec`,
    /// `master`.
    pub fn to_c(&self) -> std::result::Result<[c_int; 4], ParamsError> {
        Ok([
            to_c_int("nvar", self.nvar)?,
            to_c_int("nvar2", self.nvar2)?,
            to_c_int("nspec", self.nspec)?,
            c_int::from(self.master),
        ])
    }
}

fn to_c_int(what: &'static str, value: usize) -> std::result::Result<c_int, ParamsError> {
    c_int::try_from(value).map_err(|_| ParamsError::SizeOverflow { what, value })
}

/// The optimizer behind the boundary.
///
/// An implementation makes exactly one blocking call into the engine; the
/// engine may invoke any function of `table` any number of times, synchronously
/// and on the calling thread, before returning.
pub trait Engine {
    /// Runs the optimization.
    fn dl_find(&mut self, parameters: &RunParameters, table: &CallbackTable);
}

impl<F> Engine for F
where
    F: FnMut(&RunParameters, &CallbackTable),
{
    fn dl_find(&mut self, parameters: &RunParameters, table: &CallbackTable) {
        self(parameters, table)
    }
}

/// The linked DL-FIND library.
#[cfg(feature = "link")]
#[derive(Debug, Default, Clone, Copy)]
pub struct LinkedDlFind;

#[cfg(feature = "link")]
mod ffi {
    use crate::contracts::{
        ErrorFn, GetGradientFn, GetHessianFn, GetMultistateGradientsFn, GetParamsFn, PutCoordsFn,
        UpdateFn,
    };
    use std::os::raw::c_int;

    #[link(name = "dlfind")]
    extern "C" {
        #[allow(clippy::too_many_arguments)]
        pub(super) fn api_dl_find(
            nvarin: c_int,
            nvarin2: c_int,
            nspec: c_int,
            master: c_int,
            dlf_error: ErrorFn,
            dlf_get_gradient: GetGradientFn,
            dlf_get_hessian: GetHessianFn,
            dlf_get_multistate_gradients: GetMultistateGradientsFn,
            dlf_get_params: GetParamsFn,
            dlf_put_coords: PutCoordsFn,
            dlf_update: UpdateFn,
        );
    }
}

#[cfg(feature = "link")]
impl Engine for LinkedDlFind {
    fn dl_find(&mut self, parameters: &RunParameters, table: &CallbackTable) {
        // Sizes were range-checked when the run was prepared.
        let [nvar, nvar2, nspec, master] = match parameters.to_c() {
            Ok(args) => args,
            Err(e) => {
                log::error!("Refusing to start DL-FIND: {}", e);
                return;
            }
        };
        // SAFETY: every pointer in `table` follows its binary contract and
        // stays valid for the duration of the call.
        unsafe {
            ffi::api_dl_find(
                nvar,
                nvar2,
                nspec,
                master,
                table.error,
                table.get_gradient,
                table.get_hessian,
                table.get_multistate_gradients,
                table.get_params,
                table.put_coords,
                table.update,
            );
        }
    }
}

/// Collects what one run needs.
///
/// # Examples
///
/// ```
/// use dlfind::callbacks::{Callbacks, Evaluation};
/// use dlfind::engine::RunBuilder;
/// use dlfind::params::DlfParams;
/// use nalgebra::Matrix3xX;
///
/// let params = DlfParams::new(vec![[0.0, 0.0, 0.0], [0.0, 0.0, 0.74]]);
/// let prepared = RunBuilder::new(params)
///     .callbacks(Callbacks::new().gradient(|coords, _, _| Evaluation {
///         energy: 0.0,
///         gradient: Matrix3xX::zeros(coords.ncols()),
///     }))
///     .prepare()
///     .unwrap();
///
/// assert_eq!(prepared.parameters().nvar, 6);
/// assert_eq!(prepared.parameters().nspec, 4);
/// ```
#[derive(Debug)]
pub struct RunBuilder<'a> {
    params: DlfParams,
    callbacks: Callbacks<'a>,
    nvar2: Option<usize>,
    nspec: Option<usize>,
    master: bool,
}

impl<'a> RunBuilder<'a> {
    /// Starts a run from a configuration record.
    pub fn new(params: DlfParams) -> Self {
        Self {
            params,
            callbacks: Callbacks::new(),
            nvar2: None,
            nspec: None,
            master: true,
        }
    }

    /// Host functions for the run.
    pub fn callbacks(mut self, callbacks: Callbacks<'a>) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Overrides the secondary coordinate array length.
    pub fn secondary_len(mut self, nvar2: usize) -> Self {
        self.nvar2 = Some(nvar2);
        self
    }

    /// Overrides the classification array length.
    pub fn classification_len(mut self, nspec: usize) -> Self {
        self.nspec = Some(nspec);
        self
    }

    /// Master flag of this process. Defaults to `true`.
    pub fn master(mut self, master: bool) -> Self {
        self.master = master;
        self
    }

    /// Derives the run parameters and validates the record against them.
    ///
    /// `nvar` is three times the atom count. `nvar2` and `nspec` default to the
    /// lengths of `coords2` and `spec`, or to 0 and twice the atom count when
    /// those arrays are absent.
    ///
    /// # Returns
    ///
    /// Returns a `Result` containing:
    /// - `Ok(PreparedRun)` - Every array matches the sizes the engine will see
    /// - `Err(RunError::Params)` - Missing or empty coordinates, an array length
    ///   that disagrees with an override, or a size beyond 32 bits
    /// - `Err(RunError::MissingEvaluator)` - Neither a gradient nor a
    ///   multistate evaluator was registered
    ///
    /// # Examples
    ///
    /// ```
    /// use dlfind::engine::{RunBuilder, RunError};
    /// use dlfind::params::DlfParams;
    ///
    /// let err = RunBuilder::new(DlfParams::new(vec![[0.0; 3]]))
    ///     .prepare()
    ///     .unwrap_err();
    /// assert!(matches!(err, RunError::MissingEvaluator));
    /// ```
    pub fn prepare(self) -> Result<PreparedRun<'a>> {
        let natoms = match &self.params.coords {
            None => return Err(ParamsError::MissingCoordinates.into()),
            Some(coords) if coords.is_empty() => return Err(ParamsError::EmptyCoordinates.into()),
            Some(coords) => coords.len(),
        };
        let nvar = natoms
            .checked_mul(3)
            .ok_or(ParamsError::SizeOverflow {
                what: "nvar",
                value: natoms,
            })?;
        let nvar2 = self
            .nvar2
            .unwrap_or_else(|| self.params.coords2.as_ref().map_or(0, Vec::len));
        let nspec = self.nspec.unwrap_or_else(|| {
            self.params
                .spec
                .as_ref()
                .map_or(2 * natoms, Vec::len)
        });
        let parameters = RunParameters {
            nvar,
            nvar2,
            nspec,
            master: self.master,
        };
        parameters.to_c()?;

        if !self.callbacks.has_evaluator() {
            return Err(RunError::MissingEvaluator);
        }
        if !self.callbacks.has_coordinate_sink() {
            warn!("No put_coords callback registered; optimized structures will not be reported");
        }

        let injector = ConfigurationInjector::new(self.params, parameters.sizes())?;
        Ok(PreparedRun {
            parameters,
            callbacks: self.callbacks,
            injector,
        })
    }
}

/// A validated run, ready to hand to an engine.
#[derive(Debug)]
pub struct PreparedRun<'a> {
    parameters: RunParameters,
    callbacks: Callbacks<'a>,
    injector: ConfigurationInjector,
}

impl<'a> PreparedRun<'a> {
    /// Scalars that will be passed to the entry point.
    pub fn parameters(&self) -> &RunParameters {
        &self.parameters
    }

    /// The record that get-params will inject.
    pub fn params(&self) -> &DlfParams {
        self.injector.params()
    }

    /// Makes the blocking engine call.
    ///
    /// Every host callback registered for the run is invoked from inside this
    /// call, on this thread. Only one run may be in flight per thread. A panic
    /// inside a host callback is logged and aborts the process.
    ///
    /// # Arguments
    ///
    /// * `engine` - The optimizer: the linked library or any closure taking
    ///   `(&RunParameters, &CallbackTable)`
    ///
    /// # Returns
    ///
    /// Returns a `Result` containing:
    /// - `Ok(RunSummary)` - The engine returned; includes per-callback counts
    /// - `Err(RunError::AlreadyRunning)` - Called from inside another run
    ///
    /// # Examples
    ///
    /// ```
    /// use dlfind::callbacks::{Callbacks, Evaluation};
    /// use dlfind::contracts::CallbackTable;
    /// use dlfind::engine::{RunBuilder, RunParameters};
    /// use dlfind::params::DlfParams;
    /// use nalgebra::Matrix3xX;
    ///
    /// let prepared = RunBuilder::new(DlfParams::new(vec![[0.0; 3]]))
    ///     .callbacks(Callbacks::new().gradient(|coords, _, _| Evaluation {
    ///         energy: 0.0,
    ///         gradient: Matrix3xX::zeros(coords.ncols()),
    ///     }))
    ///     .prepare()
    ///     .unwrap();
    ///
    /// let summary = prepared
    ///     .run(&mut |_: &RunParameters, table: &CallbackTable| unsafe { (table.update)() })
    ///     .unwrap();
    /// assert_eq!(summary.stats.update, 1);
    /// ```
    pub fn run<E: Engine + ?Sized>(self, engine: &mut E) -> Result<RunSummary> {
        if adapters::run_in_flight() {
            return Err(RunError::AlreadyRunning);
        }
        let PreparedRun {
            parameters,
            callbacks,
            injector,
        } = self;

        let table = CallbackTable::for_callbacks(&callbacks);
        let mut context = RunContext::new(callbacks, injector);

        info!(
            "Starting DL-FIND: nvar={}, nvar2={}, nspec={}, master={}",
            parameters.nvar, parameters.nvar2, parameters.nspec, parameters.master
        );
        {
            let _active = ActiveRun::enter(&mut context).ok_or(RunError::AlreadyRunning)?;
            engine.dl_find(&parameters, &table);
        }

        let stats = context.stats;
        if stats.params == 0 {
            warn!("Engine returned without requesting its parameters");
        }
        info!(
            "DL-FIND returned after {} callbacks ({} gradient, {} multistate, {} hessian)",
            stats.total(),
            stats.gradient,
            stats.multistate,
            stats.hessian
        );
        Ok(RunSummary { parameters, stats })
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Scalars passed to the entry point
    pub parameters: RunParameters,
    /// Callback invocation counts
    pub stats: CallStats,
}
