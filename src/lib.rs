#![deny(missing_docs)]

//! dlfind-rs - Rust host bindings for the DL-FIND geometry optimizer
//!
//! DL-FIND is a Fortran optimizer for minima, transition states, minimum
//! energy crossing points and reaction paths. It owns the optimization loop and
//! calls back into the host for everything it does not know: energies and
//! gradients, Hessians, its run-time configuration, and where to report the
//! structures it produces. This crate is the layer between the two.
//!
//! # Overview
//!
//! One run is a single blocking call into the engine. During that call the
//! engine invokes seven callbacks, any number of times, on the calling thread:
//!
//! | Callback | Host side |
//! |----------|-----------|
//! | get-params | [`ConfigurationInjector`] writes a sparse [`DlfParams`] record |
//! | get-gradient | [`Evaluation`] from a closure over the coordinates |
//! | get-multistate-gradients | [`MultistateEvaluation`] for two states |
//! | get-hessian | `nvar × nvar` matrix |
//! | put-coords | [`CoordinateReport`], e.g. into a [`Trajectory`] |
//! | error, update | bare notifications |
//!
//! Raw engine memory is wrapped in [`BufferView`]s and handed to host code as
//! nalgebra views with one column per atom, so no copy is made on the way in
//! and results are written straight into the engine's arrays on the way out.
//!
//! # Run lifecycle
//!
//! ```text
//! RunBuilder --prepare()--> PreparedRun --run(engine)--> RunSummary
//! ```
//!
//! All size and configuration errors are reported by [`RunBuilder::prepare`].
//! Once the engine is running, a failure in host code cannot be reported back
//! to it; the process logs the failure and aborts.
//!
//! # Quick Start
//!
//! ```no_run
//! use dlfind::{Callbacks, DlfParams, Evaluation, RunBuilder, Trajectory};
//!
//! # #[cfg(feature = "link")]
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let params = DlfParams::standard(vec![[0.0, 0.0, 0.0], [0.0, 0.0, 0.9]])
//!         .iopt(3)
//!         .tolerance(4.5e-4);
//!
//!     let mut trajectory = Trajectory::new();
//!     let callbacks = Callbacks::new()
//!         .gradient(|coords, _image, _iteration| Evaluation {
//!             energy: coords.norm_squared(),
//!             gradient: coords * 2.0,
//!         })
//!         .put_coords(|report| trajectory.record(report));
//!
//!     let summary = RunBuilder::new(params)
//!         .callbacks(callbacks)
//!         .prepare()?
//!         .run(&mut dlfind::engine::LinkedDlFind)?;
//!     println!("{} gradient evaluations", summary.stats.gradient);
//!     Ok(())
//! }
//! # #[cfg(not(feature = "link"))]
//! # fn main() {}
//! ```
//!
//! # Modules
//!
//! - [`buffer`] - Typed views over engine memory
//! - [`contracts`] - Binary signatures and the callback table
//! - [`callbacks`] - Host callback registration
//! - [`params`] - The configuration record and its field table
//! - [`injector`] - Configuration injection
//! - [`engine`] - Run preparation and the engine call
//! - [`settings`] - INI-file configuration
//! - [`trajectory`] - Recording reported structures
//!
//! # Features
//!
//! - `link`: links `libdlfind` and provides [`engine::LinkedDlFind`].

mod adapters;
pub mod buffer;
/// Host callback registration
pub mod callbacks;
pub mod contracts;
pub mod engine;
pub mod injector;
pub mod params;
/// Configuration management system
pub mod settings;
pub mod trajectory;

pub use adapters::CallStats;
pub use buffer::{BufferView, BufferViewMut, Coordinates, NumericKind};
pub use callbacks::{Callbacks, CoordinateReport, Evaluation, MultistateEvaluation};
pub use contracts::CallbackTable;
pub use engine::{Engine, PreparedRun, RunBuilder, RunError, RunParameters, RunSummary};
pub use injector::{ArraySizes, ConfigurationInjector};
pub use params::{DlfParams, ParamSlots, ParamValue, ParamsError};
pub use trajectory::Trajectory;
