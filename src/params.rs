//! The sparse DL-FIND configuration record.
//!
//! DL-FIND asks for its run-time configuration exactly once, at the start of a
//! run, through a single callback with roughly eighty output arguments. Each
//! argument already holds the engine's compiled-in default when the callback
//! is entered, so the host only writes the values it actually wants to change.
//!
//! [`DlfParams`] mirrors that contract: every field is an `Option`, and `None`
//! means "leave the engine's slot untouched". The field list is declared once
//! in the `engine_params!` invocation below; the record, its builder setters,
//! the name table [`FIELDS`], the engine-side slot storage [`ParamSlots`], the
//! binary signature [`GetParamsFn`] and the extern adapter are all generated
//! from it, so the argument order of the binary contract lives in one place.
//!
//! # Examples
//!
//! ```
//! use dlfind::params::DlfParams;
//!
//! let mut params = DlfParams::new(vec![[0.0, 0.0, 0.0], [0.0, 0.0, 1.4]])
//!     .maxcycle(200)
//!     .tolerance(4.5e-4);
//! params.set_str("iopt", "3")?;
//! params.set("maxstep", 0.3)?;
//!
//! assert_eq!(params.iopt, Some(3));
//! assert_eq!(params.scalar_count(), 4);
//! # Ok::<(), dlfind::params::ParamsError>(())
//! ```

use crate::buffer::{BufferViewMut, Element, NumericKind};
use crate::injector::{ArraySizes, ParamsRequest};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::os::raw::{c_double, c_int};
use thiserror::Error;

/// Errors raised while building or validating a configuration record.
///
/// All of these are detected before the engine is entered.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParamsError {
    /// The name does not match any configuration field.
    #[error("unknown configuration field '{0}'")]
    UnknownField(String),
    /// A float was supplied for an integer field.
    #[error("field '{field}' expects an {expected} value, got {got}")]
    KindMismatch {
        /// Field name
        field: String,
        /// Kind declared by the binary contract
        expected: NumericKind,
        /// Kind of the supplied value
        got: NumericKind,
    },
    /// Text could not be parsed as the field's kind.
    #[error("invalid value '{value}' for field '{field}'")]
    InvalidValue {
        /// Field name
        field: String,
        /// Offending text
        value: String,
    },
    /// No starting geometry was supplied.
    #[error("primary coordinates are required")]
    MissingCoordinates,
    /// The starting geometry has no atoms.
    #[error("primary coordinates must contain at least one atom")]
    EmptyCoordinates,
    /// An array does not match the size the engine will be told about.
    #[error("{field} holds {actual} values but the engine expects {expected}")]
    LengthMismatch {
        /// Array name
        field: &'static str,
        /// Size passed to the engine
        expected: usize,
        /// Size of the supplied data
        actual: usize,
    },
    /// A size cannot be represented as a 32-bit engine integer.
    #[error("{what} = {value} does not fit in a 32-bit engine integer")]
    SizeOverflow {
        /// Which size
        what: &'static str,
        /// Requested value
        value: usize,
    },
}

/// A single scalar configuration value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    /// Integer value
    Int(i32),
    /// Floating-point value
    Float(f64),
}

impl ParamValue {
    /// Numeric kind of the value.
    pub fn kind(&self) -> NumericKind {
        match self {
            ParamValue::Int(_) => NumericKind::Int32,
            ParamValue::Float(_) => NumericKind::Float64,
        }
    }
}

impl From<i32> for ParamValue {
    fn from(value: i32) -> Self {
        ParamValue::Int(value)
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Float(value)
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{}", v),
            ParamValue::Float(v) => write!(f, "{:e}", v),
        }
    }
}

/// Name and numeric kind of one scalar configuration field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    /// Field name, identical to the engine's argument name
    pub name: &'static str,
    /// Numeric kind written into the engine slot
    pub kind: NumericKind,
}

lazy_static! {
    // Fortran double-precision literal: 1.0d-4, 2D3, -.5d+0
    static ref FORTRAN_FLOAT_RE: Regex =
        Regex::new(r"^([-+]?(?:\d+\.?\d*|\.\d+))[dD]([-+]?\d+)$").unwrap();
}

/// Conversions shared by the generated per-field code.
trait FieldValue: Element {
    fn from_value(field: &str, value: ParamValue) -> Result<Self, ParamsError>;
    fn to_value(self) -> ParamValue;
    fn parse_text(field: &str, text: &str) -> Result<Self, ParamsError>;
    fn sentinel(float: f64, int: i32) -> Self;
}

impl FieldValue for f64 {
    fn from_value(_field: &str, value: ParamValue) -> Result<Self, ParamsError> {
        Ok(match value {
            ParamValue::Float(v) => v,
            ParamValue::Int(v) => f64::from(v),
        })
    }

    fn to_value(self) -> ParamValue {
        ParamValue::Float(self)
    }

    fn parse_text(field: &str, text: &str) -> Result<Self, ParamsError> {
        let text = text.trim();
        let parsed = match FORTRAN_FLOAT_RE.captures(text) {
            Some(caps) => format!("{}e{}", &caps[1], &caps[2]).parse::<f64>(),
            None => text.parse::<f64>(),
        };
        parsed.map_err(|_| ParamsError::InvalidValue {
            field: field.to_string(),
            value: text.to_string(),
        })
    }

    fn sentinel(float: f64, _int: i32) -> Self {
        float
    }
}

impl FieldValue for i32 {
    fn from_value(field: &str, value: ParamValue) -> Result<Self, ParamsError> {
        match value {
            ParamValue::Int(v) => Ok(v),
            ParamValue::Float(_) => Err(ParamsError::KindMismatch {
                field: field.to_string(),
                expected: NumericKind::Int32,
                got: NumericKind::Float64,
            }),
        }
    }

    fn to_value(self) -> ParamValue {
        ParamValue::Int(self)
    }

    fn parse_text(field: &str, text: &str) -> Result<Self, ParamsError> {
        let text = text.trim();
        text.parse::<i32>().map_err(|_| ParamsError::InvalidValue {
            field: field.to_string(),
            value: text.to_string(),
        })
    }

    fn sentinel(_float: f64, int: i32) -> Self {
        int
    }
}

macro_rules! engine_params {
    ($( $(#[doc = $doc:literal])+ $name:ident: $ty:ident, )+) => {
        /// Sparse configuration record handed to the engine's get-params callback.
        ///
        /// `None` leaves the engine's own default in place. Fields are
        /// independent of each other; setting one never implies another.
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        #[serde(default, deny_unknown_fields)]
        pub struct DlfParams {
            /// Starting geometry, one `[x, y, z]` row per atom (`coords(nvar)`)
            #[serde(skip_serializing_if = "Option::is_none")]
            pub coords: Option<Vec<[f64; 3]>>,
            /// Secondary coordinate set: extra frames, weights, masses (`coords2(nvar2)`)
            #[serde(skip_serializing_if = "Option::is_none")]
            pub coords2: Option<Vec<f64>>,
            /// Integer classification array: fragments, charges, constraints (`spec(nspec)`)
            #[serde(skip_serializing_if = "Option::is_none")]
            pub spec: Option<Vec<i32>>,
            $(
                $(#[doc = $doc])+
                #[serde(skip_serializing_if = "Option::is_none")]
                pub $name: Option<$ty>,
            )+
        }

        /// Every scalar field in the order the binary contract passes them.
        pub const FIELDS: &[FieldSpec] = &[
            $( FieldSpec { name: stringify!($name), kind: <$ty as Element>::KIND }, )+
        ];

        impl DlfParams {
            $(
                #[doc = concat!("Sets `", stringify!($name), "`.")]
                pub fn $name(mut self, value: $ty) -> Self {
                    self.$name = Some(value);
                    self
                }
            )+

            /// Sets a scalar field by name.
            ///
            /// Integers are accepted for float fields; floats are rejected for
            /// integer fields.
            pub fn set(&mut self, name: &str, value: impl Into<ParamValue>) -> Result<(), ParamsError> {
                let value = value.into();
                match name {
                    $( stringify!($name) => {
                        self.$name = Some(<$ty as FieldValue>::from_value(name, value)?);
                    } )+
                    _ => return Err(ParamsError::UnknownField(name.to_string())),
                }
                Ok(())
            }

            /// Sets a scalar field by name from its text form.
            ///
            /// Float fields also accept Fortran exponents such as `1.0d-4`.
            pub fn set_str(&mut self, name: &str, text: &str) -> Result<(), ParamsError> {
                match name {
                    $( stringify!($name) => {
                        self.$name = Some(<$ty as FieldValue>::parse_text(name, text)?);
                    } )+
                    _ => return Err(ParamsError::UnknownField(name.to_string())),
                }
                Ok(())
            }

            /// Clears a scalar field so the engine default applies again.
            pub fn unset(&mut self, name: &str) -> Result<(), ParamsError> {
                match name {
                    $( stringify!($name) => self.$name = None, )+
                    _ => return Err(ParamsError::UnknownField(name.to_string())),
                }
                Ok(())
            }

            /// Current value of a scalar field, if set.
            pub fn get(&self, name: &str) -> Option<ParamValue> {
                match name {
                    $( stringify!($name) => self.$name.map(<$ty as FieldValue>::to_value), )+
                    _ => None,
                }
            }

            /// Number of scalar fields that will be written.
            pub fn scalar_count(&self) -> usize {
                0 $( + usize::from(self.$name.is_some()) )+
            }

            fn merge_scalars(&mut self, other: &DlfParams) {
                $(
                    if other.$name.is_some() {
                        self.$name = other.$name;
                    }
                )+
            }

            /// Writes every set scalar into its engine slot and returns how many
            /// were written. Unset fields are never touched.
            pub(crate) fn write_scalars(&self, targets: &mut ParamTargets<'_>) -> usize {
                let mut written = 0;
                $(
                    if let (Some(value), Some(slot)) = (self.$name, targets.$name.as_deref_mut()) {
                        *slot = value;
                        written += 1;
                    }
                )+
                written
            }
        }

        /// Borrowed engine slots for one get-params invocation.
        pub struct ParamTargets<'a> {
            $( $name: Option<&'a mut $ty>, )+
        }

        /// Engine-side storage for the error code and every scalar slot.
        ///
        /// Useful for engines driven from Rust and for checking what an
        /// injection wrote: fill the slots with sentinels, invoke, compare.
        #[derive(Debug, Clone, Copy, PartialEq)]
        pub struct ParamSlots {
            /// Error code written by the get-params callback
            pub ierr: i32,
            $(
                $(#[doc = $doc])+
                pub $name: $ty,
            )+
        }

        impl ParamSlots {
            /// Slots pre-filled with `float` and `int` sentinels.
            pub fn filled(float: f64, int: i32) -> Self {
                Self {
                    ierr: int,
                    $( $name: <$ty as FieldValue>::sentinel(float, int), )+
                }
            }

            /// Current value of a slot by name.
            pub fn get(&self, name: &str) -> Option<ParamValue> {
                match name {
                    $( stringify!($name) => Some(<$ty as FieldValue>::to_value(self.$name)), )+
                    _ => None,
                }
            }

            /// Borrows these slots, together with the three arrays, as one
            /// get-params request.
            pub fn request<'a>(
                &'a mut self,
                coords: &'a mut [f64],
                coords2: &'a mut [f64],
                spec: &'a mut [i32],
            ) -> ParamsRequest<'a> {
                ParamsRequest {
                    coords: BufferViewMut::new(coords),
                    coords2: BufferViewMut::new(coords2),
                    spec: BufferViewMut::new(spec),
                    ierr: Some(&mut self.ierr),
                    targets: ParamTargets {
                        $( $name: Some(&mut self.$name), )+
                    },
                }
            }

            /// Calls a get-params function the way the engine does, passing a
            /// pointer to every slot.
            ///
            /// # Safety
            ///
            /// `callback` must honour the get-params contract, and the array
            /// lengths must be at least `nvar`, `nvar2` and `nspec`.
            #[allow(clippy::too_many_arguments)]
            pub unsafe fn invoke(
                &mut self,
                callback: GetParamsFn,
                nvar: c_int,
                nvar2: c_int,
                nspec: c_int,
                coords: &mut [f64],
                coords2: &mut [f64],
                spec: &mut [i32],
            ) {
                unsafe {
                    callback(
                        nvar,
                        nvar2,
                        nspec,
                        coords.as_mut_ptr(),
                        coords2.as_mut_ptr(),
                        spec.as_mut_ptr(),
                        &mut self.ierr,
                        $( &mut self.$name, )+
                    )
                }
            }
        }

        /// Binary signature of the get-params callback.
        ///
        /// Array sizes by value, then `coords`, `coords2`, `spec`, `ierr`, then
        /// one pointer per entry of [`FIELDS`], all `intent(inout)`.
        pub type GetParamsFn = unsafe extern "C" fn(
            c_int,
            c_int,
            c_int,
            *mut c_double,
            *mut c_double,
            *mut c_int,
            *mut c_int,
            $( *mut $ty, )+
        );

        /// Adapter registered as the engine's get-params callback.
        #[allow(clippy::too_many_arguments)]
        pub(crate) unsafe extern "C" fn get_params_adapter(
            nvar: c_int,
            nvar2: c_int,
            nspec: c_int,
            coords: *mut c_double,
            coords2: *mut c_double,
            spec: *mut c_int,
            ierr: *mut c_int,
            $( $name: *mut $ty, )+
        ) {
            crate::adapters::boundary("get_params", || {
                let sizes = ArraySizes {
                    nvar: crate::adapters::engine_len("nvar", nvar),
                    nvar2: crate::adapters::engine_len("nvar2", nvar2),
                    nspec: crate::adapters::engine_len("nspec", nspec),
                };
                let mut request = unsafe {
                    ParamsRequest {
                        coords: BufferViewMut::from_raw(coords, sizes.nvar),
                        coords2: BufferViewMut::from_raw(coords2, sizes.nvar2),
                        spec: BufferViewMut::from_raw(spec, sizes.nspec),
                        ierr: ierr.as_mut(),
                        targets: ParamTargets {
                            $( $name: $name.as_mut(), )+
                        },
                    }
                };
                crate::adapters::dispatch_params(&mut request);
            })
        }
    };
}

engine_params! {
    /// Convergence criterion on the maximum gradient component
    tolerance: f64,
    /// Print level for standard output
    printl: i32,
    /// Maximum number of optimization cycles
    maxcycle: i32,
    /// Maximum number of energy and gradient evaluations
    maxene: i32,
    /// 1 if the variables are atom positions, 0 for arbitrary variables
    tatoms: i32,
    /// Coordinate system (Cartesian, HDLC, DLC, NEB and dimer variants)
    icoord: i32,
    /// Optimization algorithm
    iopt: i32,
    /// Line search or trust-radius scheme
    iline: i32,
    /// Maximum step length
    maxstep: f64,
    /// Step scaling factor
    scalestep: f64,
    /// Number of steps kept in L-BFGS memory
    lbfgs_mem: i32,
    /// Number of images for path methods
    nimage: i32,
    /// Force constant between nudged elastic band images
    nebk: f64,
    /// Write restart information every `dump` steps
    dump: i32,
    /// Restart mode
    restart: i32,
    /// Number of nuclear charges stored in `spec`
    nz: i32,
    /// Number of constraints stored in `spec`
    ncons: i32,
    /// Number of user connections stored in `spec`
    nconn: i32,
    /// Hessian update scheme
    update: i32,
    /// Maximum number of Hessian updates before recomputation
    maxupd: i32,
    /// Finite-difference step for Hessian evaluation
    delta: f64,
    /// Eigenvalue threshold for soft modes
    soft: f64,
    /// Initial Hessian scheme
    inithessian: i32,
    /// Update the Hessian in Cartesian coordinates
    carthessian: i32,
    /// Transition-state search relative to the reactant
    tsrel: i32,
    /// Maximum number of dimer rotations per cycle
    maxrot: i32,
    /// Dimer rotation tolerance
    tolrot: f64,
    /// Number of extra frames stored in `coords2`
    nframe: i32,
    /// Number of masses stored in `coords2`
    nmass: i32,
    /// Number of weights stored in `coords2`
    nweight: i32,
    /// Damped-dynamics time step
    timestep: f64,
    /// Initial friction for damped dynamics
    fric0: f64,
    /// Friction reduction factor
    fricfac: f64,
    /// Friction applied after an energy rise
    fricp: f64,
    /// Multistate mode (penalty function, gradient projection, Lagrange-Newton)
    imultistate: i32,
    /// Lower state index
    state_i: i32,
    /// Upper state index
    state_j: i32,
    /// Penalty function parameter c1
    pf_c1: f64,
    /// Penalty function parameter c2
    pf_c2: f64,
    /// Gradient projection parameter c3
    gp_c3: f64,
    /// Gradient projection parameter c4
    gp_c4: f64,
    /// Lagrange-Newton orthogonalisation threshold
    ln_t1: f64,
    /// Lagrange-Newton threshold for switching off orthogonalisation
    ln_t2: f64,
    /// Print level for report files
    printf: i32,
    /// Convergence criterion on the energy change
    tolerance_e: f64,
    /// Distortion of the start structure along `coords2`
    distort: f64,
    /// Use mass-weighted coordinates
    massweight: i32,
    /// Minimum step length
    minstep: f64,
    /// Maximum number of dump files
    maxdump: i32,
    /// Task selector
    task: i32,
    /// Temperature
    temperature: f64,
    /// Population size for parallel optimization
    po_pop_size: i32,
    /// Initial search radius for parallel optimization
    po_radius: f64,
    /// Search radius contraction factor
    po_contraction: f64,
    /// Radius convergence tolerance
    po_tolerance_r: f64,
    /// Gradient convergence tolerance
    po_tolerance_g: f64,
    /// Distribution of sampling points
    po_distribution: i32,
    /// Maximum cycles for parallel optimization
    po_maxcycle: i32,
    /// Initial population size
    po_init_pop_size: i32,
    /// Population reset interval
    po_reset: i32,
    /// Mutation rate of the genetic algorithm
    po_mutation_rate: f64,
    /// Death rate of the genetic algorithm
    po_death_rate: f64,
    /// Scaling factor for the genetic algorithm
    po_scalefac: f64,
    /// Number of minima kept
    po_nsave: i32,
    /// Number of task farms
    ntasks: i32,
    /// Task farming is set up by the engine itself
    tdlf_farm: i32,
    /// Number of radius scaling factors stored in `coords2`
    n_po_scaling: i32,
    /// Threshold for switching on climbing-image NEB
    neb_climb_test: f64,
    /// Threshold for freezing NEB images
    neb_freeze_test: f64,
    /// Number of zero vibrational modes
    nzero: i32,
    /// Compute interstate coupling between states
    coupled_states: i32,
    /// Quantum transition-state flag
    qtsflag: i32,
    /// Use microiterative optimization
    imicroiter: i32,
    /// Maximum number of microiterative cycles
    maxmicrocycle: i32,
    /// Fit ESP charges during microiterations
    micro_esp_fit: i32,
}

impl DlfParams {
    /// Record holding only the starting geometry.
    pub fn new(coords: Vec<[f64; 3]>) -> Self {
        Self {
            coords: Some(coords),
            ..Self::default()
        }
    }

    /// Starting geometry plus the usual host-side defaults: quiet printing,
    /// no internal-coordinate or constraint layouts, one task.
    pub fn standard(coords: Vec<[f64; 3]>) -> Self {
        Self::new(coords)
            .printl(0)
            .nz(0)
            .ncons(0)
            .nconn(0)
            .nframe(0)
            .nmass(0)
            .nweight(0)
            .ntasks(1)
    }

    /// Sets the starting geometry.
    pub fn coords(mut self, coords: Vec<[f64; 3]>) -> Self {
        self.coords = Some(coords);
        self
    }

    /// Sets the secondary coordinate array.
    pub fn coords2(mut self, coords2: Vec<f64>) -> Self {
        self.coords2 = Some(coords2);
        self
    }

    /// Sets the integer classification array.
    pub fn spec(mut self, spec: Vec<i32>) -> Self {
        self.spec = Some(spec);
        self
    }

    /// Number of atoms in the starting geometry.
    pub fn natoms(&self) -> Option<usize> {
        self.coords.as_ref().map(Vec::len)
    }

    /// Overlays `other` on top of `self`: every field set in `other` wins.
    pub fn merge(&mut self, other: &DlfParams) {
        if other.coords.is_some() {
            self.coords = other.coords.clone();
        }
        if other.coords2.is_some() {
            self.coords2 = other.coords2.clone();
        }
        if other.spec.is_some() {
            self.spec = other.spec.clone();
        }
        self.merge_scalars(other);
    }

    /// Checks every supplied array against the sizes the engine will be given.
    pub fn validate(&self, sizes: &ArraySizes) -> Result<(), ParamsError> {
        let coords = self.coords.as_ref().ok_or(ParamsError::MissingCoordinates)?;
        if coords.is_empty() {
            return Err(ParamsError::EmptyCoordinates);
        }
        check_len("coords", sizes.nvar, coords.len() * 3)?;
        if let Some(coords2) = &self.coords2 {
            check_len("coords2", sizes.nvar2, coords2.len())?;
        }
        if let Some(spec) = &self.spec {
            check_len("spec", sizes.nspec, spec.len())?;
        }
        Ok(())
    }
}

fn check_len(field: &'static str, expected: usize, actual: usize) -> Result<(), ParamsError> {
    if expected == actual {
        Ok(())
    } else {
        Err(ParamsError::LengthMismatch {
            field,
            expected,
            actual,
        })
    }
}
