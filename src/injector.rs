//! Configuration injection for the get-params callback.
//!
//! A [`ConfigurationInjector`] owns a validated [`DlfParams`] record and the
//! array sizes the run was prepared with. When the engine asks for its
//! configuration it writes the three arrays (if supplied) and every set scalar
//! into the engine's slots, leaves all other slots untouched, and reports
//! success through the error code.

use crate::buffer::BufferViewMut;
use crate::params::{DlfParams, ParamTargets, ParamsError};
use serde::{Deserialize, Serialize};

/// Lengths of the three configuration arrays as declared to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArraySizes {
    /// Length of `coords` (3 × atoms)
    pub nvar: usize,
    /// Length of `coords2`
    pub nvar2: usize,
    /// Length of `spec`
    pub nspec: usize,
}

/// One get-params invocation: the engine's arrays and scalar slots.
pub struct ParamsRequest<'a> {
    pub(crate) coords: BufferViewMut<'a, f64>,
    pub(crate) coords2: BufferViewMut<'a, f64>,
    pub(crate) spec: BufferViewMut<'a, i32>,
    pub(crate) ierr: Option<&'a mut i32>,
    pub(crate) targets: ParamTargets<'a>,
}

impl ParamsRequest<'_> {
    /// Array sizes as declared by the engine for this call.
    pub fn sizes(&self) -> ArraySizes {
        ArraySizes {
            nvar: self.coords.len(),
            nvar2: self.coords2.len(),
            nspec: self.spec.len(),
        }
    }
}

/// What one injection wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Injection {
    /// Arrays written (0 to 3)
    pub arrays: usize,
    /// Scalar slots written
    pub scalars: usize,
}

/// Writes a validated configuration record into the engine's slots.
#[derive(Debug, Clone)]
pub struct ConfigurationInjector {
    params: DlfParams,
    sizes: ArraySizes,
}

impl ConfigurationInjector {
    /// Validates `params` against `sizes`.
    ///
    /// Every array length mismatch is reported here, before the engine runs.
    pub fn new(params: DlfParams, sizes: ArraySizes) -> Result<Self, ParamsError> {
        params.validate(&sizes)?;
        Ok(Self { params, sizes })
    }

    /// The record being injected.
    pub fn params(&self) -> &DlfParams {
        &self.params
    }

    /// Sizes the record was validated against.
    pub fn sizes(&self) -> ArraySizes {
        self.sizes
    }

    /// Performs one injection.
    ///
    /// Arrays are written when the record supplies them, `coords` flattened
    /// row-major. Each set scalar is written into its slot, unset slots are left
    /// exactly as the engine filled them, and the error code is set to 0.
    ///
    /// # Arguments
    ///
    /// * `request` - The engine's arrays and scalar slots for this call
    ///
    /// # Returns
    ///
    /// The number of arrays and scalars written.
    ///
    /// # Examples
    ///
    /// ```
    /// use dlfind::injector::{ArraySizes, ConfigurationInjector};
    /// use dlfind::params::{DlfParams, ParamSlots};
    ///
    /// let params = DlfParams::new(vec![[1.0, 2.0, 3.0]]).maxcycle(50);
    /// let sizes = ArraySizes { nvar: 3, nvar2: 0, nspec: 2 };
    /// let injector = ConfigurationInjector::new(params, sizes).unwrap();
    ///
    /// let mut slots = ParamSlots::filled(-1.0, -1);
    /// let (mut coords, mut spec) = ([0.0; 3], [0; 2]);
    /// let injection = injector.inject(&mut slots.request(&mut coords, &mut [], &mut spec));
    ///
    /// assert_eq!(coords, [1.0, 2.0, 3.0]);
    /// assert_eq!((slots.maxcycle, slots.maxstep, slots.ierr), (50, -1.0, 0));
    /// assert_eq!((injection.arrays, injection.scalars), (1, 1));
    /// ```
    ///
    /// # Panics
    ///
    /// Panics if the engine declares array sizes other than the ones this
    /// injector was validated against.
    pub fn inject(&self, request: &mut ParamsRequest<'_>) -> Injection {
        let declared = request.sizes();
        assert_eq!(
            declared, self.sizes,
            "engine declared array sizes {:?}, run was prepared for {:?}",
            declared, self.sizes
        );

        let mut arrays = 0;
        if let Some(coords) = &self.params.coords {
            let target = request.coords.as_mut_slice();
            for (dst, atom) in target.chunks_exact_mut(3).zip(coords) {
                dst.copy_from_slice(atom);
            }
            arrays += 1;
        }
        if let Some(coords2) = &self.params.coords2 {
            request.coords2.write_all(coords2);
            arrays += 1;
        }
        if let Some(spec) = &self.params.spec {
            request.spec.write_all(spec);
            arrays += 1;
        }

        let scalars = self.params.write_scalars(&mut request.targets);

        if let Some(ierr) = request.ierr.as_deref_mut() {
            *ierr = 0;
        }

        Injection { arrays, scalars }
    }
}
