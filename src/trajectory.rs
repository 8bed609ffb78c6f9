//! Recording of the structures reported through put-coords.
//!
//! ```
//! use dlfind::callbacks::Callbacks;
//! use dlfind::trajectory::Trajectory;
//!
//! let mut trajectory = Trajectory::new();
//! let callbacks = Callbacks::new().put_coords(|report| trajectory.record(report));
//! # drop(callbacks);
//! assert!(trajectory.is_empty());
//! ```

use crate::callbacks::CoordinateReport;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Errors that can occur while writing or reading trajectories
#[derive(Error, Debug)]
pub enum TrajectoryError {
    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON encoding or decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// Element list does not match the frame
    #[error("Frame {frame} has {atoms} atoms but {elements} element symbols were given")]
    ElementCount {
        /// Frame index
        frame: usize,
        /// Atoms in the frame
        atoms: usize,
        /// Symbols supplied
        elements: usize,
    },
}

/// One reported structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Engine-defined discriminator
    pub switch: i32,
    /// Energy
    pub energy: f64,
    /// Cartesian coordinates per atom
    pub coords: Vec<[f64; 3]>,
    /// Master flag of the reporting task
    pub iam: i32,
}

impl From<CoordinateReport<'_>> for Frame {
    fn from(report: CoordinateReport<'_>) -> Self {
        let coords = report
            .coords
            .column_iter()
            .map(|atom| [atom[0], atom[1], atom[2]])
            .collect();
        Self {
            switch: report.switch,
            energy: report.energy,
            coords,
            iam: report.iam,
        }
    }
}

/// Every structure reported during a run, in order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    frames: Vec<Frame>,
}

impl Trajectory {
    /// Empty trajectory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies a report into a new frame.
    pub fn record(&mut self, report: CoordinateReport<'_>) {
        self.frames.push(Frame::from(report));
    }

    /// All frames.
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Frames reported with the given switch value.
    pub fn with_switch(&self, switch: i32) -> impl Iterator<Item = &Frame> + '_ {
        self.frames.iter().filter(move |frame| frame.switch == switch)
    }

    /// The most recent frame.
    pub fn last(&self) -> Option<&Frame> {
        self.frames.last()
    }

    /// Number of frames.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether nothing was reported.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Writes all frames as a multi-frame XYZ file.
    ///
    /// The comment line of each frame carries its energy and switch value.
    pub fn write_xyz(&self, elements: &[&str], path: &Path) -> Result<(), TrajectoryError> {
        let mut content = String::new();
        for (index, frame) in self.frames.iter().enumerate() {
            if frame.coords.len() != elements.len() {
                return Err(TrajectoryError::ElementCount {
                    frame: index,
                    atoms: frame.coords.len(),
                    elements: elements.len(),
                });
            }
            content.push_str(&format!(
                "{}\nenergy = {:.10}  switch = {}\n",
                frame.coords.len(),
                frame.energy,
                frame.switch
            ));
            for (element, atom) in elements.iter().zip(&frame.coords) {
                content.push_str(&format!(
                    "{}  {:.8}  {:.8}  {:.8}\n",
                    element, atom[0], atom[1], atom[2]
                ));
            }
        }
        fs::write(path, content)?;
        Ok(())
    }

    /// Saves the trajectory as JSON.
    pub fn save(&self, path: &Path) -> Result<(), TrajectoryError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Loads a trajectory saved with [`Trajectory::save`].
    pub fn load(path: &Path) -> Result<Self, TrajectoryError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}
