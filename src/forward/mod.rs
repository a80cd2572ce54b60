//! Forward models: source-space meshes and the leadfield.
//!
//! A [`ForwardModel`] bundles the two hemisphere [`SourceSpace`]s with the gain
//! matrix mapping source activity to sensor signal. Free-orientation models
//! carry three leadfield columns per dipole and are reduced to one column per
//! dipole by [`ForwardModel::to_fixed`].

pub mod io;

pub use io::{load_fwd, load_info, load_leadfield, read_json, save_bundle, write_json};

use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{EsinetError, EsinetResult};

/// Subject assumed when a source space does not name one.
pub const DEFAULT_SUBJECT: &str = "fsaverage";

/// Affine 4×4 transform from surface RAS (mm) to MNI (mm).
pub type Affine = [[f64; 4]; 4];

/// Dipole orientation constraint of a leadfield.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    /// One column per dipole, oriented along the surface normal
    Fixed,
    /// Three columns (x, y, z) per dipole
    Free,
}

impl Orientation {
    pub fn columns_per_source(self) -> usize {
        match self {
            Orientation::Fixed => 1,
            Orientation::Free => 3,
        }
    }
}

/// One hemisphere of the cortical source model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SourceSpace {
    /// Vertex numbers of the used dipoles
    pub vertno: Vec<usize>,
    /// Triangles of the decimated surface, over vertex numbers
    pub use_tris: Vec<[usize; 3]>,
    /// Position of every used dipole in metres, parallel to `vertno`
    pub rr: Vec<[f64; 3]>,
    /// Outward surface normal of every used dipole, parallel to `vertno`
    pub nn: Vec<[f64; 3]>,
    #[serde(default)]
    pub subject_his_id: Option<String>,
}

impl SourceSpace {
    pub fn nuse(&self) -> usize {
        self.vertno.len()
    }
}

/// Leadfield plus bihemispheric source space.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ForwardModel {
    pub src: [SourceSpace; 2],
    /// Channels × (dipoles · columns per dipole)
    pub leadfield: Array2<f64>,
    pub orientation: Orientation,
    /// Whether orientations are expressed in surface coordinates
    pub surf_ori: bool,
    pub ch_names: Vec<String>,
    /// Per-subject surface RAS → MNI transforms
    #[serde(default)]
    pub mni_transforms: BTreeMap<String, Affine>,
}

/// Parts of a forward model used by the simulation and the networks.
#[derive(Clone, Debug)]
pub struct UnpackedForward {
    pub fwd_fixed: ForwardModel,
    /// Channels × dipoles
    pub leadfield: Array2<f64>,
    /// Dipoles × 3 MNI positions in mm
    pub pos: Array2<f64>,
    /// Triangles of the left hemisphere
    pub tris: Vec<[usize; 3]>,
}

impl ForwardModel {
    /// # Errors
    /// `ShapeMismatch` when the leadfield does not match channels and dipoles.
    pub fn new(
        src: [SourceSpace; 2],
        leadfield: Array2<f64>,
        orientation: Orientation,
        ch_names: Vec<String>,
    ) -> EsinetResult<Self> {
        let fwd = Self {
            src,
            leadfield,
            orientation,
            surf_ori: orientation == Orientation::Fixed,
            ch_names,
            mni_transforms: BTreeMap::new(),
        };
        fwd.validate()?;
        Ok(fwd)
    }

    /// Check leadfield and source-space dimensions against each other.
    pub fn validate(&self) -> EsinetResult<()> {
        let expected_cols = self.n_sources() * self.orientation.columns_per_source();
        if self.leadfield.dim() != (self.ch_names.len(), expected_cols) {
            return Err(EsinetError::ShapeMismatch(format!(
                "leadfield: expected ({}, {}), got {:?}",
                self.ch_names.len(),
                expected_cols,
                self.leadfield.dim()
            )));
        }
        for (hem, space) in self.src.iter().enumerate() {
            if space.rr.len() != space.nuse() || space.nn.len() != space.nuse() {
                return Err(EsinetError::ShapeMismatch(format!(
                    "hemisphere {hem}: {} vertices but {} positions and {} normals",
                    space.nuse(),
                    space.rr.len(),
                    space.nn.len()
                )));
            }
        }
        Ok(())
    }

    /// Number of dipoles across both hemispheres.
    pub fn n_sources(&self) -> usize {
        self.src[0].nuse() + self.src[1].nuse()
    }

    pub fn n_channels(&self) -> usize {
        self.ch_names.len()
    }

    pub fn vertices(&self) -> [Vec<usize>; 2] {
        [self.src[0].vertno.clone(), self.src[1].vertno.clone()]
    }

    /// Subject of the source model, falling back to [`DEFAULT_SUBJECT`].
    pub fn subject(&self) -> &str {
        self.src[0]
            .subject_his_id
            .as_deref()
            .unwrap_or(DEFAULT_SUBJECT)
    }

    /// Fixed-orientation copy: every dipole keeps only its normal component.
    pub fn to_fixed(&self) -> ForwardModel {
        if self.orientation == Orientation::Fixed {
            return self.clone();
        }
        let normals = self.src.iter().flat_map(|s| s.nn.iter());
        let mut fixed = Array2::zeros((self.n_channels(), self.n_sources()));
        for (i, n) in normals.enumerate() {
            let block = self.leadfield.slice(ndarray::s![.., 3 * i..3 * i + 3]);
            let normal = Array1::from(n.to_vec());
            fixed.column_mut(i).assign(&block.dot(&normal));
        }
        ForwardModel {
            src: self.src.clone(),
            leadfield: fixed,
            orientation: Orientation::Fixed,
            surf_ori: true,
            ch_names: self.ch_names.clone(),
            mni_transforms: self.mni_transforms.clone(),
        }
    }

    /// Leadfield rows of the named channels, in the order given.
    ///
    /// # Errors
    /// `ShapeMismatch` naming the first channel the model does not contain.
    pub fn pick_channels(&self, names: &[String]) -> EsinetResult<Array2<f64>> {
        let rows = names
            .iter()
            .map(|name| {
                self.ch_names
                    .iter()
                    .position(|c| c == name)
                    .ok_or_else(|| {
                        EsinetError::ShapeMismatch(format!("channel {name} not in forward model"))
                    })
            })
            .collect::<EsinetResult<Vec<usize>>>()?;
        Ok(self.leadfield.select(Axis(0), &rows))
    }

    /// MNI positions (mm) of all used dipoles, left hemisphere first.
    pub fn mni_positions(&self) -> Array2<f64> {
        let affine = self.mni_transforms.get(self.subject()).copied();
        let mut pos = Array2::zeros((self.n_sources(), 3));
        let all = self.src.iter().flat_map(|s| s.rr.iter());
        for (i, rr) in all.enumerate() {
            let mm = [rr[0] * 1000.0, rr[1] * 1000.0, rr[2] * 1000.0];
            let out = match affine {
                Some(t) => apply_affine(&t, mm),
                None => mm,
            };
            for k in 0..3 {
                pos[[i, k]] = out[k];
            }
        }
        pos
    }
}

fn apply_affine(t: &Affine, p: [f64; 3]) -> [f64; 3] {
    let mut out = [0.0; 3];
    for (r, o) in out.iter_mut().enumerate() {
        *o = t[r][0] * p[0] + t[r][1] * p[1] + t[r][2] * p[2] + t[r][3];
    }
    out
}

/// Extract the fixed-orientation model, its leadfield, MNI dipole positions
/// and the left-hemisphere triangles.
pub fn unpack_fwd(fwd: &ForwardModel) -> UnpackedForward {
    let fwd_fixed = if fwd.surf_ori && fwd.orientation == Orientation::Fixed {
        fwd.clone()
    } else {
        fwd.to_fixed()
    };
    let leadfield = fwd_fixed.leadfield.clone();
    let pos = fwd.mni_positions();
    let tris = fwd.src[0].use_tris.clone();
    UnpackedForward {
        fwd_fixed,
        leadfield,
        pos,
        tris,
    }
}
