//! Partially known tensor shapes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One dimension of a [`PartialShape`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dim {
    Static(usize),
    Dynamic,
}

impl Dim {
    pub const fn as_static(self) -> Option<usize> {
        match self {
            Self::Static(n) => Some(n),
            Self::Dynamic => None,
        }
    }

    pub const fn is_dynamic(self) -> bool {
        matches!(self, Self::Dynamic)
    }
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(n) => write!(f, "{n}"),
            Self::Dynamic => write!(f, "?"),
        }
    }
}

/// A shape whose rank and dimensions may be unknown.
///
/// `dims == None` means the rank itself is dynamic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartialShape {
    dims: Option<Vec<Dim>>,
}

impl PartialShape {
    pub fn new(dims: Vec<Dim>) -> Self {
        Self { dims: Some(dims) }
    }

    /// Shape of unknown rank.
    pub const fn dynamic() -> Self {
        Self { dims: None }
    }

    pub fn from_static(dims: &[usize]) -> Self {
        Self::new(dims.iter().map(|&d| Dim::Static(d)).collect())
    }

    /// Rank-0 shape.
    pub fn scalar() -> Self {
        Self::new(Vec::new())
    }

    pub fn dims(&self) -> Option<&[Dim]> {
        self.dims.as_deref()
    }

    pub fn rank(&self) -> Option<usize> {
        self.dims.as_ref().map(Vec::len)
    }

    /// All dimensions (and the rank) are known.
    pub fn is_static(&self) -> bool {
        self.dims.as_ref().is_some_and(|dims| dims.iter().all(|d| !d.is_dynamic()))
    }

    pub fn to_static(&self) -> Option<Vec<usize>> {
        self.dims.as_ref()?.iter().map(|d| d.as_static()).collect()
    }

    /// Number of elements, when static.
    pub fn element_count(&self) -> Option<usize> {
        self.to_static().map(|dims| dims.iter().product())
    }

    /// Dimension at `axis`, counting from the end when negative.
    pub fn dim(&self, axis: i64) -> Option<Dim> {
        let dims = self.dims.as_ref()?;
        let idx = normalize_axis(axis, dims.len())?;
        dims.get(idx).copied()
    }

    /// Numpy-style broadcast of two shapes.
    pub fn broadcast(a: &Self, b: &Self) -> Result<Self, String> {
        let (Some(da), Some(db)) = (a.dims(), b.dims()) else {
            return Ok(Self::dynamic());
        };
        let rank = da.len().max(db.len());
        let mut out = Vec::with_capacity(rank);
        for i in 0..rank {
            let x = if i + da.len() >= rank { da[i + da.len() - rank] } else { Dim::Static(1) };
            let y = if i + db.len() >= rank { db[i + db.len() - rank] } else { Dim::Static(1) };
            let merged = match (x, y) {
                (Dim::Static(1), other) | (other, Dim::Static(1)) => other,
                (Dim::Static(p), Dim::Static(q)) if p == q => Dim::Static(p),
                (Dim::Static(p), Dim::Static(q)) => {
                    return Err(format!("shapes {a} and {b} are not broadcastable ({p} vs {q})"));
                }
                (Dim::Static(p), Dim::Dynamic) | (Dim::Dynamic, Dim::Static(p)) => Dim::Static(p),
                (Dim::Dynamic, Dim::Dynamic) => Dim::Dynamic,
            };
            out.push(merged);
        }
        Ok(Self::new(out))
    }
}

impl fmt::Display for PartialShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.dims {
            None => write!(f, "[...]"),
            Some(dims) => {
                write!(f, "[")?;
                for (i, d) in dims.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{d}")?;
                }
                write!(f, "]")
            }
        }
    }
}

/// Resolve a possibly negative axis against `rank`.
pub fn normalize_axis(axis: i64, rank: usize) -> Option<usize> {
    let rank_i = i64::try_from(rank).ok()?;
    let idx = if axis < 0 { axis + rank_i } else { axis };
    (0..rank_i).contains(&idx).then_some(idx as usize)
}
