//! In-memory data cube model with lazy array evaluation.
//!
//! A `DataCube` holds named dimensions, coordinate arrays, and variables
//! whose data is a `LazyArray`: either materialized `f32` values or a
//! deferred computation that runs only when the cube is written or
//! inspected. Evaluation goes through an explicit `EvalContext`, which
//! selects parallel (rayon) or sequential execution for the run.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde_json::{Map, Value};

use crate::bbox::BoundingBox;
use crate::crs::Crs;
use crate::error::{CubeError, CubeResult};

/// Bounds variables dropped during cleaning.
const BOUNDS_NAMES: &[&str] = &["x_bnds", "y_bnds", "lat_bnds", "lon_bnds", "time_bnds"];

/// Grid-mapping variables replaced by the `spatial_ref` attribute.
const GRID_MAPPING_NAMES: &[&str] = &["crs", "spatial_ref"];

/// Evaluation backend for lazy arrays, carried explicitly through the run.
#[derive(Clone, Default)]
pub struct EvalContext {
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl EvalContext {
    /// Evaluate everything on the calling thread.
    pub fn sequential() -> Self {
        Self { pool: None }
    }

    /// Evaluate independent steps on a rayon pool. `num_threads` of zero
    /// uses rayon's default (one per logical CPU).
    pub fn threads(num_threads: usize) -> CubeResult<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
            .map_err(|e| CubeError::Config(format!("failed to build thread pool: {e}")))?;
        Ok(Self {
            pool: Some(Arc::new(pool)),
        })
    }

    /// Whether evaluation runs on a thread pool.
    pub fn is_parallel(&self) -> bool {
        self.pool.is_some()
    }

    /// Run `f` for each step index, in parallel when a pool is configured,
    /// returning per-step results in order.
    pub fn map_steps<F>(&self, n: usize, f: F) -> CubeResult<Vec<Vec<f32>>>
    where
        F: Fn(usize) -> CubeResult<Vec<f32>> + Send + Sync,
    {
        match &self.pool {
            Some(pool) => pool.install(|| (0..n).into_par_iter().map(|i| f(i)).collect()),
            None => (0..n).map(f).collect(),
        }
    }
}

impl fmt::Debug for EvalContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvalContext")
            .field("parallel", &self.is_parallel())
            .finish()
    }
}

type DeferredFn = dyn Fn(&EvalContext) -> CubeResult<Vec<f32>> + Send + Sync;

#[derive(Clone)]
enum Repr {
    Eager(Arc<Vec<f32>>),
    Deferred(Arc<DeferredFn>),
}

/// An n-dimensional `f32` array, either materialized or deferred.
#[derive(Clone)]
pub struct LazyArray {
    shape: Vec<usize>,
    repr: Repr,
}

impl LazyArray {
    /// Materialized array from row-major values.
    pub fn from_values(shape: Vec<usize>, values: Vec<f32>) -> CubeResult<Self> {
        let expected: usize = shape.iter().product();
        if values.len() != expected {
            return Err(CubeError::Harmonize(format!(
                "array length {} does not match shape {:?}",
                values.len(),
                shape
            )));
        }
        Ok(Self {
            shape,
            repr: Repr::Eager(Arc::new(values)),
        })
    }

    /// Deferred array computed on first evaluation.
    pub fn deferred<F>(shape: Vec<usize>, f: F) -> Self
    where
        F: Fn(&EvalContext) -> CubeResult<Vec<f32>> + Send + Sync + 'static,
    {
        Self {
            shape,
            repr: Repr::Deferred(Arc::new(f)),
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_materialized(&self) -> bool {
        matches!(self.repr, Repr::Eager(_))
    }

    /// Evaluate the array. Materialized arrays return their data without
    /// copying; deferred arrays run their computation.
    pub fn values(&self, ctx: &EvalContext) -> CubeResult<Arc<Vec<f32>>> {
        match &self.repr {
            Repr::Eager(data) => Ok(Arc::clone(data)),
            Repr::Deferred(f) => {
                let data = f(ctx)?;
                if data.len() != self.len() {
                    return Err(CubeError::Harmonize(format!(
                        "deferred array produced {} values for shape {:?}",
                        data.len(),
                        self.shape
                    )));
                }
                Ok(Arc::new(data))
            }
        }
    }

    /// A deferred view of a row-major window of this array.
    pub fn sliced(&self, ranges: Vec<Range<usize>>) -> CubeResult<Self> {
        if ranges.len() != self.shape.len() {
            return Err(CubeError::Harmonize(format!(
                "slice rank {} does not match array rank {}",
                ranges.len(),
                self.shape.len()
            )));
        }
        for (r, &dim) in ranges.iter().zip(&self.shape) {
            if r.start > r.end || r.end > dim {
                return Err(CubeError::Harmonize(format!(
                    "slice {r:?} out of bounds for dimension of length {dim}"
                )));
            }
        }

        let out_shape: Vec<usize> = ranges.iter().map(|r| r.len()).collect();
        let parent = self.clone();
        let parent_shape = self.shape.clone();
        Ok(Self::deferred(out_shape, move |ctx| {
            let data = parent.values(ctx)?;
            Ok(copy_window(&data, &parent_shape, &ranges))
        }))
    }
}

impl fmt::Debug for LazyArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyArray")
            .field("shape", &self.shape)
            .field("materialized", &self.is_materialized())
            .finish()
    }
}

/// Copy a row-major window out of an array. The innermost dimension is
/// copied in contiguous runs.
fn copy_window(data: &[f32], shape: &[usize], ranges: &[Range<usize>]) -> Vec<f32> {
    let ndim = shape.len();
    if ndim == 0 {
        return data.to_vec();
    }

    let mut strides = vec![1usize; ndim];
    for d in (0..ndim - 1).rev() {
        strides[d] = strides[d + 1] * shape[d + 1];
    }

    let out_len: usize = ranges.iter().map(|r| r.len()).product();
    let mut out = Vec::with_capacity(out_len);
    let inner = &ranges[ndim - 1];

    let mut idx = vec![0usize; ndim - 1];
    'outer: loop {
        let mut base = 0;
        for d in 0..ndim - 1 {
            base += (ranges[d].start + idx[d]) * strides[d];
        }
        out.extend_from_slice(&data[base + inner.start..base + inner.end]);

        // odometer over the outer dimensions
        for d in (0..ndim - 1).rev() {
            idx[d] += 1;
            if idx[d] < ranges[d].len() {
                continue 'outer;
            }
            idx[d] = 0;
        }
        break;
    }
    out
}

/// A coordinate axis.
#[derive(Debug, Clone)]
pub enum Coord {
    Numeric(Arc<Vec<f64>>),
    Time(Arc<Vec<DateTime<Utc>>>),
}

impl Coord {
    pub fn numeric(values: Vec<f64>) -> Self {
        Coord::Numeric(Arc::new(values))
    }

    pub fn time(values: Vec<DateTime<Utc>>) -> Self {
        Coord::Time(Arc::new(values))
    }

    pub fn len(&self) -> usize {
        match self {
            Coord::Numeric(v) => v.len(),
            Coord::Time(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Exact equality, bit-for-bit on numeric values. Fusion requires
    /// coordinates to match exactly, not approximately.
    pub fn bit_identical(&self, other: &Coord) -> bool {
        match (self, other) {
            (Coord::Numeric(a), Coord::Numeric(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b.iter())
                        .all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (Coord::Time(a), Coord::Time(b)) => a == b,
            _ => false,
        }
    }
}

/// A data variable: dimension names, array, and attributes.
#[derive(Debug, Clone)]
pub struct Variable {
    pub dims: Vec<String>,
    pub array: LazyArray,
    pub attrs: Map<String, Value>,
}

impl Variable {
    pub fn new(dims: Vec<String>, array: LazyArray) -> Self {
        Self {
            dims,
            array,
            attrs: Map::new(),
        }
    }
}

/// An in-memory dataset: dimensions, coordinates, variables, attributes.
#[derive(Debug, Clone, Default)]
pub struct DataCube {
    /// Ordered dimensions with their lengths.
    pub dims: Vec<(String, usize)>,
    pub coords: HashMap<String, Coord>,
    pub vars: BTreeMap<String, Variable>,
    pub attrs: Map<String, Value>,
    pub crs: Option<Crs>,
    /// Desired chunk length per dimension, applied at write time.
    pub chunks: Option<HashMap<String, usize>>,
}

impl DataCube {
    pub fn dim_len(&self, name: &str) -> Option<usize> {
        self.dims
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, len)| *len)
    }

    /// Name of the x axis (`x` or `lon`).
    pub fn x_dim(&self) -> Option<&str> {
        self.dims
            .iter()
            .map(|(n, _)| n.as_str())
            .find(|n| *n == "x" || *n == "lon")
    }

    /// Name of the y axis (`y` or `lat`).
    pub fn y_dim(&self) -> Option<&str> {
        self.dims
            .iter()
            .map(|(n, _)| n.as_str())
            .find(|n| *n == "y" || *n == "lat")
    }

    /// Length of the time axis, if present.
    pub fn time_len(&self) -> Option<usize> {
        self.dim_len("time")
    }

    fn numeric_coord(&self, name: &str) -> CubeResult<&Vec<f64>> {
        match self.coords.get(name) {
            Some(Coord::Numeric(v)) => Ok(v),
            _ => Err(CubeError::Harmonize(format!(
                "missing numeric coordinate '{name}'"
            ))),
        }
    }

    /// Rename data variables after a variable-spec identifier: a single
    /// variable takes the identifier itself, several get `identifier_var`.
    pub fn with_vars_renamed(&self, identifier: &str) -> DataCube {
        let mut out = self.clone();
        let multi = self.vars.len() > 1;
        out.vars = self
            .vars
            .iter()
            .map(|(name, var)| {
                let new_name = if multi {
                    format!("{identifier}_{name}")
                } else {
                    identifier.to_string()
                };
                (new_name, var.clone())
            })
            .collect();
        out
    }

    /// Normalize the cube for output: drop bounds variables, replace any
    /// grid-mapping variables with a single `spatial_ref` attribute, and
    /// point each data variable's `grid_mapping` attr at it.
    pub fn cleaned(&self) -> DataCube {
        let mut out = self.clone();
        for name in BOUNDS_NAMES.iter().chain(GRID_MAPPING_NAMES) {
            out.vars.remove(*name);
            out.coords.remove(*name);
        }
        if let Some(crs) = out.crs {
            out.attrs
                .insert("spatial_ref".to_string(), Value::String(crs.to_string()));
            for var in out.vars.values_mut() {
                var.attrs.insert(
                    "grid_mapping".to_string(),
                    Value::String("spatial_ref".to_string()),
                );
            }
        }
        out
    }

    /// Stringify list- and map-valued attributes, which NetCDF cannot
    /// represent natively.
    pub fn with_attrs_flattened(&self) -> DataCube {
        fn flatten(attrs: &Map<String, Value>) -> Map<String, Value> {
            attrs
                .iter()
                .map(|(k, v)| {
                    let v = match v {
                        Value::Array(_) | Value::Object(_) => Value::String(v.to_string()),
                        other => other.clone(),
                    };
                    (k.clone(), v)
                })
                .collect()
        }

        let mut out = self.clone();
        out.attrs = flatten(&self.attrs);
        for var in out.vars.values_mut() {
            var.attrs = flatten(&var.attrs);
        }
        out
    }

    /// Spatial subset: keep the cells whose centers fall inside `bbox`.
    /// The time axis is untouched. Variable data stays lazy.
    pub fn clip_bbox(&self, bbox: &BoundingBox) -> CubeResult<DataCube> {
        let x_name = self
            .x_dim()
            .ok_or_else(|| CubeError::Harmonize("cube has no x dimension".to_string()))?
            .to_string();
        let y_name = self
            .y_dim()
            .ok_or_else(|| CubeError::Harmonize("cube has no y dimension".to_string()))?
            .to_string();

        let x_range = coord_range(self.numeric_coord(&x_name)?, bbox.min_x, bbox.max_x)
            .ok_or_else(|| CubeError::Harmonize("clip selects no cells along x".to_string()))?;
        let y_range = coord_range(self.numeric_coord(&y_name)?, bbox.min_y, bbox.max_y)
            .ok_or_else(|| CubeError::Harmonize("clip selects no cells along y".to_string()))?;

        let mut ranges_by_dim: HashMap<&str, Range<usize>> = HashMap::new();
        ranges_by_dim.insert(&x_name, x_range.clone());
        ranges_by_dim.insert(&y_name, y_range.clone());

        let mut out = self.clone();
        out.dims = self
            .dims
            .iter()
            .map(|(name, len)| {
                let len = ranges_by_dim
                    .get(name.as_str())
                    .map(|r| r.len())
                    .unwrap_or(*len);
                (name.clone(), len)
            })
            .collect();

        for (name, range) in [(&x_name, &x_range), (&y_name, &y_range)] {
            if let Some(Coord::Numeric(values)) = self.coords.get(name.as_str()) {
                out.coords.insert(
                    name.to_string(),
                    Coord::numeric(values[range.start..range.end].to_vec()),
                );
            }
        }

        for (name, var) in &self.vars {
            let ranges: Vec<Range<usize>> = var
                .dims
                .iter()
                .zip(var.array.shape())
                .map(|(dim, &len)| {
                    ranges_by_dim
                        .get(dim.as_str())
                        .cloned()
                        .unwrap_or(0..len)
                })
                .collect();
            let mut new_var = var.clone();
            new_var.array = var.array.sliced(ranges)?;
            out.vars.insert(name.clone(), new_var);
        }
        Ok(out)
    }

    /// Evaluate all variable arrays, returning a fully materialized cube.
    pub fn materialize(&self, ctx: &EvalContext) -> CubeResult<DataCube> {
        let mut out = self.clone();
        for (name, var) in &self.vars {
            let values = var.array.values(ctx)?;
            let mut new_var = var.clone();
            new_var.array =
                LazyArray::from_values(var.array.shape().to_vec(), values.as_ref().clone())?;
            out.vars.insert(name.clone(), new_var);
        }
        Ok(out)
    }

    #[cfg(test)]
    pub(crate) fn from_grid_for_tests(grid: &crate::grid::GridMapping) -> DataCube {
        let (w, h) = (grid.width(), grid.height());
        let values: Vec<f32> = (0..w * h).map(|i| i as f32).collect();
        let mut cube = DataCube {
            dims: vec![("y".to_string(), h), ("x".to_string(), w)],
            crs: Some(grid.crs),
            ..Default::default()
        };
        cube.coords
            .insert("x".to_string(), Coord::numeric(grid.x_coords()));
        cube.coords
            .insert("y".to_string(), Coord::numeric(grid.y_coords()));
        cube.vars.insert(
            "v".to_string(),
            Variable::new(
                vec!["y".to_string(), "x".to_string()],
                LazyArray::from_values(vec![h, w], values).unwrap(),
            ),
        );
        cube
    }
}

/// Contiguous index range of a monotonic coordinate whose values fall in
/// `[lo, hi]`. Works for ascending and descending axes.
fn coord_range(values: &[f64], lo: f64, hi: f64) -> Option<Range<usize>> {
    let mut first = None;
    let mut last = 0;
    for (i, &v) in values.iter().enumerate() {
        if v >= lo && v <= hi {
            if first.is_none() {
                first = Some(i);
            }
            last = i;
        }
    }
    first.map(|f| f..last + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_cube() -> DataCube {
        let grid = crate::grid::GridMapping::new(
            Crs::WGS84,
            BoundingBox::new(0.0, 40.0, 10.0, 50.0),
            1.0,
            (1024, 1024),
        )
        .unwrap();
        DataCube::from_grid_for_tests(&grid)
    }

    #[test]
    fn test_lazy_array_shape_check() {
        assert!(LazyArray::from_values(vec![2, 3], vec![0.0; 6]).is_ok());
        assert!(LazyArray::from_values(vec![2, 3], vec![0.0; 5]).is_err());
    }

    #[test]
    fn test_deferred_evaluates_on_demand() {
        let arr = LazyArray::deferred(vec![4], |_| Ok(vec![1.0, 2.0, 3.0, 4.0]));
        assert!(!arr.is_materialized());
        let ctx = EvalContext::sequential();
        assert_eq!(arr.values(&ctx).unwrap().as_ref(), &vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_deferred_length_mismatch_is_error() {
        let arr = LazyArray::deferred(vec![4], |_| Ok(vec![1.0]));
        assert!(arr.values(&EvalContext::sequential()).is_err());
    }

    #[test]
    fn test_slice_2d() {
        let arr = LazyArray::from_values(vec![3, 4], (0..12).map(|i| i as f32).collect()).unwrap();
        let sliced = arr.sliced(vec![1..3, 1..3]).unwrap();
        assert_eq!(sliced.shape(), &[2, 2]);
        let v = sliced.values(&EvalContext::sequential()).unwrap();
        assert_eq!(v.as_ref(), &vec![5.0, 6.0, 9.0, 10.0]);
    }

    #[test]
    fn test_slice_3d_keeps_time() {
        let arr = LazyArray::from_values(vec![2, 2, 3], (0..12).map(|i| i as f32).collect())
            .unwrap();
        let sliced = arr.sliced(vec![0..2, 1..2, 0..2]).unwrap();
        let v = sliced.values(&EvalContext::sequential()).unwrap();
        assert_eq!(v.as_ref(), &vec![3.0, 4.0, 9.0, 10.0]);
    }

    #[test]
    fn test_map_steps_parallel_matches_sequential() {
        let f = |i: usize| Ok(vec![i as f32; 3]);
        let seq = EvalContext::sequential().map_steps(5, f).unwrap();
        let par = EvalContext::threads(2).unwrap().map_steps(5, f).unwrap();
        assert_eq!(seq, par);
    }

    #[test]
    fn test_clip_bbox() {
        let cube = test_cube();
        let clipped = cube.clip_bbox(&BoundingBox::new(2.0, 42.0, 6.0, 46.0)).unwrap();
        assert_eq!(clipped.dim_len("x"), Some(4));
        assert_eq!(clipped.dim_len("y"), Some(4));
        // y is descending, so selected centers run 45.5 down to 42.5
        match clipped.coords.get("y").unwrap() {
            Coord::Numeric(v) => {
                assert_eq!(v[0], 45.5);
                assert_eq!(v[3], 42.5);
            }
            _ => panic!("expected numeric y"),
        }
        let v = clipped.vars["v"]
            .array
            .values(&EvalContext::sequential())
            .unwrap();
        assert_eq!(v.len(), 16);
    }

    #[test]
    fn test_clip_outside_extent_is_error() {
        let cube = test_cube();
        assert!(cube
            .clip_bbox(&BoundingBox::new(100.0, 100.0, 110.0, 110.0))
            .is_err());
    }

    #[test]
    fn test_cleaned_drops_bounds_and_sets_spatial_ref() {
        let mut cube = test_cube();
        cube.vars.insert(
            "x_bnds".to_string(),
            Variable::new(
                vec!["x".to_string()],
                LazyArray::from_values(vec![10], vec![0.0; 10]).unwrap(),
            ),
        );
        cube.vars.insert(
            "crs".to_string(),
            Variable::new(vec![], LazyArray::from_values(vec![], vec![0.0]).unwrap()),
        );

        let cleaned = cube.cleaned();
        assert!(!cleaned.vars.contains_key("x_bnds"));
        assert!(!cleaned.vars.contains_key("crs"));
        assert_eq!(cleaned.attrs["spatial_ref"], json!("EPSG:4326"));
        assert_eq!(cleaned.vars["v"].attrs["grid_mapping"], json!("spatial_ref"));
    }

    #[test]
    fn test_flatten_attrs() {
        let mut cube = test_cube();
        cube.attrs.insert("history".to_string(), json!(["a", "b"]));
        cube.attrs.insert("title".to_string(), json!("soil moisture"));

        let flat = cube.with_attrs_flattened();
        assert_eq!(flat.attrs["history"], json!("[\"a\",\"b\"]"));
        assert_eq!(flat.attrs["title"], json!("soil moisture"));
    }

    #[test]
    fn test_rename_single_and_multi() {
        let cube = test_cube();
        let renamed = cube.with_vars_renamed("soil");
        assert!(renamed.vars.contains_key("soil"));

        let mut multi = test_cube();
        let v = multi.vars["v"].clone();
        multi.vars.insert("w".to_string(), v);
        let renamed = multi.with_vars_renamed("soil");
        assert!(renamed.vars.contains_key("soil_v"));
        assert!(renamed.vars.contains_key("soil_w"));
    }

    #[test]
    fn test_coord_bit_identical() {
        let a = Coord::numeric(vec![1.0, 2.0]);
        let b = Coord::numeric(vec![1.0, 2.0]);
        let c = Coord::numeric(vec![1.0, 2.0 + 1e-15]);
        assert!(a.bit_identical(&b));
        assert!(!a.bit_identical(&c));
    }
}
