//! Cube serialization to and from Zarr V3 directories.
//!
//! Layout: a root group whose attributes carry the cube's global attrs
//! plus a `_cubegen` entry describing dimensions, coordinate kinds, and
//! variable dimensions; one array per coordinate (f64, or i64 epoch
//! seconds for time) and one f32 array per data variable, blosc-zstd
//! compressed, chunked per the cube's chunk layout.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::DateTime;
use serde_json::{json, Map, Value};
use zarrs::array::codec::bytes_to_bytes::blosc::{
    BloscCodec, BloscCompressionLevel, BloscCompressor, BloscShuffleMode,
};
use zarrs::array::{Array, ArrayBuilder, DataType, FillValue};
use zarrs::array_subset::ArraySubset;
use zarrs::group::{Group, GroupBuilder};
use zarrs_filesystem::FilesystemStore;

use cube_common::{Coord, Crs, CubeError, CubeResult, DataCube, EvalContext, LazyArray, Variable};

const META_KEY: &str = "_cubegen";
const COMPRESSION_LEVEL: u8 = 5;

fn storage_err(data_id: &str) -> impl Fn(String) -> CubeError + '_ {
    move |message| CubeError::Write {
        data_id: data_id.to_string(),
        message,
    }
}

/// Write a materializable cube as a Zarr directory at `path`.
pub fn write_cube(path: &Path, cube: &DataCube, data_id: &str, ctx: &EvalContext) -> CubeResult<()> {
    let err = storage_err(data_id);
    let store = Arc::new(FilesystemStore::new(path).map_err(|e| err(e.to_string()))?);

    let coord_kinds: Map<String, Value> = cube
        .coords
        .iter()
        .map(|(name, coord)| {
            let kind = match coord {
                Coord::Numeric(_) => "numeric",
                Coord::Time(_) => "time",
            };
            (name.clone(), json!(kind))
        })
        .collect();
    let var_dims: Map<String, Value> = cube
        .vars
        .iter()
        .map(|(name, var)| (name.clone(), json!(var.dims)))
        .collect();

    let mut root_attrs = cube.attrs.clone();
    root_attrs.insert(
        META_KEY.to_string(),
        json!({
            "dims": cube.dims,
            "coords": coord_kinds,
            "vars": var_dims,
            "crs": cube.crs.map(|c| c.to_string()),
        }),
    );

    let group = GroupBuilder::new()
        .attributes(root_attrs)
        .build(store.clone(), "/")
        .map_err(|e| err(e.to_string()))?;
    group.store_metadata().map_err(|e| err(e.to_string()))?;

    for (name, coord) in &cube.coords {
        write_coord(store.clone(), name, coord, data_id)?;
    }
    for (name, var) in &cube.vars {
        write_variable(store.clone(), name, var, cube, data_id, ctx)?;
    }
    Ok(())
}

fn write_coord(
    store: Arc<FilesystemStore>,
    name: &str,
    coord: &Coord,
    data_id: &str,
) -> CubeResult<()> {
    let err = storage_err(data_id);
    let len = coord.len() as u64;
    let path = format!("/{name}");

    match coord {
        Coord::Numeric(values) => {
            let array = ArrayBuilder::new(
                vec![len],
                DataType::Float64,
                vec![len.max(1)].try_into().map_err(|e| err(format!("{e:?}")))?,
                FillValue::from(f64::NAN),
            )
            .build(store, &path)
            .map_err(|e| err(e.to_string()))?;
            array.store_metadata().map_err(|e| err(e.to_string()))?;
            let subset = ArraySubset::new_with_shape(vec![len]);
            array
                .store_array_subset_elements(&subset, values.as_slice())
                .map_err(|e| err(e.to_string()))?;
        }
        Coord::Time(values) => {
            let mut attrs = Map::new();
            attrs.insert(
                "units".to_string(),
                json!("seconds since 1970-01-01T00:00:00Z"),
            );
            let array = ArrayBuilder::new(
                vec![len],
                DataType::Int64,
                vec![len.max(1)].try_into().map_err(|e| err(format!("{e:?}")))?,
                FillValue::from(0i64),
            )
            .attributes(attrs)
            .build(store, &path)
            .map_err(|e| err(e.to_string()))?;
            array.store_metadata().map_err(|e| err(e.to_string()))?;
            let seconds: Vec<i64> = values.iter().map(|t| t.timestamp()).collect();
            let subset = ArraySubset::new_with_shape(vec![len]);
            array
                .store_array_subset_elements(&subset, seconds.as_slice())
                .map_err(|e| err(e.to_string()))?;
        }
    }
    Ok(())
}

fn write_variable(
    store: Arc<FilesystemStore>,
    name: &str,
    var: &Variable,
    cube: &DataCube,
    data_id: &str,
    ctx: &EvalContext,
) -> CubeResult<()> {
    let err = storage_err(data_id);
    let shape: Vec<u64> = var.array.shape().iter().map(|&s| s as u64).collect();
    let chunk_shape: Vec<u64> = var
        .dims
        .iter()
        .zip(var.array.shape())
        .map(|(dim, &len)| {
            let chunk = cube
                .chunks
                .as_ref()
                .and_then(|c| c.get(dim))
                .copied()
                .unwrap_or(len);
            chunk.min(len).max(1) as u64
        })
        .collect();

    let codec = BloscCodec::new(
        BloscCompressor::Zstd,
        BloscCompressionLevel::try_from(COMPRESSION_LEVEL)
            .map_err(|e| err(format!("{e:?}")))?,
        None,
        BloscShuffleMode::Shuffle,
        Some(std::mem::size_of::<f32>()),
    )
    .map_err(|e| err(e.to_string()))?;

    let array = ArrayBuilder::new(
        shape.clone(),
        DataType::Float32,
        chunk_shape.try_into().map_err(|e| err(format!("{e:?}")))?,
        FillValue::from(f32::NAN),
    )
    .attributes(var.attrs.clone())
    .bytes_to_bytes_codecs(vec![Arc::new(codec)])
    .build(store, &format!("/{name}"))
    .map_err(|e| err(e.to_string()))?;

    array.store_metadata().map_err(|e| err(e.to_string()))?;
    let values = var.array.values(ctx)?;
    let subset = ArraySubset::new_with_shape(shape);
    array
        .store_array_subset_elements(&subset, values.as_slice())
        .map_err(|e| err(e.to_string()))?;
    Ok(())
}

/// Read a cube previously written by [`write_cube`].
pub fn read_cube(path: &Path, store_name: &str, data_id: &str) -> CubeResult<DataCube> {
    let err = move |message: String| CubeError::SourceAccess {
        store: store_name.to_string(),
        data_id: data_id.to_string(),
        message,
    };

    let store = Arc::new(FilesystemStore::new(path).map_err(|e| err(e.to_string()))?);
    let group = Group::open(store.clone(), "/").map_err(|e| err(e.to_string()))?;
    let mut attrs = group.attributes().clone();
    let meta = attrs
        .remove(META_KEY)
        .ok_or_else(|| err("not a cubegen dataset (missing cube metadata)".to_string()))?;

    let dims: Vec<(String, usize)> = serde_json::from_value(meta["dims"].clone())
        .map_err(|e| err(format!("invalid cube metadata: {e}")))?;
    let coord_kinds: HashMap<String, String> = serde_json::from_value(meta["coords"].clone())
        .map_err(|e| err(format!("invalid cube metadata: {e}")))?;
    let var_dims: HashMap<String, Vec<String>> = serde_json::from_value(meta["vars"].clone())
        .map_err(|e| err(format!("invalid cube metadata: {e}")))?;
    let crs = match meta.get("crs") {
        Some(Value::String(s)) => Some(Crs::from_user_input(s)?),
        _ => None,
    };

    let mut cube = DataCube {
        dims,
        attrs,
        crs,
        ..Default::default()
    };

    for (name, kind) in &coord_kinds {
        let array =
            Array::open(store.clone(), &format!("/{name}")).map_err(|e| err(e.to_string()))?;
        let shape = array.shape().to_vec();
        let subset = ArraySubset::new_with_shape(shape);
        let coord = match kind.as_str() {
            "time" => {
                let seconds: Vec<i64> = array
                    .retrieve_array_subset_elements(&subset)
                    .map_err(|e| err(e.to_string()))?;
                let times = seconds
                    .iter()
                    .map(|&s| {
                        DateTime::from_timestamp(s, 0)
                            .ok_or_else(|| err(format!("invalid timestamp {s}")))
                    })
                    .collect::<CubeResult<Vec<_>>>()?;
                Coord::time(times)
            }
            _ => {
                let values: Vec<f64> = array
                    .retrieve_array_subset_elements(&subset)
                    .map_err(|e| err(e.to_string()))?;
                Coord::numeric(values)
            }
        };
        cube.coords.insert(name.clone(), coord);
    }

    for (name, dims) in var_dims {
        let array =
            Array::open(store.clone(), &format!("/{name}")).map_err(|e| err(e.to_string()))?;
        let shape: Vec<usize> = array.shape().iter().map(|&s| s as usize).collect();
        let subset = ArraySubset::new_with_shape(array.shape().to_vec());
        let values: Vec<f32> = array
            .retrieve_array_subset_elements(&subset)
            .map_err(|e| err(e.to_string()))?;
        cube.vars.insert(
            name,
            Variable {
                dims,
                array: LazyArray::from_values(shape, values)?,
                attrs: array.attributes().clone(),
            },
        );
    }
    Ok(cube)
}
