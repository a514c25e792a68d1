//! Pre-write normalization and output persistence.

use std::sync::Arc;

use tracing::{info, warn};

use cube_common::{CubeResult, DataCube, EvalContext};
use datastore::DataStore;

use crate::config::{DatasetSpec, FormatId};

/// Clean and persist a harmonized cube under the dataset's output id.
///
/// Cleaning always runs before the write for both formats; NetCDF
/// additionally gets structured attributes flattened to strings. When
/// the write fails, any partially written output is deleted before the
/// error is propagated so a later run is not fooled by a half-written
/// dataset.
pub async fn write_dataset(
    store: &Arc<dyn DataStore>,
    cube: &DataCube,
    spec: &DatasetSpec,
    ctx: &EvalContext,
) -> CubeResult<()> {
    let data_id = spec.output_data_id();
    let cleaned = cube.cleaned();
    let prepared = match spec.format_id {
        FormatId::Zarr => cleaned,
        FormatId::Netcdf => cleaned.with_attrs_flattened(),
    };

    info!(data_id = %data_id, format = ?spec.format_id, "writing dataset");
    if let Err(write_err) = store.write_data(&prepared, &data_id, ctx).await {
        if store.has_data(&data_id).await {
            warn!(data_id = %data_id, "removing partially written output");
            if let Err(delete_err) = store.delete_data(&data_id).await {
                warn!(data_id = %data_id, error = %delete_err, "cleanup of partial output failed");
            }
        }
        return Err(write_err);
    }
    Ok(())
}
