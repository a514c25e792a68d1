//! The per-dataset generation loop.
//!
//! One `Generator` owns the validated configuration, the run-scoped
//! store registry, and the preload coordinator. Datasets are processed
//! in configuration order through a fixed stage sequence; a failure in
//! any stage marks that dataset failed and the run moves on to the next
//! one. The run as a whole only errors when the configuration itself is
//! invalid.

use tracing::{error, info};

use cube_common::{CubeError, CubeResult, DataCube};
use datastore::{PreloadCoordinator, StoreRegistry};
use harmonize::{extract_point, fuse, harmonize_to_grid};

use crate::config::{point_params, store_open_params, Config, DatasetSpec, OUTPUT_STORE};
use crate::report::{DatasetReport, RunReport, Stage};
use crate::resolver::GridMappingResolver;
use crate::run::RunContext;
use crate::transforms::TransformRegistry;
use crate::writer;

struct StageError {
    stage: Stage,
    error: CubeError,
}

fn at(stage: Stage) -> impl Fn(CubeError) -> StageError {
    move |error| StageError { stage, error }
}

pub struct Generator {
    config: Config,
    stores: StoreRegistry,
    resolver: GridMappingResolver,
    transforms: TransformRegistry,
    run: RunContext,
    preload: PreloadCoordinator,
}

impl std::fmt::Debug for Generator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Generator").finish_non_exhaustive()
    }
}

impl Generator {
    /// Validate the configuration and set up run state. Configuration
    /// problems surface here, before any data is touched.
    pub fn new(config: Config, transforms: TransformRegistry) -> CubeResult<Self> {
        config.validate(&transforms)?;
        let stores = StoreRegistry::new(config.store_params()?);
        let resolver = GridMappingResolver::from_config(&config)?;
        let run = RunContext::from_general(&config.general)?;
        let preload = PreloadCoordinator::new(run.preload.clone());
        Ok(Self {
            config,
            stores,
            resolver,
            transforms,
            run,
            preload,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stores(&self) -> &StoreRegistry {
        &self.stores
    }

    /// Generate every configured dataset, returning the run report.
    pub async fn run(&self) -> RunReport {
        self.submit_preloads().await;

        let mut report = RunReport::default();
        for spec in &self.config.datasets {
            report.push(self.generate(spec).await);
        }
        info!(
            succeeded = report.succeeded(),
            skipped = report.skipped(),
            failed = report.failed(),
            "run finished"
        );
        report
    }

    /// Kick off all configured preloads up front so staging overlaps
    /// with earlier datasets. Submission failures are recorded in the
    /// coordinator; only the datasets reading those ids fail later.
    async fn submit_preloads(&self) {
        for spec in &self.config.preload_datasets {
            let store = match self.stores.get(&spec.store) {
                Ok(store) => store,
                Err(e) => {
                    error!(store = %spec.store, error = %e, "cannot construct preload store");
                    continue;
                }
            };
            info!(store = %spec.store, count = spec.data_ids.len(), "submitting preload");
            if let Err(e) = self.preload.submit(&store, &spec.data_ids).await {
                error!(store = %spec.store, error = %e, "preload submission failed");
            }
        }
    }

    async fn generate(&self, spec: &DatasetSpec) -> DatasetReport {
        info!(dataset = %spec.identifier, "generating dataset");
        match self.generate_inner(spec).await {
            Ok(true) => DatasetReport::succeeded(&spec.identifier),
            Ok(false) => DatasetReport::skipped(&spec.identifier),
            Err(e) => {
                error!(
                    dataset = %spec.identifier,
                    stage = %e.stage,
                    error = %e.error,
                    "dataset generation failed"
                );
                DatasetReport::failed(&spec.identifier, e.stage, e.error.to_string())
            }
        }
    }

    /// Returns `Ok(false)` when the output already exists and
    /// regeneration is not forced.
    async fn generate_inner(&self, spec: &DatasetSpec) -> Result<bool, StageError> {
        let storage = self.stores.get(OUTPUT_STORE).map_err(at(Stage::Write))?;
        let output_id = spec.output_data_id();
        if !self.config.general.force_regenerate && storage.has_data(&output_id).await {
            info!(dataset = %spec.identifier, data_id = %output_id, "output exists, skipping");
            return Ok(false);
        }

        let mut cubes = Vec::with_capacity(spec.sources().len());
        for source in spec.sources() {
            let store = self.stores.get(source.store).map_err(at(Stage::Source))?;
            if self.preload.is_requested(store.name(), source.data_id) {
                self.preload
                    .wait_ready(&store, source.data_id)
                    .await
                    .map_err(at(Stage::Source))?;
            }
            let open_params = store_open_params(source.open_params).map_err(at(Stage::Source))?;
            let mut cube = store
                .open_data(source.data_id, &open_params)
                .await
                .map_err(at(Stage::Source))?
                .cleaned();

            if let Some(processing) = source.custom_processing {
                let transform = self
                    .transforms
                    .get(&processing.function_name)
                    .ok_or_else(|| StageError {
                        stage: Stage::Process,
                        error: CubeError::Config(format!(
                            "unknown processing function '{}'",
                            processing.function_name
                        )),
                    })?;
                cube = transform(cube).map_err(at(Stage::Process))?;
            }

            // renaming is a fusion concern; single-source datasets keep
            // their native variable names
            if spec.is_multi() {
                cube = cube.with_vars_renamed(source.identifier);
            }
            cubes.push((source, cube));
        }

        let grid = match &spec.grid_mapping {
            Some(reference) => Some(
                self.resolver
                    .resolve(reference, &self.config, &self.stores)
                    .await
                    .map_err(at(Stage::Harmonize))?,
            ),
            None => None,
        };

        let mut harmonized = Vec::with_capacity(cubes.len());
        for (source, cube) in cubes {
            let mut cube = cube;
            if let Some(grid) = &grid {
                cube = harmonize_to_grid(&cube, grid, spec.resampling, spec.fill_value)
                    .map_err(at(Stage::Harmonize))?;
            }
            if let Some(point) = point_params(source.open_params).map_err(at(Stage::Harmonize))? {
                cube = extract_point(&cube, &point, spec.resampling)
                    .map_err(at(Stage::Harmonize))?;
            }
            harmonized.push(cube);
        }

        let cube: DataCube = if spec.is_multi() {
            fuse(harmonized).map_err(at(Stage::Fuse))?
        } else {
            harmonized
                .into_iter()
                .next()
                .ok_or_else(|| StageError {
                    stage: Stage::Harmonize,
                    error: CubeError::Harmonize("dataset produced no source cube".to_string()),
                })?
        };

        writer::write_dataset(&storage, &cube, spec, &self.run.eval)
            .await
            .map_err(at(Stage::Write))?;
        Ok(true)
    }
}
