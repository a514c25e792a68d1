//! Registry of named processing functions.
//!
//! A dataset's `custom_processing.function_name` selects one of these by
//! name; unknown names are rejected at configuration load. Transforms
//! run on freshly opened cubes before harmonization and must keep the
//! result lazy where the input is lazy.

use std::collections::HashMap;
use std::sync::Arc;

use cube_common::{CubeResult, DataCube, LazyArray};

/// A processing function applied to one opened cube.
pub type Transform = Arc<dyn Fn(DataCube) -> CubeResult<DataCube> + Send + Sync>;

/// Named transforms available to a run.
#[derive(Clone, Default)]
pub struct TransformRegistry {
    map: HashMap<String, Transform>,
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in transforms.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("identity", Arc::new(|cube| Ok(cube)));
        registry.register("kelvin_to_celsius", Arc::new(kelvin_to_celsius));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, transform: Transform) {
        self.map.insert(name.into(), transform);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<Transform> {
        self.map.get(name).cloned()
    }
}

impl std::fmt::Debug for TransformRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.map.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("TransformRegistry")
            .field("names", &names)
            .finish()
    }
}

/// Convert every variable from Kelvin to degrees Celsius, lazily.
fn kelvin_to_celsius(mut cube: DataCube) -> CubeResult<DataCube> {
    for variable in cube.vars.values_mut() {
        let source = variable.array.clone();
        variable.array = LazyArray::deferred(source.shape().to_vec(), move |ctx| {
            let values = source.values(ctx)?;
            Ok(values.iter().map(|v| v - 273.15).collect())
        });
        variable
            .attrs
            .insert("units".to_string(), serde_json::json!("degC"));
    }
    Ok(cube)
}
