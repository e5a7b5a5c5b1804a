//! Imagery layers the server can answer requests for.
//!
//! Custom layers are bounded by a GeoJSON file of shapes; a layer whose shapes
//! cannot be read stays listed but is not servable.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Where a layer's imagery comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataLayerKind {
    /// Tiles fetched from a remote basemap; downloads are not offered.
    RemoteBasemap,
    /// Imagery looked up through the national tile index.
    NationalTileIndex,
    /// A local raster masked by the shapes in `shapes_file`.
    Custom,
}

/// Configured layer, with paths relative to the data root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerEntry {
    pub name: String,
    pub kind: DataLayerKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shapes_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_file: Option<PathBuf>,
    /// Extra pixels read around a request so the network sees a full window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub padding: Option<u32>,
}

impl LayerEntry {
    fn new(name: &str, kind: DataLayerKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            shapes_file: None,
            data_file: None,
            padding: None,
        }
    }

    fn custom(name: &str, shapes: &str, data: &str, padding: Option<u32>) -> Self {
        Self {
            shapes_file: Some(PathBuf::from(shapes)),
            data_file: Some(PathBuf::from(data)),
            padding,
            ..Self::new(name, DataLayerKind::Custom)
        }
    }
}

/// The stock layer list.
pub fn default_layers() -> Vec<LayerEntry> {
    use DataLayerKind::*;
    vec![
        LayerEntry::new("esri_world_imagery", RemoteBasemap),
        LayerEntry::new("esri_world_imagery_naip", NationalTileIndex),
        LayerEntry::new("osm", RemoteBasemap),
        LayerEntry::new("chesapeake", NationalTileIndex),
        LayerEntry::new("demo_set_1", NationalTileIndex),
        LayerEntry::new("user_study_1", NationalTileIndex),
        LayerEntry::new("user_study_2", NationalTileIndex),
        LayerEntry::new("user_study_3", NationalTileIndex),
        LayerEntry::new("user_study_4", NationalTileIndex),
        LayerEntry::custom(
            "user_study_5",
            "shapes/user_study_5_outline.geojson",
            "tiles/user_study_5.tif",
            Some(20),
        ),
        LayerEntry::new("philipsburg_mt", NationalTileIndex),
        LayerEntry::custom(
            "yangon",
            "shapes/yangon_grid_shapes.geojson",
            "tiles/yangon.tif",
            Some(1100),
        ),
        LayerEntry::new("aceh", Custom),
        LayerEntry::custom("hcmc", "shapes/hcmc_wards.geojson", "tiles/HCMC.tif", None),
        LayerEntry::custom(
            "hcmc_sentinel",
            "shapes/hcmc_sentinel_districts.geojson",
            "tiles/hcmc_sentinel.tif",
            Some(1100),
        ),
        LayerEntry::custom(
            "yangon_lidar",
            "shapes/yangon_wards.geojson",
            "tiles/yangon_lidar.tif",
            None,
        ),
    ]
}

/// Shapes read from a layer's GeoJSON file.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerShapes {
    /// One GeoJSON geometry object per feature.
    pub geometries: Vec<Value>,
    /// Named CRS from the file, if it declares one.
    pub crs: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DataLayer {
    pub entry: LayerEntry,
    pub data_path: Option<PathBuf>,
    pub shapes: Option<LayerShapes>,
    servable: bool,
}

impl DataLayer {
    pub fn name(&self) -> &str {
        &self.entry.name
    }

    pub fn is_servable(&self) -> bool {
        self.servable
    }
}

#[derive(Debug, Clone, Default)]
pub struct LayerRegistry {
    layers: Vec<DataLayer>,
}

impl LayerRegistry {
    /// Resolve every entry against `root` and read its shapes file.
    ///
    /// Never fails as a whole: unreadable shapes only disable their layer.
    pub fn load(root: &Path, entries: &[LayerEntry]) -> Self {
        let layers = entries
            .iter()
            .map(|entry| load_layer(root, entry))
            .collect();
        Self { layers }
    }

    pub fn get(&self, name: &str) -> Option<&DataLayer> {
        self.layers.iter().find(|layer| layer.name() == name)
    }

    pub fn layers(&self) -> &[DataLayer] {
        &self.layers
    }

    pub fn servable(&self) -> impl Iterator<Item = &DataLayer> {
        self.layers.iter().filter(|layer| layer.servable)
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

fn load_layer(root: &Path, entry: &LayerEntry) -> DataLayer {
    let data_path = entry.data_file.as_ref().map(|p| root.join(p));
    let Some(shapes_file) = entry.shapes_file.as_ref() else {
        return DataLayer {
            entry: entry.clone(),
            data_path,
            shapes: None,
            servable: true,
        };
    };
    let path = root.join(shapes_file);
    let shapes = match read_shapes(&path) {
        Ok(shapes) => {
            debug!(
                "Loaded {} shapes for layer '{}'",
                shapes.geometries.len(),
                entry.name
            );
            Some(shapes)
        }
        Err(err) => {
            warn!(
                "{}: {err}; this server will not be able to serve the '{}' dataset",
                path.display(),
                entry.name
            );
            None
        }
    };
    DataLayer {
        entry: entry.clone(),
        data_path,
        servable: shapes.is_some(),
        shapes,
    }
}

fn read_shapes(path: &Path) -> Result<LayerShapes, String> {
    if !path.exists() {
        return Err("file doesn't exist".to_string());
    }
    let text = fs::read_to_string(path).map_err(|err| format!("read failed: {err}"))?;
    parse_geojson(&text)
}

/// Extract geometries and the named CRS from a GeoJSON document.
pub fn parse_geojson(text: &str) -> Result<LayerShapes, String> {
    let doc: Value = serde_json::from_str(text).map_err(|err| format!("invalid GeoJSON: {err}"))?;
    let crs = doc
        .pointer("/crs/properties/name")
        .and_then(Value::as_str)
        .map(str::to_string);
    let geometries = match doc.get("type").and_then(Value::as_str) {
        Some("FeatureCollection") => doc
            .get("features")
            .and_then(Value::as_array)
            .ok_or_else(|| "FeatureCollection without features".to_string())?
            .iter()
            .map(|feature| {
                feature
                    .get("geometry")
                    .filter(|geometry| !geometry.is_null())
                    .cloned()
                    .ok_or_else(|| "feature without geometry".to_string())
            })
            .collect::<Result<Vec<_>, _>>()?,
        Some("Feature") => vec![
            doc.get("geometry")
                .cloned()
                .ok_or_else(|| "feature without geometry".to_string())?,
        ],
        Some(_) if doc.get("coordinates").is_some() || doc.get("geometries").is_some() => {
            vec![doc.clone()]
        }
        other => return Err(format!("unsupported GeoJSON type {other:?}")),
    };
    Ok(LayerShapes { geometries, crs })
}

#[cfg(test)]
mod tests {
    use super::*;

    const WARDS: &str = r#"{
        "type": "FeatureCollection",
        "crs": { "type": "name", "properties": { "name": "EPSG:32647" } },
        "features": [
            { "type": "Feature", "properties": {}, "geometry": { "type": "Point", "coordinates": [1, 2] } },
            { "type": "Feature", "properties": {}, "geometry": { "type": "Polygon", "coordinates": [[[0,0],[1,0],[1,1],[0,0]]] } }
        ]
    }"#;

    #[test]
    fn stock_layers_keep_custom_paths() {
        let layers = default_layers();
        let yangon = layers.iter().find(|l| l.name == "yangon").unwrap();
        assert_eq!(yangon.kind, DataLayerKind::Custom);
        assert_eq!(yangon.padding, Some(1100));
        assert_eq!(
            yangon.shapes_file.as_deref(),
            Some(Path::new("shapes/yangon_grid_shapes.geojson"))
        );
        assert_eq!(layers.len(), 16);
    }

    #[test]
    fn parses_feature_collection_with_crs() {
        let shapes = parse_geojson(WARDS).unwrap();
        assert_eq!(shapes.geometries.len(), 2);
        assert_eq!(shapes.crs.as_deref(), Some("EPSG:32647"));
        assert_eq!(shapes.geometries[1]["type"], "Polygon");
    }

    #[test]
    fn missing_or_broken_shapes_disable_only_that_layer() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("shapes")).unwrap();
        fs::write(dir.path().join("shapes/good.geojson"), WARDS).unwrap();
        fs::write(dir.path().join("shapes/bad.geojson"), "{ not json").unwrap();
        let entries = vec![
            LayerEntry::new("remote", DataLayerKind::RemoteBasemap),
            LayerEntry::custom("good", "shapes/good.geojson", "tiles/good.tif", Some(20)),
            LayerEntry::custom("bad", "shapes/bad.geojson", "tiles/bad.tif", None),
            LayerEntry::custom("missing", "shapes/none.geojson", "tiles/none.tif", None),
        ];
        let registry = LayerRegistry::load(dir.path(), &entries);
        let servable: Vec<&str> = registry.servable().map(DataLayer::name).collect();
        assert_eq!(servable, vec!["remote", "good"]);
        let good = registry.get("good").unwrap();
        assert_eq!(good.data_path, Some(dir.path().join("tiles/good.tif")));
        assert_eq!(good.shapes.as_ref().unwrap().geometries.len(), 2);
        assert!(!registry.get("missing").unwrap().is_servable());
    }

    #[test]
    fn entries_round_trip_through_toml() {
        #[derive(Serialize, Deserialize)]
        struct Wrapper {
            layers: Vec<LayerEntry>,
        }
        let text = toml::to_string(&Wrapper {
            layers: default_layers(),
        })
        .unwrap();
        assert!(text.contains("kind = \"national_tile_index\""));
        let parsed: Wrapper = toml::from_str(&text).unwrap();
        assert_eq!(parsed.layers, default_layers());
    }
}
