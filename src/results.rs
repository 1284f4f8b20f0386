//! Severity tiers and the downloadable CSV / GeoJSON result files.

use std::{
    fmt,
    io::Write,
    path::{Path, PathBuf},
};

use serde::Serialize;
use tempfile::NamedTempFile;
use thiserror::Error;

pub const CSV_FILE_NAME: &str = "results.csv";
pub const GEOJSON_FILE_NAME: &str = "results.geojson";

const CSV_HEADER: [&str; 5] = ["filename", "prediction", "classification", "latitude", "longitude"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum Tier {
    #[serde(rename = "THIS PICTURE HAS OAK WILT")]
    HasOakWilt,
    #[serde(rename = "THERE'S A HIGH CHANCE OF OAK WILTS")]
    HighChance,
    #[serde(rename = "CHANGES OF COLORS ON TREE LEAVES")]
    LeafColorChange,
    #[serde(rename = "Not an Oak Wilt")]
    NotOakWilt,
}

impl Tier {
    /// Highest severity first.
    pub const ALL: [Tier; 4] = [
        Tier::HasOakWilt,
        Tier::HighChance,
        Tier::LeafColorChange,
        Tier::NotOakWilt,
    ];

    /// Buckets a prediction expressed as a percentage in `[0, 100]`.
    pub fn from_percentage(percentage: f64) -> Self {
        if percentage > 99.5 {
            Tier::HasOakWilt
        } else if percentage > 90.0 {
            Tier::HighChance
        } else if percentage > 70.0 {
            Tier::LeafColorChange
        } else {
            Tier::NotOakWilt
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Tier::HasOakWilt => "THIS PICTURE HAS OAK WILT",
            Tier::HighChance => "THERE'S A HIGH CHANCE OF OAK WILTS",
            Tier::LeafColorChange => "CHANGES OF COLORS ON TREE LEAVES",
            Tier::NotOakWilt => "Not an Oak Wilt",
        }
    }

    /// Whether results in this tier go into the downloadable files.
    pub fn is_exported(self) -> bool {
        self != Tier::NotOakWilt
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(into = "PredictionRecord")]
pub struct PredictionResult {
    pub filename: String,
    pub probability: f32,
    pub classification: Tier,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl PredictionResult {
    pub fn new(
        filename: impl Into<String>,
        probability: f32,
        (latitude, longitude): (Option<f64>, Option<f64>),
    ) -> Self {
        let probability = probability.clamp(0.0, 1.0);
        // Scale in f32 so 0.995 lands on 99.5, not 99.5000004.
        let percentage = f64::from(probability * 100.0);
        Self {
            filename: filename.into(),
            probability,
            classification: Tier::from_percentage(percentage),
            latitude,
            longitude,
        }
    }

    pub fn percentage(&self) -> f64 {
        f64::from(self.probability * 100.0)
    }

    /// `"99.80%"`
    pub fn prediction_label(&self) -> String {
        format!("{:.2}%", self.percentage())
    }

    pub fn coordinates(&self) -> Option<(f64, f64)> {
        Some((self.latitude?, self.longitude?))
    }
}

/// Flat wire / CSV shape of a [`PredictionResult`].
#[derive(Debug, Serialize)]
struct PredictionRecord {
    filename: String,
    prediction: String,
    classification: Tier,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

impl From<PredictionResult> for PredictionRecord {
    fn from(result: PredictionResult) -> Self {
        Self {
            prediction: result.prediction_label(),
            filename: result.filename,
            classification: result.classification,
            latitude: result.latitude,
            longitude: result.longitude,
        }
    }
}

/// Predictions of one upload batch, bucketed by tier.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TierMap {
    #[serde(rename = "THIS PICTURE HAS OAK WILT")]
    has_oak_wilt: Vec<PredictionResult>,
    #[serde(rename = "THERE'S A HIGH CHANCE OF OAK WILTS")]
    high_chance: Vec<PredictionResult>,
    #[serde(rename = "CHANGES OF COLORS ON TREE LEAVES")]
    leaf_color_change: Vec<PredictionResult>,
    #[serde(rename = "Not an Oak Wilt")]
    not_oak_wilt: Vec<PredictionResult>,
}

impl TierMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, result: PredictionResult) {
        self.bucket_mut(result.classification).push(result);
    }

    pub fn get(&self, tier: Tier) -> &[PredictionResult] {
        match tier {
            Tier::HasOakWilt => &self.has_oak_wilt,
            Tier::HighChance => &self.high_chance,
            Tier::LeafColorChange => &self.leaf_color_change,
            Tier::NotOakWilt => &self.not_oak_wilt,
        }
    }

    fn bucket_mut(&mut self, tier: Tier) -> &mut Vec<PredictionResult> {
        match tier {
            Tier::HasOakWilt => &mut self.has_oak_wilt,
            Tier::HighChance => &mut self.high_chance,
            Tier::LeafColorChange => &mut self.leaf_color_change,
            Tier::NotOakWilt => &mut self.not_oak_wilt,
        }
    }

    pub fn len(&self) -> usize {
        Tier::ALL.iter().map(|tier| self.get(*tier).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Results that belong in the exported files, most severe tier first.
    pub fn exported(&self) -> impl Iterator<Item = &PredictionResult> {
        Tier::ALL
            .into_iter()
            .filter(|tier| tier.is_exported())
            .flat_map(move |tier| self.get(tier).iter())
    }
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to move result file into place: {0}")]
    Persist(#[from] tempfile::PersistError),
}

pub fn render_csv(results: &TierMap) -> Result<Vec<u8>, ExportError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record(CSV_HEADER)?;
    for result in results.exported() {
        writer.serialize(PredictionRecord::from(result.clone()))?;
    }
    writer.into_inner().map_err(|err| ExportError::Io(err.into_error()))
}

#[derive(Debug, Serialize)]
struct FeatureCollection<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    features: Vec<Feature<'a>>,
}

#[derive(Debug, Serialize)]
struct Feature<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    properties: FeatureProperties<'a>,
    geometry: Point,
}

#[derive(Debug, Serialize)]
struct FeatureProperties<'a> {
    filename: &'a str,
    prediction: String,
    classification: Tier,
}

#[derive(Debug, Serialize)]
struct Point {
    #[serde(rename = "type")]
    kind: &'static str,
    /// `[longitude, latitude]`
    coordinates: [f64; 2],
}

/// Point features for exported results that carry both coordinates.
pub fn render_geojson(results: &TierMap) -> Result<Vec<u8>, ExportError> {
    let features = results
        .exported()
        .filter_map(|result| {
            let (latitude, longitude) = result.coordinates()?;
            Some(Feature {
                kind: "Feature",
                properties: FeatureProperties {
                    filename: &result.filename,
                    prediction: result.prediction_label(),
                    classification: result.classification,
                },
                geometry: Point {
                    kind: "Point",
                    coordinates: [longitude, latitude],
                },
            })
        })
        .collect();

    let collection = FeatureCollection {
        kind: "FeatureCollection",
        features,
    };
    Ok(serde_json::to_vec(&collection)?)
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResultFiles {
    pub csv: PathBuf,
    pub geojson: PathBuf,
}

/// Regenerates both result files in `dir`.
///
/// Each file is written to a temporary sibling first and renamed into place.
pub fn write_result_files(dir: &Path, results: &TierMap) -> Result<ResultFiles, ExportError> {
    std::fs::create_dir_all(dir)?;
    let csv = dir.join(CSV_FILE_NAME);
    let geojson = dir.join(GEOJSON_FILE_NAME);

    write_atomic(&csv, &render_csv(results)?)?;
    write_atomic(&geojson, &render_geojson(results)?)?;

    Ok(ResultFiles { csv, geojson })
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), ExportError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(contents)?;
    file.flush()?;
    file.persist(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    fn sample_map() -> TierMap {
        let mut map = TierMap::new();
        map.push(PredictionResult::new("wilt.jpg", 0.998, (Some(30.264), Some(-97.743))));
        map.push(PredictionResult::new("nogps.jpg", 0.95, (None, None)));
        map.push(PredictionResult::new("half.jpg", 0.8, (Some(1.0), None)));
        map.push(PredictionResult::new("healthy.jpg", 0.5, (Some(2.0), Some(3.0))));
        map
    }

    #[test]
    fn tier_boundaries() {
        assert_eq!(Tier::from_percentage(100.0), Tier::HasOakWilt);
        assert_eq!(Tier::from_percentage(99.51), Tier::HasOakWilt);
        assert_eq!(Tier::from_percentage(99.5), Tier::HighChance);
        assert_eq!(Tier::from_percentage(90.01), Tier::HighChance);
        assert_eq!(Tier::from_percentage(90.0), Tier::LeafColorChange);
        assert_eq!(Tier::from_percentage(70.01), Tier::LeafColorChange);
        assert_eq!(Tier::from_percentage(70.0), Tier::NotOakWilt);
        assert_eq!(Tier::from_percentage(0.0), Tier::NotOakWilt);
    }

    #[test]
    fn tiers_partition_the_percentage_range() {
        let bands: [(Tier, fn(f64) -> bool); 4] = [
            (Tier::HasOakWilt, |p| p > 99.5),
            (Tier::HighChance, |p| p > 90.0 && p <= 99.5),
            (Tier::LeafColorChange, |p| p > 70.0 && p <= 90.0),
            (Tier::NotOakWilt, |p| p <= 70.0),
        ];
        for step in 0..=100_000 {
            let p = step as f64 / 1000.0;
            let matching: Vec<Tier> = bands
                .iter()
                .filter(|(_, contains)| contains(p))
                .map(|(tier, _)| *tier)
                .collect();
            assert_eq!(matching, vec![Tier::from_percentage(p)], "p = {p}");
        }
    }

    #[test]
    fn prediction_label_has_two_decimals() {
        let result = PredictionResult::new("a.jpg", 0.998, (None, None));
        assert_eq!(result.prediction_label(), "99.80%");
        assert_eq!(result.classification, Tier::HasOakWilt);
    }

    #[test]
    fn model_outputs_on_tier_edges() {
        let cases = [
            (0.996f32, Tier::HasOakWilt, "99.60%"),
            (0.995, Tier::HighChance, "99.50%"),
            (0.9, Tier::LeafColorChange, "90.00%"),
            (0.7, Tier::NotOakWilt, "70.00%"),
        ];
        for (probability, tier, label) in cases {
            let result = PredictionResult::new("edge.jpg", probability, (None, None));
            assert_eq!(result.classification, tier, "probability {probability}");
            assert_eq!(result.prediction_label(), label);
            assert_eq!(Tier::from_percentage(result.percentage()), tier);
        }
    }

    #[test]
    fn tier_map_serializes_all_four_buckets() {
        let json = serde_json::to_value(sample_map()).unwrap();
        let object = json.as_object().unwrap();
        assert_eq!(object.len(), 4);
        assert_eq!(object["Not an Oak Wilt"][0]["filename"], "healthy.jpg");
        assert_eq!(object["THIS PICTURE HAS OAK WILT"][0]["prediction"], "99.80%");
        assert_eq!(object["THERE'S A HIGH CHANCE OF OAK WILTS"][0]["latitude"], Value::Null);
    }

    #[test]
    fn csv_skips_not_oak_wilt() {
        let csv = String::from_utf8(render_csv(&sample_map()).unwrap()).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "filename,prediction,classification,latitude,longitude");
        assert_eq!(lines.len(), 4);
        assert!(lines[1].starts_with("wilt.jpg,99.80%,THIS PICTURE HAS OAK WILT,30.264,-97.743"));
        assert_eq!(lines[2], "nogps.jpg,95.00%,THERE'S A HIGH CHANCE OF OAK WILTS,,");
        assert!(!csv.contains("healthy.jpg"));
    }

    #[test]
    fn geojson_needs_both_coordinates() {
        let json: Value = serde_json::from_slice(&render_geojson(&sample_map()).unwrap()).unwrap();
        assert_eq!(json["type"], "FeatureCollection");
        let features = json["features"].as_array().unwrap();
        assert_eq!(features.len(), 1);
        assert_eq!(features[0]["properties"]["filename"], "wilt.jpg");
        assert_eq!(features[0]["properties"]["classification"], "THIS PICTURE HAS OAK WILT");
        assert_eq!(features[0]["geometry"]["type"], "Point");
        assert_eq!(features[0]["geometry"]["coordinates"][0], -97.743);
        assert_eq!(features[0]["geometry"]["coordinates"][1], 30.264);
    }

    #[test]
    fn empty_batch_still_produces_files() {
        let csv = render_csv(&TierMap::new()).unwrap();
        assert_eq!(csv, b"filename,prediction,classification,latitude,longitude\n");
        let json: Value = serde_json::from_slice(&render_geojson(&TierMap::new()).unwrap()).unwrap();
        assert_eq!(json["features"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn regenerating_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let map = sample_map();

        let first = write_result_files(dir.path(), &map).unwrap();
        let csv_first = std::fs::read(&first.csv).unwrap();
        let geo_first: Value = serde_json::from_slice(&std::fs::read(&first.geojson).unwrap()).unwrap();

        let second = write_result_files(dir.path(), &map).unwrap();
        assert_eq!(first, second);
        assert_eq!(std::fs::read(&second.csv).unwrap(), csv_first);
        let geo_second: Value = serde_json::from_slice(&std::fs::read(&second.geojson).unwrap()).unwrap();
        assert_eq!(geo_first, geo_second);
    }
}
