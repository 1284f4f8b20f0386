//! GPS geotagging from embedded EXIF metadata.
//!
//! Missing or unreadable location data is an expected outcome for most
//! uploads: it surfaces as `(None, None)`, never as an error.

use std::io::Cursor;

use exif::{In, Tag, Value};

/// Degrees, minutes, seconds.
pub type Dms = [f64; 3];

/// The location block of an image's EXIF data.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GpsInfo {
    pub latitude: Option<Dms>,
    pub latitude_ref: Option<String>,
    pub longitude: Option<Dms>,
    pub longitude_ref: Option<String>,
}

impl GpsInfo {
    fn is_empty(&self) -> bool {
        self.latitude.is_none()
            && self.latitude_ref.is_none()
            && self.longitude.is_none()
            && self.longitude_ref.is_none()
    }
}

/// Reads the GPS block from raw image bytes.
///
/// Returns `None` when the container carries no EXIF data or the EXIF data has
/// no GPS tags.
pub fn read_gps_info(image_data: &[u8]) -> Option<GpsInfo> {
    let mut cursor = Cursor::new(image_data);
    let exif = exif::Reader::new().read_from_container(&mut cursor).ok()?;

    let dms = |tag| {
        exif.get_field(tag, In::PRIMARY)
            .and_then(|field| rational_triple(&field.value))
    };
    let reference = |tag| {
        exif.get_field(tag, In::PRIMARY)
            .and_then(|field| first_ascii(&field.value))
    };

    let info = GpsInfo {
        latitude: dms(Tag::GPSLatitude),
        latitude_ref: reference(Tag::GPSLatitudeRef),
        longitude: dms(Tag::GPSLongitude),
        longitude_ref: reference(Tag::GPSLongitudeRef),
    };

    (!info.is_empty()).then_some(info)
}

fn rational_triple(value: &Value) -> Option<Dms> {
    match value {
        Value::Rational(parts) if parts.len() >= 3 => {
            let dms = [parts[0].to_f64(), parts[1].to_f64(), parts[2].to_f64()];
            // Zero denominators show up in the wild.
            dms.iter().all(|v| v.is_finite()).then_some(dms)
        }
        _ => None,
    }
}

fn first_ascii(value: &Value) -> Option<String> {
    match value {
        Value::Ascii(strings) => strings
            .first()
            .map(|s| String::from_utf8_lossy(s).trim().to_string())
            .filter(|s| !s.is_empty()),
        _ => None,
    }
}

pub fn convert_to_degrees([degrees, minutes, seconds]: Dms) -> f64 {
    degrees + minutes / 60.0 + seconds / 3600.0
}

/// Converts a GPS block to signed decimal `(latitude, longitude)`.
///
/// Latitude is negated unless its reference is `N`, longitude unless it is
/// `E`. A coordinate without both its value and its reference, or one that
/// is not a finite number, is `None`.
pub fn get_decimal_coordinates(info: &GpsInfo) -> (Option<f64>, Option<f64>) {
    let signed = |dms: Option<Dms>, reference: Option<&str>, positive: &str| {
        let degrees = convert_to_degrees(dms?);
        if !degrees.is_finite() {
            return None;
        }
        Some(if reference? == positive { degrees } else { -degrees })
    };

    (
        signed(info.latitude, info.latitude_ref.as_deref(), "N"),
        signed(info.longitude, info.longitude_ref.as_deref(), "E"),
    )
}

/// Geotags an image straight from its bytes.
pub fn gps_coordinates(image_data: &[u8]) -> (Option<f64>, Option<f64>) {
    read_gps_info(image_data)
        .map(|info| get_decimal_coordinates(&info))
        .unwrap_or((None, None))
}
