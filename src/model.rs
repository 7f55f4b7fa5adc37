//! The `Uploadable` metadata the client sends in a pre-request, and the
//! GeoJSON-flavored document this service derives from it for the metadata
//! index (see ingest format in the blob store).

use crate::Error;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The format version this collector accepts. Anything older is
/// `DeprecatedFormatVersion`; anything else is `UnknownFormatVersion`.
pub const CURRENT_FORMAT_VERSION: i32 = 3;

const MAX_SHORT_FIELD_LEN: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    #[serde(rename = "timestampMillis")]
    pub timestamp_millis: i64,
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoLocation {
    fn validate(&self) -> Result<(), Error> {
        if !(-90.0..=90.0).contains(&self.latitude) {
            return Err(Error::InvalidMetaData(format!(
                "latitude {} out of range [-90, 90]",
                self.latitude
            )));
        }
        if !(-180.0..=180.0).contains(&self.longitude) {
            return Err(Error::InvalidMetaData(format!(
                "longitude {} out of range [-180, 180]",
                self.longitude
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceMetaData {
    #[serde(rename = "operatingSystemVersion")]
    pub operating_system_version: String,
    #[serde(rename = "deviceType")]
    pub device_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationMetaData {
    #[serde(rename = "applicationVersion")]
    pub application_version: String,
    #[serde(rename = "formatVersion")]
    pub format_version: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementMetaData {
    pub length: f64,
    #[serde(rename = "locationCount")]
    pub location_count: u32,
    #[serde(rename = "startLocation")]
    pub start_location: Option<GeoLocation>,
    #[serde(rename = "endLocation")]
    pub end_location: Option<GeoLocation>,
    pub modality: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentMetaData {
    #[serde(rename = "logCount")]
    pub log_count: u32,
    #[serde(rename = "imageCount")]
    pub image_count: u32,
    #[serde(rename = "videoCount")]
    pub video_count: u32,
    #[serde(rename = "filesSize")]
    pub files_size: i64,
}

/// The caller-supplied metadata describing what is being uploaded. Immutable
/// after a pre-request is accepted; stored verbatim in the `Session` and,
/// after a successful commit, alongside the blob in the metadata index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Uploadable {
    #[serde(rename = "deviceId")]
    pub device_id: Uuid,
    #[serde(rename = "measurementId")]
    pub measurement_id: u64,
    #[serde(rename = "deviceMetaData")]
    pub device_meta_data: DeviceMetaData,
    #[serde(rename = "applicationMetaData")]
    pub application_meta_data: ApplicationMetaData,
    #[serde(rename = "measurementMetaData")]
    pub measurement_meta_data: MeasurementMetaData,
    #[serde(rename = "attachmentMetaData", default, skip_serializing_if = "Option::is_none")]
    pub attachment_meta_data: Option<AttachmentMetaData>,
}

fn validate_short_field(name: &str, value: &str) -> Result<(), Error> {
    if value.is_empty() {
        return Err(Error::InvalidMetaData(format!("{name} must not be empty")));
    }
    if value.chars().count() > MAX_SHORT_FIELD_LEN {
        return Err(Error::InvalidMetaData(format!(
            "{name} must be at most {MAX_SHORT_FIELD_LEN} characters"
        )));
    }
    Ok(())
}

impl Uploadable {
    /// Validates every constraint from the data model section of the spec.
    /// The first violated constraint is returned; callers should not expect
    /// an exhaustive list of problems.
    pub fn validate(&self) -> Result<(), Error> {
        if self.measurement_id == 0 {
            return Err(Error::InvalidMetaData(
                "measurementId must be a positive integer".into(),
            ));
        }

        validate_short_field(
            "deviceMetaData.operatingSystemVersion",
            &self.device_meta_data.operating_system_version,
        )?;
        validate_short_field("deviceMetaData.deviceType", &self.device_meta_data.device_type)?;
        validate_short_field(
            "applicationMetaData.applicationVersion",
            &self.application_meta_data.application_version,
        )?;

        if self.application_meta_data.format_version > CURRENT_FORMAT_VERSION {
            return Err(Error::UnknownFormatVersion(
                self.application_meta_data.format_version,
                CURRENT_FORMAT_VERSION,
            ));
        }
        if self.application_meta_data.format_version < CURRENT_FORMAT_VERSION {
            return Err(Error::DeprecatedFormatVersion(
                self.application_meta_data.format_version,
                CURRENT_FORMAT_VERSION,
            ));
        }

        if self.measurement_meta_data.length < 0.0 {
            return Err(Error::InvalidMetaData(
                "measurementMetaData.length must be >= 0".into(),
            ));
        }
        validate_short_field("measurementMetaData.modality", &self.measurement_meta_data.modality)?;
        if let Some(start) = &self.measurement_meta_data.start_location {
            start.validate()?;
        }
        if let Some(end) = &self.measurement_meta_data.end_location {
            end.validate()?;
        }

        if let Some(attachment) = &self.attachment_meta_data {
            if attachment.log_count == 0 && attachment.image_count == 0 && attachment.video_count == 0
            {
                return Err(Error::InvalidMetaData(
                    "attachmentMetaData must declare at least one file".into(),
                ));
            }
        }

        Ok(())
    }

    /// The `412 Precondition Failed` "skip this upload" policy decision
    /// (§4.2 step 3). Distinct from hard validation failures: the payload is
    /// well-formed but semantically uninteresting.
    pub fn should_skip(&self) -> Result<(), Error> {
        if self.measurement_meta_data.location_count < 2 {
            return Err(Error::TooFewLocations(self.measurement_meta_data.location_count));
        }
        if let Some(attachment) = &self.attachment_meta_data {
            if attachment.files_size <= 0 {
                return Err(Error::SkipUpload(
                    "attachment declared with non-positive filesSize".into(),
                ));
            }
        }
        Ok(())
    }

    /// The file type under which this upload's blob is keyed in the metadata
    /// index. The spec keys `StoredMeasurement`s on
    /// `(deviceId, measurementId, fileType)`; this collector always ingests
    /// the measurement binary itself, never a separate attachment stream.
    pub fn file_type(&self) -> &'static str {
        "measurement"
    }
}

/// A point in the GeoJSON-compatible shape the metadata index document uses:
/// `{ type: "Point", coordinates: [lon, lat] }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoJsonPoint {
    #[serde(rename = "type")]
    pub kind: String,
    pub coordinates: [f64; 2],
}

impl From<&GeoLocation> for GeoJsonPoint {
    fn from(location: &GeoLocation) -> Self {
        GeoJsonPoint {
            kind: "Point".to_owned(),
            coordinates: [location.longitude, location.latitude],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoJsonLocation {
    pub location: GeoJsonPoint,
    pub timestamp: i64,
}

/// The exact document shape the blob store's metadata index stores alongside
/// a blob, bit-exact with the field names in the spec's "Blob-store metadata
/// document" section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataDocument {
    pub metadata: MetadataFields,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<GeoJsonLocation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<GeoJsonLocation>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataFields {
    #[serde(rename = "deviceId")]
    pub device_id: Uuid,
    #[serde(rename = "measurementId")]
    pub measurement_id: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "osVersion")]
    pub os_version: String,
    #[serde(rename = "deviceType")]
    pub device_type: String,
    #[serde(rename = "appVersion")]
    pub app_version: String,
    pub length: f64,
    #[serde(rename = "locationCount")]
    pub location_count: u32,
    pub modality: String,
    #[serde(rename = "formatVersion")]
    pub format_version: i32,
}

impl MetadataDocument {
    pub fn from_uploadable(uploadable: &Uploadable, user_id: &str) -> Self {
        MetadataDocument {
            metadata: MetadataFields {
                device_id: uploadable.device_id,
                measurement_id: uploadable.measurement_id.to_string(),
                user_id: user_id.to_owned(),
                os_version: uploadable.device_meta_data.operating_system_version.clone(),
                device_type: uploadable.device_meta_data.device_type.clone(),
                app_version: uploadable.application_meta_data.application_version.clone(),
                length: uploadable.measurement_meta_data.length,
                location_count: uploadable.measurement_meta_data.location_count,
                modality: uploadable.measurement_meta_data.modality.clone(),
                format_version: uploadable.application_meta_data.format_version,
            },
            start: uploadable
                .measurement_meta_data
                .start_location
                .as_ref()
                .map(|l| GeoJsonLocation {
                    location: l.into(),
                    timestamp: l.timestamp_millis,
                }),
            end: uploadable
                .measurement_meta_data
                .end_location
                .as_ref()
                .map(|l| GeoJsonLocation {
                    location: l.into(),
                    timestamp: l.timestamp_millis,
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_uploadable() -> Uploadable {
        Uploadable {
            device_id: Uuid::new_v4(),
            measurement_id: 1,
            device_meta_data: DeviceMetaData {
                operating_system_version: "14".into(),
                device_type: "Pixel 7".into(),
            },
            application_meta_data: ApplicationMetaData {
                application_version: "1.2.3".into(),
                format_version: CURRENT_FORMAT_VERSION,
            },
            measurement_meta_data: MeasurementMetaData {
                length: 0.0,
                location_count: 2,
                start_location: Some(GeoLocation {
                    timestamp_millis: 1000,
                    latitude: 51.0,
                    longitude: 13.7,
                }),
                end_location: Some(GeoLocation {
                    timestamp_millis: 2000,
                    latitude: 51.1,
                    longitude: 13.8,
                }),
                modality: "BICYCLE".into(),
            },
            attachment_meta_data: None,
        }
    }

    #[test]
    fn valid_uploadable_passes() {
        assert!(valid_uploadable().validate().is_ok());
        assert!(valid_uploadable().should_skip().is_ok());
    }

    #[test]
    fn rejects_deprecated_format_version() {
        let mut u = valid_uploadable();
        u.application_meta_data.format_version = 2;
        assert_matches::assert_matches!(u.validate(), Err(Error::DeprecatedFormatVersion(2, 3)));
    }

    #[test]
    fn rejects_unknown_format_version() {
        let mut u = valid_uploadable();
        u.application_meta_data.format_version = 4;
        assert_matches::assert_matches!(u.validate(), Err(Error::UnknownFormatVersion(4, 3)));
    }

    #[test]
    fn rejects_out_of_range_latitude() {
        let mut u = valid_uploadable();
        u.measurement_meta_data.start_location = Some(GeoLocation {
            timestamp_millis: 0,
            latitude: 91.0,
            longitude: 0.0,
        });
        assert_matches::assert_matches!(u.validate(), Err(Error::InvalidMetaData(_)));
    }

    #[test]
    fn rejects_empty_device_type() {
        let mut u = valid_uploadable();
        u.device_meta_data.device_type = "".into();
        assert_matches::assert_matches!(u.validate(), Err(Error::InvalidMetaData(_)));
    }

    #[test]
    fn rejects_too_few_locations() {
        let mut u = valid_uploadable();
        u.measurement_meta_data.location_count = 1;
        assert_matches::assert_matches!(u.should_skip(), Err(Error::TooFewLocations(1)));
    }

    #[test]
    fn rejects_zero_measurement_id() {
        let mut u = valid_uploadable();
        u.measurement_id = 0;
        assert_matches::assert_matches!(u.validate(), Err(Error::InvalidMetaData(_)));
    }

    #[test]
    fn non_positive_attachment_files_size_is_a_skip_not_a_validation_error() {
        let mut u = valid_uploadable();
        u.attachment_meta_data = Some(AttachmentMetaData {
            log_count: 1,
            image_count: 0,
            video_count: 0,
            files_size: 0,
        });
        assert!(u.validate().is_ok());
        assert_matches::assert_matches!(u.should_skip(), Err(Error::SkipUpload(_)));
    }

    #[test]
    fn metadata_document_round_trips_field_values() {
        let u = valid_uploadable();
        let doc = MetadataDocument::from_uploadable(&u, "user-1");
        assert_eq!(doc.metadata.device_id, u.device_id);
        assert_eq!(doc.metadata.measurement_id, "1");
        assert_eq!(doc.metadata.user_id, "user-1");
        assert_eq!(
            doc.start.unwrap().location.coordinates,
            [13.7, 51.0]
        );
    }
}
