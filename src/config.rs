//! A1: `AppConfig`, assembled from CLI flags via `clap`, with storage- and
//! duration-path parsing grounded on the reference system's `StoragePath`/
//! `DayDuration` pattern (own typed `FromStr`/`Deserialize` per kind, not a
//! generic URL type).

use clap::{App, Arg, ArgMatches};
use once_cell::sync::Lazy;
use regex::Regex;
use rusoto_core::Region;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
pub enum StorageConfig {
    Local { directory: PathBuf },
    S3 { bucket: String, region: Region },
}

#[derive(Debug, thiserror::Error)]
pub enum StorageConfigParseError {
    #[error("S3 storage must be given as s3://{{region}}/{{bucket}}")]
    InvalidS3Format,
    #[error("unknown region in S3 storage path: {0}")]
    InvalidRegion(#[from] rusoto_core::region::ParseRegionError),
}

impl FromStr for StorageConfig {
    type Err = StorageConfigParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix("s3://") {
            Some(rest) => {
                let mut components = rest.splitn(2, '/');
                let region = Region::from_str(
                    components.next().filter(|s| !s.is_empty()).ok_or(
                        StorageConfigParseError::InvalidS3Format,
                    )?,
                )?;
                let bucket = components
                    .next()
                    .filter(|s| !s.is_empty())
                    .ok_or(StorageConfigParseError::InvalidS3Format)?
                    .to_owned();
                Ok(StorageConfig::S3 { bucket, region })
            }
            None => Ok(StorageConfig::Local { directory: s.into() }),
        }
    }
}

impl<'de> Deserialize<'de> for StorageConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer)?.parse().map_err(de::Error::custom)
    }
}

/// How inbound bearer tokens are verified: against a remote JWKS in
/// production, or a single shared HMAC secret for local development and
/// integration tests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthConfig {
    Jwks { url: String },
    SharedSecret { secret: String },
}

/// A simple duration specified in whole hours, minutes and seconds, used for
/// `uploadExpirationMillis`'s CLI form. Converted to [`std::time::Duration`]
/// with [`MillisDuration::to_duration`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MillisDuration {
    hours: u32,
    minutes: u32,
    seconds: u32,
}

impl MillisDuration {
    pub fn from_hms(hours: u32, minutes: u32, seconds: u32) -> MillisDuration {
        MillisDuration { hours, minutes, seconds }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.hours != 0 && self.minutes >= 60 {
            return Err("minutes > 59 are not allowed if hours is specified".into());
        }
        if (self.hours != 0 || self.minutes != 0) && self.seconds >= 60 {
            return Err("seconds > 59 are not allowed if hours or minutes are specified".into());
        }
        Ok(())
    }

    pub fn to_duration(&self) -> Duration {
        Duration::from_secs(u64::from(self.hours) * 3600 + u64::from(self.minutes) * 60 + u64::from(self.seconds))
    }
}

impl From<MillisDuration> for Duration {
    fn from(d: MillisDuration) -> Duration {
        d.to_duration()
    }
}

impl Display for MillisDuration {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.hours != 0 {
            write!(f, "{}h", self.hours)?;
        }
        if self.minutes != 0 {
            write!(f, "{}m", self.minutes)?;
        }
        if self.seconds != 0 || (self.hours == 0 && self.minutes == 0) {
            write!(f, "{}s", self.seconds)?;
        }
        Ok(())
    }
}

impl FromStr for MillisDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<MillisDuration, String> {
        static RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(?:(\d+)h)?(?:(\d+)m)?(?:(\d+)s)?$").unwrap());

        let groups = RE.captures(s).ok_or("not in expected format (e.g. 1h30m20s)")?;
        let parse_component = |idx, label| -> Result<u32, String> {
            groups
                .get(idx)
                .map_or(Ok(0), |m| u32::from_str(m.as_str()))
                .map_err(|e| format!("failed to parse {label}: {e}"))
        };

        let d = MillisDuration {
            hours: parse_component(1, "hours")?,
            minutes: parse_component(2, "minutes")?,
            seconds: parse_component(3, "seconds")?,
        };
        d.validate()?;
        Ok(d)
    }
}

impl Serialize for MillisDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MillisDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<MillisDuration, D::Error> {
        String::deserialize(deserializer)?.parse().map_err(de::Error::custom)
    }
}

/// The collector's fully resolved, validated configuration. Assembled once at
/// startup by [`AppConfig::from_args`]; a misconfiguration here is an
/// exit-code-1 failure, never a runtime surprise (§4.7).
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub http_host: String,
    pub http_port: u16,
    pub http_path: String,
    pub upload_expiration: Duration,
    pub measurement_payload_limit_bytes: u64,
    pub metrics_enabled: bool,
    pub metrics_port: u16,
    pub storage: StorageConfig,
    pub auth: AuthConfig,
    pub log_level: String,
    pub force_json_logging: bool,
}

impl AppConfig {
    pub fn from_args<I, T>(args: I) -> anyhow::Result<AppConfig>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let matches = app().get_matches_from(args);
        AppConfig::from_matches(&matches)
    }

    fn from_matches(matches: &ArgMatches) -> anyhow::Result<AppConfig> {
        let http_port: u16 = matches.value_of("http-port").unwrap().parse()?;
        let metrics_port: u16 = matches.value_of("metrics-port").unwrap().parse()?;
        let measurement_payload_limit_bytes: u64 =
            matches.value_of("measurement-payload-limit-bytes").unwrap().parse()?;
        let upload_expiration: MillisDuration = matches.value_of("upload-expiration").unwrap().parse()
            .map_err(|e: String| anyhow::anyhow!(e))?;
        let storage: StorageConfig = matches.value_of("storage").unwrap().parse()?;

        let auth = match (matches.value_of("jwks-url"), matches.value_of("shared-secret")) {
            (Some(url), _) => AuthConfig::Jwks { url: url.to_owned() },
            (None, Some(secret)) => AuthConfig::SharedSecret { secret: secret.to_owned() },
            (None, None) => {
                return Err(anyhow::anyhow!(
                    "one of --jwks-url or --shared-secret (or $COLLECTOR_SHARED_SECRET) is required"
                ))
            }
        };

        Ok(AppConfig {
            http_host: matches.value_of("http-host").unwrap().to_owned(),
            http_port,
            http_path: matches.value_of("http-path").unwrap().to_owned(),
            upload_expiration: upload_expiration.into(),
            measurement_payload_limit_bytes,
            metrics_enabled: matches.is_present("metrics-enabled"),
            metrics_port,
            storage,
            auth,
            log_level: matches.value_of("log-level").unwrap().to_owned(),
            force_json_logging: matches.is_present("force-json-logging"),
        })
    }
}

fn app() -> App<'static, 'static> {
    App::new("collector")
        .about("Resumable measurement upload service")
        .arg(Arg::with_name("http-host").long("http-host").env("COLLECTOR_HTTP_HOST").default_value("0.0.0.0"))
        .arg(Arg::with_name("http-port").long("http-port").env("COLLECTOR_HTTP_PORT").default_value("8080"))
        .arg(Arg::with_name("http-path").long("http-path").env("COLLECTOR_HTTP_PATH").default_value("/measurements"))
        .arg(
            Arg::with_name("upload-expiration")
                .long("upload-expiration")
                .env("COLLECTOR_UPLOAD_EXPIRATION")
                .default_value("1h"),
        )
        .arg(
            Arg::with_name("measurement-payload-limit-bytes")
                .long("measurement-payload-limit-bytes")
                .env("COLLECTOR_PAYLOAD_LIMIT_BYTES")
                .default_value("104857600"),
        )
        .arg(Arg::with_name("metrics-enabled").long("metrics-enabled").env("COLLECTOR_METRICS_ENABLED"))
        .arg(Arg::with_name("metrics-port").long("metrics-port").env("COLLECTOR_METRICS_PORT").default_value("9090"))
        .arg(
            Arg::with_name("storage")
                .long("storage")
                .env("COLLECTOR_STORAGE")
                .default_value("./uploads")
                .help("A local directory path, or s3://{region}/{bucket}"),
        )
        .arg(Arg::with_name("jwks-url").long("jwks-url").env("COLLECTOR_JWKS_URL").conflicts_with("shared-secret"))
        .arg(
            Arg::with_name("shared-secret")
                .long("shared-secret")
                .env("COLLECTOR_SHARED_SECRET")
                .hide_env_values(true),
        )
        .arg(Arg::with_name("log-level").long("log-level").env("COLLECTOR_LOG_LEVEL").default_value("info"))
        .arg(Arg::with_name("force-json-logging").long("force-json-logging").env("COLLECTOR_FORCE_JSON_LOGGING"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_test::{assert_de_tokens, assert_tokens, Token};

    #[test]
    fn parse_local_storage() {
        let s: StorageConfig = "./uploads".parse().unwrap();
        assert_eq!(s, StorageConfig::Local { directory: "./uploads".into() });
    }

    #[test]
    fn parse_s3_storage() {
        let s: StorageConfig = "s3://us-west-2/my-bucket".parse().unwrap();
        assert_eq!(
            s,
            StorageConfig::S3 { bucket: "my-bucket".into(), region: Region::UsWest2 }
        );
    }

    #[test]
    fn reject_malformed_s3_storage() {
        let e = "s3://us-west-2".parse::<StorageConfig>().unwrap_err();
        assert_matches!(e, StorageConfigParseError::InvalidS3Format);
    }

    #[test]
    fn deserialize_storage_config() {
        assert_de_tokens(
            &StorageConfig::S3 { bucket: "my-bucket".into(), region: Region::UsWest2 },
            &[Token::Str("s3://us-west-2/my-bucket")],
        );
    }

    #[test]
    fn millis_duration_serialization() {
        let testcases = [
            (MillisDuration::from_hms(0, 0, 0), "0s"),
            (MillisDuration::from_hms(1, 0, 0), "1h"),
            (MillisDuration::from_hms(0, 30, 0), "30m"),
            (MillisDuration::from_hms(1, 30, 20), "1h30m20s"),
        ];
        for (duration, serialized) in &testcases {
            assert_tokens(duration, &[Token::Str(serialized)]);
        }
    }

    #[test]
    fn millis_duration_rejects_overflowing_components() {
        assert!("1h90m".parse::<MillisDuration>().unwrap_err().contains("minutes > 59"));
        assert!("1m90s".parse::<MillisDuration>().unwrap_err().contains("seconds > 59"));
    }

    #[test]
    fn from_args_requires_an_auth_method() {
        let result = AppConfig::from_args(["collector", "--storage", "./uploads"]);
        assert!(result.is_err());
    }

    #[test]
    fn from_args_with_shared_secret() {
        let config = AppConfig::from_args([
            "collector",
            "--storage",
            "./uploads",
            "--shared-secret",
            "test-secret",
        ])
        .unwrap();
        assert_eq!(config.auth, AuthConfig::SharedSecret { secret: "test-secret".into() });
        assert_eq!(config.http_port, 8080);
    }
}
