//! CLI command implementations.

pub mod backup;
pub mod compact;
pub mod inspect;
pub mod migrate;
pub mod trim;
pub mod verify;

use kestrel_codec::SerializationContext;
use kestrel_core::dir::bootstrap_file_name;
use kestrel_core::{CatalogPersistence, CoreResult, NoopObserver, StorageOptions};
use std::path::PathBuf;
use std::sync::Arc;

/// The catalog a command operates on.
#[derive(Debug, Clone)]
pub struct CatalogTarget {
    /// Catalog directory.
    pub path: PathBuf,
    /// Catalog name.
    pub name: String,
}

impl CatalogTarget {
    /// Uses `name` if given, otherwise the stem of the only `.boot` file in
    /// `path`.
    pub fn resolve(path: PathBuf, name: Option<String>) -> Result<Self, Box<dyn std::error::Error>> {
        if let Some(name) = name {
            if !path.join(bootstrap_file_name(&name)).exists() {
                return Err(format!("No catalog `{name}` found at {:?}", path).into());
            }
            return Ok(Self { path, name });
        }

        let mut names = Vec::new();
        for entry in std::fs::read_dir(&path)? {
            let file_name = entry?.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if let Some(stem) = file_name.strip_suffix(".boot") {
                names.push(stem.to_string());
            }
        }
        match names.len() {
            0 => Err(format!("No catalog found at {:?}", path).into()),
            1 => Ok(Self {
                path,
                name: names.remove(0),
            }),
            _ => Err(format!(
                "Several catalogs at {:?} ({}); pick one with --catalog",
                path,
                names.join(", ")
            )
            .into()),
        }
    }

    /// Path of a file inside the catalog directory.
    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Loads the catalog for writing.
    ///
    /// Storage parts are handled as raw bytes, so no part types are
    /// registered.
    pub fn load(&self, options: StorageOptions) -> CoreResult<CatalogPersistence> {
        CatalogPersistence::load(
            &self.path,
            &self.name,
            options,
            SerializationContext::builder().build().shared(),
            Arc::new(NoopObserver),
        )
    }
}

/// Formats a byte count for humans.
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Formats a millisecond Unix timestamp.
pub fn format_timestamp(millis: i64) -> String {
    let seconds = millis.div_euclid(1000);
    let days = seconds.div_euclid(86_400);
    let rest = seconds.rem_euclid(86_400);
    let (year, month, day) = civil_from_days(days);
    format!(
        "{year:04}-{month:02}-{day:02} {:02}:{:02}:{:02}.{:03} UTC",
        rest / 3600,
        (rest % 3600) / 60,
        rest % 60,
        millis.rem_euclid(1000)
    )
}

// Proleptic Gregorian date of a day count since 1970-01-01.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0), "1970-01-01 00:00:00.000 UTC");
        assert_eq!(
            format_timestamp(1_700_000_000_123),
            "2023-11-14 22:13:20.123 UTC"
        );
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
    }

    #[test]
    fn test_resolve_single_catalog() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::write(temp.path().join("shop.boot"), b"").unwrap();
        let target = CatalogTarget::resolve(temp.path().to_path_buf(), None).unwrap();
        assert_eq!(target.name, "shop");

        std::fs::write(temp.path().join("mall.boot"), b"").unwrap();
        assert!(CatalogTarget::resolve(temp.path().to_path_buf(), None).is_err());
        assert!(CatalogTarget::resolve(temp.path().to_path_buf(), Some("mall".into())).is_ok());
        assert!(CatalogTarget::resolve(temp.path().to_path_buf(), Some("zoo".into())).is_err());
    }
}
