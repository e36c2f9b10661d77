//! Per-timestamp data sources
//!
//! Fetchers hand the pipeline one decoded grid per timestamp. The ones here
//! read files already present in a local cache directory; downloading is left
//! to whatever fills that directory.

use crate::errors::{FusionError, Result};
use crate::grid::{BoundingBox, CurvilinearGrid, RegularGrid};
use crate::netcdf_io::{read_curvilinear_grid, read_regular_grid, DecodeOptions};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Supplies the reference (regular) grid for a timestamp.
pub trait ReferenceFetcher: Send + Sync {
    fn fetch_reference(&self, time: DateTime<Utc>, bbox: &BoundingBox) -> Result<RegularGrid>;
}

/// Supplies the moving (curvilinear) grid for a timestamp.
pub trait MovingFetcher: Send + Sync {
    fn fetch_moving(&self, time: DateTime<Utc>) -> Result<CurvilinearGrid>;
}

impl<F> ReferenceFetcher for F
where
    F: Fn(DateTime<Utc>, &BoundingBox) -> Result<RegularGrid> + Send + Sync,
{
    fn fetch_reference(&self, time: DateTime<Utc>, bbox: &BoundingBox) -> Result<RegularGrid> {
        self(time, bbox)
    }
}

impl<F> MovingFetcher for F
where
    F: Fn(DateTime<Utc>) -> Result<CurvilinearGrid> + Send + Sync,
{
    fn fetch_moving(&self, time: DateTime<Utc>) -> Result<CurvilinearGrid> {
        self(time)
    }
}

/// One file per timestamp, named by a strftime template such as
/// `hrrr_%Y%m%d%H.nc`.
#[derive(Debug, Clone)]
pub struct TemplateFetcher {
    dir: PathBuf,
    template: String,
    options: DecodeOptions,
}

impl TemplateFetcher {
    pub fn new(dir: impl Into<PathBuf>, template: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            template: template.into(),
            options: DecodeOptions::default(),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: DecodeOptions) -> Self {
        self.options = options;
        self
    }

    /// Cache path for `time`
    pub fn path_for(&self, time: DateTime<Utc>) -> Result<PathBuf> {
        let mut name = String::new();
        write!(name, "{}", time.format(&self.template))
            .map_err(|_| FusionError::config(format!("invalid file name template '{}'", self.template)))?;
        Ok(self.dir.join(name))
    }

    fn existing_path(&self, time: DateTime<Utc>) -> Result<PathBuf> {
        let path = self.path_for(time)?;
        if !path.is_file() {
            return Err(FusionError::fetch(format!("no cached file {} for {time}", path.display())));
        }
        Ok(path)
    }
}

impl ReferenceFetcher for TemplateFetcher {
    fn fetch_reference(&self, time: DateTime<Utc>, _bbox: &BoundingBox) -> Result<RegularGrid> {
        let path = self.existing_path(time)?;
        debug!(path = %path.display(), "Reading reference file");
        read_regular_grid(&path, &self.options)
    }
}

impl MovingFetcher for TemplateFetcher {
    fn fetch_moving(&self, time: DateTime<Utc>) -> Result<CurvilinearGrid> {
        let path = self.existing_path(time)?;
        debug!(path = %path.display(), "Reading moving file");
        read_curvilinear_grid(&path, &self.options)
    }
}

/// Start time encoded in a file name as `_sYYYYMMDDHHMMSS`.
#[must_use]
pub fn parse_start_stamp(file_name: &str) -> Option<DateTime<Utc>> {
    file_name.split("_s").skip(1).find_map(|rest| {
        let stamp = rest.get(..14)?;
        let naive = NaiveDateTime::parse_from_str(stamp, "%Y%m%d%H%M%S").ok()?;
        Some(Utc.from_utc_datetime(&naive))
    })
}

/// Finds the `.nc` file in a directory whose start stamp equals the
/// requested time.
#[derive(Debug, Clone)]
pub struct ScanFetcher {
    dir: PathBuf,
    options: DecodeOptions,
}

impl ScanFetcher {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            options: DecodeOptions::default(),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: DecodeOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Cached files and their start times, sorted by time.
    pub fn catalog(&self) -> Result<Vec<(DateTime<Utc>, PathBuf)>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("nc") {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            match parse_start_stamp(name) {
                Some(start) => entries.push((start, path)),
                None => debug!(file = name, "Ignoring file without start stamp"),
            }
        }
        entries.sort();
        Ok(entries)
    }
}

impl MovingFetcher for ScanFetcher {
    fn fetch_moving(&self, time: DateTime<Utc>) -> Result<CurvilinearGrid> {
        let path = self
            .catalog()
            .map_err(|e| FusionError::fetch(format!("cannot scan {}: {e}", self.dir.display())))?
            .into_iter()
            .find(|(start, _)| *start == time)
            .map(|(_, path)| path)
            .ok_or_else(|| {
                FusionError::fetch(format!("no file starting at {time} in {}", self.dir.display()))
            })?;
        debug!(path = %path.display(), "Reading moving file");
        read_curvilinear_grid(&path, &self.options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_stamp_from_emission_file_names() {
        let name = "RAVE-HrlyEmiss-3km_v2r0_blend_s202407011300000_e202407011359590_c202407021129590.nc";
        let t = parse_start_stamp(name).unwrap();
        assert_eq!(t, Utc.with_ymd_and_hms(2024, 7, 1, 13, 0, 0).unwrap());
        assert_eq!(parse_start_stamp("hrrr_2024070113.nc"), None);
        assert_eq!(parse_start_stamp("a_sxyz_s20240701130000.nc"), Some(t));
    }

    #[test]
    fn template_paths() {
        let fetcher = TemplateFetcher::new("/cache/hrrr", "hrrr_%Y%m%d%H.nc");
        let t = Utc.with_ymd_and_hms(2024, 7, 1, 6, 0, 0).unwrap();
        assert_eq!(fetcher.path_for(t).unwrap(), PathBuf::from("/cache/hrrr/hrrr_2024070106.nc"));
        let bbox: BoundingBox = "30,35,-120,-110".parse().unwrap();
        assert!(matches!(fetcher.fetch_reference(t, &bbox), Err(FusionError::Fetch(_))));
    }

    #[test]
    fn scan_ignores_unstamped_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes.nc"), b"").unwrap();
        fs::write(dir.path().join("RAVE_s20240701000000_e.nc"), b"").unwrap();
        fs::write(dir.path().join("RAVE_s20240701010000_e.txt"), b"").unwrap();
        let fetcher = ScanFetcher::new(dir.path());
        let catalog = fetcher.catalog().unwrap();
        assert_eq!(catalog.len(), 1);
        let missing = Utc.with_ymd_and_hms(2024, 7, 1, 1, 0, 0).unwrap();
        assert!(matches!(fetcher.fetch_moving(missing), Err(FusionError::Fetch(_))));
    }
}
