//! Resource pressure signal.
//!
//! The browser's JavaScript VM crashes once it reaches its heap limit, and a
//! long scroll session grows the page without bound. Sessions check this
//! gauge every pass and stop early (keeping what they have) when it is high.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{ScrapeError, ScrapeResult};

#[async_trait]
pub trait PressureGauge: Send + Sync {
    async fn is_high(&self) -> ScrapeResult<bool>;
}

/// Anonymous memory of the current cgroup (v2) against a fixed limit.
pub struct CgroupMemoryPressure {
    stat_path: PathBuf,
    limit_bytes: u64,
}

impl CgroupMemoryPressure {
    pub fn new(stat_path: &Path, limit_bytes: u64) -> Self {
        Self {
            stat_path: stat_path.to_path_buf(),
            limit_bytes,
        }
    }

    pub async fn anon_bytes(&self) -> ScrapeResult<u64> {
        let stat = tokio::fs::read_to_string(&self.stat_path)
            .await
            .map_err(|e| ScrapeError::Pressure(format!("{}: {}", self.stat_path.display(), e)))?;
        parse_anon_bytes(&stat).ok_or_else(|| {
            ScrapeError::Pressure(format!("no 'anon' value in {}", self.stat_path.display()))
        })
    }
}

#[async_trait]
impl PressureGauge for CgroupMemoryPressure {
    async fn is_high(&self) -> ScrapeResult<bool> {
        Ok(self.anon_bytes().await? > self.limit_bytes)
    }
}

/// Gauge for hosts without a memory limit to watch.
pub struct NoPressure;

#[async_trait]
impl PressureGauge for NoPressure {
    async fn is_high(&self) -> ScrapeResult<bool> {
        Ok(false)
    }
}

/// Value of the `anon` line of a `memory.stat` file.
pub fn parse_anon_bytes(stat: &str) -> Option<u64> {
    stat.lines()
        .find_map(|line| line.strip_prefix("anon "))
        .and_then(|value| value.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const STAT: &str = "anon 5000000000\nfile 1234\nanon_thp 0\n";

    #[test]
    fn test_parse_anon_bytes() {
        assert_eq!(parse_anon_bytes(STAT), Some(5_000_000_000));
        assert_eq!(parse_anon_bytes("anon_thp 0\nfile 1\n"), None);
        assert_eq!(parse_anon_bytes("anon lots\n"), None);
    }

    #[tokio::test]
    async fn test_cgroup_gauge() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("memory.stat");
        std::fs::write(&path, STAT).unwrap();

        assert!(CgroupMemoryPressure::new(&path, 4_000_000_000).is_high().await.unwrap());
        assert!(!CgroupMemoryPressure::new(&path, 6_000_000_000).is_high().await.unwrap());

        let missing = CgroupMemoryPressure::new(&dir.path().join("nope"), 1);
        assert!(matches!(missing.is_high().await, Err(ScrapeError::Pressure(_))));
    }
}
