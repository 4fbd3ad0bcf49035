//! Storage placement: decide whether an upload is staged through the fast
//! cache volume or written straight to its final location.

use serde::Serialize;
use std::{
    io,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

/// Reserve kept free on the cache volume when staging uploads.
pub const UPLOAD_SAFETY_MARGIN: u64 = 10 * 1024 * 1024;

/// Reads free space on the volume holding a path.
pub trait SpaceProbe: Send + Sync {
    fn available_space(&self, path: &Path) -> io::Result<u64>;
}

/// Probe backed by `statvfs(3)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StatvfsProbe;

impl SpaceProbe for StatvfsProbe {
    #[cfg(unix)]
    fn available_space(&self, path: &Path) -> io::Result<u64> {
        use std::os::unix::ffi::OsStrExt;

        let path_cstr = std::ffi::CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL byte"))?;
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };

        let ret = unsafe { libc::statvfs(path_cstr.as_ptr(), &mut stat) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64))
    }

    #[cfg(not(unix))]
    fn available_space(&self, _path: &Path) -> io::Result<u64> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "free-space probe is only available on unix",
        ))
    }
}

/// Where upload bytes are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// Land in the cache directory, then move into storage.
    Staged { cache_dir: PathBuf },
    /// Stream straight into the final storage path.
    Direct,
}

/// Why the selector chose what it chose. Logged and reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementReason {
    CacheHasRoom,
    ForcedDirect,
    NoCacheConfigured,
    UnknownSize,
    InsufficientCacheSpace,
    ProbeFailed,
}

pub struct PlacementSelector<'a> {
    probe: &'a dyn SpaceProbe,
    cache_dir: Option<&'a Path>,
}

impl<'a> PlacementSelector<'a> {
    pub fn new(probe: &'a dyn SpaceProbe, cache_dir: Option<&'a Path>) -> Self {
        Self { probe, cache_dir }
    }

    /// Decide the write path for an upload of `size_hint` bytes.
    ///
    /// `force_direct` is the operator override from the settings table.
    pub fn select(&self, size_hint: Option<u64>, force_direct: bool) -> (Placement, PlacementReason) {
        let decision = self.decide(size_hint, force_direct);
        debug!(
            "placement for upload of {:?} bytes: {:?} ({:?})",
            size_hint, decision.0, decision.1
        );
        decision
    }

    fn decide(&self, size_hint: Option<u64>, force_direct: bool) -> (Placement, PlacementReason) {
        if force_direct {
            return (Placement::Direct, PlacementReason::ForcedDirect);
        }
        let Some(cache_dir) = self.cache_dir else {
            return (Placement::Direct, PlacementReason::NoCacheConfigured);
        };
        let Some(size) = size_hint else {
            return (Placement::Direct, PlacementReason::UnknownSize);
        };

        match self.probe.available_space(cache_dir) {
            Ok(free) if free >= size.saturating_add(UPLOAD_SAFETY_MARGIN) => (
                Placement::Staged {
                    cache_dir: cache_dir.to_path_buf(),
                },
                PlacementReason::CacheHasRoom,
            ),
            Ok(_) => (Placement::Direct, PlacementReason::InsufficientCacheSpace),
            Err(err) => {
                warn!(
                    "free-space probe failed for {}: {}; writing directly",
                    cache_dir.display(),
                    err
                );
                (Placement::Direct, PlacementReason::ProbeFailed)
            }
        }
    }
}

/// True when `path`'s volume has `needed + margin` bytes free. Probe errors
/// count as "no room".
pub fn has_headroom(probe: &dyn SpaceProbe, path: &Path, needed: u64, margin: u64) -> bool {
    match probe.available_space(path) {
        Ok(free) => free >= needed.saturating_add(margin),
        Err(err) => {
            warn!("free-space probe failed for {}: {}", path.display(), err);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::{FailingProbe, FixedProbe};

    #[test]
    fn stages_when_cache_has_room_for_size_plus_margin() {
        let probe = FixedProbe::new(UPLOAD_SAFETY_MARGIN + 100);
        let selector = PlacementSelector::new(&probe, Some(Path::new("/cache")));

        let (placement, reason) = selector.select(Some(100), false);
        assert_eq!(
            placement,
            Placement::Staged {
                cache_dir: PathBuf::from("/cache")
            }
        );
        assert_eq!(reason, PlacementReason::CacheHasRoom);

        let (placement, reason) = selector.select(Some(101), false);
        assert_eq!(placement, Placement::Direct);
        assert_eq!(reason, PlacementReason::InsufficientCacheSpace);
    }

    #[test]
    fn override_and_unknown_size_bypass_the_probe() {
        let probe = FixedProbe::new(u64::MAX);
        let selector = PlacementSelector::new(&probe, Some(Path::new("/cache")));

        assert_eq!(
            selector.select(Some(1), true),
            (Placement::Direct, PlacementReason::ForcedDirect)
        );
        assert_eq!(
            selector.select(None, false),
            (Placement::Direct, PlacementReason::UnknownSize)
        );
        assert_eq!(probe.calls(), 0);
    }

    #[test]
    fn probe_failure_falls_back_to_direct() {
        let selector = PlacementSelector::new(&FailingProbe, Some(Path::new("/cache")));
        assert_eq!(
            selector.select(Some(1), false),
            (Placement::Direct, PlacementReason::ProbeFailed)
        );
    }

    #[test]
    fn no_cache_dir_means_direct() {
        let probe = FixedProbe::new(u64::MAX);
        let selector = PlacementSelector::new(&probe, None);
        assert_eq!(
            selector.select(Some(1), false),
            (Placement::Direct, PlacementReason::NoCacheConfigured)
        );
    }

    #[cfg(unix)]
    #[test]
    fn statvfs_reports_space_for_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(StatvfsProbe.available_space(dir.path()).is_ok());
        assert!(
            StatvfsProbe
                .available_space(&dir.path().join("missing"))
                .is_err()
        );
    }
}
