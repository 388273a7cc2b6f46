//! Install capacity pre-check. Pure arithmetic, nothing is spawned.

use bitflags::bitflags;
use serde::Serialize;

use crate::storage::FilesystemSpace;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
    pub struct CapacityShortfall: u32 {
        const DOWNLOAD_SPACE = 1 << 0;
        const INSTALL_SPACE = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapacityRequest {
    /// Compressed (download) size
    pub size_kb: u64,
    pub uncompressed_size_kb: u64,
    /// Space held by an already installed version of the same package
    pub installed_kb: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceAvailability {
    pub download_free_kb: u64,
    pub install_free_kb: u64,
    pub same_filesystem: bool,
}

impl SpaceAvailability {
    pub fn from_filesystems(download: &FilesystemSpace, install: &FilesystemSpace) -> Self {
        Self {
            download_free_kb: download.free_kb(),
            install_free_kb: install.free_kb(),
            same_filesystem: download.same_filesystem(install),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityReport {
    pub shortfall: CapacityShortfall,
    pub space_needed_kb: u64,
}

impl CapacityReport {
    pub fn is_sufficient(&self) -> bool {
        self.shortfall.is_empty()
    }
}

/// When download and install share a filesystem, the package and its
/// unpacked contents compete for one pool, and the existing install is
/// freed by the update. On separate filesystems each side is checked on
/// its own and nothing is subtracted.
pub fn query_install_capacity(request: CapacityRequest, space: SpaceAvailability) -> CapacityReport {
    let mut report = CapacityReport::default();
    if space.same_filesystem {
        // size hints come from callers; the sum may not fit in u64
        let need = (u128::from(request.size_kb) + u128::from(request.uncompressed_size_kb))
            .saturating_sub(u128::from(request.installed_kb));
        let free = u128::from(space.install_free_kb);
        if need > free {
            report.shortfall = CapacityShortfall::all();
            report.space_needed_kb = u64::try_from(need - free).unwrap_or(u64::MAX);
        }
    } else {
        if request.size_kb > space.download_free_kb {
            report.shortfall |= CapacityShortfall::DOWNLOAD_SPACE;
            report.space_needed_kb = report
                .space_needed_kb
                .saturating_add(request.size_kb - space.download_free_kb);
        }
        if request.uncompressed_size_kb > space.install_free_kb {
            report.shortfall |= CapacityShortfall::INSTALL_SPACE;
            report.space_needed_kb = report
                .space_needed_kb
                .saturating_add(request.uncompressed_size_kb - space.install_free_kb);
        }
    }
    report
}
