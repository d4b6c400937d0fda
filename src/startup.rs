//! Process-wide settings applied once before a batch starts.

use anyhow::Result;

/// Open-file soft limit before and after [`raise_open_file_limit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileLimit {
    pub previous: u64,
    pub current: u64,
}

/// Raise the soft `RLIMIT_NOFILE` to `target`, capped at the hard limit.
///
/// The limit is never lowered. NIfTI decoding keeps many small handles
/// open over a long batch, which the default soft limit of some systems
/// does not allow.
#[cfg(unix)]
pub fn raise_open_file_limit(target: u64) -> Result<FileLimit> {
    use anyhow::Context;
    use log::{debug, info};
    use rlimit::Resource;

    let (soft, hard) = rlimit::getrlimit(Resource::NOFILE).context("Failed to query open file limit")?;
    let wanted = target.min(hard);
    if wanted <= soft {
        debug!("Open file limit {soft} already covers {target}");
        return Ok(FileLimit {
            previous: soft,
            current: soft,
        });
    }

    rlimit::setrlimit(Resource::NOFILE, wanted, hard)
        .with_context(|| format!("Failed to raise open file limit to {wanted}"))?;
    info!("Raised open file limit from {soft} to {wanted}");
    Ok(FileLimit {
        previous: soft,
        current: wanted,
    })
}

#[cfg(not(unix))]
pub fn raise_open_file_limit(_target: u64) -> Result<FileLimit> {
    Ok(FileLimit {
        previous: 0,
        current: 0,
    })
}
