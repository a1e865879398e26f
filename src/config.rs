use std::path::{Path, PathBuf};

use snafu::Snafu;

use crate::record::MAX_FRAME_LEN;

/// Default page size of the built-in drivers, matching the 512-byte pages
/// exposed by the major cloud page-blob APIs.
pub const DEFAULT_PAGE_SIZE: u64 = 512;

/// Default maximum commit size, which doubles as the writer's buffer size.
pub const DEFAULT_MAX_COMMIT_SIZE: u64 = 4 * 1024 * 1024;

/// Default read buffer size. Large enough to hold any legal message frame,
/// so a reader with default settings can always make progress.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4 * 1024 * 1024;

#[derive(Debug, Snafu)]
pub enum BuildError {
    #[snafu(display("parameter '{}' was invalid: {}", param_name, reason))]
    InvalidParameter {
        param_name: &'static str,
        reason: String,
    },
}

/// Vault configuration for the file-backed drivers.
#[derive(Clone, Debug)]
pub struct VaultConfig {
    /// Directory holding the data and checkpoint files of this vault.
    ///
    /// Must be unique from all other vaults, whether within the same process
    /// or other processes on the machine.
    pub(crate) data_dir: PathBuf,

    /// Page size, in bytes, of the data file.
    ///
    /// All writes to the data file are aligned to this size and are a whole
    /// number of pages long.
    pub(crate) page_size: u64,

    /// Maximum size, in bytes, of a single commit to the data file.
    ///
    /// This is also the size of the writer's in-memory buffer: an append
    /// batch that does not fit is committed in several page-aligned writes.
    pub(crate) max_commit_size: u64,

    /// Size, in bytes, of a reader's prefetch buffer.
    ///
    /// Must be at least one page, and at least as large as the largest
    /// message frame the reader is expected to decode.
    pub(crate) read_buffer_size: usize,
}

/// Builder for [`VaultConfig`].
#[derive(Clone, Debug)]
pub struct VaultConfigBuilder {
    data_dir: PathBuf,
    page_size: Option<u64>,
    max_commit_size: Option<u64>,
    read_buffer_size: Option<usize>,
}

impl VaultConfigBuilder {
    pub fn from_path<P>(data_dir: P) -> VaultConfigBuilder
    where
        P: AsRef<Path>,
    {
        VaultConfigBuilder {
            data_dir: data_dir.as_ref().to_path_buf(),
            page_size: None,
            max_commit_size: None,
            read_buffer_size: None,
        }
    }

    /// Sets the page size, in bytes, of the data file.
    ///
    /// Must be a non-zero multiple of 512. Powers of two give the best
    /// alignment with the underlying storage.
    ///
    /// Defaults to 512.
    pub fn page_size(mut self, amount: u64) -> Self {
        self.page_size = Some(amount);
        self
    }

    /// Sets the maximum size, in bytes, of a single commit to the data file,
    /// which is also the size of the writer's in-memory buffer.
    ///
    /// Must be a multiple of the page size and large enough to hold the
    /// largest legal message frame alongside a partially filled page.
    ///
    /// Defaults to 4MB.
    pub fn max_commit_size(mut self, amount: u64) -> Self {
        self.max_commit_size = Some(amount);
        self
    }

    /// Sets the size, in bytes, of a reader's prefetch buffer.
    ///
    /// Defaults to 4MB, which holds any legal message frame.
    pub fn read_buffer_size(mut self, amount: usize) -> Self {
        self.read_buffer_size = Some(amount);
        self
    }

    /// Consumes this builder and constructs a `VaultConfig`.
    pub fn build(self) -> Result<VaultConfig, BuildError> {
        let page_size = self.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
        let max_commit_size = self.max_commit_size.unwrap_or(DEFAULT_MAX_COMMIT_SIZE);
        let read_buffer_size = self.read_buffer_size.unwrap_or(DEFAULT_READ_BUFFER_SIZE);

        if page_size == 0 || page_size % 512 != 0 {
            return Err(BuildError::InvalidParameter {
                param_name: "page_size",
                reason: format!("must be a non-zero multiple of 512, got {page_size}"),
            });
        }

        if max_commit_size % page_size != 0 {
            return Err(BuildError::InvalidParameter {
                param_name: "max_commit_size",
                reason: format!("must be a multiple of the page size ({page_size})"),
            });
        }

        // The writer's buffer has to fit the largest frame even when a
        // partially filled page already occupies its head.
        let min_commit_size = MAX_FRAME_LEN as u64 + page_size;
        if max_commit_size < min_commit_size {
            return Err(BuildError::InvalidParameter {
                param_name: "max_commit_size",
                reason: format!("must be at least {min_commit_size} bytes"),
            });
        }

        if (read_buffer_size as u64) < page_size {
            return Err(BuildError::InvalidParameter {
                param_name: "read_buffer_size",
                reason: format!("must be at least one page ({page_size} bytes)"),
            });
        }

        Ok(VaultConfig {
            data_dir: self.data_dir,
            page_size,
            max_commit_size,
            read_buffer_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use proptest::{prop_assert, prop_assert_eq, proptest};

    use super::{VaultConfigBuilder, DEFAULT_MAX_COMMIT_SIZE, DEFAULT_PAGE_SIZE};
    use crate::record::MAX_FRAME_LEN;

    #[test]
    fn rejects_invalid_parameters() {
        assert!(VaultConfigBuilder::from_path("/tmp/dummy/path")
            .page_size(100)
            .build()
            .is_err());
        assert!(VaultConfigBuilder::from_path("/tmp/dummy/path")
            .max_commit_size(DEFAULT_MAX_COMMIT_SIZE + 1)
            .build()
            .is_err());
        assert!(VaultConfigBuilder::from_path("/tmp/dummy/path")
            .max_commit_size(DEFAULT_PAGE_SIZE)
            .build()
            .is_err());
        assert!(VaultConfigBuilder::from_path("/tmp/dummy/path")
            .read_buffer_size(16)
            .build()
            .is_err());
    }

    proptest! {
        #[test]
        fn ensure_commit_size_holds_largest_frame(pages in 1_u64..65_536) {
            let max_commit_size = pages * DEFAULT_PAGE_SIZE;
            let result = VaultConfigBuilder::from_path("/tmp/dummy/path")
                .max_commit_size(max_commit_size)
                .build();

            match result {
                Ok(config) => {
                    prop_assert_eq!(config.max_commit_size, max_commit_size);
                    prop_assert!(config.max_commit_size >= MAX_FRAME_LEN as u64 + config.page_size);
                }
                Err(_) => {
                    prop_assert!(max_commit_size < MAX_FRAME_LEN as u64 + DEFAULT_PAGE_SIZE);
                }
            }
        }
    }
}
