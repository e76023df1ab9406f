//! The PSRDADA ring buffer shared between receiver and spectrometer.
//!
//! The buffer lives in System V shared memory and is created and destroyed by
//! the `dada_db` tool, so all we hold is a handle that remembers to destroy it.

use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    process::{run_checked, Executable},
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferLayout {
    /// Hexadecimal key, as `dada_db -k` takes it
    pub key: String,
    pub block_size: u64,
    pub num_blocks: u64,
    /// Page-lock the blocks in memory
    pub lock: bool,
}

/// Destroy whatever buffer currently lives under `key`, failing if `dada_db` does
pub fn destroy(tool: &Executable, key: &str) -> Result<()> {
    run_checked(tool.command(["-k", key, "-d"]))?;
    Ok(())
}

/// A live buffer, destroyed on [`DadaBuffer::release`] or drop
#[derive(Debug)]
pub struct DadaBuffer {
    tool: Executable,
    key: String,
    released: bool,
}

impl DadaBuffer {
    /// Clear out a stale buffer under the same key, then create a fresh one
    pub fn allocate(tool: &Executable, layout: &BufferLayout) -> Result<Self> {
        debug!("Cleaning up any previous DADA buffers");
        if let Err(e) = destroy(tool, &layout.key) {
            debug!("No stale buffer removed under key {}: {}", layout.key, e);
        }

        debug!(
            "Allocating DADA buffer {} ({} x {} bytes)",
            layout.key, layout.num_blocks, layout.block_size
        );
        let block_size = layout.block_size.to_string();
        let num_blocks = layout.num_blocks.to_string();
        let mut args = vec![
            "-k",
            layout.key.as_str(),
            "-b",
            block_size.as_str(),
            "-n",
            num_blocks.as_str(),
        ];
        if layout.lock {
            args.extend(["-l", "-p"]);
        }
        run_checked(tool.command(args)).map_err(|e| Error::BufferAllocation(Box::new(e)))?;

        Ok(Self {
            tool: tool.clone(),
            key: layout.key.clone(),
            released: false,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        // Don't retry a failed destroy from drop
        self.released = true;
        debug!("Releasing DADA buffer {}", self.key);
        destroy(&self.tool, &self.key)
    }
}

impl Drop for DadaBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("Failed to release DADA buffer {}: {}", self.key, e);
        }
    }
}
