//! Extent copy between media.
//!
//! The chunk size follows a fixed precedence: the configured
//! `io.io_block_size` if non-zero, else the target adapter's preferred
//! size, else the system page size.

use std::path::Path;

use log::debug;
use nix::errno::Errno;

use super::IoAdapter;
use crate::config::Config;

/// Resolve the I/O chunk size for a medium mounted at `root`.
pub fn preferred_io_size(config: &Config, ioa: &dyn IoAdapter, root: &Path) -> u64 {
    if config.io_block_size != 0 {
        return config.io_block_size;
    }
    let size = ioa.preferred_io_size(root);
    if size > 0 {
        return size;
    }
    page_size::get() as u64
}

/// Copy one extent from a source medium to a target medium. Returns the
/// number of bytes copied.
pub fn copy_extent(
    config: &Config,
    src_ioa: &dyn IoAdapter,
    src_root: &Path,
    dst_ioa: &dyn IoAdapter,
    dst_root: &Path,
    addr: &str,
) -> Result<u64, Errno> {
    let chunk = preferred_io_size(config, dst_ioa, dst_root) as usize;
    let mut buffer = vec![0u8; chunk];

    let mut src = src_ioa.open(src_root, addr, false)?;
    let mut dst = dst_ioa.open(dst_root, addr, true)?;

    let mut copied = 0u64;
    loop {
        let n = src.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        let mut off = 0;
        while off < n {
            off += dst.write(&buffer[off..n])?;
        }
        copied += n as u64;
    }
    debug!("copy: extent '{}' ({} bytes)", addr, copied);
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ldm::posix::PosixIo;
    use tempfile::TempDir;

    #[test]
    fn chunk_size_precedence() {
        let src = TempDir::new().unwrap();
        let ioa = PosixIo::new();

        let forced = Config::new().with_io_block_size(512);
        assert_eq!(preferred_io_size(&forced, &ioa, src.path()), 512);

        // Derived from the adapter, or the page size as last resort.
        let derived = preferred_io_size(&Config::new(), &ioa, src.path());
        assert!(derived > 0);
    }

    #[test]
    fn copy_extent_moves_bytes() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let ioa = PosixIo::new();

        let payload = vec![7u8; 10_000];
        let mut h = ioa.open(src.path(), "x", true).unwrap();
        h.write(&payload).unwrap();
        drop(h);

        let config = Config::new().with_io_block_size(4096);
        let copied =
            copy_extent(&config, &ioa, src.path(), &ioa, dst.path(), "x").unwrap();
        assert_eq!(copied, payload.len() as u64);

        let mut h = ioa.open(dst.path(), "x", false).unwrap();
        let mut back = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = h.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            back.extend_from_slice(&buf[..n]);
        }
        assert_eq!(back, payload);
    }
}
