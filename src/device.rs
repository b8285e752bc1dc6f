use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::bytestream::ByteStream;
use crate::error::{Error, Result};

/// Reported drive geometry, used when building the protective MBR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub heads: u32,
    pub sectors: u32,
    pub cylinders: u32,
}

impl Default for Geometry {
    /// Traditional maximum values for heads-per-cylinder and
    /// sectors-per-track, assumed when the kernel reports nothing.
    fn default() -> Self {
        Self {
            heads: 255,
            sectors: 63,
            cylinders: 0,
        }
    }
}

/// An open block device or image file.
///
/// Owns the handle exclusively; dropping the value closes it on every exit
/// path. Regular files fall back to a 512-byte logical block, the file length
/// and default geometry.
pub struct Disk {
    path: PathBuf,
    pub stream: ByteStream,
    pub lbsz: u64,
    pub last_lba: u64,
    pub geometry: Geometry,
    pub sequence: u64,
}

impl Disk {
    pub fn open(path: &Path, write: bool) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(write).open(path)?;
        let probe = probe_block_device(&file, path);
        let mut stream = ByteStream::new(file);

        let (lbsz, size_bytes, geometry, sequence) = match probe {
            Some(probe) => probe,
            None => {
                warn!(
                    "{} is not a block device, assuming a 512-byte logical block",
                    path.display()
                );
                let len = stream.len()?;
                (512, len, Geometry::default(), 0)
            }
        };

        if size_bytes / lbsz < 2 {
            return Err(Error::Unexpected("device too small for a partition table"));
        }

        Ok(Self {
            path: path.to_path_buf(),
            stream,
            lbsz,
            last_lba: size_bytes / lbsz - 1,
            geometry,
            sequence,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(target_os = "linux")]
mod ioctls {
    use nix::libc::{c_int, c_ulong};

    #[repr(C)]
    #[derive(Debug, Default, Clone, Copy)]
    pub struct HdGeometry {
        pub heads: u8,
        pub sectors: u8,
        pub cylinders: u16,
        pub start: c_ulong,
    }

    // <linux/fs.h>
    nix::ioctl_read_bad!(blk_ssz_get, nix::request_code_none!(0x12, 104), c_int);
    nix::ioctl_read!(blk_get_size64, 0x12, 114, u64);
    nix::ioctl_read!(blk_get_disk_seq, 0x12, 128, u64);
    // <linux/hdreg.h>
    nix::ioctl_read_bad!(hdio_get_geo, 0x0301, HdGeometry);
}

/// Query block size, total size, geometry and disk sequence through the
/// kernel. Returns `None` when the handle is not a block device at all;
/// individual probe failures degrade to the documented defaults.
#[cfg(target_os = "linux")]
fn probe_block_device(file: &std::fs::File, path: &Path) -> Option<(u64, u64, Geometry, u64)> {
    use std::os::fd::AsRawFd;
    use std::os::unix::fs::FileTypeExt;

    let is_block = file
        .metadata()
        .map(|meta| meta.file_type().is_block_device())
        .unwrap_or(false);
    if !is_block {
        return None;
    }

    let fd = file.as_raw_fd();

    let mut lbsz: nix::libc::c_int = 0;
    let lbsz = match unsafe { ioctls::blk_ssz_get(fd, &mut lbsz) } {
        Ok(_) => lbsz as u64,
        Err(_) => {
            warn!(
                "could not read logical block size for {}, assuming 512",
                path.display()
            );
            512
        }
    };

    let mut size_bytes: u64 = 0;
    if unsafe { ioctls::blk_get_size64(fd, &mut size_bytes) }.is_err() {
        return None;
    }

    let mut raw_geo = ioctls::HdGeometry::default();
    let geometry = match unsafe { ioctls::hdio_get_geo(fd, &mut raw_geo) } {
        Ok(_) => Geometry {
            heads: raw_geo.heads as u32,
            sectors: raw_geo.sectors as u32,
            cylinders: raw_geo.cylinders as u32,
        },
        Err(_) => {
            warn!(
                "could not read geometry for {}, assuming traditional maximums",
                path.display()
            );
            Geometry::default()
        }
    };

    let mut sequence: u64 = 0;
    if unsafe { ioctls::blk_get_disk_seq(fd, &mut sequence) }.is_err() {
        sequence = 0;
    }

    Some((lbsz, size_bytes, geometry, sequence))
}

#[cfg(not(target_os = "linux"))]
fn probe_block_device(_file: &std::fs::File, _path: &Path) -> Option<(u64, u64, Geometry, u64)> {
    None
}
