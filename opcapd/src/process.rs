//! Process images and path resolution for mapped files.

use std::ffi::CString;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use log::debug;
use procfs::process::{MMPermissions, MMapPath, Process};

use crate::critical::assert_may_block;
use crate::error::{CaptureError, Result};

/// The file behind a mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappedFile {
    Path(PathBuf),
    /// An open descriptor in this process, resolved through `/proc/self/fd`.
    Descriptor(RawFd),
}

impl MappedFile {
    /// Resolve to path bytes. Descriptors are resolved into `scratch`;
    /// results longer than `scratch` are truncated to its length.
    pub fn resolve<'a>(&'a self, scratch: &'a mut [u8]) -> Result<&'a [u8]> {
        match self {
            MappedFile::Path(path) => {
                let bytes = path.as_os_str().as_bytes();
                Ok(&bytes[..bytes.len().min(scratch.len())])
            }
            MappedFile::Descriptor(fd) => {
                assert_may_block("descriptor path resolution");
                let link = CString::new(format!("/proc/self/fd/{fd}")).map_err(|e| {
                    CaptureError::PathUnresolved {
                        what: format!("fd {fd}"),
                        source: std::io::Error::other(e),
                    }
                })?;
                // SAFETY: `link` is NUL terminated and `scratch` is writable
                // for `scratch.len()` bytes.
                let n = unsafe {
                    libc::readlink(
                        link.as_ptr(),
                        scratch.as_mut_ptr() as *mut libc::c_char,
                        scratch.len(),
                    )
                };
                if n < 0 {
                    return Err(CaptureError::PathUnresolved {
                        what: format!("fd {fd}"),
                        source: std::io::Error::last_os_error(),
                    });
                }
                Ok(&scratch[..n as usize])
            }
        }
    }
}

/// One mapped region of a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub start: u64,
    pub end: u64,
    pub offset: u64,
    pub executable: bool,
    pub file: Option<MappedFile>,
}

impl Region {
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Regions that produce a mapping record: executable and file backed.
    pub fn is_recordable(&self) -> bool {
        self.executable && self.file.is_some()
    }
}

/// Snapshot of a process's address space.
#[derive(Debug, Clone, Default)]
pub struct ProcessImage {
    pub pid: u32,
    pub regions: Vec<Region>,
}

impl ProcessImage {
    pub fn recordable(&self) -> impl Iterator<Item = &Region> {
        self.regions.iter().filter(|r| r.is_recordable())
    }
}

/// Where process images come from.
pub trait ProcessSource: Send + Sync {
    fn snapshot(&self, pid: u32) -> Result<ProcessImage>;
}

/// Reads `/proc/<pid>/maps`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcfsSource;

impl ProcessSource for ProcfsSource {
    fn snapshot(&self, pid: u32) -> Result<ProcessImage> {
        assert_may_block("procfs snapshot");
        let snapshot_err = |e: procfs::ProcError| CaptureError::Snapshot {
            pid,
            reason: e.to_string(),
        };

        let process = Process::new(pid as i32).map_err(snapshot_err)?;
        let maps = process.maps().map_err(snapshot_err)?;

        let mut regions = Vec::new();
        for map in maps.iter() {
            let file = match &map.pathname {
                MMapPath::Path(path) => Some(MappedFile::Path(path.clone())),
                _ => None,
            };
            regions.push(Region {
                start: map.address.0,
                end: map.address.1,
                offset: map.offset,
                executable: map.perms.contains(MMPermissions::EXECUTE),
                file,
            });
        }

        debug!(
            "snapshot pid={} regions={} executable={}",
            pid,
            regions.len(),
            regions.iter().filter(|r| r.is_recordable()).count()
        );
        Ok(ProcessImage { pid, regions })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn path_resolution_truncates_to_scratch() {
        let file = MappedFile::Path(PathBuf::from("/usr/lib/libfoo.so"));
        let mut scratch = [0u8; 8];
        assert_eq!(file.resolve(&mut scratch).unwrap(), b"/usr/lib");
        let mut big = [0u8; 64];
        assert_eq!(file.resolve(&mut big).unwrap(), b"/usr/lib/libfoo.so");
    }

    #[test]
    fn descriptor_resolves_through_proc() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let fd = tmp.as_file().as_raw_fd();
        let mut scratch = vec![0u8; 4096];
        let file = MappedFile::Descriptor(fd);
        let resolved = file.resolve(&mut scratch).unwrap();
        let expected = tmp.path().canonicalize().unwrap();
        assert_eq!(resolved, expected.as_os_str().as_bytes());
    }

    #[test]
    fn bad_descriptor_is_unresolved() {
        let mut scratch = vec![0u8; 64];
        let err = MappedFile::Descriptor(-1).resolve(&mut scratch).unwrap_err();
        assert!(matches!(err, CaptureError::PathUnresolved { .. }));
    }

    #[test]
    fn recordable_regions_need_exec_and_file() {
        let image = ProcessImage {
            pid: 1,
            regions: vec![
                Region {
                    start: 0x1000,
                    end: 0x2000,
                    offset: 0,
                    executable: true,
                    file: Some(MappedFile::Path("/bin/true".into())),
                },
                Region {
                    start: 0x2000,
                    end: 0x3000,
                    offset: 0,
                    executable: true,
                    file: None,
                },
                Region {
                    start: 0x3000,
                    end: 0x4000,
                    offset: 0x1000,
                    executable: false,
                    file: Some(MappedFile::Path("/bin/true".into())),
                },
            ],
        };
        let recordable: Vec<_> = image.recordable().collect();
        assert_eq!(recordable.len(), 1);
        assert_eq!(recordable[0].len(), 0x1000);
    }

    #[test]
    fn procfs_snapshot_of_self_has_executable_text() {
        let image = ProcfsSource.snapshot(std::process::id()).unwrap();
        assert!(image.recordable().count() >= 1);
    }

    #[test]
    fn procfs_snapshot_of_missing_pid_fails() {
        let err = ProcfsSource.snapshot(u32::MAX - 1).unwrap_err();
        assert!(matches!(err, CaptureError::Snapshot { .. }));
    }
}
