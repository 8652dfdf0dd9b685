use crate::backend::VmAccess;
use memmap2::{MmapMut, MmapOptions};
use std::fs::File;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::fs::FileExt;

/// VM handle returned by a kernel vm-open request.
///
/// Offsets of the file are GPU virtual addresses of the VM.
pub struct VmFile {
    file: File,
    vm: u64,
}

impl VmFile {
    pub fn new(fd: OwnedFd, vm: u64) -> Self {
        Self {
            file: File::from(fd),
            vm,
        }
    }
}

impl VmAccess for VmFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.file.read_at(buf, offset)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        self.file.write_at(buf, offset)
    }

    fn flush(&self) -> io::Result<()> {
        self.file.sync_all()
    }

    fn map(&self, offset: u64, len: usize) -> io::Result<Option<MmapMut>> {
        log::trace!(target: "backend", "map vm {:#x} window {offset:#x}+{len:#x}", self.vm);
        // SAFETY: the window is only accessed while the handle is open
        // and GPU memory is not resized by the debugger.
        let map = unsafe { MmapOptions::new().offset(offset).len(len).map_mut(&self.file)? };
        Ok(Some(map))
    }
}
