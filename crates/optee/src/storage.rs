// Secure-storage emulation
// The TEE supplicant normally keeps OP-TEE's secure storage under
// /data/tee in the normal world. Here the RPCed file system operations are
// executed against a sandbox directory on the host instead.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use teehost_core::{CoreError, Result, TargetHandle};

use crate::structs::OpteeMsgArg;
use crate::{OPTEE_MRF_CREATE, OPTEE_MRF_OPEN, OPTEE_MRF_READ, OPTEE_MRF_WRITE, TEEC_ERROR_ITEM_NOT_FOUND};

// file descriptors start at an arbitrary non-reserved value
const FIRST_FD: u32 = 5;

/// Emulates the secure-storage file system behind the TEE supplicant.
pub struct OpteeSecureStorageEmulator {
    target: TargetHandle,
    storage_dir: PathBuf,
    next_fd: u32,
    descriptor_to_file_map: HashMap<u32, String>,
}

impl OpteeSecureStorageEmulator {
    pub fn new(target: TargetHandle, storage_dir: &Path) -> Result<Self> {
        fs::create_dir_all(storage_dir)?;
        Ok(Self {
            target,
            storage_dir: storage_dir.to_path_buf(),
            next_fd: FIRST_FD,
            descriptor_to_file_map: HashMap::new(),
        })
    }

    // All valid paths are absolute within the secure-storage root; anything
    // else is rejected until a safe resolution scheme exists.
    fn resolve_path(&self, fname: &str) -> Result<PathBuf> {
        match fname.strip_prefix('/') {
            Some(relative) => Ok(self.storage_dir.join(relative.trim_start_matches('/'))),
            None => Err(CoreError::UnsupportedFilename {
                name: fname.to_string(),
            }),
        }
    }

    fn known_fd_for(&self, fname: &str) -> Option<u32> {
        self.descriptor_to_file_map
            .iter()
            .find(|(_, name)| name.as_str() == fname)
            .map(|(&fd, _)| fd)
    }

    fn track_file(&mut self, fname: &str) -> u32 {
        let fd = self.next_fd;
        self.next_fd += 1;
        self.descriptor_to_file_map.insert(fd, fname.to_string());
        fd
    }

    fn path_for_fd(&self, fd: u32) -> Result<PathBuf> {
        let fname = self
            .descriptor_to_file_map
            .get(&fd)
            .ok_or(CoreError::UnknownFileDescriptor { fd })?;
        self.resolve_path(fname)
    }

    // The file name travels as (address, length) in params[1]; it is
    // NUL-terminated inside the buffer.
    fn read_fname(&self, arg: &OpteeMsgArg) -> Result<String> {
        let address = arg.params[1].value.c;
        let length = arg.params[1].value.b as usize;
        let bytes = self
            .target
            .lock()
            .expect("target lock")
            .read_memory(address, length)?;
        let terminated = bytes.split(|&b| b == 0).next().unwrap_or_default();
        Ok(String::from_utf8_lossy(terminated).into_owned())
    }

    fn handle_open(&mut self, arg: &mut OpteeMsgArg) -> Result<()> {
        let fname = self.read_fname(arg)?;
        let resolved = self.resolve_path(&fname)?;

        if resolved.exists() {
            let fd = match self.known_fd_for(&fname) {
                Some(fd) => fd,
                None => self.track_file(&fname),
            };
            arg.params[2].value.a = u64::from(fd);
            arg.ret = 0;
        } else {
            log::warn!("open for missing file {fname:?}, reporting item-not-found");
            arg.params[2].value.a = 0;
            arg.ret = TEEC_ERROR_ITEM_NOT_FOUND;
        }
        Ok(())
    }

    fn handle_create(&mut self, arg: &mut OpteeMsgArg) -> Result<()> {
        let fname = self.read_fname(arg)?;
        let resolved = self.resolve_path(&fname)?;

        let fd = match self.known_fd_for(&fname) {
            Some(fd) => fd,
            None => self.track_file(&fname),
        };
        arg.params[2].value.a = u64::from(fd);

        // the secure world never creates a file that already exists
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(resolved)?;
        arg.ret = 0;
        Ok(())
    }

    fn handle_read(&mut self, arg: &mut OpteeMsgArg) -> Result<()> {
        let fd = arg.params[0].value.b as u32;
        let offset = arg.params[0].value.c;
        let buffer_address = arg.params[1].value.a;
        let size_to_read = arg.params[1].value.b as usize;

        let mut file = fs::File::open(self.path_for_fd(fd)?)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut chunk = Vec::with_capacity(size_to_read);
        file.take(size_to_read as u64).read_to_end(&mut chunk)?;

        self.target
            .lock()
            .expect("target lock")
            .write_memory(buffer_address, &chunk)?;
        arg.ret = 0;
        Ok(())
    }

    fn handle_write(&mut self, arg: &mut OpteeMsgArg) -> Result<()> {
        let fd = arg.params[0].value.b as u32;
        let offset = arg.params[0].value.c;
        let buffer_address = arg.params[1].value.a;
        let size_to_write = arg.params[1].value.b as usize;

        let chunk = self
            .target
            .lock()
            .expect("target lock")
            .read_memory(buffer_address, size_to_write)?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.path_for_fd(fd)?)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&chunk)?;
        arg.ret = 0;
        Ok(())
    }

    /// Dispatch one FS command by the sub-operation in params[0].a.
    pub fn handle_rpc(&mut self, arg: &mut OpteeMsgArg) -> Result<()> {
        let sub_op = arg.params[0].value.a;
        log::debug!("secure storage operation {sub_op:#x}");
        match sub_op {
            OPTEE_MRF_OPEN => self.handle_open(arg),
            OPTEE_MRF_CREATE => self.handle_create(arg),
            OPTEE_MRF_READ => self.handle_read(arg),
            OPTEE_MRF_WRITE => self.handle_write(arg),
            other => {
                log::warn!("ignoring unimplemented storage operation {other:#x}");
                Ok(())
            }
        }
    }
}
