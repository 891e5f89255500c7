//! The synthetic root filesystem: an in-memory directory list whose only
//! boot-time entry is `dev`. Other entries exist purely as mountpoints.

use alloc::borrow::ToOwned;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use crate::error::{Error, Result};
use crate::scheduler::mutex::Critical;

use super::vfs::{
    DEFAULT_ATTRIBUTES, Driver, FileAbstract, FileAbstractWithData, FileType,
    VOLUME_ROOT_ATTRIBUTES,
};

const ROOT_DATA: u64 = 0;

pub struct BasicDriver {
    dirs: Critical<Vec<Option<String>>>,
}

impl BasicDriver {
    pub fn new() -> Self {
        BasicDriver {
            dirs: Critical::new(vec![Some("dev".to_owned())]),
        }
    }

    pub fn root_abstract(&self) -> FileAbstractWithData {
        FileAbstractWithData {
            abstract_: FileAbstract {
                name: "/".to_owned(),
                filesize: 0,
                kind: FileType::Directory,
                blocksize_exp: 0,
                attributes: VOLUME_ROOT_ATTRIBUTES,
            },
            fop_data: ROOT_DATA,
        }
    }

    fn dir_abstract(name: &str, index: usize) -> FileAbstractWithData {
        FileAbstractWithData {
            abstract_: FileAbstract {
                name: name.to_owned(),
                filesize: 0,
                kind: FileType::Directory,
                blocksize_exp: 0,
                attributes: DEFAULT_ATTRIBUTES,
            },
            fop_data: index as u64 + 1,
        }
    }
}

impl Driver for BasicDriver {
    fn read(
        &self,
        _fop_data: u64,
        _handle_data: &mut u64,
        _block: usize,
        _count: usize,
        _buffer: &mut [u8],
    ) -> Result<usize> {
        Err(Error::InvalidData)
    }

    fn write(
        &self,
        _fop_data: u64,
        _handle_data: &mut u64,
        _block: usize,
        _count: usize,
        _buffer: &[u8],
    ) -> Result<usize> {
        Err(Error::InvalidData)
    }

    fn find(
        &self,
        fop_data: u64,
        _handle_data: &mut u64,
        name: &str,
    ) -> Result<FileAbstractWithData> {
        if fop_data != ROOT_DATA {
            // subdirectories hold nothing themselves, they exist to be
            // mounted over
            return Err(Error::NoSuchFile);
        }
        let dirs = self.dirs.access();
        dirs.iter()
            .position(|d| d.as_deref() == Some(name))
            .map(|index| Self::dir_abstract(name, index))
            .ok_or(Error::NoSuchFile)
    }

    fn create(
        &self,
        fop_data: u64,
        _handle_data: &mut u64,
        name: &str,
        kind: FileType,
    ) -> Result<FileAbstractWithData> {
        if fop_data != ROOT_DATA {
            return Err(Error::NotSupported);
        }
        if kind != FileType::Directory {
            // the root filesystem stores no file data
            return Err(Error::NotSupported);
        }
        let mut dirs = self.dirs.access();
        if dirs.iter().any(|d| d.as_deref() == Some(name)) {
            return Err(Error::FileExists);
        }
        let index = match dirs.iter().position(Option::is_none) {
            Some(i) => {
                dirs[i] = Some(name.to_owned());
                i
            }
            None => {
                dirs.push(Some(name.to_owned()));
                dirs.len() - 1
            }
        };
        Ok(Self::dir_abstract(name, index))
    }

    fn readdir(
        &self,
        fop_data: u64,
        _handle_data: &mut u64,
        index: usize,
    ) -> Result<FileAbstractWithData> {
        if fop_data != ROOT_DATA {
            return Err(Error::EndOfFile);
        }
        let dirs = self.dirs.access();
        dirs.iter()
            .enumerate()
            .filter_map(|(i, d)| d.as_deref().map(|name| (i, name)))
            .nth(index)
            .map(|(i, name)| Self::dir_abstract(name, i))
            .ok_or(Error::EndOfFile)
    }

    fn remove(&self, fop_data: u64, _handle_data: &mut u64, name: &str) -> Result<()> {
        if fop_data != ROOT_DATA {
            return Err(Error::NotSupported);
        }
        if name == "dev" {
            return Err(Error::NotSupported);
        }
        let mut dirs = self.dirs.access();
        match dirs.iter().position(|d| d.as_deref() == Some(name)) {
            Some(i) => {
                dirs[i] = None;
                Ok(())
            }
            None => Err(Error::NoSuchFile),
        }
    }
}
