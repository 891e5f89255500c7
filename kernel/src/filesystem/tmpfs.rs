//! RAM-backed filesystem. Files are runs of owned frames (one block = one
//! frame), directories are name maps into a node slab. A fresh driver
//! instance is created per mount and dies with it, frames included.

use alloc::borrow::ToOwned;
use alloc::collections::btree_map::BTreeMap;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use crate::error::{Error, Result};
use crate::memory::{self, FRAME_SIZE, Frame};
use crate::scheduler::mutex::Critical;

use super::vfs::{
    Attributes, DEFAULT_ATTRIBUTES, Driver, FileAbstract, FileAbstractWithData, FileType,
    VOLUME_ROOT_ATTRIBUTES,
};

/// Frame-sized blocks.
const BLOCKSIZE_EXP: u8 = 12;

// tmpfs nodes are already memory; caching memory in front of them would
// only double every page
const FILE_ATTRIBUTES: Attributes = Attributes {
    cache: false,
    ..DEFAULT_ATTRIBUTES
};

const ROOT_ATTRIBUTES: Attributes = Attributes {
    cache: false,
    ..VOLUME_ROOT_ATTRIBUTES
};

struct TmpFile {
    frames: Vec<Frame>,
    filesize: usize,
}

enum TmpNode {
    File(TmpFile),
    Directory(BTreeMap<String, usize>),
}

pub struct TmpDriver {
    nodes: Critical<Vec<Option<TmpNode>>>,
}

fn node_id(fop_data: u64) -> usize {
    fop_data as usize - 1
}

impl TmpDriver {
    pub fn new() -> Self {
        TmpDriver {
            nodes: Critical::new(vec![Some(TmpNode::Directory(BTreeMap::new()))]),
        }
    }

    pub fn root_abstract(&self) -> FileAbstractWithData {
        FileAbstractWithData {
            abstract_: FileAbstract {
                name: "/".to_owned(),
                filesize: 0,
                kind: FileType::Directory,
                blocksize_exp: BLOCKSIZE_EXP,
                attributes: ROOT_ATTRIBUTES,
            },
            fop_data: 1,
        }
    }

    fn child_abstract(name: &str, id: usize, node: &TmpNode) -> FileAbstractWithData {
        let (kind, filesize) = match node {
            TmpNode::File(file) => (FileType::Regular, file.filesize),
            TmpNode::Directory(_) => (FileType::Directory, 0),
        };
        FileAbstractWithData {
            abstract_: FileAbstract {
                name: name.to_owned(),
                filesize,
                kind,
                blocksize_exp: BLOCKSIZE_EXP,
                attributes: FILE_ATTRIBUTES,
            },
            fop_data: id as u64 + 1,
        }
    }

    fn free_node(nodes: &mut Vec<Option<TmpNode>>, id: usize) {
        if let Some(TmpNode::Directory(children)) = &nodes[id] {
            let children: Vec<usize> = children.values().copied().collect();
            for child in children {
                Self::free_node(nodes, child);
            }
        }
        nodes[id] = None;
    }
}

impl Driver for TmpDriver {
    fn read(
        &self,
        fop_data: u64,
        _handle_data: &mut u64,
        block: usize,
        count: usize,
        buffer: &mut [u8],
    ) -> Result<usize> {
        let nodes = self.nodes.access();
        let Some(TmpNode::File(file)) = &nodes[node_id(fop_data)] else {
            return Err(Error::NotFile);
        };
        for i in 0..count {
            let Some(frame) = file.frames.get(block + i) else {
                return if i == 0 { Err(Error::EndOfFile) } else { Ok(i) };
            };
            buffer[i * FRAME_SIZE..(i + 1) * FRAME_SIZE].copy_from_slice(frame.bytes());
        }
        Ok(count)
    }

    fn write(
        &self,
        fop_data: u64,
        _handle_data: &mut u64,
        block: usize,
        count: usize,
        buffer: &[u8],
    ) -> Result<usize> {
        let mut nodes = self.nodes.access();
        let Some(TmpNode::File(file)) = &mut nodes[node_id(fop_data)] else {
            return Err(Error::NotFile);
        };
        while file.frames.len() < block + count {
            let mut frame = memory::allocate_one()?;
            frame.bytes_mut().fill(0);
            file.frames.push(frame);
        }
        for i in 0..count {
            file.frames[block + i]
                .bytes_mut()
                .copy_from_slice(&buffer[i * FRAME_SIZE..(i + 1) * FRAME_SIZE]);
        }
        file.filesize = file.filesize.max((block + count) * FRAME_SIZE);
        Ok(count)
    }

    fn find(
        &self,
        fop_data: u64,
        _handle_data: &mut u64,
        name: &str,
    ) -> Result<FileAbstractWithData> {
        let nodes = self.nodes.access();
        let Some(TmpNode::Directory(children)) = &nodes[node_id(fop_data)] else {
            return Err(Error::NotDirectory);
        };
        let id = *children.get(name).ok_or(Error::NoSuchFile)?;
        Ok(Self::child_abstract(name, id, nodes[id].as_ref().unwrap()))
    }

    fn create(
        &self,
        fop_data: u64,
        _handle_data: &mut u64,
        name: &str,
        kind: FileType,
    ) -> Result<FileAbstractWithData> {
        let mut nodes = self.nodes.access();

        let node = match kind {
            FileType::Regular => TmpNode::File(TmpFile {
                frames: Vec::new(),
                filesize: 0,
            }),
            FileType::Directory => TmpNode::Directory(BTreeMap::new()),
            FileType::Device => return Err(Error::NotImplemented),
        };

        {
            let Some(TmpNode::Directory(children)) = &nodes[node_id(fop_data)] else {
                return Err(Error::NotDirectory);
            };
            if children.contains_key(name) {
                return Err(Error::FileExists);
            }
        }

        let id = match nodes.iter().position(Option::is_none) {
            Some(i) => {
                nodes[i] = Some(node);
                i
            }
            None => {
                nodes.push(Some(node));
                nodes.len() - 1
            }
        };
        let Some(TmpNode::Directory(children)) = &mut nodes[node_id(fop_data)] else {
            unreachable!();
        };
        children.insert(name.to_owned(), id);
        Ok(Self::child_abstract(name, id, nodes[id].as_ref().unwrap()))
    }

    fn readdir(
        &self,
        fop_data: u64,
        _handle_data: &mut u64,
        index: usize,
    ) -> Result<FileAbstractWithData> {
        let nodes = self.nodes.access();
        let Some(TmpNode::Directory(children)) = &nodes[node_id(fop_data)] else {
            return Err(Error::NotDirectory);
        };
        let (name, id) = children.iter().nth(index).ok_or(Error::EndOfFile)?;
        Ok(Self::child_abstract(name, *id, nodes[*id].as_ref().unwrap()))
    }

    fn remove(&self, fop_data: u64, _handle_data: &mut u64, name: &str) -> Result<()> {
        let mut nodes = self.nodes.access();
        let id = {
            let Some(TmpNode::Directory(children)) = &mut nodes[node_id(fop_data)] else {
                return Err(Error::NotDirectory);
            };
            children.remove(name).ok_or(Error::NoSuchFile)?
        };
        Self::free_node(&mut nodes, id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn files_grow_and_read_back_by_block() {
        let driver = TmpDriver::new();
        let root = driver.root_abstract().fop_data;
        let mut hd = 0u64;

        let file = driver.create(root, &mut hd, "blob", FileType::Regular).unwrap();
        let mut block = alloc::vec![0x5Au8; FRAME_SIZE];
        assert_eq!(driver.write(file.fop_data, &mut hd, 1, 1, &block).unwrap(), 1);

        // block 0 was never written but exists now, zero-filled
        assert_eq!(driver.read(file.fop_data, &mut hd, 0, 1, &mut block).unwrap(), 1);
        assert!(block.iter().all(|b| *b == 0));

        // a two-block read off the end comes back short
        let mut two = alloc::vec![0u8; 2 * FRAME_SIZE];
        assert_eq!(driver.read(file.fop_data, &mut hd, 1, 2, &mut two).unwrap(), 1);
        assert!(two[..FRAME_SIZE].iter().all(|b| *b == 0x5A));

        assert_eq!(
            driver.read(file.fop_data, &mut hd, 2, 1, &mut block),
            Err(Error::EndOfFile)
        );
    }

    #[test_case]
    fn directories_enumerate_and_remove() {
        let driver = TmpDriver::new();
        let root = driver.root_abstract().fop_data;
        let mut hd = 0u64;

        driver.create(root, &mut hd, "a", FileType::Regular).unwrap();
        driver.create(root, &mut hd, "sub", FileType::Directory).unwrap();
        assert!(matches!(
            driver.create(root, &mut hd, "a", FileType::Regular),
            Err(Error::FileExists)
        ));

        assert_eq!(driver.readdir(root, &mut hd, 0).unwrap().abstract_.name, "a");
        assert_eq!(driver.readdir(root, &mut hd, 1).unwrap().abstract_.name, "sub");
        assert!(matches!(
            driver.readdir(root, &mut hd, 2),
            Err(Error::EndOfFile)
        ));

        driver.remove(root, &mut hd, "a").unwrap();
        assert!(matches!(
            driver.find(root, &mut hd, "a"),
            Err(Error::NoSuchFile)
        ));

        // removing a directory frees its whole subtree
        let sub = driver.find(root, &mut hd, "sub").unwrap();
        driver.create(sub.fop_data, &mut hd, "inner", FileType::Regular).unwrap();
        driver.remove(root, &mut hd, "sub").unwrap();
        assert!(matches!(
            driver.readdir(root, &mut hd, 0),
            Err(Error::EndOfFile)
        ));
    }
}
