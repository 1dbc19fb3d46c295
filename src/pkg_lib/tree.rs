/// Staging tree: the logical directory/file tree a PFS image is built from.
/// Nodes live in an arena and reference parents by index.
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};

use crate::pkg_lib::desc::EntryId;
use crate::pkg_lib::BuildError;

/// Streams one node's payload into a byte sink. Contents are never held in
/// memory ahead of time.
pub type NodeWriter = Box<dyn Fn(&mut dyn io::Write) -> Result<()> + Send + Sync>;

pub enum NodeKind {
    Dir,
    File { compress: bool, compressed_size: Option<u64> },
    /// FPT / collision-resolver pseudo-file
    Blob,
}

pub struct FsNode {
    pub name: String,
    pub parent: Option<usize>,
    pub kind: NodeKind,
    /// Uncompressed payload size; 0 for directories
    pub size: u64,
    pub writer: Option<NodeWriter>,
    pub children: Vec<usize>,
    /// Assigned during PFS setup
    pub inode: u32,
}

impl FsNode {
    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Dir)
    }
}

pub struct StagingTree {
    nodes: Vec<FsNode>,
}

pub const UROOT: usize = 0;

impl StagingTree {
    pub fn new() -> Self {
        Self {
            nodes: vec![FsNode {
                name: "uroot".to_string(),
                parent: None,
                kind: NodeKind::Dir,
                size: 0,
                writer: None,
                children: vec![],
                inode: 0,
            }],
        }
    }

    pub fn node(&self, idx: usize) -> &FsNode {
        &self.nodes[idx]
    }

    pub fn node_mut(&mut self, idx: usize) -> &mut FsNode {
        &mut self.nodes[idx]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    pub fn add_dir(&mut self, parent: usize, name: &str) -> usize {
        self.add_node(parent, name, NodeKind::Dir, 0, None)
    }

    pub fn add_file(&mut self, parent: usize, name: &str, size: u64, writer: NodeWriter) -> usize {
        self.add_node(
            parent,
            name,
            NodeKind::File {
                compress: false,
                compressed_size: None,
            },
            size,
            Some(writer),
        )
    }

    /// A file that only reserves blocks; its bytes are written by the
    /// caller after the image data pass (used for the embedded inner image)
    pub fn add_external_file(&mut self, parent: usize, name: &str, size: u64) -> usize {
        self.add_node(
            parent,
            name,
            NodeKind::File {
                compress: false,
                compressed_size: None,
            },
            size,
            None,
        )
    }

    fn add_node(
        &mut self,
        parent: usize,
        name: &str,
        kind: NodeKind,
        size: u64,
        writer: Option<NodeWriter>,
    ) -> usize {
        let idx = self.nodes.len();
        self.nodes.push(FsNode {
            name: name.to_string(),
            parent: Some(parent),
            kind,
            size,
            writer,
            children: vec![],
            inode: 0,
        });
        self.nodes[parent].children.push(idx);
        idx
    }

    /// Full path from the user root, e.g. "/a/b/c.txt"; `uroot` itself is ""
    pub fn full_path(&self, idx: usize) -> String {
        if idx == UROOT {
            return String::new();
        }
        let mut parts = vec![];
        let mut cur = Some(idx);
        while let Some(i) = cur {
            if i == UROOT {
                break;
            }
            parts.push(self.nodes[i].name.clone());
            cur = self.nodes[i].parent;
        }
        parts.reverse();
        format!("/{}", parts.join("/"))
    }

    /// Directory indices in ordinal full-path order (excluding uroot)
    pub fn dirs_ordinal(&self) -> Vec<usize> {
        let mut dirs: Vec<usize> = (1..self.nodes.len())
            .filter(|&i| self.nodes[i].is_dir())
            .collect();
        dirs.sort_by_key(|&i| self.full_path(i));
        dirs
    }

    /// File indices in shallow-last order: the synthetic sort key pushes a
    /// parent's own files after everything under its subdirectories.
    pub fn files_shallow_last(&self) -> Vec<usize> {
        let mut files: Vec<usize> = (1..self.nodes.len())
            .filter(|&i| !self.nodes[i].is_dir())
            .collect();
        files.sort_by_key(|&i| {
            let parent = self.nodes[i].parent.unwrap_or(UROOT);
            format!("{}zzzzzzzzzz/{}", self.full_path(parent), self.nodes[i].name)
        });
        files
    }

    /// Build the tree from a staged directory. Files under `sce_sys/` whose
    /// trailing path names a known PKG entry are excluded here and returned
    /// for the container builder instead.
    pub fn from_dir(root: &Path) -> Result<(Self, Vec<(EntryId, PathBuf)>)> {
        if !root.is_dir() {
            return Err(anyhow!(BuildError::InvalidProject(format!(
                "root_dir is not a directory: {}",
                root.display()
            ))));
        }
        let mut tree = Self::new();
        let mut pkg_entries = vec![];
        tree.scan_dir(root, root, UROOT, &mut pkg_entries)?;
        pkg_entries.sort_by_key(|(id, _)| (id.sort_key(), u32::from(*id)));
        Ok((tree, pkg_entries))
    }

    fn scan_dir(
        &mut self,
        root: &Path,
        dir: &Path,
        parent: usize,
        pkg_entries: &mut Vec<(EntryId, PathBuf)>,
    ) -> Result<()> {
        let mut entries: Vec<_> = std::fs::read_dir(dir)
            .with_context(|| format!("cannot read {}", dir.display()))?
            .collect::<io::Result<_>>()?;
        // stable scan order regardless of the host filesystem
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let path = entry.path();
            let name = entry.file_name();
            let name = name
                .to_str()
                .ok_or_else(|| anyhow!("non-UTF-8 file name: {:?}", entry.file_name()))?;
            let meta = entry.metadata()?;
            if meta.is_dir() {
                let idx = self.add_dir(parent, name);
                self.scan_dir(root, &path, idx, pkg_entries)?;
            } else {
                if let Some(id) = sce_sys_entry_id(root, &path) {
                    pkg_entries.push((id, path));
                    continue;
                }
                let src = path.clone();
                self.add_file(
                    parent,
                    name,
                    meta.len(),
                    Box::new(move |sink| {
                        let mut file = File::open(&src)
                            .with_context(|| format!("cannot open {}", src.display()))?;
                        io::copy(&mut file, sink)?;
                        Ok(())
                    }),
                );
            }
        }
        Ok(())
    }
}

impl Default for StagingTree {
    fn default() -> Self {
        Self::new()
    }
}

/// Known PKG entry id for a staged file, when the file sits under
/// `sce_sys/` and its trailing path is in the name map.
fn sce_sys_entry_id(root: &Path, path: &Path) -> Option<EntryId> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = rel.components().map(|c| c.as_os_str().to_str());
    if parts.next()?? != "sce_sys" {
        return None;
    }
    let tail: Vec<&str> = rel
        .components()
        .skip(1)
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<_>>()?;
    EntryId::from_sce_sys_name(&tail.join("/"))
}
