// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Archive primitives.
//!
//! Pure filesystem I/O with no knowledge of services or stores. Trees are
//! walked in sorted order so the same input always produces the same member
//! order. A symlink given as a member root or copy source is resolved once,
//! so a data directory that is itself a link is captured by content. Links
//! found below the root are stored as links, never followed.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};

/// A source path and the name it gets inside an archive.
#[derive(Debug, Clone)]
pub struct Member<'a> {
    /// Path on disk, file or directory.
    pub source: &'a Path,
    /// Relative name inside the archive.
    pub name: String,
}

fn sorted_children(dir: &Path) -> io::Result<Vec<fs::DirEntry>> {
    let mut children = fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;
    children.sort_by_key(|e| e.file_name());
    Ok(children)
}

fn append_tree<W: Write>(builder: &mut tar::Builder<W>, source: &Path, name: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(source)?;
    if meta.is_dir() {
        builder.append_dir(name, source)?;
        for child in sorted_children(source)? {
            append_tree(builder, &child.path(), &name.join(child.file_name()))?;
        }
        Ok(())
    } else {
        // Files and symlinks; follow_symlinks(false) keeps links as links.
        builder.append_path_with_name(source, name)
    }
}

/// Write `members` into a gzip-compressed tar at `dest`.
///
/// The file is fsynced before returning. Returns the archive size in bytes.
pub fn write_tar_gz(dest: &Path, members: &[Member<'_>]) -> io::Result<u64> {
    let file = File::create(dest)?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.mode(tar::HeaderMode::Complete);

    for member in members {
        let root = fs::canonicalize(member.source)?;
        append_tree(&mut builder, &root, Path::new(&member.name))?;
    }

    let encoder = builder.into_inner()?;
    let writer = encoder.finish()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(file.metadata()?.len())
}

/// Unpack a gzip-compressed tar into `dest`, preserving permissions and
/// ownership.
pub fn unpack_tar_gz(src: &Path, dest: &Path) -> io::Result<()> {
    fs::create_dir_all(dest)?;
    let decoder = GzDecoder::new(BufReader::new(File::open(src)?));
    let mut archive = tar::Archive::new(decoder);
    archive.set_preserve_permissions(true);
    archive.set_preserve_ownerships(true);
    archive.set_overwrite(true);
    archive.unpack(dest)
}

/// Recursively copy `src` to `dest`, preserving mode, ownership and symlinks.
///
/// A symlink at `src` itself is followed; links below it are copied as links.
/// `dest` must not exist yet.
pub fn copy_tree(src: &Path, dest: &Path) -> io::Result<()> {
    copy_entry(&fs::canonicalize(src)?, dest)
}

fn copy_entry(src: &Path, dest: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(src)?;
    let file_type = meta.file_type();

    if file_type.is_symlink() {
        let target = fs::read_link(src)?;
        std::os::unix::fs::symlink(target, dest)?;
        std::os::unix::fs::lchown(dest, Some(meta.uid()), Some(meta.gid()))?;
        return Ok(());
    }

    if file_type.is_dir() {
        fs::create_dir(dest)?;
        for child in sorted_children(src)? {
            copy_entry(&child.path(), &dest.join(child.file_name()))?;
        }
    } else if file_type.is_file() {
        fs::copy(src, dest)?;
    } else {
        // Sockets, fifos and device nodes carry no durable state.
        return Ok(());
    }

    std::os::unix::fs::chown(dest, Some(meta.uid()), Some(meta.gid()))?;
    fs::set_permissions(dest, fs::Permissions::from_mode(meta.mode() & 0o7777))?;
    Ok(())
}

/// Replace the contents of directory `dest` with the contents of `src`.
///
/// `dest` itself is kept so that bind mounts referring to it stay valid. The
/// new contents are copied into a hidden sibling first; `dest` is only
/// emptied once that copy has fully succeeded.
pub fn replace_dir_contents(src: &Path, dest: &Path) -> io::Result<()> {
    let children = sorted_children(src)?;
    fs::create_dir_all(dest)?;
    let dest = fs::canonicalize(dest)?;
    let incoming = incoming_dir(&dest)?;

    remove_entry(&incoming)?;
    fs::create_dir(&incoming)?;
    let copied = children
        .iter()
        .try_for_each(|child| copy_entry(&child.path(), &incoming.join(child.file_name())));
    if let Err(e) = copied {
        let _ = remove_entry(&incoming);
        return Err(e);
    }

    for child in sorted_children(&dest)? {
        remove_entry(&child.path())?;
    }
    for child in sorted_children(&incoming)? {
        fs::rename(child.path(), dest.join(child.file_name()))?;
    }
    fs::remove_dir(&incoming)
}

fn incoming_dir(dest: &Path) -> io::Result<PathBuf> {
    match (dest.parent(), dest.file_name()) {
        (Some(parent), Some(name)) => {
            Ok(parent.join(format!(".{}.incoming", name.to_string_lossy())))
        }
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("cannot replace contents of {}", dest.display()),
        )),
    }
}

/// Remove a file, symlink or directory tree. Already-absent is success.
pub fn remove_entry(path: &Path) -> io::Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Total size in bytes of regular files under `path`.
pub fn disk_usage(path: &Path) -> io::Result<u64> {
    let meta = fs::symlink_metadata(path)?;
    if !meta.is_dir() {
        return Ok(meta.len());
    }
    let mut total = 0;
    for child in fs::read_dir(path)? {
        total += disk_usage(&child?.path())?;
    }
    Ok(total)
}

/// Hex-encoded SHA-256 of a file's contents.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect())
}

/// Check that `path` exists and can be listed or opened.
pub fn check_readable(path: &Path) -> io::Result<()> {
    let meta = fs::metadata(path)?;
    if meta.is_dir() {
        fs::read_dir(path).map(|_| ())
    } else {
        File::open(path).map(|_| ())
    }
}
