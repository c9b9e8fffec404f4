use std::{
	collections::HashSet,
	fs::Metadata,
	io::{self, Read, Write},
	path::{Path, PathBuf},
	sync::{Arc, Mutex},
};

use cirrus_types::crypto::ContentHash;
use log::{debug, warn};

use crate::consts::{CONFLICT_MARKER, COPY_BUFFER_SIZE};

#[cfg(unix)]
use std::os::unix::fs::MetadataExt;

#[cfg(unix)]
pub fn stat_inode(meta: &Metadata) -> u64 {
	meta.ino()
}

#[cfg(unix)]
pub fn stat_device(meta: &Metadata) -> u64 {
	meta.dev()
}

#[cfg(unix)]
pub fn stat_mtime(meta: &Metadata) -> i64 {
	meta.mtime()
}

#[cfg(unix)]
pub fn stat_mtime_native(meta: &Metadata) -> i64 {
	meta.mtime() * 1_000_000_000 + meta.mtime_nsec()
}

#[cfg(windows)]
use std::os::windows::fs::MetadataExt as WindowsMetadataExt;

#[cfg(windows)]
pub fn stat_inode(_meta: &Metadata) -> u64 {
	0
}

#[cfg(windows)]
pub fn stat_device(_meta: &Metadata) -> u64 {
	0
}

#[cfg(windows)]
pub fn stat_mtime(meta: &Metadata) -> i64 {
	// FILETIME is 100ns intervals since 1601
	(meta.last_write_time() / 10_000_000) as i64 - 11_644_473_600
}

#[cfg(windows)]
pub fn stat_mtime_native(meta: &Metadata) -> i64 {
	meta.last_write_time() as i64
}

/// Free bytes available to the current user on the filesystem holding
/// `path`. `None` when the platform query fails; callers treat that as
/// "unknown, proceed".
#[cfg(unix)]
pub fn free_disk_space(path: &Path) -> Option<u64> {
	use std::os::unix::ffi::OsStrExt;
	let cpath = std::ffi::CString::new(path.as_os_str().as_bytes()).ok()?;
	let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
	// SAFETY: cpath is a valid NUL-terminated string, stat is zeroed storage
	let rc = unsafe { libc::statvfs(cpath.as_ptr(), &mut stat) };
	if rc != 0 {
		return None;
	}
	Some(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(windows)]
pub fn free_disk_space(path: &Path) -> Option<u64> {
	use std::os::windows::ffi::OsStrExt;
	use windows_sys::Win32::Storage::FileSystem::GetDiskFreeSpaceExW;
	let mut wide: Vec<u16> = path.as_os_str().encode_wide().collect();
	wide.push(0);
	let mut free: u64 = 0;
	// SAFETY: wide is NUL-terminated, out pointers are valid
	let rc = unsafe { GetDiskFreeSpaceExW(wide.as_ptr(), &mut free, std::ptr::null_mut(), std::ptr::null_mut()) };
	if rc == 0 { None } else { Some(free) }
}

/// Rename that replaces an existing destination, like POSIX `rename(2)`.
pub fn rename_overwrite(old: &Path, new: &Path) -> io::Result<()> {
	match std::fs::rename(old, new) {
		Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
			std::fs::remove_file(new)?;
			std::fs::rename(old, new)
		}
		other => other,
	}
}

/// Moves a file that is about to be displaced by a server-side change to a
/// ` (conflicted)` sibling, numbering on collision. Returns the new path.
pub fn rename_conflicted_file(path: &Path) -> io::Result<PathBuf> {
	let stem = path
		.file_stem()
		.and_then(|s| s.to_str())
		.unwrap_or_default()
		.to_string();
	let ext = path.extension().and_then(|s| s.to_str());
	let parent = path.parent().unwrap_or_else(|| Path::new(""));
	let mut counter = 0u32;
	loop {
		let suffix = if counter == 0 {
			CONFLICT_MARKER.to_string()
		} else {
			format!("{} {}", CONFLICT_MARKER.trim_end_matches(')'), counter) + ")"
		};
		let candidate = match ext {
			Some(ext) => parent.join(format!("{stem}{suffix}.{ext}")),
			None => parent.join(format!("{stem}{suffix}")),
		};
		if !candidate.exists() {
			std::fs::rename(path, &candidate)?;
			debug!("moved conflicting file {} to {}", path.display(), candidate.display());
			return Ok(candidate);
		}
		counter += 1;
		if counter > 1000 {
			return Err(io::Error::new(
				io::ErrorKind::AlreadyExists,
				"no free conflicted name",
			));
		}
	}
}

/// Names the desktop managers drop into otherwise-empty directories. They do
/// not count as user content when a folder is being removed.
const TRASH_NAMES: [&str; 4] = [".DS_Store", "Thumbs.db", "desktop.ini", ".directory"];

/// `rmdir` that first clears well-known junk entries. Anything else in the
/// directory still fails the removal.
pub fn rmdir_with_trashes(path: &Path) -> io::Result<()> {
	match std::fs::remove_dir(path) {
		Err(e) if e.kind() == io::ErrorKind::DirectoryNotEmpty => {
			for name in TRASH_NAMES {
				let trash = path.join(name);
				if trash.is_file() {
					let _ = std::fs::remove_file(&trash);
				}
			}
			std::fs::remove_dir(path)
		}
		other => other,
	}
}

/// Streaming checksum of a local file: `(digest, size)`.
pub fn local_file_checksum(path: &Path) -> io::Result<(ContentHash, u64)> {
	let mut file = std::fs::File::open(path)?;
	let mut hasher = blake3::Hasher::new();
	let mut buf = vec![0u8; COPY_BUFFER_SIZE];
	let mut size = 0u64;
	loop {
		let read = file.read(&mut buf)?;
		if read == 0 {
			break;
		}
		hasher.update(&buf[..read]);
		size += read as u64;
	}
	Ok((hasher.finalize().into(), size))
}

/// Copies `src` over `dst` only when its content still matches
/// `(expected, expected_size)`. The copy goes through a sibling temp file and
/// is renamed into place, so a mismatch or failure never corrupts `dst`.
/// Returns false on mismatch.
pub fn copy_file_if_checksum_matches(
	src: &Path,
	dst: &Path,
	expected: &ContentHash,
	expected_size: u64,
) -> io::Result<bool> {
	let tmp = dst.with_extension("copytmp");
	let mut input = std::fs::File::open(src)?;
	let mut output = std::fs::File::create(&tmp)?;
	let mut hasher = blake3::Hasher::new();
	let mut buf = vec![0u8; COPY_BUFFER_SIZE];
	let mut size = 0u64;
	let result = loop {
		let read = input.read(&mut buf)?;
		if read == 0 {
			break true;
		}
		hasher.update(&buf[..read]);
		output.write_all(&buf[..read])?;
		size += read as u64;
		if size > expected_size {
			break false;
		}
	};
	let matches = result && size == expected_size && ContentHash::from(hasher.finalize()) == *expected;
	if matches {
		output.sync_all()?;
		drop(output);
		rename_overwrite(&tmp, dst)?;
	} else {
		drop(output);
		let _ = std::fs::remove_file(&tmp);
		warn!("content of {} changed, not usable as copy source", src.display());
	}
	Ok(matches)
}

/// In-process advisory locks on target paths: at most one download may
/// operate on a given `name` at a time.
#[derive(Default)]
pub struct FileLockSet {
	locked: Mutex<HashSet<PathBuf>>,
}

impl FileLockSet {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn try_lock(self: &Arc<Self>, path: &Path) -> Option<FileLockGuard> {
		let mut locked = self.locked.lock().expect("file lock set poisoned");
		if !locked.insert(path.to_path_buf()) {
			return None;
		}
		Some(FileLockGuard {
			set: Arc::clone(self),
			path: path.to_path_buf(),
		})
	}
}

pub struct FileLockGuard {
	set: Arc<FileLockSet>,
	path: PathBuf,
}

impl Drop for FileLockGuard {
	fn drop(&mut self) {
		let mut locked = self.set.locked.lock().expect("file lock set poisoned");
		locked.remove(&self.path);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn lock_set_is_exclusive_per_path() {
		let set = FileLockSet::new();
		let a = set.try_lock(Path::new("/x/a")).unwrap();
		assert!(set.try_lock(Path::new("/x/a")).is_none());
		assert!(set.try_lock(Path::new("/x/b")).is_some());
		drop(a);
		assert!(set.try_lock(Path::new("/x/a")).is_some());
	}

	#[test]
	fn conflicted_rename_keeps_extension() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("report.txt");
		std::fs::write(&path, b"local edit").unwrap();
		let moved = rename_conflicted_file(&path).unwrap();
		assert!(!path.exists());
		assert_eq!(
			moved.file_name().unwrap().to_str().unwrap(),
			"report (conflicted).txt"
		);
		assert_eq!(std::fs::read(&moved).unwrap(), b"local edit");
	}

	#[test]
	fn conflicted_rename_numbers_collisions() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("report.txt");
		std::fs::write(dir.path().join("report (conflicted).txt"), b"older").unwrap();
		std::fs::write(&path, b"newer").unwrap();
		let moved = rename_conflicted_file(&path).unwrap();
		assert_eq!(
			moved.file_name().unwrap().to_str().unwrap(),
			"report (conflicted 1).txt"
		);
	}

	#[test]
	fn rmdir_with_trashes_clears_junk_only() {
		let dir = tempfile::tempdir().unwrap();
		let target = dir.path().join("folder");
		std::fs::create_dir(&target).unwrap();
		std::fs::write(target.join(".DS_Store"), b"junk").unwrap();
		rmdir_with_trashes(&target).unwrap();
		assert!(!target.exists());

		let target = dir.path().join("folder2");
		std::fs::create_dir(&target).unwrap();
		std::fs::write(target.join("real.txt"), b"keep").unwrap();
		assert!(rmdir_with_trashes(&target).is_err());
		assert!(target.join("real.txt").exists());
	}

	#[test]
	fn copy_verifies_checksum() {
		let dir = tempfile::tempdir().unwrap();
		let src = dir.path().join("src.bin");
		let dst = dir.path().join("dst.bin");
		let content = vec![7u8; 100_000];
		std::fs::write(&src, &content).unwrap();
		let hash: ContentHash = blake3::hash(&content).into();

		assert!(copy_file_if_checksum_matches(&src, &dst, &hash, content.len() as u64).unwrap());
		assert_eq!(std::fs::read(&dst).unwrap(), content);

		let other: ContentHash = blake3::hash(b"different").into();
		assert!(!copy_file_if_checksum_matches(&src, &dst, &other, content.len() as u64).unwrap());
	}
}
