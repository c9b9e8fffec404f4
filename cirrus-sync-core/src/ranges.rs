//! Block-delta planning: decides which byte ranges of a download can be
//! copied from local candidate files and which must come off the wire. The
//! weak/strong pairing is the classic delta-transfer scheme: a cheap rolling
//! checksum slides over each candidate and only weak hits pay for a full
//! digest comparison.

use std::{
	collections::{HashMap, VecDeque},
	io::{BufReader, Read},
	path::{Path, PathBuf},
	sync::Arc,
};

use cirrus_types::{api::checksums::BlockChecksum, crypto::ContentHash, ids::FileId};
use log::{debug, warn};

use crate::{error::NetError, remote::RemoteClient};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeSource {
	/// Fetch from a content host; `offset` is the offset in the target file.
	Transfer,
	/// Read from the named local file; `offset` is the offset in that file.
	CopyLocal(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedRange {
	pub source: RangeSource,
	pub offset: u64,
	pub len: u64,
}

/// Rolling checksum over a fixed window, the Adler-32 variant used for weak
/// block matching: `s1` is the byte sum, `s2` the sum of running prefix
/// sums, both truncated to 16 bits.
#[derive(Debug, Clone, Default)]
pub struct RollingChecksum {
	s1: u32,
	s2: u32,
	len: u32,
}

impl RollingChecksum {
	pub fn from_block(block: &[u8]) -> Self {
		let mut sum = RollingChecksum {
			s1: 0,
			s2: 0,
			len: block.len() as u32,
		};
		for &byte in block {
			sum.s1 = (sum.s1 + byte as u32) & 0xffff;
			sum.s2 = (sum.s2 + sum.s1) & 0xffff;
		}
		sum
	}

	/// Slides the window one byte: `out` leaves at the front, `inp` enters
	/// at the back.
	pub fn roll(&mut self, out: u8, inp: u8) {
		self.s1 = self.s1.wrapping_sub(out as u32).wrapping_add(inp as u32) & 0xffff;
		self.s2 = self
			.s2
			.wrapping_sub(self.len.wrapping_mul(out as u32))
			.wrapping_add(self.s1)
			& 0xffff;
	}

	pub fn digest(&self) -> u32 {
		self.s1 | (self.s2 << 16)
	}
}

/// Digests the server would store for one revision: full blocks plus a
/// (possibly short) tail block. Shared with tests and mock servers.
pub fn compute_block_checksums(data: &[u8], block_size: u64) -> Vec<BlockChecksum> {
	data.chunks(block_size as usize)
		.map(|chunk| BlockChecksum {
			weak: RollingChecksum::from_block(chunk).digest(),
			strong: blake3::hash(chunk).into(),
		})
		.collect()
}

fn whole_transfer(size: u64) -> Vec<PlannedRange> {
	vec![PlannedRange {
		source: RangeSource::Transfer,
		offset: 0,
		len: size,
	}]
}

/// Produces the ordered download plan for a file of `size` bytes. Candidates
/// are consulted in the given order; earlier files win contested blocks.
pub async fn plan(
	remote: &dyn RemoteClient,
	fileid: FileId,
	revision: u64,
	size: u64,
	min_size_for_checksums: u64,
	candidates: &[PathBuf],
) -> Result<Vec<PlannedRange>, NetError> {
	if size < min_size_for_checksums || candidates.is_empty() || size == 0 {
		return Ok(whole_transfer(size));
	}
	let map = remote.block_checksums(fileid, revision).await?;
	if map.block_size == 0 || map.blocks.len() as u64 != size.div_ceil(map.block_size) {
		warn!(
			"server block map for file {fileid} does not cover size {size}, transferring whole body"
		);
		return Ok(whole_transfer(size));
	}
	let block_size = map.block_size;
	// the short tail block cannot be matched by the sliding window
	let full_blocks = if size % block_size == 0 {
		map.blocks.len()
	} else {
		map.blocks.len() - 1
	};
	let mut weak_index: HashMap<u32, Vec<usize>> = HashMap::new();
	for (idx, block) in map.blocks.iter().take(full_blocks).enumerate() {
		weak_index.entry(block.weak).or_default().push(idx);
	}

	let blocks: Arc<[BlockChecksum]> = map.blocks.clone().into();
	let weak_index = Arc::new(weak_index);
	let mut matches: Vec<Option<(usize, u64)>> = vec![None; map.blocks.len()];
	let mut unmatched = full_blocks;

	for (cand_idx, path) in candidates.iter().enumerate() {
		if unmatched == 0 {
			break;
		}
		let path_owned = path.clone();
		let blocks = Arc::clone(&blocks);
		let weak_index = Arc::clone(&weak_index);
		let already: Arc<[bool]> = matches.iter().map(Option::is_some).collect();
		let found = tokio::task::spawn_blocking(move || {
			scan_candidate(&path_owned, block_size, &blocks, &weak_index, &already)
		})
		.await
		.map_err(|_| NetError::Temp)?;
		let found = match found {
			Ok(found) => found,
			Err(e) => {
				debug!("cannot scan candidate {}: {e}", path.display());
				continue;
			}
		};
		for (target, src_off) in found {
			if matches[target].is_none() {
				matches[target] = Some((cand_idx, src_off));
				unmatched -= 1;
			}
		}
	}

	// assemble in ascending target offset, merging adjacent ranges
	let mut plan: Vec<PlannedRange> = Vec::new();
	let mut target_off = 0u64;
	for (idx, matched) in matches.iter().enumerate() {
		let len = (size - target_off).min(block_size);
		match matched {
			Some((cand_idx, src_off)) => {
				let path = &candidates[*cand_idx];
				let mergeable = plan.last().is_some_and(|last| {
					matches!(&last.source, RangeSource::CopyLocal(p) if p == path)
						&& last.offset + last.len == *src_off
				});
				if mergeable {
					let last = plan.last_mut().expect("merge checked non-empty");
					last.len += len;
				} else {
					plan.push(PlannedRange {
						source: RangeSource::CopyLocal(path.clone()),
						offset: *src_off,
						len,
					});
				}
			}
			None => {
				let mergeable = plan.last().is_some_and(|last| {
					last.source == RangeSource::Transfer && last.offset + last.len == target_off
				});
				if mergeable {
					let last = plan.last_mut().expect("merge checked non-empty");
					last.len += len;
				} else {
					plan.push(PlannedRange {
						source: RangeSource::Transfer,
						offset: target_off,
						len,
					});
				}
			}
		}
		target_off += len;
		debug_assert!(idx + 1 < matches.len() || target_off == size);
	}
	Ok(plan)
}

/// Slides the weak window over one candidate and reports strong-confirmed
/// block matches as `(target_block_index, candidate_offset)`.
fn scan_candidate(
	path: &Path,
	block_size: u64,
	blocks: &[BlockChecksum],
	weak_index: &HashMap<u32, Vec<usize>>,
	already: &[bool],
) -> std::io::Result<Vec<(usize, u64)>> {
	let block = block_size as usize;
	let file = std::fs::File::open(path)?;
	let flen = file.metadata()?.len();
	let mut found = Vec::new();
	if flen < block_size {
		return Ok(found);
	}
	let mut reader = BufReader::with_capacity(block.max(256 * 1024), file);
	let mut window: VecDeque<u8> = VecDeque::with_capacity(block);
	let mut chunk = vec![0u8; block];
	reader.read_exact(&mut chunk)?;
	window.extend(chunk.iter().copied());
	let mut rolling = RollingChecksum::from_block(&chunk);
	let mut pos = 0u64;
	let mut claimed = vec![false; blocks.len()];

	loop {
		if let Some(targets) = weak_index.get(&rolling.digest()) {
			let strong: ContentHash = {
				let (a, b) = window.as_slices();
				let mut hasher = blake3::Hasher::new();
				hasher.update(a);
				hasher.update(b);
				hasher.finalize().into()
			};
			let hit = targets.iter().copied().find(|&t| {
				!already[t] && !claimed[t] && blocks[t].strong == strong
			});
			if let Some(target) = hit {
				claimed[target] = true;
				found.push((target, pos));
				// jump a whole block past a confirmed match
				pos += block_size;
				if pos + block_size > flen {
					break;
				}
				match reader.read_exact(&mut chunk) {
					Ok(()) => {}
					Err(_) => break,
				}
				window.clear();
				window.extend(chunk.iter().copied());
				rolling = RollingChecksum::from_block(&chunk);
				continue;
			}
		}
		let mut byte = [0u8; 1];
		if reader.read_exact(&mut byte).is_err() {
			break;
		}
		let out = window.pop_front().expect("window holds a full block");
		window.push_back(byte[0]);
		rolling.roll(out, byte[0]);
		pos += 1;
	}
	Ok(found)
}
