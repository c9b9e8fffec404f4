use serde::{Deserialize, Serialize};

use crate::{crypto::ContentHash, ids::FileId};

pub const ENDPOINT: &str = "getchecksums";

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Request<'a> {
	pub auth: &'a str,
	#[serde(rename = "fileid")]
	pub file_id: FileId,
	pub revision: u64,
}

/// Per-block digests of one file revision. `weak` is the 32-bit rolling
/// checksum of the block, `strong` the full content hash; the final block may
/// be shorter than `block_size`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BlockChecksum {
	pub weak: u32,
	pub strong: ContentHash,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Response {
	pub result: u64,
	#[serde(default)]
	pub block_size: u64,
	#[serde(default)]
	pub blocks: Vec<BlockChecksum>,
}
