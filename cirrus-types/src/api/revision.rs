use serde::{Deserialize, Serialize};

use crate::{crypto::ContentHash, ids::FileId};

pub const ENDPOINT: &str = "isrevision";

/// Asks whether `(checksum, size)` is a known historical revision of
/// `file_id`. Drives the conflicted-rename decision when a download is about
/// to displace local content.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Request<'a> {
	pub auth: &'a str,
	#[serde(rename = "fileid")]
	pub file_id: FileId,
	pub checksum: ContentHash,
	pub size: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Response {
	pub result: u64,
	#[serde(default, rename = "isrevision")]
	pub is_revision: bool,
}
