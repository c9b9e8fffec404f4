use serde::{Deserialize, Serialize};

use crate::{crypto::ContentHash, ids::FileId};

pub const ENDPOINT: &str = "getfilemeta";

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Request<'a> {
	pub auth: &'a str,
	#[serde(rename = "fileid")]
	pub file_id: FileId,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Response {
	pub result: u64,
	#[serde(default)]
	pub size: u64,
	#[serde(default)]
	pub checksum: Option<ContentHash>,
	/// Server-side revision counter for the content; stored alongside the
	/// checksum so drift can be detected without rehashing.
	#[serde(default)]
	pub revision: u64,
}
