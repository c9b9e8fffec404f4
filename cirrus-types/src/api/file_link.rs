use serde::{Deserialize, Serialize};

use crate::ids::FileId;

pub const ENDPOINT: &str = "getfilelink";

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Request<'a> {
	pub auth: &'a str,
	#[serde(rename = "fileid")]
	pub file_id: FileId,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Response {
	pub result: u64,
	/// Content hosts to try in order, as `host[:port]` authorities.
	#[serde(default)]
	pub hosts: Vec<String>,
	/// Absolute request path valid on every returned host.
	#[serde(default)]
	pub path: String,
}
