//! The RPC seam towards the gateway and the ranged GET used for file bodies.
//! The trait exists so tests (and the P2P prober) can stand in for the
//! server; [`GatewayClient`] is the production implementation.

use async_trait::async_trait;
use cirrus_types::{
	api::{self, checksums::BlockChecksum},
	crypto::ContentHash,
	error::ResponseError,
	ids::FileId,
};
use log::{debug, warn};
use serde::{Serialize, de::DeserializeOwned};

use crate::error::NetError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
	pub size: u64,
	pub checksum: ContentHash,
	pub revision: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLink {
	pub hosts: Vec<String>,
	pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMap {
	pub block_size: u64,
	pub blocks: Vec<BlockChecksum>,
}

#[async_trait]
pub trait RemoteClient: Send + Sync {
	/// Authoritative `(checksum, size, revision)` of a file.
	async fn file_meta(&self, fileid: FileId) -> Result<FileMeta, NetError>;

	/// Content hosts and request path for the file body.
	async fn file_link(&self, fileid: FileId) -> Result<FileLink, NetError>;

	/// Per-block digests of the file revision, for the range planner.
	async fn block_checksums(&self, fileid: FileId, revision: u64) -> Result<BlockMap, NetError>;

	/// Whether `(checksum, size)` is a known past revision of the file.
	async fn is_revision_of_file(
		&self,
		checksum: &ContentHash,
		size: u64,
		fileid: FileId,
	) -> Result<bool, NetError>;
}

pub struct GatewayClient {
	http: reqwest::Client,
	gateways: Vec<String>,
	auth: String,
}

impl GatewayClient {
	pub fn new(auth: String, gateways: Vec<String>) -> Result<Self, NetError> {
		let http = reqwest::Client::builder()
			.build()
			.map_err(NetError::from)?;
		Ok(Self {
			http,
			gateways,
			auth,
		})
	}

	async fn post<Req: Serialize, Resp: DeserializeOwned>(
		&self,
		endpoint: &str,
		request: &Req,
	) -> Result<Resp, NetError> {
		let mut last = NetError::Temp;
		for gateway in &self.gateways {
			let url = format!("{gateway}/{endpoint}");
			match self.http.post(&url).json(request).send().await {
				Ok(resp) => match resp.json::<Resp>().await {
					Ok(body) => return Ok(body),
					Err(e) => {
						warn!("bad response from {url}: {e}");
						last = NetError::from(e);
					}
				},
				Err(e) => {
					debug!("gateway {url} unreachable: {e}");
					last = NetError::from(e);
				}
			}
		}
		Err(last)
	}
}

fn check_result(result: u64) -> Result<(), NetError> {
	if result == 0 {
		Ok(())
	} else {
		warn!("gateway returned error code {result}");
		Err(NetError::from(ResponseError { code: result }))
	}
}

#[async_trait]
impl RemoteClient for GatewayClient {
	async fn file_meta(&self, fileid: FileId) -> Result<FileMeta, NetError> {
		let request = api::file_meta::Request {
			auth: &self.auth,
			file_id: fileid,
		};
		let resp: api::file_meta::Response =
			self.post(api::file_meta::ENDPOINT, &request).await?;
		check_result(resp.result)?;
		let checksum = resp.checksum.ok_or(NetError::Perm)?;
		Ok(FileMeta {
			size: resp.size,
			checksum,
			revision: resp.revision,
		})
	}

	async fn file_link(&self, fileid: FileId) -> Result<FileLink, NetError> {
		let request = api::file_link::Request {
			auth: &self.auth,
			file_id: fileid,
		};
		let resp: api::file_link::Response =
			self.post(api::file_link::ENDPOINT, &request).await?;
		check_result(resp.result)?;
		if resp.hosts.is_empty() || resp.path.is_empty() {
			return Err(NetError::Perm);
		}
		Ok(FileLink {
			hosts: resp.hosts,
			path: resp.path,
		})
	}

	async fn block_checksums(&self, fileid: FileId, revision: u64) -> Result<BlockMap, NetError> {
		let request = api::checksums::Request {
			auth: &self.auth,
			file_id: fileid,
			revision,
		};
		let resp: api::checksums::Response =
			self.post(api::checksums::ENDPOINT, &request).await?;
		check_result(resp.result)?;
		Ok(BlockMap {
			block_size: resp.block_size,
			blocks: resp.blocks,
		})
	}

	async fn is_revision_of_file(
		&self,
		checksum: &ContentHash,
		size: u64,
		fileid: FileId,
	) -> Result<bool, NetError> {
		let request = api::revision::Request {
			auth: &self.auth,
			file_id: fileid,
			checksum: *checksum,
			size,
		};
		let resp: api::revision::Response =
			self.post(api::revision::ENDPOINT, &request).await?;
		check_result(resp.result)?;
		Ok(resp.is_revision)
	}
}

/// Builds the body URL on one content host. Hosts carrying an explicit port
/// are taken to be plain-http (development and LAN peers); bare hostnames go
/// through https.
pub(crate) fn host_url(host: &str, path: &str) -> String {
	if host.contains(':') {
		format!("http://{host}{path}")
	} else {
		format!("https://{host}{path}")
	}
}

/// Opens a ranged GET against the first host that answers. A whole-file
/// request (`offset == 0 && len == total`) is sent open-ended, without a
/// Range header.
pub(crate) async fn fetch_range(
	http: &reqwest::Client,
	link: &FileLink,
	offset: u64,
	len: u64,
	total: u64,
) -> Result<reqwest::Response, NetError> {
	let mut last = NetError::Temp;
	for host in &link.hosts {
		let url = host_url(host, &link.path);
		let mut request = http.get(&url);
		if !(offset == 0 && len == total) {
			request = request.header(
				reqwest::header::RANGE,
				format!("bytes={}-{}", offset, offset + len - 1),
			);
		}
		match request.send().await {
			Ok(resp) if resp.status().is_success() => return Ok(resp),
			Ok(resp) => {
				warn!("content host {host} answered {}", resp.status());
				last = if resp.status().is_server_error() {
					NetError::Temp
				} else {
					NetError::Perm
				};
			}
			Err(e) => {
				debug!("content host {host} unreachable: {e}");
				last = NetError::from(e);
			}
		}
	}
	Err(last)
}
