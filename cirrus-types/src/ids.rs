use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! server_id {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(
			Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
		)]
		#[serde(transparent)]
		pub struct $name(pub u64);

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				self.0.fmt(f)
			}
		}

		impl From<u64> for $name {
			fn from(value: u64) -> Self {
				Self(value)
			}
		}

		#[cfg(feature = "rusqlite")]
		impl rusqlite::ToSql for $name {
			fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
				Ok(rusqlite::types::ToSqlOutput::from(self.0 as i64))
			}
		}

		#[cfg(feature = "rusqlite")]
		impl rusqlite::types::FromSql for $name {
			fn column_result(
				value: rusqlite::types::ValueRef<'_>,
			) -> rusqlite::types::FromSqlResult<Self> {
				i64::column_result(value).map(|v| Self(v as u64))
			}
		}
	};
}

server_id!(
	/// Identifier of one configured local-root-to-remote-root mapping.
	SyncId
);
server_id!(
	/// Server-assigned file identifier.
	FileId
);
server_id!(
	/// Server-assigned folder identifier.
	FolderId
);
server_id!(
	/// Row id in the `localfile` table.
	LocalFileId
);
server_id!(
	/// Row id in the `localfolder` table.
	LocalFolderId
);
server_id!(
	/// Row id in the `fstask` table.
	FsTaskId
);

/// Identifier of a remote filesystem node as seen through the overlay:
/// either a real server-assigned id, or a placeholder for an entity whose
/// creating fstask has not been acknowledged yet.
///
/// The SQL encoding is a signed integer where pending ids are stored as the
/// negated task id, so the persistent format stays readable with plain
/// queries (`folderid < 0` means pending).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsItemId {
	Server(u64),
	Pending(FsTaskId),
}

pub type FsFolderId = FsItemId;
pub type FsFileId = FsItemId;

impl FsItemId {
	pub fn from_raw(raw: i64) -> Self {
		if raw < 0 {
			FsItemId::Pending(FsTaskId((-raw) as u64))
		} else {
			FsItemId::Server(raw as u64)
		}
	}

	pub fn to_raw(self) -> i64 {
		match self {
			FsItemId::Server(id) => id as i64,
			FsItemId::Pending(task) => -(task.0 as i64),
		}
	}

	pub fn is_pending(self) -> bool {
		matches!(self, FsItemId::Pending(_))
	}

	/// The fstask this id is waiting on, if any.
	pub fn pending_task(self) -> Option<FsTaskId> {
		match self {
			FsItemId::Pending(task) => Some(task),
			FsItemId::Server(_) => None,
		}
	}
}

impl From<FolderId> for FsItemId {
	fn from(value: FolderId) -> Self {
		FsItemId::Server(value.0)
	}
}

impl From<FileId> for FsItemId {
	fn from(value: FileId) -> Self {
		FsItemId::Server(value.0)
	}
}

impl Ord for FsItemId {
	fn cmp(&self, other: &Self) -> std::cmp::Ordering {
		self.to_raw().cmp(&other.to_raw())
	}
}

impl PartialOrd for FsItemId {
	fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
		Some(self.cmp(other))
	}
}

impl fmt::Display for FsItemId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.to_raw().fmt(f)
	}
}

#[cfg(feature = "rusqlite")]
impl rusqlite::ToSql for FsItemId {
	fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
		Ok(rusqlite::types::ToSqlOutput::from(self.to_raw()))
	}
}

#[cfg(feature = "rusqlite")]
impl rusqlite::types::FromSql for FsItemId {
	fn column_result(value: rusqlite::types::ValueRef<'_>) -> rusqlite::types::FromSqlResult<Self> {
		i64::column_result(value).map(Self::from_raw)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn fs_item_id_raw_round_trip() {
		assert_eq!(FsItemId::from_raw(42), FsItemId::Server(42));
		assert_eq!(FsItemId::from_raw(-7), FsItemId::Pending(FsTaskId(7)));
		assert_eq!(FsItemId::Pending(FsTaskId(7)).to_raw(), -7);
		assert_eq!(FsItemId::Server(0).to_raw(), 0);
	}

	#[test]
	fn fs_item_id_orders_by_raw_encoding() {
		let mut ids = vec![
			FsItemId::Server(3),
			FsItemId::Pending(FsTaskId(1)),
			FsItemId::Server(0),
			FsItemId::Pending(FsTaskId(9)),
		];
		ids.sort();
		assert_eq!(
			ids,
			vec![
				FsItemId::Pending(FsTaskId(9)),
				FsItemId::Pending(FsTaskId(1)),
				FsItemId::Server(0),
				FsItemId::Server(3),
			]
		);
	}
}
