use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ConversionError;

pub const HASH_DIGEST_LEN: usize = blake3::OUT_LEN;
pub const HASH_DIGEST_HEXLEN: usize = HASH_DIGEST_LEN * 2;

/// Content checksum of a whole file or of a delta block, as exchanged with
/// the server and stored in the `checksum` columns. Serialized as lowercase
/// hex everywhere (wire, SQL, logs).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash(pub [u8; HASH_DIGEST_LEN]);

impl ContentHash {
	pub fn as_bytes(&self) -> &[u8; HASH_DIGEST_LEN] {
		&self.0
	}

	pub fn to_hex(&self) -> String {
		let mut out = String::with_capacity(HASH_DIGEST_HEXLEN);
		for byte in self.0 {
			out.push(char::from_digit((byte >> 4) as u32, 16).unwrap());
			out.push(char::from_digit((byte & 0xf) as u32, 16).unwrap());
		}
		out
	}
}

impl From<blake3::Hash> for ContentHash {
	fn from(hash: blake3::Hash) -> Self {
		ContentHash(*hash.as_bytes())
	}
}

impl FromStr for ContentHash {
	type Err = ConversionError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		if s.len() != HASH_DIGEST_HEXLEN {
			return Err(ConversionError::InvalidHashLength(s.len()));
		}
		let mut bytes = [0u8; HASH_DIGEST_LEN];
		for (i, chunk) in s.as_bytes().chunks_exact(2).enumerate() {
			let hi = (chunk[0] as char)
				.to_digit(16)
				.ok_or(ConversionError::InvalidHashDigit(chunk[0] as char))?;
			let lo = (chunk[1] as char)
				.to_digit(16)
				.ok_or(ConversionError::InvalidHashDigit(chunk[1] as char))?;
			bytes[i] = ((hi << 4) | lo) as u8;
		}
		Ok(ContentHash(bytes))
	}
}

impl fmt::Display for ContentHash {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.to_hex())
	}
}

impl fmt::Debug for ContentHash {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "ContentHash({})", self.to_hex())
	}
}

impl Serialize for ContentHash {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&self.to_hex())
	}
}

impl<'de> Deserialize<'de> for ContentHash {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let s = <&str>::deserialize(deserializer)?;
		s.parse().map_err(serde::de::Error::custom)
	}
}

#[cfg(feature = "rusqlite")]
impl rusqlite::ToSql for ContentHash {
	fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
		Ok(rusqlite::types::ToSqlOutput::from(self.to_hex()))
	}
}

#[cfg(feature = "rusqlite")]
impl rusqlite::types::FromSql for ContentHash {
	fn column_result(value: rusqlite::types::ValueRef<'_>) -> rusqlite::types::FromSqlResult<Self> {
		let text = value.as_str()?;
		text.parse()
			.map_err(|e| rusqlite::types::FromSqlError::Other(Box::new(e)))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn hex_round_trip() {
		let hash: ContentHash = blake3::hash(b"cirrus").into();
		let hex = hash.to_hex();
		assert_eq!(hex.len(), HASH_DIGEST_HEXLEN);
		assert_eq!(hex.parse::<ContentHash>().unwrap(), hash);
	}

	#[test]
	fn rejects_malformed_hex() {
		assert!("abcd".parse::<ContentHash>().is_err());
		let bad = "z".repeat(HASH_DIGEST_HEXLEN);
		assert!(bad.parse::<ContentHash>().is_err());
	}
}
