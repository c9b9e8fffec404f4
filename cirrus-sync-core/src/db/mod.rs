use std::{
	path::Path,
	sync::{Arc, Mutex, MutexGuard},
};

use rusqlite::Connection;

use crate::error::TaskError;

pub mod fstask;
pub mod local;
pub mod task;

const INIT: &str = include_str!("../../sql/init.sql");

/// Owner of the single sqlite connection. Every subsystem funnels through
/// [`Database::conn`]; multi-statement mutations open an explicit
/// transaction on the guarded connection.
pub struct Database {
	conn: Mutex<Connection>,
}

impl Database {
	pub fn open(path: &Path) -> Result<Arc<Self>, TaskError> {
		let conn = Connection::open(path)?;
		Self::from_connection(conn)
	}

	pub fn open_in_memory() -> Result<Arc<Self>, TaskError> {
		let conn = Connection::open_in_memory()?;
		Self::from_connection(conn)
	}

	fn from_connection(conn: Connection) -> Result<Arc<Self>, TaskError> {
		conn.execute_batch(INIT)?;
		Ok(Arc::new(Self {
			conn: Mutex::new(conn),
		}))
	}

	pub fn conn(&self) -> MutexGuard<'_, Connection> {
		self.conn.lock().expect("database mutex poisoned")
	}
}
