//! Session storage layer.
//!
//! The session store tracks in-flight multipart uploads and the parts
//! received for each.  The [`store::SessionStore`] trait defines the
//! interface; [`sqlite::SqliteSessionStore`] is the durable default and
//! [`memory::MemorySessionStore`] serves tests and single-node setups.

pub mod memory;
pub mod sqlite;
pub mod store;

use std::sync::Arc;

use store::SessionStore;

/// Build a session store from its connection URI.
///
/// Supported schemes:
/// - `memory://` -- process-local, lost on restart;
/// - `sqlite://<path>` -- durable SQLite file (`sqlite://:memory:` for
///   an ephemeral database).
pub fn connect(uri: &str) -> anyhow::Result<Arc<dyn SessionStore>> {
    if uri == "memory://" || uri == "memory" {
        return Ok(Arc::new(memory::MemorySessionStore::new()));
    }

    if let Some(path) = uri.strip_prefix("sqlite://") {
        if path.is_empty() {
            anyhow::bail!("session store URI '{uri}' has no database path");
        }
        if path != ":memory:" {
            if let Some(parent) = std::path::Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }
        return Ok(Arc::new(sqlite::SqliteSessionStore::new(path)?));
    }

    anyhow::bail!("unsupported session store URI '{uri}' (expected memory:// or sqlite://<path>)")
}
