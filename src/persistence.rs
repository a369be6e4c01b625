//! Persistence layer for CertChain
//!
//! Three kinds of artifact are stored: one document per block, a full
//! snapshot of the token table, and an append-only audit log. The peer list
//! is stored alongside them. None of this is transactional across artifacts.

use crate::blockchain::Block;
use crate::config::{StorageBackend, StorageConfig};
use crate::credit::{BankTransaction, CreditToken};
use crate::error::ChainError;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Abstraction for persistence backends. Every write is a whole-document
/// overwrite except the audit log, which is append-only.
pub trait Persistence: Send + Sync {
    fn save_block(&self, block: &Block) -> Result<(), ChainError>;
    /// Stored blocks in ascending index order.
    fn load_blocks(&self) -> Result<Vec<Block>, ChainError>;
    fn clear_blocks(&self) -> Result<(), ChainError>;

    fn save_tokens(&self, tokens: &[CreditToken]) -> Result<(), ChainError>;
    fn load_tokens(&self) -> Result<Vec<CreditToken>, ChainError>;
    /// Copy the current token snapshot aside. Returns where it went, or
    /// `None` when there was nothing to back up.
    fn backup_tokens(&self) -> Result<Option<String>, ChainError>;

    fn append_audit(&self, transaction: &BankTransaction) -> Result<(), ChainError>;
    fn load_audit(&self) -> Result<Vec<BankTransaction>, ChainError>;

    fn save_peers(&self, peers: &[String]) -> Result<(), ChainError>;
    fn load_peers(&self) -> Result<Vec<String>, ChainError>;
}

/// On-disk shape of the token table.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub tokens: Vec<CreditToken>,
}

/// Open the backend selected in `storage` for node `node_id`.
pub fn open_store(storage: &StorageConfig, node_id: &str) -> Result<Arc<dyn Persistence>, ChainError> {
    let root = Path::new(&storage.data_dir).join(format!("node-{}", node_id));
    let store: Arc<dyn Persistence> = match storage.backend {
        StorageBackend::File => Arc::new(FileStore::open(&root)?),
        StorageBackend::Sqlite => {
            fs::create_dir_all(&root)?;
            let path = root.join("certchain.db");
            Arc::new(Database::open(&path.to_string_lossy())?)
        }
        StorageBackend::Memory => Arc::new(InMemoryPersistence::new()),
    };
    info!(backend = ?storage.backend, path = %root.display(), "Storage opened");
    Ok(store)
}

// ----------------------------------------------------------------------
// JSON documents on disk
// ----------------------------------------------------------------------

const BLOCKS_DIR: &str = "blocks";
const LEDGER_FILE: &str = "credit-ledger.json";
const AUDIT_FILE: &str = "transaction-log.jsonl";
const PEERS_FILE: &str = "peers.json";

pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, ChainError> {
        let root = root.into();
        fs::create_dir_all(root.join(BLOCKS_DIR))?;
        Ok(FileStore { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn block_path(&self, index: u64) -> PathBuf {
        self.root.join(BLOCKS_DIR).join(format!("block-{}.json", index))
    }

    /// Write through a sibling temp file so readers never see half a document.
    fn write_document<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> Result<(), ChainError> {
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

fn block_file_index(path: &Path) -> Option<u64> {
    path.file_name()?
        .to_str()?
        .strip_prefix("block-")?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

impl Persistence for FileStore {
    fn save_block(&self, block: &Block) -> Result<(), ChainError> {
        self.write_document(&self.block_path(block.index), block)
    }

    fn load_blocks(&self) -> Result<Vec<Block>, ChainError> {
        let mut indexed: Vec<(u64, PathBuf)> = fs::read_dir(self.root.join(BLOCKS_DIR))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter_map(|path| block_file_index(&path).map(|index| (index, path)))
            .collect();
        indexed.sort_by_key(|(index, _)| *index);

        let mut blocks = Vec::with_capacity(indexed.len());
        for (index, path) in indexed {
            let parsed = fs::read(&path)
                .map_err(ChainError::from)
                .and_then(|bytes| serde_json::from_slice::<Block>(&bytes).map_err(ChainError::from));
            match parsed {
                Ok(block) => blocks.push(block),
                Err(e) => {
                    warn!(index, "Unreadable block document, ignoring it and later blocks: {}", e);
                    break;
                }
            }
        }
        Ok(blocks)
    }

    fn clear_blocks(&self) -> Result<(), ChainError> {
        for entry in fs::read_dir(self.root.join(BLOCKS_DIR))? {
            let path = entry?.path();
            if block_file_index(&path).is_some() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }

    fn save_tokens(&self, tokens: &[CreditToken]) -> Result<(), ChainError> {
        #[derive(Serialize)]
        struct SnapshotRef<'a> {
            tokens: &'a [CreditToken],
        }
        self.write_document(&self.root.join(LEDGER_FILE), &SnapshotRef { tokens })
    }

    fn load_tokens(&self) -> Result<Vec<CreditToken>, ChainError> {
        let path = self.root.join(LEDGER_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let snapshot: LedgerSnapshot = serde_json::from_slice(&fs::read(path)?)?;
        Ok(snapshot.tokens)
    }

    fn backup_tokens(&self) -> Result<Option<String>, ChainError> {
        let path = self.root.join(LEDGER_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%3f");
        let backup = self.root.join(format!("credit-ledger.backup-{}.json", stamp));
        fs::copy(&path, &backup)?;
        info!(path = %backup.display(), "Backed up credit ledger");
        Ok(Some(backup.to_string_lossy().into_owned()))
    }

    fn append_audit(&self, transaction: &BankTransaction) -> Result<(), ChainError> {
        let mut line = serde_json::to_string(transaction)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join(AUDIT_FILE))?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    fn load_audit(&self) -> Result<Vec<BankTransaction>, ChainError> {
        let path = self.root.join(AUDIT_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        fs::read_to_string(path)?
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(ChainError::from))
            .collect()
    }

    fn save_peers(&self, peers: &[String]) -> Result<(), ChainError> {
        self.write_document(&self.root.join(PEERS_FILE), peers)
    }

    fn load_peers(&self) -> Result<Vec<String>, ChainError> {
        let path = self.root.join(PEERS_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_slice(&fs::read(path)?)?)
    }
}

// ----------------------------------------------------------------------
// SQLite
// ----------------------------------------------------------------------

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &str) -> Result<Self, ChainError> {
        let conn = Connection::open(path)
            .map_err(|e| ChainError::PersistenceError(format!("Failed to open database: {}", e)))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS blocks (
                block_index INTEGER PRIMARY KEY,
                hash TEXT NOT NULL,
                document TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| ChainError::PersistenceError(format!("Failed to create blocks table: {}", e)))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS documents (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| ChainError::PersistenceError(format!("Failed to create documents table: {}", e)))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS audit_log (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                record TEXT NOT NULL
            )",
            [],
        )
        .map_err(|e| ChainError::PersistenceError(format!("Failed to create audit_log table: {}", e)))?;

        Ok(Database { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, ChainError> {
        self.conn
            .lock()
            .map_err(|_| ChainError::PersistenceError("Mutex poisoned".to_string()))
    }

    fn put_document(&self, key: &str, value: &str) -> Result<(), ChainError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO documents (key, value) VALUES (?1, ?2)",
            params![key, value],
        )
        .map_err(|e| ChainError::PersistenceError(format!("Failed to save {}: {}", key, e)))?;
        Ok(())
    }

    fn get_document(&self, key: &str) -> Result<Option<String>, ChainError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT value FROM documents WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| ChainError::PersistenceError(format!("Failed to load {}: {}", key, e)))
    }
}

impl Persistence for Database {
    fn save_block(&self, block: &Block) -> Result<(), ChainError> {
        let document = serde_json::to_string(block)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO blocks (block_index, hash, document) VALUES (?1, ?2, ?3)",
            params![block.index as i64, block.hash, document],
        )
        .map_err(|e| ChainError::PersistenceError(format!("Failed to save block: {}", e)))?;
        Ok(())
    }

    fn load_blocks(&self) -> Result<Vec<Block>, ChainError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT document FROM blocks ORDER BY block_index ASC")
            .map_err(|e| ChainError::PersistenceError(format!("Failed to prepare query: {}", e)))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| ChainError::PersistenceError(format!("Failed to query blocks: {}", e)))?;

        let mut blocks = Vec::new();
        for row in rows {
            let document = row.map_err(|e| ChainError::PersistenceError(format!("Failed to read row: {}", e)))?;
            blocks.push(serde_json::from_str(&document)?);
        }
        Ok(blocks)
    }

    fn clear_blocks(&self) -> Result<(), ChainError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM blocks", [])
            .map_err(|e| ChainError::PersistenceError(format!("Failed to clear blocks: {}", e)))?;
        Ok(())
    }

    fn save_tokens(&self, tokens: &[CreditToken]) -> Result<(), ChainError> {
        let document = serde_json::to_string(&LedgerSnapshot {
            tokens: tokens.to_vec(),
        })?;
        self.put_document("credit_ledger", &document)
    }

    fn load_tokens(&self) -> Result<Vec<CreditToken>, ChainError> {
        match self.get_document("credit_ledger")? {
            Some(document) => Ok(serde_json::from_str::<LedgerSnapshot>(&document)?.tokens),
            None => Ok(Vec::new()),
        }
    }

    fn backup_tokens(&self) -> Result<Option<String>, ChainError> {
        let Some(document) = self.get_document("credit_ledger")? else {
            return Ok(None);
        };
        let key = format!("credit_ledger_backup_{}", chrono::Utc::now().timestamp_millis());
        self.put_document(&key, &document)?;
        Ok(Some(key))
    }

    fn append_audit(&self, transaction: &BankTransaction) -> Result<(), ChainError> {
        let record = serde_json::to_string(transaction)?;
        let conn = self.lock()?;
        conn.execute("INSERT INTO audit_log (record) VALUES (?1)", params![record])
            .map_err(|e| ChainError::PersistenceError(format!("Failed to append audit record: {}", e)))?;
        Ok(())
    }

    fn load_audit(&self) -> Result<Vec<BankTransaction>, ChainError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT record FROM audit_log ORDER BY seq ASC")
            .map_err(|e| ChainError::PersistenceError(format!("Failed to prepare query: {}", e)))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| ChainError::PersistenceError(format!("Failed to query audit log: {}", e)))?;

        let mut records = Vec::new();
        for row in rows {
            let record = row.map_err(|e| ChainError::PersistenceError(format!("Failed to read row: {}", e)))?;
            records.push(serde_json::from_str(&record)?);
        }
        Ok(records)
    }

    fn save_peers(&self, peers: &[String]) -> Result<(), ChainError> {
        self.put_document("peers", &serde_json::to_string(peers)?)
    }

    fn load_peers(&self) -> Result<Vec<String>, ChainError> {
        match self.get_document("peers")? {
            Some(document) => Ok(serde_json::from_str(&document)?),
            None => Ok(Vec::new()),
        }
    }
}

// ----------------------------------------------------------------------
// In memory
// ----------------------------------------------------------------------

/// Simple in-memory persistence implementation useful for tests and ephemeral runs.
#[derive(Clone, Default)]
pub struct InMemoryPersistence {
    blocks: Arc<Mutex<Vec<Block>>>,
    tokens: Arc<Mutex<Option<Vec<CreditToken>>>>,
    backups: Arc<Mutex<Vec<Vec<CreditToken>>>>,
    audit: Arc<Mutex<Vec<BankTransaction>>>,
    peers: Arc<Mutex<Vec<String>>>,
}

fn poisoned<T>(_: T) -> ChainError {
    ChainError::PersistenceError("Mutex poisoned".to_string())
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of token snapshots set aside by `backup_tokens`.
    pub fn backup_count(&self) -> usize {
        self.backups.lock().map(|b| b.len()).unwrap_or(0)
    }
}

impl Persistence for InMemoryPersistence {
    fn save_block(&self, block: &Block) -> Result<(), ChainError> {
        let mut blocks = self.blocks.lock().map_err(poisoned)?;
        blocks.retain(|b| b.index != block.index);
        blocks.push(block.clone());
        blocks.sort_by_key(|b| b.index);
        Ok(())
    }

    fn load_blocks(&self) -> Result<Vec<Block>, ChainError> {
        Ok(self.blocks.lock().map_err(poisoned)?.clone())
    }

    fn clear_blocks(&self) -> Result<(), ChainError> {
        self.blocks.lock().map_err(poisoned)?.clear();
        Ok(())
    }

    fn save_tokens(&self, tokens: &[CreditToken]) -> Result<(), ChainError> {
        *self.tokens.lock().map_err(poisoned)? = Some(tokens.to_vec());
        Ok(())
    }

    fn load_tokens(&self) -> Result<Vec<CreditToken>, ChainError> {
        Ok(self.tokens.lock().map_err(poisoned)?.clone().unwrap_or_default())
    }

    fn backup_tokens(&self) -> Result<Option<String>, ChainError> {
        let current = self.tokens.lock().map_err(poisoned)?.clone();
        let Some(tokens) = current else {
            return Ok(None);
        };
        let mut backups = self.backups.lock().map_err(poisoned)?;
        backups.push(tokens);
        Ok(Some(format!("memory-backup-{}", backups.len())))
    }

    fn append_audit(&self, transaction: &BankTransaction) -> Result<(), ChainError> {
        self.audit.lock().map_err(poisoned)?.push(transaction.clone());
        Ok(())
    }

    fn load_audit(&self) -> Result<Vec<BankTransaction>, ChainError> {
        Ok(self.audit.lock().map_err(poisoned)?.clone())
    }

    fn save_peers(&self, peers: &[String]) -> Result<(), ChainError> {
        *self.peers.lock().map_err(poisoned)? = peers.to_vec();
        Ok(())
    }

    fn load_peers(&self) -> Result<Vec<String>, ChainError> {
        Ok(self.peers.lock().map_err(poisoned)?.clone())
    }
}
