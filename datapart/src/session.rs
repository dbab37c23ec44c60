//! Durable record of the progress of each multipart upload.
//!
//! A session is written when the backend issues an upload ID, rewritten in full every time a part
//! is acknowledged by object storage, and removed once the upload is finalized.  This is what
//! makes an interrupted upload resumable: on restart, every part in the ledger is skipped.
use crate::api::CompletedPart;
use crate::Result;
use dyn_clone::DynClone;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use snafu::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// All session keys share this prefix, followed by the object name verbatim.
const SESSION_KEY_PREFIX: &str = "multipart-upload-";

/// How much of the encoded session key goes into a session file name.  The rest of the name is a
/// 64 character digest, keeping the whole name well under the usual 255 byte limit.
const READABLE_FILE_NAME_LEN: usize = 96;

/// The key under which the session for `object_name` is stored
pub fn session_key(object_name: &str) -> String {
    format!("{SESSION_KEY_PREFIX}{object_name}")
}

/// Proof that object storage durably received one part.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartRecord {
    /// Integrity token returned by object storage for this part, required verbatim when the
    /// upload is completed
    pub etag: String,

    /// Length of the part in bytes
    pub size: u64,
}

/// One resumable upload attempt of one file to one object name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    pub upload_id: String,
    pub object_name: String,

    /// Acknowledged parts keyed by 1-based part number.
    ///
    /// This is a sorted map so iterating it yields parts in the ascending order that completing
    /// the upload requires.
    pub parts: BTreeMap<u32, PartRecord>,

    pub file_size: u64,
    pub file_name: String,

    /// The part size the file was partitioned with.
    ///
    /// Records written before this field existed don't have it, in which case the session is
    /// assumed to use whatever part size the resuming upload uses.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl UploadSession {
    pub fn new(
        upload_id: impl Into<String>,
        object_name: impl Into<String>,
        file_size: u64,
        file_name: impl Into<String>,
        chunk_size: u64,
    ) -> Self {
        Self {
            upload_id: upload_id.into(),
            object_name: object_name.into(),
            parts: BTreeMap::new(),
            file_size,
            file_name: file_name.into(),
            chunk_size: Some(chunk_size),
            updated_at: None,
        }
    }

    /// Whether this session still describes the file identified by `file_size` and `file_name`,
    /// partitioned into parts of `chunk_size` bytes.
    ///
    /// A session that doesn't match must be discarded; its recorded parts are byte ranges of some
    /// other file.
    pub fn matches(&self, file_size: u64, file_name: &str, chunk_size: u64) -> bool {
        self.file_size == file_size
            && self.file_name == file_name
            && self.chunk_size.map_or(true, |size| size == chunk_size)
    }

    pub fn is_recorded(&self, part_number: u32) -> bool {
        self.parts.contains_key(&part_number)
    }

    pub fn record_part(&mut self, part_number: u32, etag: impl Into<String>, size: u64) {
        self.parts.insert(
            part_number,
            PartRecord {
                etag: etag.into(),
                size,
            },
        );
    }

    /// Total size of every acknowledged part
    pub fn recorded_bytes(&self) -> u64 {
        self.parts.values().map(|part| part.size).sum()
    }

    /// The part list for completing the upload, ascending by part number
    pub fn completed_parts(&self) -> Vec<CompletedPart> {
        self.parts
            .iter()
            .map(|(part_number, part)| CompletedPart {
                etag: part.etag.clone(),
                part_number: *part_number,
            })
            .collect()
    }
}

/// Durable key-value persistence for [`UploadSession`] records.
///
/// There is no locking.  The upload coordinator is the only writer, and running two uploads to
/// the same object name at the same time is not supported.
#[async_trait::async_trait]
pub trait SessionStore: DynClone + std::fmt::Debug + Sync + Send + 'static {
    /// Load the session for `object_name`, if there is one.
    ///
    /// Records that can't be parsed are treated as absent.
    async fn load(&self, object_name: &str) -> Result<Option<UploadSession>>;

    /// Write the session, replacing whatever was there before
    async fn save(&self, session: &UploadSession) -> Result<()>;

    /// Remove the session for `object_name`.  Removing a session that doesn't exist is not an
    /// error.
    async fn clear(&self, object_name: &str) -> Result<()>;

    /// All persisted sessions, in no particular order
    async fn list(&self) -> Result<Vec<UploadSession>>;
}

dyn_clone::clone_trait_object!(SessionStore);

/// Stores each session as a JSON file in a directory.
///
/// Writes go to a temporary file which is then renamed over the old record, so a crash in the
/// middle of a save leaves either the old or the new ledger, never a truncated one.
#[derive(Clone, Debug)]
pub struct FileSessionStore {
    dir: Arc<PathBuf>,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Arc::new(dir.into()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, object_name: &str) -> PathBuf {
        // Object names can contain `/` and all manner of other characters that aren't welcome in
        // file names, so the key is percent-encoded.  That can blow up a name past the file name
        // length limit (a CJK character encodes to 9 bytes), so only a prefix of the encoded key
        // is kept for readability and the digest of the whole key identifies the record.
        let key = session_key(object_name);
        let encoded: String = url::form_urlencoded::byte_serialize(key.as_bytes()).collect();
        let digest = Sha256::digest(key.as_bytes());

        // The encoding is pure ASCII, so any index is a char boundary
        let readable = &encoded[..encoded.len().min(READABLE_FILE_NAME_LEN)];

        self.dir.join(format!("{readable}-{digest:x}.json"))
    }

    async fn read_session(path: &Path) -> Result<Option<UploadSession>> {
        let json = match tokio::fs::read(path).await {
            Ok(json) => json,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|_| crate::error::SessionIoSnafu {
                    path: path.to_path_buf(),
                })
            }
        };

        match serde_json::from_slice::<UploadSession>(&json) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                warn!(path = %path.display(), ?e, "Ignoring unreadable upload session record");
                Ok(None)
            }
        }
    }
}

#[async_trait::async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self, object_name: &str) -> Result<Option<UploadSession>> {
        let session = Self::read_session(&self.path_for(object_name)).await?;

        Ok(session.filter(|session| session.object_name == object_name))
    }

    async fn save(&self, session: &UploadSession) -> Result<()> {
        let path = self.path_for(&session.object_name);

        let mut session = session.clone();
        session.updated_at = Some(chrono::Utc::now());
        let json = serde_json::to_vec_pretty(&session).with_context(|_| {
            crate::error::SessionSerializeSnafu {
                object_name: session.object_name.clone(),
            }
        })?;

        tokio::fs::create_dir_all(self.dir.as_path())
            .await
            .with_context(|_| crate::error::SessionIoSnafu {
                path: self.dir.to_path_buf(),
            })?;

        let temp_path = path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, json)
            .await
            .with_context(|_| crate::error::SessionIoSnafu {
                path: temp_path.clone(),
            })?;
        tokio::fs::rename(&temp_path, &path)
            .await
            .with_context(|_| crate::error::SessionIoSnafu { path: path.clone() })?;

        debug!(path = %path.display(), parts = session.parts.len(), "Saved upload session");

        Ok(())
    }

    async fn clear(&self, object_name: &str) -> Result<()> {
        let path = self.path_for(object_name);

        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|_| crate::error::SessionIoSnafu { path }),
        }
    }

    async fn list(&self) -> Result<Vec<UploadSession>> {
        let mut entries = match tokio::fs::read_dir(self.dir.as_path()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => {
                return Err(e).with_context(|_| crate::error::SessionIoSnafu {
                    path: self.dir.to_path_buf(),
                })
            }
        };

        let mut sessions = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|_| crate::error::SessionIoSnafu {
                path: self.dir.to_path_buf(),
            })?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }

            if let Some(session) = Self::read_session(&path).await? {
                sessions.push(session);
            }
        }

        Ok(sessions)
    }
}

/// Keeps sessions in process memory.  Clones share the same map.
#[derive(Clone, Debug, Default)]
pub struct MemorySessionStore {
    sessions: Arc<Mutex<HashMap<String, UploadSession>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, UploadSession>> {
        // A panic while holding this lock can't leave the map half-updated, so a poisoned lock is
        // still safe to use
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait::async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, object_name: &str) -> Result<Option<UploadSession>> {
        Ok(self.lock().get(&session_key(object_name)).cloned())
    }

    async fn save(&self, session: &UploadSession) -> Result<()> {
        self.lock()
            .insert(session_key(&session.object_name), session.clone());

        Ok(())
    }

    async fn clear(&self, object_name: &str) -> Result<()> {
        self.lock().remove(&session_key(object_name));

        Ok(())
    }

    async fn list(&self) -> Result<Vec<UploadSession>> {
        Ok(self.lock().values().cloned().collect())
    }
}
