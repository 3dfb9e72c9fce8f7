//! Durable storage of wallet sessions.
//!
//! A session is a wallet initialized with a descriptor on a network. Its directory holds the log
//! of the updates applied to its state, encrypted with a key derived from the descriptor, and the
//! external indexes given out by [`crate::Wallet::get_new_address()`].

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use bitcoin::hashes::{sha256t_hash_newtype, Hash};

use crate::wallet::AddressReservation;
use crate::{Error, Update, WalletDescriptor};

const UPDATES_FILE: &str = "updates.log";
const RESERVED_FILE: &str = "reserved.json";

/// Bytes of the little endian length preceding each record of the log
const LEN_PREFIX: usize = 4;

#[derive(thiserror::Error, Debug)]
pub enum PersistError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Cannot read record {index} of {path:?}: {reason}")]
    Corrupted {
        path: PathBuf,
        index: usize,
        reason: String,
    },

    #[error("{0}")]
    Other(String),
}

/// Stores the updates of a wallet session, so that its state is rebuilt without a full scan
pub trait Persister {
    /// The updates pushed so far, oldest first
    fn updates(&self) -> Result<Vec<Update>, PersistError>;

    /// Store an update after the previous ones
    ///
    /// A tip-only update following another tip-only update may replace it, the replacement
    /// applies on the same state and brings it where the two updates would.
    fn push(&self, update: Update) -> Result<(), PersistError>;
}

/// Stores nothing, used by wallets with [`crate::StorageConfig::Memory`]
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPersist;

impl Persister for NoPersist {
    fn updates(&self) -> Result<Vec<Update>, PersistError> {
        Ok(vec![])
    }

    fn push(&self, _update: Update) -> Result<(), PersistError> {
        Ok(())
    }
}

sha256t_hash_newtype! {
    /// The tag of the hash
    pub struct SessionDirTag = hash_str("Karavan-Session-Dir/1.0");

    /// A tagged hash of the session id, naming its directory without revealing the descriptor
    #[hash_newtype(forward)]
    pub struct SessionDirHash(_);
}

/// The directory of a session under `datadir`, created if missing
pub fn session_dir(datadir: &Path, session_id: &str) -> Result<PathBuf, Error> {
    let path = datadir
        .join("sessions")
        .join(SessionDirHash::hash(session_id.as_bytes()).to_string());
    if path.is_file() {
        return Err(Error::Generic(format!("{path:?} is a file")));
    }
    fs::create_dir_all(&path)?;
    Ok(path)
}

fn to_other<D: std::fmt::Display>(d: D) -> PersistError {
    PersistError::Other(d.to_string())
}

/// Split the log in its complete records, returning them with the length they cover
fn split_records(bytes: &[u8]) -> (Vec<&[u8]>, usize) {
    let mut records = vec![];
    let mut pos = 0;
    while bytes.len() - pos >= LEN_PREFIX {
        let mut prefix = [0u8; LEN_PREFIX];
        prefix.copy_from_slice(&bytes[pos..pos + LEN_PREFIX]);
        let end = pos + LEN_PREFIX + u32::from_le_bytes(prefix) as usize;
        if end > bytes.len() {
            break;
        }
        records.push(&bytes[pos + LEN_PREFIX..end]);
        pos = end;
    }
    (records, pos)
}

#[derive(Debug)]
struct UpdateLog {
    file: File,

    /// Bytes of complete records
    len: u64,

    /// Offset and content of the last record
    last: Option<(u64, Update)>,
}

/// A persister appending encrypted updates to a log file in the session directory
///
/// Each record is the ciphertext length as 4 little endian bytes followed by the ciphertext. The
/// key is derived from the descriptor. A record cut short by a crash is dropped when the log is
/// opened.
#[derive(Debug)]
pub struct FsPersister {
    path: PathBuf,
    desc: WalletDescriptor,
    log: Mutex<UpdateLog>,
}

impl FsPersister {
    /// Open the update log in the given session directory, see [`session_dir()`]
    pub fn new(dir: &Path, desc: &WalletDescriptor) -> Result<Arc<Self>, Error> {
        let path = dir.join(UPDATES_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let mut bytes = vec![];
        file.read_to_end(&mut bytes)?;

        let (records, complete) = split_records(&bytes);
        if complete < bytes.len() {
            log::warn!(
                "dropping {} bytes of an incomplete record in {path:?}",
                bytes.len() - complete
            );
            file.set_len(complete as u64)?;
        }
        let last = match records.last() {
            Some(record) => {
                let offset = (complete - LEN_PREFIX - record.len()) as u64;
                let update = decrypt(&path, desc, records.len() - 1, record)?;
                Some((offset, update))
            }
            None => None,
        };
        log::debug!("update log {path:?} has {} records", records.len());

        Ok(Arc::new(Self {
            log: Mutex::new(UpdateLog {
                file,
                len: complete as u64,
                last,
            }),
            path,
            desc: desc.clone(),
        }))
    }

    fn lock(&self) -> Result<MutexGuard<'_, UpdateLog>, PersistError> {
        self.log.lock().map_err(to_other)
    }
}

fn decrypt(
    path: &Path,
    desc: &WalletDescriptor,
    index: usize,
    record: &[u8],
) -> Result<Update, PersistError> {
    Update::deserialize_decrypted(record, desc).map_err(|e| PersistError::Corrupted {
        path: path.to_path_buf(),
        index,
        reason: e.to_string(),
    })
}

impl Persister for FsPersister {
    fn updates(&self) -> Result<Vec<Update>, PersistError> {
        let log = self.lock()?;
        let mut bytes = fs::read(&self.path)?;
        bytes.truncate(log.len as usize);
        let (records, _) = split_records(&bytes);
        records
            .iter()
            .enumerate()
            .map(|(i, record)| decrypt(&self.path, &self.desc, i, record))
            .collect()
    }

    fn push(&self, update: Update) -> Result<(), PersistError> {
        let mut log = self.lock()?;
        let (offset, update) = match log.last.take() {
            Some((offset, prev)) if prev.only_tip() && update.only_tip() => {
                let mut update = update;
                update.wallet_status = prev.wallet_status;
                update.timestamps = [prev.timestamps, update.timestamps].concat();
                (offset, update)
            }
            last => {
                log.last = last;
                (log.len, update)
            }
        };

        let ciphertext = update.serialize_encrypted(&self.desc).map_err(to_other)?;
        let len = u32::try_from(ciphertext.len()).map_err(to_other)?;
        let mut record = Vec::with_capacity(LEN_PREFIX + ciphertext.len());
        record.extend_from_slice(&len.to_le_bytes());
        record.extend_from_slice(&ciphertext);

        // a crash here loses at most the replaced tip-only update
        log.file.set_len(offset)?;
        log.file.seek(SeekFrom::Start(offset))?;
        log.file.write_all(&record)?;
        log.file.sync_data()?;

        log.len = offset + record.len() as u64;
        log.last = Some((offset, update));
        Ok(())
    }
}

/// Address reservations stored in the session directories under `datadir`
///
/// An address given out by a process is not given out again by the next one using the same
/// data dir.
#[derive(Debug)]
pub struct FsReservation {
    datadir: PathBuf,
    lock: Mutex<()>,
}

impl FsReservation {
    pub fn new<P: AsRef<Path>>(datadir: P) -> Self {
        Self {
            datadir: datadir.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    fn path(&self, wallet_id: &str) -> Result<PathBuf, Error> {
        Ok(session_dir(&self.datadir, wallet_id)?.join(RESERVED_FILE))
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>, Error> {
        self.lock
            .lock()
            .map_err(|_| Error::Generic("reservation lock poisoned".into()))
    }
}

fn read_reserved(path: &Path) -> Result<BTreeSet<u32>, Error> {
    match fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(BTreeSet::new()),
        Err(e) => Err(e.into()),
    }
}

impl AddressReservation for FsReservation {
    fn is_reserved(&self, wallet_id: &str, index: u32) -> Result<bool, Error> {
        let _guard = self.lock()?;
        Ok(read_reserved(&self.path(wallet_id)?)?.contains(&index))
    }

    fn reserve(&self, wallet_id: &str, index: u32) -> Result<(), Error> {
        let _guard = self.lock()?;
        let path = self.path(wallet_id)?;
        let mut reserved = read_reserved(&path)?;
        if reserved.insert(index) {
            let tmp = path.with_extension("json.tmp");
            fs::write(&tmp, serde_json::to_vec(&reserved)?)?;
            fs::rename(&tmp, &path)?;
        }
        Ok(())
    }
}
