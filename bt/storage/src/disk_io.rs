//! Runs storage jobs on blocking threads.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bytes::{Bytes, BytesMut};
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::task;

use bt_base::{Bitfield, FileIndex, PieceHash, PieceHashes, PieceIndex};

use crate::check::{self, CheckOutcome, CheckStatus, ResumeData};
use crate::error::{Error, Operation, StorageError, TransferError};
use crate::pool::FilePool;
use crate::sync::{MutexExt, RwLockExt};
use crate::{DeleteMode, MoveFlags, MoveStatus, Priority, Settings, Storage, StorageParams};

/// Dispatches jobs to torrent storages.
///
/// At most `aio_threads` jobs run at the same time.  Jobs on the same storage may interleave,
/// except that jobs which change where the files live wait for the in-flight transfers.
#[derive(Debug)]
pub struct DiskIo {
    settings: RwLock<Arc<Settings>>,
    pool: Arc<FilePool>,
    concurrency: Semaphore,
    // Number of busy permits to forget on release, after `aio_threads` shrinks.
    excess: Mutex<usize>,
    aborted: Arc<AtomicBool>,
}

/// A job slot.  When dropped, it goes back to the semaphore unless it is in excess.
struct Permit<'a> {
    permit: Option<SemaphorePermit<'a>>,
    excess: &'a Mutex<usize>,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        let mut excess = self.excess.must_lock();
        if let Some(permit) = self.permit.take() {
            if *excess > 0 {
                *excess -= 1;
                permit.forget();
            } else {
                drop(permit);
            }
        }
    }
}

/// A shared reference to a torrent's storage.
#[derive(Clone, Debug)]
pub struct StorageHandle(Arc<RwLock<Box<dyn Storage>>>);

impl StorageHandle {
    pub fn new(storage: Box<dyn Storage>) -> Self {
        Self(Arc::new(RwLock::new(storage)))
    }

    pub fn save_path(&self) -> PathBuf {
        self.0.must_read().save_path().to_path_buf()
    }

    pub fn num_files(&self) -> usize {
        self.0.must_read().files().num_files()
    }
}

fn aborted_transfer(op: Operation) -> impl FnOnce(Error) -> TransferError {
    move |error| TransferError {
        transferred: 0,
        error: StorageError::new(error, None, op),
    }
}

fn aborted_storage(op: Operation) -> impl FnOnce(Error) -> StorageError {
    move |error| StorageError::new(error, None, op)
}

impl DiskIo {
    pub fn new(settings: Settings) -> Self {
        Self {
            pool: Arc::new(FilePool::new(settings.file_pool_size)),
            concurrency: Semaphore::new(settings.aio_threads.get()),
            settings: RwLock::new(Arc::new(settings)),
            excess: Mutex::new(0),
            aborted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.must_read().clone()
    }

    /// Replaces the settings.
    ///
    /// The backend choice applies to storages created afterwards.  When `aio_threads` shrinks,
    /// the idle permits are taken away at once, and the busy ones when their jobs finish.
    pub fn set_settings(&self, settings: Settings) {
        let mut current = self.settings.must_write();
        let (old, new) = (current.aio_threads.get(), settings.aio_threads.get());
        let mut excess = self.excess.must_lock();
        if new > old {
            let cancel = (new - old).min(*excess);
            *excess -= cancel;
            self.concurrency.add_permits(new - old - cancel);
        } else if new < old {
            let forgotten = self.concurrency.forget_permits(old - new);
            if forgotten < old - new {
                tracing::debug!(busy = old - new - forgotten, "set_settings: forget on release");
                *excess += old - new - forgotten;
            }
        }
        drop(excess);
        self.pool.resize(settings.file_pool_size);
        tracing::info!(?settings, "set_settings");
        *current = Arc::new(settings);
    }

    pub fn pool(&self) -> &Arc<FilePool> {
        &self.pool
    }

    pub fn new_torrent(&self, params: StorageParams) -> StorageHandle {
        let settings = self.settings();
        tracing::info!(
            info_hash = %params.info_hash,
            save_path = %params.save_path.display(),
            backend = ?settings.backend,
            "new_torrent",
        );
        StorageHandle::new(crate::new_storage(params, &settings, &self.pool))
    }

    /// Stops accepting jobs and signals the running piece checks to stop.
    ///
    /// Jobs that are already running finish normally.
    pub fn abort(&self) {
        if !self.aborted.swap(true, Ordering::SeqCst) {
            tracing::info!("disk io: abort");
            self.concurrency.close();
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    async fn acquire(&self) -> Result<Permit<'_>, Error> {
        let permit = self
            .concurrency
            .acquire()
            .await
            .map_err(|_| Error::Aborted)?;
        Ok(Permit {
            permit: Some(permit),
            excess: &self.excess,
        })
    }

    async fn spawn<F, T>(&self, job: F) -> Result<T, Error>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let _permit = self.acquire().await?;
        if self.is_aborted() {
            return Err(Error::Aborted);
        }
        Ok(task::spawn_blocking(job).await.unwrap())
    }

    pub async fn async_read(
        &self,
        storage: &StorageHandle,
        piece: PieceIndex,
        offset: u64,
        size: usize,
    ) -> Result<Bytes, TransferError> {
        let storage = storage.clone();
        self.spawn(move || -> Result<Bytes, TransferError> {
            let mut buffer = BytesMut::zeroed(size);
            storage
                .0
                .must_read()
                .readv(vec![&mut buffer[..]], piece, offset)?;
            Ok(buffer.freeze())
        })
        .await
        .map_err(aborted_transfer(Operation::FileRead))?
    }

    pub async fn async_write(
        &self,
        storage: &StorageHandle,
        piece: PieceIndex,
        offset: u64,
        data: Bytes,
    ) -> Result<usize, TransferError> {
        let storage = storage.clone();
        self.spawn(move || storage.0.must_read().writev(vec![&data[..]], piece, offset))
            .await
            .map_err(aborted_transfer(Operation::FileWrite))?
    }

    pub async fn async_hash(
        &self,
        storage: &StorageHandle,
        piece: PieceIndex,
    ) -> Result<PieceHash, TransferError> {
        let storage = storage.clone();
        let block_size = self.settings().hash_block_size.get();
        self.spawn(move || check::hash_piece(&**storage.0.must_read(), piece, block_size))
            .await
            .map_err(aborted_transfer(Operation::FileRead))?
    }

    /// Initializes the storage, and then validates the resume data against the files on disk.
    ///
    /// `links` defaults to the link targets that the storage was created with.
    pub async fn async_check_files(
        &self,
        storage: &StorageHandle,
        resume: ResumeData,
        links: Option<Vec<Option<PathBuf>>>,
    ) -> CheckOutcome {
        let storage = storage.clone();
        self.spawn(move || {
            let mut storage = storage.0.must_write();
            if let Err(error) = storage.initialize() {
                tracing::warn!(%error, "check_files: initialize");
                return CheckOutcome::error(CheckStatus::FatalDiskError, error);
            }
            let links = links.unwrap_or_else(|| storage.link_targets().to_vec());
            check::check_files(&**storage, &resume, &links)
        })
        .await
        .unwrap_or_else(|error| {
            CheckOutcome::error(
                CheckStatus::FatalDiskError,
                aborted_storage(Operation::FileStat)(error),
            )
        })
    }

    /// Hashes every piece and compares it against `hashes`.  It stops early on [`abort`].
    ///
    /// [`abort`]: DiskIo::abort
    pub async fn async_check_pieces(
        &self,
        storage: &StorageHandle,
        hashes: PieceHashes,
    ) -> Result<Bitfield, StorageError> {
        let storage = storage.clone();
        let block_size = self.settings().hash_block_size.get();
        let aborted = self.aborted.clone();
        self.spawn(move || {
            check::check_pieces(&**storage.0.must_read(), &hashes, block_size, &aborted)
        })
        .await
        .map_err(aborted_storage(Operation::FileRead))?
    }

    pub async fn async_rename_file(
        &self,
        storage: &StorageHandle,
        index: FileIndex,
        new_path: String,
    ) -> Result<(), StorageError> {
        let storage = storage.clone();
        self.spawn(move || storage.0.must_write().rename_file(index, &new_path))
            .await
            .map_err(aborted_storage(Operation::FileRename))?
    }

    pub async fn async_move_storage(
        &self,
        storage: &StorageHandle,
        save_path: PathBuf,
        flags: MoveFlags,
    ) -> Result<MoveStatus, StorageError> {
        let storage = storage.clone();
        self.spawn(move || storage.0.must_write().move_storage(&save_path, flags))
            .await
            .map_err(aborted_storage(Operation::FileMove))?
    }

    pub async fn async_release_files(&self, storage: &StorageHandle) -> Result<(), StorageError> {
        let storage = storage.clone();
        self.spawn(move || storage.0.must_read().release_files())
            .await
            .map_err(aborted_storage(Operation::FileWrite))?
    }

    pub async fn async_delete_files(
        &self,
        storage: &StorageHandle,
        mode: DeleteMode,
    ) -> Result<(), StorageError> {
        let storage = storage.clone();
        self.spawn(move || storage.0.must_write().delete_files(mode))
            .await
            .map_err(aborted_storage(Operation::FileRemove))?
    }

    pub async fn async_set_file_priority(
        &self,
        storage: &StorageHandle,
        index: FileIndex,
        priority: Priority,
    ) -> Result<(), Error> {
        let storage = storage.clone();
        self.spawn(move || storage.0.must_write().set_file_priority(index, priority))
            .await
    }
}
