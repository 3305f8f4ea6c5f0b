use std::collections::HashSet;
use std::io::{Read as IoRead, Write as IoWrite};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, SessionError};

/// Depth of the per-PTY read and write channels.
const CHANNEL_DEPTH: usize = 256;

type Slots = Arc<Mutex<HashSet<Uuid>>>;

fn lock_slots(slots: &Slots) -> MutexGuard<'_, HashSet<Uuid>> {
    slots.lock().unwrap_or_else(|e| {
        warn!("PtyPool lock was poisoned, recovering");
        e.into_inner()
    })
}

// ---------------------------------------------------------------------------
// PtySpawn
// ---------------------------------------------------------------------------

/// Everything needed to start one process inside a PTY.
#[derive(Debug, Clone)]
pub struct PtySpawn {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    pub cols: u16,
    pub rows: u16,
}

impl PtySpawn {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            cols: 80,
            rows: 24,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }
}

// ---------------------------------------------------------------------------
// PtyHandle
// ---------------------------------------------------------------------------

/// A handle to a single PTY process with async read/write channels.
///
/// Reads happen on a dedicated OS thread so a blocked PTY never stalls the
/// async runtime. The read channel closes when the child's side of the PTY
/// reaches EOF, which is how process exit is observed.
pub struct PtyHandle {
    pub id: Uuid,
    pub reader: flume::Receiver<Vec<u8>>,
    pub writer: flume::Sender<Vec<u8>>,
    child: Arc<Mutex<Box<dyn portable_pty::Child + Send + Sync>>>,
    master: Arc<Mutex<Box<dyn portable_pty::MasterPty + Send>>>,
    slots: Slots,
}

impl PtyHandle {
    fn child(&self) -> MutexGuard<'_, Box<dyn portable_pty::Child + Send + Sync>> {
        self.child.lock().unwrap_or_else(|e| {
            warn!("child lock was poisoned, recovering");
            e.into_inner()
        })
    }

    /// Check whether the underlying child process is still running.
    pub fn is_alive(&self) -> bool {
        match self.child().try_wait() {
            Ok(Some(_status)) => false,
            Ok(None) => true,
            Err(_) => false,
        }
    }

    /// Kill the child process.
    pub fn kill(&self) -> Result<()> {
        let mut child = self.child();
        if let Ok(Some(_)) = child.try_wait() {
            return Ok(());
        }
        child
            .kill()
            .map_err(|e| SessionError::Internal(e.to_string()))?;
        Ok(())
    }

    /// Send bytes to the PTY stdin, waiting for room in the write queue.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        if !self.is_alive() {
            return Err(SessionError::SessionDead);
        }
        self.writer
            .send_async(data.to_vec())
            .await
            .map_err(|_| SessionError::SessionDead)
    }

    /// Send a string followed by a newline.
    pub async fn send_line(&self, line: &str) -> Result<()> {
        let mut data = line.as_bytes().to_vec();
        data.push(b'\n');
        self.send(&data).await
    }

    /// Resize the PTY to the given dimensions.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let master = self.master.lock().unwrap_or_else(|e| {
            warn!("master lock was poisoned, recovering");
            e.into_inner()
        });
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::Internal(format!("resize failed: {e}")))?;
        debug!(cols, rows, "PTY resized");
        Ok(())
    }
}

impl Drop for PtyHandle {
    fn drop(&mut self) {
        let _ = self.kill();
        lock_slots(&self.slots).remove(&self.id);
        debug!(handle_id = %self.id, "released PTY handle from pool");
    }
}

impl std::fmt::Debug for PtyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyHandle")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// PtyPool
// ---------------------------------------------------------------------------

/// Caps the number of concurrently open PTYs. Slots are released when the
/// corresponding [`PtyHandle`] is dropped.
#[derive(Clone)]
pub struct PtyPool {
    max_ptys: usize,
    slots: Slots,
}

impl PtyPool {
    /// Create a new pool with the given maximum number of concurrent PTYs.
    pub fn new(max_ptys: usize) -> Self {
        info!(max_ptys, "creating PtyPool");
        Self {
            max_ptys,
            slots: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Number of currently open PTYs tracked by this pool.
    pub fn active_count(&self) -> usize {
        lock_slots(&self.slots).len()
    }

    /// Maximum capacity of the pool.
    pub fn max_ptys(&self) -> usize {
        self.max_ptys
    }

    /// Spawn a new process inside a PTY.
    pub fn spawn(&self, spec: &PtySpawn) -> Result<PtyHandle> {
        let handle_id = Uuid::new_v4();

        // Reserve the slot up front so concurrent spawns cannot overshoot.
        {
            let mut slots = lock_slots(&self.slots);
            if slots.len() >= self.max_ptys {
                return Err(SessionError::AtCapacity { max: self.max_ptys });
            }
            slots.insert(handle_id);
        }

        match self.open(handle_id, spec) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                lock_slots(&self.slots).remove(&handle_id);
                Err(e)
            }
        }
    }

    fn open(&self, handle_id: Uuid, spec: &PtySpawn) -> Result<PtyHandle> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: spec.rows,
                cols: spec.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let mut command = CommandBuilder::new(&spec.program);
        for arg in &spec.args {
            command.arg(arg);
        }
        for (k, v) in &spec.env {
            command.env(k, v);
        }
        if let Some(dir) = &spec.cwd {
            command.cwd(dir);
        }

        let child = pair
            .slave
            .spawn_command(command)
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        // The child holds its own copy of the slave; dropping ours lets the
        // reader see EOF once the child exits.
        drop(pair.slave);

        debug!(program = %spec.program, args = ?spec.args, cwd = ?spec.cwd, "spawned PTY process");

        // -- stdout reader thread --
        let (read_tx, read_rx) = flume::bounded::<Vec<u8>>(CHANNEL_DEPTH);
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if read_tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        // EIO is expected on Linux once the child exits.
                        debug!("pty reader finished: {e}");
                        break;
                    }
                }
            }
        });

        // -- stdin writer thread --
        let (write_tx, write_rx) = flume::bounded::<Vec<u8>>(CHANNEL_DEPTH);
        let mut writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
        std::thread::spawn(move || {
            while let Ok(data) = write_rx.recv() {
                if writer.write_all(&data).is_err() {
                    break;
                }
                let _ = writer.flush();
            }
        });

        Ok(PtyHandle {
            id: handle_id,
            reader: read_rx,
            writer: write_tx,
            child: Arc::new(Mutex::new(child)),
            master: Arc::new(Mutex::new(pair.master)),
            slots: self.slots.clone(),
        })
    }
}

impl std::fmt::Debug for PtyPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyPool")
            .field("max_ptys", &self.max_ptys)
            .field("active_count", &self.active_count())
            .finish()
    }
}
