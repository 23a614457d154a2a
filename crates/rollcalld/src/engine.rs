use crate::config::Config;
use rollcall_core::attendance::{AttendanceRecord, ResolveError, Resolver};
use rollcall_core::extractor::{ExtractError, FaceEmbedder, OnnxEmbedder};
use rollcall_core::roster::{Roster, RosterError, RosterStore, Upsert};
use rollcall_core::types::RosterEntry;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("model error: {0}")]
    Model(#[from] ExtractError),
    #[error(transparent)]
    Roster(#[from] RosterError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Result of an enrollment.
#[derive(Debug, Clone)]
pub struct EnrollResult {
    pub identity: String,
    pub upsert: Upsert,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Enroll {
        name: String,
        filename: String,
        photo: Vec<u8>,
        reply: oneshot::Sender<Result<EnrollResult, EngineError>>,
    },
    Remove {
        name: String,
        reply: oneshot::Sender<Result<bool, EngineError>>,
    },
    Resolve {
        photo: Vec<u8>,
        reply: oneshot::Sender<Result<AttendanceRecord, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    roster: watch::Receiver<Arc<Vec<RosterEntry>>>,
}

impl EngineHandle {
    /// Enroll (or re-enroll) a student from the photo bytes of `filename`.
    pub async fn enroll(
        &self,
        name: String,
        filename: String,
        photo: Vec<u8>,
    ) -> Result<EnrollResult, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.request(EngineRequest::Enroll {
            name,
            filename,
            photo,
            reply,
        })
        .await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Remove a student. Returns whether they were enrolled.
    pub async fn remove(&self, name: String) -> Result<bool, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.request(EngineRequest::Remove { name, reply }).await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Resolve a group photo against the current roster.
    pub async fn resolve(&self, photo: Vec<u8>) -> Result<AttendanceRecord, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.request(EngineRequest::Resolve { photo, reply }).await?;
        rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Latest published roster. Never waits on the engine thread.
    pub fn roster(&self) -> Arc<Vec<RosterEntry>> {
        Arc::clone(&self.roster.borrow())
    }

    async fn request(&self, req: EngineRequest) -> Result<(), EngineError> {
        self.tx.send(req).await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Load both ONNX models and the roster, then spawn the engine thread.
///
/// Fails fast at startup if the models or the roster directory are unusable.
pub fn spawn_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    let scrfd_path = config.scrfd_model_path();
    let arcface_path = config.arcface_model_path();
    let embedder = OnnxEmbedder::load(&scrfd_path, &arcface_path)?;
    tracing::info!(scrfd = %scrfd_path, arcface = %arcface_path, "face models loaded");

    let store = roster_store(config)?;
    let resolver = Resolver::new(config.tolerance).with_max_dimension(config.max_dimension);
    start(Box::new(embedder), store, resolver)
}

/// Roster store configured from `config`.
pub fn roster_store(config: &Config) -> Result<RosterStore, RosterError> {
    let mut store = RosterStore::open(&config.roster_dir)?
        .with_rewrite_on_load(config.rewrite_on_load)
        .with_max_dimensions(config.max_dimension, config.enroll_max_dimension);
    if let Some(dir) = &config.publish_dir {
        store = store.with_publish_dir(dir);
    }
    Ok(store)
}

/// Build the roster with `embedder` and hand both to a dedicated engine thread.
pub fn start(
    mut embedder: Box<dyn FaceEmbedder + Send>,
    store: RosterStore,
    resolver: Resolver,
) -> Result<EngineHandle, EngineError> {
    let mut roster = store.load_all(embedder.as_mut())?;
    let (snapshot_tx, snapshot_rx) = watch::channel(roster.snapshot());
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!(students = roster.len(), "engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Enroll {
                        name,
                        filename,
                        photo,
                        reply,
                    } => {
                        let result =
                            run_enroll(&store, &mut roster, embedder.as_mut(), &name, &filename, &photo);
                        if result.is_ok() {
                            snapshot_tx.send_replace(roster.snapshot());
                        }
                        let _ = reply.send(result);
                    }
                    EngineRequest::Remove { name, reply } => {
                        let result = store.remove(&mut roster, &name).map_err(EngineError::from);
                        if matches!(result, Ok(true)) {
                            snapshot_tx.send_replace(roster.snapshot());
                        }
                        let _ = reply.send(result);
                    }
                    EngineRequest::Resolve { photo, reply } => {
                        let snapshot = roster.snapshot();
                        let result = resolver
                            .resolve(embedder.as_mut(), &photo, &snapshot)
                            .map_err(EngineError::from);
                        let _ = reply.send(result);
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle {
        tx,
        roster: snapshot_rx,
    })
}

fn run_enroll(
    store: &RosterStore,
    roster: &mut Roster,
    embedder: &mut dyn FaceEmbedder,
    name: &str,
    filename: &str,
    photo: &[u8],
) -> Result<EnrollResult, EngineError> {
    let enrollment = store.prepare_enrollment(name, filename, photo, embedder)?;
    let identity = enrollment.identity().to_string();
    let upsert = store.commit_enrollment(roster, enrollment)?;
    Ok(EnrollResult { identity, upsert })
}
