use examguard_core::{
    EngineStatus, EnrollOutcome, IdentifyReport, Proctor, ProctorConfig, ProctorError,
    VerifyError, VerifyReport,
};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("engine startup failed: {0}")]
    Startup(#[from] ProctorError),
    #[error("engine task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),
}

/// Clone-safe handle to the shared engine.
///
/// Engine calls block on disk and CPU work, so each runs on tokio's
/// blocking pool; verification requests proceed in parallel.
#[derive(Clone)]
pub struct EngineHandle {
    proctor: Arc<Proctor>,
}

impl EngineHandle {
    pub fn new(proctor: Proctor) -> Self {
        Self {
            proctor: Arc::new(proctor),
        }
    }

    async fn run<T, F>(&self, f: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&Proctor) -> T + Send + 'static,
    {
        let proctor = Arc::clone(&self.proctor);
        Ok(tokio::task::spawn_blocking(move || f(&proctor)).await?)
    }

    pub async fn enroll(&self, user: String, media: String) -> Result<EnrollOutcome, EngineError> {
        self.run(move |p| p.enroll(&user, &media)).await
    }

    pub async fn train(&self) -> Result<bool, EngineError> {
        self.run(|p| p.train()).await
    }

    pub async fn verify(
        &self,
        user: String,
        frame: String,
    ) -> Result<Result<VerifyReport, VerifyError>, EngineError> {
        self.run(move |p| p.verify(&user, &frame)).await
    }

    pub async fn identify(&self, frame: String) -> Result<IdentifyReport, EngineError> {
        self.run(move |p| p.identify(&frame)).await
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.run(|p| p.status()).await
    }
}

/// Build the engine synchronously so startup fails fast when the detector
/// model or config is unusable.
pub fn spawn_engine(config: ProctorConfig) -> Result<EngineHandle, EngineError> {
    tracing::info!(
        dataset = %config.dataset_dir.display(),
        model = %config.classifier_model_path.display(),
        detector = %config.detector_model_path.display(),
        "starting engine"
    );
    let proctor = Proctor::from_config(config)?;
    let status = proctor.status();
    tracing::info!(
        model_loaded = status.model_loaded,
        enrolled_users = status.enrolled_users,
        embedder = status.embedder_available,
        "engine ready"
    );

    Ok(EngineHandle::new(proctor))
}
