use crate::engine::{EngineError, EngineHandle};
use examguard_core::{VerifyError, VerifyReport};
use zbus::interface;

/// D-Bus interface for the exam proctoring daemon.
///
/// Bus name: org.examguard.Proctor1
/// Object path: /org/examguard/Proctor1
///
/// Media and frames are base64 strings (a `data:` URI prefix is accepted).
pub struct ProctorService {
    pub engine: EngineHandle,
}

#[interface(name = "org.examguard.Proctor1")]
impl ProctorService {
    /// Add face samples for a user from a photo or a short video.
    /// Returns whether a model was trained and the user's sample count.
    async fn enroll(&self, user: &str, media: &str) -> zbus::fdo::Result<(bool, u32)> {
        tracing::info!(user, bytes = media.len(), "enroll requested");
        let outcome = self
            .engine
            .enroll(user.to_string(), media.to_string())
            .await
            .map_err(to_fdo)?;
        let count = u32::try_from(outcome.sample_count).unwrap_or(u32::MAX);
        Ok((outcome.accepted, count))
    }

    /// Retrain the classifier from every stored sample.
    async fn train(&self) -> zbus::fdo::Result<bool> {
        tracing::info!("train requested");
        self.engine.train().await.map_err(to_fdo)
    }

    /// Check one webcam frame against the expected user. Returns JSON.
    async fn verify(&self, user: &str, frame: &str) -> zbus::fdo::Result<String> {
        tracing::debug!(user, "verify requested");
        let result = self
            .engine
            .verify(user.to_string(), frame.to_string())
            .await
            .map_err(to_fdo)?;
        Ok(verify_json(result))
    }

    /// Name the person in a frame. Returns JSON.
    async fn identify(&self, frame: &str) -> zbus::fdo::Result<String> {
        tracing::debug!("identify requested");
        let report = self.engine.identify(frame.to_string()).await.map_err(to_fdo)?;
        serde_json::to_string(&report).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status().await.map_err(to_fdo)?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "engine": status,
        })
        .to_string())
    }
}

fn to_fdo(e: EngineError) -> zbus::fdo::Error {
    tracing::error!(error = %e, "engine call failed");
    zbus::fdo::Error::Failed(e.to_string())
}

/// Verification report, or `{"error": ...}` when the frame could not be judged.
fn verify_json(result: Result<VerifyReport, VerifyError>) -> String {
    let value = match result {
        Ok(report) => serde_json::to_value(&report)
            .unwrap_or_else(|e| serde_json::json!({ "error": e.to_string() })),
        Err(e) => {
            tracing::debug!(error = %e, "verify rejected");
            serde_json::json!({ "error": e.to_string() })
        }
    };
    value.to_string()
}
